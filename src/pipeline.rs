//! Sequencing a batch of source pages through discovery, download and muxing.
//!
//! Everything runs one step at a time: sources in order, the recordings of a source in order, the
//! streams of a recording in order. Only the outcome of each recording is carried between steps.

use std::path::PathBuf;
use tracing::{error, info, warn};
use crate::{BatchJob, LectureDlError, VideoJob};
use crate::discovery::{DiscoveredSource, Discovery};
use crate::fetch::{FailurePolicy, LectureDownloader, ProgressEvent};


/// A source or recording that could not be downloaded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobFailure {
    pub source_url: String,
    /// The recording's 1-based position on its page, or None if discovery itself failed.
    pub video: Option<u32>,
    pub stage: &'static str,
    pub message: String,
}

/// Outcome of a batch run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchSummary {
    pub sources: usize,
    pub completed: Vec<PathBuf>,
    pub failures: Vec<JobFailure>,
}

impl BatchSummary {
    pub fn is_success(&self) -> bool {
        self.failures.is_empty()
    }
}

/// The download jobs for the recordings found on one page. Whether a job's output name carries
/// a "Video <n>" suffix depends only on how many recordings this page holds.
pub fn video_jobs(source_url: &str, found: &DiscoveredSource) -> Vec<VideoJob> {
    let multiple = found.manifest_urls.len() > 1;
    found.manifest_urls.iter()
        .enumerate()
        .map(|(i, manifest)| VideoJob {
            title: found.title.clone(),
            manifest_uri: manifest.clone(),
            sequence_number: (i + 1) as u32,
            is_part_of_multiple: multiple,
            source_url: Some(source_url.to_string()),
        })
        .collect()
}

impl LectureDownloader {
    // Record a failure, or return it if the policy (or the nature of the error) says to stop.
    fn handle_failure(
        &self,
        summary: &mut BatchSummary,
        source_url: &str,
        video: Option<u32>,
        err: LectureDlError) -> Result<(), LectureDlError>
    {
        error!("{} failed: {err}", err.stage());
        self.notify(ProgressEvent::VideoFailed { stage: err.stage(), message: err.to_string() });
        if matches!(err, LectureDlError::Cancelled) || self.failure_policy == FailurePolicy::Abort {
            return Err(err);
        }
        summary.failures.push(JobFailure {
            source_url: source_url.to_string(),
            video,
            stage: err.stage(),
            message: err.to_string(),
        });
        Ok(())
    }

    /// Download every recording on every page of `batch`, using `discovery` to find the recordings
    /// of each page. With `FailurePolicy::Continue` a failing page or recording is recorded in the
    /// summary and the batch moves on; with `FailurePolicy::Abort` the first error is returned.
    /// Cancellation always ends the run with `LectureDlError::Cancelled`.
    pub async fn run(&mut self, batch: &BatchJob, discovery: &dyn Discovery) -> Result<BatchSummary, LectureDlError> {
        if batch.sources.is_empty() {
            return Err(LectureDlError::Configuration(String::from("no source URLs to process")));
        }
        let client = self.client()?;
        let mut summary = BatchSummary { sources: batch.sources.len(), ..Default::default() };
        for (i, source_url) in batch.sources.iter().enumerate() {
            info!("URL {} of {}: {source_url}", i + 1, batch.sources.len());
            self.notify(ProgressEvent::SourceStarted {
                index: i + 1,
                total: batch.sources.len(),
                url: source_url.clone(),
            });
            let found = match discovery.discover(&client, source_url, &self.cancel).await {
                Ok(found) if found.manifest_urls.is_empty() => {
                    let err = LectureDlError::Discovery(format!("no recordings found on {source_url}"));
                    self.handle_failure(&mut summary, source_url, None, err)?;
                    continue;
                },
                Ok(found) => found,
                Err(e) => {
                    self.handle_failure(&mut summary, source_url, None, e)?;
                    continue;
                },
            };
            let jobs = video_jobs(source_url, &found);
            for job in &jobs {
                info!("Downloading video {} of {}", job.sequence_number, jobs.len());
                self.notify(ProgressEvent::VideoStarted {
                    index: job.sequence_number,
                    total: jobs.len() as u32,
                    title: job.title.clone(),
                });
                match self.download_video(job).await {
                    Ok(output) => {
                        info!("Video downloaded to {}", output.display());
                        self.notify(ProgressEvent::VideoDone { output: output.clone() });
                        summary.completed.push(output);
                    },
                    Err(e) => self.handle_failure(&mut summary, source_url, Some(job.sequence_number), e)?,
                }
            }
        }
        if !summary.failures.is_empty() {
            warn!("{} of the batch's downloads failed", summary.failures.len());
        }
        Ok(summary)
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn found(n: usize) -> DiscoveredSource {
        DiscoveredSource {
            title: String::from("Algorithms 101"),
            manifest_urls: (1..=n).map(|i| format!("https://c.example.com/{i}/s1_av.m3u8")).collect(),
        }
    }

    #[test]
    fn test_single_video_naming() {
        let jobs = video_jobs("https://echo360.org/media/a-b-c-d-e/public", &found(1));
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].output_filename("mp4"), "Algorithms 101.mp4");
        assert_eq!(jobs[0].source_url.as_deref(), Some("https://echo360.org/media/a-b-c-d-e/public"));
    }

    #[test]
    fn test_multiple_video_naming() {
        let jobs = video_jobs("https://echo360.org/media/a-b-c-d-e/public", &found(2));
        let names: Vec<String> = jobs.iter().map(|j| j.output_filename("mp4")).collect();
        assert_eq!(names, vec![String::from("Algorithms 101 - Video 1.mp4"),
                               String::from("Algorithms 101 - Video 2.mp4")]);
        assert_eq!(jobs[1].manifest_uri, "https://c.example.com/2/s1_av.m3u8");
    }

    #[tokio::test]
    async fn test_empty_batch_is_configuration_error() {
        let discovery = crate::discovery::StaticDiscovery { title: String::new(), manifest_urls: vec![] };
        let res = LectureDownloader::new("unused").run(&BatchJob::default(), &discovery).await;
        assert!(matches!(res, Err(LectureDlError::Configuration(_))));
    }
}
