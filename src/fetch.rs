//! Support for downloading lecture recordings from HLS master playlists.

use std::env;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use lazy_static::lazy_static;
use regex::Regex;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use url::Url;
use crate::{parse, uri_filename, LectureDlError, Manifest, SegmentFile, SelectedStream, VideoJob};
use crate::ffmpeg::{assemble, FfmpegMuxer, Muxer};
use crate::media::{record_metainformation, JobWorkspace};
use crate::selection::select;

/// A `Client` from the `reqwest` crate, carrying the session cookies of the authenticated channel.
pub type HttpClient = reqwest::Client;

/// File name suffix of the per-variant playlists listed in the master playlist.
pub const MANIFEST_SUFFIX: &str = ".m3u8";
/// File name suffix of the raw media file stored next to each per-variant playlist.
pub const SEGMENT_SUFFIX: &str = ".m4s";


/// Something that happened while processing a batch, reported to `ProgressObserver`s.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProgressEvent {
    SourceStarted { index: usize, total: usize, url: String },
    VideoStarted { index: u32, total: u32, title: String },
    StreamDownloading { ordinal: usize, total: usize, track_index: u32, quality: u32 },
    Merging { output: PathBuf },
    VideoDone { output: PathBuf },
    VideoFailed { stage: &'static str, message: String },
}

/// Receives updates concerning the progression of the download, and can display this information to
/// the user, for example on the console.
pub trait ProgressObserver: Send + Sync {
    fn update(&self, event: &ProgressEvent);
}


/// What to do with the rest of the batch when one source or video fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FailurePolicy {
    /// Record the failure in the batch summary and move on to the next video.
    #[default]
    Continue,
    /// Stop the batch and return the first error.
    Abort,
}


/// The LectureDownloader downloads the recordings listed on one or more source pages. For each
/// recording it fetches the master playlist, selects the best quality variant of each track,
/// downloads the raw media of those variants one at a time and muxes them into a single file in
/// the output directory.
///
/// It follows the builder pattern for optional settings.
///
/// Example
/// ```rust,no_run
/// use std::time::Duration;
/// use lecture_dl::fetch::{LectureDownloader, FailurePolicy};
///
/// let client = reqwest::Client::builder()
///     .cookie_store(true)
///     .build()
///     .expect("creating HTTP client");
/// let downloader = LectureDownloader::new("Output")
///     .with_http_client(client)
///     .with_fetch_timeout(Duration::from_secs(60))
///     .with_failure_policy(FailurePolicy::Abort);
/// ```
pub struct LectureDownloader {
    pub output_dir: PathBuf,
    pub(crate) http_client: Option<HttpClient>,
    pub(crate) scratch_dir: Option<PathBuf>,
    pub(crate) container: String,
    pub(crate) fetch_timeout: Duration,
    pub(crate) ffmpeg_location: String,
    pub(crate) mux_timeout: Duration,
    pub(crate) muxer: Option<Arc<dyn Muxer>>,
    pub(crate) failure_policy: FailurePolicy,
    pub(crate) cancel: CancellationToken,
    pub(crate) progress_observers: Vec<Arc<dyn ProgressObserver>>,
    pub(crate) record_metainformation: bool,
}

impl LectureDownloader {
    /// Create a `LectureDownloader` writing finished videos to `output_dir`.
    pub fn new<P: Into<PathBuf>>(output_dir: P) -> LectureDownloader {
        let ffmpeg = FfmpegMuxer::default();
        LectureDownloader {
            output_dir: output_dir.into(),
            http_client: None,
            scratch_dir: None,
            container: String::from("mp4"),
            fetch_timeout: Duration::from_secs(30),
            ffmpeg_location: ffmpeg.location,
            mux_timeout: ffmpeg.timeout,
            muxer: None,
            failure_policy: FailurePolicy::default(),
            cancel: CancellationToken::new(),
            progress_observers: vec![],
            record_metainformation: true,
        }
    }

    /// Specify the reqwest Client used for every request. This is the authenticated channel: it
    /// should carry the session cookies (for instance via `cookie_provider` or `cookie_store`).
    pub fn with_http_client(mut self, client: HttpClient) -> LectureDownloader {
        self.http_client = Some(client);
        self
    }

    /// Add an observer implementing the ProgressObserver trait, that will receive updates concerning
    /// the progression of the batch.
    pub fn add_progress_observer(mut self, observer: Arc<dyn ProgressObserver>) -> LectureDownloader {
        self.progress_observers.push(observer);
        self
    }

    /// Filename extension of the output container (default "mp4"). The container format is chosen
    /// by ffmpeg from this extension.
    pub fn with_container(mut self, extension: &str) -> LectureDownloader {
        self.container = extension.trim_start_matches('.').to_string();
        self
    }

    /// Directory below which each video gets its temporary scratch directory (default: the output
    /// directory).
    pub fn with_scratch_dir<P: Into<PathBuf>>(mut self, dir: P) -> LectureDownloader {
        self.scratch_dir = Some(dir.into());
        self
    }

    /// Upper bound on each network request, from connection until the last byte of the body.
    pub fn with_fetch_timeout(mut self, timeout: Duration) -> LectureDownloader {
        self.fetch_timeout = timeout;
        self
    }

    /// Upper bound on the muxing step for one video.
    pub fn with_mux_timeout(mut self, timeout: Duration) -> LectureDownloader {
        self.mux_timeout = timeout;
        self
    }

    /// Specify the location of the `ffmpeg` application, if not located in PATH.
    pub fn with_ffmpeg(mut self, ffmpeg_path: &str) -> LectureDownloader {
        self.ffmpeg_location = ffmpeg_path.to_string();
        self
    }

    /// Use `muxer` instead of running ffmpeg. The `with_ffmpeg` and `with_mux_timeout` settings
    /// are then ignored.
    pub fn with_muxer(mut self, muxer: Arc<dyn Muxer>) -> LectureDownloader {
        self.muxer = Some(muxer);
        self
    }

    pub fn with_failure_policy(mut self, policy: FailurePolicy) -> LectureDownloader {
        self.failure_policy = policy;
        self
    }

    /// Abort in-flight work when `token` is cancelled. Cancellation always stops the whole batch.
    pub fn with_cancellation(mut self, token: CancellationToken) -> LectureDownloader {
        self.cancel = token;
        self
    }

    /// If `record` is true, record the source page URL and the title as extended attributes on
    /// each output file (on platforms that support them).
    pub fn record_metainformation(mut self, record: bool) -> LectureDownloader {
        self.record_metainformation = record;
        self
    }

    pub(crate) fn client(&mut self) -> Result<HttpClient, LectureDlError> {
        if let Some(client) = &self.http_client {
            return Ok(client.clone());
        }
        let client = reqwest::Client::builder()
            .cookie_store(true)
            .build()
            .map_err(|e| LectureDlError::Configuration(format!("building HTTP client: {e}")))?;
        self.http_client = Some(client.clone());
        Ok(client)
    }

    pub(crate) fn muxer(&self) -> Arc<dyn Muxer> {
        match &self.muxer {
            Some(m) => Arc::clone(m),
            None => Arc::new(FfmpegMuxer::new(&self.ffmpeg_location, self.mux_timeout)),
        }
    }

    pub(crate) fn notify(&self, event: ProgressEvent) {
        for observer in &self.progress_observers {
            observer.update(&event);
        }
    }

    fn scratch_root(&self) -> PathBuf {
        self.scratch_dir.clone().unwrap_or_else(|| self.output_dir.clone())
    }

    /// Where the finished file for `job` is written.
    pub fn output_path(&self, job: &VideoJob) -> PathBuf {
        self.output_dir.join(job.output_filename(&self.container))
    }

    /// Fetch the master playlist at `manifest_url` and parse it into its list of variants. No
    /// retries are attempted.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn resolve_manifest(&mut self, manifest_url: &str) -> Result<Manifest, LectureDlError> {
        let client = self.client()?;
        let url = Url::parse(manifest_url)
            .map_err(|e| LectureDlError::ManifestFetch(format!("invalid manifest URL {manifest_url}: {e}")))?;
        let fetch = async {
            let response = client.get(url.clone())
                .header("Accept", "application/vnd.apple.mpegurl,application/x-mpegURL,*/*")
                .timeout(self.fetch_timeout)
                .send().await
                .map_err(|e| network_error(LectureDlError::ManifestFetch, "requesting manifest", e))?;
            if !response.status().is_success() {
                let msg = format!("HTTP {} for {url}", response.status().as_str());
                return Err(LectureDlError::ManifestFetch(msg));
            }
            response.text().await
                .map_err(|e| network_error(LectureDlError::ManifestFetch, "reading manifest body", e))
        };
        let text = cancellable(&self.cancel, fetch).await?;
        let manifest = parse(&url, &text)?;
        debug!("Manifest lists {} variants", manifest.variants.len());
        Ok(manifest)
    }

    /// Download the raw media for `stream` into `workspace`, tagging the file with `ordinal` (the
    /// 1-based position of the stream among those selected for this video).
    #[tracing::instrument(level = "debug", skip(self, workspace))]
    pub async fn fetch_segment(
        &mut self,
        stream: &SelectedStream,
        manifest_url: &str,
        ordinal: usize,
        workspace: &JobWorkspace) -> Result<SegmentFile, LectureDlError>
    {
        let client = self.client()?;
        let filename = segment_filename(&stream.uri)?;
        let manifest_url = Url::parse(manifest_url)
            .map_err(|e| LectureDlError::SegmentFetch(format!("invalid manifest URL {manifest_url}: {e}")))?;
        let url = segment_url(&manifest_url, &filename)?;
        let path = workspace.segment_path(ordinal, &filename);
        debug!("Fetching {url} to {}", path.display());
        let fetch = async {
            let mut response = client.get(url.clone())
                .timeout(self.fetch_timeout)
                .send().await
                .map_err(|e| network_error(LectureDlError::SegmentFetch, "requesting segment", e))?;
            if !response.status().is_success() {
                let msg = format!("HTTP {} for {url}", response.status().as_str());
                return Err(LectureDlError::SegmentFetch(msg));
            }
            let file = tokio::fs::File::create(&path).await
                .map_err(|e| LectureDlError::SegmentWrite(e, format!("creating {}", path.display())))?;
            let mut sink = tokio::io::BufWriter::new(file);
            let mut written: u64 = 0;
            while let Some(chunk) = response.chunk().await
                .map_err(|e| network_error(LectureDlError::SegmentFetch, "reading segment body", e))?
            {
                sink.write_all(&chunk).await
                    .map_err(|e| LectureDlError::SegmentWrite(e, format!("writing {}", path.display())))?;
                written += chunk.len() as u64;
            }
            sink.flush().await
                .map_err(|e| LectureDlError::SegmentWrite(e, format!("flushing {}", path.display())))?;
            Ok::<u64, LectureDlError>(written)
        };
        let written = cancellable(&self.cancel, fetch).await?;
        debug!("Wrote {:.1}MB to {}", written as f64 / (1024.0 * 1024.0), path.display());
        Ok(SegmentFile { path, track_index: stream.track_index, ordinal })
    }

    /// Download one recording: resolve its manifest, select one stream per track, fetch each
    /// selected stream in order and mux them into the output file, whose path is returned.
    ///
    /// The scratch directory holding the downloaded streams is removed whatever the outcome.
    #[tracing::instrument(level = "info", skip(self, job), fields(title = %job.title, n = job.sequence_number))]
    pub async fn download_video(&mut self, job: &VideoJob) -> Result<PathBuf, LectureDlError> {
        let manifest = self.resolve_manifest(&job.manifest_uri).await?;
        let streams = select(manifest)?;
        let workspace = JobWorkspace::create(&self.scratch_root()).await?;
        let mut segments = Vec::with_capacity(streams.len());
        for (i, stream) in streams.iter().enumerate() {
            let ordinal = i + 1;
            info!("Downloading stream {ordinal} of {} (track {}, quality {})",
                  streams.len(), stream.track_index, stream.quality);
            self.notify(ProgressEvent::StreamDownloading {
                ordinal,
                total: streams.len(),
                track_index: stream.track_index,
                quality: stream.quality,
            });
            segments.push(self.fetch_segment(stream, &job.manifest_uri, ordinal, &workspace).await?);
        }
        tokio::fs::create_dir_all(&self.output_dir).await
            .map_err(|e| LectureDlError::Io(e, format!("creating output directory {}", self.output_dir.display())))?;
        let output = self.output_path(job);
        self.notify(ProgressEvent::Merging { output: output.clone() });
        let muxer = self.muxer();
        assemble(muxer.as_ref(), &segments, &output, &self.cancel).await?;
        workspace.close();
        if self.record_metainformation {
            record_metainformation(&output, job);
        }
        Ok(output)
    }

    /// Download the recordings of a single source whose manifests are already known, into the
    /// current working directory when no output directory is set.
    pub async fn download_manifest(mut self, title: &str, manifest_url: &str) -> Result<PathBuf, LectureDlError> {
        if self.output_dir.as_os_str().is_empty() {
            self.output_dir = env::current_dir()
                .map_err(|e| LectureDlError::Io(e, String::from("obtaining current directory")))?;
        }
        let job = VideoJob {
            title: title.to_string(),
            manifest_uri: manifest_url.to_string(),
            sequence_number: 1,
            is_part_of_multiple: false,
            source_url: None,
        };
        self.download_video(&job).await
    }
}


lazy_static! {
    // The trailing component of a track-level manifest URL, such as "s1_av.m3u8".
    static ref TRACK_MANIFEST_FILENAME: Regex = Regex::new(r"^s\d+_.*\.m3u8$").unwrap();
}

/// The name of the raw media file corresponding to a variant playlist: `s1q3.m3u8` becomes
/// `s1q3.m4s`.
pub fn segment_filename(variant_uri: &str) -> Result<String, LectureDlError> {
    let filename = uri_filename(variant_uri);
    match filename.strip_suffix(MANIFEST_SUFFIX) {
        Some(stem) if !stem.is_empty() => Ok(format!("{stem}{SEGMENT_SUFFIX}")),
        _ => Err(LectureDlError::SegmentFetch(
            format!("no segment file mapping for variant {variant_uri:?}"))),
    }
}

/// Build the URL of a raw media file from the URL of the manifest that listed it.
///
/// The platform stores the manifest and the media files of every track and quality in the same
/// directory, so the segment URL is the manifest URL with its trailing file name component (which
/// must look like `s<n>_<anything>.m3u8`) replaced by `segment_filename`. Scheme, host, the
/// directory path and any query string (often an access signature) are kept.
pub fn segment_url(manifest_url: &Url, segment_filename: &str) -> Result<Url, LectureDlError> {
    let trailing = manifest_url.path_segments()
        .and_then(|mut segments| segments.next_back())
        .unwrap_or("");
    if !TRACK_MANIFEST_FILENAME.is_match(trailing) {
        return Err(LectureDlError::SegmentFetch(
            format!("manifest URL {manifest_url} does not end in a track manifest file name")));
    }
    let mut url = manifest_url.clone();
    url.path_segments_mut()
        .map_err(|_| LectureDlError::SegmentFetch(format!("manifest URL {manifest_url} cannot be a base")))?
        .pop()
        .push(segment_filename);
    Ok(url)
}


// Run `fut` unless the token is cancelled first.
pub(crate) async fn cancellable<T, F>(token: &CancellationToken, fut: F) -> Result<T, LectureDlError>
where
    F: Future<Output = Result<T, LectureDlError>>,
{
    tokio::select! {
        biased;
        _ = token.cancelled() => Err(LectureDlError::Cancelled),
        res = fut => res,
    }
}

fn network_error(
    kind: fn(String) -> LectureDlError,
    why: &str,
    e: reqwest::Error) -> LectureDlError
{
    if e.is_timeout() {
        kind(format!("{why}: timed out"))
    } else {
        kind(format!("{why}: {e}"))
    }
}
