//! Muxing support using ffmpeg as a subprocess.
//!
//! The downloaded tracks are already encoded, so ffmpeg only copies each input stream into the
//! output container. The `Muxer` trait is the seam between the download pipeline and the muxing
//! tool; `FfmpegMuxer` is the implementation used in production.


use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use async_trait::async_trait;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use crate::LectureDlError;
use crate::SegmentFile;
use crate::media::remove_segments;


/// Combines several single-track media files into one container without re-encoding.
#[async_trait]
pub trait Muxer: Send + Sync {
    /// Mux `inputs`, in order, into `output`. Must resolve only once the output is complete.
    async fn mux(&self, inputs: &[PathBuf], output: &Path, cancel: &CancellationToken)
                 -> Result<(), LectureDlError>;
}


/// Runs `ffmpeg` in stream-copy mode.
#[derive(Debug, Clone)]
pub struct FfmpegMuxer {
    pub location: String,
    pub timeout: Duration,
}

impl Default for FfmpegMuxer {
    fn default() -> Self {
        FfmpegMuxer {
            location: if cfg!(target_os = "windows") {
                String::from("ffmpeg.exe")
            } else {
                String::from("ffmpeg")
            },
            timeout: Duration::from_secs(30 * 60),
        }
    }
}

impl FfmpegMuxer {
    pub fn new(location: &str, timeout: Duration) -> FfmpegMuxer {
        FfmpegMuxer { location: location.to_string(), timeout }
    }
}

/// Commandline arguments for a stream-copy mux of `inputs` into `output`. Every input is mapped
/// explicitly so that tracks beyond the first video and audio stream are kept, and the bitexact
/// flags keep reruns on the same inputs byte-identical.
pub fn ffmpeg_args(inputs: &[PathBuf], output: &Path) -> Vec<OsString> {
    let mut args: Vec<OsString> = ["-hide_banner", "-nostats", "-nostdin",
                                   "-loglevel", "error",  // or "warning", "info"
                                   "-y"]  // overwrite output file if it exists
        .iter().map(OsString::from).collect();
    for input in inputs {
        args.push(OsString::from("-i"));
        args.push(input.as_os_str().to_os_string());
    }
    for n in 0..inputs.len() {
        args.push(OsString::from("-map"));
        args.push(OsString::from(n.to_string()));
    }
    for a in ["-c", "copy", "-map_metadata", "-1", "-fflags", "+bitexact"] {
        args.push(OsString::from(a));
    }
    args.push(output.as_os_str().to_os_string());
    args
}

#[async_trait]
impl Muxer for FfmpegMuxer {
    #[tracing::instrument(level = "debug", skip(self, cancel))]
    async fn mux(&self, inputs: &[PathBuf], output: &Path, cancel: &CancellationToken)
                 -> Result<(), LectureDlError> {
        if inputs.is_empty() {
            return Err(LectureDlError::Muxing(String::from("no input streams")));
        }
        let child = Command::new(&self.location)
            .args(ffmpeg_args(inputs, output))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| LectureDlError::Muxing(format!("spawning {}: {e}", self.location)))?;
        // Dropping the wait future on timeout or cancellation kills the child.
        let ffmpeg = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(LectureDlError::Cancelled),
            res = tokio::time::timeout(self.timeout, child.wait_with_output()) => match res {
                Err(_) => return Err(LectureDlError::Muxing(
                    format!("ffmpeg did not complete within {}", humantime::format_duration(self.timeout)))),
                Ok(Err(e)) => return Err(LectureDlError::Muxing(format!("waiting for ffmpeg: {e}"))),
                Ok(Ok(out)) => out,
            },
        };
        let msg = String::from_utf8_lossy(&ffmpeg.stderr);
        if ffmpeg.status.success() {
            if !msg.trim().is_empty() {
                debug!("ffmpeg stderr: {msg}");
            }
            Ok(())
        } else {
            Err(LectureDlError::Muxing(format!("ffmpeg exited with {}: {}", ffmpeg.status, msg.trim())))
        }
    }
}


/// Mux the downloaded segment files, in ordinal order, into `output`, then delete them. A failure
/// to delete a segment file is only reported.
///
/// The muxer writes to a temporary file in the output directory, which is renamed to `output` only
/// once muxing has succeeded. On failure, timeout or cancellation the temporary file is removed and
/// `output` is left untouched.
pub async fn assemble(
    muxer: &dyn Muxer,
    segments: &[SegmentFile],
    output: &Path,
    cancel: &CancellationToken) -> Result<(), LectureDlError>
{
    let mut ordered: Vec<&SegmentFile> = segments.iter().collect();
    ordered.sort_by_key(|s| s.ordinal);
    let inputs: Vec<PathBuf> = ordered.iter().map(|s| s.path.clone()).collect();
    info!("Merging {} streams into {}", inputs.len(), output.display());
    let dir = match output.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    // Keep the extension: ffmpeg picks the container format from it.
    let suffix = output.extension()
        .map(|e| format!(".{}", e.to_string_lossy()))
        .unwrap_or_default();
    let partial = tempfile::Builder::new()
        .prefix(".lecture-dl-")
        .suffix(&suffix)
        .tempfile_in(dir)
        .map_err(|e| LectureDlError::Io(e, format!("creating temporary output in {}", dir.display())))?
        .into_temp_path();
    debug!("Muxing into temporary file {}", partial.display());
    muxer.mux(&inputs, &partial, cancel).await?;
    let dest = output.to_path_buf();
    tokio::task::spawn_blocking(move || partial.persist(&dest))
        .await
        .map_err(|e| LectureDlError::Muxing(format!("moving merged file into place: {e}")))?
        .map_err(|e| LectureDlError::Io(e.error, format!("moving merged file to {}", output.display())))?;
    let undeleted = remove_segments(segments);
    if undeleted > 0 {
        warn!("{undeleted} temporary stream files could not be deleted");
    }
    Ok(())
}
