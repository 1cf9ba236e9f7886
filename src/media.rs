// Scratch space and file handling shared by the segment fetcher and the stream assembler.
//
// Each video is downloaded into its own temporary directory, so segment files from different
// videos never share a namespace, and the directory disappears when the job ends whether or not
// it succeeded.

use std::path::{Path, PathBuf};
use tempfile::TempDir;
use tracing::{debug, info, warn};
use crate::{LectureDlError, SegmentFile, VideoJob};


/// Temporary directory holding the raw segment files of one video while it is being processed.
#[derive(Debug)]
pub struct JobWorkspace {
    dir: TempDir,
}

impl JobWorkspace {
    /// Create a fresh scratch directory below `root`, creating `root` if necessary.
    pub async fn create(root: &Path) -> Result<JobWorkspace, LectureDlError> {
        tokio::fs::create_dir_all(root).await
            .map_err(|e| LectureDlError::Io(e, format!("creating scratch root {}", root.display())))?;
        let dir = tempfile::Builder::new()
            .prefix(".lecture-dl-")
            .rand_bytes(6)
            .tempdir_in(root)
            .map_err(|e| LectureDlError::Io(e, String::from("creating job scratch directory")))?;
        debug!("Scratch directory {}", dir.path().display());
        Ok(JobWorkspace { dir })
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Path for the segment with the given 1-based ordinal. The ordinal prefix keeps identically
    /// named segments of different tracks apart.
    pub fn segment_path(&self, ordinal: usize, segment_filename: &str) -> PathBuf {
        self.dir.path().join(format!("stream{ordinal}-{segment_filename}"))
    }

    /// Remove the directory and anything left in it, reporting (but not failing on) errors.
    pub fn close(self) {
        let path = self.dir.path().to_path_buf();
        if let Err(e) = self.dir.close() {
            warn!("Failed to remove scratch directory {}: {e}", path.display());
        }
    }
}


/// Delete downloaded segment files once they have been muxed. Failures are logged and otherwise
/// ignored; returns the number of files that could not be removed.
pub fn remove_segments(segments: &[SegmentFile]) -> usize {
    let mut failures = 0;
    for seg in segments {
        if let Err(e) = std::fs::remove_file(&seg.path) {
            warn!("Failed to delete temporary file {}: {e}", seg.path.display());
            failures += 1;
        }
    }
    failures
}


// As per https://www.freedesktop.org/wiki/CommonExtendedAttributes/, record the page the video was
// downloaded from and its title as extended attributes on the output file. Only active on platforms
// where the xattr crate supports extended attributes; failure is never an error.
pub fn record_metainformation(path: &Path, job: &VideoJob) {
    #[cfg(target_family = "unix")]
    {
        if let Some(source) = &job.source_url {
            if let Ok(origin) = url::Url::parse(source) {
                // Don't record URLs that embed credentials
                if origin.username().is_empty() && origin.password().is_none()
                    && xattr::set(path, "user.xdg.origin.url", source.as_bytes()).is_err()
                {
                    info!("Failed to set user.xdg.origin.url xattr on output file");
                }
            }
        }
        if xattr::set(path, "user.dublincore.title", job.title.as_bytes()).is_err() {
            info!("Failed to set user.dublincore.title xattr on output file");
        }
    }
    #[cfg(not(target_family = "unix"))]
    let _ = (path, job);
}
