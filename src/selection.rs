//! Reduce the variants listed in a manifest to one stream per track.

use tracing::debug;
use crate::{LectureDlError, Manifest, SelectedStream};


/// Select the highest quality variant for each distinct track index.
///
/// Variants are considered in manifest order. A variant replaces the current choice for its track
/// only if its quality is strictly higher, so on equal quality the variant listed first wins. The
/// result lists tracks in the order in which each track index first appears in the manifest.
pub fn select(manifest: Manifest) -> Result<Vec<SelectedStream>, LectureDlError> {
    if manifest.variants.is_empty() {
        return Err(LectureDlError::NoVariants);
    }
    let mut selected: Vec<SelectedStream> = Vec::new();
    for variant in manifest.variants {
        match selected.iter_mut().find(|s| s.track_index == variant.track_index) {
            None => selected.push(SelectedStream::from(variant)),
            Some(current) => {
                if variant.quality > current.quality {
                    debug!("Track {}: quality {} supersedes {}",
                           variant.track_index, variant.quality, current.quality);
                    *current = SelectedStream::from(variant);
                }
            },
        }
    }
    Ok(selected)
}
