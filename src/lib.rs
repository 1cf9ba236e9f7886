//! A Rust library and command-line tool for downloading lecture-capture videos from a content
//! platform that serves each recording as an HLS master playlist. Every logical track of the
//! recording (video, audio, occasionally a second camera) is offered at several quality levels;
//! the library picks the best quality for each track, downloads the raw media for those variants
//! and hands them to ffmpeg, which combines them without re-encoding into a single container.
//!
//! The overall flow for one recording is:
//!
//! - fetch and parse the master playlist into an ordered list of [`Variant`]s (see
//!   [`fetch::LectureDownloader::resolve_manifest`] and [`parse`])
//! - keep one variant per track, the one with the highest quality (see [`selection::select`])
//! - derive the URL of each selected variant's raw media file and download it to a scratch
//!   directory private to this recording
//! - mux the downloaded tracks into `<title>.mp4` (or `<title> - Video <n>.mp4` when a page holds
//!   several recordings), then remove the scratch files.
//!
//! The platform colocates the master playlist and the raw media files for every track and quality
//! in one directory, with file names of the form `s<track>q<quality>.m3u8` for the per-variant
//! playlists and `s<track>q<quality>.m4s` for the media. This naming scheme is what makes the
//! segment URL derivation in [`fetch::segment_url`] possible.
//!
//! Acquiring an authenticated session is outside the scope of this library: callers supply a
//! `reqwest::Client` carrying the session cookies via
//! [`fetch::LectureDownloader::with_http_client`].
//!
//! Example
//! ```rust,no_run
//! use lecture_dl::fetch::LectureDownloader;
//! use lecture_dl::discovery::EmbeddedPlayerDiscovery;
//! use lecture_dl::BatchJob;
//!
//! # async fn run() -> Result<(), lecture_dl::LectureDlError> {
//! let batch = BatchJob::new(vec![
//!     String::from("https://echo360.org/media/1b2c3d4e-aaaa-bbbb-cccc-0123456789ab/public"),
//! ]);
//! let summary = LectureDownloader::new("Output")
//!     .run(&batch, &EmbeddedPlayerDiscovery::new())
//!     .await?;
//! println!("{} videos downloaded", summary.completed.len());
//! # Ok(())
//! # }
//! ```


pub mod discovery;
pub mod fetch;
pub mod ffmpeg;
pub mod media;
pub mod pipeline;
pub mod selection;

use std::path::PathBuf;
use lazy_static::lazy_static;
use regex::Regex;
use url::Url;


#[derive(thiserror::Error, Debug)]
pub enum LectureDlError {
    #[error("fetching manifest: {0}")]
    ManifestFetch(String),
    #[error("parsing manifest: {0}")]
    ManifestParse(String),
    #[error("selecting variants: manifest lists no variants")]
    NoVariants,
    #[error("fetching segment: {0}")]
    SegmentFetch(String),
    #[error("writing segment {1}")]
    SegmentWrite(#[source] std::io::Error, String),
    #[error("muxing error {0}")]
    Muxing(String),
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("discovering videos: {0}")]
    Discovery(String),
    #[error("I/O error {1}")]
    Io(#[source] std::io::Error, String),
    #[error("download cancelled")]
    Cancelled,
}

impl LectureDlError {
    /// Short name of the processing stage that failed, for progress reporting.
    pub fn stage(&self) -> &'static str {
        match self {
            LectureDlError::ManifestFetch(_) => "manifest fetch",
            LectureDlError::ManifestParse(_) => "manifest parse",
            LectureDlError::NoVariants => "variant selection",
            LectureDlError::SegmentFetch(_) => "segment fetch",
            LectureDlError::SegmentWrite(_, _) => "segment write",
            LectureDlError::Muxing(_) => "muxing",
            LectureDlError::Configuration(_) => "configuration",
            LectureDlError::Discovery(_) => "discovery",
            LectureDlError::Io(_, _) => "filesystem",
            LectureDlError::Cancelled => "cancelled",
        }
    }
}


/// One encoding of one track at one quality level, as listed in the master playlist.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Variant {
    pub track_index: u32,
    pub quality: u32,
    /// The URI as written in the manifest, relative to the manifest's directory.
    pub uri: String,
}

/// The parsed master playlist.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Manifest {
    /// The directory containing the manifest, against which variant URIs are resolved.
    pub base_uri: Url,
    pub variants: Vec<Variant>,
}

/// The variant retained for one track after quality selection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectedStream {
    pub track_index: u32,
    pub quality: u32,
    pub uri: String,
}

impl From<Variant> for SelectedStream {
    fn from(v: Variant) -> Self {
        SelectedStream { track_index: v.track_index, quality: v.quality, uri: v.uri }
    }
}

/// Raw media for one selected stream, downloaded to the job's scratch directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentFile {
    pub path: PathBuf,
    pub track_index: u32,
    /// 1-based position among the selected streams of this video.
    pub ordinal: usize,
}

/// One recording to download: a manifest found on a source page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VideoJob {
    pub title: String,
    pub manifest_uri: String,
    /// 1-based position of this recording among those found on its source page.
    pub sequence_number: u32,
    pub is_part_of_multiple: bool,
    /// The page the manifest was discovered on.
    pub source_url: Option<String>,
}

impl VideoJob {
    /// The output file name for this recording, `<title>.<ext>` or `<title> - Video <n>.<ext>`.
    pub fn output_filename(&self, extension: &str) -> String {
        if self.is_part_of_multiple {
            format!("{} - Video {}.{extension}", self.title, self.sequence_number)
        } else {
            format!("{}.{extension}", self.title)
        }
    }
}

/// The ordered list of source pages to process in one run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchJob {
    pub sources: Vec<String>,
}

impl BatchJob {
    pub fn new(sources: Vec<String>) -> BatchJob {
        BatchJob { sources }
    }
}


lazy_static! {
    static ref VARIANT_FILENAME: Regex = Regex::new(r"^s(\d+)q(\d+)\.([A-Za-z0-9]+)$").unwrap();
}

/// The last path component of a (possibly relative) URI, without query string or fragment.
pub(crate) fn uri_filename(uri: &str) -> &str {
    let path = uri.split(['?', '#']).next().unwrap_or(uri);
    path.rsplit('/').next().unwrap_or(path)
}

/// Decode the track index and quality level from a variant URI such as `s1q3.m3u8`.
pub fn parse_variant_uri(uri: &str) -> Result<Variant, LectureDlError> {
    let filename = uri_filename(uri);
    let caps = VARIANT_FILENAME.captures(filename)
        .ok_or_else(|| LectureDlError::ManifestParse(
            format!("variant filename {filename:?} does not match s<track>q<quality>.<ext>")))?;
    let track_index = caps[1].parse::<u32>()
        .map_err(|e| LectureDlError::ManifestParse(format!("track index in {filename:?}: {e}")))?;
    let quality = caps[2].parse::<u32>()
        .map_err(|e| LectureDlError::ManifestParse(format!("quality in {filename:?}: {e}")))?;
    Ok(Variant { track_index, quality, uri: uri.to_string() })
}

/// Parse the text of an HLS master playlist fetched from `manifest_url`.
///
/// Variants are returned in the order of their `#EXT-X-STREAM-INF` entries. The document must
/// start with the `#EXTM3U` marker and must be a master playlist; each variant URI must follow
/// the `s<track>q<quality>.<ext>` naming scheme.
pub fn parse(manifest_url: &Url, text: &str) -> Result<Manifest, LectureDlError> {
    let trimmed = text.trim_start_matches('\u{feff}').trim_start();
    if !trimmed.starts_with("#EXTM3U") {
        return Err(LectureDlError::ManifestParse(String::from("expected #EXTM3U marker not found")));
    }
    let playlist = match m3u8_rs::parse_playlist_res(trimmed.as_bytes()) {
        Ok(m3u8_rs::Playlist::MasterPlaylist(pl)) => pl,
        Ok(m3u8_rs::Playlist::MediaPlaylist(_)) =>
            return Err(LectureDlError::ManifestParse(String::from("expected a master playlist, found a media playlist"))),
        Err(e) => return Err(LectureDlError::ManifestParse(format!("invalid playlist: {e}"))),
    };
    let base_uri = manifest_url.join(".")
        .map_err(|e| LectureDlError::ManifestParse(format!("determining base URL: {e}")))?;
    let variants = playlist.variants.iter()
        .filter(|v| !v.is_i_frame)
        .map(|v| parse_variant_uri(&v.uri))
        .collect::<Result<Vec<Variant>, LectureDlError>>()?;
    Ok(Manifest { base_uri, variants })
}



#[cfg(test)]
mod tests {
    use super::*;

    fn manifest_url() -> Url {
        Url::parse("https://content.example.com/0000/1111/s1_av.m3u8?token=abc").unwrap()
    }

    #[test]
    fn test_parse_variant_uri() {
        let v = parse_variant_uri("s2q5.m3u8").unwrap();
        assert_eq!(v, Variant { track_index: 2, quality: 5, uri: String::from("s2q5.m3u8") });
        let v = parse_variant_uri("sub/dir/s10q0.m3u8?x=1").unwrap();
        assert_eq!(v.track_index, 10);
        assert_eq!(v.quality, 0);
        assert_eq!(v.uri, "sub/dir/s10q0.m3u8?x=1");
        assert!(matches!(parse_variant_uri("audio.m3u8"), Err(LectureDlError::ManifestParse(_))));
        assert!(matches!(parse_variant_uri("s1q.m3u8"), Err(LectureDlError::ManifestParse(_))));
        assert!(matches!(parse_variant_uri("s1q1"), Err(LectureDlError::ManifestParse(_))));
        assert!(matches!(parse_variant_uri("s99999999999q1.m3u8"), Err(LectureDlError::ManifestParse(_))));
    }

    #[test]
    fn test_parse_master_playlist() {
        let text = "#EXTM3U\n\
                    #EXT-X-VERSION:3\n\
                    #EXT-X-STREAM-INF:BANDWIDTH=200000,RESOLUTION=640x360\n\
                    s1q1.m3u8\n\
                    #EXT-X-STREAM-INF:BANDWIDTH=2000000,RESOLUTION=1920x1080\n\
                    s1q3.m3u8\n\
                    #EXT-X-STREAM-INF:BANDWIDTH=64000,CODECS=\"mp4a.40.2\"\n\
                    s2q5.m3u8\n";
        let manifest = parse(&manifest_url(), text).unwrap();
        assert_eq!(manifest.base_uri.as_str(), "https://content.example.com/0000/1111/");
        let found: Vec<(u32, u32, &str)> = manifest.variants.iter()
            .map(|v| (v.track_index, v.quality, v.uri.as_str()))
            .collect();
        assert_eq!(found, vec![(1, 1, "s1q1.m3u8"), (1, 3, "s1q3.m3u8"), (2, 5, "s2q5.m3u8")]);
    }

    #[test]
    fn test_parse_rejects_bad_documents() {
        let html = "<!DOCTYPE html><html><body>Sign in</body></html>";
        match parse(&manifest_url(), html) {
            Err(LectureDlError::ManifestParse(msg)) => assert!(msg.contains("#EXTM3U")),
            other => panic!("unexpected {other:?}"),
        }
        let media = "#EXTM3U\n#EXT-X-TARGETDURATION:10\n#EXTINF:9.009,\nsegment1.ts\n#EXT-X-ENDLIST\n";
        assert!(matches!(parse(&manifest_url(), media), Err(LectureDlError::ManifestParse(_))));
        let misnamed = "#EXTM3U\n#EXT-X-STREAM-INF:BANDWIDTH=1000\nvideo_hd.m3u8\n";
        match parse(&manifest_url(), misnamed) {
            Err(LectureDlError::ManifestParse(msg)) => assert!(msg.contains("video_hd.m3u8")),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_output_filename() {
        let mut job = VideoJob {
            title: String::from("Lecture 4"),
            manifest_uri: String::from("https://content.example.com/s1_av.m3u8"),
            sequence_number: 1,
            is_part_of_multiple: false,
            source_url: None,
        };
        assert_eq!(job.output_filename("mp4"), "Lecture 4.mp4");
        job.is_part_of_multiple = true;
        job.sequence_number = 2;
        assert_eq!(job.output_filename("mkv"), "Lecture 4 - Video 2.mkv");
    }
}
