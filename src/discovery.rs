//! Finding the recordings on a source page.
//!
//! A source page is the public page of one lecture capture. It may embed one or several
//! recordings; discovery turns the page URL into a title and the list of master playlist URLs
//! found on the page. Three strategies are provided:
//!
//! - [`EmbeddedPlayerDiscovery`] reads the JSON configuration the page passes to its media player
//! - [`ObservedRequestDiscovery`] collects the playlist requests a browser makes while loading the
//!   page, supplied by a [`PageObserver`]
//! - [`StaticDiscovery`] returns a fixed answer, for callers that already know the playlist URLs.

use std::path::Path;
use std::time::Duration;
use async_trait::async_trait;
use lazy_static::lazy_static;
use regex::Regex;
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};
use crate::LectureDlError;
use crate::fetch::{cancellable, HttpClient};


lazy_static! {
    static ref SOURCE_URL: Regex =
        Regex::new(r"^https://echo360.*/media/.*-.*-.*-.*-.*/public$").unwrap();
    static ref MANIFEST_REQUEST: Regex = Regex::new(r"^.*s\d+_.*\.m3u8?.*$").unwrap();
    static ref PAGE_TITLE: Regex = Regex::new(r"(?is)<title[^>]*>(.*?)</title>").unwrap();
    static ref TITLE_EXTENSION: Regex = Regex::new(r"\.[A-Za-z0-9]{2,4}$").unwrap();
}

/// The validated list of source page URLs read from the input file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceList {
    pub urls: Vec<String>,
}

impl SourceList {
    /// Keep the lines of `text` that are valid source page URLs, after trimming. Invalid lines are
    /// dropped silently; an empty result is a configuration error.
    pub fn parse(text: &str) -> Result<SourceList, LectureDlError> {
        let urls: Vec<String> = text.lines()
            .map(str::trim)
            .filter(|line| SOURCE_URL.is_match(line))
            .map(String::from)
            .collect();
        if urls.is_empty() {
            return Err(LectureDlError::Configuration(String::from(
                "no valid URLs were found in the input file. \
                 URLs must be in the format: https://echo360<TLD>/media/<ID>/public")));
        }
        Ok(SourceList { urls })
    }

    pub fn from_file(path: &Path) -> Result<SourceList, LectureDlError> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| LectureDlError::Io(e, format!("reading URL list {}", path.display())))?;
        SourceList::parse(&text)
    }
}


/// What discovery found on one source page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredSource {
    pub title: String,
    /// Master playlist URLs, in the order the recordings appear on the page.
    pub manifest_urls: Vec<String>,
}

/// Turns a source page URL into the recordings it holds.
#[async_trait]
pub trait Discovery: Send + Sync {
    async fn discover(&self, client: &HttpClient, source_url: &str, cancel: &CancellationToken)
                      -> Result<DiscoveredSource, LectureDlError>;
}


/// Always returns the same title and playlists.
#[derive(Debug, Clone)]
pub struct StaticDiscovery {
    pub title: String,
    pub manifest_urls: Vec<String>,
}

#[async_trait]
impl Discovery for StaticDiscovery {
    async fn discover(&self, _client: &HttpClient, _source_url: &str, _cancel: &CancellationToken)
                      -> Result<DiscoveredSource, LectureDlError> {
        Ok(DiscoveredSource {
            title: normalize_title(&self.title),
            manifest_urls: self.manifest_urls.clone(),
        })
    }
}


// The player configuration is passed as a JSON string literal to Echo["mediaPlayerApp"](...).
const PLAYER_START_MARKER: &str = r#"Echo["mediaPlayerApp"](""#;
const PLAYER_END_MARKER: &str = r#"");"#;

#[derive(Debug, Deserialize)]
struct PlayerConfig {
    #[serde(default)]
    sources: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct PlayerSource {
    source: String,
}

/// Reads the playlist URLs from the media player configuration embedded in the page markup.
#[derive(Debug, Clone)]
pub struct EmbeddedPlayerDiscovery {
    /// Upper bound on loading the page (default 30 seconds).
    pub timeout: Duration,
}

impl Default for EmbeddedPlayerDiscovery {
    fn default() -> Self {
        EmbeddedPlayerDiscovery { timeout: Duration::from_secs(30) }
    }
}

impl EmbeddedPlayerDiscovery {
    pub fn new() -> EmbeddedPlayerDiscovery {
        EmbeddedPlayerDiscovery::default()
    }

    pub fn with_timeout(mut self, timeout: Duration) -> EmbeddedPlayerDiscovery {
        self.timeout = timeout;
        self
    }
}

#[async_trait]
impl Discovery for EmbeddedPlayerDiscovery {
    #[tracing::instrument(level = "debug", skip(self, client, cancel))]
    async fn discover(&self, client: &HttpClient, source_url: &str, cancel: &CancellationToken)
                      -> Result<DiscoveredSource, LectureDlError> {
        let fetch = async {
            let response = client.get(source_url)
                .timeout(self.timeout)
                .send().await
                .map_err(|e| if e.is_timeout() {
                    LectureDlError::Discovery(format!("loading {source_url}: timed out"))
                } else {
                    LectureDlError::Discovery(format!("loading {source_url}: {e}"))
                })?;
            if !response.status().is_success() {
                return Err(LectureDlError::Discovery(
                    format!("loading {source_url}: HTTP {}", response.status().as_str())));
            }
            response.text().await
                .map_err(|e| LectureDlError::Discovery(format!("reading {source_url}: {e}")))
        };
        let page = cancellable(cancel, fetch).await?;
        let manifest_urls = embedded_manifest_urls(&page)?;
        let title = page_title(&page).unwrap_or_default();
        Ok(DiscoveredSource { title: normalize_title(&title), manifest_urls })
    }
}

// Extracts a substring from between the two given marker strings.
fn extract<'a>(source: &'a str, start_marker: &str, end_marker: &str) -> Result<&'a str, LectureDlError> {
    let start = source.find(start_marker)
        .ok_or_else(|| LectureDlError::Discovery(format!("failed to find the start marker {start_marker}")))?
        + start_marker.len();
    let len = source[start..].find(end_marker)
        .ok_or_else(|| LectureDlError::Discovery(format!("failed to find the end marker {end_marker}")))?;
    Ok(&source[start..start + len])
}

/// The playlist URLs of `sources.video1`, `sources.video2`, ... in the embedded player
/// configuration of `page`.
pub fn embedded_manifest_urls(page: &str) -> Result<Vec<String>, LectureDlError> {
    let blob = extract(page, PLAYER_START_MARKER, PLAYER_END_MARKER)?.replace('\\', "");
    let config: PlayerConfig = serde_json::from_str(&blob)
        .map_err(|e| LectureDlError::Discovery(format!("parsing player configuration: {e}")))?;
    let mut urls = Vec::new();
    for n in 1.. {
        let Some(value) = config.sources.get(&format!("video{n}")) else { break };
        let src: PlayerSource = serde_json::from_value(value.clone())
            .map_err(|e| LectureDlError::Discovery(format!("parsing sources.video{n}: {e}")))?;
        urls.push(src.source);
    }
    if urls.is_empty() {
        return Err(LectureDlError::Discovery(String::from("player configuration lists no video sources")));
    }
    Ok(urls)
}

/// Content of the `<title>` element of an HTML page.
pub fn page_title(page: &str) -> Option<String> {
    PAGE_TITLE.captures(page)
        .map(|c| c[1].split_whitespace().collect::<Vec<_>>().join(" "))
}

/// Turn a page title into something usable as an output file name stem: decode the common HTML
/// entities, drop a trailing file extension and remove characters that are not allowed in file
/// names.
pub fn normalize_title(raw: &str) -> String {
    use sanitise_file_name::{sanitise_with_options, Options};

    let decoded = raw.trim()
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&amp;", "&");
    let stem = match TITLE_EXTENSION.find(&decoded) {
        Some(m) if m.as_str().chars().any(|c| c.is_ascii_alphabetic()) => &decoded[..m.start()],
        _ => decoded.as_str(),
    };
    let mut opts = Options::DEFAULT;
    opts.length_limit = 150;
    let name = sanitise_with_options(stem.trim(), &opts);
    if name.trim().is_empty() {
        String::from("Untitled")
    } else {
        name
    }
}


/// Whether a URL requested by the page is a track-level master playlist.
pub fn is_manifest_request(url: &str) -> bool {
    MANIFEST_REQUEST.is_match(url)
}

/// A page loaded in an instrumented browser.
pub struct ObservedPage {
    pub title: String,
    /// Every URL the page requests, in order. The sender side is dropped when the observer stops
    /// watching the page.
    pub requests: mpsc::Receiver<String>,
}

/// Loads a page and reports the network requests it makes.
#[async_trait]
pub trait PageObserver: Send + Sync {
    async fn open(&self, url: &str) -> Result<ObservedPage, LectureDlError>;
}

/// Collects the playlists requested by a page while it loads.
///
/// Collection stops when the page observer closes the request channel, when no new playlist has
/// been requested for `quiet_period` after the first one, or when `timeout` has elapsed since the
/// page was opened.
pub struct ObservedRequestDiscovery<O: PageObserver> {
    observer: O,
    pub quiet_period: Duration,
    pub timeout: Duration,
}

impl<O: PageObserver> ObservedRequestDiscovery<O> {
    pub fn new(observer: O) -> Self {
        ObservedRequestDiscovery {
            observer,
            quiet_period: Duration::from_secs(2),
            timeout: Duration::from_secs(30),
        }
    }

    pub fn with_quiet_period(mut self, quiet_period: Duration) -> Self {
        self.quiet_period = quiet_period;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Drain `requests`, keeping distinct manifest URLs in order of first request.
pub async fn collect_manifest_requests(
    requests: &mut mpsc::Receiver<String>,
    quiet_period: Duration,
    timeout: Duration,
    cancel: &CancellationToken) -> Result<Vec<String>, LectureDlError>
{
    let deadline = tokio::time::Instant::now() + timeout;
    let mut found: Vec<String> = Vec::new();
    // Only a newly found playlist pushes this back; other requests leave it alone.
    let mut quiet_until: Option<tokio::time::Instant> = None;
    loop {
        let wait_until = quiet_until.map_or(deadline, |q| q.min(deadline));
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(LectureDlError::Cancelled),
            _ = tokio::time::sleep_until(wait_until) => {
                debug!("Stopped waiting for playlist requests");
                break;
            },
            next = requests.recv() => match next {
                None => break,
                Some(url) => {
                    trace!("Page requested {url}");
                    if is_manifest_request(&url) && !found.contains(&url) {
                        info!("Found playlist {url}");
                        found.push(url);
                        quiet_until = Some(tokio::time::Instant::now() + quiet_period);
                    }
                },
            },
        }
    }
    Ok(found)
}

#[async_trait]
impl<O: PageObserver> Discovery for ObservedRequestDiscovery<O> {
    async fn discover(&self, _client: &HttpClient, source_url: &str, cancel: &CancellationToken)
                      -> Result<DiscoveredSource, LectureDlError> {
        let mut page = cancellable(cancel, self.observer.open(source_url)).await?;
        let manifest_urls = collect_manifest_requests(
            &mut page.requests, self.quiet_period, self.timeout, cancel).await?;
        if manifest_urls.is_empty() {
            return Err(LectureDlError::Discovery(format!("no playlist requests observed on {source_url}")));
        }
        Ok(DiscoveredSource { title: normalize_title(&page.title), manifest_urls })
    }
}
