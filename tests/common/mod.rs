//! Shared code for our test harness.

#![allow(dead_code)]

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use async_trait::async_trait;
use axum::{routing::get, Router};
use axum::body::Body;
use axum::extract::State;
use axum::http::{header, HeaderMap, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum_server::{bind, Handle};
use lazy_static::lazy_static;
use std::sync::Once;
use tokio_util::sync::CancellationToken;
use tracing::info;
use lecture_dl::LectureDlError;
use lecture_dl::ffmpeg::Muxer;
use lecture_dl::fetch::{ProgressEvent, ProgressObserver};


lazy_static! {
    static ref TRACING_INIT: Once = Once::new();
}

pub fn setup_logging() {
    use tracing_subscriber::{EnvFilter, fmt, fmt::time::LocalTime, prelude::*};
    use time::macros::format_description;

    TRACING_INIT.call_once(|| {
        let timer = LocalTime::new(format_description!("[hour]:[minute]:[second]"));
        let fmt_layer = fmt::layer()
            .compact()
            .with_timer(timer)
            .with_target(false);
        let filter_layer = EnvFilter::try_from_default_env()
            .or_else(|_| EnvFilter::try_new("info,reqwest=warn,hyper=warn,h2=warn"))
            .expect("initializing logging");
        tracing_subscriber::registry()
            .with(filter_layer)
            .with(fmt_layer)
            .init();
    });
}


pub const SESSION_COOKIE: &str = "PLAY_SESSION=lecture-token";

/// Build the text of a master playlist listing `variant_uris` in order.
pub fn master_playlist(variant_uris: &[&str]) -> String {
    let mut m3u8 = String::from("#EXTM3U\n#EXT-X-VERSION:3\n");
    for (i, uri) in variant_uris.iter().enumerate() {
        m3u8 += &format!("#EXT-X-STREAM-INF:BANDWIDTH={}\n{uri}\n", 64000 * (i + 1));
    }
    m3u8
}

/// What the test content server serves: manifests and segments by request path, and HTML pages.
#[derive(Debug, Default)]
pub struct Content {
    pub manifests: HashMap<String, String>,
    pub segments: HashMap<String, Vec<u8>>,
    pub pages: HashMap<String, String>,
    /// Requests for paths starting with this prefix are answered after a long delay.
    pub slow_prefix: Option<String>,
}

#[derive(Debug, Default)]
pub struct AppState {
    content: Content,
    requests: Mutex<Vec<String>>,
}

/// An axum server standing in for the lecture-capture platform. Every path except /login requires
/// the session cookie that /login sets.
pub struct ContentServer {
    pub base: String,
    pub state: Arc<AppState>,
    handle: Handle<SocketAddr>,
}

impl ContentServer {
    pub async fn start(content: Content) -> ContentServer {
        async fn login() -> impl IntoResponse {
            ([(header::SET_COOKIE, format!("{SESSION_COOKIE}; Path=/"))], "welcome")
        }

        async fn serve(State(state): State<Arc<AppState>>, headers: HeaderMap, uri: Uri) -> Response {
            let path = uri.path().to_string();
            info!("request for {path}");
            state.requests.lock().unwrap().push(path.clone());
            let authenticated = headers.get_all(header::COOKIE).iter()
                .filter_map(|v| v.to_str().ok())
                .any(|v| v.split(';').any(|c| c.trim() == SESSION_COOKIE));
            if !authenticated {
                return StatusCode::FORBIDDEN.into_response();
            }
            if let Some(prefix) = &state.content.slow_prefix {
                if path.starts_with(prefix) {
                    tokio::time::sleep(Duration::from_secs(20)).await;
                }
            }
            if let Some(m3u8) = state.content.manifests.get(&path) {
                return ([(header::CONTENT_TYPE, "application/vnd.apple.mpegurl")], m3u8.clone()).into_response();
            }
            if let Some(html) = state.content.pages.get(&path) {
                return ([(header::CONTENT_TYPE, "text/html")], html.clone()).into_response();
            }
            if let Some(data) = state.content.segments.get(&path) {
                return Response::builder()
                    .status(StatusCode::OK)
                    .header(header::CONTENT_TYPE, "video/iso.segment")
                    .body(Body::from(data.clone()))
                    .unwrap();
            }
            StatusCode::NOT_FOUND.into_response()
        }

        let state = Arc::new(AppState { content, requests: Mutex::new(Vec::new()) });
        let app = Router::new()
            .route("/login", get(login))
            .fallback(serve)
            .with_state(Arc::clone(&state));
        let handle = Handle::new();
        let backend_handle = handle.clone();
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        tokio::spawn(async move {
            bind(addr)
                .handle(backend_handle)
                .serve(app.into_make_service())
                .await
                .unwrap()
        });
        let listening = handle.listening().await.expect("test server failed to start");
        ContentServer { base: format!("http://{listening}"), state, handle }
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base)
    }

    /// Paths requested so far, in order.
    pub fn requests(&self) -> Vec<String> {
        self.state.requests.lock().unwrap().clone()
    }

    /// A client holding the platform's session cookie.
    pub async fn session_client(&self) -> reqwest::Client {
        let client = reqwest::Client::builder()
            .cookie_store(true)
            .timeout(Duration::from_secs(10))
            .build()
            .expect("creating HTTP client");
        client.get(self.url("/login"))
            .send().await
            .expect("logging in")
            .error_for_status()
            .expect("login status");
        client
    }

    pub fn shutdown(&self) {
        self.handle.shutdown();
    }
}


/// A muxer that records its inputs and writes their concatenation to the output.
#[derive(Debug, Default)]
pub struct RecordingMuxer {
    pub calls: Mutex<Vec<(Vec<PathBuf>, PathBuf)>>,
}

impl RecordingMuxer {
    pub fn calls(&self) -> Vec<(Vec<PathBuf>, PathBuf)> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl Muxer for RecordingMuxer {
    async fn mux(&self, inputs: &[PathBuf], output: &Path, _cancel: &CancellationToken)
                 -> Result<(), LectureDlError> {
        let mut merged = Vec::new();
        for input in inputs {
            let data = tokio::fs::read(input).await
                .map_err(|e| LectureDlError::Muxing(format!("reading {}: {e}", input.display())))?;
            merged.extend_from_slice(&data);
        }
        tokio::fs::write(output, merged).await
            .map_err(|e| LectureDlError::Muxing(format!("writing {}: {e}", output.display())))?;
        self.calls.lock().unwrap().push((inputs.to_vec(), output.to_path_buf()));
        Ok(())
    }
}


/// Collects every progress event.
#[derive(Debug, Default)]
pub struct EventLog {
    pub events: Mutex<Vec<ProgressEvent>>,
}

impl ProgressObserver for EventLog {
    fn update(&self, event: &ProgressEvent) {
        self.events.lock().unwrap().push(event.clone());
    }
}


pub fn ffmpeg_available() -> bool {
    Command::new("ffmpeg")
        .arg("-version")
        .output()
        .is_ok_and(|out| out.status.success())
}

/// Names of the entries in `dir`, sorted.
pub fn dir_entries(dir: &Path) -> Vec<String> {
    let mut names: Vec<String> = std::fs::read_dir(dir)
        .map(|rd| rd.filter_map(|e| e.ok())
             .map(|e| e.file_name().to_string_lossy().into_owned())
             .collect())
        .unwrap_or_default();
    names.sort();
    names
}
