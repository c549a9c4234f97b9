//! Video capture on top of a pass-through network route.
//!
//! Every matching request is fetched exactly once through the route, the
//! response is optionally written to disk, and the very same response is
//! handed back to the page. Persistence never influences what the page
//! receives.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use url::Url;

// ── Constants ────────────────────────────────────────────────────────────────

pub const VIDEO_URL_PATTERN: &str = r"https://sns-bak-v\d+\.xhscdn\.com/.*\.mp4";
const VIDEO_EXTENSION: &str = ".mp4";
const VIDEO_MEDIA_PREFIX: &str = "video/";

static VIDEO_URL_RE: Lazy<Regex> = Lazy::new(|| Regex::new(VIDEO_URL_PATTERN).unwrap());

static STAGING_SEQ: AtomicU64 = AtomicU64::new(0);

// ── Route abstraction ────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum RouteError {
    #[error("upstream request failed: {0}")]
    Upstream(String),
    #[error("protocol error: {0}")]
    Protocol(String),
}

/// Response obtained through an intercepted route.
#[derive(Debug, Clone, PartialEq)]
pub struct RouteResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl RouteResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Lower-cased `content-type` header, if declared.
    pub fn content_type(&self) -> Option<String> {
        self.headers
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case("content-type"))
            .map(|(_, value)| value.to_lowercase())
    }
}

/// A paused network request. Implementations must resolve the request with
/// exactly one of `fulfill` or `abort`.
#[async_trait]
pub trait InterceptedRoute: Send {
    fn url(&self) -> &str;

    /// Forward the request upstream through the interception layer.
    async fn fetch(&mut self) -> Result<RouteResponse, RouteError>;

    async fn fulfill(&mut self, response: RouteResponse) -> Result<(), RouteError>;

    async fn abort(&mut self) -> Result<(), RouteError>;
}

// ── Capture bookkeeping ──────────────────────────────────────────────────────

/// Append-only diagnostics shared by concurrent route invocations.
#[derive(Debug, Default)]
pub struct CaptureLog {
    intercepted: Mutex<Vec<String>>,
    saved: Mutex<Vec<PathBuf>>,
    notes: Mutex<Vec<String>>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CaptureSnapshot {
    pub intercepted: Vec<String>,
    pub saved: Vec<PathBuf>,
    pub notes: Vec<String>,
}

impl CaptureLog {
    async fn record_request(&self, url: &str) {
        self.intercepted.lock().await.push(url.to_string());
    }

    async fn record_saved(&self, path: PathBuf) {
        let mut saved = self.saved.lock().await;
        if !saved.contains(&path) {
            saved.push(path);
        }
    }

    async fn note(&self, note: String) {
        self.notes.lock().await.push(note);
    }

    pub async fn snapshot(&self) -> CaptureSnapshot {
        CaptureSnapshot {
            intercepted: self.intercepted.lock().await.clone(),
            saved: self.saved.lock().await.clone(),
            notes: self.notes.lock().await.clone(),
        }
    }
}

/// What happened to a route; the page side only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteOutcome {
    Fulfilled,
    Aborted,
}

#[derive(Debug, Clone, PartialEq)]
enum Persisted {
    Saved(PathBuf),
    Skipped { status: u16, content_type: Option<String> },
    EmptyBody,
    WriteFailed(String),
}

// ── Interceptor ──────────────────────────────────────────────────────────────

pub struct VideoInterceptor {
    download_dir: PathBuf,
    log: CaptureLog,
}

impl VideoInterceptor {
    pub fn new(download_dir: impl Into<PathBuf>) -> Self {
        Self {
            download_dir: download_dir.into(),
            log: CaptureLog::default(),
        }
    }

    pub fn matches(url: &str) -> bool {
        VIDEO_URL_RE.is_match(url)
    }

    pub fn log(&self) -> &CaptureLog {
        &self.log
    }

    /// Relay one matched request, saving the body when it is a video.
    pub async fn handle<R: InterceptedRoute + ?Sized>(&self, route: &mut R) -> RouteOutcome {
        let url = route.url().to_string();
        debug!(url = %url, "intercepted video request");
        self.log.record_request(&url).await;

        let response = match route.fetch().await {
            Ok(response) => response,
            Err(e) => {
                warn!(url = %url, "route fetch failed, aborting: {}", e);
                self.log.note(format!("aborted {}: {}", url, e)).await;
                if let Err(e) = route.abort().await {
                    warn!(url = %url, "abort failed: {}", e);
                }
                return RouteOutcome::Aborted;
            }
        };

        match self.persist(&url, &response).await {
            Persisted::Saved(path) => {
                info!(url = %url, path = %path.display(), "saved video");
                self.log
                    .note(format!("saved {} -> {}", url, path.display()))
                    .await;
                self.log.record_saved(path).await;
            }
            Persisted::Skipped {
                status,
                content_type,
            } => {
                debug!(url = %url, status, ?content_type, "skipping body");
                self.log
                    .note(format!(
                        "skipped {} (status {}, content-type {})",
                        url,
                        status,
                        content_type.as_deref().unwrap_or("none")
                    ))
                    .await;
            }
            Persisted::EmptyBody => {
                warn!(url = %url, "response body is empty");
                self.log.note(format!("empty body for {}", url)).await;
            }
            Persisted::WriteFailed(e) => {
                warn!(url = %url, "could not save video: {}", e);
                self.log.note(format!("write failed for {}: {}", url, e)).await;
            }
        }

        if let Err(e) = route.fulfill(response).await {
            warn!(url = %url, "fulfill failed: {}", e);
            self.log.note(format!("fulfill failed for {}: {}", url, e)).await;
        }
        RouteOutcome::Fulfilled
    }

    async fn persist(&self, url: &str, response: &RouteResponse) -> Persisted {
        let content_type = response.content_type();
        let is_video = content_type
            .as_deref()
            .map(|ct| ct.starts_with(VIDEO_MEDIA_PREFIX))
            .unwrap_or(false);
        if !response.is_success() || !is_video {
            return Persisted::Skipped {
                status: response.status,
                content_type,
            };
        }
        if response.body.is_empty() {
            return Persisted::EmptyBody;
        }

        // Range requests for one video share a file name; each writer stages
        // its own copy and the rename makes the final file whole.
        let path = self.download_dir.join(video_file_name(url));
        let staging = staging_path(&path);
        let written = match tokio::fs::write(&staging, &response.body).await {
            Ok(()) => tokio::fs::rename(&staging, &path).await,
            Err(e) => Err(e),
        };
        match written {
            Ok(()) => Persisted::Saved(path),
            Err(e) => {
                let _ = tokio::fs::remove_file(&staging).await;
                Persisted::WriteFailed(e.to_string())
            }
        }
    }
}

/// Base name of the URL path, suffixed with a timestamp when it does not
/// already carry the video extension.
pub fn video_file_name(url: &str) -> String {
    let base = url_basename(url).unwrap_or_else(|| "video".to_string());
    if base.ends_with(VIDEO_EXTENSION) {
        base
    } else {
        format!(
            "{}_{}{}",
            base,
            chrono::Utc::now().timestamp_millis(),
            VIDEO_EXTENSION
        )
    }
}

fn staging_path(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let seq = STAGING_SEQ.fetch_add(1, Ordering::Relaxed);
    path.with_file_name(format!(".{}.{}.part", name, seq))
}

/// Last non-empty path segment of `url`, made safe for use as a file name.
pub(crate) fn url_basename(url: &str) -> Option<String> {
    Url::parse(url)
        .ok()
        .and_then(|u| {
            u.path_segments()
                .and_then(|segments| segments.filter(|s| !s.is_empty()).last().map(String::from))
        })
        .map(|segment| sanitize_file_name(&segment))
        .filter(|s| !s.is_empty())
}

pub(crate) fn sanitize_file_name(name: &str) -> String {
    name.chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect::<String>()
        .trim_matches('.')
        .to_string()
}

pub fn is_within(dir: &Path, path: &Path) -> bool {
    path.starts_with(dir)
}
