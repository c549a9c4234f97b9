//! Headless Chromium sessions driven over CDP.
//!
//! One browser process and one page per extraction. The video route is
//! armed on the page before it is handed to the caller, so every request
//! the navigation issues is already observed.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use chromiumoxide::cdp::browser_protocol::emulation::SetLocaleOverrideParams;
use chromiumoxide::cdp::browser_protocol::fetch::{
    ContinueRequestParams, EnableParams, EventRequestPaused, FailRequestParams,
    FulfillRequestParams, GetResponseBodyParams, HeaderEntry, RequestPattern, RequestStage,
};
use chromiumoxide::cdp::browser_protocol::network::{ErrorReason, SetUserAgentOverrideParams};
use chromiumoxide::cdp::browser_protocol::page::{EventLifecycleEvent, NavigateParams};
use chromiumoxide::handler::viewport::Viewport;
use chromiumoxide::{Browser, BrowserConfig, Page};
use futures::StreamExt;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::intercept::{InterceptedRoute, RouteError, RouteResponse, VideoInterceptor};

// ── Constants ────────────────────────────────────────────────────────────────

/// Glob handed to the Fetch domain; the interceptor's regex narrows it.
const CDN_ROUTE_GLOB: &str = "*xhscdn.com*";
const NETWORK_IDLE_EVENT: &str = "networkIdle";
const CLOSE_TIMEOUT: Duration = Duration::from_secs(10);
const EXIT_TIMEOUT: Duration = Duration::from_secs(5);

const CHROME_PATHS: &[&str] = &[
    "/usr/bin/google-chrome",
    "/usr/bin/google-chrome-stable",
    "/usr/bin/chromium",
    "/usr/bin/chromium-browser",
    "/snap/bin/chromium",
    "/Applications/Google Chrome.app/Contents/MacOS/Google Chrome",
    "/Applications/Chromium.app/Contents/MacOS/Chromium",
    "/opt/google/chrome/google-chrome",
];

const CHROME_BINARIES: &[&str] = &[
    "google-chrome",
    "google-chrome-stable",
    "chromium",
    "chromium-browser",
];

// ── Error type ───────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum BrowserError {
    #[error("failed to launch browser: {0}")]
    Launch(String),
    #[error("navigation failed: {0}")]
    Navigation(String),
    #[error("timed out {0}")]
    Timeout(String),
    #[error("browser protocol error: {0}")]
    Cdp(String),
    #[error("Chrome/Chromium not found; install it or pass --chrome-path")]
    ChromeNotFound,
}

impl From<chromiumoxide::error::CdpError> for BrowserError {
    fn from(e: chromiumoxide::error::CdpError) -> Self {
        BrowserError::Cdp(e.to_string())
    }
}

// ── Session seam ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub user_agent: String,
    pub locale: String,
    pub viewport: (u32, u32),
    pub headless: bool,
    pub chrome_path: Option<PathBuf>,
    pub request_timeout: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NavigationOutcome {
    /// The page reported network-idle.
    Settled,
    /// The deadline passed first; the DOM is used as-is.
    TimedOut,
}

#[async_trait]
pub trait PageSession: Send {
    async fn goto(&mut self, url: &str, timeout: Duration) -> Result<NavigationOutcome, BrowserError>;

    async fn wait_for_selector(&mut self, selector: &str, timeout: Duration) -> Result<(), BrowserError>;

    async fn current_url(&mut self) -> Option<String>;

    /// Serialized DOM of the current document.
    async fn html(&mut self, timeout: Duration) -> Result<String, BrowserError>;

    /// Terminate the browser process. Safe to call more than once.
    async fn close(&mut self) -> Result<(), BrowserError>;
}

#[async_trait]
pub trait BrowserLauncher: Send + Sync {
    async fn launch(
        &self,
        options: &SessionOptions,
        interceptor: Arc<VideoInterceptor>,
    ) -> Result<Box<dyn PageSession>, BrowserError>;
}

// ── Chromium implementation ──────────────────────────────────────────────────

/// Find a Chromium binary: the explicit path, well-known locations, then `PATH`.
pub fn locate_chrome(explicit: Option<&Path>) -> Result<PathBuf, BrowserError> {
    if let Some(path) = explicit {
        return if path.exists() {
            Ok(path.to_path_buf())
        } else {
            Err(BrowserError::ChromeNotFound)
        };
    }

    if let Some(found) = CHROME_PATHS.iter().map(Path::new).find(|p| p.exists()) {
        return Ok(found.to_path_buf());
    }

    let search_path = std::env::var_os("PATH").unwrap_or_default();
    std::env::split_paths(&search_path)
        .flat_map(|dir| CHROME_BINARIES.iter().map(move |bin| dir.join(bin)))
        .find(|candidate| candidate.is_file())
        .ok_or(BrowserError::ChromeNotFound)
}

pub struct ChromiumLauncher;

#[async_trait]
impl BrowserLauncher for ChromiumLauncher {
    async fn launch(
        &self,
        options: &SessionOptions,
        interceptor: Arc<VideoInterceptor>,
    ) -> Result<Box<dyn PageSession>, BrowserError> {
        let (width, height) = options.viewport;
        let mut builder = BrowserConfig::builder()
            .window_size(width, height)
            .viewport(Viewport {
                width,
                height,
                ..Viewport::default()
            })
            .request_timeout(options.request_timeout)
            .no_sandbox()
            .arg(format!("--lang={}", options.locale))
            .arg(format!("--user-agent={}", options.user_agent))
            .arg("--disable-dev-shm-usage")
            .arg("--no-first-run")
            .arg("--no-default-browser-check")
            .arg("--mute-audio");

        if !options.headless {
            builder = builder.with_head();
        }
        if let Some(ref chrome_path) = options.chrome_path {
            builder = builder.chrome_executable(chrome_path);
        }

        let config = builder.build().map_err(BrowserError::Launch)?;

        info!(headless = options.headless, "launching browser");
        let (browser, mut handler) = Browser::launch(config)
            .await
            .map_err(|e| BrowserError::Launch(e.to_string()))?;

        let handler_task = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if let Err(e) = event {
                    debug!("browser handler error: {}", e);
                }
            }
        });

        let mut session = ChromiumSession {
            browser,
            page: None,
            handler_task,
            route_task: None,
        };

        // Hand the session back only once it is fully armed; tear it down
        // ourselves otherwise so the process cannot leak.
        match session.prepare(options, interceptor).await {
            Ok(()) => Ok(Box::new(session)),
            Err(e) => {
                if let Err(close_err) = session.close().await {
                    warn!("closing half-initialized browser failed: {}", close_err);
                }
                Err(e)
            }
        }
    }
}

struct ChromiumSession {
    browser: Browser,
    page: Option<Page>,
    handler_task: JoinHandle<()>,
    route_task: Option<JoinHandle<()>>,
}

impl ChromiumSession {
    async fn prepare(
        &mut self,
        options: &SessionOptions,
        interceptor: Arc<VideoInterceptor>,
    ) -> Result<(), BrowserError> {
        let page = self.browser.new_page("about:blank").await?;

        let ua_override = SetUserAgentOverrideParams::builder()
            .user_agent(options.user_agent.clone())
            .accept_language(options.locale.clone())
            .build()
            .map_err(BrowserError::Cdp)?;
        page.execute(ua_override).await?;
        page.execute(SetLocaleOverrideParams {
            locale: Some(options.locale.clone()),
        })
        .await?;

        self.route_task = Some(arm_video_route(&page, interceptor).await?);
        self.page = Some(page);
        Ok(())
    }

    fn page(&self) -> Result<&Page, BrowserError> {
        self.page
            .as_ref()
            .ok_or_else(|| BrowserError::Cdp("page is not open".to_string()))
    }
}

#[async_trait]
impl PageSession for ChromiumSession {
    async fn goto(&mut self, url: &str, timeout: Duration) -> Result<NavigationOutcome, BrowserError> {
        let page = self.page()?;
        let mut lifecycle = page.event_listener::<EventLifecycleEvent>().await?;

        let navigation = async {
            let started = page
                .execute(NavigateParams::new(url))
                .await
                .map_err(|e| BrowserError::Navigation(e.to_string()))?
                .result;
            if let Some(error) = started.error_text.filter(|e| !e.is_empty()) {
                return Err(BrowserError::Navigation(error));
            }
            let target = NavigationTarget {
                frame_id: String::from(started.frame_id),
                loader_id: started.loader_id.map(String::from),
            };
            debug!(frame = %target.frame_id, loader = ?target.loader_id, "navigation started");

            while let Some(event) = lifecycle.next().await {
                if target.settled_by(&event.name, event.frame_id.as_ref(), event.loader_id.as_ref()) {
                    break;
                }
            }
            Ok::<_, BrowserError>(())
        };

        match tokio::time::timeout(timeout, navigation).await {
            Ok(Ok(())) => Ok(NavigationOutcome::Settled),
            Ok(Err(e)) => Err(e),
            Err(_) => {
                warn!(url, "navigation did not reach network idle within {:?}", timeout);
                Ok(NavigationOutcome::TimedOut)
            }
        }
    }

    async fn wait_for_selector(&mut self, selector: &str, timeout: Duration) -> Result<(), BrowserError> {
        let page = self.page()?;
        let poll = async {
            loop {
                if page.find_element(selector).await.is_ok() {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        };
        tokio::time::timeout(timeout, poll)
            .await
            .map_err(|_| BrowserError::Timeout(format!("waiting for {}", selector)))
    }

    async fn current_url(&mut self) -> Option<String> {
        let page = self.page().ok()?;
        page.url().await.ok().flatten()
    }

    async fn html(&mut self, timeout: Duration) -> Result<String, BrowserError> {
        let page = self.page()?;
        match tokio::time::timeout(timeout, page.content()).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(BrowserError::Timeout("reading page content".to_string())),
        }
    }

    async fn close(&mut self) -> Result<(), BrowserError> {
        if let Some(task) = self.route_task.take() {
            task.abort();
        }
        self.page = None;
        let closed = shutdown(&mut self.browser, CLOSE_TIMEOUT, EXIT_TIMEOUT).await;
        self.handler_task.abort();
        info!("browser closed");
        closed
    }
}

/// Main-frame document load started by one `goto`. Lifecycle events from
/// iframes or from the previous document (`about:blank`) do not count.
#[derive(Debug, Clone, PartialEq, Eq)]
struct NavigationTarget {
    frame_id: String,
    /// Absent for same-document navigations.
    loader_id: Option<String>,
}

impl NavigationTarget {
    fn settled_by(&self, name: &str, frame_id: &str, loader_id: &str) -> bool {
        name == NETWORK_IDLE_EVENT
            && frame_id == self.frame_id
            && self.loader_id.as_deref().map_or(true, |own| own == loader_id)
    }
}

// ── Teardown ─────────────────────────────────────────────────────────────────

#[async_trait]
trait BrowserProcess: Send {
    /// Ask the browser to exit over the protocol.
    async fn close(&mut self) -> Result<(), BrowserError>;

    async fn kill(&mut self) -> Result<(), BrowserError>;

    async fn wait(&mut self) -> Result<(), BrowserError>;
}

#[async_trait]
impl BrowserProcess for Browser {
    async fn close(&mut self) -> Result<(), BrowserError> {
        Browser::close(self).await.map(|_| ()).map_err(BrowserError::from)
    }

    async fn kill(&mut self) -> Result<(), BrowserError> {
        match Browser::kill(self).await {
            Some(Err(e)) => Err(BrowserError::Cdp(format!("kill failed: {}", e))),
            _ => Ok(()),
        }
    }

    async fn wait(&mut self) -> Result<(), BrowserError> {
        Browser::wait(self)
            .await
            .map(|_| ())
            .map_err(|e| BrowserError::Cdp(e.to_string()))
    }
}

/// Close gracefully within `close_timeout`, otherwise kill. The exit wait is
/// bounded too, so a wedged process never blocks the caller.
async fn shutdown<P: BrowserProcess + ?Sized>(
    process: &mut P,
    close_timeout: Duration,
    exit_timeout: Duration,
) -> Result<(), BrowserError> {
    let closed = match tokio::time::timeout(close_timeout, process.close()).await {
        Ok(result) => result,
        Err(_) => Err(BrowserError::Timeout("closing browser".to_string())),
    };
    if let Err(e) = &closed {
        warn!("graceful close failed, killing browser: {}", e);
        if let Err(e) = process.kill().await {
            warn!("{}", e);
        }
    }

    match tokio::time::timeout(exit_timeout, process.wait()).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!("waiting for browser exit failed: {}", e),
        Err(_) => {
            warn!("browser still running after {:?}, killing", exit_timeout);
            if let Err(e) = process.kill().await {
                warn!("{}", e);
            }
        }
    }
    closed
}

// ── Fetch-domain routing ─────────────────────────────────────────────────────

/// Pause CDN responses and dispatch each one on its own task.
async fn arm_video_route(
    page: &Page,
    interceptor: Arc<VideoInterceptor>,
) -> Result<JoinHandle<()>, BrowserError> {
    let mut paused = page.event_listener::<EventRequestPaused>().await?;
    page.execute(EnableParams {
        patterns: Some(vec![RequestPattern {
            url_pattern: Some(CDN_ROUTE_GLOB.to_string()),
            resource_type: None,
            request_stage: Some(RequestStage::Response),
        }]),
        handle_auth_requests: None,
    })
    .await?;
    debug!(pattern = crate::intercept::VIDEO_URL_PATTERN, "video route armed");

    let page = page.clone();
    Ok(tokio::spawn(async move {
        while let Some(event) = paused.next().await {
            let page = page.clone();
            let interceptor = interceptor.clone();
            tokio::spawn(async move {
                if VideoInterceptor::matches(&event.request.url) {
                    let mut route = CdpRoute { page, event };
                    interceptor.handle(&mut route).await;
                } else if let Err(e) = page
                    .execute(ContinueRequestParams::new(event.request_id.clone()))
                    .await
                {
                    debug!(url = %event.request.url, "continue failed: {}", e);
                }
            });
        }
    }))
}

/// A response-stage pause from the Fetch domain.
struct CdpRoute {
    page: Page,
    event: Arc<EventRequestPaused>,
}

#[async_trait]
impl InterceptedRoute for CdpRoute {
    fn url(&self) -> &str {
        &self.event.request.url
    }

    async fn fetch(&mut self) -> Result<RouteResponse, RouteError> {
        if let Some(reason) = &self.event.response_error_reason {
            return Err(RouteError::Upstream(format!("{:?}", reason)));
        }
        let status = self
            .event
            .response_status_code
            .ok_or_else(|| RouteError::Protocol("paused without a response".to_string()))?;
        let headers = self
            .event
            .response_headers
            .iter()
            .flatten()
            .map(|h| (h.name.clone(), h.value.clone()))
            .collect();

        // Redirects carry no body to read.
        let body = if (300..400).contains(&status) {
            Vec::new()
        } else {
            let returns = self
                .page
                .execute(GetResponseBodyParams::new(self.event.request_id.clone()))
                .await
                .map_err(|e| RouteError::Protocol(e.to_string()))?
                .result;
            if returns.base64_encoded {
                base64::engine::general_purpose::STANDARD
                    .decode(returns.body.as_bytes())
                    .map_err(|e| RouteError::Protocol(e.to_string()))?
            } else {
                returns.body.into_bytes()
            }
        };

        Ok(RouteResponse {
            status: status as u16,
            headers,
            body,
        })
    }

    async fn fulfill(&mut self, response: RouteResponse) -> Result<(), RouteError> {
        // The body handed over is already decoded and complete.
        let headers: Vec<HeaderEntry> = response
            .headers
            .iter()
            .filter(|(name, _)| {
                !name.eq_ignore_ascii_case("content-encoding")
                    && !name.eq_ignore_ascii_case("content-length")
            })
            .map(|(name, value)| HeaderEntry::new(name.clone(), value.clone()))
            .collect();
        let params = FulfillRequestParams::builder()
            .request_id(self.event.request_id.clone())
            .response_code(i64::from(response.status))
            .response_headers(headers)
            .body(base64::engine::general_purpose::STANDARD.encode(&response.body))
            .build()
            .map_err(RouteError::Protocol)?;
        self.page
            .execute(params)
            .await
            .map(|_| ())
            .map_err(|e| RouteError::Protocol(e.to_string()))
    }

    async fn abort(&mut self) -> Result<(), RouteError> {
        self.page
            .execute(FailRequestParams::new(
                self.event.request_id.clone(),
                ErrorReason::Failed,
            ))
            .await
            .map(|_| ())
            .map_err(|e| RouteError::Protocol(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A browser process that stops answering until it is killed.
    #[derive(Default)]
    struct StubProcess {
        wedged: bool,
        kills: usize,
    }

    #[async_trait]
    impl BrowserProcess for StubProcess {
        async fn close(&mut self) -> Result<(), BrowserError> {
            if self.wedged {
                std::future::pending::<()>().await;
            }
            Ok(())
        }

        async fn kill(&mut self) -> Result<(), BrowserError> {
            self.kills += 1;
            Ok(())
        }

        async fn wait(&mut self) -> Result<(), BrowserError> {
            if self.wedged && self.kills == 0 {
                std::future::pending::<()>().await;
            }
            Ok(())
        }
    }

    const SHORT: Duration = Duration::from_millis(50);

    #[tokio::test]
    async fn wedged_browser_is_killed_and_shutdown_returns() {
        let mut process = StubProcess {
            wedged: true,
            ..StubProcess::default()
        };

        let result = tokio::time::timeout(
            Duration::from_secs(5),
            shutdown(&mut process, SHORT, SHORT),
        )
        .await
        .expect("shutdown must not hang");

        assert!(matches!(result, Err(BrowserError::Timeout(_))));
        assert_eq!(process.kills, 1);
    }

    #[tokio::test]
    async fn responsive_browser_is_not_killed() {
        let mut process = StubProcess::default();
        shutdown(&mut process, SHORT, SHORT).await.unwrap();
        assert_eq!(process.kills, 0);
    }

    #[test]
    fn only_the_navigated_document_settles() {
        let target = NavigationTarget {
            frame_id: "MAIN".to_string(),
            loader_id: Some("L2".to_string()),
        };

        assert!(target.settled_by("networkIdle", "MAIN", "L2"));
        // Late idle from about:blank.
        assert!(!target.settled_by("networkIdle", "MAIN", "L1"));
        // Iframe.
        assert!(!target.settled_by("networkIdle", "CHILD", "L2"));
        assert!(!target.settled_by("load", "MAIN", "L2"));

        let same_document = NavigationTarget {
            frame_id: "MAIN".to_string(),
            loader_id: None,
        };
        assert!(same_document.settled_by("networkIdle", "MAIN", "L1"));
    }

    #[test]
    fn explicit_chrome_path_must_exist() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("chrome");
        assert!(matches!(
            locate_chrome(Some(&missing)),
            Err(BrowserError::ChromeNotFound)
        ));

        std::fs::write(&missing, b"").unwrap();
        assert_eq!(locate_chrome(Some(&missing)).unwrap(), missing);
    }
}
