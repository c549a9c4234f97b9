//! Test doubles for the browser and route seams.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use crate::browser::{BrowserError, BrowserLauncher, NavigationOutcome, PageSession, SessionOptions};
use crate::intercept::{InterceptedRoute, RouteError, RouteResponse, VideoInterceptor};

// ── Routes ───────────────────────────────────────────────────────────────────

pub struct FakeRoute {
    url: String,
    response: Option<RouteResponse>,
    pub fetch_calls: usize,
    pub fulfilled: Option<RouteResponse>,
    pub aborted: bool,
}

impl FakeRoute {
    pub fn response(status: u16, content_type: &str, body: Vec<u8>) -> RouteResponse {
        RouteResponse {
            status,
            headers: vec![("content-type".to_string(), content_type.to_string())],
            body,
        }
    }

    pub fn ok(url: &str, response: RouteResponse) -> Self {
        Self {
            url: url.to_string(),
            response: Some(response),
            fetch_calls: 0,
            fulfilled: None,
            aborted: false,
        }
    }

    pub fn failing(url: &str) -> Self {
        Self {
            url: url.to_string(),
            response: None,
            fetch_calls: 0,
            fulfilled: None,
            aborted: false,
        }
    }
}

#[async_trait]
impl InterceptedRoute for FakeRoute {
    fn url(&self) -> &str {
        &self.url
    }

    async fn fetch(&mut self) -> Result<RouteResponse, RouteError> {
        self.fetch_calls += 1;
        self.response
            .clone()
            .ok_or_else(|| RouteError::Upstream("net::ERR_CONNECTION_RESET".to_string()))
    }

    async fn fulfill(&mut self, response: RouteResponse) -> Result<(), RouteError> {
        self.fulfilled = Some(response);
        Ok(())
    }

    async fn abort(&mut self) -> Result<(), RouteError> {
        self.aborted = true;
        Ok(())
    }
}

// ── Browser ──────────────────────────────────────────────────────────────────

/// Scripted page behaviour for [`FakeLauncher`].
#[derive(Clone, Default)]
pub struct PageScript {
    pub html: String,
    pub final_url: Option<String>,
    pub navigation_error: Option<String>,
    /// `goto` gives up waiting for network idle.
    pub timed_out: bool,
    pub snapshot_error: bool,
    /// Routes replayed through the interceptor during `goto`.
    pub routes: Vec<(String, RouteResponse)>,
}

#[derive(Default)]
pub struct LaunchCounters {
    pub launches: AtomicUsize,
    pub closes: AtomicUsize,
    pub last_user_agent: Mutex<Option<String>>,
}

pub struct FakeLauncher {
    script: PageScript,
    fail_launch: bool,
    pub counters: Arc<LaunchCounters>,
}

impl FakeLauncher {
    pub fn new(script: PageScript) -> Self {
        Self {
            script,
            fail_launch: false,
            counters: Arc::new(LaunchCounters::default()),
        }
    }

    pub fn failing() -> Self {
        Self {
            fail_launch: true,
            ..Self::new(PageScript::default())
        }
    }

    pub fn launches(&self) -> usize {
        self.counters.launches.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> usize {
        self.counters.closes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BrowserLauncher for FakeLauncher {
    async fn launch(
        &self,
        options: &SessionOptions,
        interceptor: Arc<VideoInterceptor>,
    ) -> Result<Box<dyn PageSession>, BrowserError> {
        self.counters.launches.fetch_add(1, Ordering::SeqCst);
        *self.counters.last_user_agent.lock().unwrap() = Some(options.user_agent.clone());
        if self.fail_launch {
            return Err(BrowserError::Launch("no chromium in test".to_string()));
        }
        Ok(Box::new(FakeSession {
            script: self.script.clone(),
            interceptor,
            counters: self.counters.clone(),
            visited: None,
            closed: AtomicBool::new(false),
        }))
    }
}

pub struct FakeSession {
    script: PageScript,
    interceptor: Arc<VideoInterceptor>,
    counters: Arc<LaunchCounters>,
    visited: Option<String>,
    closed: AtomicBool,
}

#[async_trait]
impl PageSession for FakeSession {
    async fn goto(&mut self, url: &str, _timeout: Duration) -> Result<NavigationOutcome, BrowserError> {
        self.visited = Some(url.to_string());
        for (route_url, response) in &self.script.routes {
            if VideoInterceptor::matches(route_url) {
                let mut route = FakeRoute::ok(route_url, response.clone());
                self.interceptor.handle(&mut route).await;
            }
        }
        match &self.script.navigation_error {
            Some(e) => Err(BrowserError::Navigation(e.clone())),
            None if self.script.timed_out => Ok(NavigationOutcome::TimedOut),
            None => Ok(NavigationOutcome::Settled),
        }
    }

    async fn wait_for_selector(&mut self, selector: &str, _timeout: Duration) -> Result<(), BrowserError> {
        let document = scraper::Html::parse_document(&self.script.html);
        let parsed = scraper::Selector::parse(selector)
            .map_err(|e| BrowserError::Cdp(e.to_string()))?;
        if document.select(&parsed).next().is_some() {
            Ok(())
        } else {
            Err(BrowserError::Timeout(format!("waiting for {}", selector)))
        }
    }

    async fn current_url(&mut self) -> Option<String> {
        self.script.final_url.clone().or_else(|| self.visited.clone())
    }

    async fn html(&mut self, _timeout: Duration) -> Result<String, BrowserError> {
        if self.script.snapshot_error {
            return Err(BrowserError::Cdp("target crashed".to_string()));
        }
        Ok(self.script.html.clone())
    }

    async fn close(&mut self) -> Result<(), BrowserError> {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.counters.closes.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }
}
