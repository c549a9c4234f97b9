use std::sync::Arc;

use tracing::{error, info, warn};

use crate::assemble::{ResultAssembler, ShapeError};
use crate::browser::{BrowserError, BrowserLauncher, NavigationOutcome, PageSession};
use crate::config::ExtractorConfig;
use crate::extract::extract_metadata;
use crate::fetch::{FetchError, FileFetcher};
use crate::intercept::VideoInterceptor;
use crate::link::resolve_share_link;
use crate::models::{ContentBlock, DebugInfo, ExtractedPost};

const INVALID_LINK: &str = "Invalid Xiaohongshu share link";
const DIR_ERROR: &str = "Error creating download directory";

// ── Error type ───────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ExtractionError {
    #[error(transparent)]
    Browser(#[from] BrowserError),
    #[error("malformed result: {0}")]
    Shape(#[from] ShapeError),
}

// ── Extractor ────────────────────────────────────────────────────────────────

pub struct PostExtractor {
    config: ExtractorConfig,
    launcher: Arc<dyn BrowserLauncher>,
    fetcher: FileFetcher,
}

impl PostExtractor {
    pub fn new(
        config: ExtractorConfig,
        launcher: Arc<dyn BrowserLauncher>,
    ) -> Result<Self, FetchError> {
        let fetcher = FileFetcher::new(&config.user_agent)?;
        Ok(Self {
            config,
            launcher,
            fetcher,
        })
    }

    /// Handle one `get-xhs-post` call. Every failure ends up as text content.
    pub async fn get_post(&self, share_text: &str) -> Vec<ContentBlock> {
        info!(share_text, download_dir = %self.config.download_dir.display(), "received share link");

        if let Err(e) = tokio::fs::create_dir_all(&self.config.download_dir).await {
            error!("cannot create download directory: {}", e);
            return vec![ContentBlock::text(DIR_ERROR)];
        }

        let Some(post_url) = resolve_share_link(share_text, self.config.link_mode) else {
            warn!("no post URL in share text");
            return vec![ContentBlock::text(INVALID_LINK)];
        };

        match self.run(&post_url).await {
            Ok(contents) => contents,
            Err(e) => {
                error!("extraction failed: {}", e);
                vec![ContentBlock::text(format!("Get Post Error: {}", e))]
            }
        }
    }

    async fn run(&self, post_url: &str) -> Result<Vec<ContentBlock>, ExtractionError> {
        let post = self.scrape(post_url).await?;
        info!(
            videos = post.downloaded_video_paths.len(),
            images = post.images.len(),
            "finalizing result"
        );
        let assembler = ResultAssembler::new(
            &self.fetcher,
            &self.config.download_dir,
            self.config.inline_images,
        );
        Ok(assembler.assemble(&post).await?)
    }

    /// Render the page and collect everything it exposes. The browser is
    /// closed before this returns, whatever the outcome.
    pub async fn scrape(&self, post_url: &str) -> Result<ExtractedPost, ExtractionError> {
        let interceptor = Arc::new(VideoInterceptor::new(&self.config.download_dir));
        let mut session = self
            .launcher
            .launch(&self.config.session_options(), interceptor.clone())
            .await?;

        let post = self.scrape_page(session.as_mut(), post_url, &interceptor).await;

        if let Err(e) = session.close().await {
            warn!("closing browser failed: {}", e);
        }
        Ok(post)
    }

    async fn scrape_page(
        &self,
        session: &mut dyn PageSession,
        post_url: &str,
        interceptor: &VideoInterceptor,
    ) -> ExtractedPost {
        info!(url = post_url, "navigating");
        let navigation_error = match session.goto(post_url, self.config.navigation_timeout).await {
            Ok(NavigationOutcome::Settled) => None,
            Ok(NavigationOutcome::TimedOut) => {
                warn!("page did not settle; extracting from current DOM");
                None
            }
            Err(e) => {
                warn!("navigation error: {}", e);
                Some(e.to_string())
            }
        };

        let final_url = session
            .current_url()
            .await
            .filter(|u| !u.is_empty() && u != "about:blank")
            .unwrap_or_else(|| post_url.to_string());
        info!(url = %final_url, "navigation complete");

        let metadata = extract_metadata(session, self.config.dom_timeouts).await;
        let capture = interceptor.log().snapshot().await;

        if metadata.video_sources.iter().any(|src| src.contains(".mp4")) && capture.saved.is_empty() {
            warn!("mp4 source present in <video> but nothing was captured; check the route pattern");
        }

        ExtractedPost {
            success: navigation_error.is_none(),
            url: final_url,
            title: metadata.title,
            description: metadata.description,
            images: metadata.images,
            downloaded_video_paths: capture.saved,
            error: navigation_error,
            debug_info: DebugInfo {
                video_sources_found: metadata.video_sources,
                intercepted_video_requests: capture.intercepted,
                capture_notes: capture.notes,
            },
        }
    }
}
