use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

use crate::browser::SessionOptions;
use crate::extract::DomTimeouts;
use crate::link::ResolveMode;

pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36";
const LOCALE: &str = "zh-CN";
const VIEWPORT: (u32, u32) = (1280, 800);
const CONTAINER_TIMEOUT: Duration = Duration::from_secs(5);
const DOM_QUERY_TIMEOUT: Duration = Duration::from_secs(3);

/// MCP server that extracts Xiaohongshu posts and saves their media.
#[derive(Debug, Parser)]
#[command(name = "xhs-post-extractor", version, about)]
pub struct Cli {
    /// Directory that receives downloaded videos and images
    #[arg(long = "download-folder", env = "XHS_DOWNLOAD_FOLDER")]
    pub download_folder: Option<PathBuf>,

    /// Chrome/Chromium executable to drive
    #[arg(long, env = "CHROME_PATH")]
    pub chrome_path: Option<PathBuf>,

    /// Show the browser window
    #[arg(long)]
    pub headful: bool,

    /// Return downloaded images inline as image content
    #[arg(long)]
    pub inline_images: bool,

    /// Seconds to wait for the post page to reach network idle
    #[arg(long, default_value_t = 90)]
    pub navigation_timeout_secs: u64,

    /// Only accept xhslink.com / xiaohongshu.com links, never other URLs
    #[arg(long)]
    pub strict_links: bool,

    /// Browser and downloader user agent
    #[arg(long, env = "ua")]
    pub user_agent: Option<String>,
}

/// Everything one extraction needs; built once at startup and shared.
#[derive(Debug, Clone)]
pub struct ExtractorConfig {
    pub download_dir: PathBuf,
    pub user_agent: String,
    pub chrome_path: Option<PathBuf>,
    pub headless: bool,
    pub inline_images: bool,
    pub link_mode: ResolveMode,
    pub navigation_timeout: Duration,
    pub dom_timeouts: DomTimeouts,
}

impl ExtractorConfig {
    pub fn new(download_dir: impl Into<PathBuf>) -> Self {
        Self {
            download_dir: download_dir.into(),
            user_agent: DEFAULT_USER_AGENT.to_string(),
            chrome_path: None,
            headless: true,
            inline_images: false,
            link_mode: ResolveMode::WithFallback,
            navigation_timeout: Duration::from_secs(90),
            dom_timeouts: DomTimeouts {
                container: CONTAINER_TIMEOUT,
                query: DOM_QUERY_TIMEOUT,
            },
        }
    }

    pub fn from_cli(cli: Cli) -> Self {
        let download_dir = cli.download_folder.unwrap_or_else(default_download_dir);
        Self {
            user_agent: cli
                .user_agent
                .filter(|ua| !ua.trim().is_empty())
                .unwrap_or_else(|| DEFAULT_USER_AGENT.to_string()),
            chrome_path: cli.chrome_path,
            headless: !cli.headful,
            inline_images: cli.inline_images,
            link_mode: if cli.strict_links {
                ResolveMode::Strict
            } else {
                ResolveMode::WithFallback
            },
            navigation_timeout: Duration::from_secs(cli.navigation_timeout_secs),
            ..Self::new(download_dir)
        }
    }

    pub fn session_options(&self) -> SessionOptions {
        SessionOptions {
            user_agent: self.user_agent.clone(),
            locale: LOCALE.to_string(),
            viewport: VIEWPORT,
            headless: self.headless,
            chrome_path: self.chrome_path.clone(),
            request_timeout: self.navigation_timeout,
        }
    }
}

/// `downloads/` next to the executable, or under the working directory.
fn default_download_dir() -> PathBuf {
    std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(|dir| dir.join("downloads")))
        .unwrap_or_else(|| PathBuf::from("./downloads"))
}
