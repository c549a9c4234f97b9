use std::sync::Arc;

use anyhow::Context;
use clap::Parser;

mod assemble;
mod browser;
mod config;
mod extract;
mod fetch;
mod intercept;
mod link;
mod models;
mod pipeline;
mod server;
#[cfg(test)]
mod testing;

use browser::{locate_chrome, ChromiumLauncher};
use config::{Cli, ExtractorConfig};
use pipeline::PostExtractor;
use server::XhsMcpServer;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // stdout carries the MCP protocol; logs go to stderr.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();

    let mut config = ExtractorConfig::from_cli(Cli::parse());

    tokio::fs::create_dir_all(&config.download_dir)
        .await
        .with_context(|| {
            format!(
                "creating download directory {}",
                config.download_dir.display()
            )
        })?;

    let chrome = locate_chrome(config.chrome_path.as_deref())?;
    tracing::info!(
        chrome = %chrome.display(),
        download_dir = %config.download_dir.display(),
        "configuration loaded"
    );
    config.chrome_path = Some(chrome);

    let extractor = PostExtractor::new(config, Arc::new(ChromiumLauncher))
        .context("building HTTP client")?;
    XhsMcpServer::new(Arc::new(extractor)).run().await
}
