use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::fetch::FileFetcher;
use crate::intercept::{is_within, url_basename};
use crate::link::is_absolute_http;
use crate::models::{ContentBlock, DownloadedAsset, ExtractedPost};

const NO_CONTENT: &str = "No content found in the post.";
const FALLBACK_IMAGE_MIME: &str = "image/webp";

#[derive(Debug, thiserror::Error)]
pub enum ShapeError {
    #[error("result has an empty url")]
    EmptyUrl,
    #[error("image url is not absolute: {0}")]
    RelativeImage(String),
    #[error("video path outside the download directory: {0}")]
    StrayVideoPath(String),
    #[error("success flag and error field disagree")]
    ErrorFlagMismatch,
}

/// Check the invariants an `ExtractedPost` must hold before it is rendered.
pub fn validate(post: &ExtractedPost, download_dir: &Path) -> Result<(), ShapeError> {
    if post.url.trim().is_empty() {
        return Err(ShapeError::EmptyUrl);
    }
    if post.success == post.error.is_some() {
        return Err(ShapeError::ErrorFlagMismatch);
    }
    if let Some(image) = post
        .images
        .iter()
        .find(|u| !is_absolute_http(u))
    {
        return Err(ShapeError::RelativeImage(image.clone()));
    }
    if let Some(path) = post
        .downloaded_video_paths
        .iter()
        .find(|p| p.as_os_str().is_empty() || !is_within(download_dir, p))
    {
        return Err(ShapeError::StrayVideoPath(path.display().to_string()));
    }
    Ok(())
}

/// Turns an extracted post into tool output, downloading images on the way.
pub struct ResultAssembler<'a> {
    fetcher: &'a FileFetcher,
    download_dir: &'a Path,
    inline_images: bool,
}

impl<'a> ResultAssembler<'a> {
    pub fn new(fetcher: &'a FileFetcher, download_dir: &'a Path, inline_images: bool) -> Self {
        Self {
            fetcher,
            download_dir,
            inline_images,
        }
    }

    pub async fn assemble(&self, post: &ExtractedPost) -> Result<Vec<ContentBlock>, ShapeError> {
        validate(post, self.download_dir)?;
        if let Ok(json) = serde_json::to_string(post) {
            debug!(result = %json, "assembling result");
        }

        let mut contents = Vec::new();
        if !post.title.is_empty() {
            contents.push(ContentBlock::text(format!("Post Title: {}", post.title)));
        }
        if !post.description.is_empty() {
            contents.push(ContentBlock::text(format!(
                "Post Description: {}",
                post.description
            )));
        }
        if !post.downloaded_video_paths.is_empty() {
            let list: String = post
                .downloaded_video_paths
                .iter()
                .map(|p| format!("\n- {}", p.display()))
                .collect();
            contents.push(ContentBlock::text(format!("Downloaded Videos: {}", list)));
        }

        // One at a time, in page order.
        for image in &post.images {
            let dest = self.image_path(image);
            let asset = self.fetcher.fetch(image, &dest).await;
            contents.push(ContentBlock::text(image_status_line(&asset)));
            if self.inline_images {
                if let Some(payload) = asset.payload() {
                    contents.push(ContentBlock::Image {
                        data: payload.to_string(),
                        mime_type: asset
                            .content_type()
                            .unwrap_or(FALLBACK_IMAGE_MIME)
                            .to_string(),
                    });
                }
            }
        }

        if !post.success {
            if let Some(error) = &post.error {
                contents.push(ContentBlock::text(format!("Navigation Error: {}", error)));
            }
        }

        if !post.has_content() {
            contents.insert(0, ContentBlock::text(NO_CONTENT));
        }

        info!(blocks = contents.len(), "result assembled");
        Ok(contents)
    }

    fn image_path(&self, url: &str) -> PathBuf {
        let name = url_basename(url)
            .unwrap_or_else(|| format!("image_{}", chrono::Utc::now().timestamp_millis()));
        self.download_dir.join(name)
    }
}

fn image_status_line(asset: &DownloadedAsset) -> String {
    let mut line = format!("image URL: {};", asset.url);
    if let Some(content_type) = asset.content_type() {
        line.push_str(&format!("Content-Type: {};", content_type));
    }
    match asset.error() {
        Some(error) => line.push_str(&format!("Error: {};", error)),
        None => line.push_str(&format!(
            "Image downloaded successfully. total size: {}; it has been saved to: {};",
            asset.encoded_len(),
            asset.path.display()
        )),
    }
    line
}
