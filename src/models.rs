use std::path::PathBuf;

use rmcp::schemars::{self, JsonSchema};
use serde::{Deserialize, Serialize};

/// Parameters for the `get-xhs-post` tool.
#[derive(Debug, Deserialize, Serialize, JsonSchema)]
pub struct GetXhsPostParams {
    /// The share link copied from Xiaohongshu (小红书) app or web
    #[serde(rename = "shareLink")]
    pub share_link: String,
}

#[derive(Debug, Clone, Default, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DebugInfo {
    pub video_sources_found: Vec<String>,
    pub intercepted_video_requests: Vec<String>,
    pub capture_notes: Vec<String>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ExtractedPost {
    pub success: bool,
    pub url: String,
    pub title: String,
    pub description: String,
    pub images: Vec<String>,
    pub downloaded_video_paths: Vec<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub debug_info: DebugInfo,
}

impl ExtractedPost {
    pub fn has_content(&self) -> bool {
        !self.title.is_empty()
            || !self.description.is_empty()
            || !self.images.is_empty()
            || !self.downloaded_video_paths.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum DownloadOutcome {
    Saved {
        content_type: Option<String>,
        /// Base64 copy of the bytes written to disk.
        payload: String,
    },
    Failed {
        error: String,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct DownloadedAsset {
    pub url: String,
    pub path: PathBuf,
    pub outcome: DownloadOutcome,
}

impl DownloadedAsset {
    pub fn content_type(&self) -> Option<&str> {
        match &self.outcome {
            DownloadOutcome::Saved { content_type, .. } => content_type.as_deref(),
            DownloadOutcome::Failed { .. } => None,
        }
    }

    pub fn payload(&self) -> Option<&str> {
        match &self.outcome {
            DownloadOutcome::Saved { payload, .. } => Some(payload),
            DownloadOutcome::Failed { .. } => None,
        }
    }

    pub fn error(&self) -> Option<&str> {
        match &self.outcome {
            DownloadOutcome::Saved { .. } => None,
            DownloadOutcome::Failed { error } => Some(error),
        }
    }

    /// Length of the base64 payload, zero on failure.
    pub fn encoded_len(&self) -> usize {
        self.payload().map(str::len).unwrap_or(0)
    }
}

/// One unit of tool output.
#[derive(Debug, Clone, PartialEq)]
pub enum ContentBlock {
    Text { text: String },
    Image { data: String, mime_type: String },
}

impl ContentBlock {
    pub fn text(text: impl Into<String>) -> Self {
        ContentBlock::Text { text: text.into() }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            ContentBlock::Text { text } => Some(text),
            ContentBlock::Image { .. } => None,
        }
    }
}
