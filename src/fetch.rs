use std::path::Path;
use std::time::Duration;

use base64::Engine;
use tracing::{debug, warn};

use crate::models::{DownloadOutcome, DownloadedAsset};

#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("Failed to fetch {url}: {status}")]
    Status {
        url: String,
        status: reqwest::StatusCode,
    },
    #[error("{0}")]
    Request(String),
    #[error("Failed to write {path}: {source}")]
    Write {
        path: String,
        source: std::io::Error,
    },
}

/// Plain HTTP downloader used for post images.
#[derive(Clone)]
pub struct FileFetcher {
    client: reqwest::Client,
}

impl FileFetcher {
    pub fn new(user_agent: &str) -> Result<Self, FetchError> {
        let client = reqwest::ClientBuilder::new()
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(60))
            .redirect(reqwest::redirect::Policy::limited(10))
            .user_agent(user_agent)
            .build()
            .map_err(|e| FetchError::Request(e.to_string()))?;
        Ok(Self { client })
    }

    /// Download `url` into `dest`. Every failure is folded into the
    /// returned asset; nothing is written unless the whole body arrived.
    pub async fn fetch(&self, url: &str, dest: &Path) -> DownloadedAsset {
        let outcome = match self.try_fetch(url, dest).await {
            Ok((content_type, payload)) => {
                debug!(url, path = %dest.display(), size = payload.len(), "saved download");
                DownloadOutcome::Saved {
                    content_type,
                    payload,
                }
            }
            Err(e) => {
                warn!(url, "download failed: {}", e);
                DownloadOutcome::Failed {
                    error: e.to_string(),
                }
            }
        };

        DownloadedAsset {
            url: url.to_string(),
            path: dest.to_path_buf(),
            outcome,
        }
    }

    async fn try_fetch(
        &self,
        url: &str,
        dest: &Path,
    ) -> Result<(Option<String>, String), FetchError> {
        let response = self.client.get(url).send().await.map_err(|e| {
            if e.is_timeout() {
                FetchError::Request(format!("TimeoutError: {}", e))
            } else if e.is_connect() {
                FetchError::Request(format!("ConnectError: {}", e))
            } else {
                FetchError::Request(format!("RequestError: {}", e))
            }
        })?;

        if !response.status().is_success() {
            return Err(FetchError::Status {
                url: url.to_string(),
                status: response.status(),
            });
        }

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string());

        let body = response
            .bytes()
            .await
            .map_err(|e| FetchError::Request(e.to_string()))?;

        tokio::fs::write(dest, &body)
            .await
            .map_err(|source| FetchError::Write {
                path: dest.display().to_string(),
                source,
            })?;

        let payload = base64::engine::general_purpose::STANDARD.encode(&body);
        Ok((content_type, payload))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn fetcher() -> FileFetcher {
        FileFetcher::new("xhs-post-extractor-test").unwrap()
    }

    #[tokio::test]
    async fn success_writes_file_and_returns_matching_payload() {
        let server = MockServer::start().await;
        let bytes: Vec<u8> = (0u8..=255).cycle().take(4096).collect();
        Mock::given(method("GET"))
            .and(path("/img/a.webp"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "image/webp")
                    .set_body_bytes(bytes.clone()),
            )
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("a.webp");
        let asset = fetcher()
            .fetch(&format!("{}/img/a.webp", server.uri()), &dest)
            .await;

        assert_eq!(asset.error(), None);
        assert_eq!(asset.content_type(), Some("image/webp"));
        let decoded = base64::engine::general_purpose::STANDARD
            .decode(asset.payload().unwrap())
            .unwrap();
        assert_eq!(decoded, bytes);
        let on_disk = std::fs::read(&dest).unwrap();
        assert_eq!(on_disk.len(), decoded.len());
        assert!(asset.encoded_len() > 0);
    }

    #[tokio::test]
    async fn error_status_yields_error_only() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404).insert_header("content-type", "text/html"))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("missing.jpg");
        let asset = fetcher()
            .fetch(&format!("{}/missing.jpg", server.uri()), &dest)
            .await;

        let error = asset.error().unwrap();
        assert!(error.contains("404"), "{error}");
        assert_eq!(asset.content_type(), None);
        assert_eq!(asset.payload(), None);
        assert_eq!(asset.encoded_len(), 0);
        assert!(!dest.exists());
    }

    #[tokio::test]
    async fn transport_failure_is_reported_not_raised() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("x.jpg");
        // Port 9 (discard) is not listening on loopback.
        let asset = fetcher().fetch("http://127.0.0.1:9/x.jpg", &dest).await;

        assert!(asset.error().is_some());
        assert_eq!(asset.payload(), None);
        assert!(!dest.exists());
    }

    #[tokio::test]
    async fn unwritable_destination_is_an_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![1u8, 2, 3]))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("no-such-dir").join("x.jpg");
        let asset = fetcher().fetch(&server.uri(), &dest).await;

        assert!(asset.error().unwrap().starts_with("Failed to write"));
        assert_eq!(asset.payload(), None);
    }
}
