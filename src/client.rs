use std::path::Path;
use std::time::Duration;

use base64::Engine;
use url::Url;

use crate::api::IDEMPOTENCY_KEY;
use crate::job::JobState;
use crate::models::{ErrorBody, ImagePayload, StatusResponse, UploadAccepted, UploadRequest};

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("invalid server URL: {0}")]
    InvalidUrl(String),
    #[error("server rejected request ({status}): {message}")]
    Rejected { status: u16, message: String },
    #[error("job {request_id} failed: {reason}")]
    JobFailed { request_id: String, reason: String },
    #[error("job {0} did not finish in time")]
    TimedOut(String),
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
}

pub struct WorkerClient {
    http: reqwest::Client,
    base: Url,
}

impl WorkerClient {
    pub fn new(base_url: &str) -> Result<Self, ClientError> {
        let mut base =
            Url::parse(base_url).map_err(|e| ClientError::InvalidUrl(e.to_string()))?;
        if !matches!(base.scheme(), "http" | "https") {
            return Err(ClientError::InvalidUrl(
                "Only http and https URLs are allowed".to_string(),
            ));
        }
        // Endpoints are joined relative to the base, keeping any path prefix.
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }
        let http = reqwest::ClientBuilder::new()
            .connect_timeout(Duration::from_secs(5))
            .timeout(Duration::from_secs(60))
            .build()?;
        Ok(Self { http, base })
    }

    fn endpoint(&self, path: &str) -> Result<Url, ClientError> {
        self.base
            .join(path)
            .map_err(|e| ClientError::InvalidUrl(e.to_string()))
    }

    pub async fn submit(
        &self,
        image: &[u8],
        mime_type: &str,
        style_id: &str,
        user_id: &str,
        idempotency_key: Option<&str>,
    ) -> Result<UploadAccepted, ClientError> {
        let body = UploadRequest {
            image: Some(ImagePayload {
                data: Some(base64::engine::general_purpose::STANDARD.encode(image)),
                mime_type: Some(mime_type.to_string()),
            }),
            style_id: Some(style_id.to_string()),
            user_id: Some(user_id.to_string()),
        };

        let mut request = self.http.post(self.endpoint("v1/new")?).json(&body);
        if let Some(key) = idempotency_key {
            request = request.header(IDEMPOTENCY_KEY, key);
        }
        let response = request.send().await?;
        if response.status().as_u16() != 202 {
            return Err(rejection(response).await);
        }
        Ok(response.json().await?)
    }

    pub async fn status(&self, request_id: &str) -> Result<StatusResponse, ClientError> {
        let url = self.endpoint(&format!("v1/status/{}", request_id))?;
        let response = self.http.get(url).send().await?;
        if !response.status().is_success() {
            return Err(rejection(response).await);
        }
        Ok(response.json().await?)
    }

    pub async fn result(&self, request_id: &str) -> Result<Vec<u8>, ClientError> {
        let url = self.endpoint(&format!("v1/result/{}", request_id))?;
        let response = self.http.get(url).send().await?;
        if !response.status().is_success() {
            return Err(rejection(response).await);
        }
        Ok(response.bytes().await?.to_vec())
    }

    /// Polls until the job completes, fails, or `timeout` elapses.
    pub async fn wait(
        &self,
        request_id: &str,
        interval: Duration,
        timeout: Duration,
    ) -> Result<StatusResponse, ClientError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let status = self.status(request_id).await?;
            tracing::debug!("request {} is {}", request_id, status.status);
            match status.status {
                JobState::Completed => return Ok(status),
                JobState::Failed => {
                    return Err(ClientError::JobFailed {
                        request_id: request_id.to_string(),
                        reason: status.error.unwrap_or_else(|| "unknown error".to_string()),
                    })
                }
                _ => {}
            }
            if tokio::time::Instant::now() + interval > deadline {
                return Err(ClientError::TimedOut(request_id.to_string()));
            }
            tokio::time::sleep(interval).await;
        }
    }
}

async fn rejection(response: reqwest::Response) -> ClientError {
    let status = response.status().as_u16();
    let text = response.text().await.unwrap_or_default();
    let message = serde_json::from_str::<ErrorBody>(&text)
        .map(|body| body.message)
        .unwrap_or(text);
    ClientError::Rejected { status, message }
}

/// Guesses an image mime type from a file extension.
pub fn mime_type_for(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase());
    match ext.as_deref() {
        Some("png") => "image/png",
        Some("webp") => "image/webp",
        Some("heic") => "image/heic",
        Some("gif") => "image/gif",
        _ => "image/jpeg",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::Worker;
    use crate::config::Config;
    use crate::error::ProviderError;
    use crate::providers::fakes::{FakeGeneration, FakeVision};
    use crate::providers::stub;
    use std::sync::Arc;

    fn config() -> Config {
        Config::from_lookup(|name| match name {
            "OPENAI_API_KEY" | "GOOGLE_API_KEY" => Some("k".to_string()),
            _ => None,
        })
        .unwrap()
    }

    async fn serve(vision: FakeVision, generation: FakeGeneration) -> String {
        let running =
            Worker::with_providers(config(), Arc::new(vision), Arc::new(generation)).start();
        stub::serve(running.router).await
    }

    #[test]
    fn test_mime_type_for() {
        assert_eq!(mime_type_for(Path::new("a/b.PNG")), "image/png");
        assert_eq!(mime_type_for(Path::new("photo.jpg")), "image/jpeg");
        assert_eq!(mime_type_for(Path::new("noext")), "image/jpeg");
    }

    #[test]
    fn test_rejects_non_http_urls() {
        assert!(matches!(
            WorkerClient::new("ftp://example.com"),
            Err(ClientError::InvalidUrl(_))
        ));
        assert!(WorkerClient::new("not a url").is_err());
    }

    #[test]
    fn test_endpoints_keep_base_path() {
        let client = WorkerClient::new("http://host/worker").unwrap();
        assert_eq!(
            client.endpoint("v1/new").unwrap().as_str(),
            "http://host/worker/v1/new"
        );

        let client = WorkerClient::new("http://host").unwrap();
        assert_eq!(
            client.endpoint("v1/status/abc").unwrap().as_str(),
            "http://host/v1/status/abc"
        );
    }

    #[tokio::test]
    async fn test_round_trip() {
        let base = serve(FakeVision::ok("c"), FakeGeneration::ok(b"styled")).await;
        let client = WorkerClient::new(&base).unwrap();

        let accepted = client
            .submit(b"raw", "image/jpeg", "dragonball-008", "u1", None)
            .await
            .unwrap();
        let status = client
            .wait(
                &accepted.request_id,
                Duration::from_millis(10),
                Duration::from_secs(5),
            )
            .await
            .unwrap();
        assert_eq!(status.status, JobState::Completed);
        assert_eq!(client.result(&accepted.request_id).await.unwrap(), b"styled");
    }

    #[tokio::test]
    async fn test_failed_job_surfaces_reason() {
        let blocked = vec![ProviderError::ContentBlocked("unsafe".into())];
        let base = serve(FakeVision::ok("c"), FakeGeneration::failing(blocked, b"")).await;
        let client = WorkerClient::new(&base).unwrap();

        let accepted = client
            .submit(b"raw", "image/jpeg", "anime-default-001", "u1", Some("k1"))
            .await
            .unwrap();
        let err = client
            .wait(
                &accepted.request_id,
                Duration::from_millis(10),
                Duration::from_secs(5),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::JobFailed { ref reason, .. } if reason == "content blocked: unsafe"));
    }

    #[tokio::test]
    async fn test_rejection_carries_server_message() {
        let base = serve(FakeVision::ok("c"), FakeGeneration::ok(b"")).await;
        let client = WorkerClient::new(&base).unwrap();

        let err = client
            .submit(b"raw", "image/jpeg", "no-such-style", "u1", None)
            .await
            .unwrap_err();
        match err {
            ClientError::Rejected { status, message } => {
                assert_eq!(status, 400);
                assert_eq!(message, "Unknown styleID no-such-style");
            }
            other => panic!("unexpected error: {}", other),
        }

        let err = client.status("missing").await.unwrap_err();
        assert!(matches!(err, ClientError::Rejected { status: 404, .. }));
    }
}
