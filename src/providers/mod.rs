//! Upstream vision (captioning) and generation (stylisation) providers.

pub mod gemini;
pub mod openai;

use async_trait::async_trait;

use crate::error::ProviderError;

pub use gemini::{GeminiProvider, GeminiProviderBuilder};
pub use openai::{OpenAiVision, OpenAiVisionBuilder};

/// Describes the content of an image in prose.
#[async_trait]
pub trait VisionProvider: Send + Sync {
    async fn describe(&self, image: &[u8], mime_type: &str) -> Result<String, ProviderError>;

    fn name(&self) -> &'static str;
}

/// An image returned by a generation provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeneratedImage {
    pub data: Vec<u8>,
    pub mime_type: String,
}

/// Transforms an input image according to a text prompt.
#[async_trait]
pub trait GenerationProvider: Send + Sync {
    async fn transform(
        &self,
        image: &[u8],
        mime_type: &str,
        prompt: &str,
    ) -> Result<GeneratedImage, ProviderError>;

    fn name(&self) -> &'static str;
}

/// Shared HTTP client settings for upstream calls.
pub(crate) fn http_client(timeout: std::time::Duration) -> Result<reqwest::Client, ProviderError> {
    reqwest::ClientBuilder::new()
        .connect_timeout(std::time::Duration::from_secs(10))
        .timeout(timeout)
        .user_agent(concat!("animeyourself-worker/", env!("CARGO_PKG_VERSION")))
        .build()
        .map_err(|e| ProviderError::Network(e.to_string()))
}
