//! Gemini (Google) image-to-image provider.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use base64::Engine;
use serde::{Deserialize, Serialize};

use super::{http_client, GeneratedImage, GenerationProvider};
use crate::error::{parse_retry_after, sanitize_error_message, ProviderError};

pub const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com";
pub const DEFAULT_MODEL: &str = "gemini-2.5-flash-image";

/// Builder for [`GeminiProvider`].
#[derive(Debug, Clone, Default)]
pub struct GeminiProviderBuilder {
    api_key: Option<String>,
    base_url: Option<String>,
    model: Option<String>,
    timeout: Option<Duration>,
}

impl GeminiProviderBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the API key. Falls back to `GOOGLE_API_KEY`.
    pub fn api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }

    pub fn base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = Some(url.into());
        self
    }

    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn build(self) -> Result<GeminiProvider, ProviderError> {
        let api_key = self
            .api_key
            .or_else(|| std::env::var("GOOGLE_API_KEY").ok())
            .filter(|k| !k.is_empty())
            .ok_or_else(|| {
                ProviderError::Auth("GOOGLE_API_KEY not set and no API key provided".into())
            })?;

        Ok(GeminiProvider {
            client: http_client(self.timeout.unwrap_or(Duration::from_secs(120)))?,
            api_key,
            base_url: self
                .base_url
                .unwrap_or_else(|| DEFAULT_BASE_URL.to_string())
                .trim_end_matches('/')
                .to_string(),
            model: self.model.unwrap_or_else(|| DEFAULT_MODEL.to_string()),
        })
    }
}

pub struct GeminiProvider {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
    model: String,
}

impl GeminiProvider {
    pub fn builder() -> GeminiProviderBuilder {
        GeminiProviderBuilder::new()
    }

    fn parse_error(status: u16, text: &str, headers: &reqwest::header::HeaderMap) -> ProviderError {
        let text = sanitize_error_message(text);
        if status == 429 {
            return ProviderError::RateLimited {
                retry_after: parse_retry_after(headers),
            };
        }
        if status == 401 || status == 403 {
            return ProviderError::Auth(text);
        }
        let lower = text.to_lowercase();
        if lower.contains("safety") || lower.contains("blocked") || lower.contains("prohibited") {
            return ProviderError::ContentBlocked(text);
        }
        ProviderError::Api {
            status,
            message: text,
        }
    }

    /// Pulls the first inline image out of a successful response.
    fn extract_image(response: GeminiResponse) -> Result<GeneratedImage, ProviderError> {
        // Prompt blocks arrive as HTTP 200.
        if let Some(reason) = response.prompt_feedback.and_then(|f| f.block_reason) {
            return Err(ProviderError::ContentBlocked(format!(
                "Prompt blocked: {}",
                reason
            )));
        }

        let candidate = response.candidates.into_iter().next().ok_or_else(|| {
            ProviderError::UnexpectedResponse("No candidates in Gemini response".into())
        })?;

        if let Some(reason) = candidate.finish_reason.as_deref() {
            match reason {
                "SAFETY"
                | "IMAGE_SAFETY"
                | "IMAGE_PROHIBITED_CONTENT"
                | "PROHIBITED_CONTENT"
                | "RECITATION"
                | "IMAGE_RECITATION"
                | "BLOCKLIST" => {
                    return Err(ProviderError::ContentBlocked(format!(
                        "Content blocked by Gemini safety filter: {}",
                        reason
                    )));
                }
                _ => {}
            }
        }

        let inline = candidate
            .content
            .into_iter()
            .flat_map(|c| c.parts)
            .find_map(|p| p.inline_data)
            .ok_or_else(|| {
                ProviderError::UnexpectedResponse("No image data in Gemini response".into())
            })?;

        let data = base64::engine::general_purpose::STANDARD
            .decode(inline.data.as_bytes())
            .map_err(|e| ProviderError::Decode(e.to_string()))?;

        Ok(GeneratedImage {
            data,
            mime_type: inline.mime_type,
        })
    }
}

#[async_trait]
impl GenerationProvider for GeminiProvider {
    async fn transform(
        &self,
        image: &[u8],
        mime_type: &str,
        prompt: &str,
    ) -> Result<GeneratedImage, ProviderError> {
        let start = Instant::now();
        let url = format!(
            "{}/v1beta/models/{}:generateContent",
            self.base_url, self.model
        );
        let body = GeminiRequest::transform(image, mime_type, prompt);

        let response = self
            .client
            .post(&url)
            .header("x-goog-api-key", &self.api_key)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let headers = response.headers().clone();
            let text = response.text().await.unwrap_or_default();
            return Err(Self::parse_error(status.as_u16(), &text, &headers));
        }

        let parsed: GeminiResponse = response.json().await?;
        let generated = Self::extract_image(parsed)?;
        tracing::debug!(
            "gemini returned {} bytes ({}) in {} ms",
            generated.data.len(),
            generated.mime_type,
            start.elapsed().as_millis()
        );
        Ok(generated)
    }

    fn name(&self) -> &'static str {
        "gemini"
    }
}

// Request/Response types
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GeminiRequest {
    contents: Vec<GeminiContent>,
    generation_config: GeminiConfig,
}

#[derive(Debug, Serialize)]
struct GeminiContent {
    parts: Vec<GeminiRequestPart>,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
enum GeminiRequestPart {
    InlineData {
        #[serde(rename = "inlineData")]
        inline_data: InlineData,
    },
    Text {
        text: String,
    },
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InlineData {
    mime_type: String,
    data: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GeminiConfig {
    response_modalities: Vec<&'static str>,
}

impl GeminiRequest {
    fn transform(image: &[u8], mime_type: &str, prompt: &str) -> Self {
        Self {
            contents: vec![GeminiContent {
                parts: vec![
                    GeminiRequestPart::InlineData {
                        inline_data: InlineData {
                            mime_type: mime_type.to_string(),
                            data: base64::engine::general_purpose::STANDARD.encode(image),
                        },
                    },
                    GeminiRequestPart::Text {
                        text: prompt.to_string(),
                    },
                ],
            }],
            generation_config: GeminiConfig {
                response_modalities: vec!["TEXT", "IMAGE"],
            },
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiResponse {
    #[serde(default)]
    candidates: Vec<GeminiCandidate>,
    #[serde(default)]
    prompt_feedback: Option<PromptFeedback>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiCandidate {
    #[serde(default)]
    content: Option<GeminiContentResponse>,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PromptFeedback {
    #[serde(default)]
    block_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GeminiContentResponse {
    #[serde(default)]
    parts: Vec<GeminiPartResponse>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiPartResponse {
    #[serde(default)]
    inline_data: Option<InlineData>,
}
