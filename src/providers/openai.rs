//! OpenAI chat-completions vision provider.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use base64::Engine;
use serde::{Deserialize, Serialize};

use super::{http_client, VisionProvider};
use crate::error::{parse_retry_after, sanitize_error_message, ProviderError};

pub const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
pub const DEFAULT_MODEL: &str = "gpt-4o-mini";
const MAX_TOKENS: u32 = 300;
const FALLBACK_DESCRIPTION: &str = "No description available";

const SYSTEM_PROMPT: &str = "You are an AI assistant that analyzes images and provides concise, \
    detailed descriptions of their content, focusing on the main subjects, actions, and setting.";
const USER_PROMPT: &str = "Describe what you see in this image in detail.";

#[derive(Debug, Clone, Default)]
pub struct OpenAiVisionBuilder {
    api_key: Option<String>,
    base_url: Option<String>,
    model: Option<String>,
    timeout: Option<Duration>,
}

impl OpenAiVisionBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the API key. Falls back to `OPENAI_API_KEY`.
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

    pub fn build(self) -> Result<OpenAiVision, ProviderError> {
        let api_key = self
            .api_key
            .or_else(|| std::env::var("OPENAI_API_KEY").ok())
            .filter(|k| !k.is_empty())
            .ok_or_else(|| {
                ProviderError::Auth("OPENAI_API_KEY not set and no API key provided".into())
            })?;

        Ok(OpenAiVision {
            client: http_client(self.timeout.unwrap_or(Duration::from_secs(60)))?,
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

pub struct OpenAiVision {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
    model: String,
}

impl OpenAiVision {
    pub fn builder() -> OpenAiVisionBuilder {
        OpenAiVisionBuilder::new()
    }

    fn parse_error(status: u16, text: &str, headers: &reqwest::header::HeaderMap) -> ProviderError {
        let text = sanitize_error_message(text);
        match status {
            401 | 403 => ProviderError::Auth(text),
            429 => ProviderError::RateLimited {
                retry_after: parse_retry_after(headers),
            },
            400 if text.contains("content_policy") => ProviderError::ContentBlocked(text),
            _ => ProviderError::Api {
                status,
                message: text,
            },
        }
    }
}

#[async_trait]
impl VisionProvider for OpenAiVision {
    async fn describe(&self, image: &[u8], mime_type: &str) -> Result<String, ProviderError> {
        let start = Instant::now();
        let body = ChatRequest::describe(&self.model, image, mime_type);

        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let headers = response.headers().clone();
            let text = response.text().await.unwrap_or_default();
            return Err(Self::parse_error(status.as_u16(), &text, &headers));
        }

        let chat: ChatResponse = response.json().await?;
        let description = chat
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .filter(|c| !c.trim().is_empty())
            .unwrap_or_else(|| FALLBACK_DESCRIPTION.to_string());

        tracing::debug!(
            "openai described {} byte image in {} ms",
            image.len(),
            start.elapsed().as_millis()
        );
        Ok(description)
    }

    fn name(&self) -> &'static str {
        "openai"
    }
}

// Request/Response types
#[derive(Debug, Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
    max_tokens: u32,
}

#[derive(Debug, Serialize)]
struct ChatMessage {
    role: &'static str,
    content: MessageContent,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
enum MessageContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ContentPart {
    Text { text: String },
    ImageUrl { image_url: ImageUrl },
}

#[derive(Debug, Serialize)]
struct ImageUrl {
    url: String,
}

impl ChatRequest {
    fn describe(model: &str, image: &[u8], mime_type: &str) -> Self {
        let data_url = format!(
            "data:{};base64,{}",
            mime_type,
            base64::engine::general_purpose::STANDARD.encode(image)
        );
        Self {
            model: model.to_string(),
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: MessageContent::Text(SYSTEM_PROMPT.to_string()),
                },
                ChatMessage {
                    role: "user",
                    content: MessageContent::Parts(vec![
                        ContentPart::Text {
                            text: USER_PROMPT.to_string(),
                        },
                        ContentPart::ImageUrl {
                            image_url: ImageUrl { url: data_url },
                        },
                    ]),
                },
            ],
            max_tokens: MAX_TOKENS,
        }
    }
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChatChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}
