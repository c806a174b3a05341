use std::time::Duration;

use axum::http::StatusCode;

const MAX_ERROR_MESSAGE_LEN: usize = 500;

// ── Provider errors ──────────────────────────────────────────────────────────

/// Errors returned by the vision and generation providers.
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    /// API key missing or rejected.
    #[error("authentication failed: {0}")]
    Auth(String),

    /// Provider returned a non-success status.
    #[error("API error: {status} - {message}")]
    Api { status: u16, message: String },

    /// Rate limit exceeded.
    #[error("rate limited, retry after {retry_after:?}")]
    RateLimited { retry_after: Option<Duration> },

    #[error("request timed out")]
    Timeout,

    /// Content was blocked by the provider's safety filters.
    #[error("content blocked: {0}")]
    ContentBlocked(String),

    /// Response was well-formed HTTP but not what we asked for.
    #[error("unexpected response: {0}")]
    UnexpectedResponse(String),

    #[error("failed to decode: {0}")]
    Decode(String),

    #[error("network error: {0}")]
    Network(String),

    /// The provider's circuit breaker is rejecting calls.
    #[error("circuit open for {0}")]
    CircuitOpen(&'static str),
}

impl ProviderError {
    /// Returns true if this error is likely transient and worth retrying.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::RateLimited { .. } | Self::Timeout | Self::Network(_) | Self::CircuitOpen(_) => {
                true
            }
            Self::Api { status, .. } => *status >= 500,
            _ => false,
        }
    }

    /// Returns the delay the provider asked for, if any.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }
}

impl From<reqwest::Error> for ProviderError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            ProviderError::Timeout
        } else if e.is_decode() {
            ProviderError::UnexpectedResponse(e.to_string())
        } else {
            ProviderError::Network(e.to_string())
        }
    }
}

/// Parses a `Retry-After` header expressed in whole seconds.
pub fn parse_retry_after(headers: &reqwest::header::HeaderMap) -> Option<Duration> {
    headers
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

/// Trims an upstream error body so it is safe to log and store.
pub fn sanitize_error_message(text: &str) -> String {
    let trimmed = text.trim();
    if trimmed.chars().count() <= MAX_ERROR_MESSAGE_LEN {
        return trimmed.to_string();
    }
    let mut out: String = trimmed.chars().take(MAX_ERROR_MESSAGE_LEN).collect();
    out.push_str("...");
    out
}

// ── Upload errors ────────────────────────────────────────────────────────────

/// Rejections produced by the upload endpoint. The display text is the
/// `message` field returned to the client.
#[derive(Debug, thiserror::Error)]
pub enum UploadError {
    #[error("Invalid JSON body")]
    InvalidJson,
    #[error("Missing required image data")]
    MissingImage,
    #[error("Missing required styleID")]
    MissingStyle,
    #[error("Unknown styleID {0}")]
    UnknownStyle(String),
    #[error("Missing required userID")]
    MissingUser,
    #[error("Invalid image encoding")]
    InvalidEncoding,
    #[error("Image exceeds maximum size")]
    TooLarge,
    #[error("Failed to queue image processing request")]
    Internal(String),
}

impl UploadError {
    pub fn status(&self) -> StatusCode {
        match self {
            UploadError::TooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            UploadError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            _ => StatusCode::BAD_REQUEST,
        }
    }

    /// Detail reported in the `error` field, only for server-side failures.
    pub fn detail(&self) -> Option<String> {
        match self {
            UploadError::Internal(detail) => Some(detail.clone()),
            _ => None,
        }
    }
}
