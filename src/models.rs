use serde::{Deserialize, Serialize};

use crate::job::{JobRecord, JobState};

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct UploadRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<ImagePayload>,
    #[serde(rename = "styleID", default, skip_serializing_if = "Option::is_none")]
    pub style_id: Option<String>,
    #[serde(rename = "userID", default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
}

/// Base64 image data, either bare or as a `data:` URL.
#[derive(Debug, Default, Deserialize, Serialize)]
pub struct ImagePayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct UploadAccepted {
    pub success: bool,
    pub message: String,
    #[serde(rename = "requestId")]
    pub request_id: String,
    #[serde(rename = "imageKey")]
    pub image_key: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorBody {
    pub success: bool,
    pub message: String,
    #[serde(rename = "requestId")]
    pub request_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueuedImage {
    pub key: String,
    pub mime_type: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueMessage {
    pub image: QueuedImage,
    #[serde(rename = "styleID")]
    pub style_id: String,
    #[serde(rename = "userID")]
    pub user_id: String,
    /// Milliseconds since the Unix epoch.
    pub timestamp: u64,
    #[serde(rename = "requestId")]
    pub request_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusResponse {
    pub request_id: String,
    pub status: JobState,
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_key: Option<String>,
    pub created_at: u64,
    pub updated_at: u64,
}

impl From<&JobRecord> for StatusResponse {
    fn from(record: &JobRecord) -> Self {
        Self {
            request_id: record.request_id.clone(),
            status: record.state,
            attempts: record.attempts,
            error: record.error.clone(),
            result_key: record.result_key.clone(),
            created_at: record.created_at_ms,
            updated_at: record.updated_at_ms,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StyleInfo {
    #[serde(rename = "styleID")]
    pub style_id: String,
    pub name: String,
}
