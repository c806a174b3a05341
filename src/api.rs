use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{rejection::BytesRejection, DefaultBodyLimit, Path, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use base64::Engine;
use serde_json::json;
use uuid::Uuid;

use crate::error::UploadError;
use crate::job::{image_key, now_ms, JobRecord, JobState, JobUpdate};
use crate::models::{
    ErrorBody, QueueMessage, QueuedImage, StatusResponse, StyleInfo, UploadAccepted,
    UploadRequest,
};
use crate::prompt::{find_style, styles};
use crate::queue::JobQueue;
use crate::store::{BlobStore, StatusStore};

pub const X_REQUEST_ID: &str = "x-request-id";
pub const IDEMPOTENCY_KEY: &str = "idempotency-key";

#[derive(Clone)]
pub struct AppState {
    pub blobs: Arc<dyn BlobStore>,
    pub statuses: Arc<dyn StatusStore>,
    pub queue: JobQueue,
    pub max_upload_bytes: usize,
}

pub fn router(state: AppState) -> Router {
    let body_limit = body_limit(state.max_upload_bytes);

    Router::new()
        .route("/health", get(health))
        .route("/v1/new", post(upload).fallback(method_not_allowed))
        .route("/v1/status/:request_id", get(status))
        .route("/v1/result/:request_id", get(result))
        .route("/v1/styles", get(list_styles))
        .fallback(not_found)
        .layer(DefaultBodyLimit::max(body_limit))
        .with_state(state)
}

async fn health() -> impl IntoResponse {
    Json(json!({"status": "ok"}))
}

async fn not_found() -> Response {
    error_response(
        StatusCode::NOT_FOUND,
        &new_request_id(),
        "Not Found - Invalid endpoint",
        None,
    )
}

async fn method_not_allowed() -> Response {
    error_response(
        StatusCode::METHOD_NOT_ALLOWED,
        &new_request_id(),
        "Only POST requests are accepted",
        None,
    )
}

async fn list_styles() -> impl IntoResponse {
    let list: Vec<StyleInfo> = styles()
        .iter()
        .map(|s| StyleInfo {
            style_id: s.id.to_string(),
            name: s.name.to_string(),
        })
        .collect();
    Json(list)
}

pub async fn upload(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Result<Bytes, BytesRejection>,
) -> Response {
    let request_id = new_request_id();
    let accepted = match body {
        Ok(body) => accept_upload(&state, &headers, &body, &request_id).await,
        Err(rejection) => Err(body_rejection(&rejection)),
    };
    match accepted {
        Ok(accepted) => {
            let id = accepted.request_id.clone();
            (
                StatusCode::ACCEPTED,
                [(X_REQUEST_ID, id)],
                Json(accepted),
            )
                .into_response()
        }
        Err(e) => {
            if let UploadError::Internal(detail) = &e {
                tracing::error!("Error processing request {}: {}", request_id, detail);
            }
            error_response(e.status(), &request_id, e.to_string(), e.detail())
        }
    }
}

async fn accept_upload(
    state: &AppState,
    headers: &HeaderMap,
    body: &[u8],
    request_id: &str,
) -> Result<UploadAccepted, UploadError> {
    let req: UploadRequest =
        serde_json::from_slice(body).map_err(|_| UploadError::InvalidJson)?;

    let image = req.image.ok_or(UploadError::MissingImage)?;
    let data = non_empty(image.data).ok_or(UploadError::MissingImage)?;
    let mime_type = non_empty(image.mime_type).ok_or(UploadError::MissingImage)?;
    let style_id = non_empty(req.style_id).ok_or(UploadError::MissingStyle)?;
    if find_style(&style_id).is_none() {
        return Err(UploadError::UnknownStyle(style_id));
    }
    let user_id = non_empty(req.user_id).ok_or(UploadError::MissingUser)?;

    let bytes = decode_image(&data)?;
    if bytes.len() > state.max_upload_bytes {
        return Err(UploadError::TooLarge);
    }

    let idempotency_key = headers
        .get(IDEMPOTENCY_KEY)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|k| !k.is_empty());

    if let Some(key) = idempotency_key {
        let existing = state
            .statuses
            .claim_idempotency(&user_id, key, request_id)
            .await
            .map_err(|e| UploadError::Internal(e.to_string()))?;
        if let Some(original) = existing {
            tracing::info!(
                "Duplicate submission for user {} resolved to request {}",
                user_id,
                original
            );
            return Ok(accepted(&user_id, &original));
        }
    }

    let result = enqueue(state, bytes, &mime_type, &style_id, &user_id, request_id).await;
    if let Err(e) = result {
        if let Some(key) = idempotency_key {
            if let Err(release) = state.statuses.release_idempotency(&user_id, key).await {
                tracing::warn!("could not release idempotency key: {}", release);
            }
        }
        return Err(e);
    }

    tracing::info!(
        "Queued request {} for user {} with style {}",
        request_id,
        user_id,
        style_id
    );
    Ok(accepted(&user_id, request_id))
}

async fn enqueue(
    state: &AppState,
    bytes: Vec<u8>,
    mime_type: &str,
    style_id: &str,
    user_id: &str,
    request_id: &str,
) -> Result<(), UploadError> {
    let internal = |e: &dyn std::fmt::Display| UploadError::Internal(e.to_string());
    let key = image_key(user_id, request_id);

    state
        .blobs
        .put(&key, bytes, mime_type)
        .await
        .map_err(|e| internal(&e))?;
    state
        .statuses
        .create(JobRecord::new(request_id, user_id, key.clone()))
        .await
        .map_err(|e| internal(&e))?;

    let message = QueueMessage {
        image: QueuedImage {
            key,
            mime_type: mime_type.to_string(),
        },
        style_id: style_id.to_string(),
        user_id: user_id.to_string(),
        timestamp: now_ms(),
        request_id: request_id.to_string(),
    };
    if let Err(e) = state.queue.send(message).await {
        let update = JobUpdate::Failed {
            error: e.to_string(),
        };
        if let Err(mark) = state.statuses.apply(request_id, update).await {
            tracing::warn!("could not mark request {} failed: {}", request_id, mark);
        }
        return Err(internal(&e));
    }
    Ok(())
}

pub async fn status(State(state): State<AppState>, Path(request_id): Path<String>) -> Response {
    match state.statuses.get(&request_id).await {
        Ok(Some(record)) => (
            StatusCode::OK,
            [(X_REQUEST_ID, request_id)],
            Json(StatusResponse::from(&record)),
        )
            .into_response(),
        Ok(None) => error_response(StatusCode::NOT_FOUND, &request_id, "Unknown requestId", None),
        Err(e) => error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            &request_id,
            "Failed to read request status",
            Some(e.to_string()),
        ),
    }
}

pub async fn result(State(state): State<AppState>, Path(request_id): Path<String>) -> Response {
    let record = match state.statuses.get(&request_id).await {
        Ok(Some(record)) => record,
        Ok(None) => {
            return error_response(StatusCode::NOT_FOUND, &request_id, "Unknown requestId", None)
        }
        Err(e) => {
            return error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                &request_id,
                "Failed to read request status",
                Some(e.to_string()),
            )
        }
    };

    let key = match (&record.state, &record.result_key) {
        (JobState::Completed, Some(key)) => key.clone(),
        (current, _) => {
            return error_response(
                StatusCode::CONFLICT,
                &request_id,
                format!("Result not ready (status: {})", current),
                record.error.clone(),
            )
        }
    };

    match state.blobs.get(&key).await {
        Ok(Some(blob)) => (
            StatusCode::OK,
            [
                (header::CONTENT_TYPE.as_str(), blob.content_type),
                (X_REQUEST_ID, request_id),
            ],
            blob.data,
        )
            .into_response(),
        Ok(None) => error_response(
            StatusCode::NOT_FOUND,
            &request_id,
            "Processed image not found",
            None,
        ),
        Err(e) => error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            &request_id,
            "Failed to read processed image",
            Some(e.to_string()),
        ),
    }
}

// ── Helpers ──────────────────────────────────────────────────────────────────

/// Transport cap on request bodies. Base64 adds a third, and line wrapping or
/// JSON escaping can add as much again; the decoded size is checked exactly
/// in [`accept_upload`].
fn body_limit(max_upload_bytes: usize) -> usize {
    (max_upload_bytes / 3 + 1)
        .saturating_mul(8)
        .saturating_add(64 * 1024)
}

fn body_rejection(rejection: &BytesRejection) -> UploadError {
    if rejection.status() == StatusCode::PAYLOAD_TOO_LARGE {
        UploadError::TooLarge
    } else {
        tracing::warn!("could not read upload body: {}", rejection.body_text());
        UploadError::InvalidJson
    }
}

fn new_request_id() -> String {
    Uuid::new_v4().to_string()
}

fn accepted(user_id: &str, request_id: &str) -> UploadAccepted {
    UploadAccepted {
        success: true,
        message: "Image processing request queued successfully".to_string(),
        request_id: request_id.to_string(),
        image_key: image_key(user_id, request_id),
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

/// Decodes bare base64 or the payload of a `data:` URL.
fn decode_image(data: &str) -> Result<Vec<u8>, UploadError> {
    let encoded = data.split_once(',').map(|(_, rest)| rest).unwrap_or(data);
    let compact: String = encoded.chars().filter(|c| !c.is_whitespace()).collect();
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(compact.as_bytes())
        .map_err(|_| UploadError::InvalidEncoding)?;
    if bytes.is_empty() {
        return Err(UploadError::InvalidEncoding);
    }
    Ok(bytes)
}

fn error_response(
    status: StatusCode,
    request_id: &str,
    message: impl Into<String>,
    error: Option<String>,
) -> Response {
    let body = ErrorBody {
        success: false,
        message: message.into(),
        request_id: request_id.to_string(),
        error,
    };
    (status, [(X_REQUEST_ID, request_id.to_string())], Json(body)).into_response()
}
