//! Job lifecycle: `queued → analyzing → generating → completed`, with
//! `failed` reachable from any non-terminal state.

use std::fmt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Queued,
    Analyzing,
    Generating,
    Completed,
    Failed,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Analyzing => "analyzing",
            Self::Generating => "generating",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Redelivered messages restart at `analyzing`, so that state may be
    /// re-entered from itself or from `generating`.
    pub fn can_transition_to(&self, next: JobState) -> bool {
        use JobState::*;
        match (self, next) {
            (Queued, Analyzing)
            | (Analyzing, Analyzing)
            | (Analyzing, Generating)
            | (Generating, Analyzing)
            | (Generating, Completed) => true,
            (from, Failed) => !from.is_terminal(),
            _ => false,
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum JobError {
    #[error("invalid transition from {from} to {to}")]
    InvalidTransition { from: JobState, to: JobState },
}

/// A requested change to a job record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobUpdate {
    Analyzing,
    Generating,
    Completed { result_key: String },
    Failed { error: String },
}

impl JobUpdate {
    pub fn target(&self) -> JobState {
        match self {
            Self::Analyzing => JobState::Analyzing,
            Self::Generating => JobState::Generating,
            Self::Completed { .. } => JobState::Completed,
            Self::Failed { .. } => JobState::Failed,
        }
    }
}

#[derive(Debug, Clone)]
pub struct JobRecord {
    pub request_id: String,
    pub user_id: String,
    pub image_key: String,
    pub state: JobState,
    /// Number of times processing has started.
    pub attempts: u32,
    pub error: Option<String>,
    pub result_key: Option<String>,
    pub created_at_ms: u64,
    pub updated_at_ms: u64,
    /// Monotonic timestamp of the last change, used for expiry.
    pub touched: Instant,
}

impl JobRecord {
    pub fn new(
        request_id: impl Into<String>,
        user_id: impl Into<String>,
        image_key: impl Into<String>,
    ) -> Self {
        let now = now_ms();
        Self {
            request_id: request_id.into(),
            user_id: user_id.into(),
            image_key: image_key.into(),
            state: JobState::Queued,
            attempts: 0,
            error: None,
            result_key: None,
            created_at_ms: now,
            updated_at_ms: now,
            touched: Instant::now(),
        }
    }

    /// Applies an update, leaving the record untouched if the transition is
    /// not allowed.
    pub fn apply(&mut self, update: JobUpdate) -> Result<(), JobError> {
        let to = update.target();
        if !self.state.can_transition_to(to) {
            return Err(JobError::InvalidTransition {
                from: self.state,
                to,
            });
        }

        match update {
            JobUpdate::Analyzing => self.attempts += 1,
            JobUpdate::Generating => {}
            JobUpdate::Completed { result_key } => self.result_key = Some(result_key),
            JobUpdate::Failed { error } => self.error = Some(error),
        }
        self.state = to;
        self.updated_at_ms = now_ms();
        self.touched = Instant::now();
        Ok(())
    }

    pub fn is_expired(&self, ttl: Duration, now: Instant) -> bool {
        !within_ttl(self.touched, ttl, now)
    }
}

/// Whether `now` is still inside `ttl` of `since`. A deadline past the end
/// of the clock never arrives.
pub(crate) fn within_ttl(since: Instant, ttl: Duration, now: Instant) -> bool {
    since.checked_add(ttl).map_or(true, |deadline| now < deadline)
}

/// Key under which the processed image for a request is stored.
pub fn result_key(request_id: &str) -> String {
    format!("processed/{}.png", request_id)
}

/// Key under which the uploaded image for a request is stored.
pub fn image_key(user_id: &str, request_id: &str) -> String {
    format!("{}/{}", user_id, request_id)
}

pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
