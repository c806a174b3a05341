use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tokio::time::Instant;

use crate::job::{within_ttl, JobError, JobRecord, JobUpdate};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("job {0} not found")]
    NotFound(String),
    #[error("job {0} already exists")]
    Duplicate(String),
    #[error(transparent)]
    Job(#[from] JobError),
    #[error("storage backend error: {0}")]
    Backend(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Blob {
    pub data: Vec<u8>,
    pub content_type: String,
}

// ── Blob store ───────────────────────────────────────────────────────────────

#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn put(&self, key: &str, data: Vec<u8>, content_type: &str) -> Result<(), StoreError>;
    async fn get(&self, key: &str) -> Result<Option<Blob>, StoreError>;
    async fn delete(&self, key: &str) -> Result<(), StoreError>;
}

#[derive(Debug, Default)]
pub struct MemoryBlobStore {
    objects: RwLock<HashMap<String, Blob>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.objects.read().await.len()
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn put(&self, key: &str, data: Vec<u8>, content_type: &str) -> Result<(), StoreError> {
        let blob = Blob {
            data,
            content_type: content_type.to_string(),
        };
        self.objects.write().await.insert(key.to_string(), blob);
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Blob>, StoreError> {
        Ok(self.objects.read().await.get(key).cloned())
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.objects.write().await.remove(key);
        Ok(())
    }
}

// ── Status store ─────────────────────────────────────────────────────────────

#[async_trait]
pub trait StatusStore: Send + Sync {
    async fn create(&self, record: JobRecord) -> Result<(), StoreError>;

    /// Expired records read as absent even before they are swept.
    async fn get(&self, request_id: &str) -> Result<Option<JobRecord>, StoreError>;

    async fn apply(&self, request_id: &str, update: JobUpdate) -> Result<JobRecord, StoreError>;

    /// Atomically binds `(user_id, key)` to `request_id`. Returns the request
    /// id already bound to the pair, if any, in which case nothing changes.
    async fn claim_idempotency(
        &self,
        user_id: &str,
        key: &str,
        request_id: &str,
    ) -> Result<Option<String>, StoreError>;

    async fn release_idempotency(&self, user_id: &str, key: &str) -> Result<(), StoreError>;

    /// Removes expired records and idempotency keys, returning the removed
    /// records.
    async fn sweep(&self, now: Instant) -> Result<Vec<JobRecord>, StoreError>;
}

#[derive(Debug, Default)]
struct StatusInner {
    jobs: HashMap<String, JobRecord>,
    idempotency: HashMap<(String, String), (String, Instant)>,
}

#[derive(Debug)]
pub struct MemoryStatusStore {
    ttl: Duration,
    inner: RwLock<StatusInner>,
}

impl MemoryStatusStore {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            inner: RwLock::new(StatusInner::default()),
        }
    }
}

#[async_trait]
impl StatusStore for MemoryStatusStore {
    async fn create(&self, record: JobRecord) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        if inner.jobs.contains_key(&record.request_id) {
            return Err(StoreError::Duplicate(record.request_id));
        }
        inner.jobs.insert(record.request_id.clone(), record);
        Ok(())
    }

    async fn get(&self, request_id: &str) -> Result<Option<JobRecord>, StoreError> {
        let now = Instant::now();
        let inner = self.inner.read().await;
        Ok(inner
            .jobs
            .get(request_id)
            .filter(|r| !r.is_expired(self.ttl, now))
            .cloned())
    }

    async fn apply(&self, request_id: &str, update: JobUpdate) -> Result<JobRecord, StoreError> {
        let now = Instant::now();
        let mut inner = self.inner.write().await;
        let record = inner
            .jobs
            .get_mut(request_id)
            .filter(|r| !r.is_expired(self.ttl, now))
            .ok_or_else(|| StoreError::NotFound(request_id.to_string()))?;
        record.apply(update)?;
        Ok(record.clone())
    }

    async fn claim_idempotency(
        &self,
        user_id: &str,
        key: &str,
        request_id: &str,
    ) -> Result<Option<String>, StoreError> {
        let now = Instant::now();
        let mut inner = self.inner.write().await;
        let slot = (user_id.to_string(), key.to_string());
        if let Some((existing, claimed_at)) = inner.idempotency.get(&slot) {
            if within_ttl(*claimed_at, self.ttl, now) {
                return Ok(Some(existing.clone()));
            }
        }
        inner.idempotency.insert(slot, (request_id.to_string(), now));
        Ok(None)
    }

    async fn release_idempotency(&self, user_id: &str, key: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        inner
            .idempotency
            .remove(&(user_id.to_string(), key.to_string()));
        Ok(())
    }

    async fn sweep(&self, now: Instant) -> Result<Vec<JobRecord>, StoreError> {
        let ttl = self.ttl;
        let mut inner = self.inner.write().await;

        let expired: Vec<String> = inner
            .jobs
            .iter()
            .filter(|(_, r)| r.is_expired(ttl, now))
            .map(|(id, _)| id.clone())
            .collect();
        let removed = expired
            .iter()
            .filter_map(|id| inner.jobs.remove(id))
            .collect();

        inner
            .idempotency
            .retain(|_, (_, claimed_at)| within_ttl(*claimed_at, ttl, now));

        Ok(removed)
    }
}
