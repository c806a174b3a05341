use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::store::{BlobStore, StatusStore, StoreError};

/// Removes expired job records and their input and result blobs.
///
/// Records leave the status store before their blobs are deleted, so a blob
/// delete that fails is remembered and retried on the next pass.
pub struct Collector {
    statuses: Arc<dyn StatusStore>,
    blobs: Arc<dyn BlobStore>,
    pending: Vec<String>,
}

impl Collector {
    pub fn new(statuses: Arc<dyn StatusStore>, blobs: Arc<dyn BlobStore>) -> Self {
        Self {
            statuses,
            blobs,
            pending: Vec::new(),
        }
    }

    /// Blob keys still waiting for a successful delete.
    pub fn pending(&self) -> &[String] {
        &self.pending
    }

    /// Sweeps records expired as of `now` and deletes their blobs. Returns
    /// the number of jobs collected.
    pub async fn collect(&mut self, now: Instant) -> Result<usize, StoreError> {
        let retry: Vec<String> = std::mem::take(&mut self.pending);
        for key in retry {
            self.delete_blob(key).await;
        }

        let expired = self.statuses.sweep(now).await?;
        for record in &expired {
            self.delete_blob(record.image_key.clone()).await;
            if let Some(key) = &record.result_key {
                self.delete_blob(key.clone()).await;
            }
            tracing::debug!("collected {} job {}", record.state, record.request_id);
        }
        Ok(expired.len())
    }

    async fn delete_blob(&mut self, key: String) {
        if let Err(e) = self.blobs.delete(&key).await {
            tracing::warn!("could not delete blob {}, will retry: {}", key, e);
            self.pending.push(key);
        }
    }
}

pub fn spawn(
    statuses: Arc<dyn StatusStore>,
    blobs: Arc<dyn BlobStore>,
    every: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut collector = Collector::new(statuses, blobs);
        let mut ticker = tokio::time::interval(every.max(Duration::from_secs(1)));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            match collector.collect(Instant::now()).await {
                Ok(0) => {}
                Ok(n) => tracing::info!("garbage collected {} stale jobs", n),
                Err(e) => tracing::warn!("job garbage collection failed: {}", e),
            }
            if !collector.pending().is_empty() {
                tracing::warn!("{} blob deletes pending retry", collector.pending().len());
            }
        }
    })
}
