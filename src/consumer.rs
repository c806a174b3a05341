//! Queue consumer: caption the upload, build the style prompt, transform the
//! image, and record the outcome.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;

use crate::error::ProviderError;
use crate::job::{result_key, JobUpdate};
use crate::models::QueueMessage;
use crate::prompt::generate_prompt;
use crate::providers::{GenerationProvider, VisionProvider};
use crate::queue::{Delivery, JobQueue, QueueReceiver, RetryOutcome};
use crate::resilience::{CircuitBreaker, RetryPolicy};
use crate::store::{BlobStore, StatusStore, StoreError};

const LOG_PREVIEW_CHARS: usize = 100;

/// What happened to a single delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Completed,
    /// The job was already terminal or no longer exists.
    Skipped,
    Failed(String),
    Redelivered { attempt: u32 },
}

#[derive(Debug)]
enum StepError {
    Skip(String),
    Permanent(String),
    Retry {
        reason: String,
        retry_after: Option<Duration>,
    },
}

impl From<ProviderError> for StepError {
    fn from(e: ProviderError) -> Self {
        if e.is_retryable() {
            StepError::Retry {
                retry_after: e.retry_after(),
                reason: e.to_string(),
            }
        } else {
            StepError::Permanent(e.to_string())
        }
    }
}

impl From<StoreError> for StepError {
    fn from(e: StoreError) -> Self {
        match e {
            // Expired, or moved on by another delivery.
            StoreError::NotFound(_) | StoreError::Job(_) => StepError::Skip(e.to_string()),
            StoreError::Backend(_) => StepError::Retry {
                reason: e.to_string(),
                retry_after: None,
            },
            StoreError::Duplicate(_) => StepError::Permanent(e.to_string()),
        }
    }
}

pub struct Pipeline {
    blobs: Arc<dyn BlobStore>,
    statuses: Arc<dyn StatusStore>,
    queue: JobQueue,
    vision: Arc<dyn VisionProvider>,
    generation: Arc<dyn GenerationProvider>,
    vision_breaker: CircuitBreaker,
    generation_breaker: CircuitBreaker,
    retry: RetryPolicy,
}

impl Pipeline {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        blobs: Arc<dyn BlobStore>,
        statuses: Arc<dyn StatusStore>,
        queue: JobQueue,
        vision: Arc<dyn VisionProvider>,
        generation: Arc<dyn GenerationProvider>,
        retry: RetryPolicy,
        breaker_threshold: u32,
        breaker_open_for: Duration,
    ) -> Self {
        Self {
            vision_breaker: CircuitBreaker::new(vision.name(), breaker_threshold, breaker_open_for),
            generation_breaker: CircuitBreaker::new(
                generation.name(),
                breaker_threshold,
                breaker_open_for,
            ),
            blobs,
            statuses,
            queue,
            vision,
            generation,
            retry,
        }
    }

    /// Pulls deliveries until the queue closes, keeping at most
    /// `concurrency` in flight.
    pub async fn run(self: Arc<Self>, mut receiver: QueueReceiver, concurrency: usize) {
        let permits = Arc::new(Semaphore::new(concurrency.max(1)));
        while let Some(delivery) = receiver.recv().await {
            let permit = match permits.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => break,
            };
            let pipeline = self.clone();
            tokio::spawn(async move {
                let _permit = permit;
                pipeline.handle(delivery).await;
            });
        }
        tracing::info!("queue closed, consumer stopping");
    }

    /// Processes one delivery and settles it: ack, redeliver, or fail.
    pub async fn handle(&self, delivery: Delivery) -> Outcome {
        let request_id = delivery.message.request_id.clone();
        tracing::info!(
            "Processing request {} (delivery {})",
            request_id,
            delivery.attempt
        );

        let result = self.process(&delivery.message).await;
        match result {
            Ok(()) => {
                delivery.ack();
                Outcome::Completed
            }
            Err(StepError::Skip(reason)) => {
                tracing::info!("Skipping request {}: {}", request_id, reason);
                delivery.ack();
                Outcome::Skipped
            }
            Err(StepError::Permanent(reason)) => {
                tracing::error!("Error processing request {}: {}", request_id, reason);
                self.mark_failed(&request_id, &reason).await;
                delivery.ack();
                Outcome::Failed(reason)
            }
            Err(StepError::Retry {
                reason,
                retry_after,
            }) => {
                let attempt = delivery.attempt;
                let delay = retry_after
                    .map(|d| d.min(self.retry.max_delay))
                    .unwrap_or_else(|| self.retry.delay_for(attempt));
                match self.queue.retry(delivery, delay) {
                    RetryOutcome::Scheduled { attempt } => {
                        tracing::warn!(
                            "Request {} failed transiently ({}), redelivery {} in {:?}",
                            request_id,
                            reason,
                            attempt,
                            delay
                        );
                        Outcome::Redelivered { attempt }
                    }
                    RetryOutcome::DeadLettered => {
                        let reason = format!("gave up after {} deliveries: {}", attempt, reason);
                        self.mark_failed(&request_id, &reason).await;
                        Outcome::Failed(reason)
                    }
                }
            }
        }
    }

    async fn process(&self, msg: &QueueMessage) -> Result<(), StepError> {
        let request_id = msg.request_id.as_str();
        let mime_type = msg.image.mime_type.as_str();

        self.statuses.apply(request_id, JobUpdate::Analyzing).await?;

        let blob = self
            .blobs
            .get(&msg.image.key)
            .await?
            .ok_or_else(|| StepError::Permanent(format!("Image not found: {}", msg.image.key)))?;

        tracing::info!("Analyzing image for request {}...", request_id);
        let caption = self
            .retry
            .run(self.vision.name(), || {
                self.vision_breaker
                    .call(self.vision.describe(&blob.data, mime_type))
            })
            .await?;
        tracing::info!("Image analysis result: {}...", preview(&caption));

        let prompt = generate_prompt(&msg.style_id, &caption)
            .map_err(|e| StepError::Permanent(e.to_string()))?;
        tracing::info!("Using prompt: {}...", preview(&prompt));

        self.statuses.apply(request_id, JobUpdate::Generating).await?;

        let generated = self
            .retry
            .run(self.generation.name(), || {
                self.generation_breaker
                    .call(self.generation.transform(&blob.data, mime_type, &prompt))
            })
            .await?;

        let output_len = generated.data.len();
        let key = result_key(request_id);
        self.blobs
            .put(&key, generated.data, &generated.mime_type)
            .await?;
        let completed = JobUpdate::Completed {
            result_key: key.clone(),
        };
        if let Err(e) = self.statuses.apply(request_id, completed).await {
            // Without a record the collector would never find this blob.
            if let Err(cleanup) = self.blobs.delete(&key).await {
                tracing::warn!("could not remove orphaned result {}: {}", key, cleanup);
            }
            return Err(e.into());
        }

        tracing::info!(
            "Processed request {}: original {} bytes, processed {} bytes",
            request_id,
            blob.data.len(),
            output_len
        );
        Ok(())
    }

    async fn mark_failed(&self, request_id: &str, reason: &str) {
        let update = JobUpdate::Failed {
            error: reason.to_string(),
        };
        if let Err(e) = self.statuses.apply(request_id, update).await {
            tracing::warn!("could not mark request {} failed: {}", request_id, e);
        }
    }
}

fn preview(text: &str) -> String {
    text.chars().take(LOG_PREVIEW_CHARS).collect()
}
