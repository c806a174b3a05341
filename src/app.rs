use std::sync::Arc;

use axum::Router;
use tokio::task::JoinHandle;

use crate::api::{self, AppState};
use crate::config::Config;
use crate::consumer::Pipeline;
use crate::error::ProviderError;
use crate::gc;
use crate::providers::{
    GeminiProvider, GenerationProvider, OpenAiVision, VisionProvider,
};
use crate::queue::{self, QueueReceiver};
use crate::store::{BlobStore, MemoryBlobStore, MemoryStatusStore, StatusStore};

pub struct Worker {
    pub state: AppState,
    pipeline: Arc<Pipeline>,
    receiver: QueueReceiver,
    config: Config,
}

/// Handles to the background tasks of a started worker.
pub struct Running {
    pub router: Router,
    pub consumer: JoinHandle<()>,
    pub collector: JoinHandle<()>,
}

impl Worker {
    /// Builds a worker backed by the OpenAI and Gemini providers.
    pub fn from_config(config: Config) -> Result<Self, ProviderError> {
        let vision = OpenAiVision::builder()
            .api_key(config.openai_api_key.clone())
            .base_url(config.openai_base_url.clone())
            .model(config.openai_model.clone())
            .build()?;
        let generation = GeminiProvider::builder()
            .api_key(config.google_api_key.clone())
            .base_url(config.gemini_base_url.clone())
            .model(config.gemini_model.clone())
            .build()?;
        Ok(Self::with_providers(config, Arc::new(vision), Arc::new(generation)))
    }

    pub fn with_providers(
        config: Config,
        vision: Arc<dyn VisionProvider>,
        generation: Arc<dyn GenerationProvider>,
    ) -> Self {
        let blobs: Arc<dyn BlobStore> = Arc::new(MemoryBlobStore::new());
        let statuses: Arc<dyn StatusStore> = Arc::new(MemoryStatusStore::new(config.job_ttl));
        let (queue, receiver) = queue::channel(config.queue_capacity, config.max_deliveries);

        let pipeline = Arc::new(Pipeline::new(
            blobs.clone(),
            statuses.clone(),
            queue.clone(),
            vision,
            generation,
            config.retry.clone(),
            config.breaker_threshold,
            config.breaker_open_for,
        ));

        let state = AppState {
            blobs,
            statuses,
            queue,
            max_upload_bytes: config.max_upload_bytes,
        };

        Self {
            state,
            pipeline,
            receiver,
            config,
        }
    }

    /// Spawns the consumer and the garbage collector and returns the router.
    pub fn start(self) -> Running {
        let consumer = tokio::spawn(
            self.pipeline
                .clone()
                .run(self.receiver, self.config.consumer_concurrency),
        );
        let collector = gc::spawn(
            self.state.statuses.clone(),
            self.state.blobs.clone(),
            self.config.gc_interval,
        );
        tracing::info!(
            "consumer started with concurrency {}, jobs expire after {:?}",
            self.config.consumer_concurrency,
            self.config.job_ttl
        );
        Running {
            router: api::router(self.state),
            consumer,
            collector,
        }
    }
}
