//! Submit-job / poll-job worker that turns photos into anime-styled images.
//!
//! An upload is stored, recorded as `queued` and put on a work queue. The
//! consumer captions the image with a vision model, folds the caption into a
//! style template, asks an image model to restyle the photo, stores the
//! result and marks the job `completed` (or `failed`). Clients poll the status
//! endpoint and then fetch the result.

pub mod api;
pub mod app;
pub mod client;
pub mod config;
pub mod consumer;
pub mod error;
pub mod gc;
pub mod job;
pub mod models;
pub mod prompt;
pub mod providers;
pub mod queue;
pub mod resilience;
pub mod store;

pub use app::Worker;
pub use config::Config;
pub use error::ProviderError;
