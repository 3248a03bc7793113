//! Durable background job queue and worker
//!
//! Finalize enqueues follow-up work (metadata extraction, thumbnails, video
//! probes, proxies) inside the same transaction as the media rows. The
//! worker drains the queue by priority, honoring per-job dependencies.

pub mod queue;
pub mod types;
pub mod worker;

pub use queue::{retry_backoff, FailureOutcome, JobQueue};
pub use types::*;
pub use worker::{JobHandler, JobHandlers, JobWorker, WorkerHandle};
