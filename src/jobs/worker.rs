//! Background worker: claims jobs and runs their handlers with bounded
//! concurrency.

use crate::jobs::queue::{FailureOutcome, JobQueue};
use crate::jobs::types::*;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Performs one kind of background work
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, job: &JobRecord) -> Result<(), JobError>;
}

/// Handler per job kind
#[derive(Clone, Default)]
pub struct JobHandlers {
    handlers: HashMap<JobKind, Arc<dyn JobHandler>>,
}

impl JobHandlers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(mut self, kind: JobKind, handler: Arc<dyn JobHandler>) -> Self {
        self.handlers.insert(kind, handler);
        self
    }

    /// Same handler for every kind
    pub fn all(handler: Arc<dyn JobHandler>) -> Self {
        JobKind::ALL
            .into_iter()
            .fold(Self::new(), |handlers, kind| handlers.register(kind, handler.clone()))
    }

    fn get(&self, kind: JobKind) -> Option<Arc<dyn JobHandler>> {
        self.handlers.get(&kind).cloned()
    }
}

/// Handle to a spawned worker
pub struct WorkerHandle {
    shutdown: CancellationToken,
    join: JoinHandle<()>,
}

impl WorkerHandle {
    /// Stop claiming, wait for running handlers to finish
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        if let Err(e) = self.join.await {
            error!("Job worker task failed: {}", e);
        }
    }
}

#[derive(Clone)]
pub struct JobWorker {
    queue: JobQueue,
    handlers: Arc<JobHandlers>,
    events: Option<mpsc::UnboundedSender<JobEvent>>,
    /// Claims and completions publish under this lock so the event stream
    /// follows database order
    publish: Arc<Mutex<()>>,
}

impl JobWorker {
    pub fn new(queue: JobQueue, handlers: JobHandlers) -> Self {
        JobWorker {
            queue,
            handlers: Arc::new(handlers),
            events: None,
            publish: Arc::new(Mutex::new(())),
        }
    }

    pub fn with_events(mut self, events: mpsc::UnboundedSender<JobEvent>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn spawn(self) -> WorkerHandle {
        let shutdown = CancellationToken::new();
        let token = shutdown.clone();
        let join = tokio::spawn(async move { self.run(token).await });
        WorkerHandle { shutdown, join }
    }

    /// Claim loop. Wakes on queue notifications or every poll interval.
    pub async fn run(self, shutdown: CancellationToken) {
        let config = self.queue.config().clone();
        info!(
            "Job worker started: {} worker(s), poll every {:?}",
            config.max_workers, config.poll_interval
        );

        if let Err(e) = self.queue.requeue_stale_running().await {
            error!("Failed to requeue stale jobs: {}", e);
        }

        let semaphore = Arc::new(Semaphore::new(config.max_workers.max(1)));
        let wake = self.queue.wake_handle();

        loop {
            self.dispatch_available(&semaphore).await;

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = wake.notified() => {}
                _ = sleep(config.poll_interval) => {}
            }
        }

        // Running handlers each hold a permit
        let _drained = semaphore.acquire_many(config.max_workers.max(1) as u32).await;
        info!("Job worker stopped");
    }

    /// Claim until the queue is empty or every slot is busy
    async fn dispatch_available(&self, semaphore: &Arc<Semaphore>) {
        loop {
            let Ok(permit) = semaphore.clone().try_acquire_owned() else {
                debug!("All job slots busy");
                return;
            };

            let job = match self.claim().await {
                Ok(Some(job)) => job,
                Ok(None) => return,
                Err(e) => {
                    error!("Failed to claim job: {}", e);
                    return;
                }
            };

            let worker = self.clone();
            tokio::spawn(async move {
                let _permit = permit;
                worker.execute(job).await;
            });
        }
    }

    async fn claim(&self) -> Result<Option<JobRecord>, JobError> {
        let _guard = self.publish.lock().await;
        let job = self.queue.claim_next().await?;
        if let Some(job) = &job {
            debug!("Claimed {} job {} (attempt {})", job.kind(), job.id, job.attempts);
            self.emit(JobEvent::Started {
                id: job.id.clone(),
                kind: job.kind(),
                attempt: job.attempts,
            });
        }
        Ok(job)
    }

    /// Run one claimed job and record the outcome. Handler panics count as failures.
    async fn execute(&self, job: JobRecord) {
        let kind = job.kind();
        let result = match self.handlers.get(kind) {
            Some(handler) => {
                let job = job.clone();
                match tokio::spawn(async move { handler.handle(&job).await }).await {
                    Ok(result) => result,
                    Err(e) => Err(JobError::Handler(format!("Handler panicked: {}", e))),
                }
            }
            None => Err(JobError::Handler(format!("No handler registered for {}", kind))),
        };

        let _guard = self.publish.lock().await;
        match result {
            Ok(()) => match self.queue.mark_done(&job.id).await {
                Ok(()) => {
                    info!("Job {} ({}) done", job.id, kind);
                    self.emit(JobEvent::Finished {
                        id: job.id.clone(),
                        kind,
                        status: JobStatus::Done,
                        error: None,
                    });
                }
                Err(e) => error!("Failed to mark job {} done: {}", job.id, e),
            },
            Err(handler_error) => {
                let message = handler_error.to_string();
                match self.queue.mark_failed(&job.id, &message).await {
                    Ok(FailureOutcome::RetryScheduled { .. }) => {
                        self.emit(JobEvent::Finished {
                            id: job.id.clone(),
                            kind,
                            status: JobStatus::Pending,
                            error: Some(message),
                        });
                    }
                    Ok(FailureOutcome::Failed { cascaded }) => {
                        self.emit(JobEvent::Finished {
                            id: job.id.clone(),
                            kind,
                            status: JobStatus::Failed,
                            error: Some(message),
                        });
                        for id in cascaded {
                            self.emit(JobEvent::DependencyFailed {
                                id,
                                dependency: job.id.clone(),
                            });
                        }
                    }
                    Err(e) => error!("Failed to record failure of job {}: {}", job.id, e),
                }
            }
        }

        // Completion may unblock dependents or a retry
        self.queue.notify();
    }

    /// Run eligible jobs one at a time until none are claimable.
    /// Returns how many attempts were made.
    pub async fn run_until_idle(&self) -> Result<usize, JobError> {
        let mut attempts = 0;
        while let Some(job) = self.claim().await? {
            self.execute(job).await;
            attempts += 1;
        }
        Ok(attempts)
    }

    fn emit(&self, event: JobEvent) {
        if let Some(events) = &self.events {
            if events.send(event).is_err() {
                warn!("Job event receiver dropped");
            }
        }
    }
}
