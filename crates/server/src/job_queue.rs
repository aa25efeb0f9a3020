//! Bounded-concurrency job queue for session creation
//!
//! When one user request fans out into N session creations, working-copy
//! creation (a filesystem + git operation) runs under a concurrency ceiling
//! instead of serially or unbounded. Each job reports waiting → active →
//! completed|failed on the event bus.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::debug;

use drydock_protocol::{DockEvent, JobState};

use crate::events::EventBus;

/// Handle to one enqueued job
pub struct JobHandle {
    pub id: u64,
    handle: JoinHandle<Result<(), String>>,
}

impl JobHandle {
    /// Wait for the job to finish.
    pub async fn join(self) -> Result<(), String> {
        match self.handle.await {
            Ok(result) => result,
            Err(e) => Err(format!("creation job panicked: {e}")),
        }
    }
}

pub struct CreationJobQueue {
    semaphore: Arc<Semaphore>,
    events: EventBus,
    next_id: AtomicU64,
}

impl CreationJobQueue {
    pub fn new(concurrency: usize, events: EventBus) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(concurrency.max(1))),
            events,
            next_id: AtomicU64::new(1),
        }
    }

    /// Enqueue a job. It waits for a permit, runs, and reports its state
    /// transitions; failures carry the job's own error string.
    pub fn enqueue<F, Fut>(&self, job: F) -> JobHandle
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), String>> + Send,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let semaphore = self.semaphore.clone();
        let events = self.events.clone();

        events.publish(DockEvent::JobStateChanged {
            job_id: id,
            state: JobState::Waiting,
            error: None,
        });

        let handle = tokio::spawn(async move {
            // Closed semaphore only happens at shutdown.
            let _permit = semaphore
                .acquire()
                .await
                .map_err(|_| "job queue shut down".to_string())?;

            debug!(component = "job_queue", event = "job.active", job_id = id);
            events.publish(DockEvent::JobStateChanged {
                job_id: id,
                state: JobState::Active,
                error: None,
            });

            match job().await {
                Ok(()) => {
                    events.publish(DockEvent::JobStateChanged {
                        job_id: id,
                        state: JobState::Completed,
                        error: None,
                    });
                    Ok(())
                }
                Err(e) => {
                    events.publish(DockEvent::JobStateChanged {
                        job_id: id,
                        state: JobState::Failed,
                        error: Some(e.clone()),
                    });
                    Err(e)
                }
            }
        });

        JobHandle { id, handle }
    }
}
