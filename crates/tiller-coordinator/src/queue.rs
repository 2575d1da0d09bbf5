//! Lifecycle job queue.
//!
//! FIFO with coalescing: a job whose (balancer, operation) pair is
//! already pending is dropped on enqueue, so a flapping health check
//! cannot pile up identical failover jobs faster than workers drain
//! them.

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::sync::Notify;
use tracing::debug;

use tiller_store::Job;

use crate::error::CoordinatorError;

/// Queue of pending lifecycle jobs.
#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Add a job. Returns false if an identical job was already pending.
    async fn enqueue(&self, job: Job) -> Result<bool, CoordinatorError>;

    /// Take the oldest pending job, if any.
    async fn dequeue(&self) -> Result<Option<Job>, CoordinatorError>;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Resolves once a job may be available. Spurious wakeups allowed.
    async fn wait(&self);
}

/// In-process [`JobQueue`].
#[derive(Default)]
pub struct MemoryJobQueue {
    inner: Mutex<VecDeque<Job>>,
    notify: Notify,
}

impl MemoryJobQueue {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl JobQueue for MemoryJobQueue {
    async fn enqueue(&self, job: Job) -> Result<bool, CoordinatorError> {
        {
            let mut inner = self
                .inner
                .lock()
                .map_err(|e| CoordinatorError::Queue(e.to_string()))?;
            let duplicate = inner.iter().any(|pending| {
                pending.load_balancer_id == job.load_balancer_id
                    && pending.operation == job.operation
            });
            if duplicate {
                debug!(lb_id = %job.load_balancer_id, operation = ?job.operation, "duplicate job coalesced");
                return Ok(false);
            }
            inner.push_back(job);
        }
        self.notify.notify_one();
        Ok(true)
    }

    async fn dequeue(&self) -> Result<Option<Job>, CoordinatorError> {
        Ok(self
            .inner
            .lock()
            .map_err(|e| CoordinatorError::Queue(e.to_string()))?
            .pop_front())
    }

    fn len(&self) -> usize {
        self.inner.lock().map(|q| q.len()).unwrap_or(0)
    }

    async fn wait(&self) {
        self.notify.notified().await;
    }
}
