//! Worker pool.
//!
//! Each worker loops: dequeue a job, claim its load balancer, run the
//! matching flow with a background lease renewal, release. A balancer
//! whose claim is busy sends the job back to the queue; losing the
//! lease mid-flow aborts the run and requeues the job for another
//! attempt.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use tiller_flow::flows::flow_for_job;
use tiller_flow::task::epoch_secs;
use tiller_flow::{FlowError, FlowRunner, TaskContext};
use tiller_store::{Job, ProvisioningStatus, StateStore};

use crate::claims::{Claim, ClaimOutcome, ClaimService, RenewalOutcome};
use crate::error::CoordinatorError;
use crate::queue::JobQueue;

/// Claim key for one load balancer. Namespaced so balancer IDs cannot
/// collide with reserved keys like the spare pool's.
pub fn claim_key(lb_id: &str) -> String {
    format!("loadbalancer/{lb_id}")
}

#[derive(Debug, Clone, Copy)]
pub struct WorkerConfig {
    pub workers: usize,
    /// Lease TTL on a claimed balancer.
    pub claim_ttl: Duration,
    /// How often a running flow's lease is renewed. Must be well under
    /// the TTL.
    pub renew_interval: Duration,
    /// Idle poll interval when the queue is empty.
    pub poll_interval: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            workers: 2,
            claim_ttl: Duration::from_secs(30),
            renew_interval: Duration::from_secs(10),
            poll_interval: Duration::from_millis(500),
        }
    }
}

/// Pulls lifecycle jobs off the queue and executes them under claims.
pub struct WorkerPool {
    store: StateStore,
    queue: Arc<dyn JobQueue>,
    claims: Arc<dyn ClaimService>,
    ctx: TaskContext,
    config: WorkerConfig,
}

impl WorkerPool {
    pub fn new(
        store: StateStore,
        queue: Arc<dyn JobQueue>,
        claims: Arc<dyn ClaimService>,
        ctx: TaskContext,
    ) -> Self {
        Self {
            store,
            queue,
            claims,
            ctx,
            config: WorkerConfig::default(),
        }
    }

    pub fn with_config(mut self, config: WorkerConfig) -> Self {
        self.config = config;
        self
    }

    /// Start the configured number of workers. They run until the
    /// shutdown signal flips to true.
    pub fn spawn(self, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        let pool = Arc::new(self);
        (0..pool.config.workers)
            .map(|worker| {
                let pool = pool.clone();
                let shutdown = shutdown.clone();
                tokio::spawn(async move { pool.worker_loop(worker, shutdown).await })
            })
            .collect()
    }

    async fn worker_loop(&self, worker: usize, mut shutdown: watch::Receiver<bool>) {
        info!(worker, "worker started");
        loop {
            if *shutdown.borrow() {
                break;
            }
            let job = match self.queue.dequeue().await {
                Ok(job) => job,
                Err(e) => {
                    error!(worker, error = %e, "dequeue failed");
                    None
                }
            };
            match job {
                Some(job) => {
                    if let Err(e) = self.process(worker, &job).await {
                        error!(worker, job_id = %job.id, error = %e, "job processing error");
                    }
                }
                None => {
                    tokio::select! {
                        _ = shutdown.changed() => {}
                        _ = self.queue.wait() => {}
                        _ = tokio::time::sleep(self.config.poll_interval) => {}
                    }
                }
            }
        }
        info!(worker, "worker stopped");
    }

    async fn process(&self, worker: usize, job: &Job) -> Result<(), CoordinatorError> {
        let key = claim_key(&job.load_balancer_id);
        let claim = match self.claims.claim(&key, self.config.claim_ttl).await? {
            ClaimOutcome::Claimed(claim) => claim,
            ClaimOutcome::Busy => {
                debug!(worker, job_id = %job.id, lb_id = %job.load_balancer_id, "balancer busy, requeueing");
                self.queue.enqueue(job.clone()).await?;
                tokio::time::sleep(self.config.poll_interval).await;
                return Ok(());
            }
        };

        info!(worker, job_id = %job.id, lb_id = %job.load_balancer_id, operation = ?job.operation, "job claimed");
        let result = self.run_job(job, &claim).await;
        let _ = self.claims.release(&key, &claim.token).await;

        match result {
            Ok(()) => {
                info!(worker, job_id = %job.id, "job completed");
            }
            Err(FlowError::Aborted) => {
                warn!(worker, job_id = %job.id, "lease lost, requeueing");
                self.queue.enqueue(job.clone()).await?;
            }
            Err(e) => {
                warn!(worker, job_id = %job.id, error = %e, "job failed");
                self.mark_failed(&job.load_balancer_id, &e.to_string())?;
            }
        }
        Ok(())
    }

    async fn run_job(&self, job: &Job, claim: &Claim) -> Result<(), FlowError> {
        let lb = self
            .store
            .get_load_balancer(&job.load_balancer_id)?
            .ok_or_else(|| FlowError::TaskFailed {
                node: "load-job".to_string(),
                reason: format!("unknown load balancer {}", job.load_balancer_id),
            })?;
        let amphorae = self.store.list_amphorae_for_lb(&lb.id)?;
        let (flow, bindings) = flow_for_job(job, &lb, &amphorae)?;

        let (abort_tx, abort_rx) = watch::channel(false);
        let renewal = self.spawn_renewal(claim.clone(), abort_tx);

        let result = FlowRunner::new(self.store.clone())
            .run(&job.id, &lb.id, &flow, &self.ctx, bindings, abort_rx)
            .await;
        renewal.abort();
        result.map(|_| ())
    }

    /// Keep the lease alive while the flow runs; flip the abort signal
    /// the moment the lease cannot be renewed.
    fn spawn_renewal(&self, claim: Claim, abort: watch::Sender<bool>) -> JoinHandle<()> {
        let claims = self.claims.clone();
        let interval = self.config.renew_interval;
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                match claims.renew(&claim.key, &claim.token).await {
                    Ok(RenewalOutcome::Renewed) => {}
                    Ok(outcome) => {
                        warn!(key = %claim.key, ?outcome, "lease renewal failed");
                        let _ = abort.send(true);
                        break;
                    }
                    Err(e) => {
                        warn!(key = %claim.key, error = %e, "lease renewal errored");
                        let _ = abort.send(true);
                        break;
                    }
                }
            }
        })
    }

    fn mark_failed(&self, lb_id: &str, reason: &str) -> Result<(), CoordinatorError> {
        let Some(mut lb) = self.store.get_load_balancer(lb_id)? else {
            return Ok(());
        };
        lb.provisioning_status = ProvisioningStatus::Error;
        lb.fault_reason = Some(reason.to_string());
        lb.updated_at = epoch_secs();
        self.store.put_load_balancer(&lb)?;
        Ok(())
    }
}
