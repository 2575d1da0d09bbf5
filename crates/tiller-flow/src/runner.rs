//! Flow runner.
//!
//! Executes a validated [`Flow`]: ready nodes are dispatched onto the
//! runtime as soon as their dependencies complete, so independent
//! branches run concurrently. Every completed node's outputs are
//! persisted to the store before its dependents become eligible, which
//! lets another worker resume a crashed run without re-executing
//! completed nodes.
//!
//! When a node exhausts its retries the runner stops dispatching,
//! drains in-flight nodes, and reverts every completed node in reverse
//! completion order. A failed revert is logged with the node's recorded
//! outputs so leaked external resources can be found; it never stops
//! the rest of the cascade. Losing the claim lease halts dispatch the
//! same way and reverts what completed; resuming from persisted
//! progress is for executors that crashed without getting to revert.

use std::collections::HashMap;

use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use tiller_store::{FlowRun, FlowRunState, NodeResult, StateStore};

use crate::dag::{Flow, FlowNodeSpec};
use crate::error::FlowError;
use crate::task::{epoch_secs, Bindings, TaskContext, TaskError};

/// Executes flows against a state store.
#[derive(Clone)]
pub struct FlowRunner {
    store: StateStore,
}

impl FlowRunner {
    pub fn new(store: StateStore) -> Self {
        Self { store }
    }

    /// Run a flow to completion, resuming from persisted progress if a
    /// run with this ID was interrupted before.
    ///
    /// `abort` is the lease-loss signal: when it flips to true the
    /// runner stops dispatching new nodes, drains in-flight ones, and
    /// reverts what completed. Returns the final bindings on success.
    pub async fn run(
        &self,
        run_id: &str,
        load_balancer_id: &str,
        flow: &Flow,
        ctx: &TaskContext,
        initial: Bindings,
        mut abort: watch::Receiver<bool>,
    ) -> Result<Bindings, FlowError> {
        self.ensure_run_record(run_id, load_balancer_id, flow)?;

        let by_name: HashMap<&str, &FlowNodeSpec> =
            flow.nodes().iter().map(|n| (n.name.as_str(), n)).collect();

        let mut bindings = initial;

        // Resume: nodes completed by a previous executor of this run.
        let mut completed: Vec<(String, Bindings)> = Vec::new();
        for result in self.store.list_node_results(run_id)? {
            let outputs = bindings_from_value(result.outputs);
            for (k, v) in &outputs {
                bindings.insert(k.clone(), v.clone());
            }
            debug!(%run_id, node = %result.node, "resuming past completed node");
            completed.push((result.node, outputs));
        }
        let done: Vec<String> = completed.iter().map(|(n, _)| n.clone()).collect();

        // Remaining dependency counts per pending node.
        let mut indegree: HashMap<String, usize> = HashMap::new();
        let mut dependents: HashMap<String, Vec<String>> = HashMap::new();
        for node in flow.nodes() {
            if done.contains(&node.name) {
                continue;
            }
            let remaining = node
                .deps
                .iter()
                .filter(|d| !done.contains(d))
                .count();
            indegree.insert(node.name.clone(), remaining);
            for dep in &node.deps {
                dependents
                    .entry(dep.clone())
                    .or_default()
                    .push(node.name.clone());
            }
        }

        let mut ready: Vec<String> = indegree
            .iter()
            .filter(|&(_, &n)| n == 0)
            .map(|(name, _)| name.clone())
            .collect();
        let mut pending = indegree.len();

        let mut in_flight: JoinSet<(String, Result<Bindings, TaskError>)> = JoinSet::new();
        let mut failure: Option<(String, String)> = None;
        let mut aborted = *abort.borrow();
        let mut abort_closed = false;

        while pending > 0 || !in_flight.is_empty() {
            if failure.is_none() && !aborted {
                for name in ready.drain(..) {
                    let spec = by_name[name.as_str()];
                    let task = spec.task.clone();
                    let task_ctx = ctx.clone();
                    let inputs = bindings.clone();
                    debug!(%run_id, node = %name, "dispatching node");
                    in_flight.spawn(async move {
                        let result = execute_with_retry(&*task, &task_ctx, &inputs).await;
                        (name, result)
                    });
                }
            } else {
                ready.clear();
            }

            if in_flight.is_empty() {
                break;
            }

            tokio::select! {
                Some(joined) = in_flight.join_next() => {
                    let (name, result) = match joined {
                        Ok(pair) => pair,
                        Err(e) => {
                            // A panicking task is a hard failure of the flow.
                            error!(%run_id, error = %e, "task panicked");
                            failure = Some(("<join>".to_string(), e.to_string()));
                            pending = pending.saturating_sub(1);
                            continue;
                        }
                    };
                    pending -= 1;
                    match result {
                        Ok(outputs) => {
                            let position = completed.len() as u32;
                            self.store.put_node_result(&NodeResult {
                                run_id: run_id.to_string(),
                                node: name.clone(),
                                position,
                                outputs: bindings_to_value(&outputs),
                                completed_at: epoch_secs(),
                            })?;
                            for (k, v) in &outputs {
                                bindings.insert(k.clone(), v.clone());
                            }
                            debug!(%run_id, node = %name, "node completed");
                            completed.push((name.clone(), outputs));
                            for dependent in dependents.get(&name).cloned().unwrap_or_default() {
                                if let Some(n) = indegree.get_mut(&dependent) {
                                    *n -= 1;
                                    if *n == 0 {
                                        ready.push(dependent);
                                    }
                                }
                            }
                        }
                        Err(e) => {
                            warn!(%run_id, node = %name, error = %e, "node failed");
                            failure = Some((name, e.to_string()));
                        }
                    }
                }
                changed = abort.changed(), if !abort_closed => {
                    match changed {
                        Ok(()) if *abort.borrow() => {
                            warn!(%run_id, "abort signalled, halting dispatch");
                            aborted = true;
                        }
                        Ok(()) => {}
                        Err(_) => abort_closed = true,
                    }
                }
            }
        }

        if aborted && failure.is_none() {
            self.revert_completed(run_id, flow, ctx, &bindings, &completed)
                .await;
            self.store.set_flow_run_state(
                run_id,
                FlowRunState::Failed,
                Some("claim lease lost".to_string()),
                epoch_secs(),
            )?;
            self.store.delete_node_results(run_id)?;
            return Err(FlowError::Aborted);
        }

        if let Some((node, reason)) = failure {
            self.revert_completed(run_id, flow, ctx, &bindings, &completed)
                .await;
            self.store.set_flow_run_state(
                run_id,
                FlowRunState::Reverted,
                Some(format!("{node}: {reason}")),
                epoch_secs(),
            )?;
            self.store.delete_node_results(run_id)?;
            return Err(FlowError::TaskFailed { node, reason });
        }

        self.store
            .set_flow_run_state(run_id, FlowRunState::Completed, None, epoch_secs())?;
        self.store.delete_node_results(run_id)?;
        info!(%run_id, flow = %flow.name(), nodes = completed.len(), "flow completed");
        Ok(bindings)
    }

    /// Create the durable run record unless a previous executor already did.
    fn ensure_run_record(
        &self,
        run_id: &str,
        load_balancer_id: &str,
        flow: &Flow,
    ) -> Result<(), FlowError> {
        if self.store.get_flow_run(run_id)?.is_none() {
            let now = epoch_secs();
            self.store.put_flow_run(&FlowRun {
                id: run_id.to_string(),
                load_balancer_id: load_balancer_id.to_string(),
                flow_name: flow.name().to_string(),
                state: FlowRunState::Running,
                failure: None,
                created_at: now,
                updated_at: now,
            })?;
        } else {
            self.store
                .set_flow_run_state(run_id, FlowRunState::Running, None, epoch_secs())?;
        }
        Ok(())
    }

    /// Revert completed nodes in reverse completion order, best-effort.
    async fn revert_completed(
        &self,
        run_id: &str,
        flow: &Flow,
        ctx: &TaskContext,
        bindings: &Bindings,
        completed: &[(String, Bindings)],
    ) {
        let by_name: HashMap<&str, &FlowNodeSpec> =
            flow.nodes().iter().map(|n| (n.name.as_str(), n)).collect();

        for (name, outputs) in completed.iter().rev() {
            let Some(spec) = by_name.get(name.as_str()) else {
                warn!(%run_id, node = %name, "completed node missing from flow definition, skipping revert");
                continue;
            };
            debug!(%run_id, node = %name, "reverting node");
            if let Err(e) = spec.task.revert(ctx, bindings, outputs).await {
                // Keep going: the remaining nodes still get reverted.
                error!(
                    %run_id,
                    node = %name,
                    error = %e,
                    outputs = %bindings_to_value(outputs),
                    "revert failed, external resources may be leaked"
                );
            }
        }
    }
}

/// Serialize a binding map for storage.
fn bindings_to_value(bindings: &Bindings) -> serde_json::Value {
    serde_json::Value::Object(bindings.clone().into_iter().collect())
}

/// Deserialize a stored binding map.
fn bindings_from_value(value: serde_json::Value) -> Bindings {
    match value {
        serde_json::Value::Object(map) => map.into_iter().collect(),
        _ => Bindings::new(),
    }
}

/// Run one node with its transient retry budget.
async fn execute_with_retry(
    task: &dyn crate::task::Task,
    ctx: &TaskContext,
    inputs: &Bindings,
) -> Result<Bindings, TaskError> {
    let policy = task.retry();
    let mut backoff = policy.backoff;
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        match task.execute(ctx, inputs).await {
            Ok(outputs) => return Ok(outputs),
            Err(e) if e.is_transient() && attempt < policy.max_attempts => {
                debug!(node = %task.name(), attempt, error = %e, "transient failure, retrying node");
                tokio::time::sleep(backoff).await;
                backoff *= 2;
            }
            Err(e) => return Err(e),
        }
    }
}
