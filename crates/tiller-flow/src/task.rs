//! Task node contract.
//!
//! A task is one atomic, revertible operation against a collaborator
//! (compute, network, agent, or the store). Inputs and outputs are
//! threaded between nodes by name through a shared binding map.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use tiller_agent::AgentChannel;
use tiller_store::StateStore;

use crate::drivers::{ComputeDriver, NetworkDriver, SparePool};

/// Named values threaded between task nodes.
pub type Bindings = HashMap<String, serde_json::Value>;

/// Failure of a single task attempt.
#[derive(Debug, Error)]
pub enum TaskError {
    /// May succeed on retry; consumed by the node's retry policy.
    #[error("transient: {0}")]
    Transient(String),

    /// Fails the node immediately and triggers the revert cascade.
    #[error("{0}")]
    Hard(String),
}

impl TaskError {
    pub fn is_transient(&self) -> bool {
        matches!(self, TaskError::Transient(_))
    }
}

impl From<tiller_agent::AgentError> for TaskError {
    fn from(e: tiller_agent::AgentError) -> Self {
        if e.is_transient() {
            TaskError::Transient(e.to_string())
        } else {
            TaskError::Hard(e.to_string())
        }
    }
}

impl From<tiller_store::StateError> for TaskError {
    fn from(e: tiller_store::StateError) -> Self {
        TaskError::Hard(e.to_string())
    }
}

/// Bounded retry applied to transient task failures before the node is
/// considered failed. Retries are invisible to the rest of the flow.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    /// Initial delay between attempts; doubles per retry.
    pub backoff: Duration,
}

impl RetryPolicy {
    /// Single attempt, no retries.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            backoff: Duration::ZERO,
        }
    }

    pub fn new(max_attempts: u32, backoff: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff,
        }
    }
}

/// Collaborator handles passed to every task.
///
/// Resolved once at process start and shared; tasks never reach for
/// globals.
#[derive(Clone)]
pub struct TaskContext {
    pub store: StateStore,
    pub compute: Arc<dyn ComputeDriver>,
    pub network: Arc<dyn NetworkDriver>,
    pub agent: Arc<dyn AgentChannel>,
    pub spares: Arc<dyn SparePool>,
}

/// An atomic, revertible operation within a flow.
///
/// `execute` performs the forward action and returns new bindings.
/// `revert` undoes it, best-effort, given the bindings visible at
/// failure time and this node's own recorded outputs. Revert is not
/// guaranteed to restore exact prior state; failures to revert are
/// logged with enough context to find leaked resources.
#[async_trait]
pub trait Task: Send + Sync {
    /// Node name, unique within its flow.
    fn name(&self) -> String;

    /// Retry policy applied to transient failures of `execute`.
    fn retry(&self) -> RetryPolicy {
        RetryPolicy::none()
    }

    /// Perform the forward action.
    async fn execute(&self, ctx: &TaskContext, inputs: &Bindings) -> Result<Bindings, TaskError>;

    /// Undo the forward action. Default: nothing to undo.
    async fn revert(
        &self,
        _ctx: &TaskContext,
        _inputs: &Bindings,
        _outputs: &Bindings,
    ) -> Result<(), TaskError> {
        Ok(())
    }
}

/// Read a required string binding.
pub fn require_str<'a>(bindings: &'a Bindings, key: &str) -> Result<&'a str, TaskError> {
    bindings
        .get(key)
        .and_then(|v| v.as_str())
        .ok_or_else(|| TaskError::Hard(format!("missing required binding: {key}")))
}

pub use tiller_store::epoch_secs;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_policy_floors_at_one_attempt() {
        let policy = RetryPolicy::new(0, Duration::ZERO);
        assert_eq!(policy.max_attempts, 1);
        assert_eq!(RetryPolicy::none().max_attempts, 1);
    }

    #[test]
    fn agent_errors_map_to_transience() {
        let transient: TaskError =
            tiller_agent::AgentError::Timeout("192.0.2.1:9443".into()).into();
        assert!(transient.is_transient());

        let hard: TaskError =
            tiller_agent::AgentError::AuthRejected("192.0.2.1:9443".into()).into();
        assert!(!hard.is_transient());
    }

    #[test]
    fn require_str_reports_missing_binding() {
        let mut bindings = Bindings::new();
        bindings.insert("amphora_0".to_string(), serde_json::json!("amp-1"));

        assert_eq!(require_str(&bindings, "amphora_0").unwrap(), "amp-1");
        assert!(require_str(&bindings, "amphora_1").is_err());
    }
}
