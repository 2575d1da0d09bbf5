//! Flow engine error types.

use thiserror::Error;

use tiller_store::StateError;

/// Errors raised by flow construction and execution.
#[derive(Debug, Error)]
pub enum FlowError {
    #[error("task {node} failed: {reason}")]
    TaskFailed { node: String, reason: String },

    #[error("flow aborted: claim lease lost")]
    Aborted,

    #[error("duplicate node name: {0}")]
    DuplicateNode(String),

    #[error("node {node} depends on unknown node {dep}")]
    UnknownDependency { node: String, dep: String },

    #[error("flow contains a dependency cycle involving {0}")]
    Cycle(String),

    #[error("state store error: {0}")]
    State(#[from] StateError),
}
