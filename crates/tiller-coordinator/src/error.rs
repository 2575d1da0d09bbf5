use thiserror::Error;

/// Errors from the coordination layer.
#[derive(Debug, Error)]
pub enum CoordinatorError {
    #[error("claim service: {0}")]
    Claim(String),

    #[error("job queue: {0}")]
    Queue(String),

    #[error(transparent)]
    State(#[from] tiller_store::StateError),
}
