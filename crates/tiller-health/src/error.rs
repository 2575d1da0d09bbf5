use thiserror::Error;

/// Why a heartbeat datagram was rejected.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum WireError {
    #[error("datagram too short for a MAC")]
    TooShort,

    #[error("MAC verification failed")]
    BadMac,

    #[error("payload is not valid JSON: {0}")]
    BadJson(String),

    #[error("heartbeat too old: sent {age_secs}s ago")]
    TooOld { age_secs: u64 },
}

/// Errors from the health subsystem.
#[derive(Debug, Error)]
pub enum HealthError {
    #[error(transparent)]
    State(#[from] tiller_store::StateError),

    #[error("job queue: {0}")]
    Queue(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
