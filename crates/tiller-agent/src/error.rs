//! Agent client error types.

use thiserror::Error;

/// Errors raised by agent protocol calls.
///
/// Transient variants are retried at the call site with a bounded
/// budget; everything else is a hard failure that triggers the
/// enclosing flow's revert cascade.
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("request to {0} timed out")]
    Timeout(String),

    #[error("transport error talking to {endpoint}: {reason}")]
    Transport { endpoint: String, reason: String },

    #[error("agent at {0} rejected authentication")]
    AuthRejected(String),

    #[error("malformed response from {endpoint}: {reason}")]
    BadResponse { endpoint: String, reason: String },

    #[error("agent at {endpoint} reported an error: {reason}")]
    AgentFault { endpoint: String, reason: String },
}

impl AgentError {
    /// Whether the call may succeed if simply retried.
    pub fn is_transient(&self) -> bool {
        matches!(self, AgentError::Timeout(_) | AgentError::Transport { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transience_classification() {
        assert!(AgentError::Timeout("192.0.2.1:9443".into()).is_transient());
        assert!(AgentError::Transport {
            endpoint: "192.0.2.1:9443".into(),
            reason: "connection refused".into(),
        }
        .is_transient());

        assert!(!AgentError::AuthRejected("192.0.2.1:9443".into()).is_transient());
        assert!(!AgentError::BadResponse {
            endpoint: "192.0.2.1:9443".into(),
            reason: "truncated body".into(),
        }
        .is_transient());
        assert!(!AgentError::AgentFault {
            endpoint: "192.0.2.1:9443".into(),
            reason: "haproxy reload failed".into(),
        }
        .is_transient());
    }
}
