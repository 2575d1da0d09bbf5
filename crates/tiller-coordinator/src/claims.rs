//! Claim leases.
//!
//! A claim is an exclusive, time-limited lease on a string key. Workers
//! claim a load balancer before running a flow against it and renew the
//! lease while the flow runs; a lease that is not renewed within its
//! TTL expires and the key becomes claimable again, so a crashed worker
//! never wedges a balancer.
//!
//! Renewal is fenced by the claim token: a worker whose lease expired
//! and was re-claimed by someone else gets [`RenewalOutcome::InvalidToken`]
//! rather than silently extending the new holder's lease.

use std::collections::HashMap;
use std::hash::{BuildHasher, Hasher};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tracing::debug;

use crate::error::CoordinatorError;

/// A held lease.
#[derive(Debug, Clone)]
pub struct Claim {
    pub key: String,
    /// Fencing token; required to renew or release.
    pub token: String,
    /// How long the lease is valid before it must be renewed.
    pub ttl: Duration,
}

/// Outcome of a claim attempt.
#[derive(Debug, Clone)]
pub enum ClaimOutcome {
    Claimed(Claim),
    /// Someone else holds a live lease on this key.
    Busy,
}

/// Outcome of a renewal attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenewalOutcome {
    Renewed,
    /// The lease expired and nobody has re-claimed the key yet.
    Lost,
    /// The key is held under a different token.
    InvalidToken,
}

/// Exclusive TTL leases on string keys.
#[async_trait]
pub trait ClaimService: Send + Sync {
    async fn claim(&self, key: &str, ttl: Duration) -> Result<ClaimOutcome, CoordinatorError>;

    async fn renew(&self, key: &str, token: &str) -> Result<RenewalOutcome, CoordinatorError>;

    async fn release(&self, key: &str, token: &str) -> Result<(), CoordinatorError>;
}

struct Lease {
    token: String,
    ttl: Duration,
    expires_at: Instant,
}

/// In-process [`ClaimService`].
///
/// Exclusion holds across every worker in one process, which is the
/// deployment unit here; a multi-process control plane would back this
/// trait with shared storage.
#[derive(Default)]
pub struct MemoryClaimService {
    leases: Mutex<HashMap<String, Lease>>,
}

impl MemoryClaimService {
    pub fn new() -> Self {
        Self::default()
    }

    fn fresh_token() -> String {
        let mut hasher = std::collections::hash_map::RandomState::new().build_hasher();
        hasher.write_u128(
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap_or_default()
                .as_nanos(),
        );
        format!("lease-{:016x}", hasher.finish())
    }
}

#[async_trait]
impl ClaimService for MemoryClaimService {
    async fn claim(&self, key: &str, ttl: Duration) -> Result<ClaimOutcome, CoordinatorError> {
        let mut leases = self
            .leases
            .lock()
            .map_err(|e| CoordinatorError::Claim(e.to_string()))?;
        let now = Instant::now();
        if let Some(lease) = leases.get(key) {
            if lease.expires_at > now {
                return Ok(ClaimOutcome::Busy);
            }
            debug!(%key, "expired lease evicted");
        }
        let token = Self::fresh_token();
        leases.insert(
            key.to_string(),
            Lease {
                token: token.clone(),
                ttl,
                expires_at: now + ttl,
            },
        );
        Ok(ClaimOutcome::Claimed(Claim {
            key: key.to_string(),
            token,
            ttl,
        }))
    }

    async fn renew(&self, key: &str, token: &str) -> Result<RenewalOutcome, CoordinatorError> {
        let mut leases = self
            .leases
            .lock()
            .map_err(|e| CoordinatorError::Claim(e.to_string()))?;
        let now = Instant::now();
        match leases.get_mut(key) {
            None => Ok(RenewalOutcome::Lost),
            Some(lease) if lease.token != token => Ok(RenewalOutcome::InvalidToken),
            Some(lease) if lease.expires_at <= now => {
                leases.remove(key);
                Ok(RenewalOutcome::Lost)
            }
            Some(lease) => {
                lease.expires_at = now + lease.ttl;
                Ok(RenewalOutcome::Renewed)
            }
        }
    }

    async fn release(&self, key: &str, token: &str) -> Result<(), CoordinatorError> {
        let mut leases = self
            .leases
            .lock()
            .map_err(|e| CoordinatorError::Claim(e.to_string()))?;
        if leases.get(key).is_some_and(|l| l.token == token) {
            leases.remove(key);
        }
        Ok(())
    }
}
