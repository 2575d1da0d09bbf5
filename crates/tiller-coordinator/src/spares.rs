//! Claim-guarded spare pool.
//!
//! The pool of pre-booted amphorae is shared by every flow in the
//! process, so handing one out happens under a claim on the reserved
//! key `spares-pool`. A busy pool is treated as empty: the caller falls
//! back to booting a fresh instance instead of blocking a flow on the
//! pool lease.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use tiller_flow::drivers::{DriverError, SparePool};
use tiller_store::{Amphora, AmphoraStatus, StateStore};

use crate::claims::{ClaimOutcome, ClaimService};

/// Claim key reserved for the spare pool. Load balancer IDs are
/// namespaced with a prefix so they can never collide with it.
pub const SPARES_CLAIM_KEY: &str = "spares-pool";

const SPARES_CLAIM_TTL: Duration = Duration::from_secs(10);

/// [`SparePool`] whose acquire/release run under the pool claim.
pub struct ClaimedSparePool {
    store: StateStore,
    claims: Arc<dyn ClaimService>,
}

impl ClaimedSparePool {
    pub fn new(store: StateStore, claims: Arc<dyn ClaimService>) -> Self {
        Self { store, claims }
    }
}

#[async_trait]
impl SparePool for ClaimedSparePool {
    async fn acquire(&self) -> Result<Option<Amphora>, DriverError> {
        let outcome = self
            .claims
            .claim(SPARES_CLAIM_KEY, SPARES_CLAIM_TTL)
            .await
            .map_err(|e| DriverError::Transient(e.to_string()))?;
        let claim = match outcome {
            ClaimOutcome::Claimed(claim) => claim,
            ClaimOutcome::Busy => {
                debug!("spare pool busy, falling back to fresh boot");
                return Ok(None);
            }
        };

        let result: Result<Option<Amphora>, DriverError> = (|| {
            let spares = self
                .store
                .list_spares()
                .map_err(|e| DriverError::Hard(e.to_string()))?;
            let Some(mut spare) = spares.into_iter().next() else {
                return Ok(None);
            };
            spare.status = AmphoraStatus::Allocated;
            self.store
                .put_amphora(&spare)
                .map_err(|e| DriverError::Hard(e.to_string()))?;
            Ok(Some(spare))
        })();

        let _ = self.claims.release(SPARES_CLAIM_KEY, &claim.token).await;
        result
    }

    async fn release(&self, amphora_id: &str) -> Result<(), DriverError> {
        let outcome = self
            .claims
            .claim(SPARES_CLAIM_KEY, SPARES_CLAIM_TTL)
            .await
            .map_err(|e| DriverError::Transient(e.to_string()))?;
        let claim = match outcome {
            ClaimOutcome::Claimed(claim) => claim,
            // Returning a spare must not be dropped on a busy pool.
            ClaimOutcome::Busy => {
                return Err(DriverError::Transient("spare pool busy".to_string()));
            }
        };

        let result: Result<(), DriverError> = (|| {
            let Some(mut amphora) = self
                .store
                .get_amphora(amphora_id)
                .map_err(|e| DriverError::Hard(e.to_string()))?
            else {
                return Ok(());
            };
            amphora.load_balancer_id = None;
            amphora.status = AmphoraStatus::Ready;
            self.store
                .put_amphora(&amphora)
                .map_err(|e| DriverError::Hard(e.to_string()))?;
            Ok(())
        })();

        let _ = self.claims.release(SPARES_CLAIM_KEY, &claim.token).await;
        result
    }
}
