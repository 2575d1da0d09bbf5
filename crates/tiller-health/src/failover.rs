//! Failover policy.
//!
//! Pure decisions over stored records: given which amphorae of a
//! balancer are dead, what must happen at the data plane right now and
//! what goes to the job queue. The engine in [`crate::tracker`]
//! executes these decisions.

use tiller_store::{
    Amphora, AmphoraId, AmphoraRole, AmphoraStatus, LoadBalancer, OperatingStatus, Topology,
};

/// What to do about a set of dead amphorae.
#[derive(Debug, Clone, PartialEq)]
pub struct FailoverPlan {
    /// Healthy BACKUP to promote at the data plane before any flow
    /// runs. Only set for a MASTER loss with a live peer.
    pub promote: Option<AmphoraId>,
    /// Amphorae the replacement flow must tear down and replace.
    pub failed: Vec<AmphoraId>,
}

/// Decide the response to `dead` amphorae of one balancer.
pub fn plan_failover(lb: &LoadBalancer, amphorae: &[Amphora], dead: &[AmphoraId]) -> FailoverPlan {
    let mut plan = FailoverPlan {
        promote: None,
        failed: dead.to_vec(),
    };
    if lb.topology != Topology::ActiveStandby {
        return plan;
    }

    let master_dead = amphorae
        .iter()
        .any(|a| dead.contains(&a.id) && a.role == AmphoraRole::Master);
    if master_dead {
        plan.promote = amphorae
            .iter()
            .find(|a| {
                a.role == AmphoraRole::Backup
                    && !dead.contains(&a.id)
                    && a.status == AmphoraStatus::Ready
            })
            .map(|a| a.id.clone());
    }
    plan
}

/// Derive a balancer's operating status from its amphora health.
///
/// ACTIVE iff every required amphora is healthy, ERROR iff none are,
/// DEGRADED in between. A healthy amphora whose heartbeat reports a
/// down listener also degrades the balancer.
pub fn derive_operating_status(
    required: usize,
    healthy: usize,
    data_plane_degraded: bool,
) -> OperatingStatus {
    if healthy == 0 {
        OperatingStatus::Error
    } else if healthy < required || data_plane_degraded {
        OperatingStatus::Degraded
    } else {
        OperatingStatus::Active
    }
}
