//! tiller-coordinator — job execution with per-balancer exclusion.
//!
//! Lifecycle jobs land on a queue; a pool of workers pulls them off and
//! runs the matching flow. Before touching a load balancer a worker
//! must hold its claim, a TTL lease keyed by the balancer's ID, and a
//! background renewal keeps the lease alive for the duration of the
//! flow. Losing the lease flips the runner's abort signal; the flow
//! halts and reverts, and the job goes back on the queue for whichever
//! worker claims the balancer next. A worker that crashes outright
//! leaves its per-node progress in the store, and the next claim
//! holder resumes the run from it.
//!
//! The shared spare pool is guarded the same way, under its own
//! reserved claim key, so two concurrent flows never receive the same
//! spare.

pub mod claims;
pub mod error;
pub mod queue;
pub mod spares;
pub mod worker;

pub use claims::{Claim, ClaimOutcome, ClaimService, MemoryClaimService, RenewalOutcome};
pub use error::CoordinatorError;
pub use queue::{JobQueue, MemoryJobQueue};
pub use spares::ClaimedSparePool;
pub use worker::{WorkerConfig, WorkerPool};
