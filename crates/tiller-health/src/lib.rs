//! tiller-health — heartbeat ingestion and failover decisions.
//!
//! Amphorae send signed UDP heartbeats every interval T. The listener
//! verifies each packet's MAC and age, counts what it drops, and hands
//! accepted payloads to the liveness engine over a bounded queue that
//! sheds the oldest record under overload; the receive path never
//! waits on a slow consumer.
//!
//! ```text
//! UDP :5555 ──▶ HeartbeatListener ──▶ HandoffQueue ──▶ LivenessEngine
//!                  (verify, count)      (bounded)        │       │
//!                                                 store writes   job queue
//! ```
//!
//! The engine drives a HEALTHY → SUSPECT → DEAD state machine per
//! amphora and emits exactly one failover job per dead episode, with a
//! topology-aware policy: a dead ACTIVE_STANDBY master gets its healthy
//! backup promoted at the data plane immediately, before the
//! replacement flow ever reaches the queue.

pub mod error;
pub mod failover;
pub mod listener;
pub mod tracker;
pub mod wire;

pub use error::{HealthError, WireError};
pub use listener::{HandoffQueue, HeartbeatListener, ListenerStats, StatsSnapshot};
pub use tracker::{HealthState, LivenessConfig, LivenessEngine};
