//! tiller-store — embedded state store for the Tiller control plane.
//!
//! Holds the persisted object graph: load balancers, amphorae, and
//! flow-run progress records. All values are JSON-serialized into redb
//! tables; an in-memory backend is available for testing.
//!
//! Write discipline: load balancer and amphora rows are mutated only by
//! the worker holding the claim for that load balancer, with one
//! exception — the heartbeat-derived fields (`last_seen`,
//! `last_sequence`) are written through [`StateStore::record_heartbeat`]
//! by the heartbeat path without a claim.

pub mod error;
pub mod store;
pub mod tables;
pub mod types;

pub use error::{StateError, StateResult};
pub use store::StateStore;
pub use types::*;
