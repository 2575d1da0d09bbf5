//! Concrete task library.
//!
//! One file per concern: network plumbing, amphora lifecycle, and
//! load-balancer bookkeeping. Flow builders in [`crate::flows`] wire
//! these together; each task takes its binding keys as constructor
//! parameters so the same task type can appear once per amphora branch
//! in a flow.

pub mod amphora;
pub mod lifecycle;
pub mod network;

use std::hash::{BuildHasher, Hasher};

/// Generate a fresh opaque identifier with the given prefix.
pub fn fresh_id(prefix: &str) -> String {
    let mut hasher = std::collections::hash_map::RandomState::new().build_hasher();
    hasher.write_u128(
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos(),
    );
    format!("{prefix}-{:016x}", hasher.finish())
}
