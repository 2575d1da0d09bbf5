//! tiller-agent — protocol client for the amphora management endpoint.
//!
//! Every amphora runs a small agent reachable on the management network.
//! This crate exposes the four idempotent operations the control plane
//! needs against it: `provision(config)`, `update(config)`,
//! `get_status()`, and `get_diagnostics()`.
//!
//! Calls travel over an authenticated HTTP channel: each request body is
//! signed with HMAC-SHA256 over a pre-shared key. Transient transport
//! failures are retried a small bounded number of times per call; hard
//! failures (auth rejection, malformed responses, agent-reported errors)
//! surface immediately to the calling task node so the enclosing flow
//! can revert.
//!
//! Configuration pushes are safe to repeat: the agent treats a replayed
//! document (same digest) as a no-op, which makes task-level retries
//! after a timed-out call with unknown outcome harmless.

pub mod client;
pub mod error;
pub mod memory;

pub use client::{config_digest, AgentChannel, HttpAgentClient};
pub use error::AgentError;
pub use memory::MemoryAgent;
