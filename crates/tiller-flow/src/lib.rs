//! tiller-flow — the task graph engine.
//!
//! Lifecycle requests (create, update, delete, failover) become flows: DAGs
//! of atomic task nodes, each with an `execute` and a `revert` action, with
//! named inputs and outputs threaded between nodes. The runner executes
//! independent branches concurrently, persists per-node progress so a
//! crashed executor can resume, and on failure reverts every completed node
//! in reverse order, best-effort.
//!
//! # Architecture
//!
//! ```text
//! FlowBuilder ──build()──▶ Flow (validated DAG)
//!                            │
//!                  FlowRunner::run(run_id, flow, ctx, ...)
//!                            │
//!          ┌─────────────────┼──────────────────┐
//!          ▼                 ▼                  ▼
//!     compute driver    network driver     agent channel
//! ```
//!
//! Concrete tasks live in [`tasks`]; flow builders for the four lifecycle
//! operations live in [`flows`]. Collaborator traits (compute, network,
//! spares pool) live in [`drivers`] together with in-memory implementations
//! used by tests and the single-process demo mode.

pub mod dag;
pub mod drivers;
pub mod error;
pub mod flows;
pub mod runner;
pub mod task;
pub mod tasks;

pub use dag::{Flow, FlowBuilder};
pub use error::FlowError;
pub use runner::FlowRunner;
pub use task::{Bindings, RetryPolicy, Task, TaskContext, TaskError};
