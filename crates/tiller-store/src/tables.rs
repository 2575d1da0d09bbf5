//! redb table definitions for the Tiller state store.
//!
//! Each table uses `&str` keys and `&[u8]` values (JSON-serialized domain types).
//! Composite keys follow the pattern `{parent_id}:{child_id}`.

use redb::TableDefinition;

/// Load balancers keyed by `{lb_id}`.
pub const LOAD_BALANCERS: TableDefinition<&str, &[u8]> = TableDefinition::new("load_balancers");

/// Amphorae keyed by `{amphora_id}`.
pub const AMPHORAE: TableDefinition<&str, &[u8]> = TableDefinition::new("amphorae");

/// Flow run records keyed by `{run_id}`.
pub const FLOW_RUNS: TableDefinition<&str, &[u8]> = TableDefinition::new("flow_runs");

/// Completed node results keyed by `{run_id}:{node_name}`.
pub const NODE_RESULTS: TableDefinition<&str, &[u8]> = TableDefinition::new("node_results");
