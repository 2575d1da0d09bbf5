//! StateStore — redb-backed state persistence for Tiller.
//!
//! Provides typed CRUD operations over load balancers, amphorae, flow
//! runs, and node results. All values are JSON-serialized into redb's
//! `&[u8]` value columns. The store supports both on-disk and in-memory
//! backends (the latter for testing).

use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableDatabase, ReadableTable};
use tracing::debug;

use crate::error::{StateError, StateResult};
use crate::tables::*;
use crate::types::*;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

/// Thread-safe state store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
}

impl StateStore {
    /// Open (or create) a persistent state store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory state store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    /// Create all tables if they don't exist yet.
    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        // Opening a table in a write transaction creates it if absent.
        txn.open_table(LOAD_BALANCERS).map_err(map_err!(Table))?;
        txn.open_table(AMPHORAE).map_err(map_err!(Table))?;
        txn.open_table(FLOW_RUNS).map_err(map_err!(Table))?;
        txn.open_table(NODE_RESULTS).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    // ── Load balancers ─────────────────────────────────────────────

    /// Insert or update a load balancer.
    pub fn put_load_balancer(&self, lb: &LoadBalancer) -> StateResult<()> {
        let value = serde_json::to_vec(lb).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(LOAD_BALANCERS).map_err(map_err!(Table))?;
            table
                .insert(lb.id.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(lb_id = %lb.id, "load balancer stored");
        Ok(())
    }

    /// Get a load balancer by ID.
    pub fn get_load_balancer(&self, lb_id: &str) -> StateResult<Option<LoadBalancer>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(LOAD_BALANCERS).map_err(map_err!(Table))?;
        match table.get(lb_id).map_err(map_err!(Read))? {
            Some(guard) => {
                let lb: LoadBalancer =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(lb))
            }
            None => Ok(None),
        }
    }

    /// List all load balancers.
    pub fn list_load_balancers(&self) -> StateResult<Vec<LoadBalancer>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(LOAD_BALANCERS).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            let lb: LoadBalancer =
                serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            results.push(lb);
        }
        Ok(results)
    }

    /// Delete a load balancer by ID. Returns true if it existed.
    pub fn delete_load_balancer(&self, lb_id: &str) -> StateResult<bool> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed;
        {
            let mut table = txn.open_table(LOAD_BALANCERS).map_err(map_err!(Table))?;
            existed = table.remove(lb_id).map_err(map_err!(Write))?.is_some();
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%lb_id, existed, "load balancer deleted");
        Ok(existed)
    }

    // ── Amphorae ───────────────────────────────────────────────────

    /// Insert or update an amphora.
    pub fn put_amphora(&self, amphora: &Amphora) -> StateResult<()> {
        let value = serde_json::to_vec(amphora).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(AMPHORAE).map_err(map_err!(Table))?;
            table
                .insert(amphora.id.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    /// Get an amphora by ID.
    pub fn get_amphora(&self, amphora_id: &str) -> StateResult<Option<Amphora>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(AMPHORAE).map_err(map_err!(Table))?;
        match table.get(amphora_id).map_err(map_err!(Read))? {
            Some(guard) => {
                let amphora: Amphora =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(amphora))
            }
            None => Ok(None),
        }
    }

    /// List all amphorae.
    pub fn list_amphorae(&self) -> StateResult<Vec<Amphora>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(AMPHORAE).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            let amphora: Amphora =
                serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            results.push(amphora);
        }
        Ok(results)
    }

    /// List all amphorae attached to a load balancer.
    pub fn list_amphorae_for_lb(&self, lb_id: &str) -> StateResult<Vec<Amphora>> {
        let all = self.list_amphorae()?;
        Ok(all
            .into_iter()
            .filter(|a| a.load_balancer_id.as_deref() == Some(lb_id))
            .collect())
    }

    /// List unallocated spare amphorae ready for adoption.
    pub fn list_spares(&self) -> StateResult<Vec<Amphora>> {
        let all = self.list_amphorae()?;
        Ok(all.into_iter().filter(Amphora::is_spare).collect())
    }

    /// Delete an amphora by ID. Returns true if it existed.
    pub fn delete_amphora(&self, amphora_id: &str) -> StateResult<bool> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed;
        {
            let mut table = txn.open_table(AMPHORAE).map_err(map_err!(Table))?;
            existed = table.remove(amphora_id).map_err(map_err!(Write))?.is_some();
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(existed)
    }

    /// Record a heartbeat against an amphora.
    ///
    /// Only the heartbeat path calls this; it touches nothing but the
    /// heartbeat-derived fields, so it is safe without a claim. Returns
    /// false if the amphora is unknown or the sequence is not newer
    /// than the last applied one (stale or replayed packet).
    pub fn record_heartbeat(
        &self,
        amphora_id: &str,
        sequence: u64,
        now: u64,
    ) -> StateResult<bool> {
        let Some(mut amphora) = self.get_amphora(amphora_id)? else {
            return Ok(false);
        };
        // last_seen == 0 means no heartbeat has been applied yet.
        if amphora.last_seen != 0 && sequence <= amphora.last_sequence {
            return Ok(false);
        }
        amphora.last_seen = now;
        amphora.last_sequence = sequence;
        self.put_amphora(&amphora)?;
        Ok(true)
    }

    // ── Flow runs ──────────────────────────────────────────────────

    /// Insert or update a flow run record.
    pub fn put_flow_run(&self, run: &FlowRun) -> StateResult<()> {
        let value = serde_json::to_vec(run).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(FLOW_RUNS).map_err(map_err!(Table))?;
            table
                .insert(run.id.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    /// Get a flow run by ID.
    pub fn get_flow_run(&self, run_id: &str) -> StateResult<Option<FlowRun>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(FLOW_RUNS).map_err(map_err!(Table))?;
        match table.get(run_id).map_err(map_err!(Read))? {
            Some(guard) => {
                let run: FlowRun =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(run))
            }
            None => Ok(None),
        }
    }

    /// Update the state of an existing flow run.
    pub fn set_flow_run_state(
        &self,
        run_id: &str,
        state: FlowRunState,
        failure: Option<String>,
        now: u64,
    ) -> StateResult<()> {
        let mut run = self
            .get_flow_run(run_id)?
            .ok_or_else(|| StateError::NotFound(format!("flow run {run_id}")))?;
        run.state = state;
        run.failure = failure;
        run.updated_at = now;
        self.put_flow_run(&run)
    }

    // ── Node results ───────────────────────────────────────────────

    /// Record a completed node's outputs for a flow run.
    pub fn put_node_result(&self, result: &NodeResult) -> StateResult<()> {
        let key = format!("{}:{}", result.run_id, result.node);
        let value = serde_json::to_vec(result).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(NODE_RESULTS).map_err(map_err!(Table))?;
            table
                .insert(key.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    /// List the completed node results for a flow run, ordered by
    /// completion position.
    pub fn list_node_results(&self, run_id: &str) -> StateResult<Vec<NodeResult>> {
        let prefix = format!("{run_id}:");
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(NODE_RESULTS).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (key, value) = entry.map_err(map_err!(Read))?;
            if key.value().starts_with(&prefix) {
                let result: NodeResult =
                    serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
                results.push(result);
            }
        }
        results.sort_by_key(|r| r.position);
        Ok(results)
    }

    /// Delete all node results for a flow run. Returns number deleted.
    pub fn delete_node_results(&self, run_id: &str) -> StateResult<u32> {
        let prefix = format!("{run_id}:");
        // Collect keys in a read transaction first.
        let keys: Vec<String> = {
            let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
            let table = txn.open_table(NODE_RESULTS).map_err(map_err!(Table))?;
            table
                .iter()
                .map_err(map_err!(Read))?
                .filter_map(|entry| {
                    let (key, _) = entry.ok()?;
                    let k = key.value().to_string();
                    k.starts_with(&prefix).then_some(k)
                })
                .collect()
        };
        // Delete in a write transaction.
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let count = keys.len() as u32;
        {
            let mut table = txn.open_table(NODE_RESULTS).map_err(map_err!(Table))?;
            for key in &keys {
                table.remove(key.as_str()).map_err(map_err!(Write))?;
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(count)
    }
}
