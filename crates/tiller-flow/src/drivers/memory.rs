//! In-memory provisioning drivers.
//!
//! Used by tests and by the single-process demo mode. Instances become
//! Active after a configurable number of status polls; failure
//! injection covers both transient and hard paths.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;

use tiller_store::{Amphora, AmphoraStatus, StateStore};

use super::{
    ComputeDriver, ComputeInstance, ComputeStatus, DriverError, NetworkDriver, PortInfo,
    SparePool, VipAllocation,
};

struct InstanceSlot {
    /// Status polls remaining before the instance reports Active.
    polls_until_active: u32,
}

/// In-memory [`ComputeDriver`].
#[derive(Default)]
pub struct MemoryCompute {
    instances: Mutex<HashMap<String, InstanceSlot>>,
    counter: AtomicU64,
    /// Polls each new instance spends Building before Active.
    boot_polls: u32,
    /// When set, boot_instance fails with a hard error.
    fail_boot: Mutex<bool>,
    deleted: Mutex<Vec<String>>,
}

impl MemoryCompute {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make new instances report Building for `polls` status calls.
    pub fn with_boot_polls(mut self, polls: u32) -> Self {
        self.boot_polls = polls;
        self
    }

    /// Make subsequent boots fail hard.
    pub fn set_fail_boot(&self, fail: bool) {
        *self.fail_boot.lock().unwrap() = fail;
    }

    /// Compute IDs that have been deleted, in order.
    pub fn deleted_instances(&self) -> Vec<String> {
        self.deleted.lock().unwrap().clone()
    }

    pub fn instance_count(&self) -> usize {
        self.instances.lock().unwrap().len()
    }
}

#[async_trait]
impl ComputeDriver for MemoryCompute {
    async fn boot_instance(&self, name: &str) -> Result<ComputeInstance, DriverError> {
        if *self.fail_boot.lock().unwrap() {
            return Err(DriverError::Hard("compute quota exceeded".to_string()));
        }
        let n = self.counter.fetch_add(1, Ordering::SeqCst);
        let compute_id = format!("vm-{n:04}");
        let management_ip = format!("192.0.2.{}:9443", 10 + (n % 200));
        self.instances.lock().unwrap().insert(
            compute_id.clone(),
            InstanceSlot {
                polls_until_active: self.boot_polls,
            },
        );
        tracing::debug!(%compute_id, name, "instance booted");
        Ok(ComputeInstance {
            compute_id,
            management_ip,
        })
    }

    async fn delete_instance(&self, compute_id: &str) -> Result<(), DriverError> {
        let existed = self.instances.lock().unwrap().remove(compute_id).is_some();
        self.deleted.lock().unwrap().push(compute_id.to_string());
        if !existed {
            // Deleting an already-gone instance is fine; the revert
            // path may race a prior cleanup.
            tracing::debug!(%compute_id, "delete of unknown instance ignored");
        }
        Ok(())
    }

    async fn instance_status(&self, compute_id: &str) -> Result<ComputeStatus, DriverError> {
        let mut instances = self.instances.lock().unwrap();
        match instances.get_mut(compute_id) {
            Some(slot) if slot.polls_until_active > 0 => {
                slot.polls_until_active -= 1;
                Ok(ComputeStatus::Building)
            }
            Some(_) => Ok(ComputeStatus::Active),
            None => Err(DriverError::Hard(format!("unknown instance {compute_id}"))),
        }
    }
}

/// In-memory [`NetworkDriver`].
#[derive(Default)]
pub struct MemoryNetwork {
    counter: AtomicU64,
    /// port_id → (compute_id, subnet_id) for plugged ports.
    ports: Mutex<HashMap<String, (String, String)>>,
    vips: Mutex<HashMap<String, VipAllocation>>,
    deallocated_vips: Mutex<Vec<String>>,
    fail_plug: Mutex<bool>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make subsequent port plugs fail hard.
    pub fn set_fail_plug(&self, fail: bool) {
        *self.fail_plug.lock().unwrap() = fail;
    }

    /// VIP port IDs that have been deallocated, in order.
    pub fn deallocated_vips(&self) -> Vec<String> {
        self.deallocated_vips.lock().unwrap().clone()
    }

    pub fn plugged_port_count(&self) -> usize {
        self.ports.lock().unwrap().len()
    }
}

#[async_trait]
impl NetworkDriver for MemoryNetwork {
    async fn allocate_vip(&self, lb_id: &str) -> Result<VipAllocation, DriverError> {
        let n = self.counter.fetch_add(1, Ordering::SeqCst);
        let vip = VipAllocation {
            address: format!("203.0.113.{}", 1 + (n % 250)),
            port_id: format!("vip-port-{n:04}"),
            subnet_id: "vip-subnet".to_string(),
        };
        self.vips
            .lock()
            .unwrap()
            .insert(lb_id.to_string(), vip.clone());
        Ok(vip)
    }

    async fn deallocate_vip(&self, port_id: &str) -> Result<(), DriverError> {
        self.vips
            .lock()
            .unwrap()
            .retain(|_, v| v.port_id != port_id);
        self.deallocated_vips
            .lock()
            .unwrap()
            .push(port_id.to_string());
        Ok(())
    }

    async fn plug_port(&self, compute_id: &str, subnet_id: &str) -> Result<PortInfo, DriverError> {
        if *self.fail_plug.lock().unwrap() {
            return Err(DriverError::Hard("no ports available on subnet".to_string()));
        }
        let n = self.counter.fetch_add(1, Ordering::SeqCst);
        let port_id = format!("port-{n:04}");
        self.ports.lock().unwrap().insert(
            port_id.clone(),
            (compute_id.to_string(), subnet_id.to_string()),
        );
        Ok(PortInfo {
            port_id,
            address: format!("10.0.{}.{}", n / 250, 1 + (n % 250)),
            subnet_id: subnet_id.to_string(),
        })
    }

    async fn unplug_port(&self, _compute_id: &str, port_id: &str) -> Result<(), DriverError> {
        self.ports.lock().unwrap().remove(port_id);
        Ok(())
    }

    async fn plumbed_subnets(&self, compute_id: &str) -> Result<Vec<String>, DriverError> {
        let ports = self.ports.lock().unwrap();
        let mut subnets: Vec<String> = ports
            .values()
            .filter(|(c, _)| c == compute_id)
            .map(|(_, s)| s.clone())
            .collect();
        subnets.sort();
        subnets.dedup();
        Ok(subnets)
    }

    async fn find_port(
        &self,
        compute_id: &str,
        subnet_id: &str,
    ) -> Result<Option<PortInfo>, DriverError> {
        let ports = self.ports.lock().unwrap();
        Ok(ports
            .iter()
            .find(|(_, (c, s))| c == compute_id && s == subnet_id)
            .map(|(port_id, (_, s))| PortInfo {
                port_id: port_id.clone(),
                address: String::new(),
                subnet_id: s.clone(),
            }))
    }
}

/// Store-backed spare pool without external exclusion.
///
/// Only suitable for tests and single-process mode; multi-worker
/// deployments use the claim-guarded pool from tiller-coordinator.
pub struct MemorySparePool {
    store: StateStore,
    lock: Mutex<()>,
}

impl MemorySparePool {
    pub fn new(store: StateStore) -> Self {
        Self {
            store,
            lock: Mutex::new(()),
        }
    }
}

#[async_trait]
impl SparePool for MemorySparePool {
    async fn acquire(&self) -> Result<Option<Amphora>, DriverError> {
        let _guard = self.lock.lock().unwrap();
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
    }

    async fn release(&self, amphora_id: &str) -> Result<(), DriverError> {
        let _guard = self.lock.lock().unwrap();
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
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tiller_store::AmphoraRole;

    #[tokio::test]
    async fn boot_then_active_after_polls() {
        let compute = MemoryCompute::new().with_boot_polls(2);
        let inst = compute.boot_instance("amphora-x").await.unwrap();

        assert_eq!(
            compute.instance_status(&inst.compute_id).await.unwrap(),
            ComputeStatus::Building
        );
        assert_eq!(
            compute.instance_status(&inst.compute_id).await.unwrap(),
            ComputeStatus::Building
        );
        assert_eq!(
            compute.instance_status(&inst.compute_id).await.unwrap(),
            ComputeStatus::Active
        );
    }

    #[tokio::test]
    async fn delete_is_idempotent() {
        let compute = MemoryCompute::new();
        let inst = compute.boot_instance("amphora-x").await.unwrap();

        compute.delete_instance(&inst.compute_id).await.unwrap();
        compute.delete_instance(&inst.compute_id).await.unwrap();
        assert_eq!(compute.instance_count(), 0);
    }

    #[tokio::test]
    async fn plug_and_plumbed_subnets() {
        let network = MemoryNetwork::new();
        network.plug_port("vm-1", "subnet-a").await.unwrap();
        network.plug_port("vm-1", "subnet-b").await.unwrap();
        network.plug_port("vm-2", "subnet-c").await.unwrap();

        let subnets = network.plumbed_subnets("vm-1").await.unwrap();
        assert_eq!(subnets, vec!["subnet-a", "subnet-b"]);
    }

    #[tokio::test]
    async fn vip_allocate_deallocate() {
        let network = MemoryNetwork::new();
        let vip = network.allocate_vip("lb-1").await.unwrap();

        network.deallocate_vip(&vip.port_id).await.unwrap();
        assert_eq!(network.deallocated_vips(), vec![vip.port_id]);
    }

    fn spare(id: &str) -> Amphora {
        Amphora {
            id: id.to_string(),
            load_balancer_id: None,
            compute_id: Some(format!("vm-{id}")),
            management_ip: Some("192.0.2.10:9443".to_string()),
            vrrp_ip: None,
            vrrp_port_id: None,
            role: AmphoraRole::Standalone,
            status: AmphoraStatus::Ready,
            last_seen: 0,
            last_sequence: 0,
            created_at: 1000,
            updated_at: 1000,
        }
    }

    #[tokio::test]
    async fn spare_pool_acquire_and_release() {
        let store = StateStore::open_in_memory().unwrap();
        store.put_amphora(&spare("amp-1")).unwrap();
        let pool = MemorySparePool::new(store.clone());

        let acquired = pool.acquire().await.unwrap().unwrap();
        assert_eq!(acquired.id, "amp-1");
        assert_eq!(acquired.status, AmphoraStatus::Allocated);

        // Pool is now empty.
        assert!(pool.acquire().await.unwrap().is_none());

        pool.release("amp-1").await.unwrap();
        assert!(pool.acquire().await.unwrap().is_some());
    }
}
