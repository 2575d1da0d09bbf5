//! Amphora lifecycle tasks.
//!
//! Allocation prefers the shared spare pool and falls back to booting
//! a fresh compute instance. The revert of an allocation returns a
//! spare to the pool but deletes a freshly booted instance outright.

use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info};

use tiller_store::{AgentConfig, Amphora, AmphoraRole, AmphoraStatus};

use crate::drivers::ComputeStatus;
use crate::task::{epoch_secs, require_str, Bindings, RetryPolicy, Task, TaskContext, TaskError};
use crate::tasks::fresh_id;
use crate::tasks::network::LOADBALANCER_ID;

fn from_spare_key(amphora_key: &str) -> String {
    format!("{amphora_key}_from_spare")
}

fn endpoint_key(amphora_key: &str) -> String {
    format!("{amphora_key}_endpoint")
}

/// Attach an amphora to the load balancer: take one from the spare
/// pool if available, otherwise boot a fresh instance. Publishes the
/// amphora id under the node's binding key.
pub struct AllocateAmphora {
    amphora_key: String,
    role: AmphoraRole,
}

impl AllocateAmphora {
    pub fn new(amphora_key: &str, role: AmphoraRole) -> Self {
        Self {
            amphora_key: amphora_key.to_string(),
            role,
        }
    }
}

#[async_trait]
impl Task for AllocateAmphora {
    fn name(&self) -> String {
        format!("allocate-amphora-{}", self.amphora_key)
    }

    async fn execute(&self, ctx: &TaskContext, inputs: &Bindings) -> Result<Bindings, TaskError> {
        let lb_id = require_str(inputs, LOADBALANCER_ID)?;
        let now = epoch_secs();

        let mut outputs = Bindings::new();
        if let Some(mut spare) = ctx.spares.acquire().await? {
            info!(%lb_id, amphora_id = %spare.id, role = ?self.role, "spare amphora allocated");
            spare.load_balancer_id = Some(lb_id.to_string());
            spare.role = self.role;
            spare.updated_at = now;
            ctx.store.put_amphora(&spare)?;
            outputs.insert(self.amphora_key.clone(), serde_json::json!(spare.id));
            outputs.insert(from_spare_key(&self.amphora_key), serde_json::json!(true));
            return Ok(outputs);
        }

        let amphora_id = fresh_id("amp");
        let instance = ctx.compute.boot_instance(&amphora_id).await?;
        info!(%lb_id, %amphora_id, compute_id = %instance.compute_id, role = ?self.role, "amphora booting");
        ctx.store.put_amphora(&Amphora {
            id: amphora_id.clone(),
            load_balancer_id: Some(lb_id.to_string()),
            compute_id: Some(instance.compute_id),
            management_ip: Some(instance.management_ip),
            vrrp_ip: None,
            vrrp_port_id: None,
            role: self.role,
            status: AmphoraStatus::Booting,
            last_seen: 0,
            last_sequence: 0,
            created_at: now,
            updated_at: now,
        })?;
        outputs.insert(self.amphora_key.clone(), serde_json::json!(amphora_id));
        outputs.insert(from_spare_key(&self.amphora_key), serde_json::json!(false));
        Ok(outputs)
    }

    async fn revert(
        &self,
        ctx: &TaskContext,
        _inputs: &Bindings,
        outputs: &Bindings,
    ) -> Result<(), TaskError> {
        let Ok(amphora_id) = require_str(outputs, &self.amphora_key) else {
            return Ok(());
        };
        let from_spare = outputs
            .get(&from_spare_key(&self.amphora_key))
            .and_then(|v| v.as_bool())
            .unwrap_or(false);

        if from_spare {
            debug!(%amphora_id, "returning spare to pool");
            ctx.spares.release(amphora_id).await?;
            return Ok(());
        }

        if let Some(amphora) = ctx.store.get_amphora(amphora_id)? {
            if let Some(compute_id) = &amphora.compute_id {
                ctx.compute.delete_instance(compute_id).await?;
            }
            ctx.store.delete_amphora(amphora_id)?;
            info!(%amphora_id, "freshly booted amphora deleted on revert");
        }
        Ok(())
    }
}

/// Poll the amphora's compute instance until it reports Active, then
/// publish its management endpoint. A still-building instance is a
/// transient failure consumed by the retry policy.
pub struct WaitAmphoraReady {
    amphora_key: String,
    retry: RetryPolicy,
}

impl WaitAmphoraReady {
    pub fn new(amphora_key: &str) -> Self {
        Self {
            amphora_key: amphora_key.to_string(),
            retry: RetryPolicy::new(8, Duration::from_millis(500)),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }
}

#[async_trait]
impl Task for WaitAmphoraReady {
    fn name(&self) -> String {
        format!("wait-ready-{}", self.amphora_key)
    }

    fn retry(&self) -> RetryPolicy {
        self.retry
    }

    async fn execute(&self, ctx: &TaskContext, inputs: &Bindings) -> Result<Bindings, TaskError> {
        let amphora_id = require_str(inputs, &self.amphora_key)?;
        let mut amphora = ctx
            .store
            .get_amphora(amphora_id)?
            .ok_or_else(|| TaskError::Hard(format!("unknown amphora {amphora_id}")))?;
        let compute_id = amphora
            .compute_id
            .clone()
            .ok_or_else(|| TaskError::Hard(format!("amphora {amphora_id} has no compute")))?;
        let endpoint = amphora
            .management_ip
            .clone()
            .ok_or_else(|| TaskError::Hard(format!("amphora {amphora_id} has no endpoint")))?;

        match ctx.compute.instance_status(&compute_id).await? {
            ComputeStatus::Building => {
                return Err(TaskError::Transient(format!(
                    "instance {compute_id} still building"
                )));
            }
            ComputeStatus::Error => {
                return Err(TaskError::Hard(format!(
                    "instance {compute_id} failed to boot"
                )));
            }
            ComputeStatus::Active => {}
        }

        if amphora.status == AmphoraStatus::Booting {
            amphora.status = AmphoraStatus::Allocated;
            amphora.updated_at = epoch_secs();
            ctx.store.put_amphora(&amphora)?;
        }
        debug!(%amphora_id, %endpoint, "amphora compute active");

        let mut outputs = Bindings::new();
        outputs.insert(
            endpoint_key(&self.amphora_key),
            serde_json::json!(endpoint),
        );
        Ok(outputs)
    }
}

/// Push the rendered configuration document to one amphora's agent and
/// mark the amphora Ready. Idempotent on the agent side.
pub struct PushAmphoraConfig {
    amphora_key: String,
    /// Binding key of the peer amphora whose VRRP address goes into
    /// the config, for ACTIVE_STANDBY pairs.
    peer_key: Option<String>,
    /// Update an already-provisioned amphora instead of provisioning.
    update: bool,
}

impl PushAmphoraConfig {
    pub fn provision(amphora_key: &str) -> Self {
        Self {
            amphora_key: amphora_key.to_string(),
            peer_key: None,
            update: false,
        }
    }

    pub fn update(amphora_key: &str) -> Self {
        Self {
            amphora_key: amphora_key.to_string(),
            peer_key: None,
            update: true,
        }
    }

    pub fn with_peer(mut self, peer_key: &str) -> Self {
        self.peer_key = Some(peer_key.to_string());
        self
    }
}

#[async_trait]
impl Task for PushAmphoraConfig {
    fn name(&self) -> String {
        format!("push-config-{}", self.amphora_key)
    }

    fn retry(&self) -> RetryPolicy {
        RetryPolicy::new(3, Duration::from_millis(500))
    }

    async fn execute(&self, ctx: &TaskContext, inputs: &Bindings) -> Result<Bindings, TaskError> {
        let lb_id = require_str(inputs, LOADBALANCER_ID)?;
        let amphora_id = require_str(inputs, &self.amphora_key)?;
        let lb = ctx
            .store
            .get_load_balancer(lb_id)?
            .ok_or_else(|| TaskError::Hard(format!("unknown load balancer {lb_id}")))?;
        let mut amphora = ctx
            .store
            .get_amphora(amphora_id)?
            .ok_or_else(|| TaskError::Hard(format!("unknown amphora {amphora_id}")))?;
        let endpoint = amphora
            .management_ip
            .clone()
            .ok_or_else(|| TaskError::Hard(format!("amphora {amphora_id} has no endpoint")))?;
        let vip_address = lb
            .vip_address
            .clone()
            .ok_or_else(|| TaskError::Hard(format!("load balancer {lb_id} has no VIP")))?;

        let peer_address = match &self.peer_key {
            Some(peer) => Some(
                require_str(inputs, &format!("{peer}_vrrp_ip"))?.to_string(),
            ),
            None => None,
        };

        let config = AgentConfig {
            load_balancer_id: lb.id.clone(),
            amphora_id: amphora.id.clone(),
            role: amphora.role,
            topology: lb.topology,
            vip_address,
            peer_address,
            listeners: lb.listeners.clone(),
        };

        if self.update {
            ctx.agent.update(&endpoint, &config).await?;
        } else {
            ctx.agent.provision(&endpoint, &config).await?;
        }
        info!(%amphora_id, %endpoint, update = self.update, "configuration pushed");

        amphora.status = AmphoraStatus::Ready;
        amphora.updated_at = epoch_secs();
        ctx.store.put_amphora(&amphora)?;
        Ok(Bindings::new())
    }
}

/// Tear down one amphora: delete its compute instance and tombstone
/// the record. Used by delete and failover flows after the amphora is
/// out of the data path, so there is nothing to revert.
pub struct DeleteAmphora {
    amphora_key: String,
}

impl DeleteAmphora {
    pub fn new(amphora_key: &str) -> Self {
        Self {
            amphora_key: amphora_key.to_string(),
        }
    }
}

#[async_trait]
impl Task for DeleteAmphora {
    fn name(&self) -> String {
        format!("delete-amphora-{}", self.amphora_key)
    }

    async fn execute(&self, ctx: &TaskContext, inputs: &Bindings) -> Result<Bindings, TaskError> {
        let amphora_id = require_str(inputs, &self.amphora_key)?;
        let Some(mut amphora) = ctx.store.get_amphora(amphora_id)? else {
            debug!(%amphora_id, "amphora already gone");
            return Ok(Bindings::new());
        };
        if let Some(compute_id) = &amphora.compute_id {
            ctx.compute.delete_instance(compute_id).await?;
        }
        if let Some(port_id) = &amphora.vrrp_port_id {
            if let Some(compute_id) = &amphora.compute_id {
                ctx.network.unplug_port(compute_id, port_id).await?;
            }
        }
        amphora.status = AmphoraStatus::Deleted;
        amphora.compute_id = None;
        amphora.vrrp_ip = None;
        amphora.vrrp_port_id = None;
        amphora.updated_at = epoch_secs();
        ctx.store.put_amphora(&amphora)?;
        info!(%amphora_id, "amphora deleted");
        Ok(Bindings::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use tiller_agent::MemoryAgent;
    use tiller_store::{
        LoadBalancer, OperatingStatus, ProvisioningStatus, StateStore, Topology,
    };

    use crate::drivers::memory::{MemoryCompute, MemoryNetwork, MemorySparePool};

    fn ctx_with(compute: MemoryCompute) -> (TaskContext, Arc<MemoryCompute>, Arc<MemoryAgent>) {
        let store = StateStore::open_in_memory().unwrap();
        let compute = Arc::new(compute);
        let agent = Arc::new(MemoryAgent::new());
        let ctx = TaskContext {
            store: store.clone(),
            compute: compute.clone(),
            network: Arc::new(MemoryNetwork::new()),
            agent: agent.clone(),
            spares: Arc::new(MemorySparePool::new(store)),
        };
        (ctx, compute, agent)
    }

    fn seed_lb(ctx: &TaskContext, id: &str, vip: Option<&str>) {
        ctx.store
            .put_load_balancer(&LoadBalancer {
                id: id.to_string(),
                name: "web".to_string(),
                topology: Topology::Single,
                provisioning_status: ProvisioningStatus::PendingCreate,
                operating_status: OperatingStatus::Active,
                vip_address: vip.map(str::to_string),
                vip_port_id: vip.map(|_| "vip-port-0".to_string()),
                vip_subnet_id: vip.map(|_| "vip-subnet".to_string()),
                listeners: Vec::new(),
                fault_reason: None,
                created_at: 0,
                updated_at: 0,
            })
            .unwrap();
    }

    fn seed_spare(ctx: &TaskContext, id: &str) {
        ctx.store
            .put_amphora(&Amphora {
                id: id.to_string(),
                load_balancer_id: None,
                compute_id: Some(format!("vm-{id}")),
                management_ip: Some("192.0.2.50:9443".to_string()),
                vrrp_ip: None,
                vrrp_port_id: None,
                role: AmphoraRole::Standalone,
                status: AmphoraStatus::Ready,
                last_seen: 0,
                last_sequence: 0,
                created_at: 0,
                updated_at: 0,
            })
            .unwrap();
    }

    fn bindings(lb_id: &str) -> Bindings {
        let mut b = Bindings::new();
        b.insert(LOADBALANCER_ID.into(), serde_json::json!(lb_id));
        b
    }

    #[tokio::test]
    async fn allocation_prefers_spares() {
        let (ctx, compute, _) = ctx_with(MemoryCompute::new());
        seed_lb(&ctx, "lb-1", None);
        seed_spare(&ctx, "spare-1");

        let outputs = AllocateAmphora::new("amphora_0", AmphoraRole::Standalone)
            .execute(&ctx, &bindings("lb-1"))
            .await
            .unwrap();

        assert_eq!(outputs["amphora_0"], serde_json::json!("spare-1"));
        assert_eq!(outputs["amphora_0_from_spare"], serde_json::json!(true));
        // No new instance was booted.
        assert_eq!(compute.instance_count(), 0);
        let spare = ctx.store.get_amphora("spare-1").unwrap().unwrap();
        assert_eq!(spare.load_balancer_id.as_deref(), Some("lb-1"));
        assert_eq!(spare.status, AmphoraStatus::Allocated);
    }

    #[tokio::test]
    async fn allocation_boots_when_pool_is_empty() {
        let (ctx, compute, _) = ctx_with(MemoryCompute::new());
        seed_lb(&ctx, "lb-1", None);

        let outputs = AllocateAmphora::new("amphora_0", AmphoraRole::Master)
            .execute(&ctx, &bindings("lb-1"))
            .await
            .unwrap();

        assert_eq!(outputs["amphora_0_from_spare"], serde_json::json!(false));
        assert_eq!(compute.instance_count(), 1);
        let id = outputs["amphora_0"].as_str().unwrap();
        let amphora = ctx.store.get_amphora(id).unwrap().unwrap();
        assert_eq!(amphora.status, AmphoraStatus::Booting);
        assert_eq!(amphora.role, AmphoraRole::Master);
    }

    #[tokio::test]
    async fn revert_returns_spare_but_deletes_fresh_boot() {
        let (ctx, compute, _) = ctx_with(MemoryCompute::new());
        seed_lb(&ctx, "lb-1", None);
        seed_spare(&ctx, "spare-1");
        let inputs = bindings("lb-1");

        let task = AllocateAmphora::new("amphora_0", AmphoraRole::Standalone);
        let spare_outputs = task.execute(&ctx, &inputs).await.unwrap();
        let boot_outputs = task.execute(&ctx, &inputs).await.unwrap();

        task.revert(&ctx, &inputs, &spare_outputs).await.unwrap();
        task.revert(&ctx, &inputs, &boot_outputs).await.unwrap();

        // Spare is back in the pool.
        let spare = ctx.store.get_amphora("spare-1").unwrap().unwrap();
        assert!(spare.is_spare());
        // Booted amphora and its instance are gone.
        let booted_id = boot_outputs["amphora_0"].as_str().unwrap();
        assert!(ctx.store.get_amphora(booted_id).unwrap().is_none());
        assert_eq!(compute.deleted_instances().len(), 1);
    }

    #[tokio::test]
    async fn wait_ready_is_transient_while_building() {
        let (ctx, _, _) = ctx_with(MemoryCompute::new().with_boot_polls(1));
        seed_lb(&ctx, "lb-1", None);
        let mut inputs = bindings("lb-1");
        let outputs = AllocateAmphora::new("amphora_0", AmphoraRole::Standalone)
            .execute(&ctx, &inputs)
            .await
            .unwrap();
        inputs.extend(outputs);

        let task = WaitAmphoraReady::new("amphora_0");
        let err = task.execute(&ctx, &inputs).await.unwrap_err();
        assert!(err.is_transient());

        let outputs = task.execute(&ctx, &inputs).await.unwrap();
        assert!(outputs["amphora_0_endpoint"].as_str().is_some());
        let id = inputs["amphora_0"].as_str().unwrap();
        let amphora = ctx.store.get_amphora(id).unwrap().unwrap();
        assert_eq!(amphora.status, AmphoraStatus::Allocated);
    }

    #[tokio::test]
    async fn push_config_marks_ready_and_is_idempotent() {
        let (ctx, _, agent) = ctx_with(MemoryCompute::new());
        seed_lb(&ctx, "lb-1", Some("203.0.113.10"));
        seed_spare(&ctx, "amp-1");
        let mut inputs = bindings("lb-1");
        inputs.insert("amphora_0".into(), serde_json::json!("amp-1"));

        let task = PushAmphoraConfig::provision("amphora_0");
        task.execute(&ctx, &inputs).await.unwrap();
        task.execute(&ctx, &inputs).await.unwrap();

        let endpoint = "192.0.2.50:9443";
        // The replayed push was received but not re-applied.
        assert_eq!(agent.push_count(endpoint), 2);
        assert_eq!(agent.apply_count(endpoint), 1);

        let amphora = ctx.store.get_amphora("amp-1").unwrap().unwrap();
        assert_eq!(amphora.status, AmphoraStatus::Ready);
        let applied = agent.applied_config(endpoint).unwrap();
        assert_eq!(applied.vip_address, "203.0.113.10");
    }

    #[tokio::test]
    async fn push_config_threads_peer_address() {
        let (ctx, _, agent) = ctx_with(MemoryCompute::new());
        seed_lb(&ctx, "lb-1", Some("203.0.113.10"));
        seed_spare(&ctx, "amp-1");
        let mut inputs = bindings("lb-1");
        inputs.insert("amphora_0".into(), serde_json::json!("amp-1"));
        inputs.insert(
            "amphora_1_vrrp_ip".into(),
            serde_json::json!("10.0.0.7"),
        );

        PushAmphoraConfig::provision("amphora_0")
            .with_peer("amphora_1")
            .execute(&ctx, &inputs)
            .await
            .unwrap();

        let applied = agent.applied_config("192.0.2.50:9443").unwrap();
        assert_eq!(applied.peer_address.as_deref(), Some("10.0.0.7"));
    }

    #[tokio::test]
    async fn delete_amphora_tears_down_compute() {
        let (ctx, compute, _) = ctx_with(MemoryCompute::new());
        seed_lb(&ctx, "lb-1", None);
        let mut inputs = bindings("lb-1");
        let outputs = AllocateAmphora::new("amphora_0", AmphoraRole::Standalone)
            .execute(&ctx, &inputs)
            .await
            .unwrap();
        inputs.extend(outputs);

        DeleteAmphora::new("amphora_0")
            .execute(&ctx, &inputs)
            .await
            .unwrap();

        let id = inputs["amphora_0"].as_str().unwrap();
        let amphora = ctx.store.get_amphora(id).unwrap().unwrap();
        assert_eq!(amphora.status, AmphoraStatus::Deleted);
        assert!(amphora.compute_id.is_none());
        assert_eq!(compute.deleted_instances().len(), 1);
    }
}
