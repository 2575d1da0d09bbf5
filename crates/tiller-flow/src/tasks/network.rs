//! Network plumbing tasks.
//!
//! VIP allocation, VIP plugging, and member-subnet reconciliation.
//! Reverts release only what the execute actually created in this run;
//! a VIP that predates the flow (update and failover flows) is never
//! deallocated on revert.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::task::{epoch_secs, require_str, Bindings, Task, TaskContext, TaskError};

/// Keys under which VIP facts are published to the binding map.
pub const VIP_ADDRESS: &str = "vip_address";
pub const VIP_PORT_ID: &str = "vip_port_id";
pub const VIP_SUBNET_ID: &str = "vip_subnet_id";
const VIP_ALLOCATED: &str = "vip_allocated";

/// Binding key naming the load balancer every flow operates on.
pub const LOADBALANCER_ID: &str = "loadbalancer_id";

/// Allocate the load balancer's VIP on the tenant network.
///
/// Idempotent: if the record already carries a VIP port the existing
/// allocation is republished and the revert leaves it alone. With
/// `keep_on_revert` the revert never deallocates even a fresh VIP;
/// failover flows use this so a failed replacement does not take the
/// service's address down with it.
pub struct AllocateVip {
    keep_on_revert: bool,
}

impl AllocateVip {
    pub fn new() -> Self {
        Self {
            keep_on_revert: false,
        }
    }

    pub fn for_failover() -> Self {
        Self {
            keep_on_revert: true,
        }
    }
}

#[async_trait]
impl Task for AllocateVip {
    fn name(&self) -> String {
        "allocate-vip".to_string()
    }

    async fn execute(&self, ctx: &TaskContext, inputs: &Bindings) -> Result<Bindings, TaskError> {
        let lb_id = require_str(inputs, LOADBALANCER_ID)?;
        let mut lb = ctx
            .store
            .get_load_balancer(lb_id)?
            .ok_or_else(|| TaskError::Hard(format!("unknown load balancer {lb_id}")))?;

        let mut outputs = Bindings::new();
        if let (Some(address), Some(port_id), Some(subnet_id)) =
            (&lb.vip_address, &lb.vip_port_id, &lb.vip_subnet_id)
        {
            debug!(%lb_id, %address, "VIP already allocated, reusing");
            outputs.insert(VIP_ADDRESS.into(), serde_json::json!(address));
            outputs.insert(VIP_PORT_ID.into(), serde_json::json!(port_id));
            outputs.insert(VIP_SUBNET_ID.into(), serde_json::json!(subnet_id));
            outputs.insert(VIP_ALLOCATED.into(), serde_json::json!(false));
            return Ok(outputs);
        }

        let vip = ctx.network.allocate_vip(lb_id).await?;
        info!(%lb_id, address = %vip.address, port_id = %vip.port_id, "VIP allocated");

        lb.vip_address = Some(vip.address.clone());
        lb.vip_port_id = Some(vip.port_id.clone());
        lb.vip_subnet_id = Some(vip.subnet_id.clone());
        lb.updated_at = epoch_secs();
        ctx.store.put_load_balancer(&lb)?;

        outputs.insert(VIP_ADDRESS.into(), serde_json::json!(vip.address));
        outputs.insert(VIP_PORT_ID.into(), serde_json::json!(vip.port_id));
        outputs.insert(VIP_SUBNET_ID.into(), serde_json::json!(vip.subnet_id));
        outputs.insert(VIP_ALLOCATED.into(), serde_json::json!(true));
        Ok(outputs)
    }

    async fn revert(
        &self,
        ctx: &TaskContext,
        inputs: &Bindings,
        outputs: &Bindings,
    ) -> Result<(), TaskError> {
        let allocated = outputs
            .get(VIP_ALLOCATED)
            .and_then(|v| v.as_bool())
            .unwrap_or(false);
        if !allocated || self.keep_on_revert {
            debug!("leaving VIP in place on revert");
            return Ok(());
        }
        let port_id = require_str(outputs, VIP_PORT_ID)?;
        ctx.network.deallocate_vip(port_id).await?;

        let lb_id = require_str(inputs, LOADBALANCER_ID)?;
        if let Some(mut lb) = ctx.store.get_load_balancer(lb_id)? {
            lb.vip_address = None;
            lb.vip_port_id = None;
            lb.vip_subnet_id = None;
            lb.updated_at = epoch_secs();
            ctx.store.put_load_balancer(&lb)?;
        }
        Ok(())
    }
}

/// Plug the VIP subnet into one amphora's compute instance and record
/// the resulting VRRP address on the amphora.
pub struct PlugVip {
    amphora_key: String,
}

impl PlugVip {
    pub fn new(amphora_key: &str) -> Self {
        Self {
            amphora_key: amphora_key.to_string(),
        }
    }
}

#[async_trait]
impl Task for PlugVip {
    fn name(&self) -> String {
        format!("plug-vip-{}", self.amphora_key)
    }

    async fn execute(&self, ctx: &TaskContext, inputs: &Bindings) -> Result<Bindings, TaskError> {
        let amphora_id = require_str(inputs, &self.amphora_key)?;
        let subnet_id = require_str(inputs, VIP_SUBNET_ID)?;
        let mut amphora = ctx
            .store
            .get_amphora(amphora_id)?
            .ok_or_else(|| TaskError::Hard(format!("unknown amphora {amphora_id}")))?;
        let compute_id = amphora
            .compute_id
            .clone()
            .ok_or_else(|| TaskError::Hard(format!("amphora {amphora_id} has no compute")))?;

        let port = ctx.network.plug_port(&compute_id, subnet_id).await?;
        info!(%amphora_id, vrrp_ip = %port.address, "VIP subnet plugged");

        amphora.vrrp_ip = Some(port.address.clone());
        amphora.vrrp_port_id = Some(port.port_id.clone());
        amphora.updated_at = epoch_secs();
        ctx.store.put_amphora(&amphora)?;

        let mut outputs = Bindings::new();
        outputs.insert(
            format!("{}_vrrp_ip", self.amphora_key),
            serde_json::json!(port.address),
        );
        outputs.insert(
            format!("{}_vrrp_port_id", self.amphora_key),
            serde_json::json!(port.port_id),
        );
        Ok(outputs)
    }

    async fn revert(
        &self,
        ctx: &TaskContext,
        inputs: &Bindings,
        outputs: &Bindings,
    ) -> Result<(), TaskError> {
        let amphora_id = require_str(inputs, &self.amphora_key)?;
        let port_id = require_str(outputs, &format!("{}_vrrp_port_id", self.amphora_key))?;
        let Some(amphora) = ctx.store.get_amphora(amphora_id)? else {
            return Ok(());
        };
        if let Some(compute_id) = &amphora.compute_id {
            ctx.network.unplug_port(compute_id, port_id).await?;
        }
        let mut amphora = amphora;
        amphora.vrrp_ip = None;
        amphora.vrrp_port_id = None;
        amphora.updated_at = epoch_secs();
        ctx.store.put_amphora(&amphora)?;
        Ok(())
    }
}

/// Subnets to attach and detach for one amphora.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NetworkDelta {
    pub add: Vec<String>,
    pub remove: Vec<String>,
}

impl NetworkDelta {
    pub fn is_empty(&self) -> bool {
        self.add.is_empty() && self.remove.is_empty()
    }
}

fn delta_key(amphora_key: &str) -> String {
    format!("{amphora_key}_network_delta")
}

/// Compare the subnets an amphora needs (member subnets across all
/// pools) with what is plumbed into its instance, and publish the
/// difference. Pure computation, nothing to revert.
pub struct CalculateDelta {
    amphora_key: String,
}

impl CalculateDelta {
    pub fn new(amphora_key: &str) -> Self {
        Self {
            amphora_key: amphora_key.to_string(),
        }
    }
}

#[async_trait]
impl Task for CalculateDelta {
    fn name(&self) -> String {
        format!("calculate-delta-{}", self.amphora_key)
    }

    async fn execute(&self, ctx: &TaskContext, inputs: &Bindings) -> Result<Bindings, TaskError> {
        let lb_id = require_str(inputs, LOADBALANCER_ID)?;
        let amphora_id = require_str(inputs, &self.amphora_key)?;
        let lb = ctx
            .store
            .get_load_balancer(lb_id)?
            .ok_or_else(|| TaskError::Hard(format!("unknown load balancer {lb_id}")))?;
        let amphora = ctx
            .store
            .get_amphora(amphora_id)?
            .ok_or_else(|| TaskError::Hard(format!("unknown amphora {amphora_id}")))?;
        let compute_id = amphora
            .compute_id
            .ok_or_else(|| TaskError::Hard(format!("amphora {amphora_id} has no compute")))?;

        let mut desired: Vec<String> = lb
            .listeners
            .iter()
            .filter_map(|l| l.default_pool.as_ref())
            .flat_map(|p| p.members.iter())
            .filter_map(|m| m.subnet_id.clone())
            .collect();
        desired.sort();
        desired.dedup();

        // The VIP subnet is managed by the plug-vip task, never by the
        // delta; it must not show up as a removal candidate.
        let vip_subnet = lb.vip_subnet_id.as_deref();
        let actual: Vec<String> = ctx
            .network
            .plumbed_subnets(&compute_id)
            .await?
            .into_iter()
            .filter(|s| Some(s.as_str()) != vip_subnet)
            .collect();

        let delta = NetworkDelta {
            add: desired
                .iter()
                .filter(|s| !actual.contains(s))
                .cloned()
                .collect(),
            remove: actual
                .iter()
                .filter(|s| !desired.contains(s))
                .cloned()
                .collect(),
        };
        debug!(%amphora_id, add = delta.add.len(), remove = delta.remove.len(), "network delta calculated");

        let mut outputs = Bindings::new();
        outputs.insert(
            delta_key(&self.amphora_key),
            serde_json::to_value(&delta).map_err(|e| TaskError::Hard(e.to_string()))?,
        );
        Ok(outputs)
    }
}

/// Apply a previously calculated [`NetworkDelta`] to one amphora.
/// Revert detaches only the ports this execute attached.
pub struct HandleNetworkDelta {
    amphora_key: String,
}

impl HandleNetworkDelta {
    pub fn new(amphora_key: &str) -> Self {
        Self {
            amphora_key: amphora_key.to_string(),
        }
    }

    fn plugged_key(&self) -> String {
        format!("{}_plugged_ports", self.amphora_key)
    }
}

#[async_trait]
impl Task for HandleNetworkDelta {
    fn name(&self) -> String {
        format!("handle-delta-{}", self.amphora_key)
    }

    async fn execute(&self, ctx: &TaskContext, inputs: &Bindings) -> Result<Bindings, TaskError> {
        let amphora_id = require_str(inputs, &self.amphora_key)?;
        let delta: NetworkDelta = inputs
            .get(&delta_key(&self.amphora_key))
            .cloned()
            .map(serde_json::from_value)
            .transpose()
            .map_err(|e| TaskError::Hard(e.to_string()))?
            .unwrap_or_default();
        let amphora = ctx
            .store
            .get_amphora(amphora_id)?
            .ok_or_else(|| TaskError::Hard(format!("unknown amphora {amphora_id}")))?;
        let compute_id = amphora
            .compute_id
            .ok_or_else(|| TaskError::Hard(format!("amphora {amphora_id} has no compute")))?;

        let mut plugged: Vec<String> = Vec::new();
        for subnet_id in &delta.add {
            let port = ctx.network.plug_port(&compute_id, subnet_id).await?;
            plugged.push(port.port_id);
        }
        for subnet_id in &delta.remove {
            // Removals are best-effort; a subnet the instance no longer
            // has attached is not an error.
            if let Err(e) = detach_subnet(ctx, &compute_id, subnet_id).await {
                warn!(%amphora_id, %subnet_id, error = %e, "failed to detach stale subnet");
            }
        }
        if !delta.is_empty() {
            info!(%amphora_id, added = delta.add.len(), removed = delta.remove.len(), "network delta applied");
        }

        let mut outputs = Bindings::new();
        outputs.insert(self.plugged_key(), serde_json::json!(plugged));
        Ok(outputs)
    }

    async fn revert(
        &self,
        ctx: &TaskContext,
        inputs: &Bindings,
        outputs: &Bindings,
    ) -> Result<(), TaskError> {
        let amphora_id = require_str(inputs, &self.amphora_key)?;
        let Some(amphora) = ctx.store.get_amphora(amphora_id)? else {
            return Ok(());
        };
        let Some(compute_id) = amphora.compute_id else {
            return Ok(());
        };
        let plugged: Vec<String> = outputs
            .get(&self.plugged_key())
            .cloned()
            .map(serde_json::from_value)
            .transpose()
            .map_err(|e| TaskError::Hard(e.to_string()))?
            .unwrap_or_default();
        for port_id in plugged {
            ctx.network.unplug_port(&compute_id, &port_id).await?;
        }
        Ok(())
    }
}

async fn detach_subnet(
    ctx: &TaskContext,
    compute_id: &str,
    subnet_id: &str,
) -> Result<(), TaskError> {
    match ctx.network.find_port(compute_id, subnet_id).await? {
        Some(port) => ctx
            .network
            .unplug_port(compute_id, &port.port_id)
            .await
            .map_err(TaskError::from),
        None => Ok(()),
    }
}

/// Release the load balancer's VIP. Used only by the delete flow,
/// after the data plane is already gone, so it has no revert.
pub struct DeallocateVip;

#[async_trait]
impl Task for DeallocateVip {
    fn name(&self) -> String {
        "deallocate-vip".to_string()
    }

    async fn execute(&self, ctx: &TaskContext, inputs: &Bindings) -> Result<Bindings, TaskError> {
        let lb_id = require_str(inputs, LOADBALANCER_ID)?;
        let Some(mut lb) = ctx.store.get_load_balancer(lb_id)? else {
            return Ok(Bindings::new());
        };
        if let Some(port_id) = lb.vip_port_id.take() {
            ctx.network.deallocate_vip(&port_id).await?;
            info!(%lb_id, %port_id, "VIP deallocated");
        }
        lb.vip_address = None;
        lb.vip_subnet_id = None;
        lb.updated_at = epoch_secs();
        ctx.store.put_load_balancer(&lb)?;
        Ok(Bindings::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use tiller_agent::MemoryAgent;
    use tiller_store::{
        Amphora, AmphoraRole, AmphoraStatus, Listener, ListenerProtocol, LoadBalancer, Member,
        OperatingStatus, Pool, ProvisioningStatus, StateStore, Topology,
    };

    use crate::drivers::memory::{MemoryCompute, MemoryNetwork, MemorySparePool};

    fn ctx() -> TaskContext {
        let store = StateStore::open_in_memory().unwrap();
        TaskContext {
            store: store.clone(),
            compute: Arc::new(MemoryCompute::new()),
            network: Arc::new(MemoryNetwork::new()),
            agent: Arc::new(MemoryAgent::new()),
            spares: Arc::new(MemorySparePool::new(store)),
        }
    }

    fn seed_lb(ctx: &TaskContext, id: &str) -> LoadBalancer {
        let lb = LoadBalancer {
            id: id.to_string(),
            name: "web".to_string(),
            topology: Topology::Single,
            provisioning_status: ProvisioningStatus::PendingCreate,
            operating_status: OperatingStatus::Active,
            vip_address: None,
            vip_port_id: None,
            vip_subnet_id: None,
            listeners: Vec::new(),
            fault_reason: None,
            created_at: 0,
            updated_at: 0,
        };
        ctx.store.put_load_balancer(&lb).unwrap();
        lb
    }

    async fn seed_amphora(ctx: &TaskContext, id: &str, lb_id: &str) -> Amphora {
        let instance = ctx.compute.boot_instance(id).await.unwrap();
        let amphora = Amphora {
            id: id.to_string(),
            load_balancer_id: Some(lb_id.to_string()),
            compute_id: Some(instance.compute_id),
            management_ip: Some(instance.management_ip),
            vrrp_ip: None,
            vrrp_port_id: None,
            role: AmphoraRole::Standalone,
            status: AmphoraStatus::Allocated,
            last_seen: 0,
            last_sequence: 0,
            created_at: 0,
            updated_at: 0,
        };
        ctx.store.put_amphora(&amphora).unwrap();
        amphora
    }

    fn bindings(lb_id: &str) -> Bindings {
        let mut b = Bindings::new();
        b.insert(LOADBALANCER_ID.into(), serde_json::json!(lb_id));
        b
    }

    #[tokio::test]
    async fn allocate_vip_records_and_publishes() {
        let ctx = ctx();
        seed_lb(&ctx, "lb-1");

        let outputs = AllocateVip::new()
            .execute(&ctx, &bindings("lb-1"))
            .await
            .unwrap();

        let lb = ctx.store.get_load_balancer("lb-1").unwrap().unwrap();
        assert_eq!(
            lb.vip_address.as_deref(),
            outputs[VIP_ADDRESS].as_str()
        );
        assert_eq!(outputs[VIP_ALLOCATED], serde_json::json!(true));
    }

    #[tokio::test]
    async fn allocate_vip_is_idempotent() {
        let ctx = ctx();
        seed_lb(&ctx, "lb-1");

        let task = AllocateVip::new();
        let first = task.execute(&ctx, &bindings("lb-1")).await.unwrap();
        let second = task.execute(&ctx, &bindings("lb-1")).await.unwrap();

        assert_eq!(first[VIP_ADDRESS], second[VIP_ADDRESS]);
        assert_eq!(second[VIP_ALLOCATED], serde_json::json!(false));
    }

    #[tokio::test]
    async fn allocate_vip_revert_releases_fresh_allocation() {
        let ctx = ctx();
        seed_lb(&ctx, "lb-1");
        let inputs = bindings("lb-1");

        let task = AllocateVip::new();
        let outputs = task.execute(&ctx, &inputs).await.unwrap();
        task.revert(&ctx, &inputs, &outputs).await.unwrap();

        let lb = ctx.store.get_load_balancer("lb-1").unwrap().unwrap();
        assert!(lb.vip_port_id.is_none());
    }

    #[tokio::test]
    async fn failover_vip_is_kept_on_revert() {
        let ctx = ctx();
        seed_lb(&ctx, "lb-1");
        let inputs = bindings("lb-1");

        let task = AllocateVip::for_failover();
        let outputs = task.execute(&ctx, &inputs).await.unwrap();
        task.revert(&ctx, &inputs, &outputs).await.unwrap();

        // The VIP survives the revert.
        let lb = ctx.store.get_load_balancer("lb-1").unwrap().unwrap();
        assert!(lb.vip_port_id.is_some());
    }

    #[tokio::test]
    async fn pre_existing_vip_survives_revert() {
        let ctx = ctx();
        seed_lb(&ctx, "lb-1");
        let inputs = bindings("lb-1");

        let task = AllocateVip::new();
        let _ = task.execute(&ctx, &inputs).await.unwrap();
        // Second run finds the VIP in place; its revert must not touch it.
        let outputs = task.execute(&ctx, &inputs).await.unwrap();
        task.revert(&ctx, &inputs, &outputs).await.unwrap();

        let lb = ctx.store.get_load_balancer("lb-1").unwrap().unwrap();
        assert!(lb.vip_port_id.is_some());
    }

    #[tokio::test]
    async fn plug_vip_records_vrrp_facts() {
        let ctx = ctx();
        seed_lb(&ctx, "lb-1");
        seed_amphora(&ctx, "amp-1", "lb-1").await;

        let mut inputs = bindings("lb-1");
        let vip = AllocateVip::new().execute(&ctx, &inputs).await.unwrap();
        inputs.extend(vip);
        inputs.insert("amphora_0".into(), serde_json::json!("amp-1"));

        let task = PlugVip::new("amphora_0");
        let outputs = task.execute(&ctx, &inputs).await.unwrap();

        let amphora = ctx.store.get_amphora("amp-1").unwrap().unwrap();
        assert_eq!(
            amphora.vrrp_ip.as_deref(),
            outputs["amphora_0_vrrp_ip"].as_str()
        );

        task.revert(&ctx, &inputs, &outputs).await.unwrap();
        let amphora = ctx.store.get_amphora("amp-1").unwrap().unwrap();
        assert!(amphora.vrrp_ip.is_none());
    }

    #[tokio::test]
    async fn delta_adds_missing_member_subnets() {
        let ctx = ctx();
        let mut lb = seed_lb(&ctx, "lb-1");
        lb.listeners = vec![Listener {
            id: "ls-1".to_string(),
            protocol: ListenerProtocol::Tcp,
            port: 80,
            default_pool: Some(Pool {
                id: "pool-1".to_string(),
                algorithm: tiller_store::BalancingAlgorithm::RoundRobin,
                members: vec![Member {
                    id: "m-1".to_string(),
                    address: "10.0.1.5".to_string(),
                    port: 8080,
                    weight: 1,
                    subnet_id: Some("subnet-members".to_string()),
                }],
                health_monitor: None,
            }),
            l7_policies: Vec::new(),
        }];
        ctx.store.put_load_balancer(&lb).unwrap();
        seed_amphora(&ctx, "amp-1", "lb-1").await;

        let mut inputs = bindings("lb-1");
        inputs.insert("amphora_0".into(), serde_json::json!("amp-1"));

        let outputs = CalculateDelta::new("amphora_0")
            .execute(&ctx, &inputs)
            .await
            .unwrap();
        let delta: NetworkDelta =
            serde_json::from_value(outputs["amphora_0_network_delta"].clone()).unwrap();
        assert_eq!(delta.add, vec!["subnet-members".to_string()]);
        assert!(delta.remove.is_empty());

        inputs.extend(outputs);
        let handle = HandleNetworkDelta::new("amphora_0");
        let outputs = handle.execute(&ctx, &inputs).await.unwrap();
        let plugged: Vec<String> =
            serde_json::from_value(outputs["amphora_0_plugged_ports"].clone()).unwrap();
        assert_eq!(plugged.len(), 1);

        // Delta converges: a second calculation finds nothing to do.
        let outputs = CalculateDelta::new("amphora_0")
            .execute(&ctx, &inputs)
            .await
            .unwrap();
        let delta: NetworkDelta =
            serde_json::from_value(outputs["amphora_0_network_delta"].clone()).unwrap();
        assert!(delta.is_empty());
    }

    #[tokio::test]
    async fn handle_delta_revert_unplugs_added_ports() {
        let ctx = ctx();
        let mut lb = seed_lb(&ctx, "lb-1");
        lb.listeners = vec![Listener {
            id: "ls-1".to_string(),
            protocol: ListenerProtocol::Tcp,
            port: 80,
            default_pool: Some(Pool {
                id: "pool-1".to_string(),
                algorithm: tiller_store::BalancingAlgorithm::RoundRobin,
                members: vec![Member {
                    id: "m-1".to_string(),
                    address: "10.0.1.5".to_string(),
                    port: 8080,
                    weight: 1,
                    subnet_id: Some("subnet-members".to_string()),
                }],
                health_monitor: None,
            }),
            l7_policies: Vec::new(),
        }];
        ctx.store.put_load_balancer(&lb).unwrap();
        let amphora = seed_amphora(&ctx, "amp-1", "lb-1").await;
        let compute_id = amphora.compute_id.unwrap();

        let mut inputs = bindings("lb-1");
        inputs.insert("amphora_0".into(), serde_json::json!("amp-1"));
        let calc = CalculateDelta::new("amphora_0")
            .execute(&ctx, &inputs)
            .await
            .unwrap();
        inputs.extend(calc);

        let handle = HandleNetworkDelta::new("amphora_0");
        let outputs = handle.execute(&ctx, &inputs).await.unwrap();
        handle.revert(&ctx, &inputs, &outputs).await.unwrap();

        let plumbed = ctx.network.plumbed_subnets(&compute_id).await.unwrap();
        assert!(plumbed.is_empty());
    }

    #[tokio::test]
    async fn deallocate_vip_clears_record() {
        let ctx = ctx();
        seed_lb(&ctx, "lb-1");
        let inputs = bindings("lb-1");
        AllocateVip::new().execute(&ctx, &inputs).await.unwrap();

        DeallocateVip.execute(&ctx, &inputs).await.unwrap();

        let lb = ctx.store.get_load_balancer("lb-1").unwrap().unwrap();
        assert!(lb.vip_address.is_none());
        assert!(lb.vip_port_id.is_none());
    }
}
