//! Lifecycle flow builders.
//!
//! One builder per lifecycle operation. Builders are pure: they wire
//! task nodes into a [`Flow`] from the load balancer's topology, and
//! [`flow_for_job`] seeds the initial bindings from the stored records
//! so the tasks themselves never look at the job.
//!
//! Binding key conventions: existing amphorae are `amphora_{i}`, dead
//! amphorae in a failover are `failed_{i}`, their replacements are
//! `replacement_{i}`, and the surviving peer is `survivor_0`.

use std::sync::Arc;

use tiller_store::{
    Amphora, AmphoraRole, AmphoraStatus, Job, LifecycleOperation, LoadBalancer, Topology,
};

use crate::dag::{Flow, FlowBuilder};
use crate::error::FlowError;
use crate::task::Bindings;
use crate::tasks::amphora::{
    AllocateAmphora, DeleteAmphora, PushAmphoraConfig, WaitAmphoraReady,
};
use crate::tasks::lifecycle::{MarkLbActive, MarkLbDeleted};
use crate::tasks::network::{
    AllocateVip, CalculateDelta, DeallocateVip, HandleNetworkDelta, PlugVip, LOADBALANCER_ID,
};

/// Roles for a fresh set of amphorae under the given topology.
fn roles_for(topology: Topology) -> Vec<AmphoraRole> {
    match topology {
        Topology::Single => vec![AmphoraRole::Standalone],
        Topology::ActiveStandby => vec![AmphoraRole::Master, AmphoraRole::Backup],
    }
}

/// Build one amphora branch: allocate, wait for compute, plug the VIP.
/// Returns the name of the branch's last node.
fn amphora_branch(
    builder: &mut FlowBuilder,
    key: &str,
    role: AmphoraRole,
    vip_node: &str,
) -> String {
    let alloc = builder.add(Arc::new(AllocateAmphora::new(key, role)), &[]);
    let ready = builder.add(Arc::new(WaitAmphoraReady::new(key)), &[&alloc]);
    builder.add(Arc::new(PlugVip::new(key)), &[&ready, vip_node])
}

/// Reconcile member subnets and push configuration for one amphora.
fn configure_branch(
    builder: &mut FlowBuilder,
    key: &str,
    push: PushAmphoraConfig,
    after: &[&str],
) -> String {
    let calc = builder.add(Arc::new(CalculateDelta::new(key)), after);
    let handle = builder.add(Arc::new(HandleNetworkDelta::new(key)), &[&calc]);
    builder.add(Arc::new(push), &[&handle])
}

/// Flow provisioning a new load balancer end to end.
pub fn create_flow(topology: Topology) -> Result<Flow, FlowError> {
    let mut builder = FlowBuilder::new("create-loadbalancer");
    let vip = builder.add(Arc::new(AllocateVip::new()), &[]);

    let roles = roles_for(topology);
    let keys: Vec<String> = (0..roles.len()).map(|i| format!("amphora_{i}")).collect();

    let mut plugged = Vec::new();
    for (key, role) in keys.iter().zip(roles) {
        plugged.push(amphora_branch(&mut builder, key, role, &vip));
    }
    // Peer VRRP addresses come from the plug nodes, so in an
    // ACTIVE_STANDBY pair each push waits for both branches.
    let plugged_refs: Vec<&str> = plugged.iter().map(String::as_str).collect();

    let mut pushes = Vec::new();
    for (i, key) in keys.iter().enumerate() {
        let mut push = PushAmphoraConfig::provision(key);
        if keys.len() > 1 {
            let peer = &keys[(i + 1) % keys.len()];
            push = push.with_peer(peer);
        }
        pushes.push(configure_branch(&mut builder, key, push, &plugged_refs));
    }

    let push_refs: Vec<&str> = pushes.iter().map(String::as_str).collect();
    builder.add(Arc::new(MarkLbActive), &push_refs);
    builder.build()
}

/// Flow pushing an updated configuration to every amphora of a running
/// load balancer, reconciling member subnets first.
pub fn update_flow(amphora_count: usize, topology: Topology) -> Result<Flow, FlowError> {
    let mut builder = FlowBuilder::new("update-loadbalancer");
    let keys: Vec<String> = (0..amphora_count).map(|i| format!("amphora_{i}")).collect();

    let mut pushes = Vec::new();
    for (i, key) in keys.iter().enumerate() {
        let mut push = PushAmphoraConfig::update(key);
        if topology == Topology::ActiveStandby && keys.len() > 1 {
            push = push.with_peer(&keys[(i + 1) % keys.len()]);
        }
        pushes.push(configure_branch(&mut builder, key, push, &[]));
    }

    let push_refs: Vec<&str> = pushes.iter().map(String::as_str).collect();
    builder.add(Arc::new(MarkLbActive), &push_refs);
    builder.build()
}

/// Flow tearing a load balancer down: every amphora first, then the
/// VIP, then the record.
pub fn delete_flow(amphora_count: usize) -> Result<Flow, FlowError> {
    let mut builder = FlowBuilder::new("delete-loadbalancer");

    let deletes: Vec<String> = (0..amphora_count)
        .map(|i| builder.add(Arc::new(DeleteAmphora::new(&format!("amphora_{i}"))), &[]))
        .collect();
    let delete_refs: Vec<&str> = deletes.iter().map(String::as_str).collect();

    let vip = builder.add(Arc::new(DeallocateVip), &delete_refs);
    builder.add(Arc::new(MarkLbDeleted), &[&vip]);
    builder.build()
}

/// Flow replacing dead amphorae.
///
/// The dead instances are torn down and replacements built in their
/// place. For a SINGLE topology or a dead pair the replacements carry
/// the topology's fresh roles; for a single death in an ACTIVE_STANDBY
/// pair the replacement always joins as Backup (the survivor was
/// already promoted when the failure was detected) and the survivor
/// gets a configuration update pointing at its new peer.
pub fn failover_flow(topology: Topology, failed_count: usize) -> Result<Flow, FlowError> {
    let mut builder = FlowBuilder::new("failover-loadbalancer");
    // The VIP predates the failure; revert must never release it.
    let vip = builder.add(Arc::new(AllocateVip::for_failover()), &[]);

    for i in 0..failed_count {
        builder.add(Arc::new(DeleteAmphora::new(&format!("failed_{i}"))), &[]);
    }

    let has_survivor = topology == Topology::ActiveStandby && failed_count == 1;
    let roles: Vec<AmphoraRole> = if has_survivor {
        vec![AmphoraRole::Backup]
    } else {
        roles_for(topology).into_iter().take(failed_count.max(1)).collect()
    };
    let keys: Vec<String> = (0..roles.len())
        .map(|i| format!("replacement_{i}"))
        .collect();

    let mut plugged = Vec::new();
    for (key, role) in keys.iter().zip(roles) {
        plugged.push(amphora_branch(&mut builder, key, role, &vip));
    }
    let plugged_refs: Vec<&str> = plugged.iter().map(String::as_str).collect();

    let mut pushes = Vec::new();
    for (i, key) in keys.iter().enumerate() {
        let mut push = PushAmphoraConfig::provision(key);
        if has_survivor {
            push = push.with_peer("survivor_0");
        } else if keys.len() > 1 {
            push = push.with_peer(&keys[(i + 1) % keys.len()]);
        }
        pushes.push(configure_branch(&mut builder, key, push, &plugged_refs));
    }

    if has_survivor {
        let push = PushAmphoraConfig::update("survivor_0").with_peer("replacement_0");
        pushes.push(builder.add(Arc::new(push), &plugged_refs));
    }

    let push_refs: Vec<&str> = pushes.iter().map(String::as_str).collect();
    builder.add(Arc::new(MarkLbActive), &push_refs);
    builder.build()
}

/// Build the flow for a queued job and seed its initial bindings from
/// the stored records.
pub fn flow_for_job(
    job: &Job,
    lb: &LoadBalancer,
    amphorae: &[Amphora],
) -> Result<(Flow, Bindings), FlowError> {
    let mut bindings = Bindings::new();
    bindings.insert(LOADBALANCER_ID.into(), serde_json::json!(lb.id));

    let live: Vec<&Amphora> = amphorae
        .iter()
        .filter(|a| a.status != AmphoraStatus::Deleted)
        .collect();

    match job.operation {
        LifecycleOperation::Create => Ok((create_flow(lb.topology)?, bindings)),
        LifecycleOperation::Update => {
            for (i, amphora) in live.iter().enumerate() {
                bindings.insert(format!("amphora_{i}"), serde_json::json!(amphora.id));
                if let Some(vrrp_ip) = &amphora.vrrp_ip {
                    bindings.insert(
                        format!("amphora_{i}_vrrp_ip"),
                        serde_json::json!(vrrp_ip),
                    );
                }
            }
            Ok((update_flow(live.len(), lb.topology)?, bindings))
        }
        LifecycleOperation::Delete => {
            for (i, amphora) in live.iter().enumerate() {
                bindings.insert(format!("amphora_{i}"), serde_json::json!(amphora.id));
            }
            Ok((delete_flow(live.len())?, bindings))
        }
        LifecycleOperation::Failover => {
            for (i, failed_id) in job.failed_amphorae.iter().enumerate() {
                bindings.insert(format!("failed_{i}"), serde_json::json!(failed_id));
            }
            let survivors: Vec<&&Amphora> = live
                .iter()
                .filter(|a| !job.failed_amphorae.contains(&a.id))
                .collect();
            if let Some(survivor) = survivors.first() {
                bindings.insert("survivor_0".into(), serde_json::json!(survivor.id));
                if let Some(vrrp_ip) = &survivor.vrrp_ip {
                    bindings.insert(
                        "survivor_0_vrrp_ip".into(),
                        serde_json::json!(vrrp_ip),
                    );
                }
            }
            Ok((
                failover_flow(lb.topology, job.failed_amphorae.len())?,
                bindings,
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use tiller_agent::MemoryAgent;
    use tiller_store::{
        Listener, ListenerProtocol, OperatingStatus, ProvisioningStatus, StateStore,
    };
    use tokio::sync::watch;

    use crate::drivers::memory::{MemoryCompute, MemoryNetwork, MemorySparePool};
    use crate::drivers::ComputeDriver;
    use crate::runner::FlowRunner;
    use crate::task::TaskContext;

    struct Harness {
        store: StateStore,
        compute: Arc<MemoryCompute>,
        network: Arc<MemoryNetwork>,
        agent: Arc<MemoryAgent>,
        ctx: TaskContext,
    }

    fn harness() -> Harness {
        let store = StateStore::open_in_memory().unwrap();
        let compute = Arc::new(MemoryCompute::new());
        let network = Arc::new(MemoryNetwork::new());
        let agent = Arc::new(MemoryAgent::new());
        let ctx = TaskContext {
            store: store.clone(),
            compute: compute.clone(),
            network: network.clone(),
            agent: agent.clone(),
            spares: Arc::new(MemorySparePool::new(store.clone())),
        };
        Harness {
            store,
            compute,
            network,
            agent,
            ctx,
        }
    }

    fn seed_lb(store: &StateStore, id: &str, topology: Topology) -> LoadBalancer {
        let lb = LoadBalancer {
            id: id.to_string(),
            name: "web".to_string(),
            topology,
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
        store.put_load_balancer(&lb).unwrap();
        lb
    }

    fn job(lb_id: &str, operation: LifecycleOperation) -> Job {
        Job {
            id: "job-1".to_string(),
            load_balancer_id: lb_id.to_string(),
            operation,
            failed_amphorae: Vec::new(),
            enqueued_at: 0,
        }
    }

    fn no_abort() -> watch::Receiver<bool> {
        let (tx, rx) = watch::channel(false);
        std::mem::forget(tx);
        rx
    }

    async fn run(h: &Harness, run_id: &str, flow: &Flow, bindings: Bindings) -> Result<Bindings, FlowError> {
        FlowRunner::new(h.store.clone())
            .run(run_id, "lb-1", flow, &h.ctx, bindings, no_abort())
            .await
    }

    #[tokio::test]
    async fn create_single_provisions_one_amphora() {
        let h = harness();
        let lb = seed_lb(&h.store, "lb-1", Topology::Single);
        let (flow, bindings) =
            flow_for_job(&job("lb-1", LifecycleOperation::Create), &lb, &[]).unwrap();

        run(&h, "run-1", &flow, bindings).await.unwrap();

        let lb = h.store.get_load_balancer("lb-1").unwrap().unwrap();
        assert_eq!(lb.provisioning_status, ProvisioningStatus::Active);
        assert!(lb.vip_address.is_some());

        let amphorae = h.store.list_amphorae_for_lb("lb-1").unwrap();
        assert_eq!(amphorae.len(), 1);
        assert_eq!(amphorae[0].status, AmphoraStatus::Ready);
        assert_eq!(amphorae[0].role, AmphoraRole::Standalone);
        assert!(amphorae[0].vrrp_ip.is_some());

        // The agent received exactly one applied configuration.
        let endpoint = amphorae[0].management_ip.as_deref().unwrap();
        assert_eq!(h.agent.apply_count(endpoint), 1);
    }

    #[tokio::test]
    async fn create_active_standby_pairs_peers() {
        let h = harness();
        let lb = seed_lb(&h.store, "lb-1", Topology::ActiveStandby);
        let (flow, bindings) =
            flow_for_job(&job("lb-1", LifecycleOperation::Create), &lb, &[]).unwrap();

        run(&h, "run-1", &flow, bindings).await.unwrap();

        let amphorae = h.store.list_amphorae_for_lb("lb-1").unwrap();
        assert_eq!(amphorae.len(), 2);
        let roles: Vec<AmphoraRole> = amphorae.iter().map(|a| a.role).collect();
        assert!(roles.contains(&AmphoraRole::Master));
        assert!(roles.contains(&AmphoraRole::Backup));

        // Each config points at the other amphora's VRRP address.
        for amphora in &amphorae {
            let endpoint = amphora.management_ip.as_deref().unwrap();
            let config = h.agent.applied_config(endpoint).unwrap();
            let peer = config.peer_address.unwrap();
            let other = amphorae.iter().find(|a| a.id != amphora.id).unwrap();
            assert_eq!(Some(peer.as_str()), other.vrrp_ip.as_deref());
        }
    }

    #[tokio::test]
    async fn failed_create_leaves_no_orphaned_resources() {
        let h = harness();
        let lb = seed_lb(&h.store, "lb-1", Topology::Single);
        // Every plug fails, so the flow dies after VIP allocation and
        // amphora boot.
        h.network.set_fail_plug(true);

        let (flow, bindings) =
            flow_for_job(&job("lb-1", LifecycleOperation::Create), &lb, &[]).unwrap();
        let err = run(&h, "run-1", &flow, bindings).await.unwrap_err();
        assert!(matches!(err, FlowError::TaskFailed { .. }));

        // The booted instance was deleted and the VIP released.
        assert_eq!(h.compute.instance_count(), 0);
        let lb = h.store.get_load_balancer("lb-1").unwrap().unwrap();
        assert!(lb.vip_port_id.is_none());
        assert!(h.store.list_amphorae_for_lb("lb-1").unwrap().is_empty());
    }

    #[tokio::test]
    async fn create_reverts_when_the_agent_never_answers() {
        let h = harness();
        seed_lb(&h.store, "lb-1", Topology::Single);

        // One spare whose agent endpoint times out on every call; the
        // push exhausts its retries and the whole flow reverts.
        let instance = h.compute.boot_instance("spare-1").await.unwrap();
        h.agent.fail_transiently(&instance.management_ip, 100);
        h.store
            .put_amphora(&Amphora {
                id: "spare-1".to_string(),
                load_balancer_id: None,
                compute_id: Some(instance.compute_id.clone()),
                management_ip: Some(instance.management_ip.clone()),
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

        let lb = h.store.get_load_balancer("lb-1").unwrap().unwrap();
        let (flow, bindings) =
            flow_for_job(&job("lb-1", LifecycleOperation::Create), &lb, &[]).unwrap();
        let err = run(&h, "run-1", &flow, bindings).await.unwrap_err();
        assert!(matches!(err, FlowError::TaskFailed { .. }));

        // The spare went back to the pool and the VIP was released;
        // nothing is left attached to the balancer.
        let spare = h.store.get_amphora("spare-1").unwrap().unwrap();
        assert!(spare.load_balancer_id.is_none());
        assert_eq!(spare.status, AmphoraStatus::Ready);
        let lb = h.store.get_load_balancer("lb-1").unwrap().unwrap();
        assert!(lb.vip_port_id.is_none());
        assert!(h.store.list_amphorae_for_lb("lb-1").unwrap().is_empty());
    }

    #[tokio::test]
    async fn update_pushes_new_config_to_every_amphora() {
        let h = harness();
        let mut lb = seed_lb(&h.store, "lb-1", Topology::ActiveStandby);
        let (flow, bindings) =
            flow_for_job(&job("lb-1", LifecycleOperation::Create), &lb, &[]).unwrap();
        run(&h, "run-1", &flow, bindings).await.unwrap();

        lb = h.store.get_load_balancer("lb-1").unwrap().unwrap();
        lb.listeners.push(Listener {
            id: "ls-1".to_string(),
            protocol: ListenerProtocol::Http,
            port: 80,
            default_pool: None,
            l7_policies: Vec::new(),
        });
        h.store.put_load_balancer(&lb).unwrap();

        let amphorae = h.store.list_amphorae_for_lb("lb-1").unwrap();
        let (flow, bindings) =
            flow_for_job(&job("lb-1", LifecycleOperation::Update), &lb, &amphorae).unwrap();
        run(&h, "run-2", &flow, bindings).await.unwrap();

        for amphora in &amphorae {
            let endpoint = amphora.management_ip.as_deref().unwrap();
            assert_eq!(h.agent.apply_count(endpoint), 2);
        }
    }

    #[tokio::test]
    async fn delete_tears_everything_down() {
        let h = harness();
        let lb = seed_lb(&h.store, "lb-1", Topology::ActiveStandby);
        let (flow, bindings) =
            flow_for_job(&job("lb-1", LifecycleOperation::Create), &lb, &[]).unwrap();
        run(&h, "run-1", &flow, bindings).await.unwrap();

        let lb = h.store.get_load_balancer("lb-1").unwrap().unwrap();
        let amphorae = h.store.list_amphorae_for_lb("lb-1").unwrap();
        let (flow, bindings) =
            flow_for_job(&job("lb-1", LifecycleOperation::Delete), &lb, &amphorae).unwrap();
        run(&h, "run-2", &flow, bindings).await.unwrap();

        assert_eq!(h.compute.instance_count(), 0);
        let lb = h.store.get_load_balancer("lb-1").unwrap().unwrap();
        assert_eq!(lb.provisioning_status, ProvisioningStatus::Deleted);
        assert!(lb.vip_address.is_none());
        for amphora in h.store.list_amphorae_for_lb("lb-1").unwrap() {
            assert_eq!(amphora.status, AmphoraStatus::Deleted);
        }
    }

    #[tokio::test]
    async fn failover_replaces_dead_backup_and_rewires_survivor() {
        let h = harness();
        let lb = seed_lb(&h.store, "lb-1", Topology::ActiveStandby);
        let (flow, bindings) =
            flow_for_job(&job("lb-1", LifecycleOperation::Create), &lb, &[]).unwrap();
        run(&h, "run-1", &flow, bindings).await.unwrap();

        let lb = h.store.get_load_balancer("lb-1").unwrap().unwrap();
        let amphorae = h.store.list_amphorae_for_lb("lb-1").unwrap();
        let dead = amphorae
            .iter()
            .find(|a| a.role == AmphoraRole::Backup)
            .unwrap()
            .clone();
        let survivor = amphorae
            .iter()
            .find(|a| a.role == AmphoraRole::Master)
            .unwrap()
            .clone();

        let mut failover = job("lb-1", LifecycleOperation::Failover);
        failover.failed_amphorae = vec![dead.id.clone()];
        let (flow, bindings) = flow_for_job(&failover, &lb, &amphorae).unwrap();
        run(&h, "run-2", &flow, bindings).await.unwrap();

        // The dead amphora is tombstoned and a Backup replacement runs
        // in its place.
        let amphorae = h.store.list_amphorae_for_lb("lb-1").unwrap();
        let live: Vec<&Amphora> = amphorae
            .iter()
            .filter(|a| a.status != AmphoraStatus::Deleted)
            .collect();
        assert_eq!(live.len(), 2);
        let replacement = live.iter().find(|a| a.id != survivor.id).unwrap();
        assert_eq!(replacement.role, AmphoraRole::Backup);
        assert_eq!(replacement.status, AmphoraStatus::Ready);

        // The survivor was re-pointed at the replacement's VRRP address.
        let survivor_endpoint = survivor.management_ip.as_deref().unwrap();
        let config = h.agent.applied_config(survivor_endpoint).unwrap();
        assert_eq!(
            config.peer_address.as_deref(),
            replacement.vrrp_ip.as_deref()
        );

        // The VIP never moved.
        let lb_after = h.store.get_load_balancer("lb-1").unwrap().unwrap();
        assert_eq!(lb_after.vip_address, lb.vip_address);
        assert_eq!(lb_after.provisioning_status, ProvisioningStatus::Active);
    }

    #[tokio::test]
    async fn failed_failover_keeps_the_vip() {
        let h = harness();
        let lb = seed_lb(&h.store, "lb-1", Topology::Single);
        let (flow, bindings) =
            flow_for_job(&job("lb-1", LifecycleOperation::Create), &lb, &[]).unwrap();
        run(&h, "run-1", &flow, bindings).await.unwrap();

        let lb = h.store.get_load_balancer("lb-1").unwrap().unwrap();
        let amphorae = h.store.list_amphorae_for_lb("lb-1").unwrap();
        let mut failover = job("lb-1", LifecycleOperation::Failover);
        failover.failed_amphorae = vec![amphorae[0].id.clone()];

        // Replacement plumbing fails; the flow reverts.
        h.network.set_fail_plug(true);
        let (flow, bindings) = flow_for_job(&failover, &lb, &amphorae).unwrap();
        let err = run(&h, "run-2", &flow, bindings).await.unwrap_err();
        assert!(matches!(err, FlowError::TaskFailed { .. }));

        // The service address survived the failed replacement attempt.
        let lb_after = h.store.get_load_balancer("lb-1").unwrap().unwrap();
        assert_eq!(lb_after.vip_address, lb.vip_address);
    }

    #[tokio::test]
    async fn dual_failure_rebuilds_the_pair() {
        let h = harness();
        let lb = seed_lb(&h.store, "lb-1", Topology::ActiveStandby);
        let (flow, bindings) =
            flow_for_job(&job("lb-1", LifecycleOperation::Create), &lb, &[]).unwrap();
        run(&h, "run-1", &flow, bindings).await.unwrap();

        let lb = h.store.get_load_balancer("lb-1").unwrap().unwrap();
        let amphorae = h.store.list_amphorae_for_lb("lb-1").unwrap();
        let mut failover = job("lb-1", LifecycleOperation::Failover);
        failover.failed_amphorae = amphorae.iter().map(|a| a.id.clone()).collect();

        let (flow, bindings) = flow_for_job(&failover, &lb, &amphorae).unwrap();
        run(&h, "run-2", &flow, bindings).await.unwrap();

        let live: Vec<Amphora> = h
            .store
            .list_amphorae_for_lb("lb-1")
            .unwrap()
            .into_iter()
            .filter(|a| a.status != AmphoraStatus::Deleted)
            .collect();
        assert_eq!(live.len(), 2);
        let roles: Vec<AmphoraRole> = live.iter().map(|a| a.role).collect();
        assert!(roles.contains(&AmphoraRole::Master));
        assert!(roles.contains(&AmphoraRole::Backup));
    }
}
