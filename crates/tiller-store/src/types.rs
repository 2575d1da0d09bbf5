//! Domain types for the Tiller state store.
//!
//! These types represent the persisted control-plane view of load
//! balancers, their amphorae, and the topology pushed down to the
//! amphora agent. All types are serializable to/from JSON for storage
//! in redb tables and for the agent wire documents.

use serde::{Deserialize, Serialize};

/// Unique identifier for a load balancer.
pub type LoadBalancerId = String;

/// Unique identifier for an amphora.
pub type AmphoraId = String;

/// Current Unix epoch in seconds.
pub fn epoch_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

// ── Load balancer ─────────────────────────────────────────────────

/// Provisioning status of a load balancer, driven by lifecycle flows.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProvisioningStatus {
    PendingCreate,
    Active,
    PendingUpdate,
    PendingDelete,
    Deleted,
    Error,
}

/// Externally visible health of a load balancer, derived from the
/// health of its amphorae and members. Never set independently.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OperatingStatus {
    Active,
    Degraded,
    Error,
}

/// How many amphorae back a load balancer.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Topology {
    Single,
    ActiveStandby,
}

impl Topology {
    /// Number of amphorae this topology requires.
    pub fn required_amphorae(&self) -> usize {
        match self {
            Topology::Single => 1,
            Topology::ActiveStandby => 2,
        }
    }
}

/// A load balancer and its desired topology.
///
/// The store owns this record; workers hold a working copy per flow.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LoadBalancer {
    pub id: LoadBalancerId,
    pub name: String,
    pub topology: Topology,
    pub provisioning_status: ProvisioningStatus,
    pub operating_status: OperatingStatus,
    /// Virtual IP address, populated once allocated.
    pub vip_address: Option<String>,
    /// Network port backing the VIP.
    pub vip_port_id: Option<String>,
    /// Subnet the VIP lives on.
    pub vip_subnet_id: Option<String>,
    /// Desired listener topology pushed to the amphorae.
    pub listeners: Vec<Listener>,
    /// Recorded reason for the last terminal failure, if any.
    pub fault_reason: Option<String>,
    /// Unix timestamp (seconds) when this record was created.
    pub created_at: u64,
    /// Unix timestamp (seconds) when this record was last updated.
    pub updated_at: u64,
}

/// A frontend listener on a load balancer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Listener {
    pub id: String,
    pub protocol: ListenerProtocol,
    pub port: u16,
    pub default_pool: Option<Pool>,
    /// L7 routing policies evaluated in order.
    pub l7_policies: Vec<L7Policy>,
}

/// Listener protocol.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ListenerProtocol {
    Tcp,
    Http,
    Https,
}

/// A backend pool behind a listener.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Pool {
    pub id: String,
    pub algorithm: BalancingAlgorithm,
    pub members: Vec<Member>,
    pub health_monitor: Option<HealthMonitorSpec>,
}

/// Pool balancing algorithm.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BalancingAlgorithm {
    RoundRobin,
    LeastConnections,
    SourceIp,
}

/// A backend member of a pool.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Member {
    pub id: String,
    pub address: String,
    pub port: u16,
    pub weight: u32,
    /// Subnet the member lives on; drives amphora port plugging.
    pub subnet_id: Option<String>,
}

/// Health monitor parameters for a pool, executed by the amphora.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HealthMonitorSpec {
    /// Seconds between member probes.
    pub delay_secs: u32,
    /// Per-probe timeout in seconds.
    pub timeout_secs: u32,
    /// Consecutive failures before a member is marked down.
    pub max_retries: u32,
    /// HTTP path for HTTP-type monitors.
    pub url_path: Option<String>,
}

/// An L7 policy on a listener.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct L7Policy {
    pub id: String,
    pub action: L7Action,
}

/// What an L7 policy does when it matches.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum L7Action {
    RedirectToUrl { url: String },
    RedirectToPool { pool_id: String },
    Reject,
}

// ── Amphora ───────────────────────────────────────────────────────

/// Role of an amphora within its load balancer.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AmphoraRole {
    Master,
    Backup,
    Standalone,
}

/// Lifecycle status of an amphora, driven by flows.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AmphoraStatus {
    Booting,
    Allocated,
    Ready,
    FailoverInProgress,
    Deleted,
    Error,
}

/// A managed load-balancer instance running in a compute VM.
///
/// An amphora belongs to exactly one load balancer, or sits
/// unallocated in the spares pool (`load_balancer_id == None`).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Amphora {
    pub id: AmphoraId,
    pub load_balancer_id: Option<LoadBalancerId>,
    /// Compute instance backing this amphora.
    pub compute_id: Option<String>,
    /// Management-network address the agent listens on.
    pub management_ip: Option<String>,
    /// Data-plane address used for VRRP between the pair.
    pub vrrp_ip: Option<String>,
    /// Network port carrying the VIP traffic on this amphora.
    pub vrrp_port_id: Option<String>,
    pub role: AmphoraRole,
    pub status: AmphoraStatus,
    /// Unix timestamp (seconds) of the last valid heartbeat.
    /// Written only by the heartbeat path.
    pub last_seen: u64,
    /// Highest heartbeat sequence number applied.
    /// Written only by the heartbeat path.
    pub last_sequence: u64,
    pub created_at: u64,
    pub updated_at: u64,
}

impl Amphora {
    /// Whether this amphora is an unallocated spare ready for adoption.
    pub fn is_spare(&self) -> bool {
        self.load_balancer_id.is_none() && self.status == AmphoraStatus::Ready
    }
}

// ── Agent documents ───────────────────────────────────────────────

/// Configuration document pushed to an amphora agent.
///
/// Replaying the same document is a no-op on the agent side; the
/// `config_digest` lets the agent (and tests) detect replays.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentConfig {
    pub load_balancer_id: LoadBalancerId,
    pub amphora_id: AmphoraId,
    pub role: AmphoraRole,
    pub topology: Topology,
    pub vip_address: String,
    /// VRRP peer address for active-standby pairs.
    pub peer_address: Option<String>,
    pub listeners: Vec<Listener>,
}

/// Status document reported by an amphora agent.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentStatus {
    pub amphora_id: AmphoraId,
    /// Digest of the configuration currently applied, if any.
    pub applied_digest: Option<String>,
    pub listeners: Vec<ListenerStatus>,
}

/// Diagnostics document reported by an amphora agent.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentDiagnostics {
    pub amphora_id: AmphoraId,
    pub uptime_secs: u64,
    pub cpu_load: f64,
    pub memory_used_bytes: u64,
    pub active_connections: u64,
}

/// Per-listener status summary, also carried in heartbeats.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ListenerStatus {
    pub listener_id: String,
    pub state: DataPlaneState,
    pub members: Vec<MemberStatus>,
}

/// Per-member status summary as seen by the amphora.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MemberStatus {
    pub member_id: String,
    pub state: DataPlaneState,
}

/// Health of a data-plane object as reported by an amphora.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DataPlaneState {
    Up,
    Down,
    NoCheck,
}

// ── Heartbeats ────────────────────────────────────────────────────

/// Payload of one heartbeat packet from an amphora.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HeartbeatPayload {
    pub amphora_id: AmphoraId,
    /// Monotonically increasing per-amphora counter.
    pub sequence: u64,
    /// Sender clock, Unix seconds; used for the max-age check.
    pub sent_at: u64,
    pub listeners: Vec<ListenerStatus>,
}

// ── Jobs and flow runs ────────────────────────────────────────────

/// Lifecycle operation requested against a load balancer.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LifecycleOperation {
    Create,
    Update,
    Delete,
    Failover,
}

/// One unit of work pulled from the job queue by a worker.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Job {
    pub id: String,
    pub load_balancer_id: LoadBalancerId,
    pub operation: LifecycleOperation,
    /// Amphorae being failed over; empty for other operations.
    pub failed_amphorae: Vec<AmphoraId>,
    pub enqueued_at: u64,
}

/// Terminal or in-flight state of a flow run.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FlowRunState {
    Running,
    Completed,
    Failed,
    Reverted,
}

/// Durable record of one flow execution against a load balancer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FlowRun {
    pub id: String,
    pub load_balancer_id: LoadBalancerId,
    pub flow_name: String,
    pub state: FlowRunState,
    /// Failure detail when `state` is `Failed` or `Reverted`.
    pub failure: Option<String>,
    pub created_at: u64,
    pub updated_at: u64,
}

/// Durable record of one completed node within a flow run.
///
/// Lets a crashed executor resume without re-running the node, and
/// gives the revert cascade the node's recorded outputs.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NodeResult {
    pub run_id: String,
    pub node: String,
    /// Completion sequence within the run, for revert ordering.
    pub position: u32,
    pub outputs: serde_json::Value,
    pub completed_at: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn topology_required_amphorae() {
        assert_eq!(Topology::Single.required_amphorae(), 1);
        assert_eq!(Topology::ActiveStandby.required_amphorae(), 2);
    }

    #[test]
    fn spare_detection() {
        let mut amp = Amphora {
            id: "amp-1".to_string(),
            load_balancer_id: None,
            compute_id: Some("vm-1".to_string()),
            management_ip: Some("192.0.2.10".to_string()),
            vrrp_ip: None,
            vrrp_port_id: None,
            role: AmphoraRole::Standalone,
            status: AmphoraStatus::Ready,
            last_seen: 0,
            last_sequence: 0,
            created_at: 1000,
            updated_at: 1000,
        };
        assert!(amp.is_spare());

        amp.load_balancer_id = Some("lb-1".to_string());
        assert!(!amp.is_spare());

        amp.load_balancer_id = None;
        amp.status = AmphoraStatus::Booting;
        assert!(!amp.is_spare());
    }

    #[test]
    fn status_serialization_uses_screaming_snake_case() {
        let json = serde_json::to_string(&ProvisioningStatus::PendingCreate).unwrap();
        assert_eq!(json, "\"PENDING_CREATE\"");
        let json = serde_json::to_string(&AmphoraStatus::FailoverInProgress).unwrap();
        assert_eq!(json, "\"FAILOVER_IN_PROGRESS\"");
        let json = serde_json::to_string(&AmphoraRole::Master).unwrap();
        assert_eq!(json, "\"MASTER\"");
    }

    #[test]
    fn l7_action_tagged_serialization() {
        let action = L7Action::RedirectToUrl {
            url: "https://example.com".to_string(),
        };
        let json = serde_json::to_value(&action).unwrap();
        assert_eq!(json["type"], "redirect_to_url");

        let back: L7Action = serde_json::from_value(json).unwrap();
        assert_eq!(back, action);
    }
}
