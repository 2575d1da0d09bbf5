//! In-memory agent channel.
//!
//! Stands in for a fleet of amphora agents in tests and in the
//! single-process demo mode. Replay semantics mirror the real agent: a
//! config push with an unchanged digest is accepted but applied as a
//! no-op.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use async_trait::async_trait;

use tiller_store::{AgentConfig, AgentDiagnostics, AgentStatus, ListenerStatus};

use crate::client::{config_digest, AgentChannel};
use crate::error::AgentError;

#[derive(Default)]
struct AgentSlot {
    /// Digest of the currently applied config.
    applied_digest: Option<String>,
    applied_config: Option<AgentConfig>,
    /// Times a push actually changed the applied config.
    apply_count: u32,
    /// Total pushes received, including no-op replays.
    push_count: u32,
    listeners: Vec<ListenerStatus>,
}

/// In-memory [`AgentChannel`] implementation.
#[derive(Default)]
pub struct MemoryAgent {
    slots: Mutex<HashMap<String, AgentSlot>>,
    /// Endpoints currently unreachable (simulates boot or network loss).
    offline: Mutex<HashSet<String>>,
    /// Remaining injected transient failures per endpoint.
    transient_failures: Mutex<HashMap<String, u32>>,
    /// Endpoints that permanently reject pushes with a hard fault.
    faulted: Mutex<HashSet<String>>,
}

impl MemoryAgent {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark an endpoint unreachable; calls fail with a transport error.
    pub fn set_offline(&self, endpoint: &str, offline: bool) {
        let mut set = self.offline.lock().unwrap();
        if offline {
            set.insert(endpoint.to_string());
        } else {
            set.remove(endpoint);
        }
    }

    /// Inject `count` transient failures for the next calls to an endpoint.
    pub fn fail_transiently(&self, endpoint: &str, count: u32) {
        self.transient_failures
            .lock()
            .unwrap()
            .insert(endpoint.to_string(), count);
    }

    /// Make config pushes to an endpoint fail permanently.
    pub fn set_faulted(&self, endpoint: &str) {
        self.faulted.lock().unwrap().insert(endpoint.to_string());
    }

    /// Times a push actually changed the endpoint's config.
    pub fn apply_count(&self, endpoint: &str) -> u32 {
        self.slots
            .lock()
            .unwrap()
            .get(endpoint)
            .map(|s| s.apply_count)
            .unwrap_or(0)
    }

    /// Total pushes received by the endpoint, replays included.
    pub fn push_count(&self, endpoint: &str) -> u32 {
        self.slots
            .lock()
            .unwrap()
            .get(endpoint)
            .map(|s| s.push_count)
            .unwrap_or(0)
    }

    /// The config currently applied at an endpoint, if any.
    pub fn applied_config(&self, endpoint: &str) -> Option<AgentConfig> {
        self.slots
            .lock()
            .unwrap()
            .get(endpoint)
            .and_then(|s| s.applied_config.clone())
    }

    /// Replace the listener statuses the endpoint reports.
    pub fn set_listener_statuses(&self, endpoint: &str, listeners: Vec<ListenerStatus>) {
        let mut slots = self.slots.lock().unwrap();
        slots.entry(endpoint.to_string()).or_default().listeners = listeners;
    }

    /// Fail the call if the endpoint is offline or has injected failures.
    fn check_reachable(&self, endpoint: &str) -> Result<(), AgentError> {
        if self.offline.lock().unwrap().contains(endpoint) {
            return Err(AgentError::Transport {
                endpoint: endpoint.to_string(),
                reason: "connection refused".to_string(),
            });
        }
        let mut failures = self.transient_failures.lock().unwrap();
        if let Some(remaining) = failures.get_mut(endpoint) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(AgentError::Timeout(endpoint.to_string()));
            }
        }
        Ok(())
    }
}

#[async_trait]
impl AgentChannel for MemoryAgent {
    async fn provision(&self, endpoint: &str, config: &AgentConfig) -> Result<(), AgentError> {
        self.check_reachable(endpoint)?;
        if self.faulted.lock().unwrap().contains(endpoint) {
            return Err(AgentError::AgentFault {
                endpoint: endpoint.to_string(),
                reason: "configuration apply failed".to_string(),
            });
        }

        let digest = config_digest(config);
        let mut slots = self.slots.lock().unwrap();
        let slot = slots.entry(endpoint.to_string()).or_default();
        slot.push_count += 1;
        // Replaying the same document is a no-op.
        if slot.applied_digest.as_deref() != Some(digest.as_str()) {
            slot.applied_digest = Some(digest);
            slot.applied_config = Some(config.clone());
            slot.apply_count += 1;
        }
        Ok(())
    }

    async fn update(&self, endpoint: &str, config: &AgentConfig) -> Result<(), AgentError> {
        self.provision(endpoint, config).await
    }

    async fn get_status(&self, endpoint: &str) -> Result<AgentStatus, AgentError> {
        self.check_reachable(endpoint)?;
        let slots = self.slots.lock().unwrap();
        let slot = slots.get(endpoint);
        Ok(AgentStatus {
            amphora_id: slot
                .and_then(|s| s.applied_config.as_ref())
                .map(|c| c.amphora_id.clone())
                .unwrap_or_default(),
            applied_digest: slot.and_then(|s| s.applied_digest.clone()),
            listeners: slot.map(|s| s.listeners.clone()).unwrap_or_default(),
        })
    }

    async fn get_diagnostics(&self, endpoint: &str) -> Result<AgentDiagnostics, AgentError> {
        self.check_reachable(endpoint)?;
        let slots = self.slots.lock().unwrap();
        Ok(AgentDiagnostics {
            amphora_id: slots
                .get(endpoint)
                .and_then(|s| s.applied_config.as_ref())
                .map(|c| c.amphora_id.clone())
                .unwrap_or_default(),
            uptime_secs: 0,
            cpu_load: 0.0,
            memory_used_bytes: 0,
            active_connections: 0,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tiller_store::{AmphoraRole, Topology};

    fn test_config(vip: &str) -> AgentConfig {
        AgentConfig {
            load_balancer_id: "lb-1".to_string(),
            amphora_id: "amp-1".to_string(),
            role: AmphoraRole::Standalone,
            topology: Topology::Single,
            vip_address: vip.to_string(),
            peer_address: None,
            listeners: Vec::new(),
        }
    }

    #[tokio::test]
    async fn provision_then_status() {
        let agent = MemoryAgent::new();
        let config = test_config("203.0.113.1");

        agent.provision("192.0.2.10:9443", &config).await.unwrap();

        let status = agent.get_status("192.0.2.10:9443").await.unwrap();
        assert_eq!(status.amphora_id, "amp-1");
        assert_eq!(status.applied_digest, Some(config_digest(&config)));
    }

    #[tokio::test]
    async fn replayed_push_is_noop() {
        let agent = MemoryAgent::new();
        let config = test_config("203.0.113.1");

        agent.provision("192.0.2.10:9443", &config).await.unwrap();
        agent.provision("192.0.2.10:9443", &config).await.unwrap();

        assert_eq!(agent.push_count("192.0.2.10:9443"), 2);
        assert_eq!(agent.apply_count("192.0.2.10:9443"), 1);
    }

    #[tokio::test]
    async fn changed_config_applies() {
        let agent = MemoryAgent::new();
        agent
            .provision("192.0.2.10:9443", &test_config("203.0.113.1"))
            .await
            .unwrap();
        agent
            .update("192.0.2.10:9443", &test_config("203.0.113.2"))
            .await
            .unwrap();

        assert_eq!(agent.apply_count("192.0.2.10:9443"), 2);
        let applied = agent.applied_config("192.0.2.10:9443").unwrap();
        assert_eq!(applied.vip_address, "203.0.113.2");
    }

    #[tokio::test]
    async fn offline_endpoint_is_transient() {
        let agent = MemoryAgent::new();
        agent.set_offline("192.0.2.10:9443", true);

        let err = agent.get_status("192.0.2.10:9443").await.unwrap_err();
        assert!(err.is_transient());

        agent.set_offline("192.0.2.10:9443", false);
        assert!(agent.get_status("192.0.2.10:9443").await.is_ok());
    }

    #[tokio::test]
    async fn injected_transient_failures_run_out() {
        let agent = MemoryAgent::new();
        agent.fail_transiently("192.0.2.10:9443", 2);

        assert!(agent.get_status("192.0.2.10:9443").await.is_err());
        assert!(agent.get_status("192.0.2.10:9443").await.is_err());
        assert!(agent.get_status("192.0.2.10:9443").await.is_ok());
    }

    #[tokio::test]
    async fn faulted_endpoint_is_hard_failure() {
        let agent = MemoryAgent::new();
        agent.set_faulted("192.0.2.10:9443");

        let err = agent
            .provision("192.0.2.10:9443", &test_config("203.0.113.1"))
            .await
            .unwrap_err();
        assert!(!err.is_transient());
    }
}
