//! Liveness tracking and failover emission.
//!
//! Per-amphora state machine driven from two sides: accepted heartbeats
//! move an amphora to HEALTHY, and the periodic tick ages everything
//! that has gone quiet through SUSPECT into DEAD. An amphora that was
//! booted but never heartbeated is aged from its last record update, so
//! a silent boot is caught the same way as a mid-life death.
//!
//! A DEAD verdict emits exactly one failover job per episode: the
//! episode disarms on emission and re-arms only on failover completion,
//! a fresh heartbeat, or the configured re-arm interval elapsing. A
//! per-balancer cooldown spaces out emissions even across distinct
//! amphorae.

use std::collections::HashMap;
use std::hash::{BuildHasher, Hasher};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::{debug, info, warn};

use tiller_agent::AgentChannel;
use tiller_coordinator::JobQueue;
use tiller_store::{
    AgentConfig, Amphora, AmphoraRole, AmphoraStatus, DataPlaneState, HeartbeatPayload, Job,
    LifecycleOperation, LoadBalancer, ProvisioningStatus, StateStore,
};

use crate::error::HealthError;
use crate::failover::{derive_operating_status, plan_failover};

pub use tiller_store::epoch_secs;

fn fresh_job_id() -> String {
    let mut hasher = std::collections::hash_map::RandomState::new().build_hasher();
    hasher.write_u128(
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos(),
    );
    format!("job-{:016x}", hasher.finish())
}

/// Liveness verdict for one amphora.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthState {
    Healthy,
    Suspect,
    Dead,
}

/// Tuning knobs for the liveness state machine.
#[derive(Debug, Clone, Copy)]
pub struct LivenessConfig {
    /// Expected heartbeat interval T.
    pub heartbeat_interval: Duration,
    /// Silence longer than this many T marks an amphora SUSPECT.
    pub suspect_multiplier: u32,
    /// Silence longer than this many T marks an amphora DEAD.
    pub dead_multiplier: u32,
    /// Minimum spacing between failover emissions per balancer.
    pub cooldown: Duration,
    /// A still-dead episode re-arms after this long, in case its
    /// failover job was lost.
    pub rearm: Duration,
}

impl Default for LivenessConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(10),
            suspect_multiplier: 1,
            dead_multiplier: 3,
            cooldown: Duration::from_secs(60),
            rearm: Duration::from_secs(300),
        }
    }
}

struct Episode {
    state: HealthState,
    /// A DEAD verdict may emit a failover only while armed.
    armed: bool,
    /// When a disarmed dead episode re-arms itself.
    rearm_at: u64,
    /// Latest heartbeat reported a down listener or member.
    data_plane_down: bool,
}

impl Default for Episode {
    fn default() -> Self {
        Self {
            state: HealthState::Healthy,
            armed: true,
            rearm_at: 0,
            data_plane_down: false,
        }
    }
}

/// Applies heartbeats and turns silence into failover jobs.
pub struct LivenessEngine {
    store: StateStore,
    jobs: Arc<dyn JobQueue>,
    agent: Arc<dyn AgentChannel>,
    config: LivenessConfig,
    episodes: Mutex<HashMap<String, Episode>>,
    /// Per-balancer earliest next emission.
    cooldowns: Mutex<HashMap<String, u64>>,
}

impl LivenessEngine {
    pub fn new(store: StateStore, jobs: Arc<dyn JobQueue>, agent: Arc<dyn AgentChannel>) -> Self {
        Self {
            store,
            jobs,
            agent,
            config: LivenessConfig::default(),
            episodes: Mutex::new(HashMap::new()),
            cooldowns: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_config(mut self, config: LivenessConfig) -> Self {
        self.config = config;
        self
    }

    /// Current verdict for an amphora. Unknown amphorae read HEALTHY.
    pub fn health_of(&self, amphora_id: &str) -> HealthState {
        self.episodes
            .lock()
            .map(|eps| {
                eps.get(amphora_id)
                    .map(|e| e.state)
                    .unwrap_or(HealthState::Healthy)
            })
            .unwrap_or(HealthState::Healthy)
    }

    /// Apply one verified heartbeat. Returns false if the sequence was
    /// stale or replayed, in which case nothing changes.
    pub fn apply(&self, payload: &HeartbeatPayload, now: u64) -> Result<bool, HealthError> {
        let applied = self
            .store
            .record_heartbeat(&payload.amphora_id, payload.sequence, now)?;
        if !applied {
            debug!(
                amphora_id = %payload.amphora_id,
                sequence = payload.sequence,
                "stale or replayed heartbeat ignored"
            );
            return Ok(false);
        }

        let data_plane_down = payload.listeners.iter().any(|l| {
            l.state == DataPlaneState::Down
                || l.members.iter().any(|m| m.state == DataPlaneState::Down)
        });

        if let Ok(mut episodes) = self.episodes.lock() {
            let episode = episodes.entry(payload.amphora_id.clone()).or_default();
            if episode.state != HealthState::Healthy {
                info!(amphora_id = %payload.amphora_id, "amphora recovered");
            }
            episode.state = HealthState::Healthy;
            episode.armed = true;
            episode.rearm_at = 0;
            episode.data_plane_down = data_plane_down;
        }
        Ok(true)
    }

    /// Close an amphora's dead episode once its failover flow finished,
    /// so a relapse of the replacement counts as a new episode.
    pub fn failover_completed(&self, amphora_id: &str) {
        if let Ok(mut episodes) = self.episodes.lock() {
            episodes.remove(amphora_id);
        }
    }

    /// Age every monitored amphora and emit failover jobs for new
    /// deaths. Also refreshes each balancer's derived operating status.
    pub async fn tick(&self, now: u64) -> Result<(), HealthError> {
        let t = self.config.heartbeat_interval.as_secs();
        let suspect_after = t * u64::from(self.config.suspect_multiplier);
        let dead_after = t * u64::from(self.config.dead_multiplier);

        let mut by_lb: HashMap<String, Vec<Amphora>> = HashMap::new();
        let mut monitored_ids: std::collections::HashSet<String> = std::collections::HashSet::new();
        for amphora in self.store.list_amphorae()? {
            let monitored = matches!(
                amphora.status,
                AmphoraStatus::Ready | AmphoraStatus::FailoverInProgress
            );
            if !monitored {
                continue;
            }
            if let Some(lb_id) = amphora.load_balancer_id.clone() {
                monitored_ids.insert(amphora.id.clone());
                by_lb.entry(lb_id).or_default().push(amphora);
            }
        }

        // Episodes for tombstoned or reclaimed amphorae are closed.
        if let Ok(mut episodes) = self.episodes.lock() {
            episodes.retain(|id, _| monitored_ids.contains(id));
        }

        for (lb_id, amphorae) in by_lb {
            let Some(lb) = self.store.get_load_balancer(&lb_id)? else {
                continue;
            };
            // A balancer mid-mutation is judged by its running flow.
            if lb.provisioning_status != ProvisioningStatus::Active {
                continue;
            }

            let mut healthy = 0usize;
            let mut degraded = false;
            let mut dead_to_emit: Vec<String> = Vec::new();

            if let Ok(mut episodes) = self.episodes.lock() {
                for amphora in &amphorae {
                    // A failover already in progress keeps its episode
                    // as-is; the replacement flow owns it now.
                    if amphora.status != AmphoraStatus::Ready {
                        continue;
                    }
                    let basis = amphora.last_seen.max(amphora.updated_at);
                    let elapsed = now.saturating_sub(basis);
                    let verdict = if elapsed >= dead_after {
                        HealthState::Dead
                    } else if elapsed >= suspect_after {
                        HealthState::Suspect
                    } else {
                        HealthState::Healthy
                    };

                    let episode = episodes.entry(amphora.id.clone()).or_default();
                    if verdict != episode.state {
                        info!(amphora_id = %amphora.id, %lb_id, ?verdict, elapsed, "liveness transition");
                    }
                    episode.state = verdict;

                    match verdict {
                        HealthState::Healthy => {
                            healthy += 1;
                            if episode.data_plane_down {
                                degraded = true;
                            }
                        }
                        // Suspect is a grace state: the amphora is
                        // still serving, the balancer is just degraded.
                        HealthState::Suspect => {
                            healthy += 1;
                            degraded = true;
                        }
                        HealthState::Dead => {
                            if !episode.armed && episode.rearm_at != 0 && now >= episode.rearm_at {
                                warn!(amphora_id = %amphora.id, "dead episode re-armed");
                                episode.armed = true;
                            }
                            if episode.armed {
                                dead_to_emit.push(amphora.id.clone());
                            }
                        }
                    }
                }
            }

            if !dead_to_emit.is_empty() && self.cooldown_open(&lb_id, now) {
                self.emit_failover(&lb, &amphorae, &dead_to_emit, now)
                    .await?;
                if let Ok(mut episodes) = self.episodes.lock() {
                    for id in &dead_to_emit {
                        if let Some(episode) = episodes.get_mut(id) {
                            episode.armed = false;
                            episode.rearm_at = now + self.config.rearm.as_secs();
                        }
                    }
                }
                if let Ok(mut cooldowns) = self.cooldowns.lock() {
                    cooldowns.insert(lb_id.clone(), now + self.config.cooldown.as_secs());
                }
            }

            let required = lb.topology.required_amphorae();
            let status = derive_operating_status(required, healthy, degraded);
            if status != lb.operating_status {
                let mut lb = lb;
                info!(%lb_id, from = ?lb.operating_status, to = ?status, "operating status changed");
                lb.operating_status = status;
                lb.updated_at = now;
                self.store.put_load_balancer(&lb)?;
            }
        }
        Ok(())
    }

    fn cooldown_open(&self, lb_id: &str, now: u64) -> bool {
        self.cooldowns
            .lock()
            .map(|c| c.get(lb_id).is_none_or(|&until| now >= until))
            .unwrap_or(true)
    }

    async fn emit_failover(
        &self,
        lb: &LoadBalancer,
        amphorae: &[Amphora],
        dead: &[String],
        now: u64,
    ) -> Result<(), HealthError> {
        let plan = plan_failover(lb, amphorae, dead);
        warn!(lb_id = %lb.id, ?dead, promote = ?plan.promote, "amphora death, scheduling failover");

        if let Some(backup_id) = &plan.promote {
            self.promote(lb, amphorae, backup_id, now).await;
        }

        for amphora_id in dead {
            if let Some(mut amphora) = self.store.get_amphora(amphora_id)? {
                amphora.status = AmphoraStatus::FailoverInProgress;
                amphora.updated_at = now;
                self.store.put_amphora(&amphora)?;
            }
        }

        let enqueued = self
            .jobs
            .enqueue(Job {
                id: fresh_job_id(),
                load_balancer_id: lb.id.clone(),
                operation: LifecycleOperation::Failover,
                failed_amphorae: plan.failed,
                enqueued_at: now,
            })
            .await
            .map_err(|e| HealthError::Queue(e.to_string()))?;
        if !enqueued {
            debug!(lb_id = %lb.id, "failover already pending");
        }
        Ok(())
    }

    /// Data-plane fast path for a dead MASTER: tell the healthy BACKUP
    /// to take over the VIP immediately, without waiting for a claim.
    /// Best-effort; the replacement flow re-pushes both configs anyway.
    async fn promote(&self, lb: &LoadBalancer, amphorae: &[Amphora], backup_id: &str, now: u64) {
        let Some(backup) = amphorae.iter().find(|a| a.id == backup_id) else {
            return;
        };
        let (Some(endpoint), Some(vip_address)) = (&backup.management_ip, &lb.vip_address) else {
            warn!(%backup_id, "cannot promote backup without endpoint and VIP");
            return;
        };

        let config = AgentConfig {
            load_balancer_id: lb.id.clone(),
            amphora_id: backup.id.clone(),
            role: AmphoraRole::Master,
            topology: lb.topology,
            vip_address: vip_address.clone(),
            peer_address: None,
            listeners: lb.listeners.clone(),
        };
        match self.agent.update(endpoint, &config).await {
            Ok(()) => {
                info!(%backup_id, lb_id = %lb.id, "backup promoted at the data plane");
                let mut promoted = backup.clone();
                promoted.role = AmphoraRole::Master;
                promoted.updated_at = now;
                if let Err(e) = self.store.put_amphora(&promoted) {
                    warn!(%backup_id, error = %e, "failed to record promotion");
                }
            }
            Err(e) => {
                warn!(%backup_id, error = %e, "data-plane promotion failed, replacement flow will rebuild");
            }
        }
    }

    /// Drain the hand-off queue and tick periodically until shutdown.
    pub async fn run(
        &self,
        queue: Arc<crate::listener::HandoffQueue>,
        tick_interval: Duration,
        mut shutdown: tokio::sync::watch::Receiver<bool>,
    ) -> Result<(), HealthError> {
        info!("liveness engine started");
        let mut ticker = tokio::time::interval(tick_interval);
        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
                payload = queue.pop() => {
                    if let Err(e) = self.apply(&payload, epoch_secs()) {
                        warn!(error = %e, "heartbeat apply failed");
                    }
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.tick(epoch_secs()).await {
                        warn!(error = %e, "liveness tick failed");
                    }
                }
            }
        }
        info!("liveness engine stopped");
        Ok(())
    }
}
