//! UDP heartbeat listener.
//!
//! One socket, one receive loop. Every datagram is verified and either
//! pushed onto the hand-off queue or dropped with the reason counted.
//! The queue is bounded and sheds its oldest entry when full, so the
//! receive loop keeps draining the socket no matter how slow the
//! consumer is.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::sync::{watch, Notify};
use tracing::{debug, info, warn};

use tiller_store::HeartbeatPayload;

use crate::error::{HealthError, WireError};
use crate::wire::{decode_heartbeat, MAX_DATAGRAM};

/// Drop counters, exposed for diagnostics and asserted on in tests.
#[derive(Default)]
pub struct ListenerStats {
    pub received: AtomicU64,
    pub accepted: AtomicU64,
    pub auth_failures: AtomicU64,
    pub stale: AtomicU64,
    pub malformed: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub received: u64,
    pub accepted: u64,
    pub auth_failures: u64,
    pub stale: u64,
    pub malformed: u64,
}

impl ListenerStats {
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            received: self.received.load(Ordering::Relaxed),
            accepted: self.accepted.load(Ordering::Relaxed),
            auth_failures: self.auth_failures.load(Ordering::Relaxed),
            stale: self.stale.load(Ordering::Relaxed),
            malformed: self.malformed.load(Ordering::Relaxed),
        }
    }
}

/// Bounded heartbeat hand-off between the listener and the engine.
///
/// `push` never blocks: at capacity the oldest record is dropped and
/// counted. `pop` waits until a record is available.
pub struct HandoffQueue {
    inner: Mutex<VecDeque<HeartbeatPayload>>,
    capacity: usize,
    notify: Notify,
    shed: AtomicU64,
}

impl HandoffQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity: capacity.max(1),
            notify: Notify::new(),
            shed: AtomicU64::new(0),
        }
    }

    /// Enqueue, shedding the oldest record at capacity. Returns true if
    /// something was shed.
    pub fn push(&self, payload: HeartbeatPayload) -> bool {
        let mut shed = false;
        {
            let mut inner = match self.inner.lock() {
                Ok(inner) => inner,
                Err(poisoned) => poisoned.into_inner(),
            };
            if inner.len() >= self.capacity {
                inner.pop_front();
                self.shed.fetch_add(1, Ordering::Relaxed);
                shed = true;
            }
            inner.push_back(payload);
        }
        self.notify.notify_one();
        shed
    }

    /// Dequeue, waiting for a record if the queue is empty.
    pub async fn pop(&self) -> HeartbeatPayload {
        loop {
            {
                let mut inner = match self.inner.lock() {
                    Ok(inner) => inner,
                    Err(poisoned) => poisoned.into_inner(),
                };
                if let Some(payload) = inner.pop_front() {
                    return payload;
                }
            }
            self.notify.notified().await;
        }
    }

    /// Dequeue without waiting.
    pub fn try_pop(&self) -> Option<HeartbeatPayload> {
        match self.inner.lock() {
            Ok(mut inner) => inner.pop_front(),
            Err(poisoned) => poisoned.into_inner().pop_front(),
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().map(|q| q.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Records dropped to keep the receive path unblocked.
    pub fn shed_count(&self) -> u64 {
        self.shed.load(Ordering::Relaxed)
    }
}

/// Verifies heartbeat datagrams off a UDP socket.
pub struct HeartbeatListener {
    secret: Vec<u8>,
    max_age: Duration,
}

impl HeartbeatListener {
    pub fn new(secret: Vec<u8>) -> Self {
        Self {
            secret,
            max_age: Duration::from_secs(30),
        }
    }

    pub fn with_max_age(mut self, max_age: Duration) -> Self {
        self.max_age = max_age;
        self
    }

    /// Verify one datagram and hand it off. Exposed for tests; the
    /// receive loop is a thin wrapper around this.
    pub fn ingest(
        &self,
        datagram: &[u8],
        now: u64,
        queue: &HandoffQueue,
        stats: &ListenerStats,
    ) {
        stats.received.fetch_add(1, Ordering::Relaxed);
        match decode_heartbeat(datagram, &self.secret, self.max_age, now) {
            Ok(payload) => {
                stats.accepted.fetch_add(1, Ordering::Relaxed);
                // Sheds are counted by the queue itself.
                queue.push(payload);
            }
            // Authentication failures are counted but never answered.
            Err(WireError::BadMac) => {
                stats.auth_failures.fetch_add(1, Ordering::Relaxed);
            }
            Err(WireError::TooOld { age_secs }) => {
                debug!(age_secs, "stale heartbeat dropped");
                stats.stale.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                debug!(error = %e, "malformed heartbeat dropped");
                stats.malformed.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Receive loop. Runs until the shutdown signal flips to true.
    pub async fn run(
        &self,
        socket: UdpSocket,
        queue: &HandoffQueue,
        stats: &ListenerStats,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<(), HealthError> {
        let local = socket.local_addr()?;
        info!(%local, "heartbeat listener started");
        let mut buf = vec![0u8; MAX_DATAGRAM];
        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
                received = socket.recv_from(&mut buf) => {
                    match received {
                        Ok((len, _peer)) => {
                            let now = crate::tracker::epoch_secs();
                            self.ingest(&buf[..len], now, queue, stats);
                        }
                        Err(e) => {
                            warn!(error = %e, "heartbeat socket receive failed");
                        }
                    }
                }
            }
        }
        info!(%local, "heartbeat listener stopped");
        Ok(())
    }
}
