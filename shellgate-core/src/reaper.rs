//! Periodic eviction of dead, abandoned, and over-age PTY sessions.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info};

use crate::config::ReaperConfig;
use crate::pty::{PtyBroker, PtySession};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EvictionReason {
    ProcessExited,
    Disconnected,
    IdleCeiling,
}

impl fmt::Display for EvictionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ProcessExited => write!(f, "process exited"),
            Self::Disconnected => write!(f, "disconnected past grace period"),
            Self::IdleCeiling => write!(f, "idle ceiling exceeded"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Eviction {
    pub session_id: String,
    pub reason: EvictionReason,
}

pub struct Reaper {
    broker: Arc<PtyBroker>,
    disconnect_grace: Duration,
    idle_ceiling: Duration,
    interval: Duration,
}

impl Reaper {
    pub fn new(broker: Arc<PtyBroker>, config: &ReaperConfig) -> Self {
        Self {
            broker,
            disconnect_grace: config.disconnect_grace(),
            idle_ceiling: config.idle_ceiling(),
            interval: config.interval(),
        }
    }

    fn decide(&self, session: &PtySession, now: Instant) -> Option<EvictionReason> {
        if session.has_exited() {
            return Some(EvictionReason::ProcessExited);
        }
        let idle = session.idle_for(now);
        if !session.is_connected() && idle > self.disconnect_grace {
            return Some(EvictionReason::Disconnected);
        }
        if idle > self.idle_ceiling {
            return Some(EvictionReason::IdleCeiling);
        }
        None
    }

    pub fn sweep(&self) -> Vec<Eviction> {
        self.sweep_at(Instant::now())
    }

    /// Run one cycle as if the clock read `now`.
    pub fn sweep_at(&self, now: Instant) -> Vec<Eviction> {
        let mut evicted = Vec::new();

        for session in self.broker.snapshot() {
            let Some(reason) = self.decide(&session, now) else {
                continue;
            };
            // A concurrent close already won; nothing left to do.
            if self.broker.close(session.id()).is_ok() {
                info!(session_id = %session.id(), reason = %reason, "Evicted PTY session");
                evicted.push(Eviction {
                    session_id: session.id().to_string(),
                    reason,
                });
            }
        }

        debug!(
            evicted = evicted.len(),
            remaining = self.broker.len(),
            "Reaper sweep complete"
        );
        evicted
    }

    /// Start the periodic task. Dropping the handle does not stop it; call
    /// [`ReaperHandle::shutdown`].
    pub fn spawn(self) -> ReaperHandle {
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let period = self.interval;
        let task = tokio::spawn(self.background_loop(shutdown_rx));
        info!("Session reaper started with interval: {} seconds", period.as_secs());
        ReaperHandle {
            shutdown_tx: Some(shutdown_tx),
            task,
        }
    }

    async fn background_loop(self, mut shutdown_rx: oneshot::Receiver<()>) {
        let mut ticker = interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.sweep();
                }
                _ = &mut shutdown_rx => {
                    info!("Session reaper shutting down");
                    break;
                }
            }
        }
    }
}

pub struct ReaperHandle {
    shutdown_tx: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl ReaperHandle {
    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        let _ = self.task.await;
    }
}
