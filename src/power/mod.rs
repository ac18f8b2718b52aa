//! Wake-from-sleep requests, one per alarm id.

mod command;
mod strategy;

pub use command::{CommandOutput, CommandRunner, CommandSpec, SystemCommandRunner};
pub use strategy::{
    platform_strategies, AtJob, Pmset, RtcWake, ScheduledTask, WakeArtifact, WakeStrategy,
};

#[cfg(test)]
pub(crate) use command::FakeRunner;

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use chrono::{DateTime, Local};
use log::{debug, info, warn};
use tokio::{
    sync::{
        mpsc::{self, UnboundedReceiver, UnboundedSender},
        Mutex,
    },
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;

use crate::{
    clock::Clock,
    error::{EngineError, EngineResult},
};

type ArmedArtifact = (Arc<dyn WakeStrategy>, WakeArtifact);

struct WakeEntry {
    at: DateTime<Local>,
    artifact: Option<ArmedArtifact>,
    timer: JoinHandle<()>,
    generation: u64,
}

type WakeEntries = Arc<Mutex<HashMap<String, WakeEntry>>>;

/// Keeps at most one live wake request per alarm id. Each request is an
/// in-process timer plus whatever the first working OS strategy armed.
pub struct WakeScheduler {
    strategies: Vec<Arc<dyn WakeStrategy>>,
    entries: WakeEntries,
    clock: Arc<dyn Clock>,
    generation: AtomicU64,
}

impl WakeScheduler {
    pub fn new(strategies: Vec<Arc<dyn WakeStrategy>>, clock: Arc<dyn Clock>) -> Self {
        Self {
            strategies,
            entries: Arc::new(Mutex::new(HashMap::new())),
            clock,
            generation: AtomicU64::new(0),
        }
    }

    /// Arms a wake request for `id`, replacing any previous one. Fails only
    /// when `at` is not in the future; exhausting every strategy is logged
    /// and still counts as success.
    pub async fn schedule_wakeup(&self, id: &str, at: DateTime<Local>) -> EngineResult<()> {
        let now = self.clock.now();
        if at <= now {
            return Err(EngineError::PastTime { at });
        }

        let mut entries = self.entries.lock().await;
        if let Some(previous) = entries.remove(id) {
            debug!("Superseding wake request for {} at {}", id, previous.at);
            release(id, previous).await;
        }

        let artifact = self.arm_first(id, at).await;
        let generation = self.generation.fetch_add(1, Ordering::Relaxed);
        let delay = (at - now).to_std().unwrap_or_default();
        let timer = tokio::spawn(expire_after(
            self.entries.clone(),
            id.to_string(),
            generation,
            delay,
        ));

        entries.insert(
            id.to_string(),
            WakeEntry {
                at,
                artifact,
                timer,
                generation,
            },
        );
        Ok(())
    }

    /// Disarms the request for `id`. Unknown ids are ignored.
    pub async fn cancel_wakeup(&self, id: &str) {
        let removed = self.entries.lock().await.remove(id);
        if let Some(entry) = removed {
            release(id, entry).await;
            info!("Cancelled wake request for {}", id);
        }
    }

    /// Disarms every request.
    pub async fn cleanup(&self) {
        let mut entries = self.entries.lock().await;
        let drained: Vec<(String, WakeEntry)> = entries.drain().collect();
        for (id, entry) in drained {
            release(&id, entry).await;
        }
        info!("Wake scheduler cleaned up");
    }

    pub async fn active_wakeups(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.entries.lock().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub async fn wake_time(&self, id: &str) -> Option<DateTime<Local>> {
        self.entries.lock().await.get(id).map(|entry| entry.at)
    }

    async fn arm_first(&self, id: &str, at: DateTime<Local>) -> Option<ArmedArtifact> {
        for strategy in &self.strategies {
            match strategy.arm(id, at).await {
                Ok(artifact) => {
                    info!(
                        "Wake for {} armed at {} via {} ({})",
                        id,
                        at,
                        strategy.name(),
                        artifact.handle
                    );
                    return Some((strategy.clone(), artifact));
                }
                Err(err) => {
                    warn!("Wake strategy {} failed for {}: {:#}", strategy.name(), id, err);
                }
            }
        }
        warn!(
            "No wake mechanism available for {}; the alarm only fires while the machine is awake",
            id
        );
        None
    }
}

async fn release(id: &str, entry: WakeEntry) {
    entry.timer.abort();
    if let Some((strategy, artifact)) = entry.artifact {
        if let Err(err) = strategy.disarm(&artifact).await {
            warn!("Failed to disarm {} wake for {}: {:#}", strategy.name(), id, err);
        }
    }
}

/// Drops the entry once its instant passes, unless it was superseded in the
/// meantime, and lets its strategy clean up after the fired artifact.
async fn expire_after(
    entries: WakeEntries,
    id: String,
    generation: u64,
    delay: std::time::Duration,
) {
    tokio::time::sleep(delay).await;

    let mut entries = entries.lock().await;
    if entries.get(&id).map(|entry| entry.generation) != Some(generation) {
        return;
    }
    let Some(entry) = entries.remove(&id) else {
        return;
    };
    drop(entries);

    debug!("Wake time reached for {}", id);
    if let Some((strategy, artifact)) = entry.artifact {
        if let Err(err) = strategy.expire(&artifact).await {
            warn!("Failed to remove expired {} wake for {}: {:#}", strategy.name(), id, err);
        }
    }
}

/// A request for the wake worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WakeOp {
    Arm { alarm_id: String, at: DateTime<Local> },
    Disarm { alarm_id: String },
}

/// Ordered, non-blocking handle for arming and disarming wake requests.
/// Operations are applied one at a time by [`run_wake_worker`].
#[derive(Clone)]
pub struct WakeQueue {
    tx: UnboundedSender<WakeOp>,
}

impl WakeQueue {
    pub fn channel() -> (Self, UnboundedReceiver<WakeOp>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn arm(&self, alarm_id: &str, at: DateTime<Local>) {
        self.send(WakeOp::Arm {
            alarm_id: alarm_id.to_string(),
            at,
        });
    }

    pub fn disarm(&self, alarm_id: &str) {
        self.send(WakeOp::Disarm {
            alarm_id: alarm_id.to_string(),
        });
    }

    fn send(&self, op: WakeOp) {
        if let Err(err) = self.tx.send(op) {
            debug!("Wake worker is gone, dropping {:?}", err.0);
        }
    }
}

/// Applies queued wake operations until the queue closes or `cancel` fires.
pub async fn run_wake_worker(
    mut rx: UnboundedReceiver<WakeOp>,
    scheduler: Arc<WakeScheduler>,
    cancel: CancellationToken,
) {
    loop {
        let op = tokio::select! {
            _ = cancel.cancelled() => break,
            op = rx.recv() => match op {
                Some(op) => op,
                None => break,
            },
        };

        match op {
            WakeOp::Arm { alarm_id, at } => {
                if let Err(err) = scheduler.schedule_wakeup(&alarm_id, at).await {
                    warn!("Could not arm wake for {}: {}", alarm_id, err);
                }
            }
            WakeOp::Disarm { alarm_id } => scheduler.cancel_wakeup(&alarm_id).await,
        }
    }
    debug!("Wake worker stopped");
}
