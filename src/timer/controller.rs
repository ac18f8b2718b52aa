use std::{
    sync::{Arc, Mutex as StdMutex, MutexGuard},
    time::Duration,
};

use log::{debug, info};
use serde::Serialize;
use tokio::{
    sync::{broadcast, Mutex},
    task::JoinHandle,
    time::{self, Instant, MissedTickBehavior},
};

use crate::{
    error::{EngineError, EngineResult},
    events::EngineEvent,
    notify::{Notifier, TIMER_TITLE},
};

use super::{Lap, TimerState, TimerStatus, TimerMode};

const COUNTDOWN_TICK: Duration = Duration::from_millis(100);

#[derive(Debug, Serialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct TimerSnapshot {
    pub state: TimerState,
    pub remaining_ms: u64,
}

impl TimerSnapshot {
    fn of(state: &mut TimerState) -> Self {
        state.sync_active_from_anchor();
        Self {
            remaining_ms: state.remaining_ms(),
            state: state.clone(),
        }
    }
}

/// Start/stop stopwatch with lap capture. Needs no background task.
pub struct StopwatchController {
    state: StdMutex<TimerState>,
}

impl Default for StopwatchController {
    fn default() -> Self {
        Self {
            state: StdMutex::new(TimerState::new(TimerMode::Stopwatch)),
        }
    }
}

impl StopwatchController {
    /// Starts from zero, or continues after a stop. No-op while running.
    pub fn start(&self) -> TimerSnapshot {
        let mut state = self.lock();
        match state.status {
            TimerStatus::Idle => state.begin(0, Instant::now()),
            TimerStatus::Stopped => state.resume(Instant::now()),
            TimerStatus::Running => {}
        }
        TimerSnapshot::of(&mut state)
    }

    pub fn stop(&self) -> TimerSnapshot {
        let mut state = self.lock();
        if state.status == TimerStatus::Running {
            state.stop();
        }
        TimerSnapshot::of(&mut state)
    }

    pub fn reset(&self) -> TimerSnapshot {
        let mut state = self.lock();
        state.reset();
        TimerSnapshot::of(&mut state)
    }

    pub fn capture_lap(&self) -> Option<Lap> {
        self.lock().capture_lap()
    }

    pub fn snapshot(&self) -> TimerSnapshot {
        TimerSnapshot::of(&mut self.lock())
    }

    fn lock(&self) -> MutexGuard<'_, TimerState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// Countdown with a background ticker that notifies when time runs out.
#[derive(Clone)]
pub struct CountdownController {
    state: Arc<Mutex<TimerState>>,
    ticker: Arc<Mutex<Option<JoinHandle<()>>>>,
    tick_interval: Duration,
    notifier: Arc<dyn Notifier>,
    events: broadcast::Sender<EngineEvent>,
}

impl CountdownController {
    pub fn new(notifier: Arc<dyn Notifier>, events: broadcast::Sender<EngineEvent>) -> Self {
        Self {
            state: Arc::new(Mutex::new(TimerState::new(TimerMode::Countdown))),
            ticker: Arc::new(Mutex::new(None)),
            tick_interval: COUNTDOWN_TICK,
            notifier,
            events,
        }
    }

    pub async fn start(&self, duration: Duration) -> EngineResult<TimerSnapshot> {
        let target_ms = duration.as_millis() as u64;
        if target_ms == 0 {
            return Err(EngineError::validation("please set a valid countdown time"));
        }

        let snapshot = {
            let mut state = self.state.lock().await;
            if state.status == TimerStatus::Running {
                return Err(EngineError::validation("countdown already running"));
            }
            state.begin(target_ms, Instant::now());
            TimerSnapshot::of(&mut state)
        };

        self.spawn_ticker().await;
        info!("Countdown started for {:?}", duration);
        Ok(snapshot)
    }

    /// Freezes the remaining time. The next start begins a new countdown.
    pub async fn stop(&self) -> TimerSnapshot {
        self.cancel_ticker().await;
        let mut state = self.state.lock().await;
        if state.status == TimerStatus::Running {
            state.stop();
        }
        TimerSnapshot::of(&mut state)
    }

    pub async fn reset(&self) -> TimerSnapshot {
        self.cancel_ticker().await;
        let mut state = self.state.lock().await;
        state.reset();
        TimerSnapshot::of(&mut state)
    }

    pub async fn snapshot(&self) -> TimerSnapshot {
        TimerSnapshot::of(&mut *self.state.lock().await)
    }

    async fn spawn_ticker(&self) {
        let mut ticker_guard = self.ticker.lock().await;
        if let Some(handle) = ticker_guard.take() {
            handle.abort();
        }

        let state = self.state.clone();
        let notifier = self.notifier.clone();
        let events = self.events.clone();
        let tick_interval = self.tick_interval;

        let handle = tokio::spawn(async move {
            let mut interval = time::interval(tick_interval);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                interval.tick().await;

                {
                    let mut guard = state.lock().await;
                    if guard.status != TimerStatus::Running {
                        break;
                    }
                    guard.sync_active_from_anchor();
                    if guard.remaining_ms() > 0 {
                        continue;
                    }
                    guard.reset();
                }

                info!("Countdown finished");
                notifier.notify(TIMER_TITLE, "Countdown finished!");
                let _ = events.send(EngineEvent::CountdownFinished);
                break;
            }
            debug!("Countdown ticker exited");
        });

        *ticker_guard = Some(handle);
    }

    async fn cancel_ticker(&self) {
        let mut ticker_guard = self.ticker.lock().await;
        if let Some(handle) = ticker_guard.take() {
            handle.abort();
        }
    }
}
