//! Background tick loops: tracker refresh and alarm matching.

use std::{sync::Arc, time::Duration};

use chrono::{DateTime, Local, NaiveDate};
use log::{debug, error, info, warn};
use tokio::{
    task::JoinHandle,
    time::{self, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;

use crate::{
    engine::EngineCore,
    events::EngineEvent,
    models::Session,
    notify::{ALARM_TITLE, TRACKER_TITLE},
    settings::Config,
    sound::SoundPlayer,
};

/// Longest stretch, in seconds, an alarm check looks back over after a stalled tick.
pub const MAX_CATCH_UP_SECS: i64 = 5 * 60;

/// Durations and names the loops need, fixed at engine construction.
#[derive(Debug, Clone)]
pub struct Timing {
    pub tick_interval: Duration,
    pub alarm_check_interval: Duration,
    pub notification_threshold: Duration,
    pub threshold_hours: f64,
    pub alarm_sound_duration: Duration,
    pub long_session_sound: String,
    pub long_session_sound_duration: Duration,
}

impl From<&Config> for Timing {
    fn from(config: &Config) -> Self {
        Self {
            tick_interval: config.tick_interval(),
            alarm_check_interval: config.alarm_check_interval(),
            notification_threshold: config.notification_threshold(),
            threshold_hours: config.notification_threshold_hours,
            alarm_sound_duration: config.alarm_sound_duration(),
            long_session_sound: config.long_session_sound.clone(),
            long_session_sound_duration: config.long_session_sound_duration(),
        }
    }
}

/// Today's finished sessions as last loaded.
#[derive(Debug, Clone)]
pub struct DayView {
    pub date: NaiveDate,
    /// May briefly hold sessions of the following day, saved while a
    /// rollover load was in flight.
    pub sessions: Vec<Session>,
}

impl DayView {
    pub fn empty(date: NaiveDate) -> Self {
        Self {
            date,
            sessions: Vec::new(),
        }
    }

    /// Sessions that started on `date`.
    pub fn current(&self) -> impl Iterator<Item = &Session> {
        self.sessions
            .iter()
            .filter(|session| session_date(session) == self.date)
    }

    /// Adds a just-saved session unless it belongs to an earlier day.
    pub fn record(&mut self, session: Session) {
        if session_date(&session) >= self.date {
            self.sessions.push(session);
        }
    }

    /// Moves to `date` with `loaded`, keeping sessions for `date` that were
    /// recorded after the load read the store.
    fn roll_over(&mut self, date: NaiveDate, mut loaded: Vec<Session>) {
        let recorded: Vec<Session> = self
            .sessions
            .drain(..)
            .filter(|session| session_date(session) == date)
            .filter(|session| {
                !loaded
                    .iter()
                    .any(|known| known.id.is_some() && known.id == session.id)
            })
            .collect();
        loaded.extend(recorded);
        self.date = date;
        self.sessions = loaded;
    }
}

fn session_date(session: &Session) -> NaiveDate {
    session.started_at.with_timezone(&Local).date_naive()
}

/// Owns the running loops. Dropping it does not stop them; call
/// [`shutdown`](Self::shutdown).
pub struct PeriodicScheduler {
    cancel: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

impl PeriodicScheduler {
    pub(crate) fn spawn(core: Arc<EngineCore>, cancel: CancellationToken) -> Self {
        let handles = vec![
            tokio::spawn(run_tracker_loop(core.clone(), cancel.clone())),
            tokio::spawn(run_alarm_loop(core, cancel.clone())),
        ];
        Self { cancel, handles }
    }

    pub async fn shutdown(self) {
        self.cancel.cancel();
        for handle in self.handles {
            if let Err(err) = handle.await {
                error!("Tick loop ended abnormally: {err}");
            }
        }
    }
}

async fn run_tracker_loop(core: Arc<EngineCore>, cancel: CancellationToken) {
    let mut interval = time::interval(core.timing.tick_interval);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    info!("Tracker loop started ({:?} tick)", core.timing.tick_interval);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = interval.tick() => tracker_tick(&core).await,
        }
    }
    debug!("Tracker loop stopped");
}

async fn run_alarm_loop(core: Arc<EngineCore>, cancel: CancellationToken) {
    let mut interval = time::interval(core.timing.alarm_check_interval);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut last_check = core.clock.now() - chrono::Duration::seconds(1);
    info!("Alarm loop started ({:?} tick)", core.timing.alarm_check_interval);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {
                let now = core.clock.now();
                alarm_tick(&core, alarm_window_start(last_check, now), now);
                last_check = now;
            }
        }
    }
    debug!("Alarm loop stopped");
}

/// Start of the range an alarm check covers: the previous check, but never
/// more than [`MAX_CATCH_UP_SECS`] back. A clock that moved backwards restarts
/// the range just before `now`.
pub fn alarm_window_start(last_check: DateTime<Local>, now: DateTime<Local>) -> DateTime<Local> {
    if last_check >= now {
        now - chrono::Duration::seconds(1)
    } else {
        last_check.max(now - chrono::Duration::seconds(MAX_CATCH_UP_SECS))
    }
}

/// Elapsed-time refresh and day rollover. The new day's sessions are loaded
/// without holding the day-view lock, bounded by one tick.
pub(crate) async fn tracker_tick(core: &EngineCore) {
    if core.tracker.is_tracking() {
        let elapsed = core.tracker.elapsed();
        let _ = core.events.send(EngineEvent::ElapsedTick {
            elapsed_ms: elapsed.as_millis() as u64,
        });

        if let Some(elapsed) = core.tracker.check_long_session(core.timing.notification_threshold) {
            info!("Session passed {} hours", core.timing.threshold_hours);
            core.notifier.notify(
                TRACKER_TITLE,
                &format!("Session running over {} hours!", core.timing.threshold_hours),
            );
            let _ = core.events.send(EngineEvent::LongSession {
                elapsed_ms: elapsed.as_millis() as u64,
            });
            play_detached(
                core.sound.clone(),
                core.timing.long_session_sound.clone(),
                core.timing.long_session_sound_duration,
            );
        }
    }

    let today = core.clock.now().date_naive();
    if core.day.lock().await.date == today {
        return;
    }

    let loaded = time::timeout(
        core.timing.tick_interval,
        core.store.load_sessions_for_day(today),
    )
    .await;
    let sessions = match loaded {
        Ok(Ok(sessions)) => sessions,
        Ok(Err(err)) => {
            warn!("Failed to load sessions for {}: {:#}", today, err);
            Vec::new()
        }
        Err(_) => {
            warn!("Loading sessions for {} timed out", today);
            Vec::new()
        }
    };

    let mut day = core.day.lock().await;
    if day.date == today {
        return;
    }
    day.roll_over(today, sessions);
    info!("Day changed to {} ({} sessions)", today, day.sessions.len());
    let _ = core.events.send(EngineEvent::DayChanged {
        date: today,
        session_count: day.sessions.len(),
    });
}

/// Fires every alarm due in `(window_start, now]`.
pub(crate) fn alarm_tick(core: &EngineCore, window_start: DateTime<Local>, now: DateTime<Local>) {
    for trigger in core.alarms.check_due(window_start, now) {
        let alarm = trigger.alarm;
        core.notifier
            .notify(ALARM_TITLE, &format!("Alarm: {}", alarm.name));
        let _ = core.events.send(EngineEvent::AlarmTriggered {
            alarm_id: alarm.id.clone(),
            name: alarm.name.clone(),
        });

        let sound = alarm
            .sound
            .clone()
            .or_else(|| core.sound.available_sounds().into_iter().next());
        match sound {
            Some(sound) => play_detached(core.sound.clone(), sound, core.timing.alarm_sound_duration),
            None => warn!("No sound available for alarm {}", alarm.id),
        }
    }
}

/// Starts playback off the tick path; stopping a previous clip may block briefly.
fn play_detached(player: Arc<SoundPlayer>, name: String, duration: Duration) {
    tokio::task::spawn_blocking(move || {
        if let Err(err) = player.play_sound(&name, duration) {
            error!("Failed to play '{}': {}", name, err);
        }
    });
}
