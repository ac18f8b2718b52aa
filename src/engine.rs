//! The engine context: one value that owns every component and the
//! background loops driving them.

use std::{
    path::Path,
    sync::{Arc, Mutex as StdMutex},
    time::Duration,
};

use anyhow::anyhow;
use chrono::NaiveDate;
use log::{error, info, warn};
use tokio::{
    sync::{broadcast, mpsc::UnboundedReceiver, Mutex},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;

use crate::{
    alarm::{Alarm, AlarmEngine, NewAlarm, WeekdaySet},
    clock::Clock,
    error::{EngineError, EngineResult},
    events::EngineEvent,
    models::Session,
    notify::Notifier,
    power::{run_wake_worker, WakeOp, WakeQueue, WakeScheduler, WakeStrategy},
    scheduler::{DayView, PeriodicScheduler, Timing},
    settings::Config,
    sound::{AudioOutput, SoundPlayer},
    store::SessionStore,
    timer::{CountdownController, StopwatchController},
    tracker::{SessionLimits, SessionTracker},
};

const EVENT_CAPACITY: usize = 64;

/// Collaborators the engine is built from.
pub struct EngineDeps {
    pub config: Config,
    pub clock: Arc<dyn Clock>,
    pub notifier: Arc<dyn Notifier>,
    pub store: Arc<dyn SessionStore>,
    pub audio: Arc<dyn AudioOutput>,
    pub wake_strategies: Vec<Arc<dyn WakeStrategy>>,
}

/// State shared with the tick loops.
pub(crate) struct EngineCore {
    pub(crate) timing: Timing,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) notifier: Arc<dyn Notifier>,
    pub(crate) store: Arc<dyn SessionStore>,
    pub(crate) tracker: SessionTracker,
    pub(crate) alarms: AlarmEngine,
    pub(crate) sound: Arc<SoundPlayer>,
    pub(crate) day: Mutex<DayView>,
    pub(crate) events: broadcast::Sender<EngineEvent>,
}

#[derive(Default)]
struct Background {
    scheduler: Option<PeriodicScheduler>,
    wake_worker: Option<JoinHandle<()>>,
}

pub struct Engine {
    core: Arc<EngineCore>,
    wake: Arc<WakeScheduler>,
    wake_rx: StdMutex<Option<UnboundedReceiver<WakeOp>>>,
    stopwatch: StopwatchController,
    countdown: CountdownController,
    cancel: CancellationToken,
    background: Mutex<Background>,
}

impl Engine {
    pub fn new(deps: EngineDeps) -> Self {
        let EngineDeps {
            config,
            clock,
            notifier,
            store,
            audio,
            wake_strategies,
        } = deps;

        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (wake_queue, wake_rx) = WakeQueue::channel();
        let today = clock.now().date_naive();

        let core = Arc::new(EngineCore {
            timing: Timing::from(&config),
            tracker: SessionTracker::new(SessionLimits::from(&config), clock.clone()),
            alarms: AlarmEngine::new(wake_queue, clock.clone()),
            sound: Arc::new(SoundPlayer::new(audio)),
            day: Mutex::new(DayView::empty(today)),
            events: events.clone(),
            clock: clock.clone(),
            notifier: notifier.clone(),
            store,
        });

        Self {
            core,
            wake: Arc::new(WakeScheduler::new(wake_strategies, clock)),
            wake_rx: StdMutex::new(Some(wake_rx)),
            stopwatch: StopwatchController::default(),
            countdown: CountdownController::new(notifier, events),
            cancel: CancellationToken::new(),
            background: Mutex::new(Background::default()),
        }
    }

    /// Loads today's sessions and starts the wake worker and tick loops.
    pub async fn start(&self) -> EngineResult<()> {
        let wake_rx = match self.wake_rx.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        }
        .ok_or_else(|| EngineError::validation("engine already started"))?;

        self.reload_today().await;

        let mut background = self.background.lock().await;
        background.wake_worker = Some(tokio::spawn(run_wake_worker(
            wake_rx,
            self.wake.clone(),
            self.cancel.child_token(),
        )));
        background.scheduler = Some(PeriodicScheduler::spawn(
            self.core.clone(),
            self.cancel.child_token(),
        ));
        info!("Engine started");
        Ok(())
    }

    /// Stops the loops and playback and disarms every wake request.
    pub async fn shutdown(&self) {
        self.cancel.cancel();

        let mut background = self.background.lock().await;
        if let Some(scheduler) = background.scheduler.take() {
            scheduler.shutdown().await;
        }
        if let Some(worker) = background.wake_worker.take() {
            if let Err(err) = worker.await {
                error!("Wake worker ended abnormally: {err}");
            }
        }
        drop(background);

        self.countdown.reset().await;
        self.stop_sound().await;
        self.wake.cleanup().await;
        info!("Engine shut down");
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.core.events.subscribe()
    }

    pub fn start_tracking(&self, label: &str, tags: &str) -> EngineResult<Session> {
        let session = self.core.tracker.start(label, tags)?;
        let _ = self.core.events.send(EngineEvent::TrackingStarted {
            activity: session.activity.clone(),
        });
        Ok(session)
    }

    /// Stops and saves the current session. If the save fails the session
    /// keeps running so nothing is lost. No new session can start until the
    /// save has settled.
    pub async fn stop_tracking(&self) -> EngineResult<Session> {
        let mut session = self.core.tracker.stop()?;

        match self.core.store.save_session(&session).await {
            Ok(id) => {
                self.core.tracker.confirm_stop();
                session.id = Some(id);
            }
            Err(err) => {
                error!("Failed to save session '{}': {:#}", session.activity, err);
                if let Err(restore_err) = self.core.tracker.restore() {
                    warn!("Could not resume session after failed save: {restore_err}");
                }
                return Err(EngineError::Storage(err));
            }
        }

        self.core.day.lock().await.record(session.clone());

        let _ = self.core.events.send(EngineEvent::TrackingStopped {
            activity: session.activity.clone(),
            duration_ms: session.duration.as_millis() as u64,
        });
        Ok(session)
    }

    pub fn is_tracking(&self) -> bool {
        self.core.tracker.is_tracking()
    }

    pub fn elapsed(&self) -> Duration {
        self.core.tracker.elapsed()
    }

    pub fn current_session(&self) -> Option<Session> {
        self.core.tracker.current()
    }

    pub fn add_alarm(&self, alarm: NewAlarm) -> EngineResult<Alarm> {
        self.core.alarms.add(alarm)
    }

    pub fn set_alarm_enabled(&self, id: &str, enabled: bool) -> EngineResult<Alarm> {
        self.core.alarms.set_enabled(id, enabled)
    }

    pub fn set_alarm_recurring(
        &self,
        id: &str,
        recurring: bool,
        days: WeekdaySet,
    ) -> EngineResult<Alarm> {
        self.core.alarms.set_recurring(id, recurring, days)
    }

    pub fn delete_alarm(&self, id: &str) -> EngineResult<Alarm> {
        self.core.alarms.delete(id)
    }

    pub fn alarms(&self) -> Vec<Alarm> {
        self.core.alarms.list()
    }

    pub fn active_alarm_count(&self) -> usize {
        self.core.alarms.active_count()
    }

    pub async fn active_wakeups(&self) -> Vec<String> {
        self.wake.active_wakeups().await
    }

    pub fn load_sounds(&self, dir: &Path) -> EngineResult<usize> {
        self.core.sound.load_catalog(dir).map_err(EngineError::Playback)
    }

    pub fn available_sounds(&self) -> Vec<String> {
        self.core.sound.available_sounds()
    }

    /// Plays `name` for `duration` on the blocking pool, returning once the
    /// output device is open.
    pub async fn play_sound(&self, name: &str, duration: Duration) -> EngineResult<()> {
        let sound = self.core.sound.clone();
        let name = name.to_string();
        tokio::task::spawn_blocking(move || sound.play_sound(&name, duration))
            .await
            .map_err(|err| EngineError::Playback(anyhow!("playback task failed: {err}")))?
    }

    pub async fn stop_sound(&self) {
        let sound = self.core.sound.clone();
        if let Err(err) = tokio::task::spawn_blocking(move || sound.stop_sound()).await {
            error!("Failed to stop playback: {err}");
        }
    }

    pub fn stopwatch(&self) -> &StopwatchController {
        &self.stopwatch
    }

    pub fn countdown(&self) -> &CountdownController {
        &self.countdown
    }

    pub async fn today_sessions(&self) -> Vec<Session> {
        self.core.day.lock().await.current().cloned().collect()
    }

    /// Today's sessions with a tag containing `query`, ignoring case. An
    /// empty query matches everything.
    pub async fn filter_today_by_tag(&self, query: &str) -> Vec<Session> {
        let query = query.trim();
        let day = self.core.day.lock().await;
        day.current()
            .filter(|session| query.is_empty() || session.has_tag_matching(query))
            .cloned()
            .collect()
    }

    pub async fn sessions_for_day(&self, date: NaiveDate) -> EngineResult<Vec<Session>> {
        self.core
            .store
            .load_sessions_for_day(date)
            .await
            .map_err(EngineError::Storage)
    }

    pub async fn sessions_for_month(&self, year: i32, month: u32) -> EngineResult<Vec<Session>> {
        self.core
            .store
            .load_sessions_for_month(year, month)
            .await
            .map_err(EngineError::Storage)
    }

    async fn reload_today(&self) {
        let today = self.core.clock.now().date_naive();
        let sessions = match self.core.store.load_sessions_for_day(today).await {
            Ok(sessions) => sessions,
            Err(err) => {
                warn!("Failed to load today's sessions: {:#}", err);
                Vec::new()
            }
        };
        *self.core.day.lock().await = DayView {
            date: today,
            sessions,
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        alarm::TimeOfDay,
        clock::ManualClock,
        notify::{RecordingNotifier, ALARM_TITLE, TRACKER_TITLE},
        power::{FakeRunner, RtcWake},
        scheduler::{alarm_tick, tracker_tick},
        sound::FakeOutput,
        store::{finished_session, MemoryStore},
    };
    use chrono::{Duration as ChronoDuration, Local, TimeZone, Utc};
    use std::time::Instant;

    struct Harness {
        engine: Engine,
        clock: ManualClock,
        notifier: Arc<RecordingNotifier>,
        store: Arc<MemoryStore>,
        audio: FakeOutput,
        runner: Arc<FakeRunner>,
    }

    fn harness(clock: ManualClock) -> Harness {
        let notifier = Arc::new(RecordingNotifier::default());
        let store = Arc::new(MemoryStore::default());
        let audio = FakeOutput::new(Duration::from_millis(20));
        let runner = Arc::new(FakeRunner::default());
        let rtc: Arc<dyn WakeStrategy> = Arc::new(RtcWake::new(runner.clone()));
        let engine = Engine::new(EngineDeps {
            config: Config::default(),
            clock: Arc::new(clock.clone()),
            notifier: notifier.clone(),
            store: store.clone(),
            audio: Arc::new(audio.clone()),
            wake_strategies: vec![rtc],
        });
        Harness {
            engine,
            clock,
            notifier,
            store,
            audio,
            runner,
        }
    }

    fn count_titled(notifier: &RecordingNotifier, title: &str) -> usize {
        notifier
            .sent()
            .iter()
            .filter(|(sent_title, _)| sent_title == title)
            .count()
    }

    async fn track_for(h: &Harness, minutes: i64) {
        h.engine.start_tracking("deep work", "").unwrap();
        for _ in 0..minutes {
            h.clock.advance(ChronoDuration::minutes(1));
            tracker_tick(&h.engine.core).await;
        }
        h.engine.stop_tracking().await.unwrap();
    }

    #[tokio::test]
    async fn long_session_notifies_exactly_once_past_threshold() {
        let h = harness(ManualClock::at(2024, 1, 15, 8, 0, 0));

        track_for(&h, 119).await;
        assert_eq!(count_titled(&h.notifier, TRACKER_TITLE), 0);

        track_for(&h, 121).await;
        assert_eq!(count_titled(&h.notifier, TRACKER_TITLE), 1);
        assert_eq!(
            h.notifier.sent()[0].1,
            "Session running over 2 hours!"
        );
        assert_eq!(h.store.len(), 2);
    }

    #[tokio::test]
    async fn invalid_start_leaves_storage_untouched() {
        let h = harness(ManualClock::at(2024, 1, 15, 8, 0, 0));
        assert!(matches!(
            h.engine.start_tracking("", ""),
            Err(EngineError::Validation(_))
        ));
        assert!(matches!(
            h.engine.start_tracking("code", &"x".repeat(21)),
            Err(EngineError::Validation(_))
        ));
        assert!(matches!(
            h.engine.stop_tracking().await,
            Err(EngineError::NotTracking)
        ));
        assert_eq!(h.store.len(), 0);
    }

    #[tokio::test]
    async fn failed_save_keeps_session_running() {
        let h = harness(ManualClock::at(2024, 1, 15, 8, 0, 0));
        h.engine.start_tracking("write #draft", "").unwrap();
        h.clock.advance(ChronoDuration::minutes(25));

        h.store.fail_saves(true);
        assert!(matches!(
            h.engine.stop_tracking().await,
            Err(EngineError::Storage(_))
        ));
        assert!(h.engine.is_tracking());
        assert_eq!(h.engine.elapsed(), Duration::from_secs(25 * 60));

        h.store.fail_saves(false);
        let saved = h.engine.stop_tracking().await.unwrap();
        assert_eq!(saved.id, Some(1));
        assert_eq!(saved.duration, Duration::from_secs(25 * 60));
        assert_eq!(h.engine.today_sessions().await.len(), 1);
    }

    #[tokio::test]
    async fn start_during_a_failing_save_keeps_the_stopped_session() {
        let h = harness(ManualClock::at(2024, 1, 15, 8, 0, 0));
        h.engine.start_tracking("write", "").unwrap();
        h.clock.advance(ChronoDuration::minutes(40));
        h.store.fail_saves(true);
        let gate = h.store.hold_saves().await;

        let interleaved = async {
            while h.engine.is_tracking() {
                tokio::task::yield_now().await;
            }
            let attempt = h.engine.start_tracking("other", "");
            drop(gate);
            attempt
        };
        let (stopped, started) = tokio::join!(h.engine.stop_tracking(), interleaved);

        assert!(matches!(stopped, Err(EngineError::Storage(_))));
        assert!(matches!(started, Err(EngineError::Validation(_))));
        let current = h.engine.current_session().unwrap();
        assert_eq!(current.activity, "write");
        assert_eq!(h.engine.elapsed(), Duration::from_secs(40 * 60));
    }

    #[tokio::test]
    async fn play_sound_reports_a_missing_device() {
        let store = Arc::new(MemoryStore::default());
        let engine = Engine::new(EngineDeps {
            config: Config::default(),
            clock: Arc::new(ManualClock::at(2024, 1, 15, 8, 0, 0)),
            notifier: Arc::new(RecordingNotifier::default()),
            store,
            audio: Arc::new(FakeOutput::without_device()),
            wake_strategies: Vec::new(),
        });
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("bell.wav"), b"bell").unwrap();
        engine.load_sounds(dir.path()).unwrap();

        assert!(matches!(
            engine.play_sound("Bell", Duration::from_secs(1)).await,
            Err(EngineError::Playback(_))
        ));
        engine.stop_sound().await;
    }

    #[tokio::test]
    async fn day_rollover_reloads_sessions() {
        let h = harness(ManualClock::at(2024, 1, 15, 23, 59, 30));
        let tomorrow = Local
            .with_ymd_and_hms(2024, 1, 16, 0, 0, 10)
            .unwrap()
            .with_timezone(&Utc);
        h.store
            .insert(finished_session("early run", tomorrow, 30, &["sport"]));
        let mut events = h.engine.subscribe();

        tracker_tick(&h.engine.core).await;
        assert!(h.engine.today_sessions().await.is_empty());
        assert!(events.try_recv().is_err());

        h.clock.advance(ChronoDuration::minutes(1));
        tracker_tick(&h.engine.core).await;
        assert_eq!(
            events.try_recv().unwrap(),
            EngineEvent::DayChanged {
                date: NaiveDate::from_ymd_opt(2024, 1, 16).unwrap(),
                session_count: 1
            }
        );
        assert_eq!(h.engine.today_sessions().await[0].activity, "early run");
    }

    #[tokio::test]
    async fn tag_filter_is_case_insensitive_substring() {
        let h = harness(ManualClock::at(2024, 1, 15, 9, 0, 0));
        h.engine.start_tracking("study:math #Exam", "").unwrap();
        h.clock.advance(ChronoDuration::minutes(30));
        h.engine.stop_tracking().await.unwrap();
        h.engine.start_tracking("lunch", "").unwrap();
        h.clock.advance(ChronoDuration::minutes(30));
        h.engine.stop_tracking().await.unwrap();

        assert_eq!(h.engine.filter_today_by_tag("").await.len(), 2);
        let exams = h.engine.filter_today_by_tag("xa").await;
        assert_eq!(exams.len(), 1);
        assert_eq!(exams[0].activity, "math");
        assert!(h.engine.filter_today_by_tag("gym").await.is_empty());
    }

    #[tokio::test]
    async fn triggered_alarm_notifies_plays_and_disables() {
        let h = harness(ManualClock::at(2024, 1, 15, 7, 30, 0));
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("mixkit-bell.wav"), b"bell").unwrap();
        h.engine.load_sounds(dir.path()).unwrap();
        h.engine
            .add_alarm(
                NewAlarm::one_shot("Wake", TimeOfDay::new(7, 30).unwrap())
                    .with_id("wake")
                    .with_sound("Bell"),
            )
            .unwrap();
        let mut events = h.engine.subscribe();

        let now = h.clock.now();
        alarm_tick(&h.engine.core, now - ChronoDuration::seconds(1), now);
        alarm_tick(&h.engine.core, now, now + ChronoDuration::seconds(1));

        assert_eq!(
            h.notifier.sent(),
            vec![(ALARM_TITLE.to_string(), "Alarm: Wake".to_string())]
        );
        assert_eq!(
            events.try_recv().unwrap(),
            EngineEvent::AlarmTriggered {
                alarm_id: "wake".into(),
                name: "Wake".into()
            }
        );
        assert_eq!(h.engine.active_alarm_count(), 0);

        let give_up = Instant::now() + Duration::from_secs(5);
        while !h.audio.events().contains(&"start bell".to_string()) && Instant::now() < give_up {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(h.audio.events().contains(&"start bell".to_string()));
        h.engine.shutdown().await;
        assert!(h.audio.events().last().unwrap().starts_with("stop"));
    }

    #[tokio::test]
    async fn alarm_toggles_reach_the_wake_scheduler() {
        let h = harness(ManualClock::at(2024, 1, 15, 6, 0, 0));
        h.engine.start().await.unwrap();

        h.engine
            .add_alarm(NewAlarm::one_shot("Wake", TimeOfDay::new(7, 30).unwrap()).with_id("wake"))
            .unwrap();
        wait_for_wakeups(&h.engine, &["wake"]).await;

        h.engine.set_alarm_enabled("wake", false).unwrap();
        wait_for_wakeups(&h.engine, &[]).await;

        h.engine.set_alarm_enabled("wake", true).unwrap();
        wait_for_wakeups(&h.engine, &["wake"]).await;

        h.engine.shutdown().await;
        assert!(h.engine.active_wakeups().await.is_empty());
        let disarms = h
            .runner
            .calls()
            .iter()
            .filter(|call| call.ends_with("-m disable"))
            .count();
        assert_eq!(disarms, 2);
        assert!(matches!(
            h.engine.start().await,
            Err(EngineError::Validation(_))
        ));
    }

    async fn wait_for_wakeups(engine: &Engine, expected: &[&str]) {
        for _ in 0..200 {
            if engine.active_wakeups().await == expected {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!(
            "wake requests never became {expected:?}: {:?}",
            engine.active_wakeups().await
        );
    }
}
