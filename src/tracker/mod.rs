//! Ownership of the single in-progress session.

use std::{
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use chrono::Utc;
use log::{info, warn};

use crate::{
    clock::Clock,
    error::{EngineError, EngineResult},
    models::{parse_label, parse_tag_list, push_unique, Session},
    settings::Config,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionLimits {
    pub max_activity_length: usize,
    pub max_tag_length: usize,
    pub max_tags: usize,
}

impl From<&Config> for SessionLimits {
    fn from(config: &Config) -> Self {
        Self {
            max_activity_length: config.max_activity_length,
            max_tag_length: config.max_tag_length,
            max_tags: config.max_tags,
        }
    }
}

#[derive(Default)]
struct TrackerState {
    current: Option<Session>,
    /// A stopped session whose save has not been confirmed yet.
    saving: Option<Session>,
    /// Set once the long-session notice fired for `current`.
    long_session_notified: bool,
}

pub struct SessionTracker {
    state: Mutex<TrackerState>,
    limits: SessionLimits,
    clock: Arc<dyn Clock>,
}

impl SessionTracker {
    pub fn new(limits: SessionLimits, clock: Arc<dyn Clock>) -> Self {
        Self {
            state: Mutex::new(TrackerState::default()),
            limits,
            clock,
        }
    }

    /// Parses `label` (plus any extra comma/space separated `tags`) and starts tracking.
    pub fn start(&self, label: &str, tags: &str) -> EngineResult<Session> {
        if label.trim().is_empty() {
            return Err(EngineError::validation("activity name cannot be empty"));
        }

        let mut parsed = parse_label(label);
        for tag in parse_tag_list(tags) {
            push_unique(&mut parsed.tags, &tag);
        }

        if parsed.activity.is_empty() {
            return Err(EngineError::validation("activity cannot be empty"));
        }
        if parsed.activity.chars().count() > self.limits.max_activity_length {
            return Err(EngineError::validation(format!(
                "activity name too long (max {} characters)",
                self.limits.max_activity_length
            )));
        }
        if let Some(tag) = parsed
            .tags
            .iter()
            .find(|tag| tag.chars().count() > self.limits.max_tag_length)
        {
            return Err(EngineError::validation(format!(
                "tag '{tag}' too long (max {} characters)",
                self.limits.max_tag_length
            )));
        }
        if parsed.tags.len() > self.limits.max_tags {
            return Err(EngineError::validation(format!(
                "too many tags (max {} allowed)",
                self.limits.max_tags
            )));
        }

        let mut state = self.lock();
        if state.current.is_some() {
            return Err(EngineError::validation("a session is already being tracked"));
        }
        if state.saving.is_some() {
            return Err(EngineError::validation("the previous session is still being saved"));
        }

        let session = Session::new(parsed, self.clock.now().with_timezone(&Utc));
        session.validate().map_err(EngineError::Validation)?;

        info!(
            "Tracking '{}' (category: {:?}, tags: {:?})",
            session.activity, session.category, session.tags
        );
        state.current = Some(session.clone());
        state.long_session_notified = false;
        Ok(session)
    }

    /// Finalizes the current session. On failure the session stays in progress.
    /// On success it is held as pending until [`confirm_stop`](Self::confirm_stop)
    /// or [`restore`](Self::restore), and no new session can start meanwhile.
    pub fn stop(&self) -> EngineResult<Session> {
        let mut state = self.lock();
        let Some(current) = state.current.as_ref() else {
            return Err(EngineError::NotTracking);
        };

        let stopped_at = self.clock.now().with_timezone(&Utc);
        let elapsed = (stopped_at - current.started_at)
            .to_std()
            .map_err(|_| EngineError::validation("end time cannot be before start time"))?;

        let mut session = current.clone();
        session.stopped_at = Some(stopped_at);
        session.duration = elapsed;
        session.validate().map_err(EngineError::Validation)?;

        state.current = None;
        state.saving = Some(session.clone());
        info!(
            "Stopped '{}' after {}",
            session.activity,
            session.formatted_duration()
        );
        Ok(session)
    }

    /// Drops the pending session once it has been saved.
    pub fn confirm_stop(&self) {
        self.lock().saving = None;
    }

    /// Puts the pending session back in progress after its save failed. The
    /// long-session flag keeps whatever the stopped session had.
    pub fn restore(&self) -> EngineResult<Session> {
        let mut state = self.lock();
        let Some(mut session) = state.saving.take() else {
            return Err(EngineError::NotTracking);
        };
        session.stopped_at = None;
        session.duration = Duration::ZERO;
        warn!("Restoring '{}' to in-progress", session.activity);
        state.current = Some(session.clone());
        Ok(session)
    }

    pub fn is_tracking(&self) -> bool {
        self.lock().current.is_some()
    }

    pub fn current(&self) -> Option<Session> {
        self.lock().current.clone()
    }

    /// Elapsed time of the current session; zero when idle.
    pub fn elapsed(&self) -> Duration {
        let state = self.lock();
        self.elapsed_locked(&state)
    }

    /// Returns the elapsed time exactly once per session, the first time it
    /// reaches `threshold`.
    pub fn check_long_session(&self, threshold: Duration) -> Option<Duration> {
        let mut state = self.lock();
        if state.current.is_none() || state.long_session_notified {
            return None;
        }
        let elapsed = self.elapsed_locked(&state);
        if elapsed >= threshold {
            state.long_session_notified = true;
            Some(elapsed)
        } else {
            None
        }
    }

    fn elapsed_locked(&self, state: &TrackerState) -> Duration {
        state
            .current
            .as_ref()
            .and_then(|session| {
                (self.clock.now().with_timezone(&Utc) - session.started_at)
                    .to_std()
                    .ok()
            })
            .unwrap_or(Duration::ZERO)
    }

    fn lock(&self) -> MutexGuard<'_, TrackerState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}
