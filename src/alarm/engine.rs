use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Local};
use log::{info, warn};
use uuid::Uuid;

use crate::{
    clock::Clock,
    error::{EngineError, EngineResult},
    power::WakeQueue,
};

use super::{Alarm, NewAlarm, WeekdaySet};

/// An alarm that fired on this tick, captured after its state was updated.
#[derive(Debug, Clone)]
pub struct AlarmTrigger {
    pub alarm: Alarm,
    pub occurrence: DateTime<Local>,
}

/// Owns the alarm collection. Every enable/disable transition is mirrored to
/// the wake queue while the collection lock is held, so wake requests are
/// applied in the same order as the state changes that caused them.
pub struct AlarmEngine {
    alarms: Mutex<Vec<Alarm>>,
    wake: WakeQueue,
    clock: Arc<dyn Clock>,
}

impl AlarmEngine {
    pub fn new(wake: WakeQueue, clock: Arc<dyn Clock>) -> Self {
        Self {
            alarms: Mutex::new(Vec::new()),
            wake,
            clock,
        }
    }

    pub fn add(&self, new_alarm: NewAlarm) -> EngineResult<Alarm> {
        let mut alarms = self.lock();
        let id = match new_alarm.id {
            Some(id) if id.trim().is_empty() => {
                return Err(EngineError::validation("alarm id cannot be empty"))
            }
            Some(id) => id,
            None => format!("alarm_{}", Uuid::new_v4().simple()),
        };
        if alarms.iter().any(|alarm| alarm.id == id) {
            return Err(EngineError::validation(format!("alarm '{id}' already exists")));
        }

        let name = new_alarm.name.trim();
        let alarm = Alarm {
            id,
            name: if name.is_empty() { "Alarm".into() } else { name.into() },
            time: new_alarm.time,
            enabled: new_alarm.enabled,
            recurring: new_alarm.recurring,
            days: new_alarm.days,
            last_triggered: None,
            sound: new_alarm.sound.filter(|sound| !sound.is_empty()),
        };

        info!("Added alarm {} '{}' at {}", alarm.id, alarm.name, alarm.time);
        if alarm.enabled {
            self.arm(&alarm);
        }
        alarms.push(alarm.clone());
        Ok(alarm)
    }

    pub fn set_enabled(&self, id: &str, enabled: bool) -> EngineResult<Alarm> {
        let mut alarms = self.lock();
        let alarm = find_mut(&mut alarms, id)?;
        alarm.enabled = enabled;
        if enabled {
            self.arm(alarm);
        } else {
            self.wake.disarm(&alarm.id);
        }
        Ok(alarm.clone())
    }

    pub fn set_recurring(&self, id: &str, recurring: bool, days: WeekdaySet) -> EngineResult<Alarm> {
        let mut alarms = self.lock();
        let alarm = find_mut(&mut alarms, id)?;
        alarm.recurring = recurring;
        alarm.days = days;
        if alarm.enabled {
            self.arm(alarm);
        }
        Ok(alarm.clone())
    }

    pub fn delete(&self, id: &str) -> EngineResult<Alarm> {
        let mut alarms = self.lock();
        let index = alarms
            .iter()
            .position(|alarm| alarm.id == id)
            .ok_or_else(|| EngineError::not_found("alarm", id))?;
        let removed = alarms.remove(index);
        self.wake.disarm(&removed.id);
        info!("Deleted alarm {}", removed.id);
        Ok(removed)
    }

    pub fn get(&self, id: &str) -> Option<Alarm> {
        self.lock().iter().find(|alarm| alarm.id == id).cloned()
    }

    pub fn list(&self) -> Vec<Alarm> {
        self.lock().clone()
    }

    pub fn active_count(&self) -> usize {
        self.lock().iter().filter(|alarm| alarm.enabled).count()
    }

    /// Marks every alarm due within `(window_start, now]` as triggered and
    /// returns them. Recurring alarms get their next wake request armed and
    /// one-shots are disarmed; other side effects are left to the caller.
    pub fn check_due(&self, window_start: DateTime<Local>, now: DateTime<Local>) -> Vec<AlarmTrigger> {
        let mut alarms = self.lock();
        let mut triggers = Vec::new();

        for alarm in alarms.iter_mut().filter(|alarm| alarm.enabled) {
            let Some(occurrence) = alarm.due_occurrence(window_start, now) else {
                continue;
            };
            if !alarm.should_trigger(occurrence, now) {
                continue;
            }

            alarm.mark_triggered(now);
            info!("Alarm {} '{}' triggered for {}", alarm.id, alarm.name, occurrence);
            if alarm.enabled {
                self.arm(alarm);
            } else {
                self.wake.disarm(&alarm.id);
            }
            triggers.push(AlarmTrigger {
                alarm: alarm.clone(),
                occurrence,
            });
        }

        triggers
    }

    fn arm(&self, alarm: &Alarm) {
        match alarm.next_occurrence(self.clock.now()) {
            Some(at) => self.wake.arm(&alarm.id, at),
            None => {
                warn!(
                    "Alarm {} has no upcoming occurrence; no wake request armed",
                    alarm.id
                );
                self.wake.disarm(&alarm.id);
            }
        }
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Alarm>> {
        match self.alarms.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

fn find_mut<'a>(alarms: &'a mut [Alarm], id: &str) -> EngineResult<&'a mut Alarm> {
    alarms
        .iter_mut()
        .find(|alarm| alarm.id == id)
        .ok_or_else(|| EngineError::not_found("alarm", id))
}
