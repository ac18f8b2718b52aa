use serde::{Deserialize, Serialize};
use std::cmp;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub enum TimerStatus {
    #[default]
    Idle,
    Running,
    Stopped,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum TimerMode {
    Countdown,
    Stopwatch,
}

/// One captured stopwatch reading.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Lap {
    pub total_ms: u64,
    /// Time since the previous lap; zero for the first.
    pub difference_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimerState {
    pub status: TimerStatus,
    pub mode: TimerMode,
    pub target_ms: u64,
    pub active_ms: u64,
    pub laps: Vec<Lap>,
    /// Time accumulated from earlier running windows; combines with `running_anchor`
    /// to compute the true active duration.
    #[serde(skip)]
    pub active_ms_baseline: u64,
    #[serde(skip)]
    pub running_anchor: Option<Instant>,
}

impl TimerState {
    pub fn new(mode: TimerMode) -> Self {
        Self {
            status: TimerStatus::Idle,
            mode,
            target_ms: 0,
            active_ms: 0,
            laps: Vec::new(),
            active_ms_baseline: 0,
            running_anchor: None,
        }
    }

    /// Countdown: time left (zero unless running). Stopwatch: time elapsed.
    pub fn remaining_ms(&self) -> u64 {
        match (self.status, self.mode) {
            (TimerStatus::Idle, _) => 0,
            (_, TimerMode::Countdown) => {
                let remaining = self.target_ms as i64 - self.current_active_ms() as i64;
                cmp::max(remaining, 0) as u64
            }
            (_, TimerMode::Stopwatch) => self.current_active_ms(),
        }
    }

    pub fn current_active_ms(&self) -> u64 {
        if let (TimerStatus::Running, Some(anchor)) = (self.status, self.running_anchor) {
            self.active_ms_baseline
                .saturating_add(anchor.elapsed().as_millis() as u64)
        } else {
            self.active_ms
        }
    }

    pub fn sync_active_from_anchor(&mut self) {
        if let (TimerStatus::Running, Some(anchor)) = (self.status, self.running_anchor) {
            self.active_ms = self
                .active_ms_baseline
                .saturating_add(anchor.elapsed().as_millis() as u64);
        }
    }

    /// Starts a fresh run, discarding accumulated time and laps.
    pub fn begin(&mut self, target_ms: u64, now: Instant) {
        *self = Self {
            status: TimerStatus::Running,
            target_ms,
            running_anchor: Some(now),
            ..Self::new(self.mode)
        };
    }

    /// Continues from the accumulated time.
    pub fn resume(&mut self, now: Instant) {
        self.status = TimerStatus::Running;
        self.active_ms_baseline = self.active_ms;
        self.running_anchor = Some(now);
    }

    pub fn stop(&mut self) {
        self.sync_active_from_anchor();
        self.status = TimerStatus::Stopped;
        self.running_anchor = None;
        self.active_ms_baseline = self.active_ms;
    }

    pub fn reset(&mut self) {
        *self = Self::new(self.mode);
    }

    /// Records a lap at the current reading. Returns `None` at zero.
    pub fn capture_lap(&mut self) -> Option<Lap> {
        let total_ms = self.current_active_ms();
        if total_ms == 0 {
            return None;
        }
        let difference_ms = self
            .laps
            .last()
            .map(|previous| total_ms.saturating_sub(previous.total_ms))
            .unwrap_or(0);
        let lap = Lap {
            total_ms,
            difference_ms,
        };
        self.laps.push(lap);
        Some(lap)
    }
}

/// `HH:MM:SS.mmm`
pub fn format_stopwatch(ms: u64) -> String {
    let hours = ms / 3_600_000;
    let minutes = (ms % 3_600_000) / 60_000;
    let seconds = (ms % 60_000) / 1000;
    let millis = ms % 1000;
    format!("{hours:02}:{minutes:02}:{seconds:02}.{millis:03}")
}

/// `HH:MM:SS`, rounding partial seconds up so a countdown never shows zero early.
pub fn format_countdown(ms: u64) -> String {
    let total_seconds = ms.div_ceil(1000);
    format!(
        "{:02}:{:02}:{:02}",
        total_seconds / 3600,
        (total_seconds % 3600) / 60,
        total_seconds % 60
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn formats_match_display() {
        assert_eq!(format_stopwatch(3_723_045), "01:02:03.045");
        assert_eq!(format_countdown(61_001), "00:01:02");
        assert_eq!(format_countdown(0), "00:00:00");
    }

    #[test]
    fn idle_timer_has_nothing_remaining() {
        let state = TimerState::new(TimerMode::Countdown);
        assert_eq!(state.remaining_ms(), 0);
        assert_eq!(state.status, TimerStatus::Idle);
    }
}
