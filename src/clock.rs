use chrono::{DateTime, Local, NaiveDate, NaiveTime, TimeZone};

/// Source of wall-clock time for everything that compares against the
/// time of day (alarm matching, wake instants, session stamps).
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Local>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Local> {
        Local::now()
    }
}

/// Resolves a local date and time, skipping forward past a DST gap.
pub fn local_at(date: NaiveDate, time: NaiveTime) -> Option<DateTime<Local>> {
    Local.from_local_datetime(&date.and_time(time)).earliest()
}

pub fn local_midnight(date: NaiveDate) -> Option<DateTime<Local>> {
    local_at(date, NaiveTime::MIN)
}

#[cfg(test)]
pub(crate) use manual::ManualClock;
