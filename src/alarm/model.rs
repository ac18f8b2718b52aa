use std::{fmt, str::FromStr};

use chrono::{DateTime, Datelike, Days, Duration, Local, NaiveTime, Weekday};
use serde::{Deserialize, Serialize};

use crate::{
    clock::{local_at, local_midnight},
    error::EngineError,
};

/// Hour and minute of an alarm, always within `00:00..=23:59`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TimeOfDay {
    hour: u8,
    minute: u8,
}

impl TimeOfDay {
    pub fn new(hour: u32, minute: u32) -> Result<Self, EngineError> {
        if hour > 23 || minute > 59 {
            return Err(EngineError::validation(format!(
                "invalid time {hour:02}:{minute:02} (expected 00-23:00-59)"
            )));
        }
        Ok(Self {
            hour: hour as u8,
            minute: minute as u8,
        })
    }

    pub fn hour(&self) -> u32 {
        u32::from(self.hour)
    }

    pub fn minute(&self) -> u32 {
        u32::from(self.minute)
    }

    pub fn as_naive(&self) -> NaiveTime {
        NaiveTime::from_hms_opt(self.hour(), self.minute(), 0).unwrap_or(NaiveTime::MIN)
    }
}

impl fmt::Display for TimeOfDay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02}:{:02}", self.hour, self.minute)
    }
}

impl FromStr for TimeOfDay {
    type Err = EngineError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let invalid = || EngineError::validation(format!("invalid time '{value}' (expected HH:MM)"));
        let (hour, minute) = value.trim().split_once(':').ok_or_else(invalid)?;
        let hour = hour.parse().map_err(|_| invalid())?;
        let minute = minute.parse().map_err(|_| invalid())?;
        Self::new(hour, minute)
    }
}

impl TryFrom<String> for TimeOfDay {
    type Error = EngineError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<TimeOfDay> for String {
    fn from(value: TimeOfDay) -> Self {
        value.to_string()
    }
}

/// Weekdays a recurring alarm rings on. Serialized as a list of day names.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "Vec<Weekday>", into = "Vec<Weekday>")]
pub struct WeekdaySet(u8);

impl WeekdaySet {
    pub const EMPTY: WeekdaySet = WeekdaySet(0);
    pub const ALL: WeekdaySet = WeekdaySet(0b0111_1111);

    /// Builds a set from Sunday-first flags.
    pub fn from_flags(flags: [bool; 7]) -> Self {
        flags
            .iter()
            .enumerate()
            .filter(|(_, enabled)| **enabled)
            .fold(Self::EMPTY, |set, (index, _)| WeekdaySet(set.0 | 1 << index))
    }

    pub fn flags(&self) -> [bool; 7] {
        std::array::from_fn(|index| self.0 & (1 << index) != 0)
    }

    pub fn contains(&self, day: Weekday) -> bool {
        self.0 & Self::bit(day) != 0
    }

    pub fn with(mut self, day: Weekday) -> Self {
        self.0 |= Self::bit(day);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    fn bit(day: Weekday) -> u8 {
        1 << day.num_days_from_sunday()
    }
}

impl FromIterator<Weekday> for WeekdaySet {
    fn from_iter<I: IntoIterator<Item = Weekday>>(iter: I) -> Self {
        iter.into_iter().fold(Self::EMPTY, WeekdaySet::with)
    }
}

impl From<Vec<Weekday>> for WeekdaySet {
    fn from(days: Vec<Weekday>) -> Self {
        days.into_iter().collect()
    }
}

impl From<WeekdaySet> for Vec<Weekday> {
    fn from(set: WeekdaySet) -> Self {
        let mut day = Weekday::Sun;
        let mut days = Vec::new();
        for _ in 0..7 {
            if set.contains(day) {
                days.push(day);
            }
            day = day.succ();
        }
        days
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Alarm {
    pub id: String,
    pub name: String,
    pub time: TimeOfDay,
    pub enabled: bool,
    pub recurring: bool,
    pub days: WeekdaySet,
    pub last_triggered: Option<DateTime<Local>>,
    pub sound: Option<String>,
}

impl Alarm {
    /// Start of the occurrence whose minute overlaps `(window_start, now]`, if any.
    pub fn due_occurrence(
        &self,
        window_start: DateTime<Local>,
        now: DateTime<Local>,
    ) -> Option<DateTime<Local>> {
        let today = now.date_naive();
        let mut dates = vec![today];
        if window_start.date_naive() != today {
            dates.push(window_start.date_naive());
        }

        dates.into_iter().find_map(|date| {
            let occurrence = local_at(date, self.time.as_naive())?;
            let minute_end = occurrence + Duration::minutes(1);
            (occurrence <= now && window_start < minute_end).then_some(occurrence)
        })
    }

    /// Applies the once-per-day (recurring) and once-only (one-shot) rules.
    pub fn should_trigger(&self, occurrence: DateTime<Local>, now: DateTime<Local>) -> bool {
        if !self.enabled {
            return false;
        }

        if self.recurring {
            if !self.days.contains(occurrence.weekday()) {
                return false;
            }
            match (self.last_triggered, local_midnight(occurrence.date_naive())) {
                (None, _) => true,
                (Some(last), Some(midnight)) => last < midnight,
                (Some(_), None) => false,
            }
        } else {
            self.last_triggered
                .map_or(true, |last| now - last > Duration::hours(24))
        }
    }

    /// Records a trigger at `now`. One-shot alarms disable themselves.
    pub fn mark_triggered(&mut self, now: DateTime<Local>) {
        self.last_triggered = Some(now);
        if !self.recurring {
            self.enabled = false;
        }
    }

    /// Next instant strictly after `now` at which this alarm would ring.
    pub fn next_occurrence(&self, now: DateTime<Local>) -> Option<DateTime<Local>> {
        if self.recurring && self.days.is_empty() {
            return None;
        }
        let horizon = if self.recurring { 8 } else { 2 };
        let today = now.date_naive();

        (0..=horizon).find_map(|offset| {
            let date = today.checked_add_days(Days::new(offset))?;
            if self.recurring && !self.days.contains(date.weekday()) {
                return None;
            }
            local_at(date, self.time.as_naive()).filter(|at| *at > now)
        })
    }
}

fn default_alarm_name() -> String {
    "Alarm".into()
}

fn default_enabled() -> bool {
    true
}

/// Caller input for a new alarm; also the shape of `alarms` entries in the config file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NewAlarm {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default = "default_alarm_name")]
    pub name: String,
    pub time: TimeOfDay,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub recurring: bool,
    #[serde(default)]
    pub days: WeekdaySet,
    #[serde(default)]
    pub sound: Option<String>,
}

impl NewAlarm {
    pub fn one_shot(name: impl Into<String>, time: TimeOfDay) -> Self {
        Self {
            id: None,
            name: name.into(),
            time,
            enabled: true,
            recurring: false,
            days: WeekdaySet::EMPTY,
            sound: None,
        }
    }

    pub fn recurring(name: impl Into<String>, time: TimeOfDay, days: WeekdaySet) -> Self {
        Self {
            recurring: true,
            days,
            ..Self::one_shot(name, time)
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_sound(mut self, sound: impl Into<String>) -> Self {
        self.sound = Some(sound.into());
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(y: i32, m: u32, d: u32, h: u32, min: u32, s: u32) -> DateTime<Local> {
        Local.with_ymd_and_hms(y, m, d, h, min, s).unwrap()
    }

    fn alarm(time: &str) -> Alarm {
        Alarm {
            id: "a1".into(),
            name: "Wake".into(),
            time: time.parse().unwrap(),
            enabled: true,
            recurring: false,
            days: WeekdaySet::EMPTY,
            last_triggered: None,
            sound: None,
        }
    }

    #[test]
    fn time_of_day_bounds_and_format() {
        assert!(TimeOfDay::new(24, 0).is_err());
        assert!(TimeOfDay::new(23, 60).is_err());
        assert!("7:5".parse::<TimeOfDay>().is_ok());
        assert!("0730".parse::<TimeOfDay>().is_err());
        assert!("ab:cd".parse::<TimeOfDay>().is_err());
        assert_eq!(TimeOfDay::new(7, 5).unwrap().to_string(), "07:05");
    }

    #[test]
    fn weekday_set_round_trips_through_names() {
        let set: WeekdaySet = [Weekday::Mon, Weekday::Fri].into_iter().collect();
        let json = serde_json::to_string(&set).unwrap();
        assert_eq!(json, r#"["Mon","Fri"]"#);
        assert_eq!(serde_json::from_str::<WeekdaySet>(&json).unwrap(), set);

        let flags = set.flags();
        assert_eq!(flags, [false, true, false, false, false, true, false]);
        assert_eq!(WeekdaySet::from_flags(flags), set);
    }

    #[test]
    fn matching_window_covers_the_whole_minute() {
        let alarm = alarm("07:30");
        let before = at(2024, 1, 15, 7, 29, 59);
        assert!(alarm
            .due_occurrence(before - Duration::seconds(1), before)
            .is_none());

        for second in 0..60 {
            let now = at(2024, 1, 15, 7, 30, second);
            let due = alarm.due_occurrence(now - Duration::seconds(1), now);
            assert_eq!(due, Some(at(2024, 1, 15, 7, 30, 0)));
        }

        let later = at(2024, 1, 15, 7, 31, 2);
        assert!(alarm
            .due_occurrence(later - Duration::seconds(1), later)
            .is_none());
    }

    #[test]
    fn stalled_window_still_catches_the_minute() {
        let alarm = alarm("07:30");
        let now = at(2024, 1, 15, 7, 33, 10);
        let due = alarm.due_occurrence(at(2024, 1, 15, 7, 29, 40), now);
        assert_eq!(due, Some(at(2024, 1, 15, 7, 30, 0)));
    }

    #[test]
    fn window_across_midnight_uses_previous_date() {
        let alarm = alarm("23:59");
        let now = at(2024, 1, 16, 0, 1, 0);
        let due = alarm.due_occurrence(at(2024, 1, 15, 23, 58, 30), now);
        assert_eq!(due, Some(at(2024, 1, 15, 23, 59, 0)));
    }

    #[test]
    fn recurring_rules_check_weekday_and_midnight() {
        let mut alarm = alarm("07:30");
        alarm.recurring = true;
        alarm.days = WeekdaySet::EMPTY.with(Weekday::Mon);

        // 2024-01-15 is a Monday.
        let monday = at(2024, 1, 15, 7, 30, 0);
        assert!(alarm.should_trigger(monday, monday));

        alarm.mark_triggered(monday);
        assert!(alarm.enabled);
        assert!(!alarm.should_trigger(monday, monday + Duration::seconds(30)));

        let tuesday = at(2024, 1, 16, 7, 30, 0);
        assert!(!alarm.should_trigger(tuesday, tuesday));

        let next_monday = at(2024, 1, 22, 7, 30, 0);
        assert!(alarm.should_trigger(next_monday, next_monday));
    }

    #[test]
    fn one_shot_disables_after_trigger() {
        let mut alarm = alarm("07:30");
        let now = at(2024, 1, 15, 7, 30, 0);
        assert!(alarm.should_trigger(now, now));

        alarm.mark_triggered(now);
        assert!(!alarm.enabled);
        assert!(!alarm.should_trigger(now, now));

        alarm.enabled = true;
        assert!(!alarm.should_trigger(now, now + Duration::seconds(5)));
        let tomorrow = at(2024, 1, 16, 7, 30, 1);
        assert!(alarm.should_trigger(at(2024, 1, 16, 7, 30, 0), tomorrow));
    }

    #[test]
    fn next_occurrence_rolls_to_tomorrow_once_passed() {
        let alarm = alarm("07:30");
        assert_eq!(
            alarm.next_occurrence(at(2024, 1, 15, 6, 0, 0)),
            Some(at(2024, 1, 15, 7, 30, 0))
        );
        assert_eq!(
            alarm.next_occurrence(at(2024, 1, 15, 7, 30, 0)),
            Some(at(2024, 1, 16, 7, 30, 0))
        );
    }

    #[test]
    fn next_occurrence_of_recurring_skips_disabled_days() {
        let mut alarm = alarm("07:30");
        alarm.recurring = true;
        alarm.days = WeekdaySet::EMPTY.with(Weekday::Mon);
        assert_eq!(
            alarm.next_occurrence(at(2024, 1, 15, 8, 0, 0)),
            Some(at(2024, 1, 22, 7, 30, 0))
        );

        alarm.days = WeekdaySet::EMPTY;
        assert_eq!(alarm.next_occurrence(at(2024, 1, 15, 8, 0, 0)), None);
    }

    #[test]
    fn new_alarm_defaults_from_config_json() {
        let parsed: NewAlarm = serde_json::from_str(
            r#"{ "time": "06:45", "recurring": true, "days": ["Mon", "Wed"], "sound": "Bell" }"#,
        )
        .unwrap();
        assert_eq!(parsed.name, "Alarm");
        assert!(parsed.enabled);
        assert!(parsed.days.contains(Weekday::Wed));
        assert!(serde_json::from_str::<NewAlarm>(r#"{ "time": "25:00" }"#).is_err());
    }
}
