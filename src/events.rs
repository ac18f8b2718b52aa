//! Events broadcast to whatever presentation layer is attached.

use chrono::NaiveDate;
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum EngineEvent {
    #[serde(rename_all = "camelCase")]
    TrackingStarted { activity: String },
    #[serde(rename_all = "camelCase")]
    TrackingStopped { activity: String, duration_ms: u64 },
    #[serde(rename_all = "camelCase")]
    ElapsedTick { elapsed_ms: u64 },
    #[serde(rename_all = "camelCase")]
    LongSession { elapsed_ms: u64 },
    #[serde(rename_all = "camelCase")]
    DayChanged { date: NaiveDate, session_count: usize },
    #[serde(rename_all = "camelCase")]
    AlarmTriggered { alarm_id: String, name: String },
    CountdownFinished,
}
