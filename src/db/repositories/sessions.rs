use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Row};

use crate::{
    db::{
        helpers::{format_datetime, parse_datetime, parse_tags, to_i64, to_u64},
        Database,
    },
    models::Session,
    store::SessionStore,
};

fn row_to_session(row: &Row) -> Result<Session> {
    let start_time: String = row.get("start_time")?;
    let end_time: String = row.get("end_time")?;
    let duration_ms: i64 = row.get("duration_ms")?;
    let tags: String = row.get("tags")?;

    Ok(Session {
        id: Some(row.get("id")?),
        started_at: parse_datetime(&start_time, "start_time")?,
        stopped_at: Some(parse_datetime(&end_time, "end_time")?),
        duration: Duration::from_millis(to_u64(duration_ms, "duration_ms")?),
        activity: row.get("activity")?,
        category: row.get("category")?,
        tags: parse_tags(&tags)?,
    })
}

impl Database {
    pub async fn insert_session(&self, session: &Session) -> Result<i64> {
        let record = session.clone();
        let stopped_at = record
            .stopped_at
            .context("cannot store a session that is still running")?;
        self.execute(move |conn| {
            conn.execute(
                "INSERT INTO sessions (start_time, end_time, duration_ms, activity, category, tags)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    format_datetime(record.started_at),
                    format_datetime(stopped_at),
                    to_i64(record.duration.as_millis() as u64)?,
                    record.activity,
                    record.category,
                    serde_json::to_string(&record.tags)?,
                ],
            )
            .with_context(|| "failed to insert session")?;
            Ok(conn.last_insert_rowid())
        })
        .await
    }

    pub async fn list_sessions_between(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Session>> {
        let start = format_datetime(start);
        let end = format_datetime(end);
        self.execute(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, start_time, end_time, duration_ms, activity, category, tags
                 FROM sessions
                 WHERE start_time >= ?1 AND start_time < ?2
                 ORDER BY start_time ASC",
            )?;

            let mut rows = stmt.query(params![start, end])?;
            let mut sessions = Vec::new();
            while let Some(row) = rows.next()? {
                sessions.push(row_to_session(row)?);
            }

            Ok(sessions)
        })
        .await
    }
}

#[async_trait]
impl SessionStore for Database {
    async fn save_session(&self, session: &Session) -> Result<i64> {
        self.insert_session(session).await
    }

    async fn load_sessions_between(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Session>> {
        self.list_sessions_between(start, end).await
    }
}
