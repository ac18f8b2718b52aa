//! Where finished sessions go, and how they come back for a day or month.

use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Months, NaiveDate, Utc};
use log::{info, warn};
use tokio::sync::Mutex;

use crate::{clock::local_midnight, db::Database, models::Session};

pub const DATABASE_FILE: &str = "katana.db";
pub const JSON_FILE: &str = "sessions.json";

#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Persists a finished session and returns its id.
    async fn save_session(&self, session: &Session) -> Result<i64>;

    /// Sessions started in `[start, end)`, oldest first.
    async fn load_sessions_between(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Session>>;

    /// Sessions started on the local calendar day `date`.
    async fn load_sessions_for_day(&self, date: NaiveDate) -> Result<Vec<Session>> {
        let (start, end) = day_bounds(date)?;
        self.load_sessions_between(start, end).await
    }

    /// Sessions started in the local calendar month.
    async fn load_sessions_for_month(&self, year: i32, month: u32) -> Result<Vec<Session>> {
        let (start, end) = month_bounds(year, month)?;
        self.load_sessions_between(start, end).await
    }
}

fn local_start_of(date: NaiveDate) -> Result<DateTime<Utc>> {
    local_midnight(date)
        .map(|midnight| midnight.with_timezone(&Utc))
        .ok_or_else(|| anyhow!("no local midnight on {date}"))
}

pub fn day_bounds(date: NaiveDate) -> Result<(DateTime<Utc>, DateTime<Utc>)> {
    let next = date
        .succ_opt()
        .ok_or_else(|| anyhow!("date {date} out of range"))?;
    Ok((local_start_of(date)?, local_start_of(next)?))
}

pub fn month_bounds(year: i32, month: u32) -> Result<(DateTime<Utc>, DateTime<Utc>)> {
    if !(1..=12).contains(&month) {
        bail!("invalid month {month}");
    }
    let first = NaiveDate::from_ymd_opt(year, month, 1)
        .ok_or_else(|| anyhow!("invalid year {year}"))?;
    let next = first
        .checked_add_months(Months::new(1))
        .ok_or_else(|| anyhow!("month {year}-{month} out of range"))?;
    Ok((local_start_of(first)?, local_start_of(next)?))
}

/// Opens SQLite in `data_dir`, falling back to a JSON file when the
/// database cannot be opened.
pub async fn open_store(data_dir: &Path) -> Result<Arc<dyn SessionStore>> {
    match Database::new(data_dir.join(DATABASE_FILE)) {
        Ok(db) => Ok(Arc::new(db)),
        Err(err) => {
            warn!("SQLite unavailable ({err:#}); falling back to {JSON_FILE}");
            let store = JsonFileStore::open(data_dir.join(JSON_FILE)).await?;
            Ok(Arc::new(store))
        }
    }
}

/// Keeps every session in one pretty-printed JSON array.
pub struct JsonFileStore {
    path: PathBuf,
    sessions: Mutex<Vec<Session>>,
}

impl JsonFileStore {
    pub async fn open(path: PathBuf) -> Result<Self> {
        let sessions = match tokio::fs::read_to_string(&path).await {
            Ok(raw) if raw.trim().is_empty() => Vec::new(),
            Ok(raw) => serde_json::from_str(&raw)
                .with_context(|| format!("failed to parse {}", path.display()))?,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(err) => {
                return Err(err).with_context(|| format!("failed to read {}", path.display()))
            }
        };
        info!("Session file {} holds {} sessions", path.display(), sessions.len());
        Ok(Self {
            path,
            sessions: Mutex::new(sessions),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn write(&self, sessions: &[Session]) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let body = serde_json::to_string_pretty(sessions).context("failed to serialize sessions")?;
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, body)
            .await
            .with_context(|| format!("failed to write {}", tmp.display()))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .with_context(|| format!("failed to replace {}", self.path.display()))?;
        Ok(())
    }
}

#[async_trait]
impl SessionStore for JsonFileStore {
    async fn save_session(&self, session: &Session) -> Result<i64> {
        let mut sessions = self.sessions.lock().await;
        let id = sessions.iter().filter_map(|s| s.id).max().unwrap_or(0) + 1;
        let mut record = session.clone();
        record.id = Some(id);
        sessions.push(record);

        if let Err(err) = self.write(&sessions).await {
            sessions.pop();
            return Err(err);
        }
        Ok(id)
    }

    async fn load_sessions_between(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Session>> {
        let sessions = self.sessions.lock().await;
        let mut found: Vec<Session> = sessions
            .iter()
            .filter(|s| s.started_at >= start && s.started_at < end)
            .cloned()
            .collect();
        found.sort_by_key(|s| s.started_at);
        Ok(found)
    }
}

#[cfg(test)]
pub(crate) use memory::MemoryStore;

#[cfg(test)]
mod memory {
    use std::sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    };

    use anyhow::{bail, Result};
    use async_trait::async_trait;
    use chrono::{DateTime, Utc};
    use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

    use super::SessionStore;
    use crate::models::Session;

    /// In-memory store whose saves can be made to fail or to wait.
    #[derive(Default)]
    pub(crate) struct MemoryStore {
        sessions: Mutex<Vec<Session>>,
        fail_saves: AtomicBool,
        save_gate: Arc<AsyncMutex<()>>,
    }

    impl MemoryStore {
        /// Saves wait until the returned guard is dropped.
        pub(crate) async fn hold_saves(&self) -> OwnedMutexGuard<()> {
            self.save_gate.clone().lock_owned().await
        }

        pub(crate) fn fail_saves(&self, fail: bool) {
            self.fail_saves.store(fail, Ordering::SeqCst);
        }

        pub(crate) fn len(&self) -> usize {
            self.sessions.lock().unwrap().len()
        }

        pub(crate) fn insert(&self, session: Session) {
            self.sessions.lock().unwrap().push(session);
        }
    }

    #[async_trait]
    impl SessionStore for MemoryStore {
        async fn save_session(&self, session: &Session) -> Result<i64> {
            let _open = self.save_gate.lock().await;
            if self.fail_saves.load(Ordering::SeqCst) {
                bail!("disk full");
            }
            let mut sessions = self.sessions.lock().unwrap();
            let id = sessions.len() as i64 + 1;
            let mut record = session.clone();
            record.id = Some(id);
            sessions.push(record);
            Ok(id)
        }

        async fn load_sessions_between(
            &self,
            start: DateTime<Utc>,
            end: DateTime<Utc>,
        ) -> Result<Vec<Session>> {
            Ok(self
                .sessions
                .lock()
                .unwrap()
                .iter()
                .filter(|s| s.started_at >= start && s.started_at < end)
                .cloned()
                .collect())
        }
    }
}

#[cfg(test)]
pub(crate) fn finished_session(
    activity: &str,
    started_at: DateTime<Utc>,
    minutes: i64,
    tags: &[&str],
) -> Session {
    let duration = chrono::Duration::minutes(minutes);
    Session {
        id: None,
        started_at,
        stopped_at: Some(started_at + duration),
        duration: duration.to_std().unwrap_or_default(),
        activity: activity.to_string(),
        category: None,
        tags: tags.iter().map(|tag| tag.to_string()).collect(),
    }
}
