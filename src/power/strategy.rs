//! Platform mechanisms that ask the OS to resume the machine at an instant.
//!
//! Each strategy shells out to a documented system command. Linux tries a
//! privileged RTC alarm first and falls back to an `at` job; Windows uses a
//! one-off scheduled task; macOS uses a `pmset` power event.

use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use chrono::{DateTime, Local};

use super::command::{CommandRunner, CommandSpec};

// Set to true to log every OS command outcome.
const ENABLE_LOGS: bool = true;

use crate::log_info;

/// Whatever a strategy needs later to cancel what it armed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WakeArtifact {
    pub strategy: &'static str,
    pub alarm_id: String,
    pub handle: String,
}

#[async_trait]
pub trait WakeStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    async fn arm(&self, alarm_id: &str, at: DateTime<Local>) -> Result<WakeArtifact>;

    async fn disarm(&self, artifact: &WakeArtifact) -> Result<()>;

    /// Called once the instant has passed. Artifacts the OS consumes on
    /// firing need nothing here.
    async fn expire(&self, _artifact: &WakeArtifact) -> Result<()> {
        Ok(())
    }
}

/// Strategies for the running OS, in fallback order.
pub fn platform_strategies(runner: Arc<dyn CommandRunner>) -> Vec<Arc<dyn WakeStrategy>> {
    if cfg!(target_os = "linux") {
        let rtc: Arc<dyn WakeStrategy> = Arc::new(RtcWake::new(runner.clone()));
        let at: Arc<dyn WakeStrategy> = Arc::new(AtJob::new(runner));
        vec![rtc, at]
    } else if cfg!(target_os = "windows") {
        let task: Arc<dyn WakeStrategy> = Arc::new(ScheduledTask::new(runner));
        vec![task]
    } else if cfg!(target_os = "macos") {
        let pmset: Arc<dyn WakeStrategy> = Arc::new(Pmset::new(runner));
        vec![pmset]
    } else {
        Vec::new()
    }
}

/// Alarm ids end up inside shell text and task names.
fn sanitize_id(alarm_id: &str) -> String {
    alarm_id
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '_' || *c == '-')
        .collect()
}

async fn run_checked(runner: &dyn CommandRunner, cmd: CommandSpec) -> Result<String> {
    let output = runner.run(&cmd).await?.into_success(&cmd)?;
    log_info!("`{}` succeeded", cmd);
    Ok(format!("{}{}", output.stdout, output.stderr))
}

/// `rtcwake -m no` programs the RTC alarm without suspending. The machine
/// has a single RTC alarm, so only one alarm id holds it at a time; arming
/// for another id fails and the next strategy in the chain takes over.
pub struct RtcWake {
    runner: Arc<dyn CommandRunner>,
    holder: Mutex<Option<String>>,
}

impl RtcWake {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            runner,
            holder: Mutex::new(None),
        }
    }

    /// Alarm id currently programmed into the RTC.
    pub fn holder(&self) -> Option<String> {
        self.lock_holder().clone()
    }

    fn claim(&self, alarm_id: &str) -> Result<()> {
        let mut holder = self.lock_holder();
        match holder.as_deref() {
            Some(other) if other != alarm_id => bail!("RTC alarm is held by {other}"),
            _ => {
                *holder = Some(alarm_id.to_string());
                Ok(())
            }
        }
    }

    /// Frees the slot if `alarm_id` holds it. Returns whether it did.
    fn release(&self, alarm_id: &str) -> bool {
        let mut holder = self.lock_holder();
        if holder.as_deref() == Some(alarm_id) {
            *holder = None;
            true
        } else {
            false
        }
    }

    fn lock_holder(&self) -> MutexGuard<'_, Option<String>> {
        match self.holder.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[async_trait]
impl WakeStrategy for RtcWake {
    fn name(&self) -> &'static str {
        "rtcwake"
    }

    async fn arm(&self, alarm_id: &str, at: DateTime<Local>) -> Result<WakeArtifact> {
        self.claim(alarm_id)?;
        let timestamp = at.timestamp().to_string();
        let armed = run_checked(
            self.runner.as_ref(),
            CommandSpec::new("sudo", ["-n", "rtcwake", "-m", "no", "-t", timestamp.as_str()]),
        )
        .await;
        if let Err(err) = armed {
            self.release(alarm_id);
            return Err(err);
        }
        Ok(WakeArtifact {
            strategy: self.name(),
            alarm_id: alarm_id.to_string(),
            handle: timestamp,
        })
    }

    async fn disarm(&self, artifact: &WakeArtifact) -> Result<()> {
        if !self.release(&artifact.alarm_id) {
            log_info!("RTC no longer held by {}, leaving it programmed", artifact.alarm_id);
            return Ok(());
        }
        run_checked(
            self.runner.as_ref(),
            CommandSpec::new("sudo", ["-n", "rtcwake", "-m", "disable"]),
        )
        .await
        .map(|_| ())
    }

    async fn expire(&self, artifact: &WakeArtifact) -> Result<()> {
        self.release(&artifact.alarm_id);
        Ok(())
    }
}

/// Queues a wall message through `at`; the job number is the artifact.
pub struct AtJob {
    runner: Arc<dyn CommandRunner>,
}

impl AtJob {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self { runner }
    }
}

fn parse_at_job_id(output: &str) -> Option<String> {
    output.lines().find_map(|line| {
        let mut words = line.split_whitespace();
        match (words.next(), words.next()) {
            (Some("job"), Some(id)) if id.chars().all(|c| c.is_ascii_digit()) => {
                Some(id.to_string())
            }
            _ => None,
        }
    })
}

#[async_trait]
impl WakeStrategy for AtJob {
    fn name(&self) -> &'static str {
        "at"
    }

    async fn arm(&self, alarm_id: &str, at: DateTime<Local>) -> Result<WakeArtifact> {
        let when = at.format("%Y%m%d%H%M").to_string();
        let script = format!("echo 'Katana alarm {} wake-up' | wall\n", sanitize_id(alarm_id));
        let output = run_checked(
            self.runner.as_ref(),
            CommandSpec::new("at", ["-t", when.as_str()]).with_stdin(script),
        )
        .await?;

        let job = parse_at_job_id(&output)
            .ok_or_else(|| anyhow!("could not find job number in `at` output: {}", output.trim()))?;
        Ok(WakeArtifact {
            strategy: self.name(),
            alarm_id: alarm_id.to_string(),
            handle: job,
        })
    }

    async fn disarm(&self, artifact: &WakeArtifact) -> Result<()> {
        if artifact.handle.is_empty() {
            bail!("missing at job number");
        }
        run_checked(
            self.runner.as_ref(),
            CommandSpec::new("atrm", [artifact.handle.as_str()]),
        )
        .await
        .map(|_| ())
    }
}

/// A run-once Task Scheduler entry named after the alarm.
pub struct ScheduledTask {
    runner: Arc<dyn CommandRunner>,
}

impl ScheduledTask {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self { runner }
    }
}

#[async_trait]
impl WakeStrategy for ScheduledTask {
    fn name(&self) -> &'static str {
        "schtasks"
    }

    async fn arm(&self, alarm_id: &str, at: DateTime<Local>) -> Result<WakeArtifact> {
        let task_name = format!("KatanaAlarm_{}", sanitize_id(alarm_id));
        let time = at.format("%H:%M").to_string();
        let date = at.format("%m/%d/%Y").to_string();
        run_checked(
            self.runner.as_ref(),
            CommandSpec::new(
                "schtasks",
                [
                    "/create",
                    "/tn",
                    task_name.as_str(),
                    "/tr",
                    "cmd /c echo Katana Alarm Wake-up",
                    "/sc",
                    "once",
                    "/st",
                    time.as_str(),
                    "/sd",
                    date.as_str(),
                    "/ru",
                    "SYSTEM",
                    "/rl",
                    "HIGHEST",
                    "/f",
                ],
            ),
        )
        .await?;
        Ok(WakeArtifact {
            strategy: self.name(),
            alarm_id: alarm_id.to_string(),
            handle: task_name,
        })
    }

    async fn disarm(&self, artifact: &WakeArtifact) -> Result<()> {
        run_checked(
            self.runner.as_ref(),
            CommandSpec::new("schtasks", ["/delete", "/tn", artifact.handle.as_str(), "/f"]),
        )
        .await
        .map(|_| ())
    }

    async fn expire(&self, artifact: &WakeArtifact) -> Result<()> {
        self.disarm(artifact).await
    }
}

/// `pmset schedule wake`; cancelled by repeating the exact date string.
pub struct Pmset {
    runner: Arc<dyn CommandRunner>,
}

impl Pmset {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self { runner }
    }
}

#[async_trait]
impl WakeStrategy for Pmset {
    fn name(&self) -> &'static str {
        "pmset"
    }

    async fn arm(&self, alarm_id: &str, at: DateTime<Local>) -> Result<WakeArtifact> {
        let when = at.format("%m/%d/%y %H:%M:%S").to_string();
        run_checked(
            self.runner.as_ref(),
            CommandSpec::new("sudo", ["-n", "pmset", "schedule", "wake", when.as_str()]),
        )
        .await?;
        Ok(WakeArtifact {
            strategy: self.name(),
            alarm_id: alarm_id.to_string(),
            handle: when,
        })
    }

    async fn disarm(&self, artifact: &WakeArtifact) -> Result<()> {
        run_checked(
            self.runner.as_ref(),
            CommandSpec::new(
                "sudo",
                ["-n", "pmset", "schedule", "cancel", "wake", artifact.handle.as_str()],
            ),
        )
        .await
        .map(|_| ())
    }
}
