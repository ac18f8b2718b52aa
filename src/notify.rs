//! Fire-and-forget user notifications.

use std::sync::Arc;

use log::{debug, info, warn};

use crate::power::{CommandRunner, CommandSpec};

pub const ALARM_TITLE: &str = "Katana Alarm";
pub const TRACKER_TITLE: &str = "Katana Time Tracker";
pub const TIMER_TITLE: &str = "Katana Timer";

pub trait Notifier: Send + Sync {
    /// Shows a notification. Never blocks and never fails the caller.
    fn notify(&self, title: &str, body: &str);
}

/// Writes notifications to the log only. Used when desktop notifications
/// are disabled in the config.
#[derive(Default)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, title: &str, body: &str) {
        info!("[{}] {}", title, body);
    }
}

/// Shows notifications through the desktop's notification tool on a
/// background task.
pub struct DesktopNotifier {
    runner: Arc<dyn CommandRunner>,
}

impl DesktopNotifier {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self { runner }
    }
}

fn desktop_command(title: &str, body: &str) -> Option<CommandSpec> {
    if cfg!(target_os = "linux") {
        Some(CommandSpec::new(
            "notify-send",
            ["--app-name", "Katana", title, body],
        ))
    } else if cfg!(target_os = "macos") {
        let script = format!(
            "display notification \"{}\" with title \"{}\"",
            applescript_escape(body),
            applescript_escape(title)
        );
        Some(CommandSpec::new("osascript", ["-e".to_string(), script]))
    } else {
        None
    }
}

fn applescript_escape(text: &str) -> String {
    text.replace('\\', "\\\\").replace('"', "\\\"")
}

impl Notifier for DesktopNotifier {
    fn notify(&self, title: &str, body: &str) {
        info!("[{}] {}", title, body);
        let Some(cmd) = desktop_command(title, body) else {
            return;
        };
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            debug!("No runtime available for desktop notification");
            return;
        };

        let runner = self.runner.clone();
        handle.spawn(async move {
            match runner.run(&cmd).await.and_then(|output| output.into_success(&cmd)) {
                Ok(_) => debug!("Desktop notification shown"),
                Err(err) => warn!("Desktop notification failed: {:#}", err),
            }
        });
    }
}

#[cfg(test)]
pub(crate) use recording::RecordingNotifier;

#[cfg(test)]
mod recording {
    use std::sync::Mutex;

    use super::Notifier;

    #[derive(Default)]
    pub(crate) struct RecordingNotifier {
        sent: Mutex<Vec<(String, String)>>,
    }

    impl RecordingNotifier {
        pub(crate) fn sent(&self) -> Vec<(String, String)> {
            self.sent.lock().unwrap().clone()
        }
    }

    impl Notifier for RecordingNotifier {
        fn notify(&self, title: &str, body: &str) {
            self.sent
                .lock()
                .unwrap()
                .push((title.to_string(), body.to_string()));
        }
    }
}
