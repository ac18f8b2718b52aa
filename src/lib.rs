pub mod alarm;
pub mod clock;
mod db;
pub mod engine;
pub mod error;
pub mod events;
pub mod models;
pub mod notify;
pub mod power;
pub mod scheduler;
pub mod settings;
pub mod sound;
pub mod store;
pub mod timer;
pub mod tracker;
mod utils;

use std::sync::Arc;

use anyhow::{Context, Result};
use log::{info, warn};

pub use engine::{Engine, EngineDeps};
pub use error::{EngineError, EngineResult};

use clock::SystemClock;
use notify::{DesktopNotifier, LogNotifier, Notifier};
use power::{platform_strategies, CommandRunner, SystemCommandRunner};
use settings::{data_dir, ConfigStore};
use sound::RodioOutput;

/// Runs the headless daemon until Ctrl-C or SIGTERM.
pub async fn run() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    info!("Katana starting up...");

    let data_dir = data_dir();
    std::fs::create_dir_all(&data_dir)
        .with_context(|| format!("failed to create data directory {}", data_dir.display()))?;

    let config_store = ConfigStore::open(&data_dir)?;
    let config = config_store.get();
    info!("Using config at {}", config_store.path().display());

    let store = store::open_store(&data_dir).await?;
    let runner: Arc<dyn CommandRunner> = Arc::new(SystemCommandRunner::default());
    let notifier: Arc<dyn Notifier> = if config.desktop_notifications {
        Arc::new(DesktopNotifier::new(runner.clone()))
    } else {
        Arc::new(LogNotifier)
    };

    let engine = Engine::new(EngineDeps {
        config: config.clone(),
        clock: Arc::new(SystemClock),
        notifier,
        store,
        audio: Arc::new(RodioOutput),
        wake_strategies: platform_strategies(runner),
    });

    match engine.load_sounds(&config.sounds_dir) {
        Ok(count) => info!("{} alarm sounds available", count),
        Err(err) => warn!("Alarm sounds unavailable: {err}"),
    }

    engine.start().await?;

    for alarm in config.alarms {
        match engine.add_alarm(alarm) {
            Ok(alarm) => info!("Alarm '{}' loaded from config", alarm.name),
            Err(err) => warn!("Skipping alarm from config: {err}"),
        }
    }

    wait_for_shutdown_signal().await;
    info!("Shutdown requested");
    engine.shutdown().await;
    Ok(())
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate = match signal(SignalKind::terminate()) {
        Ok(stream) => stream,
        Err(err) => {
            warn!("Cannot listen for SIGTERM: {err}");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = terminate.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!("Cannot listen for Ctrl-C: {err}");
    }
}
