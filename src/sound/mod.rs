//! Named alarm sounds played in a loop for a bounded time.

mod output;

pub use output::{AudioOutput, ClipData, ClipSink, RodioOutput};

#[cfg(test)]
pub(crate) use output::FakeOutput;

use std::{
    collections::HashMap,
    fs,
    path::{Path, PathBuf},
    sync::{mpsc, Arc, Mutex, MutexGuard, RwLock},
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use anyhow::{anyhow, Context, Result};
use tokio_util::sync::CancellationToken;

use crate::error::{EngineError, EngineResult};

// Set to true to log playback start/stop.
const ENABLE_LOGS: bool = true;

use crate::{log_error, log_info, log_warn};

const SUPPORTED_EXTENSIONS: [&str; 4] = ["wav", "mp3", "ogg", "flac"];

/// Shortest loop pass, so a near-empty clip cannot spin.
const MIN_ITERATION: Duration = Duration::from_millis(100);
const POLL_INTERVAL: Duration = Duration::from_millis(20);

struct Playback {
    name: String,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl Playback {
    /// Signals the loop and waits until it has stopped its sink.
    fn halt(self) {
        self.cancel.cancel();
        if self.handle.join().is_err() {
            log_error!("Playback thread for '{}' panicked", self.name);
        }
    }
}

pub struct SoundPlayer {
    catalog: RwLock<HashMap<String, PathBuf>>,
    current: Mutex<Option<Playback>>,
    output: Arc<dyn AudioOutput>,
}

impl SoundPlayer {
    pub fn new(output: Arc<dyn AudioOutput>) -> Self {
        Self {
            catalog: RwLock::new(HashMap::new()),
            current: Mutex::new(None),
            output,
        }
    }

    /// Adds every supported audio file in `dir` under its display name and
    /// returns how many were found.
    pub fn load_catalog(&self, dir: &Path) -> Result<usize> {
        let entries = fs::read_dir(dir)
            .with_context(|| format!("failed to read sound directory {}", dir.display()))?;

        let mut found = HashMap::new();
        for entry in entries {
            let path = entry?.path();
            if !path.is_file() {
                continue;
            }
            let Some(name) = path
                .file_name()
                .and_then(|name| name.to_str())
                .and_then(display_name)
            else {
                continue;
            };
            found.insert(name, path);
        }

        let count = found.len();
        let mut catalog = match self.catalog.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        catalog.extend(found);
        log_info!("Loaded {} sounds from {}", count, dir.display());
        Ok(count)
    }

    /// Sorted display names.
    pub fn available_sounds(&self) -> Vec<String> {
        let catalog = match self.catalog.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let mut names: Vec<String> = catalog.keys().cloned().collect();
        names.sort();
        names
    }

    /// Loops `name` until `duration` elapses or [`stop_sound`](Self::stop_sound)
    /// is called. Any current playback is stopped before this one starts.
    /// Returns once the output device is open, so a missing device is an error
    /// here rather than a silent thread exit. Blocks while the previous
    /// playback winds down; async callers should go through `spawn_blocking`.
    pub fn play_sound(&self, name: &str, duration: Duration) -> EngineResult<()> {
        let path = self
            .sound_path(name)
            .ok_or_else(|| EngineError::not_found("sound", name))?;

        let mut current = self.lock_current();
        if let Some(previous) = current.take() {
            previous.halt();
        }

        let clip: ClipData = fs::read(&path)
            .with_context(|| format!("failed to read {}", path.display()))
            .map_err(EngineError::Playback)?
            .into();
        self.output
            .probe(&clip)
            .with_context(|| format!("cannot play {}", path.display()))
            .map_err(EngineError::Playback)?;

        let cancel = CancellationToken::new();
        let deadline = Instant::now() + duration;
        let output = self.output.clone();
        let loop_cancel = cancel.clone();
        let loop_name = name.to_string();
        let (ready_tx, ready_rx) = mpsc::channel();
        let handle = thread::Builder::new()
            .name("katana-sound".to_string())
            .spawn(move || play_loop(output, &loop_name, clip, deadline, loop_cancel, ready_tx))
            .map_err(|err| EngineError::Playback(anyhow!("failed to spawn playback thread: {err}")))?;

        let ready = ready_rx
            .recv()
            .context("playback thread exited before opening the output")
            .and_then(|result| result);
        if let Err(err) = ready {
            let _ = handle.join();
            return Err(EngineError::Playback(err));
        }

        log_info!("Playing '{}' for {:?}", name, duration);
        *current = Some(Playback {
            name: name.to_string(),
            cancel,
            handle,
        });
        Ok(())
    }

    /// Stops the current playback, if any, and waits for its thread.
    pub fn stop_sound(&self) {
        let previous = self.lock_current().take();
        if let Some(playback) = previous {
            let name = playback.name.clone();
            playback.halt();
            log_info!("Stopped '{}'", name);
        }
    }

    pub fn is_playing(&self) -> bool {
        self.lock_current()
            .as_ref()
            .is_some_and(|playback| !playback.handle.is_finished())
    }

    /// Name of the sound that is still playing.
    pub fn current_sound(&self) -> Option<String> {
        self.lock_current()
            .as_ref()
            .filter(|playback| !playback.handle.is_finished())
            .map(|playback| playback.name.clone())
    }

    fn sound_path(&self, name: &str) -> Option<PathBuf> {
        let catalog = match self.catalog.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        catalog.get(name).cloned()
    }

    fn lock_current(&self) -> MutexGuard<'_, Option<Playback>> {
        match self.current.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl Drop for SoundPlayer {
    fn drop(&mut self) {
        self.stop_sound();
    }
}

fn play_loop(
    output: Arc<dyn AudioOutput>,
    name: &str,
    clip: ClipData,
    deadline: Instant,
    cancel: CancellationToken,
    ready: mpsc::Sender<Result<()>>,
) {
    let mut sink = match output.open() {
        Ok(sink) => sink,
        Err(err) => {
            log_error!("Cannot open audio output for '{}': {:#}", name, err);
            let _ = ready.send(Err(err.context("cannot open audio output")));
            return;
        }
    };
    if ready.send(Ok(())).is_err() {
        sink.stop();
        return;
    }

    'passes: while !cancel.is_cancelled() && Instant::now() < deadline {
        let pass_started = Instant::now();
        if let Err(err) = sink.start(&clip) {
            log_warn!("Playback of '{}' failed: {:#}", name, err);
            break;
        }

        loop {
            let now = Instant::now();
            if cancel.is_cancelled() || now >= deadline {
                break 'passes;
            }
            if sink.is_finished() && now.duration_since(pass_started) >= MIN_ITERATION {
                break;
            }
            thread::sleep(POLL_INTERVAL.min(deadline - now));
        }
    }

    sink.stop();
}

/// `mixkit-classic-alarm-995.wav` becomes `Classic Alarm 995`. Returns
/// `None` for unsupported extensions.
pub fn display_name(file_name: &str) -> Option<String> {
    let (stem, extension) = file_name.rsplit_once('.')?;
    if !SUPPORTED_EXTENSIONS
        .iter()
        .any(|supported| extension.eq_ignore_ascii_case(supported))
    {
        return None;
    }

    let stem = stem.strip_prefix("mixkit-").unwrap_or(stem);
    let name = stem
        .replace('-', " ")
        .split(' ')
        .map(capitalize)
        .collect::<Vec<_>>()
        .join(" ");
    if name.trim().is_empty() {
        None
    } else {
        Some(name)
    }
}

fn capitalize(word: &str) -> String {
    let mut chars = word.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn player_with(clip_len: Duration) -> (SoundPlayer, FakeOutput, TempDir) {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("mixkit-classic-alarm-995.wav"), b"classic").unwrap();
        fs::write(dir.path().join("bell.MP3"), b"bell").unwrap();
        fs::write(dir.path().join("notes.txt"), b"ignored").unwrap();

        let output = FakeOutput::new(clip_len);
        let player = SoundPlayer::new(Arc::new(output.clone()));
        assert_eq!(player.load_catalog(dir.path()).unwrap(), 2);
        (player, output, dir)
    }

    fn wait_until_idle(player: &SoundPlayer) {
        let give_up = Instant::now() + Duration::from_secs(5);
        while player.is_playing() && Instant::now() < give_up {
            thread::sleep(Duration::from_millis(10));
        }
    }

    #[test]
    fn display_names_follow_file_names() {
        assert_eq!(
            display_name("mixkit-classic-alarm-995.wav").as_deref(),
            Some("Classic Alarm 995")
        );
        assert_eq!(display_name("soft-chime.flac").as_deref(), Some("Soft Chime"));
        assert_eq!(display_name("bell.OGG").as_deref(), Some("Bell"));
        assert_eq!(display_name("readme.md"), None);
        assert_eq!(display_name("noextension"), None);
    }

    #[test]
    fn catalog_is_sorted() {
        let (player, _, _dir) = player_with(Duration::from_millis(50));
        assert_eq!(player.available_sounds(), vec!["Bell", "Classic Alarm 995"]);
    }

    #[test]
    fn missing_directory_is_an_error() {
        let player = SoundPlayer::new(Arc::new(FakeOutput::new(Duration::ZERO)));
        assert!(player.load_catalog(Path::new("/definitely/not/here")).is_err());
    }

    #[test]
    fn unknown_sound_is_not_found() {
        let (player, output, _dir) = player_with(Duration::from_millis(50));
        assert!(matches!(
            player.play_sound("Foghorn", Duration::from_secs(1)),
            Err(EngineError::NotFound { .. })
        ));
        assert!(output.events().is_empty());
    }

    #[test]
    fn loops_until_deadline_then_stops() {
        let (player, output, _dir) = player_with(Duration::from_millis(10));
        player
            .play_sound("Bell", Duration::from_millis(350))
            .unwrap();
        wait_until_idle(&player);

        let events = output.events();
        let starts = events.iter().filter(|event| *event == "start bell").count();
        assert!((2..=4).contains(&starts), "unexpected passes: {events:?}");
        assert_eq!(events.last().map(String::as_str), Some("stop bell"));
        assert_eq!(player.current_sound(), None);
    }

    #[test]
    fn new_playback_starts_after_previous_stops() {
        let (player, output, _dir) = player_with(Duration::from_millis(30));
        player
            .play_sound("Classic Alarm 995", Duration::from_secs(10))
            .unwrap();
        thread::sleep(Duration::from_millis(60));
        player.play_sound("Bell", Duration::from_secs(10)).unwrap();
        assert_eq!(player.current_sound().as_deref(), Some("Bell"));
        thread::sleep(Duration::from_millis(60));
        player.stop_sound();

        let events = output.events();
        let stop_classic = events
            .iter()
            .position(|event| event == "stop classic")
            .unwrap();
        let first_bell = events
            .iter()
            .position(|event| event == "start bell")
            .unwrap();
        assert!(stop_classic < first_bell, "overlapping playback: {events:?}");
        assert_eq!(events.last().map(String::as_str), Some("stop bell"));
    }

    #[test]
    fn missing_output_device_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("bell.wav"), b"bell").unwrap();
        let output = FakeOutput::without_device();
        let player = SoundPlayer::new(Arc::new(output.clone()));
        player.load_catalog(dir.path()).unwrap();

        let err = player.play_sound("Bell", Duration::from_secs(1)).unwrap_err();
        assert!(matches!(err, EngineError::Playback(_)));
        assert!(err.to_string().contains("no output device"), "{err}");
        assert!(!player.is_playing());
        assert_eq!(player.current_sound(), None);
        assert!(output.events().is_empty());
    }

    #[test]
    fn stop_sound_is_idempotent() {
        let (player, output, _dir) = player_with(Duration::from_millis(30));
        player.stop_sound();
        player.play_sound("Bell", Duration::from_secs(10)).unwrap();
        player.stop_sound();
        player.stop_sound();

        assert!(!player.is_playing());
        let stops = output
            .events()
            .iter()
            .filter(|event| event.starts_with("stop"))
            .count();
        assert_eq!(stops, 1);
    }
}
