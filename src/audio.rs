//! Audio clip playback for the sound buttons.
//!
//! `play()` validates the clip and queues it; a worker task starts the
//! actual playback, so neither HTTP handlers nor the button router wait for
//! the audio device. Each clip belongs to a channel and a new clip stops
//! whatever is still playing on its channel.

use crate::consts::{AudioIdx, AUDIO_EXTENSIONS};
use crate::stats::Stats;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, RwLock};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

pub const DEFAULT_CHANNEL: &str = "main";

#[derive(Clone, Debug, PartialEq)]
pub struct AudioClip {
    pub id: AudioIdx,
    pub name: String,
    pub path: PathBuf,
    /// 0-100
    pub volume: u8,
    pub channel: String,
}

#[derive(Debug, thiserror::Error)]
pub enum AudioError {
    #[error("audio playback is disabled")]
    Disabled,

    #[error("unknown audio button {0}")]
    UnknownClip(AudioIdx),

    #[error("no audio file configured")]
    NoFile,

    #[error("audio file not found: {0}")]
    NotFound(PathBuf),

    #[error("unsupported audio file extension: {0}")]
    UnsupportedExtension(PathBuf),

    #[error("cannot read audio file {path}: {message}")]
    Unreadable { path: PathBuf, message: String },

    #[error("audio queue is full")]
    Busy,

    #[error("audio worker stopped")]
    Stopped,
}

#[derive(Clone, Debug, Serialize)]
pub struct FileInfo {
    pub size: u64,
    pub size_mb: f64,
    pub extension: String,
}

/// Check that `path` looks playable: it exists, has a supported extension
/// and can be read.
pub fn validate(path: &Path) -> Result<FileInfo, AudioError> {
    if path.as_os_str().is_empty() {
        return Err(AudioError::NoFile);
    }
    if !path.exists() {
        return Err(AudioError::NotFound(path.to_path_buf()));
    }
    let extension = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .unwrap_or_default();
    if !AUDIO_EXTENSIONS.contains(&extension.as_str()) {
        return Err(AudioError::UnsupportedExtension(path.to_path_buf()));
    }

    let unreadable = |e: std::io::Error| AudioError::Unreadable {
        path: path.to_path_buf(),
        message: e.to_string(),
    };
    let file = File::open(path).map_err(unreadable)?;
    let size = file.metadata().map_err(unreadable)?.len();
    let mut first = Vec::with_capacity(1);
    file.take(1).read_to_end(&mut first).map_err(unreadable)?;

    Ok(FileInfo {
        size,
        size_mb: (size as f64 / (1024.0 * 1024.0) * 100.0).round() / 100.0,
        extension: format!(".{}", extension),
    })
}

/// A started clip.
pub trait Playback: Send {
    fn stop(&mut self);
    fn is_finished(&mut self) -> bool;
}

/// Playback backend. `start` may block while the clip is opened; it runs on
/// the blocking pool inside the runtime.
pub trait ClipPlayer: Send + Sync {
    fn start(&self, path: &Path, volume: u8) -> anyhow::Result<Box<dyn Playback>>;
}

/// Plays clips with an external program.
///
/// Arguments may use `{file}`, `{volume}` (0-100) and `{scale}` (0-32768,
/// for mpg123's `-f`).
pub struct CommandPlayer {
    program: String,
    args: Vec<String>,
}

impl CommandPlayer {
    pub const DEFAULT_COMMAND: &'static str =
        "ffplay -nodisp -autoexit -loglevel quiet -volume {volume} {file}";

    pub fn parse(command: &str) -> anyhow::Result<Self> {
        let mut parts = command.split_whitespace().map(str::to_string);
        let program = parts
            .next()
            .ok_or_else(|| anyhow::anyhow!("Empty player command"))?;
        let mut args: Vec<String> = parts.collect();
        if !args.iter().any(|a| a.contains("{file}")) {
            args.push("{file}".to_string());
        }
        Ok(Self { program, args })
    }

    fn render_args(&self, path: &Path, volume: u8) -> Vec<String> {
        let scale = (32768 * u32::from(volume.min(100)) / 100).to_string();
        self.args
            .iter()
            .map(|arg| {
                arg.replace("{file}", &path.to_string_lossy())
                    .replace("{volume}", &volume.to_string())
                    .replace("{scale}", &scale)
            })
            .collect()
    }
}

/// Dropping the handle kills the player; tokio reaps the exited process.
struct ChildPlayback(Child);

impl Playback for ChildPlayback {
    fn stop(&mut self) {
        if let Err(e) = self.0.start_kill() {
            debug!("Player process already gone: {}", e);
        }
    }

    fn is_finished(&mut self) -> bool {
        !matches!(self.0.try_wait(), Ok(None))
    }
}

impl ClipPlayer for CommandPlayer {
    fn start(&self, path: &Path, volume: u8) -> anyhow::Result<Box<dyn Playback>> {
        let child = Command::new(&self.program)
            .args(self.render_args(path, volume))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| anyhow::anyhow!("Unable to start {}: {}", self.program, e))?;
        Ok(Box::new(ChildPlayback(child)))
    }
}

#[cfg(feature = "rodio")]
pub use self::native::RodioPlayer;

#[cfg(feature = "rodio")]
mod native {
    use super::{ClipPlayer, Playback};
    use rodio::{Decoder, OutputStream, Sink};
    use std::fs::File;
    use std::io::BufReader;
    use std::path::Path;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{mpsc, Arc};
    use std::time::Duration;

    /// Native playback. The output stream isn't `Send`, so every clip gets its
    /// own thread that owns the stream until the clip ends or is stopped.
    pub struct RodioPlayer;

    struct RodioPlayback {
        stop: Arc<AtomicBool>,
        done: Arc<AtomicBool>,
    }

    impl Playback for RodioPlayback {
        fn stop(&mut self) {
            self.stop.store(true, Ordering::SeqCst);
        }

        fn is_finished(&mut self) -> bool {
            self.done.load(Ordering::SeqCst)
        }
    }

    impl ClipPlayer for RodioPlayer {
        fn start(&self, path: &Path, volume: u8) -> anyhow::Result<Box<dyn Playback>> {
            let file = File::open(path)?;
            let source = Decoder::new(BufReader::new(file))?;

            let stop = Arc::new(AtomicBool::new(false));
            let done = Arc::new(AtomicBool::new(false));
            let (started_tx, started_rx) = mpsc::channel::<Result<(), String>>();
            let (thread_stop, thread_done) = (stop.clone(), done.clone());

            std::thread::spawn(move || {
                let (_stream, handle) = match OutputStream::try_default() {
                    Ok(out) => out,
                    Err(e) => {
                        let _ = started_tx.send(Err(e.to_string()));
                        thread_done.store(true, Ordering::SeqCst);
                        return;
                    }
                };
                let sink = match Sink::try_new(&handle) {
                    Ok(sink) => sink,
                    Err(e) => {
                        let _ = started_tx.send(Err(e.to_string()));
                        thread_done.store(true, Ordering::SeqCst);
                        return;
                    }
                };
                sink.set_volume(f32::from(volume.min(100)) / 100.0);
                sink.append(source);
                let _ = started_tx.send(Ok(()));

                while !sink.empty() && !thread_stop.load(Ordering::SeqCst) {
                    std::thread::sleep(Duration::from_millis(20));
                }
                sink.stop();
                thread_done.store(true, Ordering::SeqCst);
            });

            match started_rx.recv() {
                Ok(Ok(())) => Ok(Box::new(RodioPlayback { stop, done })),
                Ok(Err(e)) => anyhow::bail!("Audio output unavailable: {}", e),
                Err(_) => anyhow::bail!("Audio thread died"),
            }
        }
    }
}

enum Request {
    Play(AudioClip),
    StopAll,
}

async fn worker(player: Arc<dyn ClipPlayer>, stats: Stats, mut queue: mpsc::Receiver<Request>) {
    let mut channels: HashMap<String, Box<dyn Playback>> = HashMap::new();

    while let Some(command) = queue.recv().await {
        channels.retain(|_, playback| !playback.is_finished());
        match command {
            Request::Play(clip) => {
                if let Some(mut previous) = channels.remove(&clip.channel) {
                    debug!("Stopping previous clip on channel {}", clip.channel);
                    previous.stop();
                }
                let player = player.clone();
                let path = clip.path.clone();
                let volume = clip.volume;
                let started =
                    tokio::task::spawn_blocking(move || player.start(&path, volume)).await;
                match started {
                    Ok(Ok(playback)) => {
                        info!(
                            "Playing audio: {} at {}% volume",
                            clip.path.display(),
                            clip.volume
                        );
                        channels.insert(clip.channel, playback);
                    }
                    Ok(Err(e)) => {
                        error!("Error playing {}: {:?}", clip.path.display(), e);
                        stats.record_error();
                    }
                    Err(e) => {
                        error!("Audio start task failed: {}", e);
                        stats.record_error();
                    }
                }
            }
            Request::StopAll => {
                for (_, mut playback) in channels.drain() {
                    playback.stop();
                }
            }
        }
    }

    for (_, mut playback) in channels.drain() {
        playback.stop();
    }
    debug!("Audio worker finishing");
}

#[derive(Clone, Debug, Serialize)]
pub struct Accepted {
    pub id: AudioIdx,
    pub name: String,
}

pub struct AudioDispatcher {
    enabled: bool,
    clips: RwLock<BTreeMap<AudioIdx, AudioClip>>,
    queue: mpsc::Sender<Request>,
    stats: Stats,
}

impl AudioDispatcher {
    /// Start the playback worker. Must be called within a tokio runtime.
    pub fn new(
        player: Arc<dyn ClipPlayer>,
        enabled: bool,
        clips: Vec<AudioClip>,
        stats: Stats,
    ) -> Self {
        let (tx, rx) = mpsc::channel(8);
        tokio::spawn(worker(player, stats.clone(), rx));
        let dispatcher = Self {
            enabled,
            clips: RwLock::new(BTreeMap::new()),
            queue: tx,
            stats,
        };
        dispatcher.set_clips(clips);
        dispatcher
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Replace the clip table, e.g. after an admin edit.
    pub fn set_clips(&self, clips: Vec<AudioClip>) {
        for clip in &clips {
            if let Err(e) = validate(&clip.path) {
                warn!("{} (audio button {}) will not play: {}", clip.name, clip.id, e);
            }
        }
        let table = clips.into_iter().map(|c| (c.id, c)).collect();
        *self.clips.write().unwrap_or_else(|e| e.into_inner()) = table;
    }

    pub fn clips(&self) -> Vec<AudioClip> {
        self.clips
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect()
    }

    /// Queue a clip. Returns once it's accepted, not when it finishes.
    pub fn play(&self, id: AudioIdx) -> Result<Accepted, AudioError> {
        if !self.enabled {
            return Err(AudioError::Disabled);
        }
        let clip = self
            .clips
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&id)
            .cloned()
            .ok_or(AudioError::UnknownClip(id))?;

        if let Err(e) = validate(&clip.path) {
            error!("Invalid audio file configured for {}: {}", clip.name, e);
            self.stats.record_error();
            return Err(e);
        }

        let accepted = Accepted {
            id,
            name: clip.name.clone(),
        };
        self.queue
            .try_send(Request::Play(clip))
            .map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => AudioError::Busy,
                mpsc::error::TrySendError::Closed(_) => AudioError::Stopped,
            })?;
        self.stats.record_audio_play();
        Ok(accepted)
    }

    pub async fn stop_all(&self) {
        if self.queue.send(Request::StopAll).await.is_err() {
            debug!("Audio worker already stopped");
        }
    }
}
