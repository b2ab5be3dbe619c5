use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::{AudioConfig, RuntimeFlags};

/// One playback request: which file, how loud, and how long at most.
#[derive(Debug, Clone)]
pub struct AudioCue {
    pub sound_file: PathBuf,
    pub volume: f32,
    pub max_duration: Duration,
}

/// Fire-and-forget notification sounds. A dedicated thread owns the output
/// stream (the stream handles are not `Send`) and drains a bounded queue, so
/// `play` never blocks the caller. When the backend is unavailable every
/// `play` returns `false` and the rest of the pipeline carries on.
pub struct NotificationPlayer {
    cfg: AudioConfig,
    flags: Arc<RuntimeFlags>,
    tx: Option<mpsc::Sender<AudioCue>>,
}

impl NotificationPlayer {
    pub fn new(cfg: AudioConfig, flags: Arc<RuntimeFlags>) -> Self {
        let tx = backend::spawn_playback_thread();
        if tx.is_some() {
            info!("audio backend ready");
        }
        Self { cfg, flags, tx }
    }

    /// Test constructor with no backend; `play` always returns `false`.
    #[cfg(test)]
    pub fn silent(flags: Arc<RuntimeFlags>) -> Self {
        Self {
            cfg: AudioConfig::default(),
            flags,
            tx: None,
        }
    }

    pub fn available(&self) -> bool {
        self.tx.is_some()
    }

    /// Resolved path of the configured sound asset, if it exists anywhere in
    /// the search order.
    pub fn sound_path(&self) -> Option<PathBuf> {
        resolve_sound_file(&self.cfg.sound_file)
    }

    /// Play the configured notification cue at the current runtime volume.
    pub fn play_default(&self) -> bool {
        self.play(AudioCue {
            sound_file: self.cfg.sound_file.clone(),
            volume: self.flags.audio_volume(),
            max_duration: Duration::from_secs(self.cfg.max_duration_secs),
        })
    }

    /// Launch playback of `cue`. Returns `true` when playback was handed to
    /// the audio thread, not that it finished. Returns `false` without error
    /// when audio is disabled, the backend is unavailable, or the file cannot
    /// be found.
    pub fn play(&self, cue: AudioCue) -> bool {
        if !self.flags.audio_enabled() {
            debug!("audio disabled by configuration");
            return false;
        }
        let Some(tx) = &self.tx else {
            debug!("audio backend unavailable");
            return false;
        };
        let Some(path) = resolve_sound_file(&cue.sound_file) else {
            warn!("sound file not found: {}", cue.sound_file.display());
            return false;
        };

        let cue = AudioCue {
            sound_file: path,
            volume: cue.volume.clamp(0.0, 1.0),
            max_duration: cue.max_duration,
        };
        match tx.try_send(cue) {
            Ok(()) => true,
            Err(e) => {
                warn!("audio queue rejected cue: {e}");
                false
            }
        }
    }
}

/// Try the path as given, then next to the executable, then the working
/// directory, then a `sounds/` subdirectory. First hit wins.
fn resolve_sound_file(file: &Path) -> Option<PathBuf> {
    let mut candidates = vec![file.to_path_buf()];
    if let Some(dir) = std::env::current_exe().ok().and_then(|p| p.parent().map(Path::to_path_buf)) {
        candidates.push(dir.join(file));
    }
    if let Ok(cwd) = std::env::current_dir() {
        candidates.push(cwd.join(file));
    }
    candidates.push(Path::new("sounds").join(file));

    candidates.into_iter().find(|p| p.is_file())
}

#[cfg(feature = "audio")]
mod backend {
    use super::AudioCue;
    use anyhow::{Context, Result};
    use rodio::{Decoder, OutputStream, OutputStreamHandle, Sink, Source};
    use std::fs::File;
    use std::io::BufReader;
    use std::time::Duration;
    use tokio::sync::mpsc;
    use tracing::{error, info};

    pub fn spawn_playback_thread() -> Option<mpsc::Sender<AudioCue>> {
        let (tx, mut rx) = mpsc::channel::<AudioCue>(8);
        let (ready_tx, ready_rx) = std::sync::mpsc::channel();

        let spawned = std::thread::Builder::new()
            .name("audio".to_string())
            .spawn(move || {
                // The stream must stay alive for as long as anything plays.
                match OutputStream::try_default() {
                    Ok((_stream, handle)) => {
                        let _ = ready_tx.send(true);
                        while let Some(cue) = rx.blocking_recv() {
                            if let Err(e) = play_cue(&handle, &cue) {
                                error!("audio playback failed: {e:#}");
                            }
                        }
                    }
                    Err(e) => {
                        error!("audio output unavailable: {e}");
                        let _ = ready_tx.send(false);
                    }
                }
            });

        if spawned.is_err() {
            return None;
        }
        match ready_rx.recv_timeout(Duration::from_secs(2)) {
            Ok(true) => Some(tx),
            _ => None,
        }
    }

    fn play_cue(handle: &OutputStreamHandle, cue: &AudioCue) -> Result<()> {
        let file = File::open(&cue.sound_file)
            .with_context(|| format!("failed to open {}", cue.sound_file.display()))?;
        let source = Decoder::new(BufReader::new(file)).context("failed to decode sound file")?;
        let clip_length = source.total_duration();

        let sink = Sink::try_new(handle).context("failed to create audio sink")?;
        sink.set_volume(cue.volume);
        sink.append(source);

        // Bounded wait for bookkeeping only; callers never see this.
        let wait = clip_length
            .map(|len| len.min(cue.max_duration))
            .unwrap_or(cue.max_duration);
        std::thread::sleep(wait);
        sink.stop();

        info!("notification sound played: {}", cue.sound_file.display());
        Ok(())
    }
}

#[cfg(not(feature = "audio"))]
mod backend {
    use super::AudioCue;
    use tokio::sync::mpsc;
    use tracing::info;

    pub fn spawn_playback_thread() -> Option<mpsc::Sender<AudioCue>> {
        info!("audio backend not compiled in (enable the `audio` feature)");
        None
    }
}
