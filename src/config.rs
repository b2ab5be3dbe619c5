use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

/// Full service configuration, loaded once at startup. Flags that can change
/// at runtime through the config endpoint live in [`RuntimeFlags`].
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub http: HttpConfig,
    pub notify: NotifyConfig,
    pub display: DisplayConfig,
    pub audio: AudioConfig,
    pub photos: PhotoConfig,
    pub logging: LoggingConfig,
    pub call: CallConfig,
    pub automation: AutomationConfig,
    pub forward: ForwardConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    pub bind: String,
    pub port: u16,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".to_string(),
            port: 5000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NotifyConfig {
    /// When false, only motion alarms reach the viewer.
    pub send_all_alarms: bool,
}

impl Default for NotifyConfig {
    fn default() -> Self {
        Self {
            send_all_alarms: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DisplayConfig {
    pub auto_display: bool,
    pub bring_to_foreground: bool,
    /// Viewer surface dimensions. The window backends cannot query the
    /// physical screen, so these stand in for it.
    pub width: u32,
    pub height: u32,
    /// Depth of the command queue feeding the viewer thread.
    pub queue_depth: usize,
    /// Candidate font files for the overlay, tried in order before the
    /// built-in system locations. No usable font means no overlay.
    pub font_paths: Vec<PathBuf>,
    pub overlay_font_px: f32,
}

impl Default for DisplayConfig {
    fn default() -> Self {
        Self {
            auto_display: true,
            bring_to_foreground: true,
            width: 1920,
            height: 1080,
            queue_depth: 64,
            font_paths: Vec::new(),
            overlay_font_px: 72.0,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    pub enabled: bool,
    /// Sound asset, resolved against several locations at play time.
    pub sound_file: PathBuf,
    pub volume: f32,
    pub max_duration_secs: u64,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            sound_file: PathBuf::from("alarm.mp3"),
            volume: 1.0,
            max_duration_secs: 10,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PhotoConfig {
    pub persist: bool,
    pub dir: PathBuf,
}

impl Default for PhotoConfig {
    fn default() -> Self {
        Self {
            persist: true,
            dir: PathBuf::from("received_photos"),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Directory for the service log (served by the logs endpoint).
    pub dir: PathBuf,
    pub file: String,
    /// Directory for per-device activity logs.
    pub device_log_dir: PathBuf,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("logs"),
            file: "alarm-relay.log".to_string(),
            device_log_dir: PathBuf::from("logs/devices"),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CallConfig {
    pub enabled: bool,
    /// External dialer command, invoked per alarm with destination/duration.
    pub dialer: PathBuf,
    pub destination: String,
    pub duration_secs: u64,
    pub log_file: PathBuf,
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            dialer: PathBuf::from("sip-dial"),
            destination: "6200".to_string(),
            duration_secs: 15,
            log_file: PathBuf::from("logs/calls.log"),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AutomationConfig {
    pub enabled: bool,
    /// UDP address of the home-automation controller.
    pub addr: String,
}

impl Default for AutomationConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            addr: "192.168.1.100:1234".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ForwardConfig {
    pub enabled: bool,
    /// Downstream photo receiver, e.g. "http://192.168.0.246:5001/photo".
    pub url: Option<String>,
    pub timeout_secs: u64,
}

impl Default for ForwardConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            url: None,
            timeout_secs: 10,
        }
    }
}

/// Load configuration from an optional TOML file plus `ALARM_RELAY_*`
/// environment overrides (double underscore separates sections, e.g.
/// `ALARM_RELAY_HTTP__PORT=8080`).
pub fn load(path: Option<&Path>) -> Result<AppConfig> {
    let mut builder = config::Config::builder();

    builder = match path {
        Some(path) => builder.add_source(config::File::from(path)),
        None => builder.add_source(config::File::with_name("alarm-relay").required(false)),
    };

    builder = builder.add_source(
        config::Environment::with_prefix("ALARM_RELAY")
            .separator("__")
            .try_parsing(true),
    );

    builder
        .build()
        .context("failed to read configuration")?
        .try_deserialize()
        .context("invalid configuration")
}

/// Process-wide flags mutable at runtime through the config endpoint. Touched
/// by concurrent request handlers and read by the viewer and audio threads,
/// so everything here is atomic.
#[derive(Debug)]
pub struct RuntimeFlags {
    auto_display: AtomicBool,
    bring_to_foreground: AtomicBool,
    persist_photos: AtomicBool,
    audio_enabled: AtomicBool,
    /// f32 volume stored as raw bits.
    audio_volume: AtomicU32,
}

impl RuntimeFlags {
    pub fn from_config(cfg: &AppConfig) -> Self {
        Self {
            auto_display: AtomicBool::new(cfg.display.auto_display),
            bring_to_foreground: AtomicBool::new(cfg.display.bring_to_foreground),
            persist_photos: AtomicBool::new(cfg.photos.persist),
            audio_enabled: AtomicBool::new(cfg.audio.enabled),
            audio_volume: AtomicU32::new(cfg.audio.volume.clamp(0.0, 1.0).to_bits()),
        }
    }

    pub fn auto_display(&self) -> bool {
        self.auto_display.load(Ordering::Relaxed)
    }

    pub fn set_auto_display(&self, on: bool) {
        self.auto_display.store(on, Ordering::Relaxed);
    }

    pub fn bring_to_foreground(&self) -> bool {
        self.bring_to_foreground.load(Ordering::Relaxed)
    }

    pub fn set_bring_to_foreground(&self, on: bool) {
        self.bring_to_foreground.store(on, Ordering::Relaxed);
    }

    pub fn persist_photos(&self) -> bool {
        self.persist_photos.load(Ordering::Relaxed)
    }

    pub fn set_persist_photos(&self, on: bool) {
        self.persist_photos.store(on, Ordering::Relaxed);
    }

    pub fn audio_enabled(&self) -> bool {
        self.audio_enabled.load(Ordering::Relaxed)
    }

    pub fn set_audio_enabled(&self, on: bool) {
        self.audio_enabled.store(on, Ordering::Relaxed);
    }

    pub fn audio_volume(&self) -> f32 {
        f32::from_bits(self.audio_volume.load(Ordering::Relaxed))
    }

    /// Volume is clamped to [0, 1] on the way in.
    pub fn set_audio_volume(&self, volume: f32) {
        self.audio_volume
            .store(volume.clamp(0.0, 1.0).to_bits(), Ordering::Relaxed);
    }
}
