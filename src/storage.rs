use anyhow::{Context, Result};
use chrono::{DateTime, Local, Utc};
use serde::Serialize;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};

use crate::config::RuntimeFlags;
use crate::payload;

const PHOTO_EXTENSIONS: [&str; 5] = ["jpg", "jpeg", "png", "gif", "bmp"];

/// Writes received photos to timestamp-named files and lists them back for
/// the gallery endpoint.
pub struct PhotoStore {
    dir: PathBuf,
    flags: Arc<RuntimeFlags>,
}

/// Gallery metadata for one stored photo.
#[derive(Debug, Clone, Serialize)]
pub struct PhotoMeta {
    pub filename: String,
    pub size: u64,
    pub modified: DateTime<Utc>,
    pub url: String,
}

impl PhotoStore {
    pub fn new(dir: PathBuf, flags: Arc<RuntimeFlags>) -> Self {
        Self { dir, flags }
    }

    pub fn dir(&self) -> &PathBuf {
        &self.dir
    }

    /// Persist one photo under `<dir>/<tag>_<YYYYMMDD_HHMMSS>.jpg`. Returns
    /// the written path, or `None` when persistence is off or the write
    /// failed (failures are logged, never propagated). Two saves for the same
    /// tag within one second collide; that granularity is accepted.
    pub fn save(&self, image: &str, source_tag: &str) -> Option<PathBuf> {
        if !self.flags.persist_photos() {
            return None;
        }
        match self.write(image, source_tag) {
            Ok(path) => {
                info!("photo saved: {}", path.display());
                Some(path)
            }
            Err(e) => {
                error!("failed to save photo: {e:#}");
                None
            }
        }
    }

    fn write(&self, image: &str, source_tag: &str) -> Result<PathBuf> {
        let bytes = payload::decode_base64_image(image)?;
        fs::create_dir_all(&self.dir)
            .with_context(|| format!("failed to create photo dir {}", self.dir.display()))?;

        let stamp = Local::now().format("%Y%m%d_%H%M%S");
        let filename = format!("{}_{stamp}.jpg", sanitize_file_component(source_tag));
        let path = self.dir.join(filename);

        fs::write(&path, &bytes)
            .with_context(|| format!("failed to write photo {}", path.display()))?;
        Ok(path)
    }

    /// Metadata for every stored photo, newest first.
    pub fn list(&self) -> Vec<PhotoMeta> {
        let Ok(entries) = fs::read_dir(&self.dir) else {
            return Vec::new();
        };

        let mut photos: Vec<PhotoMeta> = entries
            .flatten()
            .filter_map(|entry| {
                let path = entry.path();
                let ext = path.extension()?.to_str()?.to_ascii_lowercase();
                if !PHOTO_EXTENSIONS.contains(&ext.as_str()) {
                    return None;
                }
                let meta = entry.metadata().ok()?;
                let filename = path.file_name()?.to_string_lossy().into_owned();
                Some(PhotoMeta {
                    url: format!("/photo/{filename}"),
                    filename,
                    size: meta.len(),
                    modified: meta.modified().ok()?.into(),
                })
            })
            .collect();

        photos.sort_by(|a, b| b.modified.cmp(&a.modified));
        photos
    }
}

/// Append-only per-device activity log, one line per alarm.
pub struct ActivityLog {
    dir: PathBuf,
}

impl ActivityLog {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    /// Append `ISO-8601 - <alarm name>` to `device_<id>.log`, creating the
    /// directory and file on first use.
    pub fn record(&self, device_id: &str, alarm_name: &str) -> Result<()> {
        fs::create_dir_all(&self.dir)
            .with_context(|| format!("failed to create log dir {}", self.dir.display()))?;

        let path = self
            .dir
            .join(format!("device_{}.log", sanitize_file_component(device_id)));
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("failed to open device log {}", path.display()))?;

        writeln!(file, "{} - {}", Local::now().to_rfc3339(), alarm_name)
            .context("failed to append device log line")?;
        Ok(())
    }
}

/// Device ids and photo tags come from the network; reduce them to a safe
/// file-name alphabet before interpolating into a path.
fn sanitize_file_component(raw: &str) -> String {
    let mut out: String = raw
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect();
    if out.is_empty() {
        out.push('_');
    }
    out
}
