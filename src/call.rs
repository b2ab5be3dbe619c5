use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fs::OpenOptions;
use std::io::Write;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use tracing::{debug, error, info, warn};

use crate::config::CallConfig;

/// Outcome of the most recent dial attempt, surfaced by the status endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct CallOutcome {
    pub destination: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub exit_code: Option<i32>,
    pub error: Option<String>,
}

/// Launches the external dialer as a monitored background task. The dispatcher
/// fires and forgets; the task records completion for observability and
/// appends a framed transcript to the call log.
pub struct CallDialer {
    cfg: CallConfig,
    last: Arc<Mutex<Option<CallOutcome>>>,
}

impl CallDialer {
    pub fn new(cfg: CallConfig) -> Self {
        Self {
            cfg,
            last: Arc::new(Mutex::new(None)),
        }
    }

    pub fn last_outcome(&self) -> Option<CallOutcome> {
        self.last.lock().unwrap().clone()
    }

    /// Start a call to the configured destination. Returns whether a dial
    /// task was launched; the call itself completes in the background and
    /// failures are only logged.
    pub fn trigger(&self) -> bool {
        if !self.cfg.enabled {
            debug!("phone calls disabled by configuration");
            return false;
        }

        let cfg = self.cfg.clone();
        let last = Arc::clone(&self.last);
        tokio::spawn(async move {
            if let Err(e) = run_call(&cfg, &last).await {
                error!("phone call to {} failed: {e:#}", cfg.destination);
                if let Some(outcome) = last.lock().unwrap().as_mut() {
                    outcome.finished_at = Some(Utc::now());
                    outcome.error = Some(format!("{e:#}"));
                }
            }
        });
        true
    }
}

async fn run_call(cfg: &CallConfig, last: &Mutex<Option<CallOutcome>>) -> Result<()> {
    let started_at = Utc::now();
    *last.lock().unwrap() = Some(CallOutcome {
        destination: cfg.destination.clone(),
        started_at,
        finished_at: None,
        exit_code: None,
        error: None,
    });

    if let Some(parent) = cfg.log_file.parent() {
        std::fs::create_dir_all(parent).ok();
    }
    let mut log = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&cfg.log_file)
        .with_context(|| format!("failed to open call log {}", cfg.log_file.display()))?;
    writeln!(
        log,
        "=== call started {} to {} ===",
        started_at.to_rfc3339(),
        cfg.destination
    )?;

    let stdout = log.try_clone().context("failed to clone call log handle")?;
    let stderr = log.try_clone().context("failed to clone call log handle")?;

    let mut child = tokio::process::Command::new(&cfg.dialer)
        .arg("--destination")
        .arg(&cfg.destination)
        .arg("--duration")
        .arg(cfg.duration_secs.to_string())
        .stdin(Stdio::null())
        .stdout(Stdio::from(stdout))
        .stderr(Stdio::from(stderr))
        .spawn()
        .with_context(|| format!("failed to launch dialer {}", cfg.dialer.display()))?;

    info!(
        "call process started (pid {:?}) to {}",
        child.id(),
        cfg.destination
    );

    let status = child.wait().await.context("failed to wait on dialer")?;
    let finished_at = Utc::now();
    writeln!(
        log,
        "=== call finished {} (exit code: {:?}) ===",
        finished_at.to_rfc3339(),
        status.code()
    )?;

    if let Some(outcome) = last.lock().unwrap().as_mut() {
        outcome.finished_at = Some(finished_at);
        outcome.exit_code = status.code();
    }

    if status.success() {
        info!("call to {} completed", cfg.destination);
    } else {
        warn!("call to {} exited with {:?}", cfg.destination, status.code());
    }
    Ok(())
}
