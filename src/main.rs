use alarm_relay::{
    api::{self, AppState},
    audio::NotificationPlayer,
    automation::AutomationLink,
    call::CallDialer,
    config::{self, RuntimeFlags},
    dispatch::Dispatcher,
    display::{DisplaySession, surface},
    forward::Forwarder,
    storage::{ActivityLog, PhotoStore},
};
use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Home-security alarm relay: receives camera webhooks and fans them out to
/// the on-screen viewer, disk, phone, and home-automation controller.
#[derive(Debug, Parser)]
#[command(name = "alarm-relay", version)]
struct Args {
    /// Path to a TOML configuration file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Override the configured bind address.
    #[arg(long)]
    bind: Option<String>,

    /// Override the configured port.
    #[arg(long)]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut cfg = config::load(args.config.as_deref())?;
    if let Some(bind) = args.bind {
        cfg.http.bind = bind;
    }
    if let Some(port) = args.port {
        cfg.http.port = port;
    }

    std::fs::create_dir_all(&cfg.logging.dir).with_context(|| {
        format!("failed to create log directory {}", cfg.logging.dir.display())
    })?;
    let file_appender = tracing_appender::rolling::never(&cfg.logging.dir, &cfg.logging.file);
    let (file_writer, _log_guard) = tracing_appender::non_blocking(file_appender);

    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,alarm_relay=info")),
        )
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(file_writer),
        )
        .init();

    info!("starting alarm relay");

    let flags = Arc::new(RuntimeFlags::from_config(&cfg));
    let audio = Arc::new(NotificationPlayer::new(cfg.audio.clone(), Arc::clone(&flags)));
    let display = Arc::new(DisplaySession::new(
        cfg.display.clone(),
        Arc::clone(&flags),
        Arc::clone(&audio),
        surface::default_factory(),
    ));
    let photos = Arc::new(PhotoStore::new(cfg.photos.dir.clone(), Arc::clone(&flags)));
    let activity = Arc::new(ActivityLog::new(cfg.logging.device_log_dir.clone()));
    let dialer = Arc::new(CallDialer::new(cfg.call.clone()));
    let automation = Arc::new(AutomationLink::new(cfg.automation.clone()));
    let forwarder = Arc::new(Forwarder::new(cfg.forward.clone()));

    let dispatcher = Arc::new(Dispatcher::new(
        cfg.notify.clone(),
        Arc::clone(&display),
        Arc::clone(&photos),
        Arc::clone(&activity),
        Arc::clone(&dialer),
        automation,
        forwarder,
    ));

    info!("═══════════════════════════════════════");
    info!("Alarm Relay");
    info!("═══════════════════════════════════════");
    info!("  Webhook:       POST /webhook");
    info!("  Photo display: POST /photo");
    info!("  Status:        GET  /status");
    info!("  Config:        GET/POST /config");
    info!("  Logs:          GET  /logs");
    info!("  Gallery:       GET  /photos/api");
    if cfg.call.enabled {
        info!("  Calls:         {} -> {}", cfg.call.dialer.display(), cfg.call.destination);
    } else {
        info!("  Calls:         disabled");
    }
    info!(
        "  Audio:         {} ({})",
        if cfg.audio.enabled { "enabled" } else { "disabled" },
        if audio.available() { "backend ready" } else { "backend unavailable" },
    );
    info!("═══════════════════════════════════════");

    let state = AppState {
        dispatcher,
        display,
        audio,
        photos,
        flags,
        dialer,
        log_path: cfg.logging.dir.join(&cfg.logging.file),
    };

    api::serve(state, &cfg.http.bind, cfg.http.port).await
}
