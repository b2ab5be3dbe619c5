pub mod render;
pub mod surface;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::{TryRecvError, TrySendError};
use tracing::{debug, error, info, warn};

use crate::audio::NotificationPlayer;
use crate::config::{DisplayConfig, RuntimeFlags};
use render::Renderer;
use surface::{SurfaceFactory, ViewerInput, ViewerSurface};

/// How often the viewer thread pumps window events while idle.
const FRAME_INTERVAL: Duration = Duration::from_millis(16);
/// How long a freshly raised window stays always-on-top.
const TOPMOST_RELEASE: Duration = Duration::from_millis(200);

enum ViewerCommand {
    Show { image: String, name: Option<String> },
    Close,
}

#[derive(Clone)]
struct LastImage {
    data: String,
    name: Option<String>,
}

struct ViewerWorker {
    tx: mpsc::Sender<ViewerCommand>,
    alive: Arc<AtomicBool>,
}

/// Owns the single on-screen viewer. Handlers on any thread call [`show`];
/// the window itself lives on one dedicated thread that drains a bounded
/// command queue, so window state is never touched concurrently. A window
/// closed by the user or the OS is detected on the next `show` and replaced,
/// and the replacement immediately renders the most recent image.
///
/// [`show`]: DisplaySession::show
pub struct DisplaySession {
    cfg: DisplayConfig,
    flags: Arc<RuntimeFlags>,
    player: Arc<NotificationPlayer>,
    factory: Arc<dyn SurfaceFactory>,
    last_image: Mutex<Option<LastImage>>,
    /// Single-flight guard: stale-worker detection and thread creation both
    /// happen under this lock, so two creation sequences cannot overlap.
    worker: Mutex<Option<ViewerWorker>>,
}

impl DisplaySession {
    pub fn new(
        cfg: DisplayConfig,
        flags: Arc<RuntimeFlags>,
        player: Arc<NotificationPlayer>,
        factory: Arc<dyn SurfaceFactory>,
    ) -> Self {
        Self {
            cfg,
            flags,
            player,
            factory,
            last_image: Mutex::new(None),
            worker: Mutex::new(None),
        }
    }

    /// Accept one image for display. Always records it as the last known
    /// image and fires the notification cue; the window itself is only
    /// touched when auto-display is on. Never blocks on the window: commands
    /// are queued, and a full queue drops the command with a warning (the
    /// image stays recorded, so nothing is durably lost).
    pub fn show(&self, image: String, name: Option<String>) {
        *self.last_image.lock().unwrap() = Some(LastImage {
            data: image.clone(),
            name: name.clone(),
        });

        self.player.play_default();

        if !self.flags.auto_display() {
            debug!("auto-display off; image recorded but not shown");
            return;
        }

        let mut slot = self.worker.lock().unwrap();

        let stale = slot
            .as_ref()
            .map(|w| !w.alive.load(Ordering::SeqCst))
            .unwrap_or(false);
        if stale {
            info!("viewer window was closed, starting a new one");
            *slot = None;
        }

        let sent = slot
            .as_ref()
            .map(|worker| worker.tx.try_send(ViewerCommand::Show { image, name }));

        match sent {
            None => {
                // A fresh worker presents the image recorded above as part of
                // its startup, so no command needs to be queued here.
                *slot = self.spawn_worker();
            }
            Some(Ok(())) => {}
            Some(Err(TrySendError::Full(_))) => {
                warn!("viewer queue full; frame dropped (kept as last image)");
            }
            Some(Err(TrySendError::Closed(_))) => {
                info!("viewer exited; starting a new window");
                *slot = self.spawn_worker();
            }
        }
    }

    /// Force-destroy the current window, swallowing errors. The next `show`
    /// starts from a clean no-window state.
    pub fn reset(&self) {
        let mut slot = self.worker.lock().unwrap();
        if let Some(worker) = slot.take() {
            let _ = worker.tx.try_send(ViewerCommand::Close);
            info!("display session reset");
        }
    }

    /// Whether a live viewer window exists right now.
    pub fn window_active(&self) -> bool {
        self.worker
            .lock()
            .unwrap()
            .as_ref()
            .map(|w| w.alive.load(Ordering::SeqCst))
            .unwrap_or(false)
    }

    /// Byte length and overlay name of the most recently accepted image.
    pub fn last_image_info(&self) -> Option<(usize, Option<String>)> {
        self.last_image
            .lock()
            .unwrap()
            .as_ref()
            .map(|l| (l.data.len(), l.name.clone()))
    }

    fn spawn_worker(&self) -> Option<ViewerWorker> {
        let (tx, rx) = mpsc::channel(self.cfg.queue_depth);
        let alive = Arc::new(AtomicBool::new(true));

        let thread_alive = Arc::clone(&alive);
        let factory = Arc::clone(&self.factory);
        let cfg = self.cfg.clone();
        let flags = Arc::clone(&self.flags);
        let initial = self.last_image.lock().unwrap().clone();

        let spawned = std::thread::Builder::new()
            .name("viewer".to_string())
            .spawn(move || {
                run_viewer(factory, cfg, flags, initial, rx);
                thread_alive.store(false, Ordering::SeqCst);
            });

        match spawned {
            Ok(_) => Some(ViewerWorker { tx, alive }),
            Err(e) => {
                error!("failed to start viewer thread: {e}");
                None
            }
        }
    }
}

/// Viewer thread body: open the window, render the last known image, then
/// drain commands until the window closes or the session shuts it down.
fn run_viewer(
    factory: Arc<dyn SurfaceFactory>,
    cfg: DisplayConfig,
    flags: Arc<RuntimeFlags>,
    initial: Option<LastImage>,
    mut rx: mpsc::Receiver<ViewerCommand>,
) {
    let mut surface = match factory.open(&cfg) {
        Ok(surface) => surface,
        Err(e) => {
            error!("failed to open viewer window: {e:#}");
            return;
        }
    };
    info!("viewer window created");

    let renderer = Renderer::new(&cfg);
    viewer_loop(surface.as_mut(), &renderer, &cfg, &flags, initial, &mut rx);
    surface.close();
    info!("viewer thread finished");
}

fn viewer_loop(
    surface: &mut dyn ViewerSurface,
    renderer: &Renderer,
    cfg: &DisplayConfig,
    flags: &RuntimeFlags,
    initial: Option<LastImage>,
    rx: &mut mpsc::Receiver<ViewerCommand>,
) {
    let mut fullscreen = false;
    let mut topmost_until: Option<Instant> = None;

    if let Some(last) = initial {
        present_image(
            surface,
            renderer,
            cfg,
            flags,
            &last.data,
            last.name.as_deref(),
            &mut topmost_until,
        );
    }

    loop {
        match rx.try_recv() {
            Ok(ViewerCommand::Show { image, name }) => {
                present_image(
                    surface,
                    renderer,
                    cfg,
                    flags,
                    &image,
                    name.as_deref(),
                    &mut topmost_until,
                );
            }
            Ok(ViewerCommand::Close) | Err(TryRecvError::Disconnected) => {
                return;
            }
            Err(TryRecvError::Empty) => {
                for input in surface.pump() {
                    match input {
                        ViewerInput::Quit => {
                            info!("viewer closed by user");
                            return;
                        }
                        ViewerInput::ToggleFullscreen => {
                            fullscreen = !fullscreen;
                            if !surface.set_fullscreen(fullscreen) {
                                debug!("fullscreen not supported by this backend");
                            }
                        }
                        ViewerInput::ExitFullscreen => {
                            if fullscreen {
                                fullscreen = false;
                                surface.set_fullscreen(false);
                            }
                        }
                    }
                }

                if !surface.is_open() {
                    info!("viewer window closed");
                    return;
                }

                if let Some(deadline) = topmost_until {
                    if Instant::now() >= deadline {
                        surface.release_topmost();
                        topmost_until = None;
                    }
                }

                std::thread::sleep(FRAME_INTERVAL);
            }
        }
    }
}

/// Render and present one image. Render or present failures are logged and
/// leave the previous frame on screen.
fn present_image(
    surface: &mut dyn ViewerSurface,
    renderer: &Renderer,
    cfg: &DisplayConfig,
    flags: &RuntimeFlags,
    data: &str,
    name: Option<&str>,
    topmost_until: &mut Option<Instant>,
) {
    match renderer.compose(data, name, cfg.width, cfg.height) {
        Ok(frame) => {
            if let Err(e) = surface.present(&frame) {
                error!("failed to present image: {e:#}");
                return;
            }
            info!("image displayed ({}x{} viewport)", frame.width, frame.height);

            if flags.bring_to_foreground() {
                if surface.raise() || surface.restore_cycle() {
                    *topmost_until = Some(Instant::now() + TOPMOST_RELEASE);
                } else {
                    debug!("window raise not supported by this backend");
                }
            }
        }
        Err(e) => error!("failed to render image: {e:#}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use render::test_png;
    use surface::{HeadlessFactory, HeadlessState};

    fn wait_until(timeout: Duration, check: impl Fn() -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if check() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        check()
    }

    fn test_session() -> (Arc<DisplaySession>, Arc<HeadlessState>, Arc<RuntimeFlags>) {
        let factory = HeadlessFactory::default();
        let state = factory.state();

        let mut cfg = AppConfig::default();
        cfg.display.width = 64;
        cfg.display.height = 48;

        let flags = Arc::new(RuntimeFlags::from_config(&cfg));
        flags.set_audio_enabled(false);
        let player = Arc::new(NotificationPlayer::silent(Arc::clone(&flags)));

        let session = Arc::new(DisplaySession::new(
            cfg.display,
            Arc::clone(&flags),
            player,
            Arc::new(factory),
        ));
        (session, state, flags)
    }

    #[test]
    fn concurrent_shows_create_exactly_one_window() {
        let (session, state, _flags) = test_session();
        let image = test_png(10, 10);

        let handles: Vec<_> = (0..6)
            .map(|i| {
                let session = Arc::clone(&session);
                let image = image.clone();
                std::thread::spawn(move || session.show(image, Some(format!("cam{i}"))))
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert!(wait_until(Duration::from_secs(3), || state.presented() >= 1));
        assert_eq!(state.opened(), 1, "only one window may ever be created");
        assert!(session.window_active());
        assert!(state.last_frame().is_some());
    }

    #[test]
    fn images_present_in_arrival_order_with_last_wins() {
        let (session, state, _flags) = test_session();

        // Different aspect ratios produce distinguishable letterboxed frames.
        let first = test_png(10, 10);
        let second = test_png(20, 5);

        session.show(first, None);
        assert!(wait_until(Duration::from_secs(3), || state.presented() == 1));
        let first_stats = state.last_frame().unwrap();

        session.show(second, None);
        assert!(wait_until(Duration::from_secs(3), || state.presented() == 2));
        let second_stats = state.last_frame().unwrap();

        assert_ne!(first_stats.lit, second_stats.lit);
        assert_eq!(state.opened(), 1);
    }

    #[test]
    fn closed_window_is_replaced_and_repopulated() {
        let (session, state, _flags) = test_session();

        session.show(test_png(10, 10), Some("Jan".to_string()));
        assert!(wait_until(Duration::from_secs(3), || state.presented() == 1));

        // Simulate the user closing the window; the viewer thread notices on
        // its next pump and exits.
        state.close_current();
        assert!(wait_until(Duration::from_secs(3), || !session.window_active()));
        assert_eq!(state.opened(), 1);

        // The next image goes to a brand-new window, rendered from the
        // session's recorded last image during worker startup.
        session.show(test_png(20, 5), None);
        assert!(wait_until(Duration::from_secs(3), || state.presented() >= 2));
        assert_eq!(state.opened(), 2);
        assert!(session.window_active());
    }

    #[test]
    fn auto_display_off_records_without_a_window() {
        let (session, state, flags) = test_session();
        flags.set_auto_display(false);

        session.show(test_png(10, 10), Some("Jan".to_string()));

        assert_eq!(state.opened(), 0);
        assert!(!session.window_active());
        let (len, name) = session.last_image_info().unwrap();
        assert!(len > 0);
        assert_eq!(name.as_deref(), Some("Jan"));
    }

    #[test]
    fn reset_tears_the_window_down() {
        let (session, state, _flags) = test_session();

        session.show(test_png(10, 10), None);
        assert!(wait_until(Duration::from_secs(3), || state.presented() == 1));

        session.reset();
        assert!(!session.window_active());

        // A later show starts over with a fresh window.
        session.show(test_png(10, 10), None);
        assert!(wait_until(Duration::from_secs(3), || state.opened() == 2));
    }

    #[test]
    fn undecodable_image_does_not_kill_the_viewer() {
        let (session, state, _flags) = test_session();

        use base64::Engine as _;
        let garbage = base64::engine::general_purpose::STANDARD.encode(b"not an image");
        session.show(garbage, None);

        assert!(wait_until(Duration::from_secs(3), || state.opened() == 1));
        // Render fails, nothing is presented, but the window stays up and the
        // next valid image goes through.
        session.show(test_png(10, 10), None);
        assert!(wait_until(Duration::from_secs(3), || state.presented() == 1));
        assert!(session.window_active());
    }
}
