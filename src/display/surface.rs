use anyhow::Result;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use crate::config::DisplayConfig;
use crate::display::render::Frame;

/// Input events the viewer loop reacts to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViewerInput {
    /// Escape leaves fullscreen but never closes the window.
    ExitFullscreen,
    ToggleFullscreen,
    /// Quit key or window close button.
    Quit,
}

/// One on-screen window. Created and used exclusively on the viewer thread;
/// the handle never crosses threads, so no `Send` bound is required. Raise
/// and fullscreen are capabilities: a backend that cannot perform them
/// returns `false` and the caller falls through to the next strategy.
pub trait ViewerSurface {
    fn present(&mut self, frame: &Frame) -> Result<()>;
    /// Drive the window event loop once and report pending inputs.
    fn pump(&mut self) -> Vec<ViewerInput>;
    fn is_open(&self) -> bool;
    fn set_fullscreen(&mut self, on: bool) -> bool;
    /// Primary raise-and-focus strategy.
    fn raise(&mut self) -> bool;
    /// Fallback strategy: minimize then restore to steal focus.
    fn restore_cycle(&mut self) -> bool;
    /// Drop any always-on-top flag so other windows can occlude this one.
    fn release_topmost(&mut self);
    fn close(&mut self);
}

/// Creates surfaces on the viewer thread. Shared across threads so the
/// session can hand it to each new viewer worker.
pub trait SurfaceFactory: Send + Sync {
    fn open(&self, cfg: &DisplayConfig) -> Result<Box<dyn ViewerSurface>>;
}

/// The backend compiled into this build: a real window when the `screen`
/// feature is enabled, otherwise the headless no-op surface.
pub fn default_factory() -> Arc<dyn SurfaceFactory> {
    #[cfg(feature = "screen")]
    {
        Arc::new(minifb_backend::MinifbFactory)
    }
    #[cfg(not(feature = "screen"))]
    {
        Arc::new(HeadlessFactory::default())
    }
}

/// Observable state shared between a [`HeadlessFactory`] and its surfaces.
/// Doubles as the seam tests use to count window creations and simulate a
/// window being closed from outside.
#[derive(Debug, Default)]
pub struct HeadlessState {
    opened: AtomicUsize,
    presented: AtomicUsize,
    closed_before: AtomicUsize,
    last_frame: Mutex<Option<FrameStats>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameStats {
    pub width: u32,
    pub height: u32,
    /// Count of non-black pixels, enough to tell test images apart.
    pub lit: usize,
}

impl HeadlessState {
    pub fn opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }

    pub fn presented(&self) -> usize {
        self.presented.load(Ordering::SeqCst)
    }

    pub fn last_frame(&self) -> Option<FrameStats> {
        *self.last_frame.lock().unwrap()
    }

    /// Make every surface opened so far report closed, as if the user or the
    /// OS destroyed the window. Surfaces opened afterwards are unaffected.
    pub fn close_current(&self) {
        self.closed_before
            .store(self.opened.load(Ordering::SeqCst), Ordering::SeqCst);
    }
}

/// Windowless surface: accepts frames and records statistics. Used when no
/// display backend is compiled in and as the test double.
#[derive(Default)]
pub struct HeadlessFactory {
    state: Arc<HeadlessState>,
}

impl HeadlessFactory {
    pub fn state(&self) -> Arc<HeadlessState> {
        Arc::clone(&self.state)
    }
}

impl SurfaceFactory for HeadlessFactory {
    fn open(&self, _cfg: &DisplayConfig) -> Result<Box<dyn ViewerSurface>> {
        let index = self.state.opened.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(HeadlessSurface {
            state: Arc::clone(&self.state),
            index,
            open: true,
        }))
    }
}

struct HeadlessSurface {
    state: Arc<HeadlessState>,
    index: usize,
    open: bool,
}

impl ViewerSurface for HeadlessSurface {
    fn present(&mut self, frame: &Frame) -> Result<()> {
        let lit = frame.pixels.iter().filter(|&&p| p != 0).count();
        *self.state.last_frame.lock().unwrap() = Some(FrameStats {
            width: frame.width,
            height: frame.height,
            lit,
        });
        self.state.presented.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn pump(&mut self) -> Vec<ViewerInput> {
        Vec::new()
    }

    fn is_open(&self) -> bool {
        self.open && self.index >= self.state.closed_before.load(Ordering::SeqCst)
    }

    fn set_fullscreen(&mut self, _on: bool) -> bool {
        false
    }

    fn raise(&mut self) -> bool {
        false
    }

    fn restore_cycle(&mut self) -> bool {
        false
    }

    fn release_topmost(&mut self) {}

    fn close(&mut self) {
        self.open = false;
    }
}

#[cfg(feature = "screen")]
mod minifb_backend {
    use super::*;
    use anyhow::anyhow;
    use minifb::{Key, KeyRepeat, ScaleMode, Window, WindowOptions};

    pub struct MinifbFactory;

    impl SurfaceFactory for MinifbFactory {
        fn open(&self, cfg: &DisplayConfig) -> Result<Box<dyn ViewerSurface>> {
            let options = WindowOptions {
                resize: true,
                scale_mode: ScaleMode::AspectRatioStretch,
                ..WindowOptions::default()
            };
            let window = Window::new(
                "Alarm Photo Viewer",
                cfg.width as usize,
                cfg.height as usize,
                options,
            )
            .map_err(|e| anyhow!("failed to create viewer window: {e}"))?;
            Ok(Box::new(MinifbSurface {
                window,
                frame: None,
            }))
        }
    }

    struct MinifbSurface {
        window: Window,
        frame: Option<Frame>,
    }

    impl ViewerSurface for MinifbSurface {
        fn present(&mut self, frame: &Frame) -> Result<()> {
            self.window
                .update_with_buffer(&frame.pixels, frame.width as usize, frame.height as usize)
                .map_err(|e| anyhow!("failed to update window buffer: {e}"))?;
            self.frame = Some(frame.clone());
            Ok(())
        }

        fn pump(&mut self) -> Vec<ViewerInput> {
            // Re-feed the last frame so the window stays painted across
            // expose and resize events.
            match &self.frame {
                Some(frame) => {
                    let _ = self.window.update_with_buffer(
                        &frame.pixels,
                        frame.width as usize,
                        frame.height as usize,
                    );
                }
                None => self.window.update(),
            }

            let mut inputs = Vec::new();
            if self.window.is_key_pressed(Key::Q, KeyRepeat::No) {
                inputs.push(ViewerInput::Quit);
            }
            if self.window.is_key_pressed(Key::F11, KeyRepeat::No) {
                inputs.push(ViewerInput::ToggleFullscreen);
            }
            if self.window.is_key_pressed(Key::Escape, KeyRepeat::No) {
                inputs.push(ViewerInput::ExitFullscreen);
            }
            inputs
        }

        fn is_open(&self) -> bool {
            self.window.is_open()
        }

        fn set_fullscreen(&mut self, _on: bool) -> bool {
            // minifb windows cannot change mode after creation.
            false
        }

        fn raise(&mut self) -> bool {
            self.window.topmost(true);
            true
        }

        fn restore_cycle(&mut self) -> bool {
            false
        }

        fn release_topmost(&mut self) {
            self.window.topmost(false);
        }

        fn close(&mut self) {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn headless_counts_creations_and_presentations() {
        let factory = HeadlessFactory::default();
        let state = factory.state();
        let cfg = DisplayConfig::default();

        let mut surface = factory.open(&cfg).unwrap();
        assert_eq!(state.opened(), 1);
        assert!(surface.is_open());

        let frame = Frame {
            width: 2,
            height: 2,
            pixels: vec![0xffffff, 0, 0, 0xffffff],
        };
        surface.present(&frame).unwrap();
        assert_eq!(state.presented(), 1);
        assert_eq!(
            state.last_frame(),
            Some(FrameStats {
                width: 2,
                height: 2,
                lit: 2
            })
        );
    }

    #[test]
    fn close_current_only_affects_existing_surfaces() {
        let factory = HeadlessFactory::default();
        let state = factory.state();
        let cfg = DisplayConfig::default();

        let first = factory.open(&cfg).unwrap();
        state.close_current();
        assert!(!first.is_open());

        let second = factory.open(&cfg).unwrap();
        assert!(second.is_open());
    }
}
