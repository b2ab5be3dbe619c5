use std::sync::Arc;
use tracing::{debug, error, info};

use crate::alarm::AlarmEvent;
use crate::automation::AutomationLink;
use crate::call::CallDialer;
use crate::config::NotifyConfig;
use crate::display::DisplaySession;
use crate::forward::Forwarder;
use crate::storage::{ActivityLog, PhotoStore};

/// Fans one alarm event out to every delivery channel. Channels are
/// independent: each one's failure is caught and logged where it happens, so
/// a broken channel never stops the ones after it, and `handle` itself never
/// returns an error.
pub struct Dispatcher {
    notify: NotifyConfig,
    display: Arc<DisplaySession>,
    photos: Arc<PhotoStore>,
    activity: Arc<ActivityLog>,
    dialer: Arc<CallDialer>,
    automation: Arc<AutomationLink>,
    forwarder: Arc<Forwarder>,
}

impl Dispatcher {
    pub fn new(
        notify: NotifyConfig,
        display: Arc<DisplaySession>,
        photos: Arc<PhotoStore>,
        activity: Arc<ActivityLog>,
        dialer: Arc<CallDialer>,
        automation: Arc<AutomationLink>,
        forwarder: Arc<Forwarder>,
    ) -> Self {
        Self {
            notify,
            display,
            photos,
            activity,
            dialer,
            automation,
            forwarder,
        }
    }

    pub async fn handle(&self, event: &AlarmEvent) {
        let info = event.alarm();
        let alarm_name = info.name.unwrap_or("unknown alarm");
        let motion = info.mentions_motion();
        let should_notify = self.notify.send_all_alarms || motion;
        let image = event.image();

        // Viewer first so the photo appears with minimal delay.
        if should_notify {
            let detected_name = info.detected_name();
            if let Some(name) = detected_name {
                info!("trigger name found: {name}");
            }
            match image {
                Some(image) => {
                    self.display
                        .show(image.to_string(), detected_name.map(str::to_string));
                }
                None => debug!("no image in payload, nothing to display"),
            }
        }

        for trigger in &info.triggers {
            if let Some(device) = trigger.device {
                if let Err(e) = self.activity.record(device, alarm_name) {
                    error!("failed to record activity for device {device}: {e:#}");
                }
            }
        }

        // Persisted regardless of whether anything was displayed.
        if let Some(image) = image {
            let store = Arc::clone(&self.photos);
            let image = image.to_string();
            let tag = alarm_name.to_string();
            tokio::task::spawn_blocking(move || {
                store.save(&image, &tag);
            });
        }

        self.dialer.trigger();

        self.automation
            .announce(alarm_name, &info.device_ids(), motion);

        if should_notify {
            if let Some(image) = image {
                self.forwarder.send(image, info.detected_name());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::NotificationPlayer;
    use crate::config::{
        AppConfig, AutomationConfig, CallConfig, ForwardConfig, RuntimeFlags,
    };
    use crate::display::render::test_png;
    use crate::display::surface::{HeadlessFactory, HeadlessState};
    use serde_json::json;
    use std::path::PathBuf;
    use std::sync::Arc;
    use std::time::{Duration, Instant};
    use uuid::Uuid;

    struct Fixture {
        dispatcher: Dispatcher,
        state: Arc<HeadlessState>,
        flags: Arc<RuntimeFlags>,
        photo_dir: PathBuf,
        device_dir: PathBuf,
        call_log: PathBuf,
    }

    fn fixture(send_all_alarms: bool, call_enabled: bool) -> Fixture {
        let base = std::env::temp_dir().join(format!("alarm-relay-dispatch-{}", Uuid::new_v4()));
        let photo_dir = base.join("photos");
        let device_dir = base.join("devices");
        let call_log = base.join("calls.log");

        let factory = HeadlessFactory::default();
        let state = factory.state();

        let cfg = AppConfig::default();
        let flags = Arc::new(RuntimeFlags::from_config(&cfg));
        flags.set_audio_enabled(false);
        let player = Arc::new(NotificationPlayer::silent(Arc::clone(&flags)));

        let display = Arc::new(DisplaySession::new(
            cfg.display.clone(),
            Arc::clone(&flags),
            player,
            Arc::new(factory),
        ));
        let photos = Arc::new(PhotoStore::new(photo_dir.clone(), Arc::clone(&flags)));
        let activity = Arc::new(ActivityLog::new(device_dir.clone()));
        let dialer = Arc::new(CallDialer::new(CallConfig {
            enabled: call_enabled,
            dialer: PathBuf::from("true"),
            destination: "6200".to_string(),
            duration_secs: 1,
            log_file: call_log.clone(),
        }));
        let automation = Arc::new(AutomationLink::new(AutomationConfig::default()));
        let forwarder = Arc::new(Forwarder::new(ForwardConfig::default()));

        let dispatcher = Dispatcher::new(
            crate::config::NotifyConfig { send_all_alarms },
            display,
            photos,
            activity,
            dialer,
            automation,
            forwarder,
        );

        Fixture {
            dispatcher,
            state,
            flags,
            photo_dir,
            device_dir,
            call_log,
        }
    }

    async fn wait_until(timeout: Duration, check: impl Fn() -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if check() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        check()
    }

    fn motion_event() -> AlarmEvent {
        AlarmEvent::new(json!({
            "alarm": {
                "name": "Motion Front",
                "triggers": [
                    { "device": "CAM1", "key": "motion", "group": { "name": "Jan" } },
                ],
            },
            "thumbnail": test_png(10, 10),
        }))
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn motion_event_reaches_every_channel() {
        let fx = fixture(false, true);
        let event = motion_event();

        fx.dispatcher.handle(&event).await;

        // Display: one window, overlay name from the trigger group.
        let state = Arc::clone(&fx.state);
        assert!(wait_until(Duration::from_secs(3), move || state.presented() >= 1).await);
        assert_eq!(fx.state.opened(), 1);

        // Device activity log: one line for CAM1.
        let device_log = fx.device_dir.join("device_CAM1.log");
        let contents = std::fs::read_to_string(&device_log).unwrap();
        assert_eq!(contents.lines().count(), 1);
        assert!(contents.trim_end().ends_with(" - Motion Front"));

        // Photo persistence: one file tagged with the alarm name.
        let photo_dir = fx.photo_dir.clone();
        assert!(
            wait_until(Duration::from_secs(3), move || {
                std::fs::read_dir(&photo_dir)
                    .map(|d| d.count() == 1)
                    .unwrap_or(false)
            })
            .await
        );
        let entry = std::fs::read_dir(&fx.photo_dir).unwrap().next().unwrap().unwrap();
        assert!(entry.file_name().to_string_lossy().starts_with("Motion_Front_"));

        // Call trigger: the dial transcript exists once the task completes.
        let call_log = fx.call_log.clone();
        assert!(wait_until(Duration::from_secs(3), move || call_log.exists()).await);

        std::fs::remove_dir_all(fx.photo_dir.parent().unwrap()).ok();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn empty_event_touches_nothing() {
        let fx = fixture(false, false);
        let event = AlarmEvent::new(json!({ "alarm": { "name": "Doorbell ring" } }));

        fx.dispatcher.handle(&event).await;
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(fx.state.opened(), 0, "no display without motion");
        assert!(!fx.photo_dir.exists(), "no photo writes");
        assert!(!fx.device_dir.exists(), "no device log writes");
        assert!(!fx.call_log.exists());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn malformed_event_degrades_gracefully() {
        let fx = fixture(true, false);
        let event = AlarmEvent::new(json!({ "unexpected": [1, 2, 3] }));

        fx.dispatcher.handle(&event).await;
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(fx.state.presented(), 0);
        assert!(!fx.photo_dir.exists());
        assert!(!fx.device_dir.exists());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn channel_failure_does_not_stop_the_rest() {
        let fx = fixture(false, false);

        // Sabotage the activity log dir by placing a file where the
        // directory should go.
        std::fs::create_dir_all(fx.device_dir.parent().unwrap()).unwrap();
        std::fs::write(&fx.device_dir, b"not a directory").unwrap();

        let event = motion_event();
        fx.dispatcher.handle(&event).await;

        // The device log fails, but the photo still lands on disk.
        let photo_dir = fx.photo_dir.clone();
        assert!(
            wait_until(Duration::from_secs(3), move || {
                std::fs::read_dir(&photo_dir)
                    .map(|d| d.count() == 1)
                    .unwrap_or(false)
            })
            .await
        );

        std::fs::remove_dir_all(fx.photo_dir.parent().unwrap()).ok();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn persistence_flag_is_honored_independently_of_display() {
        let fx = fixture(true, false);
        fx.flags.set_persist_photos(false);

        let event = motion_event();
        fx.dispatcher.handle(&event).await;

        let state = Arc::clone(&fx.state);
        assert!(wait_until(Duration::from_secs(3), move || state.presented() >= 1).await);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!fx.photo_dir.exists(), "persistence off means no writes");

        std::fs::remove_dir_all(fx.device_dir.parent().unwrap()).ok();
    }
}
