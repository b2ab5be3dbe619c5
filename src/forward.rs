use chrono::Utc;
use serde_json::json;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::config::ForwardConfig;

/// Optional relay of accepted photos to a secondary receiver (another relay
/// instance or a dedicated display host). Disabled by default; when enabled,
/// each photo is posted with a bounded timeout and failures never block the
/// other delivery channels.
pub struct Forwarder {
    cfg: ForwardConfig,
    client: reqwest::Client,
}

impl Forwarder {
    pub fn new(cfg: ForwardConfig) -> Self {
        Self {
            cfg,
            client: reqwest::Client::new(),
        }
    }

    pub fn send(&self, image: &str, detected_name: Option<&str>) {
        if !self.cfg.enabled {
            return;
        }
        let Some(url) = self.cfg.url.clone() else {
            debug!("photo forwarding enabled but no receiver url configured");
            return;
        };

        let payload = json!({
            "image": normalize_image(image),
            "source": "alarm-relay",
            "detected_name": detected_name,
            "timestamp": Utc::now(),
        });
        let client = self.client.clone();
        let timeout = Duration::from_secs(self.cfg.timeout_secs);

        tokio::spawn(async move {
            match client.post(&url).timeout(timeout).json(&payload).send().await {
                Ok(resp) if resp.status().is_success() => {
                    info!("photo forwarded to {url}");
                }
                Ok(resp) => {
                    warn!("downstream receiver {url} answered {}", resp.status());
                }
                Err(e) => {
                    error!("failed to forward photo to {url}: {e}");
                }
            }
        });
    }
}

/// Downstream receivers expect a data URI; bare base64 gets the jpeg prefix.
fn normalize_image(image: &str) -> String {
    if image.starts_with("data:image") {
        image.to_string()
    } else {
        format!("data:image/jpeg;base64,{image}")
    }
}
