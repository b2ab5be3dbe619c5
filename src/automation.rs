use anyhow::{Context, Result};
use chrono::Local;
use tracing::{error, info};

use crate::config::AutomationConfig;

/// UDP announcements toward the home-automation controller. Connectionless
/// and fire-and-forget; delivery is not guaranteed and failures are logged
/// only.
pub struct AutomationLink {
    cfg: AutomationConfig,
}

impl AutomationLink {
    pub fn new(cfg: AutomationConfig) -> Self {
        Self { cfg }
    }

    /// Send one datagram describing the alarm, e.g.
    /// `MOTION:Motion Front|DEVICES:CAM1,CAM2|TIME:14:30:22`.
    pub fn announce(&self, alarm_name: &str, devices: &[&str], motion: bool) {
        if !self.cfg.enabled {
            return;
        }

        let message = format_announcement(alarm_name, devices, motion);
        let addr = self.cfg.addr.clone();
        tokio::spawn(async move {
            match send_datagram(&addr, &message).await {
                Ok(()) => info!("automation announce sent to {addr}: {message}"),
                Err(e) => error!("automation announce to {addr} failed: {e:#}"),
            }
        });
    }
}

fn format_announcement(alarm_name: &str, devices: &[&str], motion: bool) -> String {
    format!(
        "{}:{}|DEVICES:{}|TIME:{}",
        if motion { "MOTION" } else { "ALARM" },
        alarm_name,
        devices.join(","),
        Local::now().format("%H:%M:%S"),
    )
}

async fn send_datagram(addr: &str, message: &str) -> Result<()> {
    let socket = tokio::net::UdpSocket::bind("0.0.0.0:0")
        .await
        .context("failed to bind udp socket")?;
    socket
        .send_to(message.as_bytes(), addr)
        .await
        .with_context(|| format!("failed to send datagram to {addr}"))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn announcement_format_carries_kind_name_and_devices() {
        let msg = format_announcement("Motion Front", &["CAM1", "CAM2"], true);
        assert!(msg.starts_with("MOTION:Motion Front|DEVICES:CAM1,CAM2|TIME:"));

        let msg = format_announcement("Vehicle of interest", &[], false);
        assert!(msg.starts_with("ALARM:Vehicle of interest|DEVICES:|TIME:"));
    }

    #[tokio::test]
    async fn datagram_reaches_a_local_listener() {
        let listener = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        send_datagram(&addr, "MOTION:test").await.unwrap();

        let mut buf = [0u8; 64];
        let (len, _) = tokio::time::timeout(
            std::time::Duration::from_secs(2),
            listener.recv_from(&mut buf),
        )
        .await
        .unwrap()
        .unwrap();
        assert_eq!(&buf[..len], b"MOTION:test");
    }
}
