//! Network Monitoring Implementation

use async_trait::async_trait;
use bridge_traits::{
    error::Result,
    network::{NetworkInfo, NetworkMonitor, NetworkStatus, NetworkType},
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::debug;

const DEFAULT_PROBE_TARGET: &str = "8.8.8.8:53";
const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Desktop network monitor implementation
///
/// Reports connectivity by opening a TCP connection to a probe target. Point
/// the probe at the tracker host to detect "online but remote unreachable".
pub struct DesktopNetworkMonitor {
    probe_target: String,
    probe_timeout: Duration,
    last_status: Arc<Mutex<Option<NetworkStatus>>>,
}

impl DesktopNetworkMonitor {
    /// Create a new network monitor probing a public DNS resolver
    pub fn new() -> Self {
        Self::with_probe(DEFAULT_PROBE_TARGET, DEFAULT_PROBE_TIMEOUT)
    }

    /// Create a monitor probing `target` (`host:port`)
    pub fn with_probe(target: impl Into<String>, timeout: Duration) -> Self {
        Self {
            probe_target: target.into(),
            probe_timeout: timeout,
            last_status: Arc::new(Mutex::new(None)),
        }
    }

    async fn probe(&self) -> NetworkStatus {
        match tokio::time::timeout(
            self.probe_timeout,
            tokio::net::TcpStream::connect(self.probe_target.as_str()),
        )
        .await
        {
            Ok(Ok(_)) => NetworkStatus::Connected,
            Ok(Err(_)) | Err(_) => NetworkStatus::Disconnected,
        }
    }
}

impl Default for DesktopNetworkMonitor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl NetworkMonitor for DesktopNetworkMonitor {
    async fn get_network_info(&self) -> Result<NetworkInfo> {
        let status = self.probe().await;

        let mut last = self.last_status.lock().await;
        if *last != Some(status) {
            debug!(status = ?status, target = %self.probe_target, "Network status changed");
            *last = Some(status);
        }

        Ok(NetworkInfo {
            status,
            // Cannot distinguish Ethernet from WiFi without platform APIs
            network_type: (status == NetworkStatus::Connected).then_some(NetworkType::Other),
            is_metered: false,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_get_network_info() {
        let monitor = DesktopNetworkMonitor::new();
        let info = monitor.get_network_info().await.unwrap();

        assert!(matches!(
            info.status,
            NetworkStatus::Connected | NetworkStatus::Disconnected | NetworkStatus::Indeterminate
        ));
    }

    #[tokio::test]
    async fn test_unreachable_probe_reports_disconnected() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let monitor = DesktopNetworkMonitor::with_probe(addr.to_string(), Duration::from_millis(500));
        assert!(!monitor.is_connected().await);
    }

    #[tokio::test]
    async fn test_reachable_probe_reports_connected() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let monitor = DesktopNetworkMonitor::with_probe(addr.to_string(), Duration::from_secs(1));
        assert!(monitor.is_connected().await);
    }
}
