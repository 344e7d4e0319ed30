//! Network Monitoring Abstraction
//!
//! Provides the connectivity signal the sync core polls on its heartbeat.

use async_trait::async_trait;

use crate::error::Result;

/// Network connection type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkType {
    /// Cellular/mobile data connection
    Cellular,
    /// WiFi connection
    WiFi,
    /// Ethernet connection
    Ethernet,
    /// Other or unknown connection type
    Other,
}

/// Network connection status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkStatus {
    /// Connected to network
    Connected,
    /// Not connected to any network
    Disconnected,
    /// Connection status unknown or indeterminate
    Indeterminate,
}

/// Network information
#[derive(Debug, Clone)]
pub struct NetworkInfo {
    pub status: NetworkStatus,
    pub network_type: Option<NetworkType>,
    /// Whether the connection is metered (has data limits/costs)
    pub is_metered: bool,
}

impl NetworkInfo {
    pub fn connected(network_type: NetworkType) -> Self {
        Self {
            status: NetworkStatus::Connected,
            network_type: Some(network_type),
            is_metered: false,
        }
    }

    pub fn disconnected() -> Self {
        Self {
            status: NetworkStatus::Disconnected,
            network_type: None,
            is_metered: false,
        }
    }
}

/// Network monitor trait
///
/// Lets the core:
/// - Move to the `Offline` state when the remote cannot be reached
/// - Hold mutations in the offline queue until connectivity returns
/// - Classify fetch failures as connectivity-related
///
/// # Platform Support
///
/// - **Desktop**: TCP reachability probe (`bridge-desktop`)
/// - **Web**: `navigator.onLine` and online/offline events
#[async_trait]
pub trait NetworkMonitor: Send + Sync {
    /// Get current network information
    async fn get_network_info(&self) -> Result<NetworkInfo>;

    /// Check if currently connected to any network
    async fn is_connected(&self) -> bool {
        matches!(
            self.get_network_info().await,
            Ok(NetworkInfo {
                status: NetworkStatus::Connected,
                ..
            })
        )
    }
}

/// Monitor reporting a fixed status. Used when the host has no connectivity
/// signal; the core then relies on fetch failures alone.
#[derive(Debug, Clone)]
pub struct StaticNetworkMonitor {
    info: NetworkInfo,
}

impl StaticNetworkMonitor {
    pub fn always_online() -> Self {
        Self {
            info: NetworkInfo::connected(NetworkType::Other),
        }
    }

    pub fn always_offline() -> Self {
        Self {
            info: NetworkInfo::disconnected(),
        }
    }
}

#[async_trait]
impl NetworkMonitor for StaticNetworkMonitor {
    async fn get_network_info(&self) -> Result<NetworkInfo> {
        Ok(self.info.clone())
    }
}
