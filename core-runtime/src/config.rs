//! # Core Configuration Module
//!
//! Provides configuration management for the sync engine.
//!
//! ## Overview
//!
//! The configuration system uses a builder pattern to construct a `CoreConfig`
//! instance holding every host capability the engine needs. It fails fast when
//! a required capability is missing instead of discovering it mid-sync.
//!
//! ## Required Dependencies
//!
//! - `DataSource` - Remote work-tracking fetches
//! - `KeyValueStore` - Durable storage for the sync marker and offline queue
//!
//! ## Optional Dependencies (with defaults)
//!
//! - `NetworkMonitor` - Connectivity signal (default: always connected)
//! - `ChangeNotificationSink` - Presentation-layer intake (default: discard)
//! - `Clock` - Time source (default: system clock)
//!
//! ## Usage
//!
//! ```ignore
//! use core_runtime::config::CoreConfig;
//! use std::sync::Arc;
//!
//! let config = CoreConfig::builder()
//!     .data_source(Arc::new(MyTrackerClient::new()))
//!     .key_value_store(Arc::new(MyStore::open()?))
//!     .notification_sink(Arc::new(MyDashboard::new()))
//!     .enable_scheduler(true)
//!     .build()?;
//! ```
//!
//! ## Error Handling
//!
//! ```should_panic
//! use core_runtime::config::CoreConfig;
//!
//! // Missing data source and key-value store
//! let config = CoreConfig::builder()
//!     .build()
//!     .expect("Should fail - missing required bridges");
//! ```

use crate::error::{Error, Result};
use crate::events::DEFAULT_EVENT_BUFFER_SIZE;
use bridge_traits::{
    ChangeNotificationSink, Clock, DataSource, KeyValueStore, NetworkMonitor,
    NoopNotificationSink, StaticNetworkMonitor, SystemClock,
};
use std::sync::Arc;

/// Core configuration for the sync engine.
///
/// Use [`CoreConfigBuilder`] to construct instances.
#[derive(Clone)]
pub struct CoreConfig {
    /// Remote data source (required)
    pub data_source: Arc<dyn DataSource>,

    /// Durable key-value storage (required)
    pub key_value_store: Arc<dyn KeyValueStore>,

    /// Connectivity signal
    pub network_monitor: Arc<dyn NetworkMonitor>,

    /// Receives one notification per applied change
    pub notification_sink: Arc<dyn ChangeNotificationSink>,

    /// Time source
    pub clock: Arc<dyn Clock>,

    /// Per-subscriber buffer of the event bus
    pub event_buffer_size: usize,

    /// Features flags
    pub features: FeatureFlags,

    /// Whether the host supplied its own network monitor
    has_network_monitor: bool,
}

impl std::fmt::Debug for CoreConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CoreConfig")
            .field("data_source", &"DataSource { ... }")
            .field("key_value_store", &"KeyValueStore { ... }")
            .field(
                "network_monitor",
                &if self.has_network_monitor {
                    "NetworkMonitor { ... }"
                } else {
                    "StaticNetworkMonitor { online }"
                },
            )
            .field("notification_sink", &"ChangeNotificationSink { ... }")
            .field("event_buffer_size", &self.event_buffer_size)
            .field("features", &self.features)
            .finish()
    }
}

/// Feature flags control optional functionality.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FeatureFlags {
    /// Run the auto-refresh, priority, and heartbeat timers
    pub enable_scheduler: bool,

    /// Run the priority-sync timer over high-interest ids
    pub enable_priority_sync: bool,

    /// Poll connectivity on the heartbeat (requires NetworkMonitor)
    pub enable_network_awareness: bool,
}

impl CoreConfig {
    /// Creates a new builder for constructing a `CoreConfig`.
    pub fn builder() -> CoreConfigBuilder {
        CoreConfigBuilder::default()
    }

    /// Whether the network monitor was injected rather than defaulted.
    pub fn has_network_monitor(&self) -> bool {
        self.has_network_monitor
    }

    /// Validates the configuration and returns an error if invalid.
    ///
    /// This checks:
    /// - Event buffer size is non-zero
    /// - Feature flags are consistent with available bridges
    pub fn validate(&self) -> Result<()> {
        if self.event_buffer_size == 0 {
            return Err(Error::Config(
                "Event buffer size must be greater than 0".to_string(),
            ));
        }

        if self.features.enable_network_awareness && !self.has_network_monitor {
            return Err(Error::Config(
                "Network awareness enabled but no NetworkMonitor provided. \
                 Disable the feature or inject a NetworkMonitor implementation."
                    .to_string(),
            ));
        }

        if self.features.enable_priority_sync && !self.features.enable_scheduler {
            return Err(Error::Config(
                "Priority sync enabled but the scheduler is disabled. \
                 Enable the scheduler or disable priority sync."
                    .to_string(),
            ));
        }

        Ok(())
    }
}

fn data_source_missing_error() -> Error {
    Error::CapabilityMissing {
        capability: "DataSource".to_string(),
        message: "DataSource implementation is required to fetch work items. \
                 Inject an adapter for the remote tracker's API."
            .to_string(),
    }
}

fn key_value_store_missing_error() -> Error {
    Error::CapabilityMissing {
        capability: "KeyValueStore".to_string(),
        message: "KeyValueStore implementation is required for the sync marker and offline queue. \
                 Desktop: use bridge_desktop::SqliteKeyValueStore. \
                 Web: inject a localStorage/IndexedDB-backed store."
            .to_string(),
    }
}

/// Builder for constructing [`CoreConfig`] instances.
#[derive(Default)]
pub struct CoreConfigBuilder {
    data_source: Option<Arc<dyn DataSource>>,
    key_value_store: Option<Arc<dyn KeyValueStore>>,
    network_monitor: Option<Arc<dyn NetworkMonitor>>,
    notification_sink: Option<Arc<dyn ChangeNotificationSink>>,
    clock: Option<Arc<dyn Clock>>,
    event_buffer_size: Option<usize>,
    features: FeatureFlags,
}

impl CoreConfigBuilder {
    /// Sets the remote data source (required).
    pub fn data_source(mut self, source: Arc<dyn DataSource>) -> Self {
        self.data_source = Some(source);
        self
    }

    /// Sets the durable key-value store (required).
    pub fn key_value_store(mut self, store: Arc<dyn KeyValueStore>) -> Self {
        self.key_value_store = Some(store);
        self
    }

    /// Sets the network monitor implementation (optional).
    pub fn network_monitor(mut self, monitor: Arc<dyn NetworkMonitor>) -> Self {
        self.network_monitor = Some(monitor);
        self
    }

    /// Sets the change notification sink (optional).
    pub fn notification_sink(mut self, sink: Arc<dyn ChangeNotificationSink>) -> Self {
        self.notification_sink = Some(sink);
        self
    }

    /// Sets the time source (optional).
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn event_buffer_size(mut self, size: usize) -> Self {
        self.event_buffer_size = Some(size);
        self
    }

    pub fn enable_scheduler(mut self, enabled: bool) -> Self {
        self.features.enable_scheduler = enabled;
        self
    }

    pub fn enable_priority_sync(mut self, enabled: bool) -> Self {
        self.features.enable_priority_sync = enabled;
        self
    }

    pub fn enable_network_awareness(mut self, enabled: bool) -> Self {
        self.features.enable_network_awareness = enabled;
        self
    }

    /// Replaces all feature flags at once.
    pub fn features(mut self, features: FeatureFlags) -> Self {
        self.features = features;
        self
    }

    /// Builds the final `CoreConfig` instance.
    ///
    /// Returns an error with an actionable message if a required capability
    /// is missing or the feature flags are inconsistent.
    pub fn build(self) -> Result<CoreConfig> {
        let data_source = self.data_source.ok_or_else(data_source_missing_error)?;
        let key_value_store = self
            .key_value_store
            .ok_or_else(key_value_store_missing_error)?;

        let has_network_monitor = self.network_monitor.is_some();
        let network_monitor = self
            .network_monitor
            .unwrap_or_else(|| Arc::new(StaticNetworkMonitor::always_online()));

        let config = CoreConfig {
            data_source,
            key_value_store,
            network_monitor,
            notification_sink: self
                .notification_sink
                .unwrap_or_else(|| Arc::new(NoopNotificationSink)),
            clock: self.clock.unwrap_or_else(|| Arc::new(SystemClock)),
            event_buffer_size: self.event_buffer_size.unwrap_or(DEFAULT_EVENT_BUFFER_SIZE),
            features: self.features,
            has_network_monitor,
        };

        config.validate()?;

        Ok(config)
    }
}
