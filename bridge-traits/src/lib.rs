//! # Host Bridge Traits
//!
//! Capability ports that the host supplies to the sync core.
//!
//! ## Overview
//!
//! The sync core never talks to a network, a database, or a UI directly. Each
//! external concern is expressed as a trait here and injected at bootstrap:
//!
//! - [`DataSource`](data_source::DataSource) - Remote work-tracking fetches and writes
//! - [`KeyValueStore`](storage::KeyValueStore) - Durable storage for the sync marker and offline queue
//! - [`NetworkMonitor`](network::NetworkMonitor) - Connectivity signal
//! - [`ChangeNotificationSink`](notification::ChangeNotificationSink) - Presentation-layer intake
//! - [`Clock`](time::Clock) - Time source for deterministic testing
//!
//! The shared value model ([`Entity`](entity::Entity) and friends) also lives
//! here so hosts can implement the ports without depending on the core.
//!
//! ## Fail-Fast Strategy
//!
//! Required ports are checked when the core configuration is built:
//!
//! ```ignore
//! let config = CoreConfig::builder()
//!     .data_source(Arc::new(MyTracker::new()))
//!     .build()?; // Err(CapabilityMissing { capability: "KeyValueStore", .. })
//! ```
//!
//! ## Thread Safety
//!
//! All bridge traits require `Send + Sync` bounds so the core can share them
//! across async tasks.

pub mod data_source;
pub mod entity;
pub mod error;
pub mod network;
pub mod notification;
pub mod storage;
pub mod time;

pub use error::BridgeError;

// Re-export commonly used types
pub use data_source::{DataSource, EntityBatch, FetchOptions, Mutation, MutationKind};
pub use entity::{ChangeKind, Entity, EntityId, EntityKey, EntityType, Fields, Priority};
pub use network::{NetworkInfo, NetworkMonitor, NetworkStatus, NetworkType, StaticNetworkMonitor};
pub use notification::{ChangeNotification, ChangeNotificationSink, NoopNotificationSink};
pub use storage::{KeyValueStore, MemoryKeyValueStore};
pub use time::{Clock, ManualClock, SystemClock};
