//! # Desktop Bridge Implementations
//!
//! Default implementations of the storage and connectivity ports for desktop
//! hosts (macOS, Windows, Linux).
//!
//! ## Overview
//!
//! - `KeyValueStore` using a SQLite-backed table
//! - `NetworkMonitor` using a TCP reachability probe
//!
//! The data source and notification sink are always host-specific and have
//! no desktop default.
//!
//! ## Usage
//!
//! ```ignore
//! use bridge_desktop::{DesktopNetworkMonitor, SqliteKeyValueStore};
//!
//! #[tokio::main]
//! async fn main() {
//!     let store = SqliteKeyValueStore::new("sync.db".into()).await.unwrap();
//!     let monitor = DesktopNetworkMonitor::new();
//!
//!     // Use in core configuration
//! }
//! ```

mod network;
mod settings;

pub use network::DesktopNetworkMonitor;
pub use settings::SqliteKeyValueStore;
