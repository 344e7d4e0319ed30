//! Durable Key-Value Storage Abstraction
//!
//! Narrow persistence port used for the sync marker and the offline queue.
//! Backends (SQLite, browser storage, remote KV) must survive process restart.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;

use crate::error::{BridgeError, Result};

/// Key-value storage trait
///
/// Values are opaque strings; callers serialize structured records themselves.
///
/// # Example
///
/// ```ignore
/// use bridge_traits::storage::KeyValueStore;
///
/// async fn remember(store: &dyn KeyValueStore) -> Result<()> {
///     store.set("sync.last_synced_at", "2024-03-01T12:00:00Z").await
/// }
/// ```
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Read the value stored under `key`.
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Store `value` under `key`, replacing any previous value.
    async fn set(&self, key: &str, value: &str) -> Result<()>;

    /// Remove `key`. Removing a missing key is not an error.
    async fn delete(&self, key: &str) -> Result<()>;

    /// Check whether a key exists
    async fn has_key(&self, key: &str) -> Result<bool> {
        Ok(self.get(key).await?.is_some())
    }
}

/// Process-local store. Survives as long as the value is shared, which is
/// enough to simulate a restart in tests by rebuilding components around it.
#[derive(Debug, Default)]
pub struct MemoryKeyValueStore {
    data: Mutex<HashMap<String, String>>,
}

impl MemoryKeyValueStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.data.lock().map(|data| data.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn poisoned() -> BridgeError {
        BridgeError::OperationFailed("memory store lock poisoned".to_string())
    }
}

#[async_trait]
impl KeyValueStore for MemoryKeyValueStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let data = self.data.lock().map_err(|_| Self::poisoned())?;
        Ok(data.get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        let mut data = self.data.lock().map_err(|_| Self::poisoned())?;
        data.insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut data = self.data.lock().map_err(|_| Self::poisoned())?;
        data.remove(key);
        Ok(())
    }
}
