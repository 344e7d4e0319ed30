//! # Offline Queue
//!
//! Durable, priority-ordered queue of operations that could not be sent to the
//! remote while it was unreachable.
//!
//! ## Ordering
//!
//! Items are kept sorted by `(priority, sequence)`: lower priority values are
//! served first and insertion order breaks ties. The whole queue is written
//! to the [`KeyValueStore`] after every change so it survives a restart.
//!
//! ## Item Lifecycle
//!
//! ```text
//! Pending ──success──> Removed
//!    │
//!    ├──failure, attempts < max──> Pending (backoff, retried in place)
//!    └──failure, attempts == max──> Dropped (logged + QueueItemDropped event)
//! ```
//!
//! A failure classified as connectivity loss flips the queue offline and
//! stops the drain without consuming an attempt.

use crate::config::SyncConfig;
use crate::error::{Result, SyncError};
use crate::session::SyncRequest;
use async_trait::async_trait;
use bridge_traits::{Clock, EntityKey, KeyValueStore, Mutation, MutationKind, Priority};
use chrono::{DateTime, Utc};
use core_runtime::events::{EventBus, SyncEvent};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Type-safe queue item identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct QueueItemId(Uuid);

impl QueueItemId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for QueueItemId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for QueueItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Work deferred until the remote is reachable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum QueueOperation {
    /// A local edit to send to the data source
    Mutation { mutation: Mutation },
    /// A sync run that failed for lack of connectivity
    RetrySync { request: SyncRequest },
}

impl QueueOperation {
    pub fn describe(&self) -> String {
        match self {
            QueueOperation::Mutation { mutation } => {
                let verb = match mutation.kind {
                    MutationKind::Create => "create",
                    MutationKind::Update => "update",
                    MutationKind::Delete => "delete",
                };
                format!("{} {}", verb, mutation.key())
            }
            QueueOperation::RetrySync { request } => {
                format!("retry {} sync", request.strategy())
            }
        }
    }

    /// Entity the operation writes, if any.
    pub fn target(&self) -> Option<EntityKey> {
        match self {
            QueueOperation::Mutation { mutation } => Some(mutation.key()),
            QueueOperation::RetrySync { .. } => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueItem {
    pub id: QueueItemId,
    pub operation: QueueOperation,
    pub enqueued_at: DateTime<Utc>,
    pub attempts: u32,
    pub priority: Priority,
    /// Insertion order; tiebreak among equal priorities
    pub sequence: u64,
    pub last_error: Option<String>,
}

impl QueueItem {
    /// Delay before the next replay: `base * 2^(attempts - 1)`.
    pub fn next_retry_delay(&self, base: Duration) -> Duration {
        let exponent = self.attempts.saturating_sub(1).min(16);
        base.saturating_mul(2u32.pow(exponent))
    }
}

/// Replays queued operations against the remote.
#[async_trait]
pub trait OperationExecutor: Send + Sync {
    async fn execute(&self, operation: &QueueOperation) -> Result<()>;
}

/// Read-only snapshot for diagnostics.
#[derive(Debug, Clone, PartialEq)]
pub struct QueueStatus {
    pub online: bool,
    pub length: usize,
    pub items: Vec<QueueItem>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct DrainReport {
    pub processed: Vec<QueueItemId>,
    /// Failed attempts that left the item queued
    pub retried: u32,
    pub dropped: Vec<QueueItem>,
}

#[derive(Debug, Clone)]
pub struct QueueSettings {
    pub max_attempts: u32,
    pub backoff_base: Duration,
    pub chunk_size: usize,
    pub storage_key: String,
}

impl From<&SyncConfig> for QueueSettings {
    fn from(config: &SyncConfig) -> Self {
        Self {
            max_attempts: config.max_queue_attempts,
            backoff_base: config.retry_backoff_base,
            chunk_size: config.drain_chunk_size,
            storage_key: config.queue_key.clone(),
        }
    }
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self::from(&SyncConfig::default())
    }
}

struct QueueState {
    items: Vec<QueueItem>,
    online: bool,
    next_sequence: u64,
}

impl QueueState {
    fn sort(&mut self) {
        sort_items(&mut self.items);
    }

    fn position(&self, id: QueueItemId) -> Option<usize> {
        self.items.iter().position(|item| item.id == id)
    }
}

fn sort_items(items: &mut [QueueItem]) {
    items.sort_by_key(|item| (item.priority, item.sequence));
}

pub struct OfflineQueue {
    state: Mutex<QueueState>,
    drain_lock: Mutex<()>,
    store: Arc<dyn KeyValueStore>,
    executor: Arc<dyn OperationExecutor>,
    event_bus: EventBus,
    clock: Arc<dyn Clock>,
    settings: QueueSettings,
}

impl OfflineQueue {
    /// Restores the persisted queue. The queue starts offline; the owner
    /// flips it with [`set_online`](Self::set_online) once connectivity is known.
    pub async fn load(
        store: Arc<dyn KeyValueStore>,
        executor: Arc<dyn OperationExecutor>,
        event_bus: EventBus,
        clock: Arc<dyn Clock>,
        settings: QueueSettings,
    ) -> Result<Self> {
        let items: Vec<QueueItem> = match store.get(&settings.storage_key).await? {
            Some(raw) => match serde_json::from_str(&raw) {
                Ok(items) => items,
                Err(e) => {
                    warn!(error = %e, "Discarding unreadable offline queue");
                    Vec::new()
                }
            },
            None => Vec::new(),
        };

        let next_sequence = items.iter().map(|item| item.sequence + 1).max().unwrap_or(0);
        let mut state = QueueState {
            items,
            online: false,
            next_sequence,
        };
        state.sort();

        if !state.items.is_empty() {
            info!(length = state.items.len(), "Restored offline queue");
        }

        Ok(Self {
            state: Mutex::new(state),
            drain_lock: Mutex::new(()),
            store,
            executor,
            event_bus,
            clock,
            settings,
        })
    }

    /// Adds an operation and persists the queue.
    ///
    /// An error means nothing was queued. Once the item is stored the call
    /// succeeds; when online a drain starts right away unless one is already
    /// running, and drain failures are logged rather than returned.
    pub async fn enqueue(&self, operation: QueueOperation, priority: Priority) -> Result<QueueItemId> {
        let id = QueueItemId::new();
        let online = {
            let mut state = self.state.lock().await;
            let item = QueueItem {
                id,
                operation,
                enqueued_at: self.clock.now(),
                attempts: 0,
                priority,
                sequence: state.next_sequence,
                last_error: None,
            };
            let description = item.operation.describe();

            let mut items = state.items.clone();
            items.push(item);
            sort_items(&mut items);
            self.persist(&items).await?;

            state.items = items;
            state.next_sequence += 1;
            debug!(item_id = %id, operation = %description, ?priority, "Enqueued operation");
            state.online
        };

        if online {
            if let Ok(guard) = self.drain_lock.try_lock() {
                if let Err(e) = self.drain_locked(guard).await {
                    warn!(item_id = %id, error = %e, "Offline queue drain failed");
                }
            }
        }

        Ok(id)
    }

    /// Replays items in order while online.
    pub async fn drain(&self) -> Result<DrainReport> {
        let guard = self.drain_lock.lock().await;
        self.drain_locked(guard).await
    }

    async fn drain_locked(&self, guard: tokio::sync::MutexGuard<'_, ()>) -> Result<DrainReport> {
        let mut report = DrainReport::default();
        let mut since_yield = 0usize;

        loop {
            let head = {
                let state = self.state.lock().await;
                match state.items.first().filter(|_| state.online) {
                    Some(item) => item.clone(),
                    None => {
                        // Released under the state lock: an enqueue that lands
                        // after this check always finds the drain lock free.
                        drop(guard);
                        break;
                    }
                }
            };

            match self.executor.execute(&head.operation).await {
                Ok(()) => {
                    let mut state = self.state.lock().await;
                    if let Some(index) = state.position(head.id) {
                        // The remote already has it, so it leaves the live
                        // queue even when the write below fails.
                        state.items.remove(index);
                        self.persist(&state.items).await?;
                    }
                    debug!(item_id = %head.id, "Replayed queued operation");
                    report.processed.push(head.id);
                }
                Err(err) if err.is_connectivity() => {
                    let mut state = self.state.lock().await;
                    state.online = false;
                    if let Some(index) = state.position(head.id) {
                        let mut items = state.items.clone();
                        items[index].last_error = Some(err.to_string());
                        self.persist(&items).await?;
                        state.items = items;
                    }
                    warn!(item_id = %head.id, error = %err, "Lost connectivity while draining");
                    break;
                }
                Err(err) => {
                    let updated = {
                        let mut state = self.state.lock().await;
                        let Some(index) = state.position(head.id) else {
                            continue;
                        };
                        let mut items = state.items.clone();
                        let item = &mut items[index];
                        item.attempts += 1;
                        item.last_error = Some(err.to_string());
                        let updated = item.clone();
                        if updated.attempts >= self.settings.max_attempts {
                            items.remove(index);
                        }
                        self.persist(&items).await?;
                        state.items = items;
                        updated
                    };

                    if updated.attempts >= self.settings.max_attempts {
                        self.report_dropped(&updated);
                        report.dropped.push(updated);
                    } else {
                        report.retried += 1;
                        let delay = updated.next_retry_delay(self.settings.backoff_base);
                        debug!(
                            item_id = %updated.id,
                            attempts = updated.attempts,
                            delay_ms = delay.as_millis() as u64,
                            "Queued operation failed, retrying"
                        );
                        tokio::time::sleep(delay).await;
                    }
                }
            }

            since_yield += 1;
            if since_yield >= self.settings.chunk_size {
                since_yield = 0;
                tokio::task::yield_now().await;
            }
        }

        if !report.processed.is_empty() || !report.dropped.is_empty() {
            info!(
                processed = report.processed.len(),
                retried = report.retried,
                dropped = report.dropped.len(),
                "Offline queue drained"
            );
        }

        Ok(report)
    }

    fn report_dropped(&self, item: &QueueItem) {
        let exhausted = SyncError::QueueExhausted {
            item_id: item.id.to_string(),
            attempts: item.attempts,
            last_error: item.last_error.clone().unwrap_or_default(),
        };
        warn!(operation = %item.operation.describe(), error = %exhausted, "Dropping queued operation");

        self.event_bus
            .emit(SyncEvent::QueueItemDropped {
                item_id: item.id.to_string(),
                operation: item.operation.describe(),
                attempts: item.attempts,
                last_error: item.last_error.clone(),
            })
            .ok();
    }

    /// Updates the connectivity flag; going online drains immediately.
    pub async fn set_online(&self, online: bool) -> Result<Option<DrainReport>> {
        let was_online = {
            let mut state = self.state.lock().await;
            std::mem::replace(&mut state.online, online)
        };

        if online && !was_online {
            debug!("Offline queue back online");
            return self.drain().await.map(Some);
        }
        if !online && was_online {
            debug!("Offline queue paused for connectivity loss");
        }
        Ok(None)
    }

    pub async fn is_online(&self) -> bool {
        self.state.lock().await.online
    }

    pub async fn status(&self) -> QueueStatus {
        let state = self.state.lock().await;
        QueueStatus {
            online: state.online,
            length: state.items.len(),
            items: state.items.clone(),
        }
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.items.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.state.lock().await.items.is_empty()
    }

    /// Whether a mutation for `key` is still waiting to be sent.
    pub async fn has_pending_for(&self, key: &EntityKey) -> bool {
        self.state
            .lock()
            .await
            .items
            .iter()
            .any(|item| item.operation.target().as_ref() == Some(key))
    }

    /// Entities with queued mutations.
    pub async fn pending_keys(&self) -> HashSet<EntityKey> {
        self.state
            .lock()
            .await
            .items
            .iter()
            .filter_map(|item| item.operation.target())
            .collect()
    }

    async fn persist(&self, items: &[QueueItem]) -> Result<()> {
        let json = serde_json::to_string(items)?;
        self.store
            .set(&self.settings.storage_key, &json)
            .await
            .map_err(|e| SyncError::Storage(format!("Failed to persist offline queue: {}", e)))
    }
}
