//! # Event Bus System
//!
//! Provides the publish/subscribe surface of the sync engine using `tokio::sync::broadcast`.
//! Observers register interest in a kind of [`SyncEvent`] instead of hooking callbacks
//! into the engine's internals.
//!
//! ## Overview
//!
//! The event bus system consists of:
//! - **Event Types**: [`SyncEvent`] and its [`SyncEventKind`] discriminator
//! - **EventBus**: Central broadcast channel for publishing events
//! - **EventStream**: Wrapper for consuming events with filtering
//! - **EventSubscription**: Handle to a spawned listener task that can be cancelled
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐     emit      ┌───────────┐
//! │ Orchestrator ├──────────────>│           │     subscribe    ┌────────────┐
//! └──────────────┘               │ EventBus  ├─────────────────>│ EventStream│
//!                                │ (broadcast│                  └────────────┘
//! ┌──────────────┐     emit      │  channel) │     on(kind)     ┌────────────┐
//! │ OfflineQueue ├──────────────>│           ├─────────────────>│  Handler   │
//! └──────────────┘               └───────────┘                  └────────────┘
//! ```
//!
//! ## Usage
//!
//! ```rust
//! use core_runtime::events::{EventBus, SyncEvent, SyncEventKind};
//!
//! # #[tokio::main]
//! # async fn main() {
//! let event_bus = EventBus::new(100);
//! let subscription = event_bus.on(SyncEventKind::Error, |event| {
//!     eprintln!("sync failed: {}", event.description());
//! });
//!
//! event_bus
//!     .emit(SyncEvent::Error {
//!         message: "remote unreachable".to_string(),
//!         strategy: Some("full".to_string()),
//!         recoverable: true,
//!     })
//!     .ok();
//!
//! subscription.cancel();
//! # }
//! ```
//!
//! ## Error Handling
//!
//! - **`RecvError::Lagged(n)`**: Subscriber was too slow and missed `n` events.
//!   Non-fatal; listener tasks log and keep going.
//! - **`RecvError::Closed`**: All senders have been dropped. Listener tasks exit.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::warn;

// Re-export commonly used types
pub use tokio::sync::broadcast::error::{RecvError, SendError};
pub use tokio::sync::broadcast::Receiver;

/// Default buffer size for the event bus channel.
///
/// Subscribers that can't keep up will receive `RecvError::Lagged`.
pub const DEFAULT_EVENT_BUFFER_SIZE: usize = 100;

// ============================================================================
// Event Types
// ============================================================================

/// Per-run change counters carried by the strategy events.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct SyncStats {
    pub created: u64,
    pub updated: u64,
    pub deleted: u64,
    /// Updated entities that went through conflict resolution
    pub conflicts: u64,
    /// Entities skipped (malformed, parked for manual resolution)
    pub skipped: u64,
}

impl SyncStats {
    /// Number of changes applied to the snapshot.
    pub fn applied(&self) -> u64 {
        self.created + self.updated + self.deleted
    }
}

/// Events published by the sync engine.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "event")]
pub enum SyncEvent {
    /// A full sync run completed.
    FullSync {
        session_id: String,
        stats: SyncStats,
        duration_ms: u64,
    },
    /// An incremental sync run completed.
    IncrementalSync {
        session_id: String,
        stats: SyncStats,
        duration_ms: u64,
        /// The data source lacked a modified-since query and the run fell
        /// back to a full fetch filtered client-side.
        degraded: bool,
    },
    /// A delta (targeted) sync run completed.
    DeltaSync {
        session_id: String,
        stats: SyncStats,
        duration_ms: u64,
        /// Number of ids requested
        requested: usize,
        /// Run was driven by the high-interest set
        priority: bool,
    },
    /// The engine moved between two statuses.
    StatusChanged { from: String, to: String },
    /// A sync run failed.
    Error {
        message: String,
        /// Strategy of the failed run, if the failure belongs to one
        strategy: Option<String>,
        /// Whether the engine will retry on its own (connectivity failures)
        recoverable: bool,
    },
    /// A queued operation exhausted its attempts and was removed.
    QueueItemDropped {
        item_id: String,
        operation: String,
        attempts: u32,
        last_error: Option<String>,
    },
    /// An entity needs a human-supplied resolution before it syncs again.
    ResolutionRequired {
        entity_type: String,
        entity_id: String,
        fields: Vec<String>,
    },
}

impl SyncEvent {
    pub fn kind(&self) -> SyncEventKind {
        match self {
            SyncEvent::FullSync { .. } => SyncEventKind::FullSync,
            SyncEvent::IncrementalSync { .. } => SyncEventKind::IncrementalSync,
            SyncEvent::DeltaSync { .. } => SyncEventKind::DeltaSync,
            SyncEvent::StatusChanged { .. } => SyncEventKind::StatusChange,
            SyncEvent::Error { .. } => SyncEventKind::Error,
            SyncEvent::QueueItemDropped { .. } => SyncEventKind::QueueItemDropped,
            SyncEvent::ResolutionRequired { .. } => SyncEventKind::ResolutionRequired,
        }
    }

    /// Returns a human-readable description of the event.
    pub fn description(&self) -> &str {
        match self {
            SyncEvent::FullSync { .. } => "Full sync completed",
            SyncEvent::IncrementalSync { degraded: true, .. } => {
                "Incremental sync completed via full fetch"
            }
            SyncEvent::IncrementalSync { .. } => "Incremental sync completed",
            SyncEvent::DeltaSync { priority: true, .. } => "Priority sync completed",
            SyncEvent::DeltaSync { .. } => "Delta sync completed",
            SyncEvent::StatusChanged { .. } => "Sync status changed",
            SyncEvent::Error { .. } => "Sync failed",
            SyncEvent::QueueItemDropped { .. } => "Queued operation permanently dropped",
            SyncEvent::ResolutionRequired { .. } => "Conflict requires manual resolution",
        }
    }

    /// Returns the severity level of the event.
    pub fn severity(&self) -> EventSeverity {
        match self {
            SyncEvent::Error { .. } | SyncEvent::QueueItemDropped { .. } => EventSeverity::Error,
            SyncEvent::ResolutionRequired { .. } => EventSeverity::Warning,
            SyncEvent::IncrementalSync { degraded: true, .. } => EventSeverity::Warning,
            SyncEvent::StatusChanged { .. } => EventSeverity::Debug,
            _ => EventSeverity::Info,
        }
    }
}

/// Discriminator used to register interest in one kind of event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SyncEventKind {
    FullSync,
    IncrementalSync,
    DeltaSync,
    StatusChange,
    Error,
    QueueItemDropped,
    ResolutionRequired,
}

impl SyncEventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncEventKind::FullSync => "fullSync",
            SyncEventKind::IncrementalSync => "incrementalSync",
            SyncEventKind::DeltaSync => "deltaSync",
            SyncEventKind::StatusChange => "statusChange",
            SyncEventKind::Error => "error",
            SyncEventKind::QueueItemDropped => "queueItemDropped",
            SyncEventKind::ResolutionRequired => "resolutionRequired",
        }
    }
}

impl fmt::Display for SyncEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SyncEventKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "fullSync" => Ok(SyncEventKind::FullSync),
            "incrementalSync" => Ok(SyncEventKind::IncrementalSync),
            "deltaSync" => Ok(SyncEventKind::DeltaSync),
            "statusChange" => Ok(SyncEventKind::StatusChange),
            "error" => Ok(SyncEventKind::Error),
            "queueItemDropped" => Ok(SyncEventKind::QueueItemDropped),
            "resolutionRequired" => Ok(SyncEventKind::ResolutionRequired),
            _ => Err(format!("Unknown event kind: {}", s)),
        }
    }
}

/// Event severity levels for filtering and logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum EventSeverity {
    /// Debug-level events (verbose)
    Debug,
    /// Informational events
    Info,
    /// Warning events
    Warning,
    /// Error events
    Error,
}

// ============================================================================
// Event Bus
// ============================================================================

/// Central event bus for broadcasting sync events.
///
/// Cheap to clone; all clones share one channel.
///
/// # Example
///
/// ```rust
/// use core_runtime::events::{EventBus, SyncEvent};
///
/// # #[tokio::main]
/// # async fn main() {
/// let event_bus = EventBus::new(100);
/// let mut subscriber = event_bus.subscribe();
///
/// event_bus
///     .emit(SyncEvent::StatusChanged {
///         from: "idle".to_string(),
///         to: "syncing".to_string(),
///     })
///     .ok();
///
/// assert!(subscriber.recv().await.is_ok());
/// # }
/// ```
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<SyncEvent>,
}

impl EventBus {
    /// Creates a new event bus with the specified buffer size.
    ///
    /// * `capacity` - Maximum number of events to buffer per subscriber.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publishes an event to all subscribers.
    ///
    /// Returns the number of subscribers that received the event, or an
    /// error if there are no active subscribers. Publishers treat the error
    /// as "nobody listening" and ignore it.
    pub fn emit(&self, event: SyncEvent) -> Result<usize, SendError<SyncEvent>> {
        self.sender.send(event)
    }

    /// Creates a new raw subscriber. Past events are not replayed.
    pub fn subscribe(&self) -> Receiver<SyncEvent> {
        self.sender.subscribe()
    }

    /// Creates a filtered stream over future events.
    pub fn stream(&self) -> EventStream {
        EventStream::new(self.subscribe())
    }

    /// Spawns a listener that calls `handler` for every event of `kind`.
    ///
    /// The receiver is registered before this returns, so events emitted
    /// afterwards are never missed. Must be called inside a tokio runtime.
    pub fn on<F>(&self, kind: SyncEventKind, handler: F) -> EventSubscription
    where
        F: Fn(SyncEvent) + Send + Sync + 'static,
    {
        let mut stream = self.stream().filter(move |event| event.kind() == kind);
        let token = CancellationToken::new();
        let child = token.clone();

        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = child.cancelled() => break,
                    received = stream.recv() => match received {
                        Ok(event) => handler(event),
                        Err(RecvError::Lagged(missed)) => {
                            warn!(kind = %kind, missed, "Event listener lagged");
                        }
                        Err(RecvError::Closed) => break,
                    },
                }
            }
        });

        EventSubscription { kind, token, handle }
    }

    /// Returns the number of active subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_BUFFER_SIZE)
    }
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus")
            .field("subscriber_count", &self.subscriber_count())
            .finish()
    }
}

/// Handle to a listener registered with [`EventBus::on`].
///
/// Dropping the handle leaves the listener running; call [`cancel`](Self::cancel)
/// to stop it.
pub struct EventSubscription {
    kind: SyncEventKind,
    token: CancellationToken,
    handle: JoinHandle<()>,
}

impl EventSubscription {
    pub fn kind(&self) -> SyncEventKind {
        self.kind
    }

    /// Stops the listener. Events already being handled finish normally.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Cancels and waits for the listener task to exit.
    pub async fn shutdown(self) {
        self.token.cancel();
        self.handle.await.ok();
    }
}

impl fmt::Debug for EventSubscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventSubscription")
            .field("kind", &self.kind)
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

// ============================================================================
// Event Stream Wrapper
// ============================================================================

/// Type alias for event filter functions.
type EventFilter = Box<dyn Fn(&SyncEvent) -> bool + Send + Sync>;

/// A wrapper around `broadcast::Receiver` with filtering.
///
/// ```rust
/// use core_runtime::events::{EventBus, EventSeverity};
///
/// let event_bus = EventBus::new(100);
/// let failures = event_bus
///     .stream()
///     .filter(|event| event.severity() >= EventSeverity::Error);
/// ```
pub struct EventStream {
    receiver: Receiver<SyncEvent>,
    filter: Option<EventFilter>,
}

impl EventStream {
    /// Creates a new event stream from a receiver.
    pub fn new(receiver: Receiver<SyncEvent>) -> Self {
        Self {
            receiver,
            filter: None,
        }
    }

    /// Adds a filter function to this stream.
    pub fn filter<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&SyncEvent) -> bool + Send + Sync + 'static,
    {
        self.filter = Some(Box::new(predicate));
        self
    }

    fn accepts(&self, event: &SyncEvent) -> bool {
        self.filter.as_ref().map_or(true, |filter| filter(event))
    }

    /// Receives the next event that passes the filter (if any).
    ///
    /// # Errors
    ///
    /// Returns `RecvError::Lagged(n)` if the subscriber fell behind by `n` events.
    /// Returns `RecvError::Closed` if all senders have been dropped.
    pub async fn recv(&mut self) -> Result<SyncEvent, RecvError> {
        loop {
            let event = self.receiver.recv().await?;
            if self.accepts(&event) {
                return Ok(event);
            }
        }
    }

    /// Attempts to receive an event without blocking.
    ///
    /// Returns `None` if no events are currently available.
    pub fn try_recv(&mut self) -> Option<Result<SyncEvent, RecvError>> {
        loop {
            match self.receiver.try_recv() {
                Ok(event) => {
                    if self.accepts(&event) {
                        return Some(Ok(event));
                    }
                }
                Err(broadcast::error::TryRecvError::Empty) => return None,
                Err(broadcast::error::TryRecvError::Lagged(n)) => {
                    return Some(Err(RecvError::Lagged(n)))
                }
                Err(broadcast::error::TryRecvError::Closed) => return Some(Err(RecvError::Closed)),
            }
        }
    }
}

impl fmt::Debug for EventStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventStream")
            .field("has_filter", &self.filter.is_some())
            .finish()
    }
}

// ============================================================================
// Tests
// ============================================================================
