//! # Sync & Conflict Resolution Module
//!
//! Keeps a local snapshot of work-tracking entities consistent with a remote
//! data source.
//!
//! ## Overview
//!
//! This module manages the sync lifecycle, including:
//! - Fetching entities per strategy (full, incremental, delta, priority)
//! - Detecting created, updated and deleted entities against the snapshot
//! - Merging concurrent local and remote edits field by field
//! - Queueing local mutations while offline and replaying them in priority order
//! - Publishing lifecycle events and batched change notifications
//!
//! ## Components
//!
//! - **Change Tracker** (`change_tracker`): Diffing, change ledger and the durable sync marker
//! - **Conflict Resolver** (`conflict_resolver`): Field-level, last-write-wins and manual strategies
//! - **Offline Queue** (`offline_queue`): Persisted, prioritized replay with bounded retries
//! - **Status Machine** (`status`): Validated transitions between idle, syncing, offline, error and paused
//! - **Sync Orchestrator** (`orchestrator`): Strategy runs, connectivity handling and local edits
//! - **Scheduler** (`scheduler`): Auto-refresh, priority and heartbeat timers

pub mod change_tracker;
pub mod config;
pub mod conflict_resolver;
pub mod error;
pub mod offline_queue;
pub mod orchestrator;
pub mod scheduler;
pub mod schema;
pub mod session;
pub mod status;

pub use change_tracker::{ChangePayload, ChangeRecord, ChangeTracker, FieldChange, FieldDiff};
pub use config::SyncConfig;
pub use conflict_resolver::{
    ConflictKind, ConflictResolution, ConflictResolver, FieldConflict, FieldRule,
    ResolutionStrategy,
};
pub use error::{Result, SyncError};
pub use offline_queue::{
    DrainReport, OfflineQueue, OperationExecutor, QueueItem, QueueItemId, QueueOperation,
    QueueSettings, QueueStatus,
};
pub use orchestrator::{StatusSnapshot, SyncOrchestrator};
pub use scheduler::{SchedulerSettings, SyncScheduler};
pub use schema::{EntitySchema, FieldAuthority, FieldComparator, SchemaRegistry};
pub use session::{
    SkipReason, SyncOutcome, SyncReport, SyncRequest, SyncSession, SyncSessionId, SyncStats,
    SyncStrategy,
};
pub use status::{SyncStateMachine, SyncStatus};
