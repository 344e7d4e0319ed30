//! # Sync Sessions
//!
//! One [`SyncSession`] exists per orchestrator run. It collects the change
//! records applied by that run and is turned into a [`SyncReport`] once the
//! run finishes; nothing here is persisted.

use crate::change_tracker::ChangeRecord;
use crate::error::{Result, SyncError};
use bridge_traits::{ChangeKind, EntityId};
use chrono::{DateTime, Utc};
pub use core_runtime::events::SyncStats;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

// ============================================================================
// Strategies
// ============================================================================

/// How a run decides what to fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncStrategy {
    /// Whole dataset, diffed wholesale
    Full,
    /// Entities modified after the sync marker
    Incremental,
    /// Caller-supplied ids
    Delta,
    /// Delta over the high-interest ids
    Priority,
}

impl SyncStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncStrategy::Full => "full",
            SyncStrategy::Incremental => "incremental",
            SyncStrategy::Delta => "delta",
            SyncStrategy::Priority => "priority",
        }
    }

    /// Only runs that see the whole dataset (or everything since the marker)
    /// may move the marker forward.
    pub fn advances_marker(&self) -> bool {
        matches!(self, SyncStrategy::Full | SyncStrategy::Incremental)
    }
}

impl fmt::Display for SyncStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SyncStrategy {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "full" => Ok(SyncStrategy::Full),
            "incremental" => Ok(SyncStrategy::Incremental),
            "delta" => Ok(SyncStrategy::Delta),
            "priority" => Ok(SyncStrategy::Priority),
            _ => Err(SyncError::InvalidStrategy(s.to_string())),
        }
    }
}

/// A request to run one strategy, with the ids a delta run needs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "strategy", rename_all = "lowercase")]
pub enum SyncRequest {
    Full,
    Incremental,
    Delta { ids: Vec<EntityId> },
    Priority,
}

impl SyncRequest {
    pub fn strategy(&self) -> SyncStrategy {
        match self {
            SyncRequest::Full => SyncStrategy::Full,
            SyncRequest::Incremental => SyncStrategy::Incremental,
            SyncRequest::Delta { .. } => SyncStrategy::Delta,
            SyncRequest::Priority => SyncStrategy::Priority,
        }
    }
}

// ============================================================================
// Session
// ============================================================================

/// Unique identifier for a sync session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SyncSessionId(Uuid);

impl SyncSessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SyncSessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SyncSessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Transient state of one run.
#[derive(Debug, Clone)]
pub struct SyncSession {
    pub id: SyncSessionId,
    pub started_at: DateTime<Utc>,
    pub strategy: SyncStrategy,
    pub changes: Vec<ChangeRecord>,
    pub stats: SyncStats,
    /// Incremental run served by a full fetch
    pub degraded: bool,
}

impl SyncSession {
    pub fn new(strategy: SyncStrategy, started_at: DateTime<Utc>) -> Self {
        Self {
            id: SyncSessionId::new(),
            started_at,
            strategy,
            changes: Vec::new(),
            stats: SyncStats::default(),
            degraded: false,
        }
    }

    /// Records an applied change.
    pub fn record(&mut self, change: ChangeRecord) {
        match change.kind {
            ChangeKind::Created => self.stats.created += 1,
            ChangeKind::Updated => self.stats.updated += 1,
            ChangeKind::Deleted => self.stats.deleted += 1,
        }
        self.changes.push(change);
    }

    pub fn record_conflict(&mut self) {
        self.stats.conflicts += 1;
    }

    pub fn record_skip(&mut self) {
        self.stats.skipped += 1;
    }

    pub fn finish(self, finished_at: DateTime<Utc>) -> SyncReport {
        SyncReport {
            session_id: self.id,
            strategy: self.strategy,
            started_at: self.started_at,
            finished_at,
            stats: self.stats,
            degraded: self.degraded,
            changes: self.changes,
        }
    }
}

/// Result of a completed run.
#[derive(Debug, Clone)]
pub struct SyncReport {
    pub session_id: SyncSessionId,
    pub strategy: SyncStrategy,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub stats: SyncStats,
    pub degraded: bool,
    pub changes: Vec<ChangeRecord>,
}

impl SyncReport {
    pub fn duration_ms(&self) -> u64 {
        (self.finished_at - self.started_at)
            .num_milliseconds()
            .max(0) as u64
    }
}

/// Why a trigger did not start a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    AlreadySyncing,
    Paused,
    Offline,
    /// Priority run with an empty interest set
    NothingToSync,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            SkipReason::AlreadySyncing => "a sync is already running",
            SkipReason::Paused => "sync is paused",
            SkipReason::Offline => "remote is unreachable",
            SkipReason::NothingToSync => "no items of interest",
        };
        f.write_str(text)
    }
}

/// What happened to a sync trigger.
///
/// Run-level failures are values, not errors: the orchestrator has already
/// converged to `Error` or `Offline` when `Failed` is returned.
#[derive(Debug, Clone)]
pub enum SyncOutcome {
    Completed(SyncReport),
    Skipped(SkipReason),
    Failed { error: String, offline: bool },
}

impl SyncOutcome {
    pub fn is_completed(&self) -> bool {
        matches!(self, SyncOutcome::Completed(_))
    }

    pub fn report(&self) -> Option<&SyncReport> {
        match self {
            SyncOutcome::Completed(report) => Some(report),
            _ => None,
        }
    }
}
