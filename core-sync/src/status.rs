//! # Sync Status State Machine
//!
//! Validated lifecycle of the orchestrator.
//!
//! ## State Machine
//!
//! ```text
//! Idle ──trigger──> Syncing ──success──> Idle
//!   ↑                  ├──failure──> Error ──trigger──> Syncing
//!   │                  └──unreachable──> Offline
//!   │
//!   ├── Idle | Error | Paused ──connectivity lost──> Offline ──reconnect──> Idle
//!   └── Idle <──pause/resume──> Paused
//! ```
//!
//! `Paused → Syncing` is not an edge: a paused engine must be resumed first.
//! A paused engine that goes offline keeps the pause as a pending request and
//! returns to `Paused` on reconnection.

use crate::error::{Result, SyncError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Orchestrator status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncStatus {
    /// Waiting for the next trigger
    Idle,
    /// A strategy run is in flight
    Syncing,
    /// The remote is unreachable; mutations are queued
    Offline,
    /// The last run failed for a non-connectivity reason
    Error,
    /// Triggers are suppressed until resumed
    Paused,
}

impl SyncStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncStatus::Idle => "idle",
            SyncStatus::Syncing => "syncing",
            SyncStatus::Offline => "offline",
            SyncStatus::Error => "error",
            SyncStatus::Paused => "paused",
        }
    }

    /// Whether a sync trigger may start a run from this status.
    pub fn accepts_trigger(&self) -> bool {
        matches!(self, SyncStatus::Idle | SyncStatus::Error)
    }

    /// Whether `self → to` is an edge of the status machine.
    pub fn can_transition_to(&self, to: SyncStatus) -> bool {
        match (self, to) {
            // Triggers
            (SyncStatus::Idle, SyncStatus::Syncing) => true,
            (SyncStatus::Error, SyncStatus::Syncing) => true,

            // Run outcomes
            (SyncStatus::Syncing, SyncStatus::Idle) => true,
            (SyncStatus::Syncing, SyncStatus::Error) => true,
            (SyncStatus::Error, SyncStatus::Idle) => true,

            // Connectivity
            (SyncStatus::Idle, SyncStatus::Offline) => true,
            (SyncStatus::Syncing, SyncStatus::Offline) => true,
            (SyncStatus::Error, SyncStatus::Offline) => true,
            (SyncStatus::Paused, SyncStatus::Offline) => true,
            (SyncStatus::Offline, SyncStatus::Idle) => true,

            // Explicit pause/resume
            (SyncStatus::Idle, SyncStatus::Paused) => true,
            (SyncStatus::Paused, SyncStatus::Idle) => true,

            _ => false,
        }
    }

    pub fn validate_transition(&self, to: SyncStatus) -> Result<()> {
        if self.can_transition_to(to) {
            return Ok(());
        }

        Err(SyncError::InvalidStateTransition {
            from: self.as_str().to_string(),
            to: to.as_str().to_string(),
            reason: format!("Cannot transition from {} to {}", self.as_str(), to.as_str()),
        })
    }
}

impl fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SyncStatus {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "idle" => Ok(SyncStatus::Idle),
            "syncing" => Ok(SyncStatus::Syncing),
            "offline" => Ok(SyncStatus::Offline),
            "error" => Ok(SyncStatus::Error),
            "paused" => Ok(SyncStatus::Paused),
            _ => Err(SyncError::InvalidStateTransition {
                from: s.to_string(),
                to: s.to_string(),
                reason: format!("Unknown sync status: {}", s),
            }),
        }
    }
}

/// Current status plus the bookkeeping that travels with it.
#[derive(Debug, Clone)]
pub struct SyncStateMachine {
    status: SyncStatus,
    entered_at: DateTime<Utc>,
    last_error: Option<String>,
    pause_requested: bool,
}

impl SyncStateMachine {
    pub fn new(initial: SyncStatus, at: DateTime<Utc>) -> Self {
        Self {
            status: initial,
            entered_at: at,
            last_error: None,
            pause_requested: false,
        }
    }

    pub fn status(&self) -> SyncStatus {
        self.status
    }

    pub fn entered_at(&self) -> DateTime<Utc> {
        self.entered_at
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    /// Moves to `to`, returning the previous status.
    ///
    /// Entering `Idle` clears the recorded error; entering `Error` requires
    /// one via [`fail`](Self::fail).
    pub fn transition(&mut self, to: SyncStatus, at: DateTime<Utc>) -> Result<SyncStatus> {
        self.status.validate_transition(to)?;

        let from = self.status;
        self.status = to;
        self.entered_at = at;
        if to == SyncStatus::Idle {
            self.last_error = None;
        }
        Ok(from)
    }

    /// Moves to `to` and records `error` as the latest failure reason.
    pub fn fail(
        &mut self,
        to: SyncStatus,
        error: impl Into<String>,
        at: DateTime<Utc>,
    ) -> Result<SyncStatus> {
        let from = self.transition(to, at)?;
        self.last_error = Some(error.into());
        Ok(from)
    }

    pub fn pause_requested(&self) -> bool {
        self.pause_requested
    }

    pub fn request_pause(&mut self, requested: bool) {
        self.pause_requested = requested;
    }
}
