use crate::conflict_resolver::ResolutionStrategy;
use crate::error::{Result, SyncError};
use crate::schema::SchemaRegistry;
use bridge_traits::{EntityType, FetchOptions};
use std::collections::HashSet;
use std::time::Duration;

/// Engine tuning for the sync orchestrator and its components.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Period of the auto-refresh timer (incremental sync)
    pub auto_refresh_interval: Duration,

    /// Period of the priority-sync timer
    pub priority_sync_interval: Duration,

    /// Period of the connectivity heartbeat
    pub heartbeat_interval: Duration,

    /// Replays before a queued operation is dropped
    pub max_queue_attempts: u32,

    /// First retry delay; doubles per failed attempt
    pub retry_backoff_base: Duration,

    /// Queue items processed between cooperative yields
    pub drain_chunk_size: usize,

    /// Timestamp window within which critical conflicts fall back to last-write-wins
    pub conflict_tolerance: Duration,

    /// How long synced ledger entries are kept before collection
    pub ledger_retention: Duration,

    /// Strategy used when neither field-level nor last-write-wins applies
    pub default_strategy: ResolutionStrategy,

    /// Separator for label-set fields such as tags
    pub label_separator: String,

    /// Entity types whose conflicts always need a human decision
    pub manual_resolution_types: HashSet<EntityType>,

    /// Forwarded to the data source on bulk fetches
    pub fetch_options: FetchOptions,

    /// Per-type significant fields, comparators and authority
    pub schemas: SchemaRegistry,

    /// Storage key of the durable sync marker
    pub marker_key: String,

    /// Storage key of the persisted offline queue
    pub queue_key: String,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            auto_refresh_interval: Duration::from_secs(5 * 60),
            priority_sync_interval: Duration::from_secs(30),
            heartbeat_interval: Duration::from_secs(15),
            max_queue_attempts: 3,
            retry_backoff_base: Duration::from_millis(100),
            drain_chunk_size: 25,
            conflict_tolerance: Duration::from_secs(5),
            ledger_retention: Duration::from_secs(24 * 60 * 60),
            default_strategy: ResolutionStrategy::FieldLevel,
            label_separator: ";".to_string(),
            manual_resolution_types: HashSet::new(),
            fetch_options: FetchOptions::default(),
            schemas: SchemaRegistry::with_defaults(),
            marker_key: "sync.last_synced_at".to_string(),
            queue_key: "sync.offline_queue".to_string(),
        }
    }
}

impl SyncConfig {
    /// Routes every conflict on `entity_type` to manual resolution.
    pub fn with_manual_resolution(mut self, entity_type: EntityType) -> Self {
        self.manual_resolution_types.insert(entity_type);
        self
    }

    pub fn requires_manual_resolution(&self, entity_type: &EntityType) -> bool {
        self.manual_resolution_types.contains(entity_type)
    }

    pub fn validate(&self) -> Result<()> {
        let intervals = [
            ("auto_refresh_interval", self.auto_refresh_interval),
            ("priority_sync_interval", self.priority_sync_interval),
            ("heartbeat_interval", self.heartbeat_interval),
        ];
        for (name, value) in intervals {
            if value.is_zero() {
                return Err(SyncError::Config(format!("{} must be greater than 0", name)));
            }
        }

        if self.max_queue_attempts < 1 {
            return Err(SyncError::Config(
                "max_queue_attempts must be at least 1".to_string(),
            ));
        }

        if self.drain_chunk_size < 1 {
            return Err(SyncError::Config(
                "drain_chunk_size must be at least 1".to_string(),
            ));
        }

        if self.label_separator.is_empty() {
            return Err(SyncError::Config(
                "label_separator must not be empty".to_string(),
            ));
        }

        if self.default_strategy == ResolutionStrategy::UserPrompt {
            return Err(SyncError::Config(
                "userPrompt cannot be the default strategy; list the entity type in \
                 manual_resolution_types instead"
                    .to_string(),
            ));
        }

        Ok(())
    }
}
