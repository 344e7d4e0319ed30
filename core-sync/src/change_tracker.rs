//! # Change Tracker
//!
//! Detects what changed between two snapshots of one entity type and keeps
//! the ledger of changes that have not yet been confirmed as synchronized.
//!
//! ## Overview
//!
//! - [`ChangeTracker::detect_changes`] is a three-way set comparison over
//!   id-keyed maps: ids only in the current snapshot are `Created`, ids only in
//!   the previous one are `Deleted`, and shared ids are `Updated` when
//!   [`ChangeTracker::has_changed`] says so.
//! - The ledger holds at most one record per `(entity type, id)`; a later
//!   record replaces the earlier one.
//! - The durable sync marker is the RFC 3339 timestamp of the last successful
//!   full or incremental run, persisted through the [`KeyValueStore`].
//!
//! Synced records are evicted by [`ChangeTracker::collect_garbage`] once they
//! are older than the retention window. Unsynced records only leave the
//! ledger through [`ChangeTracker::drop_change`].

use crate::config::SyncConfig;
use crate::error::{Result, SyncError};
use crate::schema::SchemaRegistry;
use bridge_traits::{ChangeKind, Clock, Entity, EntityId, EntityKey, EntityType, KeyValueStore};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

// ============================================================================
// Records
// ============================================================================

/// One field's transition between two versions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldChange {
    pub from: Option<Value>,
    pub to: Option<Value>,
}

pub type FieldDiff = BTreeMap<String, FieldChange>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum ChangePayload {
    Created {
        entity: Entity,
    },
    Updated {
        current: Entity,
        previous: Entity,
        #[serde(rename = "fieldDiff")]
        field_diff: FieldDiff,
    },
    Deleted {
        previous: Entity,
    },
}

impl ChangePayload {
    /// Latest known version, or `None` for a deletion.
    pub fn current(&self) -> Option<&Entity> {
        match self {
            ChangePayload::Created { entity } => Some(entity),
            ChangePayload::Updated { current, .. } => Some(current),
            ChangePayload::Deleted { .. } => None,
        }
    }

    pub fn kind(&self) -> ChangeKind {
        match self {
            ChangePayload::Created { .. } => ChangeKind::Created,
            ChangePayload::Updated { .. } => ChangeKind::Updated,
            ChangePayload::Deleted { .. } => ChangeKind::Deleted,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeRecord {
    pub entity_id: EntityId,
    pub entity_type: EntityType,
    pub kind: ChangeKind,
    pub payload: ChangePayload,
    pub detected_at: DateTime<Utc>,
    pub synced: bool,
    pub synced_at: Option<DateTime<Utc>>,
}

impl ChangeRecord {
    pub fn key(&self) -> EntityKey {
        EntityKey::new(self.entity_type.clone(), self.entity_id.clone())
    }
}

// ============================================================================
// Tracker
// ============================================================================

pub struct ChangeTracker {
    store: Arc<dyn KeyValueStore>,
    clock: Arc<dyn Clock>,
    schemas: SchemaRegistry,
    marker_key: String,
    separator: String,
    ledger: HashMap<EntityKey, ChangeRecord>,
    last_synced_at: Option<DateTime<Utc>>,
}

impl ChangeTracker {
    /// Creates a tracker and restores the persisted sync marker.
    ///
    /// A marker that cannot be parsed is logged and treated as absent, so the
    /// next incremental run becomes a full one.
    pub async fn load(
        store: Arc<dyn KeyValueStore>,
        clock: Arc<dyn Clock>,
        config: &SyncConfig,
    ) -> Result<Self> {
        let last_synced_at = match store.get(&config.marker_key).await? {
            Some(raw) => match DateTime::parse_from_rfc3339(&raw) {
                Ok(at) => Some(at.with_timezone(&Utc)),
                Err(e) => {
                    warn!(marker = %raw, error = %e, "Ignoring corrupt sync marker");
                    None
                }
            },
            None => None,
        };

        debug!(?last_synced_at, "Change tracker loaded");

        Ok(Self {
            store,
            clock,
            schemas: config.schemas.clone(),
            marker_key: config.marker_key.clone(),
            separator: config.label_separator.clone(),
            ledger: HashMap::new(),
            last_synced_at,
        })
    }

    /// Inserts or replaces the ledger entry for the key, as unsynced.
    pub fn record_change(
        &mut self,
        entity_id: EntityId,
        entity_type: EntityType,
        kind: ChangeKind,
        payload: ChangePayload,
        at: Option<DateTime<Utc>>,
    ) -> Result<ChangeRecord> {
        if entity_id.is_blank() {
            return Err(SyncError::MalformedEntity(format!(
                "{} change without an id",
                entity_type
            )));
        }

        let record = ChangeRecord {
            entity_id,
            entity_type,
            kind,
            payload,
            detected_at: at.unwrap_or_else(|| self.clock.now()),
            synced: false,
            synced_at: None,
        };
        Ok(self.track(record))
    }

    /// Stores a record produced by [`detect_changes`](Self::detect_changes).
    pub fn track(&mut self, mut record: ChangeRecord) -> ChangeRecord {
        record.synced = false;
        record.synced_at = None;
        self.ledger.insert(record.key(), record.clone());
        record
    }

    /// Ledger entries detected strictly after `since`, oldest first.
    pub fn changes_since(
        &self,
        since: DateTime<Utc>,
        entity_type: Option<&EntityType>,
    ) -> Vec<ChangeRecord> {
        let mut changes: Vec<ChangeRecord> = self
            .ledger
            .values()
            .filter(|record| record.detected_at > since)
            .filter(|record| entity_type.map_or(true, |t| &record.entity_type == t))
            .cloned()
            .collect();
        changes.sort_by(|a, b| {
            a.detected_at
                .cmp(&b.detected_at)
                .then_with(|| a.entity_id.cmp(&b.entity_id))
        });
        changes
    }

    /// Diffs `current` against `previous` for one entity type.
    ///
    /// Created and Updated records follow `current` order, Deleted records
    /// follow `previous` order. Does not touch the ledger.
    pub fn detect_changes(
        &self,
        current: &[Entity],
        previous: &[Entity],
        entity_type: &EntityType,
    ) -> Result<Vec<ChangeRecord>> {
        let current_map = index_by_id(current, entity_type)?;
        let previous_map = index_by_id(previous, entity_type)?;
        let detected_at = self.clock.now();

        let mut changes = Vec::new();
        let mut seen = BTreeSet::new();

        for entity in current {
            if !seen.insert(&entity.id) {
                continue;
            }
            let latest = current_map[&entity.id];

            let payload = match previous_map.get(&entity.id) {
                None => ChangePayload::Created {
                    entity: latest.clone(),
                },
                Some(&prior) if self.has_changed(latest, Some(prior)) => ChangePayload::Updated {
                    current: latest.clone(),
                    previous: prior.clone(),
                    field_diff: self.field_diff(latest, prior),
                },
                Some(_) => continue,
            };

            changes.push(ChangeRecord {
                entity_id: entity.id.clone(),
                entity_type: entity_type.clone(),
                kind: payload.kind(),
                payload,
                detected_at,
                synced: false,
                synced_at: None,
            });
        }

        let mut gone = BTreeSet::new();
        for entity in previous {
            if current_map.contains_key(&entity.id) || !gone.insert(&entity.id) {
                continue;
            }
            changes.push(ChangeRecord {
                entity_id: entity.id.clone(),
                entity_type: entity_type.clone(),
                kind: ChangeKind::Deleted,
                payload: ChangePayload::Deleted {
                    previous: previous_map[&entity.id].clone(),
                },
                detected_at,
                synced: false,
                synced_at: None,
            });
        }

        Ok(changes)
    }

    /// Whether `current` differs from `previous` in a way that counts.
    ///
    /// A newer modification stamp is enough. With equal stamps the schema's
    /// significant fields are compared, which catches remote edits that did
    /// not bump the stamp.
    pub fn has_changed(&self, current: &Entity, previous: Option<&Entity>) -> bool {
        let Some(previous) = previous else {
            return true;
        };

        if current.last_modified > previous.last_modified {
            return true;
        }

        let schema = self.schemas.get(&current.entity_type);
        let changed = match schema.significant_fields() {
            Some(mut fields) => fields.any(|field| {
                !schema.values_equal(
                    field,
                    current.field(field),
                    previous.field(field),
                    &self.separator,
                )
            }),
            None => current.fields != previous.fields,
        };
        changed
    }

    /// Every top-level field whose raw value differs.
    pub fn field_diff(&self, current: &Entity, previous: &Entity) -> FieldDiff {
        field_diff(current, previous)
    }

    /// Confirms the given records.
    ///
    /// Only ledger entries that are still the same record are flipped; a newer
    /// change recorded for the key in the meantime stays pending.
    pub fn mark_synced(&mut self, changes: &[ChangeRecord]) -> usize {
        let now = self.clock.now();
        let mut confirmed = 0;

        for change in changes {
            if let Some(entry) = self.ledger.get_mut(&change.key()) {
                if !entry.synced && entry.detected_at == change.detected_at && entry.kind == change.kind {
                    entry.synced = true;
                    entry.synced_at = Some(now);
                    confirmed += 1;
                }
            }
        }

        confirmed
    }

    /// Confirms whatever is pending for `key`, e.g. after a replayed mutation.
    pub fn confirm(&mut self, key: &EntityKey) -> bool {
        let now = self.clock.now();
        match self.ledger.get_mut(key) {
            Some(entry) if !entry.synced => {
                entry.synced = true;
                entry.synced_at = Some(now);
                true
            }
            _ => false,
        }
    }

    /// Persists the marker and returns the stored value.
    pub async fn advance_sync_marker(&mut self, at: Option<DateTime<Utc>>) -> Result<DateTime<Utc>> {
        let at = at.unwrap_or_else(|| self.clock.now());
        self.store.set(&self.marker_key, &at.to_rfc3339()).await?;
        self.last_synced_at = Some(at);
        debug!(marker = %at, "Advanced sync marker");
        Ok(at)
    }

    pub fn last_synced_at(&self) -> Option<DateTime<Utc>> {
        self.last_synced_at
    }

    /// Evicts synced records confirmed more than `retention` ago.
    pub fn collect_garbage(&mut self, retention: Duration) -> usize {
        let Ok(retention) = chrono::Duration::from_std(retention) else {
            return 0;
        };
        let Some(cutoff) = self.clock.now().checked_sub_signed(retention) else {
            return 0;
        };

        let before = self.ledger.len();
        self.ledger.retain(|_, record| {
            !record.synced || record.synced_at.unwrap_or(record.detected_at) >= cutoff
        });
        let removed = before - self.ledger.len();

        if removed > 0 {
            debug!(removed, "Collected synced ledger entries");
        }
        removed
    }

    /// Explicitly removes a record whatever its state.
    pub fn drop_change(&mut self, key: &EntityKey) -> Option<ChangeRecord> {
        self.ledger.remove(key)
    }

    /// Puts back the entry a [`record_change`](Self::record_change) replaced.
    pub fn restore(&mut self, key: &EntityKey, previous: Option<ChangeRecord>) {
        match previous {
            Some(record) => {
                self.ledger.insert(key.clone(), record);
            }
            None => {
                self.ledger.remove(key);
            }
        }
    }

    pub fn get(&self, key: &EntityKey) -> Option<&ChangeRecord> {
        self.ledger.get(key)
    }

    pub fn ledger_len(&self) -> usize {
        self.ledger.len()
    }

    pub fn pending_count(&self) -> usize {
        self.ledger.values().filter(|record| !record.synced).count()
    }

    /// Unsynced records, oldest first.
    pub fn pending_changes(&self) -> Vec<ChangeRecord> {
        let mut pending: Vec<ChangeRecord> = self
            .ledger
            .values()
            .filter(|record| !record.synced)
            .cloned()
            .collect();
        pending.sort_by_key(|record| record.detected_at);
        pending
    }
}

/// Raw top-level diff of two versions, `from` being `previous`.
pub fn field_diff(current: &Entity, previous: &Entity) -> FieldDiff {
    let names: BTreeSet<&String> = current.fields.keys().chain(previous.fields.keys()).collect();

    names
        .into_iter()
        .filter_map(|name| {
            let from = previous.fields.get(name);
            let to = current.fields.get(name);
            (from != to).then(|| {
                (
                    name.clone(),
                    FieldChange {
                        from: from.cloned(),
                        to: to.cloned(),
                    },
                )
            })
        })
        .collect()
}

fn index_by_id<'a>(
    entities: &'a [Entity],
    entity_type: &EntityType,
) -> Result<HashMap<&'a EntityId, &'a Entity>> {
    let mut map = HashMap::with_capacity(entities.len());
    for entity in entities {
        if !entity.has_identity() {
            return Err(SyncError::MalformedEntity(format!(
                "{} entity without an id",
                entity_type
            )));
        }
        if &entity.entity_type != entity_type {
            return Err(SyncError::MalformedEntity(format!(
                "{} listed as {}",
                entity.key(),
                entity_type
            )));
        }
        map.insert(&entity.id, entity);
    }
    Ok(map)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bridge_traits::{ManualClock, MemoryKeyValueStore};
    use chrono::TimeZone;
    use serde_json::json;

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap() + chrono::Duration::seconds(secs)
    }

    fn item(id: &str, state: &str, at: DateTime<Utc>) -> Entity {
        Entity::new(id, EntityType::work_item(), at).with_field("state", state)
    }

    async fn tracker_with(store: Arc<MemoryKeyValueStore>) -> (ChangeTracker, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(t(100)));
        let tracker = ChangeTracker::load(store, clock.clone(), &SyncConfig::default())
            .await
            .unwrap();
        (tracker, clock)
    }

    async fn tracker() -> (ChangeTracker, Arc<ManualClock>) {
        tracker_with(Arc::new(MemoryKeyValueStore::new())).await
    }

    #[tokio::test]
    async fn test_state_change_is_one_update() {
        let (tracker, _) = tracker().await;
        let previous = vec![item("1", "Active", t(0))];
        let current = vec![item("1", "Done", t(1))];

        let changes = tracker
            .detect_changes(&current, &previous, &EntityType::work_item())
            .unwrap();

        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].kind, ChangeKind::Updated);
        let ChangePayload::Updated { field_diff, .. } = &changes[0].payload else {
            panic!("expected an update payload");
        };
        assert_eq!(field_diff.len(), 1);
        assert_eq!(
            field_diff["state"],
            FieldChange {
                from: Some(json!("Active")),
                to: Some(json!("Done")),
            }
        );
    }

    #[tokio::test]
    async fn test_snapshot_against_itself_is_empty() {
        let (tracker, _) = tracker().await;
        let snapshot = vec![item("1", "New", t(0)), item("2", "Active", t(5))];

        let changes = tracker
            .detect_changes(&snapshot, &snapshot, &EntityType::work_item())
            .unwrap();
        assert!(changes.is_empty());
    }

    #[tokio::test]
    async fn test_three_way_diff_is_complete() {
        let (tracker, _) = tracker().await;
        let previous = vec![
            item("1", "New", t(0)),
            item("2", "New", t(0)),
            item("3", "New", t(0)),
        ];
        let current = vec![
            item("2", "New", t(0)),
            item("3", "Active", t(0)),
            item("4", "New", t(0)),
        ];

        let changes = tracker
            .detect_changes(&current, &previous, &EntityType::work_item())
            .unwrap();
        let summary: Vec<(&str, ChangeKind)> = changes
            .iter()
            .map(|c| (c.entity_id.as_str(), c.kind))
            .collect();

        assert_eq!(
            summary,
            vec![
                ("3", ChangeKind::Updated),
                ("4", ChangeKind::Created),
                ("1", ChangeKind::Deleted),
            ]
        );
    }

    #[tokio::test]
    async fn test_has_changed_with_equal_stamps() {
        let (tracker, _) = tracker().await;
        let before = item("1", "Active", t(0)).with_field("tags", "a;b");

        let reordered = item("1", "Active", t(0)).with_field("tags", "b; a");
        assert!(!tracker.has_changed(&reordered, Some(&before)));

        let moved = item("1", "Resolved", t(0)).with_field("tags", "a;b");
        assert!(tracker.has_changed(&moved, Some(&before)));

        assert!(tracker.has_changed(&before, None));
    }

    #[tokio::test]
    async fn test_malformed_input_is_rejected() {
        let (tracker, _) = tracker().await;
        let current = vec![item("", "New", t(0))];

        let result = tracker.detect_changes(&current, &[], &EntityType::work_item());
        assert!(matches!(result, Err(SyncError::MalformedEntity(_))));

        let wrong_type = vec![Entity::new("9", EntityType::new("iteration"), t(0))];
        let result = tracker.detect_changes(&wrong_type, &[], &EntityType::work_item());
        assert!(matches!(result, Err(SyncError::MalformedEntity(_))));
    }

    #[tokio::test]
    async fn test_ledger_keeps_latest_record_per_key() {
        let (mut tracker, _) = tracker().await;
        let entity = item("1", "New", t(0));

        for (offset, kind) in [(1, ChangeKind::Created), (2, ChangeKind::Updated), (3, ChangeKind::Deleted)] {
            tracker
                .record_change(
                    entity.id.clone(),
                    EntityType::work_item(),
                    kind,
                    ChangePayload::Created {
                        entity: entity.clone(),
                    },
                    Some(t(offset)),
                )
                .unwrap();
        }

        assert_eq!(tracker.ledger_len(), 1);
        let record = tracker.get(&entity.key()).unwrap();
        assert_eq!(record.kind, ChangeKind::Deleted);
        assert_eq!(record.detected_at, t(3));

        let blank = tracker.record_change(
            EntityId::new(" "),
            EntityType::work_item(),
            ChangeKind::Created,
            ChangePayload::Created { entity },
            None,
        );
        assert!(matches!(blank, Err(SyncError::MalformedEntity(_))));
    }

    #[tokio::test]
    async fn test_changes_since_is_ordered_and_filtered() {
        let (mut tracker, _) = tracker().await;
        let iteration = EntityType::new("iteration");

        for (id, entity_type, at) in [
            ("3", EntityType::work_item(), t(30)),
            ("1", EntityType::work_item(), t(10)),
            ("2", iteration.clone(), t(20)),
        ] {
            let entity = Entity::new(id, entity_type.clone(), at);
            tracker
                .record_change(
                    entity.id.clone(),
                    entity_type,
                    ChangeKind::Created,
                    ChangePayload::Created { entity },
                    Some(at),
                )
                .unwrap();
        }

        let all: Vec<String> = tracker
            .changes_since(t(10), None)
            .into_iter()
            .map(|c| c.entity_id.to_string())
            .collect();
        assert_eq!(all, vec!["2", "3"]);

        let items = tracker.changes_since(t(0), Some(&EntityType::work_item()));
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].entity_id.as_str(), "1");
    }

    #[tokio::test]
    async fn test_mark_synced_and_garbage_collection() {
        let (mut tracker, clock) = tracker().await;
        let changes = tracker
            .detect_changes(
                &[item("1", "New", t(0)), item("2", "New", t(0))],
                &[],
                &EntityType::work_item(),
            )
            .unwrap();
        for change in &changes {
            tracker.track(change.clone());
        }
        assert_eq!(tracker.pending_count(), 2);

        assert_eq!(tracker.mark_synced(&changes[..1]), 1);
        assert_eq!(tracker.pending_count(), 1);
        assert_eq!(tracker.mark_synced(&changes[..1]), 0);

        clock.advance(chrono::Duration::hours(2));
        let removed = tracker.collect_garbage(Duration::from_secs(60 * 60));
        assert_eq!(removed, 1);
        assert_eq!(tracker.ledger_len(), 1);
        assert_eq!(tracker.pending_count(), 1);

        clock.advance(chrono::Duration::days(30));
        assert_eq!(tracker.collect_garbage(Duration::from_secs(1)), 0);

        let key = changes[1].key();
        assert!(tracker.drop_change(&key).is_some());
        assert_eq!(tracker.ledger_len(), 0);
    }

    #[tokio::test]
    async fn test_newer_record_survives_stale_confirmation() {
        let (mut tracker, clock) = tracker().await;
        let changes = tracker
            .detect_changes(&[item("1", "New", t(0))], &[], &EntityType::work_item())
            .unwrap();
        tracker.track(changes[0].clone());

        clock.advance(chrono::Duration::seconds(1));
        let entity = item("1", "Active", t(1));
        tracker
            .record_change(
                entity.id.clone(),
                EntityType::work_item(),
                ChangeKind::Updated,
                ChangePayload::Created { entity },
                None,
            )
            .unwrap();

        assert_eq!(tracker.mark_synced(&changes), 0);
        assert_eq!(tracker.pending_count(), 1);
        assert!(tracker.confirm(&changes[0].key()));
        assert_eq!(tracker.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_sync_marker_survives_reload() {
        let store = Arc::new(MemoryKeyValueStore::new());
        let (mut tracker, _) = tracker_with(store.clone()).await;
        assert!(tracker.last_synced_at().is_none());

        tracker.advance_sync_marker(Some(t(42))).await.unwrap();

        let (reloaded, _) = tracker_with(store).await;
        assert_eq!(reloaded.last_synced_at(), Some(t(42)));
    }

    #[tokio::test]
    async fn test_corrupt_marker_is_ignored() {
        let store = Arc::new(MemoryKeyValueStore::new());
        store.set("sync.last_synced_at", "yesterday").await.unwrap();

        let (tracker, _) = tracker_with(store).await;
        assert!(tracker.last_synced_at().is_none());
    }
}
