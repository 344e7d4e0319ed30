//! Integration tests for the sync orchestrator
//!
//! These tests drive the orchestrator through in-memory bridges and verify:
//! - Strategy runs (full, incremental, delta, priority) and their change sets
//! - Single-flight triggering and pause/resume
//! - Connectivity loss, offline queueing and replay on reconnect
//! - Conflict reconciliation for entities with queued local edits
//! - Manual resolution of parked entities

mod common;

use bridge_traits::error::Result as BridgeResult;
use bridge_traits::{
    ChangeKind, DataSource, Entity, EntityBatch, EntityId, EntityKey, EntityType, FetchOptions,
    MemoryKeyValueStore, Mutation, MutationKind, Priority,
};
use chrono::{DateTime, Utc};
use common::{at, build, harness, harness_with, rejected, unreachable, work_item, ScriptedSource};
use core_runtime::config::CoreConfig;
use core_runtime::events::{SyncEvent, SyncEventKind};
use core_sync::{
    ChangePayload, QueueOperation, SkipReason, SyncConfig, SyncError, SyncOrchestrator,
    SyncOutcome, SyncRequest, SyncStatus, SyncStrategy,
};
use mockall::mock;
use serde_json::json;
use std::sync::Arc;

fn fields(pairs: &[(&str, serde_json::Value)]) -> bridge_traits::Fields {
    pairs
        .iter()
        .map(|(name, value)| (name.to_string(), value.clone()))
        .collect()
}

fn key(id: &str) -> EntityKey {
    EntityKey::new(EntityType::work_item(), EntityId::from(id))
}

mock! {
    pub Source {}

    #[async_trait::async_trait]
    impl DataSource for Source {
        async fn fetch_all(&self, options: &FetchOptions) -> BridgeResult<EntityBatch>;
        fn supports_modified_since(&self) -> bool;
        async fn fetch_modified_since(&self, since: DateTime<Utc>, options: &FetchOptions) -> BridgeResult<EntityBatch>;
        async fn fetch_by_ids(&self, ids: &[EntityId]) -> BridgeResult<Vec<Entity>>;
        async fn apply_mutation(&self, mutation: &Mutation) -> BridgeResult<()>;
    }
}

async fn orchestrator_over(source: MockSource) -> Arc<SyncOrchestrator> {
    let core = CoreConfig::builder()
        .data_source(Arc::new(source))
        .key_value_store(Arc::new(MemoryKeyValueStore::new()))
        .build()
        .unwrap();
    SyncOrchestrator::new(&core, SyncConfig::default()).await.unwrap()
}

// ============================================================================
// Strategy runs
// ============================================================================

#[tokio::test]
async fn test_full_sync_reports_field_diff() {
    let source = ScriptedSource::with(vec![work_item("1", 0).with_field("state", "Active")]);
    let h = harness(source.clone()).await;

    let first = h.orchestrator.perform_full_sync().await;
    let report = first.report().unwrap();
    assert_eq!(report.stats.created, 1);

    source.replace(vec![work_item("1", 10).with_field("state", "Done")]);
    h.sink.clear();

    let second = h.orchestrator.perform_full_sync().await;
    let report = second.report().unwrap();
    assert_eq!(report.stats.updated, 1);
    assert_eq!(report.changes.len(), 1);

    match &report.changes[0].payload {
        ChangePayload::Updated { field_diff, .. } => {
            assert_eq!(field_diff.len(), 1);
            let change = &field_diff["state"];
            assert_eq!(change.from, Some(json!("Active")));
            assert_eq!(change.to, Some(json!("Done")));
        }
        other => panic!("expected an update, got {:?}", other),
    }

    let received = h.sink.received();
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].kind, ChangeKind::Updated);
    assert_eq!(received[0].priority, Priority::Normal);

    let status = h.orchestrator.get_status().await;
    assert_eq!(status.status, SyncStatus::Idle);
    assert_eq!(status.last_sync_at, Some(at(100)));
    assert_eq!(status.pending_change_count, 0);
}

#[tokio::test]
async fn test_full_sync_detects_deletions_and_skips_malformed() {
    let source = ScriptedSource::with(vec![work_item("1", 0), work_item("2", 0)]);
    let h = harness(source.clone()).await;
    h.orchestrator.perform_full_sync().await;

    source.replace(vec![work_item("1", 0), work_item("", 5)]);
    let outcome = h.orchestrator.perform_full_sync().await;
    let report = outcome.report().unwrap();

    assert_eq!(report.stats.deleted, 1);
    assert_eq!(report.stats.skipped, 1);
    assert_eq!(h.orchestrator.snapshot(&EntityType::work_item()).await.len(), 1);
    assert!(h.orchestrator.entity(&key("2")).await.is_none());
}

#[tokio::test]
async fn test_incremental_without_marker_runs_full() {
    let source = ScriptedSource::with(vec![work_item("1", 0), work_item("2", 0)]);
    let h = harness(source).await;

    let outcome = h.orchestrator.perform_incremental_sync().await;
    let report = outcome.report().unwrap();

    assert_eq!(report.strategy, SyncStrategy::Incremental);
    assert_eq!(report.stats.created, 2);
    assert!(!report.degraded);
    assert_eq!(h.orchestrator.get_status().await.last_sync_at, Some(at(100)));
}

#[tokio::test]
async fn test_incremental_uses_modified_since() {
    let source = ScriptedSource::with(vec![work_item("1", 0), work_item("2", 0)]);
    source.support_modified_since(true);
    let h = harness(source.clone()).await;
    h.orchestrator.perform_full_sync().await;

    source.upsert(work_item("2", 150).with_field("title", "Renamed"));
    source.upsert(work_item("3", 160));
    source.remove("1");
    h.clock.set(at(200));

    let outcome = h.orchestrator.perform_incremental_sync().await;
    let report = outcome.report().unwrap();

    assert!(!report.degraded);
    assert_eq!(report.stats.updated, 1);
    assert_eq!(report.stats.created, 1);
    // incremental runs never infer deletions
    assert_eq!(report.stats.deleted, 0);
    assert!(h.orchestrator.entity(&key("1")).await.is_some());
    assert_eq!(h.orchestrator.get_status().await.last_sync_at, Some(at(200)));
}

#[tokio::test]
async fn test_incremental_degrades_without_capability() {
    let source = ScriptedSource::with(vec![work_item("1", 0), work_item("2", 0)]);
    let h = harness(source.clone()).await;
    h.orchestrator.perform_full_sync().await;

    let mut events = h
        .orchestrator
        .subscribe()
        .filter(|event| event.kind() == SyncEventKind::IncrementalSync);

    source.upsert(work_item("2", 150).with_field("state", "Resolved"));
    h.clock.set(at(200));

    let outcome = h.orchestrator.perform_incremental_sync().await;
    let report = outcome.report().unwrap();
    assert!(report.degraded);
    assert_eq!(report.stats.updated, 1);
    assert_eq!(report.stats.applied(), 1);

    match events.try_recv() {
        Some(Ok(SyncEvent::IncrementalSync { degraded, stats, .. })) => {
            assert!(degraded);
            assert_eq!(stats.updated, 1);
        }
        other => panic!("expected an incremental sync event, got {:?}", other),
    }
}

#[tokio::test]
async fn test_delta_sync_reports_missing_ids_as_deleted() {
    let source = ScriptedSource::with(vec![work_item("1", 0), work_item("2", 0), work_item("3", 0)]);
    let h = harness(source.clone()).await;
    h.orchestrator.perform_full_sync().await;
    let marker = h.orchestrator.get_status().await.last_sync_at;

    source.remove("2");
    source.upsert(work_item("3", 50).with_field("title", "Edited"));
    source.upsert(work_item("1", 60).with_field("title", "Not requested"));
    h.clock.set(at(300));

    let outcome = h
        .orchestrator
        .perform_delta_sync(vec!["2".into(), "3".into(), "3".into()])
        .await;
    let report = outcome.report().unwrap();

    assert_eq!(report.strategy, SyncStrategy::Delta);
    assert_eq!(report.stats.deleted, 1);
    assert_eq!(report.stats.updated, 1);
    assert!(h.orchestrator.entity(&key("2")).await.is_none());
    assert!(h.orchestrator.entity(&key("1")).await.unwrap().field("title").is_none());
    // delta runs leave the marker alone
    assert_eq!(h.orchestrator.get_status().await.last_sync_at, marker);
}

#[tokio::test]
async fn test_delta_sync_with_no_ids_is_skipped() {
    let h = harness(ScriptedSource::with(vec![])).await;
    let outcome = h.orchestrator.perform_delta_sync(vec![]).await;
    assert!(matches!(outcome, SyncOutcome::Skipped(SkipReason::NothingToSync)));
}

#[tokio::test]
async fn test_priority_sync_consumes_interest_set() {
    let source = ScriptedSource::with(vec![work_item("1", 0), work_item("2", 0)]);
    let h = harness(source.clone()).await;

    assert!(matches!(
        h.orchestrator.perform_priority_sync().await,
        SyncOutcome::Skipped(SkipReason::NothingToSync)
    ));

    h.orchestrator
        .mark_items_of_interest(vec!["1".into(), "".into()])
        .await;
    assert_eq!(h.orchestrator.items_of_interest().await, vec![EntityId::from("1")]);

    let outcome = h.orchestrator.perform_priority_sync().await;
    let report = outcome.report().unwrap();
    assert_eq!(report.strategy, SyncStrategy::Priority);
    assert_eq!(report.stats.created, 1);

    let received = h.sink.received();
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].entity_id, EntityId::from("1"));
    assert_eq!(received[0].priority, Priority::High);
    assert!(h.orchestrator.items_of_interest().await.is_empty());
}

// ============================================================================
// Lifecycle
// ============================================================================

#[tokio::test]
async fn test_second_trigger_while_syncing_is_noop() {
    let source = ScriptedSource::with(vec![work_item("1", 0)]);
    let h = harness(source.clone()).await;
    source.hold_fetches(true);

    let orchestrator = h.orchestrator.clone();
    let first = tokio::spawn(async move { orchestrator.perform_full_sync().await });
    source.entered.notified().await;

    assert_eq!(h.orchestrator.status().await, SyncStatus::Syncing);
    let second = h.orchestrator.perform_full_sync().await;
    assert!(matches!(second, SyncOutcome::Skipped(SkipReason::AlreadySyncing)));

    source.hold_fetches(false);
    source.release.notify_one();
    let first = first.await.unwrap();

    assert!(first.is_completed());
    assert_eq!(source.fetch_count(), 1);
    assert_eq!(h.orchestrator.status().await, SyncStatus::Idle);
}

#[tokio::test]
async fn test_pause_and_resume() {
    let h = harness(ScriptedSource::with(vec![work_item("1", 0)])).await;

    assert_eq!(h.orchestrator.pause().await, SyncStatus::Paused);
    let outcome = h.orchestrator.perform_full_sync().await;
    assert!(matches!(outcome, SyncOutcome::Skipped(SkipReason::Paused)));

    assert_eq!(h.orchestrator.resume().await, SyncStatus::Idle);
    assert!(h.orchestrator.perform_full_sync().await.is_completed());
}

#[tokio::test]
async fn test_pause_during_run_applies_when_it_finishes() {
    let source = ScriptedSource::with(vec![work_item("1", 0)]);
    let h = harness(source.clone()).await;
    source.hold_fetches(true);

    let orchestrator = h.orchestrator.clone();
    let run = tokio::spawn(async move { orchestrator.perform_full_sync().await });
    source.entered.notified().await;

    assert_eq!(h.orchestrator.pause().await, SyncStatus::Syncing);

    source.hold_fetches(false);
    source.release.notify_one();
    assert!(run.await.unwrap().is_completed());
    assert_eq!(h.orchestrator.status().await, SyncStatus::Paused);
}

#[tokio::test]
async fn test_paused_engine_goes_offline_and_returns_paused() {
    let h = harness(ScriptedSource::with(vec![work_item("1", 0)])).await;
    assert_eq!(h.orchestrator.pause().await, SyncStatus::Paused);

    h.monitor.set_online(false);
    assert_eq!(h.orchestrator.check_connectivity().await, SyncStatus::Offline);
    assert_eq!(h.orchestrator.get_status().await.status, SyncStatus::Offline);

    h.monitor.set_online(true);
    assert_eq!(h.orchestrator.check_connectivity().await, SyncStatus::Paused);
    let outcome = h.orchestrator.perform_full_sync().await;
    assert!(matches!(outcome, SyncOutcome::Skipped(SkipReason::Paused)));
}

#[tokio::test]
async fn test_resume_while_offline_reconnects_to_idle() {
    let h = harness(ScriptedSource::with(vec![work_item("1", 0)])).await;
    h.orchestrator.pause().await;
    h.monitor.set_online(false);
    h.orchestrator.check_connectivity().await;

    assert_eq!(h.orchestrator.resume().await, SyncStatus::Offline);

    h.monitor.set_online(true);
    assert_eq!(h.orchestrator.check_connectivity().await, SyncStatus::Idle);
    assert!(h.orchestrator.perform_full_sync().await.is_completed());
}

#[tokio::test]
async fn test_connectivity_drop_mid_sync() {
    let source = ScriptedSource::with(vec![work_item("1", 0).with_field("points", 1)]);
    let h = harness(source.clone()).await;
    source.hold_fetches(true);

    let orchestrator = h.orchestrator.clone();
    let run = tokio::spawn(async move { orchestrator.perform_full_sync().await });
    source.entered.notified().await;

    h.monitor.set_online(false);
    // the heartbeat never interrupts a run in flight
    assert_eq!(h.orchestrator.check_connectivity().await, SyncStatus::Syncing);

    source.hold_fetches(false);
    source.release.notify_one();
    assert!(run.await.unwrap().is_completed());
    assert_eq!(h.orchestrator.status().await, SyncStatus::Idle);

    assert_eq!(h.orchestrator.check_connectivity().await, SyncStatus::Offline);

    let mutation = Mutation::update(EntityType::work_item(), "1", fields(&[("points", json!(8))]));
    h.orchestrator
        .submit_mutation(mutation, Priority::Normal)
        .await
        .unwrap();
    assert_eq!(h.orchestrator.get_status().await.queue_length, 1);
    assert!(source.applied().is_empty());
    assert_eq!(
        h.orchestrator.entity(&key("1")).await.unwrap().field("points"),
        Some(&json!(8))
    );

    h.monitor.set_online(true);
    assert_eq!(h.orchestrator.check_connectivity().await, SyncStatus::Idle);

    assert_eq!(source.applied().len(), 1);
    let status = h.orchestrator.get_status().await;
    assert_eq!(status.queue_length, 0);
    assert_eq!(status.pending_change_count, 0);
}

#[tokio::test]
async fn test_offline_monitor_skips_trigger() {
    let source = ScriptedSource::with(vec![work_item("1", 0)]);
    let h = harness(source.clone()).await;
    h.monitor.set_online(false);

    let outcome = h.orchestrator.perform_full_sync().await;
    assert!(matches!(outcome, SyncOutcome::Skipped(SkipReason::Offline)));
    assert_eq!(h.orchestrator.status().await, SyncStatus::Offline);
    assert_eq!(source.fetch_count(), 0);
}

#[tokio::test]
async fn test_unreachable_fetch_goes_offline_and_retries_on_reconnect() {
    let source = ScriptedSource::with(vec![work_item("1", 0)]);
    let h = harness(source.clone()).await;
    source.fail_fetches(Some(unreachable));

    let mut errors = h
        .orchestrator
        .subscribe()
        .filter(|event| event.kind() == SyncEventKind::Error);

    let outcome = h.orchestrator.perform_full_sync().await;
    assert!(matches!(outcome, SyncOutcome::Failed { offline: true, .. }));

    let status = h.orchestrator.get_status().await;
    assert_eq!(status.status, SyncStatus::Offline);
    assert!(status.last_error.unwrap().contains("connection refused"));

    let queue = h.orchestrator.queue_status().await;
    assert_eq!(queue.length, 1);
    assert_eq!(
        queue.items[0].operation,
        QueueOperation::RetrySync {
            request: SyncRequest::Full
        }
    );
    assert_eq!(queue.items[0].priority, Priority::High);

    match errors.try_recv() {
        Some(Ok(SyncEvent::Error {
            strategy,
            recoverable,
            ..
        })) => {
            assert_eq!(strategy.as_deref(), Some("full"));
            assert!(recoverable);
        }
        other => panic!("expected an error event, got {:?}", other),
    }

    source.fail_fetches(None);
    assert_eq!(h.orchestrator.check_connectivity().await, SyncStatus::Idle);

    assert_eq!(source.fetch_count(), 2);
    assert_eq!(h.orchestrator.get_status().await.queue_length, 0);
    assert!(h.orchestrator.entity(&key("1")).await.is_some());
}

#[tokio::test]
async fn test_rejected_fetch_enters_error_and_recovers() {
    let mut source = MockSource::new();
    let mut first = true;
    source.expect_fetch_all().times(2).returning(move |_| {
        if std::mem::replace(&mut first, false) {
            Err(rejected())
        } else {
            Ok(EntityBatch::new())
        }
    });
    let orchestrator = orchestrator_over(source).await;

    let outcome = orchestrator.perform_full_sync().await;
    match outcome {
        SyncOutcome::Failed { error, offline } => {
            assert!(!offline);
            assert!(error.contains("HTTP 500"));
        }
        other => panic!("expected a failure, got {:?}", other),
    }
    let status = orchestrator.get_status().await;
    assert_eq!(status.status, SyncStatus::Error);
    assert_eq!(status.queue_length, 0);

    assert!(orchestrator.perform_full_sync().await.is_completed());
    let status = orchestrator.get_status().await;
    assert_eq!(status.status, SyncStatus::Idle);
    assert!(status.last_error.is_none());
}

#[tokio::test]
async fn test_status_events_follow_transitions() {
    let h = harness(ScriptedSource::with(vec![work_item("1", 0)])).await;
    let mut events = h
        .orchestrator
        .subscribe()
        .filter(|event| event.kind() == SyncEventKind::StatusChange);

    h.orchestrator.perform_full_sync().await;

    let mut seen = Vec::new();
    while let Some(Ok(SyncEvent::StatusChanged { from, to })) = events.try_recv() {
        seen.push((from, to));
    }
    assert_eq!(
        seen,
        vec![
            ("idle".to_string(), "syncing".to_string()),
            ("syncing".to_string(), "idle".to_string()),
        ]
    );
}

#[tokio::test]
async fn test_marker_survives_restart() {
    let source = ScriptedSource::with(vec![work_item("1", 0)]);
    let h = harness(source.clone()).await;
    h.orchestrator.perform_full_sync().await;

    let restarted = build(source, h.store.clone(), SyncConfig::default()).await;
    assert_eq!(
        restarted.orchestrator.get_status().await.last_sync_at,
        Some(at(100))
    );
}

#[tokio::test]
async fn test_marker_write_failure_applies_nothing() {
    let source = ScriptedSource::with(vec![work_item("1", 0)]);
    let h = harness(source.clone()).await;
    h.store.fail_writes(true);

    let outcome = h.orchestrator.perform_full_sync().await;
    assert!(matches!(outcome, SyncOutcome::Failed { offline: false, .. }));
    assert!(h.orchestrator.snapshot(&EntityType::work_item()).await.is_empty());
    assert!(h.sink.received().is_empty());

    let status = h.orchestrator.get_status().await;
    assert_eq!(status.status, SyncStatus::Error);
    assert_eq!(status.last_sync_at, None);
    assert_eq!(status.pending_change_count, 0);

    h.store.fail_writes(false);
    let outcome = h.orchestrator.perform_full_sync().await;
    assert_eq!(outcome.report().unwrap().stats.created, 1);
    assert_eq!(h.sink.received().len(), 1);
    assert_eq!(h.orchestrator.get_status().await.last_sync_at, Some(at(100)));
}

// ============================================================================
// Conflicts
// ============================================================================

async fn conflicted(config: SyncConfig) -> common::Harness {
    let source = ScriptedSource::with(vec![work_item("5", 0)
        .with_field("points", 1)
        .with_field("tags", "a")]);
    let h = harness_with(source.clone(), config).await;
    h.orchestrator.perform_full_sync().await;

    // the remote is up but refuses connections for writes, so the edit stays queued
    source.fail_mutations(Some(unreachable));
    let mutation = Mutation::update(
        EntityType::work_item(),
        "5",
        fields(&[("points", json!(3)), ("tags", json!("a;b"))]),
    );
    h.orchestrator
        .submit_mutation(mutation, Priority::Normal)
        .await
        .unwrap();
    assert_eq!(h.orchestrator.get_status().await.queue_length, 1);

    source.replace(vec![work_item("5", 500)
        .with_field("points", 5)
        .with_field("tags", "b;c")]);
    h.sink.clear();
    h
}

#[tokio::test]
async fn test_queued_edit_is_merged_field_by_field() {
    let h = conflicted(SyncConfig::default()).await;

    let outcome = h.orchestrator.perform_full_sync().await;
    let report = outcome.report().unwrap();
    assert_eq!(report.stats.conflicts, 1);
    assert_eq!(report.stats.updated, 1);

    let merged = h.orchestrator.entity(&key("5")).await.unwrap();
    assert_eq!(merged.field("points"), Some(&json!(3)));
    assert_eq!(merged.field("tags"), Some(&json!("a;b;c")));

    let received = h.sink.received();
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].payload.as_ref(), Some(&merged));
}

#[tokio::test]
async fn test_manual_resolution_parks_until_submitted() {
    let config = SyncConfig::default().with_manual_resolution(EntityType::work_item());
    let h = conflicted(config).await;
    let mut required = h
        .orchestrator
        .subscribe()
        .filter(|event| event.kind() == SyncEventKind::ResolutionRequired);

    let outcome = h.orchestrator.perform_full_sync().await;
    let report = outcome.report().unwrap();
    assert_eq!(report.stats.conflicts, 1);
    assert_eq!(report.stats.applied(), 0);
    assert!(h.sink.received().is_empty());

    match required.try_recv() {
        Some(Ok(SyncEvent::ResolutionRequired { entity_id, fields, .. })) => {
            assert_eq!(entity_id, "5");
            assert_eq!(fields, vec!["points".to_string(), "tags".to_string()]);
        }
        other => panic!("expected a resolution request, got {:?}", other),
    }
    assert_eq!(h.orchestrator.pending_resolutions().await, vec![key("5")]);
    assert_eq!(h.orchestrator.get_status().await.awaiting_resolution, 1);

    // a second run while parked neither re-emits nor applies
    let again = h.orchestrator.perform_full_sync().await;
    assert_eq!(again.report().unwrap().stats.skipped, 1);
    assert!(required.try_recv().is_none());

    let decided = work_item("5", 0).with_field("points", 4).with_field("tags", "a;b;c");
    h.orchestrator.submit_resolution(decided).await.unwrap();

    let entity = h.orchestrator.entity(&key("5")).await.unwrap();
    assert_eq!(entity.field("points"), Some(&json!(4)));
    assert!(h.orchestrator.pending_resolutions().await.is_empty());

    let received = h.sink.received();
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].priority, Priority::High);

    let queue = h.orchestrator.queue_status().await;
    assert_eq!(queue.length, 2);
    match &queue.items[0].operation {
        QueueOperation::Mutation { mutation } => {
            assert_eq!(mutation.kind, MutationKind::Update);
            assert_eq!(mutation.fields.get("points"), Some(&json!(4)));
        }
        other => panic!("expected the resolution mutation first, got {:?}", other),
    }

    let err = h
        .orchestrator
        .submit_resolution(work_item("5", 0))
        .await
        .unwrap_err();
    assert!(matches!(err, SyncError::ResolutionNotPending { .. }));
}

#[tokio::test]
async fn test_submit_mutation_rejects_blank_id() {
    let h = harness(ScriptedSource::with(vec![])).await;
    let mutation = Mutation::update(EntityType::work_item(), "", bridge_traits::Fields::new());

    let err = h
        .orchestrator
        .submit_mutation(mutation, Priority::Normal)
        .await
        .unwrap_err();
    assert!(matches!(err, SyncError::MalformedEntity(_)));
    assert_eq!(h.orchestrator.get_status().await.queue_length, 0);
}

#[tokio::test]
async fn test_online_mutation_is_sent_immediately() {
    let source = ScriptedSource::with(vec![work_item("1", 0)]);
    let h = harness(source.clone()).await;
    h.orchestrator.perform_full_sync().await;

    let delete = Mutation {
        kind: MutationKind::Delete,
        entity_type: EntityType::work_item(),
        entity_id: "1".into(),
        fields: bridge_traits::Fields::new(),
    };
    h.orchestrator
        .submit_mutation(delete, Priority::Critical)
        .await
        .unwrap();

    assert_eq!(source.applied().len(), 1);
    assert!(h.orchestrator.entity(&key("1")).await.is_none());
    let status = h.orchestrator.get_status().await;
    assert_eq!(status.queue_length, 0);
    assert_eq!(status.pending_change_count, 0);
}

#[tokio::test]
async fn test_mutation_that_cannot_be_queued_is_reverted() {
    let source = ScriptedSource::with(vec![work_item("1", 0).with_field("points", 1)]);
    let h = harness(source.clone()).await;
    h.orchestrator.perform_full_sync().await;
    h.store.fail_writes(true);

    let update = Mutation::update(EntityType::work_item(), "1", fields(&[("points", json!(8))]));
    let err = h
        .orchestrator
        .submit_mutation(update.clone(), Priority::Normal)
        .await
        .unwrap_err();
    assert!(matches!(err, SyncError::Storage(_)));

    let create = Mutation {
        kind: MutationKind::Create,
        entity_type: EntityType::work_item(),
        entity_id: "9".into(),
        fields: fields(&[("title", json!("new"))]),
    };
    assert!(h
        .orchestrator
        .submit_mutation(create, Priority::Normal)
        .await
        .is_err());

    let status = h.orchestrator.get_status().await;
    assert_eq!(status.queue_length, 0);
    assert_eq!(status.pending_change_count, 0);
    assert_eq!(
        h.orchestrator.entity(&key("1")).await.unwrap().field("points"),
        Some(&json!(1))
    );
    assert!(h.orchestrator.entity(&key("9")).await.is_none());
    assert!(source.applied().is_empty());

    h.store.fail_writes(false);
    h.orchestrator
        .submit_mutation(update, Priority::Normal)
        .await
        .unwrap();
    assert_eq!(source.applied().len(), 1);
}

#[tokio::test]
async fn test_resolution_that_cannot_be_queued_stays_pending() {
    let config = SyncConfig::default().with_manual_resolution(EntityType::work_item());
    let h = conflicted(config).await;
    h.orchestrator.perform_full_sync().await;
    let before = h.orchestrator.entity(&key("5")).await;
    h.store.fail_writes(true);

    let decided = work_item("5", 0).with_field("points", 4);
    assert!(h.orchestrator.submit_resolution(decided.clone()).await.is_err());

    assert_eq!(h.orchestrator.pending_resolutions().await, vec![key("5")]);
    assert_eq!(h.orchestrator.entity(&key("5")).await, before);
    assert!(h.sink.received().is_empty());
    assert_eq!(h.orchestrator.get_status().await.queue_length, 1);

    h.store.fail_writes(false);
    h.orchestrator.submit_resolution(decided).await.unwrap();
    assert!(h.orchestrator.pending_resolutions().await.is_empty());
    assert_eq!(h.sink.received().len(), 1);
}
