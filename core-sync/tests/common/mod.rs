//! Shared fakes for the integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use bridge_traits::error::Result as BridgeResult;
use bridge_traits::{
    BridgeError, ChangeNotification, ChangeNotificationSink, DataSource, Entity, EntityBatch,
    EntityId, EntityType, FetchOptions, KeyValueStore, ManualClock, MemoryKeyValueStore, Mutation,
    NetworkInfo, NetworkMonitor, NetworkType,
};
use chrono::{DateTime, Duration, TimeZone, Utc};
use core_runtime::config::CoreConfig;
use core_sync::{SyncConfig, SyncOrchestrator};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;

pub fn at(secs: i64) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap() + Duration::seconds(secs)
}

pub fn work_item(id: &str, modified: i64) -> Entity {
    Entity::new(id, EntityType::work_item(), at(modified))
}

// ============================================================================
// Mock Implementations
// ============================================================================

/// In-memory remote whose contents the test rewrites between runs.
#[derive(Default)]
pub struct ScriptedSource {
    entities: Mutex<BTreeMap<EntityId, Entity>>,
    modified_since: AtomicBool,
    fetch_error: Mutex<Option<fn() -> BridgeError>>,
    mutation_error: Mutex<Option<fn() -> BridgeError>>,
    applied: Mutex<Vec<Mutation>>,
    fetches: AtomicUsize,
    gated: AtomicBool,
    pub entered: Notify,
    pub release: Notify,
}

impl ScriptedSource {
    pub fn with(entities: Vec<Entity>) -> Arc<Self> {
        let source = Self::default();
        source.replace(entities);
        Arc::new(source)
    }

    pub fn replace(&self, entities: Vec<Entity>) {
        let mut stored = self.entities.lock().unwrap();
        stored.clear();
        for entity in entities {
            stored.insert(entity.id.clone(), entity);
        }
    }

    pub fn upsert(&self, entity: Entity) {
        self.entities.lock().unwrap().insert(entity.id.clone(), entity);
    }

    pub fn remove(&self, id: &str) {
        self.entities.lock().unwrap().remove(&EntityId::from(id));
    }

    pub fn support_modified_since(&self, supported: bool) {
        self.modified_since.store(supported, Ordering::SeqCst);
    }

    pub fn fail_fetches(&self, failure: Option<fn() -> BridgeError>) {
        *self.fetch_error.lock().unwrap() = failure;
    }

    pub fn fail_mutations(&self, failure: Option<fn() -> BridgeError>) {
        *self.mutation_error.lock().unwrap() = failure;
    }

    /// Makes the next fetches wait for `release` after signalling `entered`.
    pub fn hold_fetches(&self, held: bool) {
        self.gated.store(held, Ordering::SeqCst);
    }

    pub fn applied(&self) -> Vec<Mutation> {
        self.applied.lock().unwrap().clone()
    }

    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    async fn begin_fetch(&self) -> BridgeResult<()> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        if self.gated.load(Ordering::SeqCst) {
            self.entered.notify_one();
            self.release.notified().await;
        }
        let failure = *self.fetch_error.lock().unwrap();
        match failure {
            Some(failure) => Err(failure()),
            None => Ok(()),
        }
    }

    fn batch<F>(&self, keep: F) -> EntityBatch
    where
        F: Fn(&Entity) -> bool,
    {
        let mut batch = EntityBatch::new();
        for entity in self.entities.lock().unwrap().values().filter(|e| keep(e)) {
            batch
                .entry(entity.entity_type.clone())
                .or_insert_with(Vec::new)
                .push(entity.clone());
        }
        batch
    }
}

#[async_trait]
impl DataSource for ScriptedSource {
    async fn fetch_all(&self, _options: &FetchOptions) -> BridgeResult<EntityBatch> {
        self.begin_fetch().await?;
        Ok(self.batch(|_| true))
    }

    fn supports_modified_since(&self) -> bool {
        self.modified_since.load(Ordering::SeqCst)
    }

    async fn fetch_modified_since(
        &self,
        since: DateTime<Utc>,
        _options: &FetchOptions,
    ) -> BridgeResult<EntityBatch> {
        self.begin_fetch().await?;
        Ok(self.batch(|entity| entity.last_modified > since))
    }

    async fn fetch_by_ids(&self, ids: &[EntityId]) -> BridgeResult<Vec<Entity>> {
        self.begin_fetch().await?;
        let entities = self.entities.lock().unwrap();
        Ok(ids.iter().filter_map(|id| entities.get(id).cloned()).collect())
    }

    async fn apply_mutation(&self, mutation: &Mutation) -> BridgeResult<()> {
        let failure = *self.mutation_error.lock().unwrap();
        if let Some(failure) = failure {
            return Err(failure());
        }
        self.applied.lock().unwrap().push(mutation.clone());
        Ok(())
    }
}

/// Monitor the test flips on and off.
pub struct ToggleMonitor {
    online: AtomicBool,
}

impl ToggleMonitor {
    pub fn new(online: bool) -> Arc<Self> {
        Arc::new(Self {
            online: AtomicBool::new(online),
        })
    }

    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }
}

#[async_trait]
impl NetworkMonitor for ToggleMonitor {
    async fn get_network_info(&self) -> BridgeResult<NetworkInfo> {
        if self.online.load(Ordering::SeqCst) {
            Ok(NetworkInfo::connected(NetworkType::WiFi))
        } else {
            Ok(NetworkInfo::disconnected())
        }
    }
}

/// Memory store whose writes the test can make fail.
#[derive(Default)]
pub struct FlakyStore {
    inner: MemoryKeyValueStore,
    failing: AtomicBool,
}

impl FlakyStore {
    pub fn fail_writes(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    fn check(&self) -> BridgeResult<()> {
        if self.failing.load(Ordering::SeqCst) {
            Err(BridgeError::OperationFailed("disk full".to_string()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl KeyValueStore for FlakyStore {
    async fn get(&self, key: &str) -> BridgeResult<Option<String>> {
        self.inner.get(key).await
    }

    async fn set(&self, key: &str, value: &str) -> BridgeResult<()> {
        self.check()?;
        self.inner.set(key, value).await
    }

    async fn delete(&self, key: &str) -> BridgeResult<()> {
        self.check()?;
        self.inner.delete(key).await
    }
}

#[derive(Default)]
pub struct RecordingSink {
    received: Mutex<Vec<ChangeNotification>>,
}

impl RecordingSink {
    pub fn received(&self) -> Vec<ChangeNotification> {
        self.received.lock().unwrap().clone()
    }

    pub fn clear(&self) {
        self.received.lock().unwrap().clear();
    }
}

#[async_trait]
impl ChangeNotificationSink for RecordingSink {
    async fn notify(&self, notification: ChangeNotification) -> BridgeResult<()> {
        self.received.lock().unwrap().push(notification);
        Ok(())
    }
}

// ============================================================================
// Harness
// ============================================================================

pub struct Harness {
    pub orchestrator: Arc<SyncOrchestrator>,
    pub source: Arc<ScriptedSource>,
    pub monitor: Arc<ToggleMonitor>,
    pub sink: Arc<RecordingSink>,
    pub clock: Arc<ManualClock>,
    pub store: Arc<FlakyStore>,
}

pub async fn harness(source: Arc<ScriptedSource>) -> Harness {
    harness_with(source, SyncConfig::default()).await
}

pub async fn harness_with(source: Arc<ScriptedSource>, config: SyncConfig) -> Harness {
    let store = Arc::new(FlakyStore::default());
    build(source, store, config).await
}

/// Builds an orchestrator over an existing store, as a restart would.
pub async fn build(
    source: Arc<ScriptedSource>,
    store: Arc<FlakyStore>,
    config: SyncConfig,
) -> Harness {
    let monitor = ToggleMonitor::new(true);
    let sink = Arc::new(RecordingSink::default());
    let clock = Arc::new(ManualClock::new(at(100)));

    let core = CoreConfig::builder()
        .data_source(source.clone())
        .key_value_store(store.clone())
        .network_monitor(monitor.clone())
        .notification_sink(sink.clone())
        .clock(clock.clone())
        .enable_network_awareness(true)
        .build()
        .unwrap();

    let orchestrator = SyncOrchestrator::new(&core, config).await.unwrap();

    Harness {
        orchestrator,
        source,
        monitor,
        sink,
        clock,
        store,
    }
}

pub fn unreachable() -> BridgeError {
    BridgeError::Unreachable("connection refused".to_string())
}

pub fn rejected() -> BridgeError {
    BridgeError::OperationFailed("HTTP 500".to_string())
}
