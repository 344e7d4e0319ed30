//! # Sync Orchestrator
//!
//! Top-level service that owns the sync status and the in-memory snapshot.
//!
//! ## Overview
//!
//! The `SyncOrchestrator` is constructed once at startup and shared behind an
//! `Arc`. It coordinates:
//! - Fetching from the `DataSource` per strategy (full, incremental, delta, priority)
//! - Diffing the fetch against the snapshot via the `ChangeTracker`
//! - Reconciling locally modified entities via the `ConflictResolver`
//! - Replaying local mutations and retry intents via the `OfflineQueue`
//! - Publishing `SyncEvent`s on the `EventBus` and change notifications to the host
//!
//! ## Workflow
//!
//! 1. Reject the trigger unless the status is `Idle` or `Error`
//! 2. Move to `Syncing` and fetch
//! 3. Detect changes per entity type and apply them in emission order
//! 4. Notify the presentation layer with the whole batch
//! 5. Confirm the changes, advance the marker (full/incremental only)
//! 6. Return to `Idle` (or `Paused` if a pause was requested meanwhile)
//!
//! A fetch failure ends the run in `Offline` (connectivity) or `Error`; it is
//! returned as [`SyncOutcome::Failed`], never as an `Err`.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use core_sync::{SyncConfig, SyncOrchestrator};
//!
//! # async fn example(core: core_runtime::config::CoreConfig) -> core_sync::Result<()> {
//! let orchestrator = SyncOrchestrator::new(&core, SyncConfig::default()).await?;
//!
//! orchestrator.perform_full_sync().await;
//! orchestrator.mark_items_of_interest(vec!["42".into()]).await;
//! orchestrator.perform_priority_sync().await;
//!
//! let status = orchestrator.get_status().await;
//! println!("{} pending, {} queued", status.pending_change_count, status.queue_length);
//! # Ok(())
//! # }
//! ```

use crate::change_tracker::{field_diff, ChangePayload, ChangeRecord, ChangeTracker};
use crate::config::SyncConfig;
use crate::conflict_resolver::{ConflictKind, ConflictResolver};
use crate::error::{Result, SyncError};
use crate::offline_queue::{
    OfflineQueue, OperationExecutor, QueueItemId, QueueOperation, QueueSettings, QueueStatus,
};
use crate::session::{SkipReason, SyncOutcome, SyncReport, SyncRequest, SyncSession, SyncStrategy};
use crate::status::{SyncStateMachine, SyncStatus};
use async_trait::async_trait;
use bridge_traits::{
    BridgeError, ChangeKind, ChangeNotification, ChangeNotificationSink, Clock, DataSource, Entity,
    EntityBatch, EntityId, EntityKey, EntityType, Mutation, MutationKind, NetworkMonitor, Priority,
};
use chrono::{DateTime, Utc};
use core_runtime::config::{CoreConfig, FeatureFlags};
use core_runtime::events::{EventBus, EventStream, EventSubscription, SyncEvent, SyncEventKind};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, error, info, instrument, warn};

type Snapshot = HashMap<EntityType, BTreeMap<EntityId, Entity>>;

/// Point-in-time view for the presentation layer.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusSnapshot {
    pub status: SyncStatus,
    pub last_sync_at: Option<DateTime<Utc>>,
    pub pending_change_count: usize,
    pub queue_length: usize,
    /// Most recent failure reason while in `Error` or `Offline`
    pub last_error: Option<String>,
    /// Entities waiting for a human decision
    pub awaiting_resolution: usize,
}

/// One entity type's slice of a fetch, paired with what the snapshot held.
struct TypeScope {
    entity_type: EntityType,
    current: Vec<Entity>,
    previous: Vec<Entity>,
}

enum Reconciled {
    Apply(ChangeRecord),
    Park { remote: Entity, fields: Vec<String> },
    Skip,
}

pub struct SyncOrchestrator {
    config: SyncConfig,
    features: FeatureFlags,
    data_source: Arc<dyn DataSource>,
    monitor: Arc<dyn NetworkMonitor>,
    sink: Arc<dyn ChangeNotificationSink>,
    clock: Arc<dyn Clock>,
    event_bus: EventBus,
    tracker: Arc<Mutex<ChangeTracker>>,
    resolver: ConflictResolver,
    queue: OfflineQueue,
    state: Mutex<SyncStateMachine>,
    snapshot: RwLock<Snapshot>,
    interest: Mutex<BTreeSet<EntityId>>,
    /// Remote versions held back until `submit_resolution`
    parked: Mutex<HashMap<EntityKey, Entity>>,
    /// Strategies to rerun, recorded when retry intents are replayed
    requested: Arc<Mutex<Vec<SyncRequest>>>,
}

impl SyncOrchestrator {
    /// Builds the orchestrator, restoring the sync marker and offline queue.
    ///
    /// Starts `Offline` when the monitor reports no connectivity; otherwise
    /// restored queue items are replayed before this returns.
    pub async fn new(core: &CoreConfig, config: SyncConfig) -> Result<Arc<Self>> {
        config.validate()?;

        let event_bus = EventBus::new(core.event_buffer_size);
        let tracker = Arc::new(Mutex::new(
            ChangeTracker::load(core.key_value_store.clone(), core.clock.clone(), &config).await?,
        ));
        let requested = Arc::new(Mutex::new(Vec::new()));

        let executor = Arc::new(ReplayExecutor {
            data_source: core.data_source.clone(),
            tracker: tracker.clone(),
            requested: requested.clone(),
        });
        let queue = OfflineQueue::load(
            core.key_value_store.clone(),
            executor,
            event_bus.clone(),
            core.clock.clone(),
            QueueSettings::from(&config),
        )
        .await?;

        let connected = core.network_monitor.is_connected().await;
        let initial = if connected {
            SyncStatus::Idle
        } else {
            SyncStatus::Offline
        };

        info!(status = %initial, features = ?core.features, "Sync orchestrator initialized");

        let orchestrator = Arc::new(Self {
            resolver: ConflictResolver::from_config(&config),
            features: core.features,
            data_source: core.data_source.clone(),
            monitor: core.network_monitor.clone(),
            sink: core.notification_sink.clone(),
            clock: core.clock.clone(),
            state: Mutex::new(SyncStateMachine::new(initial, core.clock.now())),
            snapshot: RwLock::new(HashMap::new()),
            interest: Mutex::new(BTreeSet::new()),
            parked: Mutex::new(HashMap::new()),
            config,
            event_bus,
            tracker,
            queue,
            requested,
        });

        orchestrator.queue.set_online(connected).await?;

        Ok(orchestrator)
    }

    // ========================================================================
    // Sync triggers
    // ========================================================================

    #[instrument(skip(self))]
    pub async fn perform_full_sync(&self) -> SyncOutcome {
        self.run(SyncRequest::Full).await
    }

    #[instrument(skip(self))]
    pub async fn perform_incremental_sync(&self) -> SyncOutcome {
        self.run(SyncRequest::Incremental).await
    }

    #[instrument(skip(self, ids), fields(requested = ids.len()))]
    pub async fn perform_delta_sync(&self, ids: Vec<EntityId>) -> SyncOutcome {
        self.run(SyncRequest::Delta { ids }).await
    }

    #[instrument(skip(self))]
    pub async fn perform_priority_sync(&self) -> SyncOutcome {
        self.run(SyncRequest::Priority).await
    }

    async fn run(&self, request: SyncRequest) -> SyncOutcome {
        let strategy = request.strategy();

        if self.features.enable_network_awareness && !self.monitor.is_connected().await {
            self.enter_offline().await;
            return SyncOutcome::Skipped(SkipReason::Offline);
        }

        let interest = self.interest.lock().await.clone();
        let targets: Option<Vec<EntityId>> = match &request {
            SyncRequest::Delta { ids } => Some(distinct_ids(ids.iter())),
            SyncRequest::Priority => Some(interest.iter().cloned().collect()),
            SyncRequest::Full | SyncRequest::Incremental => None,
        };
        if targets.as_ref().map_or(false, Vec::is_empty) {
            debug!(strategy = %strategy, "Nothing to sync");
            return SyncOutcome::Skipped(SkipReason::NothingToSync);
        }

        if let Err(reason) = self.begin().await {
            debug!(strategy = %strategy, %reason, "Sync trigger ignored");
            return SyncOutcome::Skipped(reason);
        }

        let mut session = SyncSession::new(strategy, self.clock.now());
        info!(session_id = %session.id, strategy = %strategy, "Sync started");

        match self
            .execute(&request, targets.as_deref(), &interest, &mut session)
            .await
        {
            Ok(()) => self.complete(session, targets).await,
            Err(err) => self.fail(request, err).await,
        }
    }

    /// Moves to `Syncing`, or says why the trigger is a no-op.
    async fn begin(&self) -> std::result::Result<(), SkipReason> {
        let mut state = self.state.lock().await;
        match state.status() {
            SyncStatus::Syncing => return Err(SkipReason::AlreadySyncing),
            SyncStatus::Offline => return Err(SkipReason::Offline),
            status if !status.accepts_trigger() || state.pause_requested() => {
                return Err(SkipReason::Paused)
            }
            _ => {}
        }

        if self.transition(&mut state, SyncStatus::Syncing) {
            Ok(())
        } else {
            Err(SkipReason::AlreadySyncing)
        }
    }

    async fn execute(
        &self,
        request: &SyncRequest,
        targets: Option<&[EntityId]>,
        interest: &BTreeSet<EntityId>,
        session: &mut SyncSession,
    ) -> Result<()> {
        let scopes = match (request, targets) {
            (SyncRequest::Full, _) => self.plan_full(session).await?,
            (SyncRequest::Incremental, _) => {
                let marker = self.tracker.lock().await.last_synced_at();
                match marker {
                    Some(since) => self.plan_incremental(since, session).await?,
                    None => {
                        info!("No sync marker yet, incremental sync runs as full");
                        self.plan_full(session).await?
                    }
                }
            }
            (_, Some(ids)) => self.plan_delta(ids, session).await?,
            (_, None) => Vec::new(),
        };

        // The marker is the last fallible step, so it goes before anything
        // becomes visible to the snapshot or the sink.
        if session.strategy.advances_marker() {
            self.tracker
                .lock()
                .await
                .advance_sync_marker(Some(session.started_at))
                .await?;
        }

        let notifications = self.apply(scopes, interest, session).await;
        if !notifications.is_empty() {
            if let Err(e) = self.sink.notify_batch(notifications).await {
                warn!(error = %e, "Change notification sink failed");
            }
        }

        let mut tracker = self.tracker.lock().await;
        tracker.mark_synced(&session.changes);
        tracker.collect_garbage(self.config.ledger_retention);

        Ok(())
    }

    async fn complete(&self, session: SyncSession, targets: Option<Vec<EntityId>>) -> SyncOutcome {
        if session.strategy == SyncStrategy::Priority {
            if let Some(ids) = &targets {
                let mut interest = self.interest.lock().await;
                for id in ids {
                    interest.remove(id);
                }
            }
        }

        let report = session.finish(self.clock.now());
        {
            let mut state = self.state.lock().await;
            self.transition(&mut state, SyncStatus::Idle);
            if state.pause_requested() {
                self.transition(&mut state, SyncStatus::Paused);
                state.request_pause(false);
            }
        }

        info!(
            session_id = %report.session_id,
            strategy = %report.strategy,
            created = report.stats.created,
            updated = report.stats.updated,
            deleted = report.stats.deleted,
            conflicts = report.stats.conflicts,
            skipped = report.stats.skipped,
            duration_ms = report.duration_ms(),
            "Sync completed"
        );

        self.event_bus.emit(completion_event(&report, targets.as_deref())).ok();
        SyncOutcome::Completed(report)
    }

    async fn fail(&self, request: SyncRequest, err: SyncError) -> SyncOutcome {
        let strategy = request.strategy();
        let offline = err.is_connectivity() || !self.monitor.is_connected().await;
        let message = err.to_string();

        error!(strategy = %strategy, error = %message, offline, "Sync failed");

        {
            let mut state = self.state.lock().await;
            let to = if offline {
                SyncStatus::Offline
            } else {
                SyncStatus::Error
            };
            match state.fail(to, message.clone(), self.clock.now()) {
                Ok(from) => self.announce(from, to),
                Err(e) => error!(error = %e, "Rejected status change"),
            }
        }

        if offline {
            if let Err(e) = self.queue.set_online(false).await {
                warn!(error = %e, "Failed to pause offline queue");
            }
            if let Err(e) = self
                .queue
                .enqueue(QueueOperation::RetrySync { request }, Priority::High)
                .await
            {
                warn!(error = %e, "Failed to queue sync retry");
            }
        }

        self.event_bus
            .emit(SyncEvent::Error {
                message: message.clone(),
                strategy: Some(strategy.to_string()),
                recoverable: offline,
            })
            .ok();

        SyncOutcome::Failed {
            error: message,
            offline,
        }
    }

    // ========================================================================
    // Fetch planning
    // ========================================================================

    async fn plan_full(&self, session: &mut SyncSession) -> Result<Vec<TypeScope>> {
        let options = &self.config.fetch_options;
        let mut batch = self
            .data_source
            .fetch_all(options)
            .await
            .map_err(|e| fetch_failure(session.strategy, e))?;

        let snapshot = self.snapshot.read().await;
        let mut types: BTreeSet<EntityType> = batch.keys().cloned().collect();
        if options.entity_types.is_empty() {
            types.extend(snapshot.keys().cloned());
        } else {
            types.extend(options.entity_types.iter().cloned());
        }

        let scopes = types
            .into_iter()
            .map(|entity_type| {
                let fetched = batch.remove(&entity_type).unwrap_or_default();
                let current = accept(&entity_type, fetched, session);
                let previous = snapshot
                    .get(&entity_type)
                    .map(|entities| entities.values().cloned().collect())
                    .unwrap_or_default();
                TypeScope {
                    entity_type,
                    current,
                    previous,
                }
            })
            .collect();

        Ok(scopes)
    }

    async fn plan_incremental(
        &self,
        since: DateTime<Utc>,
        session: &mut SyncSession,
    ) -> Result<Vec<TypeScope>> {
        let options = &self.config.fetch_options;
        let batch: EntityBatch = if self.data_source.supports_modified_since() {
            self.data_source
                .fetch_modified_since(since, options)
                .await
                .map_err(|e| fetch_failure(session.strategy, e))?
        } else {
            warn!(
                marker = %since,
                "Data source cannot filter by modification time; incremental sync degraded to a full fetch"
            );
            session.degraded = true;
            let mut batch = self
                .data_source
                .fetch_all(options)
                .await
                .map_err(|e| fetch_failure(session.strategy, e))?;
            for entities in batch.values_mut() {
                entities.retain(|entity| entity.last_modified > since);
            }
            batch
        };

        let snapshot = self.snapshot.read().await;
        let ordered: BTreeMap<EntityType, Vec<Entity>> = batch.into_iter().collect();
        let mut scopes = Vec::with_capacity(ordered.len());

        for (entity_type, fetched) in ordered {
            let current = accept(&entity_type, fetched, session);
            if current.is_empty() {
                continue;
            }
            let previous = match snapshot.get(&entity_type) {
                Some(entities) => current
                    .iter()
                    .filter_map(|entity| entities.get(&entity.id).cloned())
                    .collect(),
                None => Vec::new(),
            };
            scopes.push(TypeScope {
                entity_type,
                current,
                previous,
            });
        }

        Ok(scopes)
    }

    /// Requested ids the fetch no longer returns are reported as deleted.
    async fn plan_delta(
        &self,
        ids: &[EntityId],
        session: &mut SyncSession,
    ) -> Result<Vec<TypeScope>> {
        let fetched = self
            .data_source
            .fetch_by_ids(ids)
            .await
            .map_err(|e| fetch_failure(session.strategy, e))?;

        let requested: HashSet<&EntityId> = ids.iter().collect();
        let mut by_type: BTreeMap<EntityType, Vec<Entity>> = BTreeMap::new();
        for entity in fetched {
            if !entity.has_identity() {
                warn!(entity_type = %entity.entity_type, "Skipping entity without an id");
                session.record_skip();
                continue;
            }
            if !requested.contains(&entity.id) {
                debug!(entity = %entity.key(), "Ignoring entity that was not requested");
                continue;
            }
            by_type
                .entry(entity.entity_type.clone())
                .or_default()
                .push(entity);
        }

        let snapshot = self.snapshot.read().await;
        for (entity_type, entities) in snapshot.iter() {
            if ids.iter().any(|id| entities.contains_key(id)) {
                by_type.entry(entity_type.clone()).or_default();
            }
        }

        let scopes = by_type
            .into_iter()
            .map(|(entity_type, current)| {
                let previous = snapshot
                    .get(&entity_type)
                    .map(|entities| ids.iter().filter_map(|id| entities.get(id).cloned()).collect())
                    .unwrap_or_default();
                TypeScope {
                    entity_type,
                    current,
                    previous,
                }
            })
            .collect();

        Ok(scopes)
    }

    // ========================================================================
    // Applying changes
    // ========================================================================

    async fn apply(
        &self,
        scopes: Vec<TypeScope>,
        interest: &BTreeSet<EntityId>,
        session: &mut SyncSession,
    ) -> Vec<ChangeNotification> {
        let locally_modified = self.queue.pending_keys().await;
        let parked: HashSet<EntityKey> = self.parked.lock().await.keys().cloned().collect();
        let mut to_park = Vec::new();
        let mut notifications = Vec::new();

        {
            let mut tracker = self.tracker.lock().await;
            let mut snapshot = self.snapshot.write().await;

            for scope in scopes {
                let changes = match tracker.detect_changes(
                    &scope.current,
                    &scope.previous,
                    &scope.entity_type,
                ) {
                    Ok(changes) => changes,
                    Err(e) => {
                        warn!(entity_type = %scope.entity_type, error = %e, "Skipping malformed batch");
                        session.record_skip();
                        continue;
                    }
                };

                for change in changes {
                    let key = change.key();
                    if parked.contains(&key) {
                        debug!(entity = %key, "Awaiting manual resolution, skipped");
                        session.record_skip();
                        continue;
                    }

                    let change = if change.kind == ChangeKind::Updated && locally_modified.contains(&key) {
                        match self.reconcile(change, session) {
                            Reconciled::Apply(change) => change,
                            Reconciled::Park { remote, fields } => {
                                to_park.push((key, remote, fields));
                                continue;
                            }
                            Reconciled::Skip => {
                                session.record_skip();
                                continue;
                            }
                        }
                    } else {
                        change
                    };

                    let entities = snapshot.entry(change.entity_type.clone()).or_default();
                    match change.payload.current() {
                        Some(entity) => {
                            entities.insert(change.entity_id.clone(), entity.clone());
                        }
                        None => {
                            entities.remove(&change.entity_id);
                        }
                    }

                    let priority = if session.strategy == SyncStrategy::Priority
                        || interest.contains(&change.entity_id)
                    {
                        Priority::High
                    } else {
                        Priority::Normal
                    };
                    notifications.push(ChangeNotification {
                        entity_type: change.entity_type.clone(),
                        entity_id: change.entity_id.clone(),
                        kind: change.kind,
                        payload: change.payload.current().cloned(),
                        priority,
                    });

                    session.record(tracker.track(change));
                }
            }
        }

        if !to_park.is_empty() {
            let mut parked = self.parked.lock().await;
            for (key, remote, fields) in to_park {
                if parked.insert(key.clone(), remote).is_some() {
                    continue;
                }
                let ambiguous = SyncError::ResolutionAmbiguous {
                    entity: key.to_string(),
                };
                info!(error = %ambiguous, fields = ?fields, "Entity parked for manual resolution");
                self.event_bus
                    .emit(SyncEvent::ResolutionRequired {
                        entity_type: key.entity_type.to_string(),
                        entity_id: key.entity_id.to_string(),
                        fields,
                    })
                    .ok();
            }
        }

        notifications
    }

    /// Resolves a remote update against the local edit it collides with.
    fn reconcile(&self, change: ChangeRecord, session: &mut SyncSession) -> Reconciled {
        let (local, remote) = match &change.payload {
            ChangePayload::Updated {
                current, previous, ..
            } => (previous.clone(), current.clone()),
            _ => return Reconciled::Apply(change),
        };

        let kind = if self.config.requires_manual_resolution(&change.entity_type) {
            ConflictKind::Manual
        } else {
            ConflictKind::Concurrent
        };

        let resolution = match self.resolver.resolve(&local, &remote, kind) {
            Ok(resolution) => resolution,
            Err(e) => {
                warn!(entity = %change.key(), error = %e, "Conflict resolution failed, entity skipped");
                return Reconciled::Skip;
            }
        };
        session.record_conflict();

        if resolution.needs_user_input {
            return Reconciled::Park {
                fields: resolution.conflicting_fields(),
                remote,
            };
        }

        let Some(merged) = resolution.merged else {
            return Reconciled::Skip;
        };

        debug!(
            entity = %change.key(),
            strategy = %resolution.strategy,
            conflicts = resolution.field_conflicts.len(),
            "Conflict resolved"
        );

        Reconciled::Apply(ChangeRecord {
            payload: ChangePayload::Updated {
                field_diff: field_diff(&merged, &local),
                current: merged,
                previous: local,
            },
            ..change
        })
    }

    // ========================================================================
    // Connectivity and lifecycle
    // ========================================================================

    /// Heartbeat: reconciles the status with the network monitor.
    ///
    /// Never interrupts a run in flight. Reconnection drains the offline
    /// queue and then reruns any sync whose retry intent was replayed.
    #[instrument(skip(self))]
    pub async fn check_connectivity(&self) -> SyncStatus {
        let connected = self.monitor.is_connected().await;

        let queue_online = {
            let mut state = self.state.lock().await;
            match (state.status(), connected) {
                (SyncStatus::Syncing, _) => return SyncStatus::Syncing,
                (SyncStatus::Offline, true) => {
                    info!("Connectivity restored");
                    self.transition(&mut state, SyncStatus::Idle);
                    if state.pause_requested() {
                        self.transition(&mut state, SyncStatus::Paused);
                        state.request_pause(false);
                    }
                    true
                }
                (SyncStatus::Idle | SyncStatus::Error | SyncStatus::Paused, false) => {
                    warn!("Connectivity lost");
                    self.go_offline(&mut state);
                    false
                }
                (_, connected) => connected,
            }
        };

        if let Err(e) = self.queue.set_online(queue_online).await {
            warn!(error = %e, "Offline queue drain failed");
        }

        if self.status().await == SyncStatus::Idle {
            self.run_requested().await;
        }

        self.status().await
    }

    async fn enter_offline(&self) {
        {
            let mut state = self.state.lock().await;
            if !self.go_offline(&mut state) {
                return;
            }
        }
        if let Err(e) = self.queue.set_online(false).await {
            warn!(error = %e, "Failed to pause offline queue");
        }
    }

    /// Moves a settled engine to `Offline`. A pause survives as a pending
    /// request so reconnection lands back in `Paused`.
    fn go_offline(&self, state: &mut SyncStateMachine) -> bool {
        match state.status() {
            SyncStatus::Idle | SyncStatus::Error => self.transition(state, SyncStatus::Offline),
            SyncStatus::Paused => {
                state.request_pause(true);
                self.transition(state, SyncStatus::Offline)
            }
            _ => false,
        }
    }

    async fn run_requested(&self) {
        loop {
            let next = {
                let mut requested = self.requested.lock().await;
                if requested.is_empty() {
                    return;
                }
                requested.remove(0)
            };

            debug!(strategy = %next.strategy(), "Rerunning sync after reconnect");
            let outcome = self.run(next.clone()).await;
            if let SyncOutcome::Skipped(
                SkipReason::AlreadySyncing | SkipReason::Paused | SkipReason::Offline,
            ) = outcome
            {
                self.requested.lock().await.insert(0, next);
                return;
            }
        }
    }

    /// Suppresses future triggers.
    ///
    /// From `Idle` this pauses at once; otherwise the request is remembered
    /// and honored when the engine next returns to `Idle`.
    pub async fn pause(&self) -> SyncStatus {
        let mut state = self.state.lock().await;
        match state.status() {
            SyncStatus::Idle => {
                self.transition(&mut state, SyncStatus::Paused);
            }
            SyncStatus::Paused => {}
            other => {
                debug!(status = %other, "Pause deferred until idle");
                state.request_pause(true);
            }
        }
        state.status()
    }

    pub async fn resume(&self) -> SyncStatus {
        let mut state = self.state.lock().await;
        state.request_pause(false);
        if state.status() == SyncStatus::Paused {
            self.transition(&mut state, SyncStatus::Idle);
        }
        state.status()
    }

    fn transition(&self, state: &mut SyncStateMachine, to: SyncStatus) -> bool {
        match state.transition(to, self.clock.now()) {
            Ok(from) => {
                self.announce(from, to);
                true
            }
            Err(e) => {
                error!(error = %e, "Rejected status change");
                false
            }
        }
    }

    fn announce(&self, from: SyncStatus, to: SyncStatus) {
        debug!(%from, %to, "Sync status changed");
        self.event_bus
            .emit(SyncEvent::StatusChanged {
                from: from.to_string(),
                to: to.to_string(),
            })
            .ok();
    }

    // ========================================================================
    // Local edits
    // ========================================================================

    /// Adds ids to the high-interest set served by priority sync.
    pub async fn mark_items_of_interest(&self, ids: impl IntoIterator<Item = EntityId>) {
        let mut interest = self.interest.lock().await;
        interest.extend(ids.into_iter().filter(|id| !id.is_blank()));
    }

    pub async fn items_of_interest(&self) -> Vec<EntityId> {
        self.interest.lock().await.iter().cloned().collect()
    }

    /// Applies a local edit optimistically and queues it for the remote.
    ///
    /// The entity counts as locally modified until the queued mutation is
    /// replayed, so remote updates to it go through the conflict resolver.
    /// If the mutation cannot be queued the snapshot and ledger are left as
    /// they were.
    #[instrument(skip(self, mutation), fields(entity = %mutation.key()))]
    pub async fn submit_mutation(&self, mutation: Mutation, priority: Priority) -> Result<QueueItemId> {
        if mutation.entity_id.is_blank() {
            return Err(SyncError::MalformedEntity(format!(
                "{} mutation without an id",
                mutation.entity_type
            )));
        }

        let now = self.clock.now();
        let key = mutation.key();
        let (payload, existing, written) = {
            let mut snapshot = self.snapshot.write().await;
            let entities = snapshot.entry(mutation.entity_type.clone()).or_default();
            let existing = entities.get(&mutation.entity_id).cloned();

            match mutation.kind {
                MutationKind::Delete => {
                    entities.remove(&mutation.entity_id);
                    let previous = existing.clone().unwrap_or_else(|| {
                        Entity::new(mutation.entity_id.clone(), mutation.entity_type.clone(), now)
                    });
                    (ChangePayload::Deleted { previous }, existing, None)
                }
                MutationKind::Create | MutationKind::Update => {
                    let mut entity = match (&existing, mutation.kind) {
                        (Some(entity), MutationKind::Update) => entity.clone(),
                        _ => Entity::new(mutation.entity_id.clone(), mutation.entity_type.clone(), now),
                    };
                    for (name, value) in &mutation.fields {
                        if value.is_null() {
                            entity.fields.remove(name);
                        } else {
                            entity.fields.insert(name.clone(), value.clone());
                        }
                    }
                    entity.last_modified = now;
                    entities.insert(mutation.entity_id.clone(), entity.clone());

                    let payload = match existing.clone() {
                        Some(previous) => ChangePayload::Updated {
                            field_diff: field_diff(&entity, &previous),
                            current: entity.clone(),
                            previous,
                        },
                        None => ChangePayload::Created {
                            entity: entity.clone(),
                        },
                    };
                    (payload, existing, Some(entity))
                }
            }
        };

        let prior_record = {
            let mut tracker = self.tracker.lock().await;
            let prior = tracker.get(&key).cloned();
            if let Err(e) = tracker.record_change(
                mutation.entity_id.clone(),
                mutation.entity_type.clone(),
                payload.kind(),
                payload,
                Some(now),
            ) {
                drop(tracker);
                self.revert_snapshot(&key, written.as_ref(), existing).await;
                return Err(e);
            }
            prior
        };

        match self
            .queue
            .enqueue(QueueOperation::Mutation { mutation }, priority)
            .await
        {
            Ok(id) => Ok(id),
            Err(e) => {
                warn!(error = %e, "Local edit could not be queued, reverted");
                self.tracker.lock().await.restore(&key, prior_record);
                self.revert_snapshot(&key, written.as_ref(), existing).await;
                Err(e)
            }
        }
    }

    /// Undoes a local snapshot edit, unless something replaced it meanwhile.
    async fn revert_snapshot(&self, key: &EntityKey, written: Option<&Entity>, previous: Option<Entity>) {
        let mut snapshot = self.snapshot.write().await;
        let entities = snapshot.entry(key.entity_type.clone()).or_default();
        if entities.get(&key.entity_id) != written {
            return;
        }
        match previous {
            Some(entity) => {
                entities.insert(key.entity_id.clone(), entity);
            }
            None => {
                entities.remove(&key.entity_id);
            }
        }
    }

    /// Feeds back the human decision for a parked entity.
    #[instrument(skip(self, entity), fields(entity = %entity.key()))]
    pub async fn submit_resolution(&self, entity: Entity) -> Result<QueueItemId> {
        if !entity.has_identity() {
            return Err(SyncError::MalformedEntity(format!(
                "{} resolution without an id",
                entity.entity_type
            )));
        }

        let key = entity.key();
        let Some(remote) = self.parked.lock().await.remove(&key) else {
            return Err(SyncError::ResolutionNotPending {
                entity: key.to_string(),
            });
        };

        let mut resolved = entity;
        resolved.last_modified = self.clock.now();

        let previous = {
            let mut snapshot = self.snapshot.write().await;
            snapshot
                .entry(key.entity_type.clone())
                .or_default()
                .insert(key.entity_id.clone(), resolved.clone())
        };

        let payload = match previous.clone() {
            Some(previous) => ChangePayload::Updated {
                field_diff: field_diff(&resolved, &previous),
                current: resolved.clone(),
                previous,
            },
            None => ChangePayload::Created {
                entity: resolved.clone(),
            },
        };
        let prior_record = {
            let mut tracker = self.tracker.lock().await;
            let prior = tracker.get(&key).cloned();
            let recorded = tracker.record_change(
                key.entity_id.clone(),
                key.entity_type.clone(),
                payload.kind(),
                payload,
                Some(resolved.last_modified),
            );
            recorded.map(|_| prior)
        };
        let prior_record = match prior_record {
            Ok(prior) => prior,
            Err(e) => {
                self.revert_snapshot(&key, Some(&resolved), previous).await;
                self.parked.lock().await.insert(key, remote);
                return Err(e);
            }
        };

        let mutation = Mutation::update(
            key.entity_type.clone(),
            key.entity_id.clone(),
            resolved.fields.clone(),
        );
        let id = match self
            .queue
            .enqueue(QueueOperation::Mutation { mutation }, Priority::High)
            .await
        {
            Ok(id) => id,
            Err(e) => {
                warn!(error = %e, "Resolution could not be queued, still pending");
                self.tracker.lock().await.restore(&key, prior_record);
                self.revert_snapshot(&key, Some(&resolved), previous).await;
                self.parked.lock().await.insert(key, remote);
                return Err(e);
            }
        };

        let notification = ChangeNotification {
            entity_type: key.entity_type.clone(),
            entity_id: key.entity_id.clone(),
            kind: ChangeKind::Updated,
            payload: Some(resolved),
            priority: Priority::High,
        };
        if let Err(e) = self.sink.notify(notification).await {
            warn!(error = %e, "Change notification sink failed");
        }

        info!("Manual resolution accepted");
        Ok(id)
    }

    // ========================================================================
    // Queries
    // ========================================================================

    pub async fn get_status(&self) -> StatusSnapshot {
        let (status, last_error) = {
            let state = self.state.lock().await;
            (state.status(), state.last_error().map(str::to_string))
        };
        let (last_sync_at, pending_change_count) = {
            let tracker = self.tracker.lock().await;
            (tracker.last_synced_at(), tracker.pending_count())
        };

        StatusSnapshot {
            status,
            last_sync_at,
            pending_change_count,
            queue_length: self.queue.len().await,
            last_error,
            awaiting_resolution: self.parked.lock().await.len(),
        }
    }

    pub async fn status(&self) -> SyncStatus {
        self.state.lock().await.status()
    }

    pub async fn queue_status(&self) -> QueueStatus {
        self.queue.status().await
    }

    /// Current snapshot of one entity type, ordered by id.
    pub async fn snapshot(&self, entity_type: &EntityType) -> Vec<Entity> {
        self.snapshot
            .read()
            .await
            .get(entity_type)
            .map(|entities| entities.values().cloned().collect())
            .unwrap_or_default()
    }

    pub async fn entity(&self, key: &EntityKey) -> Option<Entity> {
        self.snapshot
            .read()
            .await
            .get(&key.entity_type)
            .and_then(|entities| entities.get(&key.entity_id).cloned())
    }

    /// Entities waiting for [`submit_resolution`](Self::submit_resolution).
    pub async fn pending_resolutions(&self) -> Vec<EntityKey> {
        let mut keys: Vec<EntityKey> = self.parked.lock().await.keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Calls `handler` for every event of `kind` until the subscription is cancelled.
    pub fn on_event<F>(&self, kind: SyncEventKind, handler: F) -> EventSubscription
    where
        F: Fn(SyncEvent) + Send + Sync + 'static,
    {
        self.event_bus.on(kind, handler)
    }

    pub fn subscribe(&self) -> EventStream {
        self.event_bus.stream()
    }

    pub fn event_bus(&self) -> &EventBus {
        &self.event_bus
    }
}

// ============================================================================
// Queue replay
// ============================================================================

struct ReplayExecutor {
    data_source: Arc<dyn DataSource>,
    tracker: Arc<Mutex<ChangeTracker>>,
    requested: Arc<Mutex<Vec<SyncRequest>>>,
}

#[async_trait]
impl OperationExecutor for ReplayExecutor {
    async fn execute(&self, operation: &QueueOperation) -> Result<()> {
        match operation {
            QueueOperation::Mutation { mutation } => {
                self.data_source.apply_mutation(mutation).await?;
                self.tracker.lock().await.confirm(&mutation.key());
                Ok(())
            }
            QueueOperation::RetrySync { request } => {
                let mut requested = self.requested.lock().await;
                if !requested.contains(request) {
                    requested.push(request.clone());
                }
                Ok(())
            }
        }
    }
}

// ============================================================================
// Helpers
// ============================================================================

fn fetch_failure(strategy: SyncStrategy, err: BridgeError) -> SyncError {
    SyncError::FetchFailure {
        strategy: strategy.to_string(),
        connectivity: err.is_connectivity(),
        message: err.to_string(),
    }
}

/// Drops malformed or mistyped entities from a bulk fetch.
fn accept(entity_type: &EntityType, entities: Vec<Entity>, session: &mut SyncSession) -> Vec<Entity> {
    entities
        .into_iter()
        .filter(|entity| {
            if !entity.has_identity() {
                warn!(entity_type = %entity_type, "Skipping entity without an id");
                session.record_skip();
                false
            } else if &entity.entity_type != entity_type {
                warn!(entity = %entity.key(), listed_as = %entity_type, "Skipping mistyped entity");
                session.record_skip();
                false
            } else {
                true
            }
        })
        .collect()
}

fn distinct_ids<'a>(ids: impl Iterator<Item = &'a EntityId>) -> Vec<EntityId> {
    let mut seen = HashSet::new();
    ids.filter(|id| !id.is_blank() && seen.insert(*id))
        .cloned()
        .collect()
}

fn completion_event(report: &SyncReport, targets: Option<&[EntityId]>) -> SyncEvent {
    let session_id = report.session_id.to_string();
    let duration_ms = report.duration_ms();
    let requested = targets.map_or(0, <[EntityId]>::len);

    match report.strategy {
        SyncStrategy::Full => SyncEvent::FullSync {
            session_id,
            stats: report.stats,
            duration_ms,
        },
        SyncStrategy::Incremental => SyncEvent::IncrementalSync {
            session_id,
            stats: report.stats,
            duration_ms,
            degraded: report.degraded,
        },
        SyncStrategy::Delta => SyncEvent::DeltaSync {
            session_id,
            stats: report.stats,
            duration_ms,
            requested,
            priority: false,
        },
        SyncStrategy::Priority => SyncEvent::DeltaSync {
            session_id,
            stats: report.stats,
            duration_ms,
            requested,
            priority: true,
        },
    }
}
