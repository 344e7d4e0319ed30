//! Background timers driving the orchestrator.
//!
//! Three independent loops share one cancellation token:
//! - auto-refresh: incremental sync every `auto_refresh_interval`
//! - priority: priority sync every `priority_sync_interval` (when enabled)
//! - heartbeat: connectivity check every `heartbeat_interval`
//!
//! A tick that lands while a run is in flight is simply skipped by the
//! orchestrator, so overlapping timers never start concurrent runs.

use crate::config::SyncConfig;
use crate::orchestrator::SyncOrchestrator;
use core_runtime::config::FeatureFlags;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerSettings {
    pub auto_refresh_interval: Duration,
    /// `None` disables the priority loop
    pub priority_sync_interval: Option<Duration>,
    pub heartbeat_interval: Duration,
}

impl SchedulerSettings {
    pub fn from_config(config: &SyncConfig, features: &FeatureFlags) -> Self {
        Self {
            auto_refresh_interval: config.auto_refresh_interval,
            priority_sync_interval: features
                .enable_priority_sync
                .then_some(config.priority_sync_interval),
            heartbeat_interval: config.heartbeat_interval,
        }
    }
}

pub struct SyncScheduler {
    token: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

impl SyncScheduler {
    /// Spawns the timer loops. The first tick of each fires one period after start.
    pub fn start(orchestrator: Arc<SyncOrchestrator>, settings: SchedulerSettings) -> Self {
        let token = CancellationToken::new();
        let mut handles = Vec::with_capacity(3);

        let target = orchestrator.clone();
        handles.push(spawn_loop(
            "auto_refresh",
            settings.auto_refresh_interval,
            token.clone(),
            move || {
                let orchestrator = target.clone();
                async move {
                    orchestrator.perform_incremental_sync().await;
                }
            },
        ));

        if let Some(period) = settings.priority_sync_interval {
            let target = orchestrator.clone();
            handles.push(spawn_loop("priority", period, token.clone(), move || {
                let orchestrator = target.clone();
                async move {
                    orchestrator.perform_priority_sync().await;
                }
            }));
        }

        let target = orchestrator;
        handles.push(spawn_loop(
            "heartbeat",
            settings.heartbeat_interval,
            token.clone(),
            move || {
                let orchestrator = target.clone();
                async move {
                    orchestrator.check_connectivity().await;
                }
            },
        ));

        info!(
            loops = handles.len(),
            auto_refresh_secs = settings.auto_refresh_interval.as_secs(),
            heartbeat_secs = settings.heartbeat_interval.as_secs(),
            "Sync scheduler started"
        );

        Self { token, handles }
    }

    /// Stops all loops after their current action finishes.
    pub fn shutdown(&self) {
        self.token.cancel();
    }

    pub fn is_running(&self) -> bool {
        !self.token.is_cancelled() && self.handles.iter().any(|handle| !handle.is_finished())
    }

    /// Cancels and waits for every loop to exit.
    pub async fn join(mut self) {
        self.token.cancel();
        for handle in std::mem::take(&mut self.handles) {
            if let Err(e) = handle.await {
                warn!(error = %e, "Scheduler loop ended abnormally");
            }
        }
        info!("Sync scheduler stopped");
    }
}

impl Drop for SyncScheduler {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

fn spawn_loop<F, Fut>(
    name: &'static str,
    period: Duration,
    token: CancellationToken,
    action: F,
) -> JoinHandle<()>
where
    F: Fn() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = ticker.tick() => {}
            }
            debug!(timer = name, "Timer fired");
            action().await;
        }

        debug!(timer = name, "Timer loop exited");
    })
}
