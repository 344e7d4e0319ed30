//! Core service façade and bootstrap helpers.
//!
//! This crate wires host-provided bridge implementations (data source,
//! key-value store, network monitor, notification sink) into the sync core
//! and starts the background scheduler when enabled. Desktop apps typically
//! enable the `desktop-shims` feature (which depends on `bridge-desktop`) and
//! only supply their data source.

pub mod error;

pub use error::{CoreError, Result};

pub use core_runtime::config::{CoreConfig, FeatureFlags};
pub use core_runtime::events::{EventStream, SyncEvent, SyncEventKind};
pub use core_sync::{StatusSnapshot, SyncConfig, SyncOrchestrator, SyncOutcome, SyncStatus};

use core_sync::{SchedulerSettings, SyncScheduler};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::info;

#[cfg(feature = "desktop-shims")]
use bridge_traits::DataSource;
#[cfg(feature = "desktop-shims")]
use std::path::PathBuf;

/// Primary façade exposed to host applications.
///
/// Constructed once at startup; hosts keep it for the lifetime of the app and
/// reach the engine through [`orchestrator`](Self::orchestrator).
pub struct SyncService {
    orchestrator: Arc<SyncOrchestrator>,
    scheduler: Mutex<Option<SyncScheduler>>,
}

impl SyncService {
    /// Builds the orchestrator and, if the feature is on, starts its timers.
    pub async fn bootstrap(core: CoreConfig, sync: SyncConfig) -> Result<Self> {
        let orchestrator = SyncOrchestrator::new(&core, sync.clone()).await?;

        let scheduler = if core.features.enable_scheduler {
            let settings = SchedulerSettings::from_config(&sync, &core.features);
            Some(SyncScheduler::start(orchestrator.clone(), settings))
        } else {
            None
        };

        info!(
            scheduler = scheduler.is_some(),
            network_awareness = core.features.enable_network_awareness,
            "Sync service started"
        );

        Ok(Self {
            orchestrator,
            scheduler: Mutex::new(scheduler),
        })
    }

    /// Shared handle to the orchestrator.
    pub fn orchestrator(&self) -> Arc<SyncOrchestrator> {
        Arc::clone(&self.orchestrator)
    }

    pub async fn is_scheduled(&self) -> bool {
        self.scheduler
            .lock()
            .await
            .as_ref()
            .map_or(false, SyncScheduler::is_running)
    }

    /// Stops the timers and waits for them to exit. In-flight runs finish.
    pub async fn shutdown(&self) {
        let scheduler = self.scheduler.lock().await.take();
        if let Some(scheduler) = scheduler {
            scheduler.join().await;
        }
        info!("Sync service stopped");
    }
}

/// Convenience bootstrapper for desktop hosts.
///
/// Uses the SQLite key-value store at `db_path` and the TCP reachability
/// monitor, with the scheduler, priority sync and network awareness enabled.
///
/// ```ignore
/// use core_service::{bootstrap_desktop, SyncConfig};
///
/// let service = bootstrap_desktop(Arc::new(MyTracker::new()), "sync.db".into(), SyncConfig::default()).await?;
/// service.orchestrator().perform_full_sync().await;
/// ```
#[cfg(feature = "desktop-shims")]
pub async fn bootstrap_desktop(
    data_source: Arc<dyn DataSource>,
    db_path: PathBuf,
    sync: SyncConfig,
) -> Result<SyncService> {
    let store = bridge_desktop::SqliteKeyValueStore::new(db_path)
        .await
        .map_err(|err| CoreError::InitializationFailed(err.to_string()))?;

    let core = CoreConfig::builder()
        .data_source(data_source)
        .key_value_store(Arc::new(store))
        .network_monitor(Arc::new(bridge_desktop::DesktopNetworkMonitor::new()))
        .enable_scheduler(true)
        .enable_priority_sync(true)
        .enable_network_awareness(true)
        .build()?;

    SyncService::bootstrap(core, sync).await
}
