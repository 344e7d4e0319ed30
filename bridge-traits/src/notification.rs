//! Change Notification Sink
//!
//! Intake of the presentation layer. The core pushes one notification per
//! applied change; how the host renders, batches, or debounces them is
//! outside the core.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::entity::{ChangeKind, Entity, EntityId, EntityType, Priority};
use crate::error::Result;

/// A single applied change, as seen by the presentation layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeNotification {
    pub entity_type: EntityType,
    pub entity_id: EntityId,
    pub kind: ChangeKind,
    /// Merged entity; `None` for deletions
    pub payload: Option<Entity>,
    pub priority: Priority,
}

#[async_trait]
pub trait ChangeNotificationSink: Send + Sync {
    async fn notify(&self, notification: ChangeNotification) -> Result<()>;

    /// Deliver a whole sync run's notifications in order.
    async fn notify_batch(&self, batch: Vec<ChangeNotification>) -> Result<()> {
        for notification in batch {
            self.notify(notification).await?;
        }
        Ok(())
    }
}

/// Sink that discards everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopNotificationSink;

#[async_trait]
impl ChangeNotificationSink for NoopNotificationSink {
    async fn notify(&self, _notification: ChangeNotification) -> Result<()> {
        Ok(())
    }
}
