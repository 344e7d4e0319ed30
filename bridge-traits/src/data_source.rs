//! Remote Data Source Abstraction
//!
//! The sync core treats the remote project-tracking service as an abstract
//! data source exposing bulk and filtered fetches. Transport and wire schema
//! are the implementation's concern.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::entity::{Entity, EntityId, EntityKey, EntityType, Fields};
use crate::error::{BridgeError, Result};

/// Entities returned by a fetch, grouped by entity type.
pub type EntityBatch = HashMap<EntityType, Vec<Entity>>;

/// Options forwarded verbatim to the data source on every fetch.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FetchOptions {
    /// Restrict the fetch to these entity types (empty = everything)
    #[serde(default)]
    pub entity_types: Vec<EntityType>,
    /// Source-specific scope such as a project or area path
    pub scope: Option<String>,
    /// Preferred page size for paginated sources
    pub page_size: Option<u32>,
}

impl FetchOptions {
    pub fn with_entity_types(mut self, types: Vec<EntityType>) -> Self {
        self.entity_types = types;
        self
    }

    pub fn with_scope(mut self, scope: impl Into<String>) -> Self {
        self.scope = Some(scope.into());
        self
    }
}

/// Kind of write applied against the remote service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MutationKind {
    Create,
    Update,
    Delete,
}

/// A mutating intent originating from the local user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Mutation {
    pub kind: MutationKind,
    pub entity_type: EntityType,
    pub entity_id: EntityId,
    /// Fields written by the mutation (empty for deletes)
    #[serde(default)]
    pub fields: Fields,
}

impl Mutation {
    pub fn update(entity_type: EntityType, entity_id: impl Into<EntityId>, fields: Fields) -> Self {
        Self {
            kind: MutationKind::Update,
            entity_type,
            entity_id: entity_id.into(),
            fields,
        }
    }

    pub fn key(&self) -> EntityKey {
        EntityKey::new(self.entity_type.clone(), self.entity_id.clone())
    }
}

/// Remote data source trait
///
/// Implementations wrap the remote work-tracking API. `fetch_modified_since`
/// is an optional capability: sources that cannot filter by modification time
/// keep the default `supports_modified_since() == false`, and the core falls
/// back to a full fetch with client-side filtering.
///
/// # Example
///
/// ```ignore
/// use bridge_traits::data_source::{DataSource, FetchOptions};
///
/// async fn count_items(source: &dyn DataSource) -> usize {
///     let batch = source.fetch_all(&FetchOptions::default()).await.unwrap_or_default();
///     batch.values().map(Vec::len).sum()
/// }
/// ```
#[async_trait]
pub trait DataSource: Send + Sync {
    /// Fetch the entire dataset visible under `options`.
    async fn fetch_all(&self, options: &FetchOptions) -> Result<EntityBatch>;

    /// Whether `fetch_modified_since` is implemented by this source.
    fn supports_modified_since(&self) -> bool {
        false
    }

    /// Fetch only entities modified strictly after `since`.
    async fn fetch_modified_since(
        &self,
        _since: DateTime<Utc>,
        _options: &FetchOptions,
    ) -> Result<EntityBatch> {
        Err(BridgeError::NotAvailable(
            "fetch_modified_since".to_string(),
        ))
    }

    /// Fetch a specific set of entities by id. Unknown ids are omitted.
    async fn fetch_by_ids(&self, ids: &[EntityId]) -> Result<Vec<Entity>>;

    /// Apply a local mutation against the remote service.
    async fn apply_mutation(&self, _mutation: &Mutation) -> Result<()> {
        Err(BridgeError::NotAvailable("apply_mutation".to_string()))
    }
}
