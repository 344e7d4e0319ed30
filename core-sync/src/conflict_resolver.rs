//! Conflict Resolution for Sync Operations
//!
//! Reconciles a locally edited entity with the version the remote returned.
//!
//! ## Strategy Selection
//!
//! For a concurrent conflict the resolver picks, in order:
//! 1. **FieldLevel** when none of the differing fields is critical
//! 2. **LastWriteWins** when the modification stamps are within the tolerance
//! 3. The configured default otherwise
//!
//! **Automatic** is used for conflicts the caller judged auto-resolvable, and
//! **UserPrompt** only when the caller asks for it. A prompt never produces a
//! merged entity; the orchestrator parks the entity until a human decides.
//!
//! ## Field-Level Rules
//!
//! Each field follows the schema's authority table: server-owned fields take
//! the remote value, estimate fields keep the local edit, label sets are
//! unioned, and free text keeps the remote text with the local text appended
//! as an addendum. Every differing field is reported in
//! [`ConflictResolution::field_conflicts`], whichever side won.

use crate::config::SyncConfig;
use crate::error::{Result, SyncError};
use crate::schema::{split_labels, text_of, EntitySchema, FieldAuthority, FieldComparator, SchemaRegistry};
use bridge_traits::Entity;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use tracing::debug;

/// Marker between the remote text and the appended local text.
pub const LOCAL_EDIT_MARKER: &str = "\n\n[Local edit] ";

/// Fields the automatic strategy lets the local side overlay.
const OVERLAY_FIELDS: [&str; 2] = ["tags", "description"];

/// Conflict resolution strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ResolutionStrategy {
    /// Per-field authority table
    #[default]
    FieldLevel,

    /// Whole entity from the later-stamped side
    LastWriteWins,

    /// Remote plus local tags/description
    Automatic,

    /// Surface to a human; no merged entity
    UserPrompt,
}

impl ResolutionStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResolutionStrategy::FieldLevel => "fieldLevel",
            ResolutionStrategy::LastWriteWins => "lastWriteWins",
            ResolutionStrategy::Automatic => "automatic",
            ResolutionStrategy::UserPrompt => "userPrompt",
        }
    }
}

impl fmt::Display for ResolutionStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResolutionStrategy {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "fieldLevel" => Ok(ResolutionStrategy::FieldLevel),
            "lastWriteWins" => Ok(ResolutionStrategy::LastWriteWins),
            "automatic" => Ok(ResolutionStrategy::Automatic),
            "userPrompt" => Ok(ResolutionStrategy::UserPrompt),
            _ => Err(SyncError::InvalidStrategy(s.to_string())),
        }
    }
}

/// How the caller classified the conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConflictKind {
    #[default]
    Concurrent,
    AutoResolvable,
    Manual,
}

/// Rule that produced a field's resolved value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FieldRule {
    RemoteWins,
    LocalWins,
    LabelUnion,
    TextMerge,
    LastWriteWins,
    LocalOverlay,
    Unresolved,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldConflict {
    pub field: String,
    pub local_value: Option<Value>,
    pub remote_value: Option<Value>,
    pub resolved_value: Option<Value>,
    pub rule: FieldRule,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConflictResolution {
    /// `None` when the strategy is `UserPrompt`
    pub merged: Option<Entity>,
    pub strategy: ResolutionStrategy,
    pub field_conflicts: Vec<FieldConflict>,
    pub needs_user_input: bool,
}

impl ConflictResolution {
    pub fn conflicting_fields(&self) -> Vec<String> {
        self.field_conflicts.iter().map(|c| c.field.clone()).collect()
    }
}

/// Stateless resolver; identical inputs always yield identical output.
#[derive(Debug, Clone)]
pub struct ConflictResolver {
    schemas: SchemaRegistry,
    tolerance: Duration,
    default_strategy: ResolutionStrategy,
    separator: String,
}

impl ConflictResolver {
    pub fn new(schemas: SchemaRegistry) -> Self {
        Self {
            schemas,
            tolerance: Duration::from_secs(5),
            default_strategy: ResolutionStrategy::FieldLevel,
            separator: ";".to_string(),
        }
    }

    pub fn from_config(config: &SyncConfig) -> Self {
        Self {
            schemas: config.schemas.clone(),
            tolerance: config.conflict_tolerance,
            default_strategy: config.default_strategy,
            separator: config.label_separator.clone(),
        }
    }

    pub fn with_tolerance(mut self, tolerance: Duration) -> Self {
        self.tolerance = tolerance;
        self
    }

    pub fn with_default_strategy(mut self, strategy: ResolutionStrategy) -> Self {
        self.default_strategy = strategy;
        self
    }

    /// Resolves `local` against `remote`.
    ///
    /// Fails only for malformed input: a missing id, or two versions that do
    /// not describe the same entity.
    pub fn resolve(
        &self,
        local: &Entity,
        remote: &Entity,
        kind: ConflictKind,
    ) -> Result<ConflictResolution> {
        if !local.has_identity() || !remote.has_identity() {
            return Err(SyncError::MalformedEntity(format!(
                "{} conflict without an id",
                remote.entity_type
            )));
        }
        if local.key() != remote.key() {
            return Err(SyncError::MalformedEntity(format!(
                "cannot reconcile {} with {}",
                local.key(),
                remote.key()
            )));
        }

        let schema = self.schemas.get(&remote.entity_type);
        let differing = self.differing_fields(&schema, local, remote);

        let strategy = match kind {
            ConflictKind::Manual => ResolutionStrategy::UserPrompt,
            ConflictKind::AutoResolvable => ResolutionStrategy::Automatic,
            ConflictKind::Concurrent => self.select_strategy(&schema, local, remote, &differing),
        };

        debug!(
            entity = %remote.key(),
            strategy = %strategy,
            fields = differing.len(),
            "Resolving conflict"
        );

        let resolution = match strategy {
            ResolutionStrategy::FieldLevel => self.field_level(&schema, local, remote, &differing),
            ResolutionStrategy::LastWriteWins => last_write_wins(local, remote, &differing),
            ResolutionStrategy::Automatic => automatic(local, remote, &differing),
            ResolutionStrategy::UserPrompt => user_prompt(local, remote, &differing),
        };

        Ok(resolution)
    }

    fn select_strategy(
        &self,
        schema: &EntitySchema,
        local: &Entity,
        remote: &Entity,
        differing: &[String],
    ) -> ResolutionStrategy {
        if !differing.iter().any(|field| schema.is_critical(field)) {
            return ResolutionStrategy::FieldLevel;
        }

        let gap = if local.last_modified > remote.last_modified {
            local.last_modified - remote.last_modified
        } else {
            remote.last_modified - local.last_modified
        };
        let within_tolerance = gap
            .to_std()
            .map(|gap| gap <= self.tolerance)
            .unwrap_or(false);
        if within_tolerance {
            return ResolutionStrategy::LastWriteWins;
        }

        self.default_strategy
    }

    /// Union of both sides' field names, compared with the schema.
    fn differing_fields(&self, schema: &EntitySchema, local: &Entity, remote: &Entity) -> Vec<String> {
        let names: BTreeSet<&String> = local.fields.keys().chain(remote.fields.keys()).collect();

        names
            .into_iter()
            .filter(|name| {
                !schema.values_equal(name, local.field(name), remote.field(name), &self.separator)
            })
            .cloned()
            .collect()
    }

    fn field_level(
        &self,
        schema: &EntitySchema,
        local: &Entity,
        remote: &Entity,
        differing: &[String],
    ) -> ConflictResolution {
        let mut merged = remote.clone();
        merged.last_modified = local.last_modified.max(remote.last_modified);

        let field_conflicts = differing
            .iter()
            .map(|field| {
                let local_value = local.field(field);
                let remote_value = remote.field(field);

                let (resolved, rule) = match schema.authority(field) {
                    FieldAuthority::Remote => (remote_value.cloned(), FieldRule::RemoteWins),
                    FieldAuthority::Local => (local_value.cloned(), FieldRule::LocalWins),
                    FieldAuthority::Merge => match schema.comparator(field) {
                        FieldComparator::LabelSet => (
                            union_labels(local_value, remote_value, &self.separator),
                            FieldRule::LabelUnion,
                        ),
                        _ => (merge_text(local_value, remote_value), FieldRule::TextMerge),
                    },
                };

                match &resolved {
                    Some(value) => {
                        merged.fields.insert(field.clone(), value.clone());
                    }
                    None => {
                        merged.fields.remove(field);
                    }
                }

                FieldConflict {
                    field: field.clone(),
                    local_value: local_value.cloned(),
                    remote_value: remote_value.cloned(),
                    resolved_value: resolved,
                    rule,
                }
            })
            .collect();

        ConflictResolution {
            merged: Some(merged),
            strategy: ResolutionStrategy::FieldLevel,
            field_conflicts,
            needs_user_input: false,
        }
    }
}

fn last_write_wins(local: &Entity, remote: &Entity, differing: &[String]) -> ConflictResolution {
    // Ties go to the server.
    let winner = if local.last_modified > remote.last_modified {
        local
    } else {
        remote
    };

    ConflictResolution {
        merged: Some(winner.clone()),
        strategy: ResolutionStrategy::LastWriteWins,
        field_conflicts: differing
            .iter()
            .map(|field| FieldConflict {
                field: field.clone(),
                local_value: local.field(field).cloned(),
                remote_value: remote.field(field).cloned(),
                resolved_value: winner.field(field).cloned(),
                rule: FieldRule::LastWriteWins,
            })
            .collect(),
        needs_user_input: false,
    }
}

fn automatic(local: &Entity, remote: &Entity, differing: &[String]) -> ConflictResolution {
    let mut merged = remote.clone();
    let mut field_conflicts = Vec::with_capacity(differing.len());

    for field in differing {
        let local_value = local.field(field).cloned();
        let remote_value = remote.field(field).cloned();

        let (resolved, rule) = if OVERLAY_FIELDS.contains(&field.as_str()) {
            match &local_value {
                Some(value) => {
                    merged.fields.insert(field.clone(), value.clone());
                }
                None => {
                    merged.fields.remove(field);
                }
            }
            merged.last_modified = local.last_modified.max(remote.last_modified);
            (local_value.clone(), FieldRule::LocalOverlay)
        } else {
            (remote_value.clone(), FieldRule::RemoteWins)
        };

        field_conflicts.push(FieldConflict {
            field: field.clone(),
            local_value,
            remote_value,
            resolved_value: resolved,
            rule,
        });
    }

    ConflictResolution {
        merged: Some(merged),
        strategy: ResolutionStrategy::Automatic,
        field_conflicts,
        needs_user_input: false,
    }
}

fn user_prompt(local: &Entity, remote: &Entity, differing: &[String]) -> ConflictResolution {
    ConflictResolution {
        merged: None,
        strategy: ResolutionStrategy::UserPrompt,
        field_conflicts: differing
            .iter()
            .map(|field| FieldConflict {
                field: field.clone(),
                local_value: local.field(field).cloned(),
                remote_value: remote.field(field).cloned(),
                resolved_value: None,
                rule: FieldRule::Unresolved,
            })
            .collect(),
        needs_user_input: true,
    }
}

/// Local labels first, then remote labels not already present.
///
/// Arrays stay arrays; anything else becomes a separator-joined string.
fn union_labels(local: Option<&Value>, remote: Option<&Value>, separator: &str) -> Option<Value> {
    let mut labels = split_labels(local, separator);
    for label in split_labels(remote, separator) {
        if !labels.contains(&label) {
            labels.push(label);
        }
    }

    let as_array = matches!(local, Some(Value::Array(_))) || matches!(remote, Some(Value::Array(_)));
    if as_array {
        Some(Value::Array(labels.into_iter().map(Value::String).collect()))
    } else {
        Some(Value::String(labels.join(separator)))
    }
}

/// Remote text stays primary; a differing local edit is appended.
///
/// Without a common base, an empty side or local text already contained in
/// the remote counts as only one side having changed.
fn merge_text(local: Option<&Value>, remote: Option<&Value>) -> Option<Value> {
    match (text_of(local), text_of(remote)) {
        (Some(local_text), Some(remote_text)) => {
            let local_trimmed = local_text.trim();
            if local_trimmed.is_empty() || remote_text.contains(local_trimmed) {
                remote.cloned()
            } else if remote_text.trim().is_empty() {
                local.cloned()
            } else {
                Some(Value::String(format!(
                    "{}{}{}",
                    remote_text, LOCAL_EDIT_MARKER, local_text
                )))
            }
        }
        _ => remote.cloned(),
    }
}
