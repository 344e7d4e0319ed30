//! # Entity Schemas
//!
//! Per-entity-type description of which fields matter and how they compare.
//!
//! A schema answers three questions for the change tracker and the conflict
//! resolver:
//! - Is this field's value different in a way that counts? ([`FieldComparator`])
//! - Which side wins when both sides edited it? ([`FieldAuthority`])
//! - Does a difference here force a coarser strategy? (the critical set)
//!
//! Types without a registered schema fall back to a generic one that treats
//! every field as significant, compares exactly, and lets the remote win.

use bridge_traits::EntityType;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashMap};

/// How two values of one field are compared.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldComparator {
    /// Deep JSON equality
    Exact,
    /// String equality after trimming; absent equals empty
    Text,
    /// Order-insensitive set of labels split on the separator
    LabelSet,
    /// Numeric equality across integer and float encodings
    Number,
}

/// Which side is authoritative for a field under field-level resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldAuthority {
    /// Server owns the value (workflow state, identity)
    Remote,
    /// Preserve the user's in-progress edit (estimates)
    Local,
    /// Combine both sides (labels, free text)
    Merge,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldSpec {
    pub comparator: FieldComparator,
    pub authority: FieldAuthority,
}

#[derive(Debug, Clone)]
pub struct EntitySchema {
    entity_type: EntityType,
    fields: BTreeMap<String, FieldSpec>,
    critical: BTreeSet<String>,
}

impl EntitySchema {
    /// Schema with no declared fields: everything is significant.
    pub fn new(entity_type: EntityType) -> Self {
        Self {
            entity_type,
            fields: BTreeMap::new(),
            critical: BTreeSet::new(),
        }
    }

    pub fn field(
        mut self,
        name: impl Into<String>,
        comparator: FieldComparator,
        authority: FieldAuthority,
    ) -> Self {
        self.fields.insert(
            name.into(),
            FieldSpec {
                comparator,
                authority,
            },
        );
        self
    }

    /// Marks a field as critical (identity or category/state).
    pub fn critical(mut self, name: impl Into<String>) -> Self {
        self.critical.insert(name.into());
        self
    }

    /// Work items as mirrored by the dashboard.
    pub fn work_items() -> Self {
        use FieldAuthority::*;
        use FieldComparator::*;

        Self::new(EntityType::work_item())
            .field("workItemType", Exact, Remote)
            .field("state", Exact, Remote)
            .field("reason", Text, Remote)
            .field("title", Text, Remote)
            .field("assignedTo", Exact, Remote)
            .field("areaPath", Exact, Remote)
            .field("iterationPath", Exact, Remote)
            .field("priority", Number, Remote)
            .field("parentId", Exact, Remote)
            .field("points", Number, Local)
            .field("storyPoints", Number, Local)
            .field("originalEstimate", Number, Local)
            .field("remainingWork", Number, Local)
            .field("completedWork", Number, Local)
            .field("tags", LabelSet, Merge)
            .field("description", Text, Merge)
            .field("acceptanceCriteria", Text, Merge)
            .critical("workItemType")
            .critical("state")
    }

    pub fn entity_type(&self) -> &EntityType {
        &self.entity_type
    }

    /// Declared fields, or `None` when every field is significant.
    pub fn significant_fields(&self) -> Option<impl Iterator<Item = &str>> {
        if self.fields.is_empty() {
            None
        } else {
            Some(self.fields.keys().map(String::as_str))
        }
    }

    pub fn comparator(&self, field: &str) -> FieldComparator {
        self.fields
            .get(field)
            .map(|spec| spec.comparator)
            .unwrap_or(FieldComparator::Exact)
    }

    pub fn authority(&self, field: &str) -> FieldAuthority {
        self.fields
            .get(field)
            .map(|spec| spec.authority)
            .unwrap_or(FieldAuthority::Remote)
    }

    pub fn is_critical(&self, field: &str) -> bool {
        self.critical.contains(field)
    }

    /// Compares one field's values with its comparator.
    pub fn values_equal(
        &self,
        field: &str,
        a: Option<&Value>,
        b: Option<&Value>,
        separator: &str,
    ) -> bool {
        match self.comparator(field) {
            FieldComparator::Exact => a == b,
            FieldComparator::Text => match (text_of(a), text_of(b)) {
                (Some(x), Some(y)) => x.trim() == y.trim(),
                _ => a == b,
            },
            FieldComparator::LabelSet => {
                let left: BTreeSet<String> = split_labels(a, separator).into_iter().collect();
                let right: BTreeSet<String> = split_labels(b, separator).into_iter().collect();
                left == right
            }
            FieldComparator::Number => match (number_of(a), number_of(b)) {
                (Some(x), Some(y)) => x == y,
                _ => a == b,
            },
        }
    }
}

/// Schemas keyed by entity type, with a generic fallback.
#[derive(Debug, Clone, Default)]
pub struct SchemaRegistry {
    schemas: HashMap<EntityType, EntitySchema>,
}

impl SchemaRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry preloaded with the work-item schema.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(EntitySchema::work_items());
        registry
    }

    pub fn register(&mut self, schema: EntitySchema) {
        self.schemas.insert(schema.entity_type.clone(), schema);
    }

    pub fn get(&self, entity_type: &EntityType) -> EntitySchema {
        self.schemas
            .get(entity_type)
            .cloned()
            .unwrap_or_else(|| EntitySchema::new(entity_type.clone()))
    }

    pub fn contains(&self, entity_type: &EntityType) -> bool {
        self.schemas.contains_key(entity_type)
    }
}

/// Text view of a value; absent and null read as empty.
pub(crate) fn text_of(value: Option<&Value>) -> Option<&str> {
    match value {
        None | Some(Value::Null) => Some(""),
        Some(Value::String(s)) => Some(s.as_str()),
        Some(_) => None,
    }
}

fn number_of(value: Option<&Value>) -> Option<f64> {
    value.and_then(Value::as_f64)
}

/// Labels in first-seen order, trimmed, deduplicated, blanks removed.
///
/// Accepts a separator-joined string or a JSON array of strings.
pub(crate) fn split_labels(value: Option<&Value>, separator: &str) -> Vec<String> {
    let raw: Vec<String> = match value {
        Some(Value::String(s)) => s.split(separator).map(str::to_string).collect(),
        Some(Value::Array(items)) => items
            .iter()
            .map(|item| match item {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            })
            .collect(),
        _ => Vec::new(),
    };

    let mut seen = BTreeSet::new();
    raw.into_iter()
        .map(|label| label.trim().to_string())
        .filter(|label| !label.is_empty() && seen.insert(label.clone()))
        .collect()
}
