//! Relationship-driven cascade table.
//!
//! Each entity type owns a list of cascade rules. A rule fires when the
//! changed fields of an entity satisfy its condition, and names the key
//! templates of dependent entries (children, aggregates) to drop.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::domain::errors::{CoherenceError, CoherenceResult};

/// When a cascade fires.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CascadeCondition {
    /// The field appears in the changed set, whatever its new value.
    FieldChanged { field: String },
    /// The field changed to exactly this value.
    FieldEquals { field: String, value: Value },
}

impl CascadeCondition {
    /// Evaluate the condition against the changed fields.
    pub fn is_met(&self, changed_fields: &Map<String, Value>) -> bool {
        match self {
            Self::FieldChanged { field } => changed_fields.contains_key(field),
            Self::FieldEquals { field, value } => changed_fields.get(field) == Some(value),
        }
    }
}

/// Invalidation derived from a field change on one entity type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CascadeRule {
    pub name: String,
    pub entity_type: String,
    pub when: CascadeCondition,
    /// Key templates; the first `*` becomes the parent entity id.
    pub targets: Vec<String>,
}

impl CascadeRule {
    /// Cascade for `entity_type` that clears `targets` when `when` holds.
    pub fn new(
        name: impl Into<String>,
        entity_type: impl Into<String>,
        when: CascadeCondition,
        targets: Vec<String>,
    ) -> Self {
        Self {
            name: name.into(),
            entity_type: entity_type.into(),
            when,
            targets,
        }
    }
}

/// Cascade rules looked up by entity type.
#[derive(Debug, Clone, Default)]
pub struct CascadeTable {
    by_type: HashMap<String, Vec<CascadeRule>>,
}

impl CascadeTable {
    /// Empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Table holding `rules`, validating each.
    pub fn from_rules(rules: impl IntoIterator<Item = CascadeRule>) -> CoherenceResult<Self> {
        rules.into_iter().try_fold(Self::new(), Self::with)
    }

    /// Add one rule.
    pub fn with(mut self, rule: CascadeRule) -> CoherenceResult<Self> {
        if rule.entity_type.is_empty() || rule.targets.is_empty() {
            return Err(CoherenceError::validation(format!(
                "cascade '{}' needs an entity type and at least one target",
                rule.name
            )));
        }
        self.by_type.entry(rule.entity_type.clone()).or_default().push(rule);
        Ok(self)
    }

    /// Rules registered for `entity_type`, in registration order.
    pub fn rules_for(&self, entity_type: &str) -> &[CascadeRule] {
        self.by_type.get(entity_type).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Cascades whose condition holds for these changed fields.
    pub fn triggered<'a>(
        &'a self,
        entity_type: &str,
        changed_fields: &'a Map<String, Value>,
    ) -> impl Iterator<Item = &'a CascadeRule> + 'a {
        self.rules_for(entity_type)
            .iter()
            .filter(move |r| r.when.is_met(changed_fields))
    }

    /// Entity types with at least one cascade.
    pub fn entity_types(&self) -> impl Iterator<Item = &str> {
        self.by_type.keys().map(String::as_str)
    }

    /// Whether the table has no rules.
    pub fn is_empty(&self) -> bool {
        self.by_type.is_empty()
    }
}
