//! Versioned records backing optimistic concurrency.
//!
//! A deleted record leaves a tombstone carrying its next version number, so
//! a record recreated under the same key continues the sequence instead of
//! starting over at 1.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::domain::errors::{CoherenceError, CoherenceResult};
use crate::domain::ports::Item;

/// Attribute holding the version number.
pub const VERSION_ATTR: &str = "version";
/// Attribute holding the record value.
pub const VALUE_ATTR: &str = "value";
/// Attribute flagging a tombstone.
pub const DELETED_ATTR: &str = "deleted";

/// A record value and the version it was committed at.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityVersion {
    /// Store key of the record.
    pub record_key: String,
    /// Monotonic version number.
    pub version: u64,
    /// Record payload.
    pub value: Value,
}

impl EntityVersion {
    /// Version `version` of `record_key` holding `value`.
    pub fn new(record_key: impl Into<String>, version: u64, value: Value) -> Self {
        Self {
            record_key: record_key.into(),
            version,
            value,
        }
    }

    /// Store item for this version.
    pub fn to_item(&self) -> Item {
        let mut item = Map::new();
        item.insert(VERSION_ATTR.to_string(), Value::from(self.version));
        item.insert(VALUE_ATTR.to_string(), self.value.clone());
        item
    }

    /// Store item marking `record_key` deleted at `version`.
    pub fn tombstone_item(version: u64) -> Item {
        let mut item = Map::new();
        item.insert(VERSION_ATTR.to_string(), Value::from(version));
        item.insert(DELETED_ATTR.to_string(), Value::Bool(true));
        item
    }

    /// Whether a stored item marks a deleted record.
    pub fn is_tombstone(item: &Item) -> bool {
        item.get(DELETED_ATTR).and_then(Value::as_bool).unwrap_or(false)
    }

    /// Parse a stored item. Tombstones parse with a null value.
    pub fn from_item(record_key: &str, item: &Item) -> CoherenceResult<Self> {
        let version = item
            .get(VERSION_ATTR)
            .and_then(Value::as_u64)
            .ok_or_else(|| CoherenceError::Store(format!("record {record_key} has no numeric version")))?;
        let value = item.get(VALUE_ATTR).cloned().unwrap_or(Value::Null);
        Ok(Self::new(record_key, version, value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_item_layout() {
        let v = EntityVersion::new("rec:1", 7, json!({"n": 1}));
        let item = v.to_item();
        assert_eq!(item.get("version"), Some(&json!(7)));
        assert_eq!(EntityVersion::from_item("rec:1", &item).unwrap(), v);
    }

    #[test]
    fn test_tombstone_keeps_version() {
        let item = EntityVersion::tombstone_item(4);
        assert!(EntityVersion::is_tombstone(&item));
        assert_eq!(EntityVersion::from_item("rec:1", &item).unwrap().version, 4);
        assert!(!EntityVersion::is_tombstone(&EntityVersion::new("rec:1", 4, json!(1)).to_item()));
    }

    #[test]
    fn test_missing_version_is_an_error() {
        let item = json!({"value": 1}).as_object().cloned().unwrap();
        assert!(EntityVersion::from_item("rec:1", &item).is_err());
    }
}
