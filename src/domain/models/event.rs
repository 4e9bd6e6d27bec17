//! Domain change notifications.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use super::cache_key::WILDCARD;
use crate::domain::errors::{CoherenceError, CoherenceResult};

/// Kind of mutation applied to an entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Create,
    Update,
    Delete,
}

impl Operation {
    /// Lowercase name used in event type strings.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
        }
    }
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Operation {
    type Err = CoherenceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "create" => Ok(Self::Create),
            "update" => Ok(Self::Update),
            "delete" => Ok(Self::Delete),
            other => Err(CoherenceError::validation(format!("unknown operation '{other}'"))),
        }
    }
}

/// `entityType:operation`, the key handlers and rules subscribe on.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct EventKey {
    pub entity_type: String,
    pub operation: Operation,
}

impl EventKey {
    /// Key for `entity_type:operation`.
    pub fn new(entity_type: impl Into<String>, operation: Operation) -> Self {
        Self {
            entity_type: entity_type.into(),
            operation,
        }
    }

    /// Reject an empty entity type or one containing `:`.
    pub fn validate(&self) -> CoherenceResult<()> {
        validate_entity_type(&self.entity_type)
    }
}

impl std::fmt::Display for EventKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.entity_type, self.operation)
    }
}

impl FromStr for EventKey {
    type Err = CoherenceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (entity_type, op) = s
            .rsplit_once(':')
            .ok_or_else(|| CoherenceError::validation(format!("event key '{s}' is not entityType:operation")))?;
        let key = Self::new(entity_type, op.parse()?);
        key.validate()?;
        Ok(key)
    }
}

impl TryFrom<String> for EventKey {
    type Error = CoherenceError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<EventKey> for String {
    fn from(key: EventKey) -> Self {
        key.to_string()
    }
}

/// A change notification raised by the write path after a commit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DomainEvent {
    pub id: Uuid,
    pub entity_type: String,
    pub entity_id: String,
    pub operation: Operation,
    pub payload: Option<Value>,
    pub timestamp: DateTime<Utc>,
}

impl DomainEvent {
    /// Event stamped now, without a payload.
    pub fn new(entity_type: impl Into<String>, entity_id: impl Into<String>, operation: Operation) -> Self {
        Self {
            id: Uuid::new_v4(),
            entity_type: entity_type.into(),
            entity_id: entity_id.into(),
            operation,
            payload: None,
            timestamp: Utc::now(),
        }
    }

    /// Attach a payload for rule predicates and cascades.
    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = Some(payload);
        self
    }

    /// Dispatch key of this event.
    pub fn key(&self) -> EventKey {
        EventKey::new(self.entity_type.clone(), self.operation)
    }

    /// The `entityType:operation` string.
    pub fn event_type(&self) -> String {
        format!("{}:{}", self.entity_type, self.operation)
    }

    /// Reject events that cannot be routed or substituted safely.
    pub fn validate(&self) -> CoherenceResult<()> {
        validate_entity_type(&self.entity_type)?;
        if self.entity_id.is_empty() {
            return Err(CoherenceError::validation("entity id cannot be empty"));
        }
        if self.entity_id.contains(WILDCARD) {
            return Err(CoherenceError::validation(format!(
                "entity id '{}' contains the wildcard token",
                self.entity_id
            )));
        }
        Ok(())
    }
}

fn validate_entity_type(entity_type: &str) -> CoherenceResult<()> {
    if entity_type.is_empty() {
        return Err(CoherenceError::validation("entity type cannot be empty"));
    }
    if entity_type.contains(':') || entity_type.contains(WILDCARD) {
        return Err(CoherenceError::validation(format!(
            "entity type '{entity_type}' cannot contain ':' or '*'"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_type_string() {
        let event = DomainEvent::new("user", "U1", Operation::Update);
        assert_eq!(event.event_type(), "user:update");
        assert_eq!(event.key().to_string(), "user:update");
    }

    #[test]
    fn test_event_key_parse() {
        let key: EventKey = "project:delete".parse().unwrap();
        assert_eq!(key, EventKey::new("project", Operation::Delete));
        assert!("project".parse::<EventKey>().is_err());
        assert!("project:archive".parse::<EventKey>().is_err());
        assert!(":update".parse::<EventKey>().is_err());
    }

    #[test]
    fn test_event_validation() {
        assert!(DomainEvent::new("user", "U1", Operation::Create).validate().is_ok());
        assert!(DomainEvent::new("", "U1", Operation::Create).validate().is_err());
        assert!(DomainEvent::new("user", "", Operation::Create).validate().is_err());
        assert!(DomainEvent::new("user", "U*", Operation::Create).validate().is_err());
        assert!(DomainEvent::new("a:b", "U1", Operation::Create).validate().is_err());
    }

    #[test]
    fn test_event_key_serde_as_string() {
        let key = EventKey::new("session", Operation::Update);
        let json = serde_json::to_string(&key).unwrap();
        assert_eq!(json, "\"session:update\"");
        let back: EventKey = serde_json::from_str(&json).unwrap();
        assert_eq!(back, key);
    }
}
