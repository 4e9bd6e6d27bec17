//! Lock records stored in the authoritative store.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::domain::errors::{CoherenceError, CoherenceResult};
use crate::domain::ports::Item;

/// Attribute holding the holder's opaque token.
pub const OWNER_TOKEN_ATTR: &str = "owner_token";
/// Attribute holding the fencing token issued with the lease.
pub const FENCING_TOKEN_ATTR: &str = "fencing_token";
/// Attribute holding the lease expiry in epoch milliseconds.
pub const EXPIRES_AT_ATTR: &str = "expires_at_epoch_ms";

/// Lease record stored under `lock#{id}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockRecord {
    pub lock_id: String,
    pub owner_token: String,
    pub fencing_token: u64,
    pub expires_at_epoch_ms: i64,
}

impl LockRecord {
    /// Whether the lease ended before `now_ms`.
    pub fn is_expired(&self, now_ms: i64) -> bool {
        self.expires_at_epoch_ms < now_ms
    }

    /// Store item for this record.
    pub fn to_item(&self) -> Item {
        let mut item = Map::new();
        item.insert("lock_id".to_string(), Value::from(self.lock_id.clone()));
        item.insert(OWNER_TOKEN_ATTR.to_string(), Value::from(self.owner_token.clone()));
        item.insert(FENCING_TOKEN_ATTR.to_string(), Value::from(self.fencing_token));
        item.insert(EXPIRES_AT_ATTR.to_string(), Value::from(self.expires_at_epoch_ms));
        item
    }

    /// Parse a stored lock record.
    pub fn from_item(lock_id: &str, item: &Item) -> CoherenceResult<Self> {
        let malformed = |field: &str| CoherenceError::Store(format!("lock {lock_id} has malformed {field}"));
        Ok(Self {
            lock_id: lock_id.to_string(),
            owner_token: item
                .get(OWNER_TOKEN_ATTR)
                .and_then(Value::as_str)
                .ok_or_else(|| malformed(OWNER_TOKEN_ATTR))?
                .to_string(),
            fencing_token: item
                .get(FENCING_TOKEN_ATTR)
                .and_then(Value::as_u64)
                .ok_or_else(|| malformed(FENCING_TOKEN_ATTR))?,
            expires_at_epoch_ms: item
                .get(EXPIRES_AT_ATTR)
                .and_then(Value::as_i64)
                .ok_or_else(|| malformed(EXPIRES_AT_ATTR))?,
        })
    }
}

/// Proof of lock ownership handed to the acquirer.
///
/// `fencing_token` increases on every successful acquisition of the same
/// lock id, so a holder whose lock was reassigned can be detected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockGuard {
    pub lock_id: String,
    pub owner_token: String,
    pub fencing_token: u64,
    pub expires_at_epoch_ms: i64,
}

impl From<&LockRecord> for LockGuard {
    fn from(r: &LockRecord) -> Self {
        Self {
            lock_id: r.lock_id.clone(),
            owner_token: r.owner_token.clone(),
            fencing_token: r.fencing_token,
            expires_at_epoch_ms: r.expires_at_epoch_ms,
        }
    }
}

/// Result of a lock attempt. Contention is an outcome, not an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockAcquisition {
    Acquired(LockGuard),
    NotAcquired {
        lock_id: String,
        /// Expiry of the current holder, when it was observed.
        held_until_epoch_ms: Option<i64>,
    },
}

impl LockAcquisition {
    /// Whether the lock was granted.
    pub fn is_acquired(&self) -> bool {
        matches!(self, Self::Acquired(_))
    }

    /// The guard, if the lock was granted.
    pub fn guard(self) -> Option<LockGuard> {
        match self {
            Self::Acquired(g) => Some(g),
            Self::NotAcquired { .. } => None,
        }
    }
}
