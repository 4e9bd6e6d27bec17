//! TTL strategy configuration and the metadata it is evaluated against.

use std::time::Duration;

use chrono::{DateTime, Datelike, Timelike, Utc};
use serde::{Deserialize, Serialize};

/// Weights applied to each TTL adjustment factor.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TtlFactors {
    #[serde(default = "default_weight")]
    pub access_frequency_weight: f64,
    #[serde(default = "default_weight")]
    pub update_frequency_weight: f64,
    #[serde(default = "default_weight")]
    pub size_weight: f64,
}

const fn default_weight() -> f64 {
    1.0
}

impl Default for TtlFactors {
    fn default() -> Self {
        Self {
            access_frequency_weight: default_weight(),
            update_frequency_weight: default_weight(),
            size_weight: default_weight(),
        }
    }
}

/// Per-entity-type TTL strategy. Read-only after startup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TtlStrategy {
    pub entity_type: String,
    #[serde(with = "duration_secs")]
    pub base_ttl: Duration,
    #[serde(default)]
    pub factors: TtlFactors,
}

impl TtlStrategy {
    /// Strategy with neutral factor weights.
    pub fn new(entity_type: impl Into<String>, base_ttl: Duration) -> Self {
        Self {
            entity_type: entity_type.into(),
            base_ttl,
            factors: TtlFactors::default(),
        }
    }

    /// Override the factor weights.
    pub fn with_factors(mut self, factors: TtlFactors) -> Self {
        self.factors = factors;
        self
    }
}

/// Observed usage of a cached entity.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EntityMetadata {
    pub access_count: u64,
    pub update_count: u64,
    pub size_bytes: u64,
    pub last_accessed: Option<DateTime<Utc>>,
}

impl EntityMetadata {
    /// Statistics without a last-access time.
    pub fn new(access_count: u64, update_count: u64, size_bytes: u64) -> Self {
        Self {
            access_count,
            update_count,
            size_bytes,
            last_accessed: None,
        }
    }

    /// Record when the entity was last read.
    pub fn last_accessed_at(mut self, at: DateTime<Utc>) -> Self {
        self.last_accessed = Some(at);
        self
    }
}

/// Caller-supplied access histograms for predictive TTLs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessHistogram {
    /// Accesses per hour of day (UTC), index 0 = 00:00.
    pub hourly: [u64; 24],
    /// Accesses per weekday, index 0 = Monday.
    pub weekly: [u64; 7],
}

impl Default for AccessHistogram {
    fn default() -> Self {
        Self {
            hourly: [0; 24],
            weekly: [0; 7],
        }
    }
}

impl AccessHistogram {
    /// Ratio of the upcoming hour's accesses to the hourly mean.
    pub fn next_hour_ratio(&self, now: DateTime<Utc>) -> f64 {
        let next = ((now.hour() + 1) % 24) as usize;
        ratio_to_mean(&self.hourly, next)
    }

    /// Ratio of today's accesses to the weekday mean.
    pub fn weekday_ratio(&self, now: DateTime<Utc>) -> f64 {
        let day = now.weekday().num_days_from_monday() as usize;
        ratio_to_mean(&self.weekly, day)
    }
}

fn ratio_to_mean(buckets: &[u64], idx: usize) -> f64 {
    let total: u64 = buckets.iter().sum();
    if total == 0 {
        return 1.0;
    }
    let mean = total as f64 / buckets.len() as f64;
    buckets[idx] as f64 / mean
}

pub(crate) mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_secs)
    }
}
