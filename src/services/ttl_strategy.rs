//! TTL strategy manager.
//!
//! Computes how long a freshly cached entry should live from the entity
//! type's base TTL and its observed usage. Every result is clamped to the
//! configured `[min_ttl, max_ttl]` window.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::domain::models::{AccessHistogram, EntityMetadata, TtlConfig, TtlFactors, TtlStrategy};

const SIZE_FREE_BYTES: u64 = 1024;
/// Excess KiB at which a unit size weight halves the TTL.
const SIZE_HALVING_KIB: f64 = 64.0;

/// Computes cache TTLs per entity type, always within the configured clamp.
pub struct TtlStrategyManager {
    strategies: HashMap<String, TtlStrategy>,
    config: TtlConfig,
}

impl TtlStrategyManager {
    /// Manager with one strategy per entity type. A later strategy for the same type wins.
    pub fn new(config: TtlConfig, strategies: impl IntoIterator<Item = TtlStrategy>) -> Self {
        Self {
            strategies: strategies
                .into_iter()
                .map(|s| (s.entity_type.clone(), s))
                .collect(),
            config,
        }
    }

    /// Clamp and tuning settings.
    pub fn config(&self) -> &TtlConfig {
        &self.config
    }

    /// Strategy registered for `entity_type`.
    pub fn strategy(&self, entity_type: &str) -> Option<&TtlStrategy> {
        self.strategies.get(entity_type)
    }

    /// Base TTL: the type's strategy, then the configured per-type base, then the global default.
    pub fn base_ttl(&self, entity_type: &str) -> Duration {
        self.strategies
            .get(entity_type)
            .map(|s| s.base_ttl)
            .or_else(|| self.config.base_ttl_secs.get(entity_type).map(|s| Duration::from_secs(*s)))
            .unwrap_or_else(|| self.config.default_base_ttl())
    }

    /// TTL for a freshly cached entry of `entity_type`.
    pub fn calculate_ttl(&self, entity_type: &str, metadata: &EntityMetadata) -> Duration {
        self.calculate_ttl_at(entity_type, metadata, Utc::now())
    }

    /// [`calculate_ttl`](Self::calculate_ttl) against an explicit clock.
    pub fn calculate_ttl_at(&self, entity_type: &str, metadata: &EntityMetadata, now: DateTime<Utc>) -> Duration {
        let factors = self
            .strategies
            .get(entity_type)
            .map(|s| s.factors)
            .unwrap_or_default();

        let mut secs = self.base_ttl(entity_type).as_secs_f64();
        secs *= self.access_multiplier(metadata.access_count, &factors);
        secs /= 1.0 + factors.update_frequency_weight * log_scale(metadata.update_count);
        secs *= size_multiplier(metadata.size_bytes, &factors);

        if self.is_stale(metadata, now) {
            secs *= self.config.stale_penalty;
        }

        self.clamp(secs)
    }

    /// Scale a TTL by system load in `[0, 1]`.
    ///
    /// Above the high-load threshold entries live longer to shed store
    /// traffic; below the low-load threshold they expire sooner to improve
    /// freshness. Both ramps are linear up to the configured multipliers.
    pub fn adapt_ttl_for_load(&self, base_ttl: Duration, system_load: f64) -> Duration {
        let load = if system_load.is_nan() { 0.5 } else { system_load.clamp(0.0, 1.0) };
        let c = &self.config;

        let multiplier = if load >= c.high_load_threshold {
            let span = 1.0 - c.high_load_threshold;
            let t = if span <= f64::EPSILON { 1.0 } else { (load - c.high_load_threshold) / span };
            1.0 + t * (c.max_load_multiplier - 1.0)
        } else if load <= c.low_load_threshold {
            let t = if c.low_load_threshold <= f64::EPSILON {
                1.0
            } else {
                (c.low_load_threshold - load) / c.low_load_threshold
            };
            1.0 - t * (1.0 - c.min_load_multiplier)
        } else {
            1.0
        };

        self.clamp(base_ttl.as_secs_f64() * multiplier)
    }

    /// TTL extended for entities whose access histograms predict near-term use.
    ///
    /// Only ever raises the computed TTL, by at most the configured
    /// predictive multiplier.
    pub fn predict_ttl(
        &self,
        entity_type: &str,
        metadata: &EntityMetadata,
        histogram: &AccessHistogram,
        now: DateTime<Utc>,
    ) -> Duration {
        let base = self.calculate_ttl_at(entity_type, metadata, now);
        let predicted = histogram.next_hour_ratio(now).max(1.0) * histogram.weekday_ratio(now).max(1.0);
        let multiplier = predicted.min(self.config.max_predictive_multiplier).max(1.0);
        self.clamp(base.as_secs_f64() * multiplier)
    }

    fn access_multiplier(&self, access_count: u64, factors: &TtlFactors) -> f64 {
        (1.0 + factors.access_frequency_weight * log_scale(access_count)).min(self.config.max_access_multiplier)
    }

    fn is_stale(&self, metadata: &EntityMetadata, now: DateTime<Utc>) -> bool {
        metadata.last_accessed.is_some_and(|at| {
            let hours = i64::try_from(self.config.stale_after_hours).unwrap_or(i64::MAX);
            now.signed_duration_since(at) > chrono::Duration::hours(hours)
        })
    }

    fn clamp(&self, secs: f64) -> Duration {
        let min = self.config.min_ttl().as_secs_f64();
        let max = self.config.max_ttl().as_secs_f64();
        let secs = if secs.is_finite() { secs.clamp(min, max) } else { max };
        Duration::from_secs_f64(secs)
    }
}

fn log_scale(count: u64) -> f64 {
    (1.0 + count as f64).log10()
}

fn size_multiplier(size_bytes: u64, factors: &TtlFactors) -> f64 {
    if size_bytes <= SIZE_FREE_BYTES {
        return 1.0;
    }
    let excess_kib = (size_bytes - SIZE_FREE_BYTES) as f64 / 1024.0;
    1.0 / (1.0 + factors.size_weight.max(0.0) * excess_kib / SIZE_HALVING_KIB)
}
