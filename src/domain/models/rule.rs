//! Invalidation rules and the immutable rule registry.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::event::EventKey;
use crate::domain::errors::{CoherenceError, CoherenceResult};

/// Predicate evaluated against the event payload (`null` when absent).
pub type PayloadPredicate = Arc<dyn Fn(&Value) -> bool + Send + Sync>;

/// Maps a triggering event type onto cache key templates to invalidate.
#[derive(Clone)]
pub struct InvalidationRule {
    pub name: String,
    pub trigger: EventKey,
    pub target_patterns: Vec<String>,
    pub delay: Option<Duration>,
    predicate: Option<PayloadPredicate>,
}

impl InvalidationRule {
    /// Rule clearing `target_patterns` whenever `trigger` is published.
    pub fn new(name: impl Into<String>, trigger: EventKey, target_patterns: Vec<String>) -> Self {
        Self {
            name: name.into(),
            trigger,
            target_patterns,
            delay: None,
            predicate: None,
        }
    }

    /// Only fire when `predicate` accepts the event payload.
    pub fn with_predicate<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&Value) -> bool + Send + Sync + 'static,
    {
        self.predicate = Some(Arc::new(predicate));
        self
    }

    /// Defer invalidation by `delay` through the scheduler.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Like `with_delay`, in milliseconds.
    pub fn with_delay_ms(self, delay_ms: u64) -> Self {
        self.with_delay(Duration::from_millis(delay_ms))
    }

    /// Whether a payload predicate is set.
    pub fn has_predicate(&self) -> bool {
        self.predicate.is_some()
    }

    /// Whether the rule applies to this payload. Rules without a predicate always apply.
    pub fn accepts(&self, payload: Option<&Value>) -> bool {
        match &self.predicate {
            Some(pred) => pred(payload.unwrap_or(&Value::Null)),
            None => true,
        }
    }

    /// Reject an empty name or target list, blank patterns, a malformed trigger and a zero delay.
    pub fn validate(&self) -> CoherenceResult<()> {
        if self.name.trim().is_empty() {
            return Err(CoherenceError::validation("rule name cannot be empty"));
        }
        self.trigger.validate()?;
        if self.target_patterns.is_empty() {
            return Err(CoherenceError::validation(format!(
                "rule '{}' has no target patterns",
                self.name
            )));
        }
        if let Some(pattern) = self.target_patterns.iter().find(|p| p.trim().is_empty()) {
            return Err(CoherenceError::validation(format!(
                "rule '{}' has an empty target pattern '{pattern}'",
                self.name
            )));
        }
        if self.delay == Some(Duration::ZERO) {
            return Err(CoherenceError::validation(format!(
                "rule '{}' has a zero delay; omit the delay for immediate invalidation",
                self.name
            )));
        }
        Ok(())
    }
}

impl std::fmt::Debug for InvalidationRule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InvalidationRule")
            .field("name", &self.name)
            .field("trigger", &self.trigger.to_string())
            .field("target_patterns", &self.target_patterns)
            .field("delay", &self.delay)
            .field("has_predicate", &self.predicate.is_some())
            .finish()
    }
}

/// Serializable rule form for configuration files. Cannot express predicates.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RuleSpec {
    pub name: String,
    pub trigger: EventKey,
    pub targets: Vec<String>,
    #[serde(default)]
    pub delay_ms: Option<u64>,
}

impl From<RuleSpec> for InvalidationRule {
    fn from(spec: RuleSpec) -> Self {
        let rule = InvalidationRule::new(spec.name, spec.trigger, spec.targets);
        match spec.delay_ms {
            Some(ms) => rule.with_delay_ms(ms),
            None => rule,
        }
    }
}

/// Rule table, frozen once built.
#[derive(Debug, Default)]
pub struct RuleRegistry {
    rules: Vec<Arc<InvalidationRule>>,
    by_trigger: HashMap<EventKey, Vec<usize>>,
}

impl RuleRegistry {
    /// Start building a registry.
    pub fn builder() -> RuleRegistryBuilder {
        RuleRegistryBuilder::default()
    }

    /// Rules for a trigger, in registration order.
    pub fn rules_for(&self, key: &EventKey) -> Vec<Arc<InvalidationRule>> {
        self.by_trigger
            .get(key)
            .map(|idxs| idxs.iter().map(|&i| Arc::clone(&self.rules[i])).collect())
            .unwrap_or_default()
    }

    /// Distinct trigger keys, in first-registration order.
    pub fn triggers(&self) -> Vec<EventKey> {
        let mut seen = HashSet::new();
        self.rules
            .iter()
            .filter(|r| seen.insert(r.trigger.clone()))
            .map(|r| r.trigger.clone())
            .collect()
    }

    /// Rule registered under `name`.
    pub fn get(&self, name: &str) -> Option<Arc<InvalidationRule>> {
        self.rules.iter().find(|r| r.name == name).cloned()
    }

    /// Number of registered rules.
    pub fn len(&self) -> usize {
        self.rules.len()
    }

    /// Whether no rules are registered.
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

/// Collects rules at startup and validates them into a [`RuleRegistry`].
#[derive(Debug, Default)]
pub struct RuleRegistryBuilder {
    rules: Vec<InvalidationRule>,
}

impl RuleRegistryBuilder {
    /// Append one rule.
    pub fn rule(mut self, rule: InvalidationRule) -> Self {
        self.rules.push(rule);
        self
    }

    /// Append rules in order.
    pub fn rules(mut self, rules: impl IntoIterator<Item = InvalidationRule>) -> Self {
        self.rules.extend(rules);
        self
    }

    /// Append rules declared in configuration.
    pub fn specs(self, specs: impl IntoIterator<Item = RuleSpec>) -> Self {
        self.rules(specs.into_iter().map(InvalidationRule::from))
    }

    /// Validate every rule and freeze the registry. Duplicate names are rejected.
    pub fn build(self) -> CoherenceResult<RuleRegistry> {
        let mut names = HashSet::new();
        let mut registry = RuleRegistry::default();

        for rule in self.rules {
            rule.validate()?;
            if !names.insert(rule.name.clone()) {
                return Err(CoherenceError::validation(format!(
                    "duplicate rule name '{}'",
                    rule.name
                )));
            }
            let idx = registry.rules.len();
            registry.by_trigger.entry(rule.trigger.clone()).or_default().push(idx);
            registry.rules.push(Arc::new(rule));
        }

        Ok(registry)
    }
}
