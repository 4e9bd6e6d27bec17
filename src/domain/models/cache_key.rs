//! Cache keys and wildcard key patterns.
//!
//! A key template such as `user:*:projects` carries one or more `*`
//! segments. At invalidation time the first wildcard is replaced by the
//! triggering entity id; if wildcards remain the result is a pattern that
//! the cache store bulk-deletes, otherwise it is a concrete key.

use serde::{Deserialize, Serialize};

/// Wildcard token used in key templates.
pub const WILDCARD: char = '*';

/// A concrete cache key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CacheKey(String);

impl CacheKey {
    /// Wrap an exact cache key.
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// The key an entity is cached under: `{entity_type}:{entity_id}`.
    pub fn entity(entity_type: &str, entity_id: &str) -> Self {
        Self(format!("{entity_type}:{entity_id}"))
    }

    /// The underlying string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for CacheKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// A glob-style key pattern where `*` matches any run of characters.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct KeyPattern(String);

impl KeyPattern {
    /// Wrap a key pattern containing `*`.
    pub fn new(pattern: impl Into<String>) -> Self {
        Self(pattern.into())
    }

    /// The underlying string.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Check whether `key` matches this pattern.
    pub fn matches(&self, key: &str) -> bool {
        glob_match(self.0.as_bytes(), key.as_bytes())
    }
}

impl std::fmt::Display for KeyPattern {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// A key template resolved against an entity id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ResolvedTarget {
    Key(CacheKey),
    Pattern(KeyPattern),
}

impl ResolvedTarget {
    /// The underlying string.
    pub fn as_str(&self) -> &str {
        match self {
            Self::Key(k) => k.as_str(),
            Self::Pattern(p) => p.as_str(),
        }
    }
}

impl std::fmt::Display for ResolvedTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Substitute the first wildcard of `template` with `entity_id`.
pub fn resolve_target(template: &str, entity_id: &str) -> ResolvedTarget {
    let resolved = match template.find(WILDCARD) {
        Some(idx) => {
            let mut s = String::with_capacity(template.len() + entity_id.len());
            s.push_str(&template[..idx]);
            s.push_str(entity_id);
            s.push_str(&template[idx + WILDCARD.len_utf8()..]);
            s
        }
        None => template.to_string(),
    };

    if resolved.contains(WILDCARD) {
        ResolvedTarget::Pattern(KeyPattern(resolved))
    } else {
        ResolvedTarget::Key(CacheKey(resolved))
    }
}

/// Iterative glob match with single-star backtracking.
fn glob_match(pattern: &[u8], text: &[u8]) -> bool {
    let (mut p, mut t) = (0usize, 0usize);
    let mut star: Option<usize> = None;
    let mut star_text = 0usize;

    while t < text.len() {
        if p < pattern.len() && pattern[p] == b'*' {
            star = Some(p);
            star_text = t;
            p += 1;
        } else if p < pattern.len() && pattern[p] == text[t] {
            p += 1;
            t += 1;
        } else if let Some(s) = star {
            p = s + 1;
            star_text += 1;
            t = star_text;
        } else {
            return false;
        }
    }

    while p < pattern.len() && pattern[p] == b'*' {
        p += 1;
    }
    p == pattern.len()
}
