//! Access to the surrounding aggregated configuration.
//!
//! Namespace resolution, retry tuning and deletion fallback all consult
//! the host's merged configuration (files, environment, other sources).
//! That surface sits behind [`ConfigAccessor`] so the crate never
//! depends on a particular host framework.

use std::collections::HashMap;

use crate::value;

/// Read-only view of the host's aggregated configuration.
pub trait ConfigAccessor: Send + Sync {
    /// Look up a flat key in the aggregated configuration.
    fn get(&self, key: &str) -> Option<String>;

    /// Typed convenience over [`ConfigAccessor::get`].
    fn get_i64(&self, key: &str) -> Option<i64> {
        self.get(key).and_then(|raw| value::parse(&raw))
    }
}

/// In-memory accessor backed by a key-value map.
#[derive(Debug, Default, Clone)]
pub struct MapAccessor {
    entries: HashMap<String, String>,
}

impl MapAccessor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert, for wiring up accessors inline.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.entries.insert(key.into(), value.into());
        self
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.entries.insert(key.into(), value.into());
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl ConfigAccessor for MapAccessor {
    fn get(&self, key: &str) -> Option<String> {
        self.entries.get(key).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_map_lookup() {
        let accessor = MapAccessor::new().with("config.namespace", "custom/ns");
        assert_eq!(accessor.get("config.namespace").as_deref(), Some("custom/ns"));
        assert_eq!(accessor.get("missing"), None);
    }

    #[test]
    fn test_typed_lookup() {
        let accessor = MapAccessor::new()
            .with("config.start-retry-delay-ms", "250")
            .with("config.max-retry-delay-ms", "not-a-number");
        assert_eq!(accessor.get_i64("config.start-retry-delay-ms"), Some(250));
        assert_eq!(accessor.get_i64("config.max-retry-delay-ms"), None);
    }
}
