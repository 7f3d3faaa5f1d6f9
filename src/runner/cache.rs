//! Property cache: `propertyId -> (value, timestamp)` with a fixed TTL and
//! a janitor sweep (spec §3 "Property Cache").
//!
//! The Rust analogue of `patrickmn/go-cache`, which
//! `original_source/internal/driver/twin_runner.go` uses verbatim
//! (`cache.New(PropertyCacheExpiration, PropertyCacheCleanupInterval)`).
//! No crate in the retrieved pack supplies an equivalent TTL map, so this
//! is a small hand-rolled stand-in for that one dependency rather than an
//! SDK-wide avoidance of third-party crates.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use tokio::sync::RwLock;

use crate::domain::PropertyId;
use crate::value::FieldValue;

struct Entry {
    value: FieldValue,
    written_at: Instant,
}

pub struct PropertyCache {
    ttl: Duration,
    entries: RwLock<HashMap<PropertyId, Entry>>,
}

impl PropertyCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Record a freshly hard-read value, as the original does on every
    /// successful `HardRead`.
    pub async fn set(&self, property_id: PropertyId, value: FieldValue) {
        self.entries.write().await.insert(
            property_id,
            Entry {
                value,
                written_at: Instant::now(),
            },
        );
    }

    /// A soft read: `None` if the entry is missing or has outlived the
    /// TTL (the caller turns this into [`crate::error::DriverError::NotReady`]).
    pub async fn get(&self, property_id: &str) -> Option<FieldValue> {
        let entries = self.entries.read().await;
        let entry = entries.get(property_id)?;
        if entry.written_at.elapsed() > self.ttl {
            None
        } else {
            Some(entry.value.clone())
        }
    }

    pub async fn property_ids(&self) -> Vec<PropertyId> {
        self.entries.read().await.keys().cloned().collect()
    }

    /// Drop every entry past its TTL. Run on the cleanup interval
    /// (spec §3: default 60s, twice the 30s TTL, matching the original's
    /// `PropertyCacheCleanupInterval = 2 * PropertyCacheExpiration`).
    pub async fn sweep(&self) {
        let mut entries = self.entries.write().await;
        entries.retain(|_, entry| entry.written_at.elapsed() <= self.ttl);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fresh_value_is_readable() {
        let cache = PropertyCache::new(Duration::from_millis(50));
        cache.set("temp".to_string(), FieldValue::Float(21.5)).await;
        assert!(cache.get("temp").await.is_some());
    }

    #[tokio::test]
    async fn missing_property_is_not_ready() {
        let cache = PropertyCache::new(Duration::from_secs(30));
        assert!(cache.get("temp").await.is_none());
    }

    #[tokio::test]
    async fn expired_value_is_not_ready() {
        let cache = PropertyCache::new(Duration::from_millis(10));
        cache.set("temp".to_string(), FieldValue::Float(1.0)).await;
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(cache.get("temp").await.is_none());
    }

    #[tokio::test]
    async fn sweep_drops_expired_entries_only() {
        let cache = PropertyCache::new(Duration::from_millis(10));
        cache.set("stale".to_string(), FieldValue::Float(1.0)).await;
        tokio::time::sleep(Duration::from_millis(30)).await;
        cache.set("fresh".to_string(), FieldValue::Float(2.0)).await;
        cache.sweep().await;
        let ids = cache.property_ids().await;
        assert_eq!(ids, vec!["fresh".to_string()]);
    }
}
