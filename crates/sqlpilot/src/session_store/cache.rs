//! Key/value cache seam with per-key TTL and versioned compare-and-set.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use moka::ops::compute::{CompResult, Op};
use moka::sync::Cache;
use moka::Expiry;

use crate::error::CacheError;

/// A cached document and the version it was written at. Every successful
/// write produces a strictly greater version than any earlier write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedValue {
    pub value: String,
    pub version: u64,
}

#[async_trait]
pub trait CacheBackend: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<CachedValue>, CacheError>;

    /// Unconditional overwrite. Returns the new version.
    async fn set(&self, key: &str, value: String, ttl: Duration) -> Result<u64, CacheError>;

    /// Write only if the key is currently at `expected_version`
    /// (`None` meaning absent). Returns whether the write happened.
    async fn compare_and_set(
        &self,
        key: &str,
        expected_version: Option<u64>,
        value: String,
        ttl: Duration,
    ) -> Result<bool, CacheError>;

    async fn delete(&self, key: &str) -> Result<(), CacheError>;
}

#[derive(Debug, Clone)]
struct Slot {
    value: Arc<str>,
    version: u64,
    ttl: Duration,
}

struct SlotExpiry;

impl Expiry<String, Slot> for SlotExpiry {
    fn expire_after_create(&self, _key: &String, slot: &Slot, _created_at: Instant) -> Option<Duration> {
        Some(slot.ttl)
    }

    fn expire_after_update(
        &self,
        _key: &String,
        slot: &Slot,
        _updated_at: Instant,
        _duration_until_expiry: Option<Duration>,
    ) -> Option<Duration> {
        Some(slot.ttl)
    }
}

/// In-process cache backed by moka, shared by every component in the process.
pub struct MokaCacheBackend {
    cache: Cache<String, Slot>,
    next_version: AtomicU64,
}

impl MokaCacheBackend {
    pub fn new(max_capacity: u64) -> Self {
        Self {
            cache: Cache::builder()
                .max_capacity(max_capacity)
                .expire_after(SlotExpiry)
                .build(),
            next_version: AtomicU64::new(1),
        }
    }

    fn slot(&self, value: String, ttl: Duration) -> Slot {
        Slot {
            value: Arc::from(value),
            version: self.next_version.fetch_add(1, Ordering::SeqCst),
            ttl,
        }
    }
}

#[async_trait]
impl CacheBackend for MokaCacheBackend {
    async fn get(&self, key: &str) -> Result<Option<CachedValue>, CacheError> {
        Ok(self.cache.get(key).map(|slot| CachedValue {
            value: slot.value.to_string(),
            version: slot.version,
        }))
    }

    async fn set(&self, key: &str, value: String, ttl: Duration) -> Result<u64, CacheError> {
        let slot = self.slot(value, ttl);
        let version = slot.version;
        self.cache.insert(key.to_string(), slot);
        Ok(version)
    }

    async fn compare_and_set(
        &self,
        key: &str,
        expected_version: Option<u64>,
        value: String,
        ttl: Duration,
    ) -> Result<bool, CacheError> {
        let result = self.cache.entry_by_ref(key).and_compute_with(|current| {
            let current_version = current.map(|entry| entry.value().version);
            if current_version == expected_version {
                Op::Put(self.slot(value, ttl))
            } else {
                Op::Nop
            }
        });
        Ok(matches!(
            result,
            CompResult::Inserted(_) | CompResult::ReplacedWith(_)
        ))
    }

    async fn delete(&self, key: &str) -> Result<(), CacheError> {
        self.cache.invalidate(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TTL: Duration = Duration::from_secs(60);

    #[tokio::test]
    async fn test_set_get_delete() {
        let cache = MokaCacheBackend::new(100);
        assert!(cache.get("k").await.unwrap().is_none());

        let v1 = cache.set("k", "a".to_string(), TTL).await.unwrap();
        let v2 = cache.set("k", "b".to_string(), TTL).await.unwrap();
        assert!(v2 > v1);

        let cached = cache.get("k").await.unwrap().unwrap();
        assert_eq!(cached.value, "b");
        assert_eq!(cached.version, v2);

        cache.delete("k").await.unwrap();
        assert!(cache.get("k").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_compare_and_set_absent() {
        let cache = MokaCacheBackend::new(100);
        assert!(cache.compare_and_set("k", None, "a".to_string(), TTL).await.unwrap());
        // already present, so "expect absent" must fail
        assert!(!cache.compare_and_set("k", None, "b".to_string(), TTL).await.unwrap());
        assert_eq!(cache.get("k").await.unwrap().unwrap().value, "a");
    }

    #[tokio::test]
    async fn test_compare_and_set_detects_stale_version() {
        let cache = MokaCacheBackend::new(100);
        let v1 = cache.set("k", "a".to_string(), TTL).await.unwrap();
        cache.set("k", "b".to_string(), TTL).await.unwrap();

        assert!(!cache.compare_and_set("k", Some(v1), "stale".to_string(), TTL).await.unwrap());

        let current = cache.get("k").await.unwrap().unwrap();
        assert!(cache
            .compare_and_set("k", Some(current.version), "c".to_string(), TTL)
            .await
            .unwrap());
        assert_eq!(cache.get("k").await.unwrap().unwrap().value, "c");
    }

    #[tokio::test]
    async fn test_entries_expire_after_their_ttl() {
        let cache = MokaCacheBackend::new(100);
        cache.set("short", "x".to_string(), Duration::from_millis(50)).await.unwrap();
        cache.set("long", "y".to_string(), TTL).await.unwrap();

        tokio::time::sleep(Duration::from_millis(150)).await;

        assert!(cache.get("short").await.unwrap().is_none());
        assert!(cache.get("long").await.unwrap().is_some());
    }
}
