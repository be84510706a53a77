//! Key-value cache with per-entry expiry
//!
//! Holds possession tokens, rate counters and the geolocation cache. The
//! in-process implementation is a `DashMap`; any shared cache offering atomic
//! get/set/increment with TTL can stand in through [`TtlStore`].

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::error::StoreError;

/// Key-value store with per-key expiry
pub trait TtlStore: Send + Sync {
    /// Read a live value. Expired entries read as absent.
    fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// Write a value, replacing any previous one, expiring after `ttl`.
    fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError>;

    fn delete(&self, key: &str) -> Result<(), StoreError>;

    /// Atomically add one to the counter at `key` and (re)set its expiry.
    ///
    /// An absent or expired counter starts from zero. Returns the new count.
    fn increment(&self, key: &str, ttl: Duration) -> Result<u64, StoreError>;
}

struct CacheEntry {
    value: String,
    expires_at: Instant,
}

impl CacheEntry {
    fn is_live(&self, now: Instant) -> bool {
        now < self.expires_at
    }
}

/// In-process TTL store
#[derive(Clone, Default)]
pub struct MemoryTtlStore {
    entries: Arc<DashMap<String, CacheEntry>>,
}

impl MemoryTtlStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop expired entries. Call periodically to bound memory.
    pub fn cleanup_expired(&self) {
        let now = Instant::now();
        self.entries.retain(|_, entry| entry.is_live(now));
    }

    /// Number of entries held, live or not yet swept
    pub fn size(&self) -> usize {
        self.entries.len()
    }
}

impl TtlStore for MemoryTtlStore {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let now = Instant::now();

        // The read guard must be released before remove() on the same shard.
        let status = match self.entries.get(key) {
            Some(entry) if entry.is_live(now) => Some(entry.value.clone()),
            Some(_) => None,
            None => return Ok(None),
        };

        if status.is_none() {
            self.entries.remove_if(key, |_, entry| !entry.is_live(now));
        }
        Ok(status)
    }

    fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError> {
        self.entries.insert(
            key.to_string(),
            CacheEntry {
                value: value.to_string(),
                expires_at: Instant::now() + ttl,
            },
        );
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.entries.remove(key);
        Ok(())
    }

    fn increment(&self, key: &str, ttl: Duration) -> Result<u64, StoreError> {
        let now = Instant::now();
        match self.entries.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                let entry = occupied.get_mut();
                let current = if entry.is_live(now) {
                    entry.value.parse::<u64>().map_err(|_| StoreError::NotACounter {
                        key: key.to_string(),
                    })?
                } else {
                    0
                };
                let next = current + 1;
                entry.value = next.to_string();
                entry.expires_at = now + ttl;
                Ok(next)
            }
            Entry::Vacant(vacant) => {
                vacant.insert(CacheEntry {
                    value: "1".to_string(),
                    expires_at: now + ttl,
                });
                Ok(1)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_set_then_get() {
        let store = MemoryTtlStore::new();
        store.set("k", "v", Duration::from_secs(60)).unwrap();
        assert_eq!(store.get("k").unwrap().as_deref(), Some("v"));
        assert_eq!(store.get("missing").unwrap(), None);
    }

    #[test]
    fn test_set_overwrites() {
        let store = MemoryTtlStore::new();
        store.set("k", "first", Duration::from_secs(60)).unwrap();
        store.set("k", "second", Duration::from_secs(60)).unwrap();
        assert_eq!(store.get("k").unwrap().as_deref(), Some("second"));
    }

    #[test]
    fn test_entries_expire() {
        let store = MemoryTtlStore::new();
        store.set("k", "v", Duration::from_millis(50)).unwrap();
        assert!(store.get("k").unwrap().is_some());

        thread::sleep(Duration::from_millis(100));

        assert!(store.get("k").unwrap().is_none());
        assert_eq!(store.size(), 0);
    }

    #[test]
    fn test_increment_counts_and_restarts_after_expiry() {
        let store = MemoryTtlStore::new();
        let ttl = Duration::from_millis(80);
        assert_eq!(store.increment("c", ttl).unwrap(), 1);
        assert_eq!(store.increment("c", ttl).unwrap(), 2);
        assert_eq!(store.get("c").unwrap().as_deref(), Some("2"));

        thread::sleep(Duration::from_millis(150));

        assert_eq!(store.increment("c", ttl).unwrap(), 1);
    }

    #[test]
    fn test_increment_rejects_non_counter() {
        let store = MemoryTtlStore::new();
        store.set("c", "token", Duration::from_secs(60)).unwrap();
        assert!(matches!(
            store.increment("c", Duration::from_secs(60)),
            Err(StoreError::NotACounter { .. })
        ));
    }

    #[test]
    fn test_cleanup_expired() {
        let store = MemoryTtlStore::new();
        store.set("a", "1", Duration::from_millis(50)).unwrap();
        store.set("b", "1", Duration::from_secs(60)).unwrap();

        thread::sleep(Duration::from_millis(100));
        store.cleanup_expired();

        assert_eq!(store.size(), 1);
        assert!(store.get("b").unwrap().is_some());
    }

    #[test]
    fn test_delete() {
        let store = MemoryTtlStore::new();
        store.set("k", "v", Duration::from_secs(60)).unwrap();
        store.delete("k").unwrap();
        assert!(store.get("k").unwrap().is_none());
    }
}
