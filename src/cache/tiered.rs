// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Generic two-tier read-through / write-through cache.
//!
//! ```text
//! get ──► memory (DashMap) ──hit──► (value, Memory)
//!              │ miss
//!              ▼
//!         durable tier ──hit──► promote, (value, Durable)
//! ```
//!
//! Memory is never authoritative: any entry may be dropped at any time and
//! is re-read from the durable tier on the next `get`.
//!
//! Writes, removals and invalidations stamp the key with a version from a
//! cache-wide clock. A durable read only promotes into memory if nothing
//! touched the key since the read started, so a concurrent `remove` can't
//! be undone by a slow promotion. `remove` also leaves a tombstone that
//! hides the key until the durable delete has finished (or until the next
//! `set` / `invalidate`).
//!
//! Version state is kept only for keys that are in memory or tombstoned.
//! Dropping a key's state raises a watermark instead, and a read that
//! started below the watermark re-reads rather than trust its result.

use async_trait::async_trait;
use dashmap::DashMap;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::model::SourceTier;
use crate::storage::StorageError;

/// Persistent backing tier for a [`TieredCache`].
#[async_trait]
pub trait DurableTier<K, V>: Send + Sync {
    async fn load(&self, key: &K) -> Result<Option<V>, StorageError>;
    async fn store(&self, key: &K, value: &V) -> Result<(), StorageError>;
    async fn delete(&self, key: &K) -> Result<(), StorageError>;
}

#[derive(Debug, Clone, Copy, Default)]
struct KeyState {
    version: u64,
    removed: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TierStats {
    pub memory_items: usize,
    pub memory_hits: u64,
    pub durable_hits: u64,
    pub misses: u64,
}

pub struct TieredCache<K, V> {
    memory: DashMap<K, V>,
    state: DashMap<K, KeyState>,
    durable: Arc<dyn DurableTier<K, V>>,
    /// Last version handed out.
    clock: AtomicU64,
    /// Highest version whose key state has been dropped.
    pruned_up_to: AtomicU64,
    memory_hits: AtomicU64,
    durable_hits: AtomicU64,
    misses: AtomicU64,
}

impl<K, V> TieredCache<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    pub fn new(durable: Arc<dyn DurableTier<K, V>>) -> Self {
        Self {
            memory: DashMap::new(),
            state: DashMap::new(),
            durable,
            clock: AtomicU64::new(0),
            pruned_up_to: AtomicU64::new(0),
            memory_hits: AtomicU64::new(0),
            durable_hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    fn tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub async fn get(&self, key: &K) -> Result<Option<(V, SourceTier)>, StorageError> {
        loop {
            let started_at = self.clock.load(Ordering::SeqCst);
            if self.state.get(key).is_some_and(|s| s.removed) {
                self.misses.fetch_add(1, Ordering::Relaxed);
                return Ok(None);
            }

            if let Some(v) = self.memory.get(key) {
                self.memory_hits.fetch_add(1, Ordering::Relaxed);
                return Ok(Some((v.clone(), SourceTier::Memory)));
            }

            let Some(loaded) = self.durable.load(key).await? else {
                self.misses.fetch_add(1, Ordering::Relaxed);
                return Ok(None);
            };

            // Holding the state entry serialises this check with set/remove.
            let state = self.state.entry(key.clone()).or_default();
            if state.removed || state.version > started_at {
                // Changed underneath us: whatever memory now holds is newer.
                return Ok(match self.memory.get(key) {
                    Some(v) if !state.removed => {
                        self.memory_hits.fetch_add(1, Ordering::Relaxed);
                        Some((v.clone(), SourceTier::Memory))
                    }
                    _ => {
                        self.misses.fetch_add(1, Ordering::Relaxed);
                        None
                    }
                });
            }
            if state.version == 0 && self.pruned_up_to.load(Ordering::SeqCst) > started_at {
                // This key's history may have been dropped mid-read.
                drop(state);
                self.state.remove_if(key, |_, s| s.version == 0 && !s.removed);
                continue;
            }
            self.memory.insert(key.clone(), loaded.clone());
            drop(state);

            self.durable_hits.fetch_add(1, Ordering::Relaxed);
            return Ok(Some((loaded, SourceTier::Durable)));
        }
    }

    /// Memory-only lookup; never touches the durable tier.
    pub fn peek(&self, key: &K) -> Option<V> {
        self.memory.get(key).map(|v| v.clone())
    }

    /// Synchronous half of a `set`: write memory, clear any tombstone.
    pub fn put_memory(&self, key: K, value: V) {
        let mut state = self.state.entry(key.clone()).or_default();
        state.version = self.tick();
        state.removed = false;
        self.memory.insert(key, value);
    }

    /// Durable half of a `set`.
    pub async fn write_through(&self, key: &K, value: &V) -> Result<(), StorageError> {
        self.durable.store(key, value).await
    }

    pub async fn set(&self, key: K, value: V, persist: bool) -> Result<(), StorageError> {
        self.put_memory(key.clone(), value.clone());
        if persist {
            self.write_through(&key, &value).await?;
        }
        Ok(())
    }

    /// Synchronous half of a `remove`: evict memory and leave a tombstone.
    ///
    /// Returns the version to hand to [`Self::finish_remove`].
    pub fn evict(&self, key: &K) -> u64 {
        let mut state = self.state.entry(key.clone()).or_default();
        state.version = self.tick();
        state.removed = true;
        self.memory.remove(key);
        state.version
    }

    /// Durable half of a `remove`. Drops the tombstone once the durable
    /// record is gone, unless the key was written again meanwhile.
    pub async fn finish_remove(&self, key: &K, version: u64) -> Result<(), StorageError> {
        self.durable.delete(key).await?;
        let unchanged = self.state.get(key).is_some_and(|s| s.version == version);
        if unchanged {
            self.pruned_up_to.fetch_max(version, Ordering::SeqCst);
            self.state.remove_if(key, |_, s| s.version == version);
        }
        Ok(())
    }

    /// Evict both tiers. With `persist = false` the durable record is left
    /// alone and the key stays hidden until the next `set` or `invalidate`.
    pub async fn remove(&self, key: &K, persist: bool) -> Result<(), StorageError> {
        let version = self.evict(key);
        if persist {
            self.finish_remove(key, version).await?;
        }
        Ok(())
    }

    /// Drop the memory entry (and any tombstone) so the next `get` re-reads
    /// the durable tier.
    pub fn invalidate(&self, key: &K) {
        let version = self.tick();
        self.pruned_up_to.fetch_max(version, Ordering::SeqCst);
        let _state = self.state.remove(key);
        self.memory.remove(key);
    }

    /// Drop every memory entry. Tombstones are kept.
    pub fn invalidate_all(&self) {
        let version = self.tick();
        self.pruned_up_to.fetch_max(version, Ordering::SeqCst);
        self.state.retain(|_, s| s.removed);
        self.memory.clear();
    }

    /// Whether `key` is currently hidden by a pending removal.
    pub fn is_removed(&self, key: &K) -> bool {
        self.state.get(key).is_some_and(|s| s.removed)
    }

    /// Keys carrying version state: those in memory plus tombstones.
    pub fn tracked_keys(&self) -> usize {
        self.state.len()
    }

    /// Snapshot of the memory tier.
    pub fn memory_entries(&self) -> Vec<(K, V)> {
        self.memory.iter().map(|r| (r.key().clone(), r.value().clone())).collect()
    }

    pub fn memory_len(&self) -> usize {
        self.memory.len()
    }

    pub fn stats(&self) -> TierStats {
        TierStats {
            memory_items: self.memory.len(),
            memory_hits: self.memory_hits.load(Ordering::Relaxed),
            durable_hits: self.durable_hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::Notify;

    #[derive(Default)]
    struct MapTier {
        data: DashMap<String, u32>,
        gate: Option<(Arc<Notify>, Arc<Notify>)>,
    }

    #[async_trait]
    impl DurableTier<String, u32> for MapTier {
        async fn load(&self, key: &String) -> Result<Option<u32>, StorageError> {
            let value = self.data.get(key).map(|v| *v);
            if let Some((started, release)) = &self.gate {
                started.notify_one();
                release.notified().await;
            }
            Ok(value)
        }

        async fn store(&self, key: &String, value: &u32) -> Result<(), StorageError> {
            self.data.insert(key.clone(), *value);
            Ok(())
        }

        async fn delete(&self, key: &String) -> Result<(), StorageError> {
            self.data.remove(key);
            Ok(())
        }
    }

    fn cache_with(tier: MapTier) -> (TieredCache<String, u32>, Arc<MapTier>) {
        let tier = Arc::new(tier);
        (TieredCache::new(tier.clone()), tier)
    }

    #[tokio::test]
    async fn test_cold_read_promotes() {
        let (cache, tier) = cache_with(MapTier::default());
        tier.data.insert("a".into(), 1);

        let first = cache.get(&"a".to_string()).await.unwrap();
        assert_eq!(first, Some((1, SourceTier::Durable)));
        let second = cache.get(&"a".to_string()).await.unwrap();
        assert_eq!(second, Some((1, SourceTier::Memory)));

        let stats = cache.stats();
        assert_eq!(stats.durable_hits, 1);
        assert_eq!(stats.memory_hits, 1);
        assert_eq!(stats.memory_items, 1);
    }

    #[tokio::test]
    async fn test_set_persist_writes_both_tiers() {
        let (cache, tier) = cache_with(MapTier::default());
        cache.set("a".into(), 7, true).await.unwrap();
        cache.set("b".into(), 8, false).await.unwrap();

        assert_eq!(cache.peek(&"a".to_string()), Some(7));
        assert_eq!(tier.data.get("a").map(|v| *v), Some(7));
        assert!(tier.data.get("b").is_none());
    }

    #[tokio::test]
    async fn test_remove_then_get_is_absent() {
        let (cache, tier) = cache_with(MapTier::default());
        cache.set("a".into(), 1, true).await.unwrap();
        cache.remove(&"a".to_string(), true).await.unwrap();

        assert!(cache.get(&"a".to_string()).await.unwrap().is_none());
        assert!(tier.data.is_empty());
        assert!(!cache.is_removed(&"a".to_string()));
    }

    #[tokio::test]
    async fn test_memory_only_remove_hides_durable_copy() {
        let (cache, tier) = cache_with(MapTier::default());
        tier.data.insert("a".into(), 1);
        cache.remove(&"a".to_string(), false).await.unwrap();

        assert!(cache.get(&"a".to_string()).await.unwrap().is_none());
        // Invalidate lifts the tombstone and re-reads durable
        cache.invalidate(&"a".to_string());
        assert_eq!(cache.get(&"a".to_string()).await.unwrap(), Some((1, SourceTier::Durable)));
    }

    #[tokio::test]
    async fn test_invalidate_forces_durable_reread() {
        let (cache, tier) = cache_with(MapTier::default());
        cache.set("a".into(), 1, true).await.unwrap();
        tier.data.insert("a".into(), 2);

        assert_eq!(cache.get(&"a".to_string()).await.unwrap(), Some((1, SourceTier::Memory)));
        cache.invalidate(&"a".to_string());
        assert_eq!(cache.get(&"a".to_string()).await.unwrap(), Some((2, SourceTier::Durable)));
    }

    #[tokio::test]
    async fn test_invalidate_all_clears_memory() {
        let (cache, _) = cache_with(MapTier::default());
        for i in 0..5 {
            cache.set(format!("k{}", i), i, true).await.unwrap();
        }
        cache.invalidate_all();
        assert_eq!(cache.memory_len(), 0);
        assert_eq!(cache.get(&"k3".to_string()).await.unwrap(), Some((3, SourceTier::Durable)));
    }

    #[tokio::test]
    async fn test_state_is_dropped_after_remove_and_invalidate() {
        let (cache, tier) = cache_with(MapTier::default());
        for i in 0..100 {
            let key = format!("k{}", i);
            cache.set(key.clone(), i, true).await.unwrap();
            cache.remove(&key, true).await.unwrap();
        }
        assert_eq!(cache.tracked_keys(), 0);

        // Misses leave nothing behind either
        assert!(cache.get(&"nope".to_string()).await.unwrap().is_none());
        assert_eq!(cache.tracked_keys(), 0);

        tier.data.insert("a".into(), 1);
        cache.remove(&"a".to_string(), false).await.unwrap();
        cache.set("b".into(), 2, true).await.unwrap();
        assert_eq!(cache.tracked_keys(), 2);

        // invalidate_all keeps the tombstone and drops the rest
        cache.invalidate_all();
        assert_eq!(cache.tracked_keys(), 1);
        assert!(cache.is_removed(&"a".to_string()));

        cache.invalidate(&"a".to_string());
        assert_eq!(cache.tracked_keys(), 0);
        assert_eq!(cache.get(&"a".to_string()).await.unwrap(), Some((1, SourceTier::Durable)));
        assert_eq!(cache.tracked_keys(), 1);
    }

    #[tokio::test]
    async fn test_slow_read_does_not_resurrect_after_state_is_dropped() {
        let started = Arc::new(Notify::new());
        let release = Arc::new(Notify::new());
        let tier = MapTier {
            data: DashMap::new(),
            gate: Some((started.clone(), release.clone())),
        };
        tier.data.insert("a".into(), 1);
        let (cache, tier) = cache_with(tier);
        let cache = Arc::new(cache);

        let reader = {
            let cache = cache.clone();
            tokio::spawn(async move { cache.get(&"a".to_string()).await })
        };
        started.notified().await;

        // A complete remove, durable delete and state cleanup included
        cache.remove(&"a".to_string(), true).await.unwrap();
        assert_eq!(cache.tracked_keys(), 0);
        assert!(tier.data.is_empty());

        // The parked read notices and reads again
        release.notify_one();
        started.notified().await;
        release.notify_one();
        assert!(reader.await.unwrap().unwrap().is_none());
        assert!(cache.peek(&"a".to_string()).is_none());
    }

    #[tokio::test]
    async fn test_slow_read_does_not_resurrect_removed_key() {
        let started = Arc::new(Notify::new());
        let release = Arc::new(Notify::new());
        let tier = MapTier {
            data: DashMap::new(),
            gate: Some((started.clone(), release.clone())),
        };
        tier.data.insert("a".into(), 1);
        let (cache, _) = cache_with(tier);
        let cache = Arc::new(cache);

        let reader = {
            let cache = cache.clone();
            tokio::spawn(async move { cache.get(&"a".to_string()).await })
        };
        started.notified().await;

        // Remove while the read is parked inside the durable tier
        let version = cache.evict(&"a".to_string());
        release.notify_one();
        let read = reader.await.unwrap().unwrap();
        assert!(read.is_none());
        assert!(cache.peek(&"a".to_string()).is_none());

        // finish_remove also goes through the gated tier only for delete
        cache.finish_remove(&"a".to_string(), version).await.unwrap();
        assert!(cache.peek(&"a".to_string()).is_none());
    }
}
