// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Temp ID → real ID translation.
//!
//! Two DashMaps give O(1) lookups in both directions; every mapping is also
//! written to the durable store so a reload (or another tab) sees it.
//! Mappings older than the configured TTL are removed by
//! [`IdTranslator::clear_old_mappings`].

use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::metrics;
use crate::model::{now_millis, EntityType, IdMapping};
use crate::storage::{DurableStore, StorageError};

pub struct IdTranslator {
    store: Arc<dyn DurableStore>,
    by_temp: DashMap<String, IdMapping>,
    by_real: DashMap<String, String>,
}

impl IdTranslator {
    pub fn new(store: Arc<dyn DurableStore>) -> Self {
        Self {
            store,
            by_temp: DashMap::new(),
            by_real: DashMap::new(),
        }
    }

    /// Populate the lookup maps from the durable store.
    ///
    /// Returns how many mappings were loaded.
    pub async fn load(&self) -> Result<usize, StorageError> {
        let mappings = self.store.list_mappings().await?;
        let count = mappings.len();
        for mapping in mappings {
            self.index(mapping);
        }
        metrics::set_id_mappings(self.by_temp.len());
        debug!(count, "Loaded ID mappings");
        Ok(count)
    }

    /// Record `temp_id → real_id`. Idempotent: saving the same pair twice
    /// leaves one mapping. Re-mapping a temp ID to a different real ID
    /// replaces the old entry.
    pub async fn save_mapping(
        &self,
        temp_id: &str,
        real_id: &str,
        entity_type: EntityType,
    ) -> Result<IdMapping, StorageError> {
        if let Some(existing) = self.by_temp.get(temp_id) {
            if existing.real_id == real_id && existing.entity_type == entity_type {
                return Ok(existing.clone());
            }
        }

        let mapping = IdMapping {
            temp_id: temp_id.to_string(),
            real_id: real_id.to_string(),
            entity_type,
            timestamp: now_millis(),
        };
        self.store.put_mapping(&mapping).await?;

        if let Some((_, old)) = self.by_temp.remove(temp_id) {
            if old.real_id != real_id {
                warn!(temp_id, old_real = %old.real_id, new_real = real_id, "Temp ID re-mapped");
                self.by_real.remove(&old.real_id);
            }
        }
        self.index(mapping.clone());
        metrics::set_id_mappings(self.by_temp.len());
        debug!(temp_id, real_id, entity = %entity_type, "Saved ID mapping");
        Ok(mapping)
    }

    #[must_use]
    pub fn get_real_id(&self, temp_id: &str) -> Option<String> {
        self.by_temp.get(temp_id).map(|m| m.real_id.clone())
    }

    #[must_use]
    pub fn get_temp_id(&self, real_id: &str) -> Option<String> {
        self.by_real.get(real_id).map(|t| t.clone())
    }

    #[must_use]
    pub fn get_mapping(&self, temp_id: &str) -> Option<IdMapping> {
        self.by_temp.get(temp_id).map(|m| m.clone())
    }

    /// Resolve `id` to its canonical form: the real ID when `id` is a mapped
    /// temp ID, otherwise `id` itself.
    #[must_use]
    pub fn resolve(&self, id: &str) -> String {
        self.get_real_id(id).unwrap_or_else(|| id.to_string())
    }

    /// Snapshot of all known mappings.
    #[must_use]
    pub fn mappings(&self) -> Vec<IdMapping> {
        self.by_temp.iter().map(|r| r.value().clone()).collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.by_temp.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.by_temp.is_empty()
    }

    /// Remove mappings older than `max_age`, in memory and durably.
    #[tracing::instrument(skip(self))]
    pub async fn clear_old_mappings(&self, max_age: Duration) -> Result<u64, StorageError> {
        let cutoff = now_millis() - max_age.as_millis() as i64;
        let removed = self.store.delete_mappings_before(cutoff).await?;

        let stale: Vec<IdMapping> = self
            .by_temp
            .iter()
            .filter(|r| r.timestamp < cutoff)
            .map(|r| r.value().clone())
            .collect();
        for mapping in &stale {
            self.by_temp.remove(&mapping.temp_id);
            self.by_real.remove(&mapping.real_id);
        }

        let swept = removed.max(stale.len() as u64);
        if swept > 0 {
            info!(swept, "Swept expired ID mappings");
        }
        metrics::record_id_mappings_swept(swept);
        metrics::set_id_mappings(self.by_temp.len());
        Ok(swept)
    }

    fn index(&self, mapping: IdMapping) {
        self.by_real.insert(mapping.real_id.clone(), mapping.temp_id.clone());
        self.by_temp.insert(mapping.temp_id.clone(), mapping);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory::InMemoryStore;

    fn translator() -> (IdTranslator, Arc<InMemoryStore>) {
        let store = Arc::new(InMemoryStore::new());
        (IdTranslator::new(store.clone()), store)
    }

    #[tokio::test]
    async fn test_lookup_both_directions() {
        let (t, _) = translator();
        t.save_mapping("temp-1", "real-99", EntityType::Task).await.unwrap();

        assert_eq!(t.get_real_id("temp-1").as_deref(), Some("real-99"));
        assert_eq!(t.get_temp_id("real-99").as_deref(), Some("temp-1"));
        assert_eq!(t.resolve("temp-1"), "real-99");
        assert_eq!(t.resolve("real-5"), "real-5");
        assert!(t.get_real_id("temp-2").is_none());
    }

    #[tokio::test]
    async fn test_save_is_idempotent() {
        let (t, store) = translator();
        let first = t.save_mapping("temp-1", "real-99", EntityType::Task).await.unwrap();
        let second = t.save_mapping("temp-1", "real-99", EntityType::Task).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(t.len(), 1);
        assert_eq!(store.list_mappings().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_remap_drops_old_reverse_entry() {
        let (t, _) = translator();
        t.save_mapping("temp-1", "real-1", EntityType::List).await.unwrap();
        t.save_mapping("temp-1", "real-2", EntityType::List).await.unwrap();

        assert_eq!(t.get_real_id("temp-1").as_deref(), Some("real-2"));
        assert!(t.get_temp_id("real-1").is_none());
        assert_eq!(t.len(), 1);
    }

    #[tokio::test]
    async fn test_load_restores_from_store() {
        let store = Arc::new(InMemoryStore::new());
        {
            let t = IdTranslator::new(store.clone());
            t.save_mapping("temp-a", "real-a", EntityType::Comment).await.unwrap();
        }

        let reloaded = IdTranslator::new(store);
        assert!(reloaded.is_empty());
        assert_eq!(reloaded.load().await.unwrap(), 1);
        assert_eq!(reloaded.get_real_id("temp-a").as_deref(), Some("real-a"));
    }

    #[tokio::test]
    async fn test_clear_old_mappings() {
        let (t, store) = translator();
        store.put_mapping(&IdMapping {
            temp_id: "temp-old".into(),
            real_id: "real-old".into(),
            entity_type: EntityType::Task,
            timestamp: now_millis() - 8 * 24 * 3600 * 1000,
        }).await.unwrap();
        t.load().await.unwrap();
        t.save_mapping("temp-new", "real-new", EntityType::Task).await.unwrap();

        let swept = t.clear_old_mappings(Duration::from_secs(7 * 24 * 3600)).await.unwrap();
        assert_eq!(swept, 1);
        assert!(t.get_real_id("temp-old").is_none());
        assert!(t.get_temp_id("real-old").is_none());
        assert_eq!(t.get_real_id("temp-new").as_deref(), Some("real-new"));
        assert_eq!(store.list_mappings().await.unwrap().len(), 1);
    }
}
