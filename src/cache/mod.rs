// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Tiered Cache Manager.
//!
//! One [`TieredCache`] per entity type, all backed by the same
//! [`DurableStore`]. Change notification runs through a [`TopicRegistry`]:
//!
//! | Topic | Fires for |
//! |---|---|
//! | `task:<id>` | set/remove/invalidate of that task |
//! | `task` | any task |
//! | `*` | anything |
//!
//! Reads accept a temp ID even after it has been mapped: the lookup goes
//! through the [`IdTranslator`] first, so a UI holding a stale placeholder
//! still finds the canonical record.

pub mod tiered;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::id_translator::IdTranslator;
use crate::metrics;
use crate::model::{is_temp_id, CachedEntity, ChangeKind, EntityType, SourceTier, SyncEvent};
use crate::pubsub::{SubscribeError, Subscription, TopicRegistry, WILDCARD_TOPIC};
use crate::queue::rewrite::rewrite_value;
use crate::storage::{DurableStore, StorageError};

pub use tiered::{DurableTier, TierStats, TieredCache};

/// What happened to a cached entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheChange {
    Set,
    Removed,
    Invalidated,
}

/// Delivered to cache subscribers.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEvent {
    pub change: CacheChange,
    pub entity_type: EntityType,
    pub id: String,
    pub payload: Option<Value>,
}

/// Subscription key for one entity.
#[must_use]
pub fn entity_key(entity_type: EntityType, id: &str) -> String {
    format!("{}:{}", entity_type.as_str(), id)
}

/// Subscription key for a whole collection.
#[must_use]
pub fn collection_key(entity_type: EntityType) -> String {
    entity_type.as_str().to_string()
}

/// Adapts one collection of the [`DurableStore`] to a [`DurableTier`].
pub struct EntityTier {
    store: Arc<dyn DurableStore>,
    entity_type: EntityType,
}

impl EntityTier {
    pub fn new(store: Arc<dyn DurableStore>, entity_type: EntityType) -> Self {
        Self { store, entity_type }
    }
}

#[async_trait]
impl DurableTier<String, Value> for EntityTier {
    async fn load(&self, key: &String) -> Result<Option<Value>, StorageError> {
        self.store.get_entity(self.entity_type, key).await
    }

    async fn store(&self, key: &String, value: &Value) -> Result<(), StorageError> {
        self.store.put_entity(self.entity_type, key, value).await
    }

    async fn delete(&self, key: &String) -> Result<(), StorageError> {
        self.store.delete_entity(self.entity_type, key).await.map(|_| ())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TypeStats {
    pub memory_items: usize,
    pub durable_items: u64,
    pub memory_hits: u64,
    pub durable_hits: u64,
    pub misses: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub per_type: BTreeMap<EntityType, TypeStats>,
}

pub struct CacheManager {
    caches: HashMap<EntityType, TieredCache<String, Value>>,
    store: Arc<dyn DurableStore>,
    translator: Arc<IdTranslator>,
    registry: TopicRegistry<CacheEvent>,
    temp_id_prefix: String,
}

impl CacheManager {
    pub fn new(
        store: Arc<dyn DurableStore>,
        translator: Arc<IdTranslator>,
        max_handlers_per_topic: usize,
        temp_id_prefix: impl Into<String>,
    ) -> Self {
        let caches = EntityType::ALL
            .iter()
            .map(|&t| {
                let tier: Arc<dyn DurableTier<String, Value>> = Arc::new(EntityTier::new(store.clone(), t));
                (t, TieredCache::new(tier))
            })
            .collect();
        Self {
            caches,
            store,
            translator,
            registry: TopicRegistry::new(max_handlers_per_topic),
            temp_id_prefix: temp_id_prefix.into(),
        }
    }

    fn cache(&self, entity_type: EntityType) -> &TieredCache<String, Value> {
        // Every EntityType is inserted in `new`
        &self.caches[&entity_type]
    }

    /// Look up one entity, memory first.
    pub async fn get(&self, entity_type: EntityType, id: &str) -> Result<Option<CachedEntity>, StorageError> {
        let id = self.translator.resolve(id);
        let found = self.cache(entity_type).get(&id).await?;

        match &found {
            Some((_, tier)) => {
                debug!(entity = %entity_type, id = %id, tier = %tier, "Cache hit");
                metrics::record_cache_lookup(entity_type.as_str(), &tier.to_string(), "hit");
            }
            None => {
                metrics::record_cache_lookup(entity_type.as_str(), "all", "miss");
            }
        }

        Ok(found.map(|(payload, source_tier)| CachedEntity {
            entity_type,
            id,
            payload,
            source_tier,
        }))
    }

    /// Write an entity. Memory and subscribers are updated before the first
    /// await; with `persist` the call resolves only after the durable write.
    pub async fn set(&self, entity_type: EntityType, id: &str, payload: Value, persist: bool) -> Result<(), StorageError> {
        let cache = self.cache(entity_type);
        cache.put_memory(id.to_string(), payload.clone());
        metrics::set_cache_items(entity_type.as_str(), cache.memory_len());
        self.notify(CacheEvent {
            change: CacheChange::Set,
            entity_type,
            id: id.to_string(),
            payload: Some(payload.clone()),
        });

        if persist {
            if let Err(e) = cache.write_through(&id.to_string(), &payload).await {
                warn!(entity = %entity_type, id, error = %e, "Durable cache write failed");
                return Err(e);
            }
        }
        Ok(())
    }

    /// Evict from both tiers. The entity reads as absent from here on.
    pub async fn remove(&self, entity_type: EntityType, id: &str, persist: bool) -> Result<(), StorageError> {
        let cache = self.cache(entity_type);
        let key = id.to_string();
        let version = cache.evict(&key);
        metrics::set_cache_items(entity_type.as_str(), cache.memory_len());
        self.notify(CacheEvent {
            change: CacheChange::Removed,
            entity_type,
            id: key.clone(),
            payload: None,
        });

        if persist {
            cache.finish_remove(&key, version).await?;
        }
        Ok(())
    }

    /// Drop memory entries so the next read refreshes from the durable tier.
    /// `id = None` drops the whole type.
    pub fn invalidate_entity(&self, entity_type: EntityType, id: Option<&str>) {
        let cache = self.cache(entity_type);
        match id {
            Some(id) => {
                cache.invalidate(&id.to_string());
                metrics::record_cache_invalidation(entity_type.as_str(), "entity");
                self.notify(CacheEvent {
                    change: CacheChange::Invalidated,
                    entity_type,
                    id: id.to_string(),
                    payload: None,
                });
            }
            None => {
                cache.invalidate_all();
                metrics::record_cache_invalidation(entity_type.as_str(), "type");
                self.registry.publish_all(
                    &[&collection_key(entity_type), WILDCARD_TOPIC],
                    &CacheEvent {
                        change: CacheChange::Invalidated,
                        entity_type,
                        id: String::new(),
                        payload: None,
                    },
                );
            }
        }
        metrics::set_cache_items(entity_type.as_str(), cache.memory_len());
    }

    /// Drop the memory tier of every entity type.
    pub fn invalidate_all(&self) {
        for entity_type in EntityType::ALL {
            self.invalidate_entity(entity_type, None);
        }
        debug!("Invalidated all memory tiers");
    }

    /// Register a listener for an entity key, a collection key or `*`.
    /// See [`entity_key`] and [`collection_key`].
    pub fn subscribe<F>(&self, key: impl Into<String>, callback: F) -> Result<Subscription, SubscribeError>
    where
        F: Fn(&CacheEvent) + Send + Sync + 'static,
    {
        self.registry.subscribe(key, callback)
    }

    /// Apply a push or pull change. Idempotent: applying the same event
    /// twice leaves the same state and notifies only once.
    pub async fn apply_event(&self, event: &SyncEvent) -> Result<(), StorageError> {
        let entity_type = event.entity;
        let id = self.translator.resolve(&event.entity_id);

        match event.kind {
            ChangeKind::Created | ChangeKind::Updated => {
                if let Some(temp_id) = self.translator.get_temp_id(&id) {
                    self.drop_placeholder(entity_type, &temp_id).await?;
                }
                let current = self.cache(entity_type).get(&id).await?;
                if current.as_ref().is_some_and(|(v, _)| *v == event.payload) {
                    return Ok(());
                }
                self.set(entity_type, &id, event.payload.clone(), true).await
            }
            ChangeKind::Deleted => {
                let cache = self.cache(entity_type);
                if cache.is_removed(&id) {
                    return Ok(());
                }
                if cache.get(&id).await?.is_none() {
                    return Ok(());
                }
                self.remove(entity_type, &id, true).await
            }
            ChangeKind::Invalidated => {
                self.invalidate_entity(entity_type, Some(&id));
                Ok(())
            }
        }
    }

    /// Move a locally-created entity from its temp ID to its real ID and
    /// rewrite references to the temp ID held by other cached entities.
    ///
    /// `server_payload` wins over the optimistic local copy when present.
    #[tracing::instrument(skip(self, server_payload))]
    pub async fn reconcile_temp_id(
        &self,
        entity_type: EntityType,
        temp_id: &str,
        real_id: &str,
        server_payload: Option<Value>,
    ) -> Result<(), StorageError> {
        let local = self.cache(entity_type).get(&temp_id.to_string()).await?;

        let payload = match (server_payload, local) {
            (Some(server), _) => Some(server),
            (None, Some((mut local, _))) => {
                rewrite_value(&mut local, temp_id, real_id);
                if let Value::Object(map) = &mut local {
                    map.insert("id".to_string(), Value::String(real_id.to_string()));
                }
                Some(local)
            }
            (None, None) => None,
        };

        if let Some(payload) = payload {
            self.set(entity_type, real_id, payload, true).await?;
        }
        self.drop_placeholder(entity_type, temp_id).await?;
        self.rewrite_references(temp_id, real_id).await?;
        Ok(())
    }

    /// Merged collection view: durable records overlaid with memory.
    ///
    /// Removed entities are hidden, and so are temp-ID records whose mapping
    /// is already known, so a reconciled entity never appears twice.
    pub async fn list(&self, entity_type: EntityType) -> Result<Vec<CachedEntity>, StorageError> {
        let cache = self.cache(entity_type);
        let mut merged: BTreeMap<String, CachedEntity> = BTreeMap::new();

        for (id, payload) in self.store.list_entities(entity_type).await? {
            merged.insert(
                id.clone(),
                CachedEntity { entity_type, id, payload, source_tier: SourceTier::Durable },
            );
        }
        for (id, payload) in cache.memory_entries() {
            merged.insert(
                id.clone(),
                CachedEntity { entity_type, id, payload, source_tier: SourceTier::Memory },
            );
        }

        merged.retain(|id, _| {
            if cache.is_removed(id) {
                return false;
            }
            !(is_temp_id(id, &self.temp_id_prefix) && self.translator.get_real_id(id).is_some())
        });
        Ok(merged.into_values().collect())
    }

    /// Per-type counts for diagnostics.
    pub async fn get_stats(&self) -> Result<CacheStats, StorageError> {
        let mut per_type = BTreeMap::new();
        for entity_type in EntityType::ALL {
            let tier = self.cache(entity_type).stats();
            per_type.insert(
                entity_type,
                TypeStats {
                    memory_items: tier.memory_items,
                    durable_items: self.store.count_entities(entity_type).await?,
                    memory_hits: tier.memory_hits,
                    durable_hits: tier.durable_hits,
                    misses: tier.misses,
                },
            );
        }
        Ok(CacheStats { per_type })
    }

    /// Memory-only read, for callers that must not await.
    #[must_use]
    pub fn peek(&self, entity_type: EntityType, id: &str) -> Option<Value> {
        self.cache(entity_type).peek(&self.translator.resolve(id))
    }

    async fn drop_placeholder(&self, entity_type: EntityType, temp_id: &str) -> Result<(), StorageError> {
        let cache = self.cache(entity_type);
        let key = temp_id.to_string();
        let present = cache.peek(&key).is_some() || self.store.get_entity(entity_type, temp_id).await?.is_some();
        if present {
            self.remove(entity_type, temp_id, true).await?;
        }
        Ok(())
    }

    async fn rewrite_references(&self, temp_id: &str, real_id: &str) -> Result<(), StorageError> {
        for entity_type in EntityType::ALL {
            for (id, mut payload) in self.store.list_entities(entity_type).await? {
                if rewrite_value(&mut payload, temp_id, real_id) > 0 {
                    self.set(entity_type, &id, payload, true).await?;
                }
            }
            for (id, mut payload) in self.cache(entity_type).memory_entries() {
                if rewrite_value(&mut payload, temp_id, real_id) > 0 {
                    self.set(entity_type, &id, payload, false).await?;
                }
            }
        }
        Ok(())
    }

    fn notify(&self, event: CacheEvent) {
        let key = entity_key(event.entity_type, &event.id);
        let collection = collection_key(event.entity_type);
        self.registry.publish_all(&[&key, &collection, WILDCARD_TOPIC], &event);
    }
}
