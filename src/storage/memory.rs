// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;

use super::traits::{DurableStore, StorageError};
use crate::model::{EntityType, IdMapping, Mutation};

/// Durable-store stand-in backed by DashMaps.
///
/// Survives nothing beyond the process, so it is used for tests and for
/// runtimes without a persistent backend. Cloning an `Arc` of one instance
/// gives several tabs the same "origin storage".
pub struct InMemoryStore {
    entities: DashMap<(EntityType, String), Value>,
    mutations: DashMap<String, Mutation>,
    mappings: DashMap<String, IdMapping>,
    meta: DashMap<String, String>,
}

impl InMemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self {
            entities: DashMap::new(),
            mutations: DashMap::new(),
            mappings: DashMap::new(),
            meta: DashMap::new(),
        }
    }

    /// Number of entity records across all collections
    #[must_use]
    pub fn len(&self) -> usize {
        self.entities.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    pub fn clear(&self) {
        self.entities.clear();
        self.mutations.clear();
        self.mappings.clear();
        self.meta.clear();
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DurableStore for InMemoryStore {
    async fn get_entity(&self, entity_type: EntityType, id: &str) -> Result<Option<Value>, StorageError> {
        Ok(self.entities.get(&(entity_type, id.to_string())).map(|r| r.value().clone()))
    }

    async fn put_entity(&self, entity_type: EntityType, id: &str, payload: &Value) -> Result<(), StorageError> {
        self.entities.insert((entity_type, id.to_string()), payload.clone());
        Ok(())
    }

    async fn delete_entity(&self, entity_type: EntityType, id: &str) -> Result<bool, StorageError> {
        Ok(self.entities.remove(&(entity_type, id.to_string())).is_some())
    }

    async fn list_entities(&self, entity_type: EntityType) -> Result<Vec<(String, Value)>, StorageError> {
        let mut out: Vec<(String, Value)> = self
            .entities
            .iter()
            .filter(|r| r.key().0 == entity_type)
            .map(|r| (r.key().1.clone(), r.value().clone()))
            .collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(out)
    }

    async fn count_entities(&self, entity_type: EntityType) -> Result<u64, StorageError> {
        Ok(self.entities.iter().filter(|r| r.key().0 == entity_type).count() as u64)
    }

    async fn put_mutation(&self, mutation: &Mutation) -> Result<(), StorageError> {
        self.mutations.insert(mutation.id.clone(), mutation.clone());
        Ok(())
    }

    async fn get_mutation(&self, id: &str) -> Result<Option<Mutation>, StorageError> {
        Ok(self.mutations.get(id).map(|r| r.value().clone()))
    }

    async fn delete_mutation(&self, id: &str) -> Result<bool, StorageError> {
        Ok(self.mutations.remove(id).is_some())
    }

    async fn list_mutations(&self) -> Result<Vec<Mutation>, StorageError> {
        let mut out: Vec<Mutation> = self.mutations.iter().map(|r| r.value().clone()).collect();
        out.sort_by_key(|m| m.seq);
        Ok(out)
    }

    async fn put_mapping(&self, mapping: &IdMapping) -> Result<(), StorageError> {
        self.mappings.insert(mapping.temp_id.clone(), mapping.clone());
        Ok(())
    }

    async fn list_mappings(&self) -> Result<Vec<IdMapping>, StorageError> {
        Ok(self.mappings.iter().map(|r| r.value().clone()).collect())
    }

    async fn delete_mappings_before(&self, cutoff: i64) -> Result<u64, StorageError> {
        let before = self.mappings.len();
        self.mappings.retain(|_, m| m.timestamp >= cutoff);
        Ok((before - self.mappings.len()) as u64)
    }

    async fn get_meta(&self, key: &str) -> Result<Option<String>, StorageError> {
        Ok(self.meta.get(key).map(|r| r.value().clone()))
    }

    async fn put_meta(&self, key: &str, value: &str) -> Result<(), StorageError> {
        self.meta.insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn delete_meta(&self, key: &str) -> Result<(), StorageError> {
        self.meta.remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{HttpMethod, MutationOp, MutationStatus};
    use serde_json::json;

    fn mutation(id: &str, seq: i64) -> Mutation {
        Mutation {
            id: id.to_string(),
            entity_type: EntityType::Task,
            op: MutationOp::Update,
            entity_id: "t1".into(),
            temp_id: None,
            real_id: None,
            parent_id: None,
            endpoint: "/api/tasks/t1".into(),
            method: HttpMethod::Patch,
            body: json!({"done": true}),
            status: MutationStatus::Pending,
            retry_count: 0,
            created_at: 0,
            seq,
            idempotency_key: id.to_string(),
            next_attempt_at: 0,
            last_error: None,
        }
    }

    #[tokio::test]
    async fn test_new_store_is_empty() {
        let store = InMemoryStore::new();
        assert!(store.is_empty());
        assert_eq!(store.len(), 0);
    }

    #[tokio::test]
    async fn test_entity_put_get_delete() {
        let store = InMemoryStore::new();
        store.put_entity(EntityType::Task, "t1", &json!({"title": "a"})).await.unwrap();

        let got = store.get_entity(EntityType::Task, "t1").await.unwrap();
        assert_eq!(got, Some(json!({"title": "a"})));
        // Same id in another collection is a different record
        assert!(store.get_entity(EntityType::List, "t1").await.unwrap().is_none());

        assert!(store.delete_entity(EntityType::Task, "t1").await.unwrap());
        assert!(!store.delete_entity(EntityType::Task, "t1").await.unwrap());
        assert!(store.get_entity(EntityType::Task, "t1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_list_and_count_are_per_collection() {
        let store = InMemoryStore::new();
        for i in 0..3 {
            store.put_entity(EntityType::Comment, &format!("c{}", i), &json!({})).await.unwrap();
        }
        store.put_entity(EntityType::Task, "t1", &json!({})).await.unwrap();

        assert_eq!(store.count_entities(EntityType::Comment).await.unwrap(), 3);
        let listed = store.list_entities(EntityType::Comment).await.unwrap();
        assert_eq!(listed.iter().map(|(id, _)| id.as_str()).collect::<Vec<_>>(), vec!["c0", "c1", "c2"]);
    }

    #[tokio::test]
    async fn test_mutations_listed_in_seq_order() {
        let store = InMemoryStore::new();
        store.put_mutation(&mutation("b", 20)).await.unwrap();
        store.put_mutation(&mutation("a", 10)).await.unwrap();
        store.put_mutation(&mutation("c", 30)).await.unwrap();

        let ids: Vec<String> = store.list_mutations().await.unwrap().into_iter().map(|m| m.id).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);

        assert!(store.delete_mutation("b").await.unwrap());
        assert_eq!(store.list_mutations().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_mapping_sweep_by_cutoff() {
        let store = InMemoryStore::new();
        for (temp, ts) in [("temp-old", 100), ("temp-new", 1_000)] {
            store.put_mapping(&IdMapping {
                temp_id: temp.into(),
                real_id: format!("real-{}", ts),
                entity_type: EntityType::Task,
                timestamp: ts,
            }).await.unwrap();
        }

        let removed = store.delete_mappings_before(500).await.unwrap();
        assert_eq!(removed, 1);
        let left = store.list_mappings().await.unwrap();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].temp_id, "temp-new");
    }

    #[tokio::test]
    async fn test_meta_roundtrip() {
        let store = InMemoryStore::default();
        assert!(store.get_meta("checkpoint").await.unwrap().is_none());
        store.put_meta("checkpoint", "42").await.unwrap();
        assert_eq!(store.get_meta("checkpoint").await.unwrap().as_deref(), Some("42"));
        store.delete_meta("checkpoint").await.unwrap();
        assert!(store.get_meta("checkpoint").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_concurrent_access() {
        use std::sync::Arc;

        let store = Arc::new(InMemoryStore::new());
        let mut handles = vec![];

        for batch in 0..10 {
            let store_clone = store.clone();
            handles.push(tokio::spawn(async move {
                for i in 0..10 {
                    let id = format!("batch-{}-item-{}", batch, i);
                    store_clone.put_entity(EntityType::Task, &id, &json!({"i": i})).await.unwrap();
                }
            }));
        }

        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(store.len(), 100);
    }
}
