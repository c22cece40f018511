// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

use crate::model::{EntityType, IdMapping, Mutation};

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Item not found")]
    NotFound,
    #[error("Storage backend error: {0}")]
    Backend(String),
    #[error("Corrupt record '{id}': {reason}")]
    Serialization { id: String, reason: String },
}

/// Per-device persistent storage: the offline source of truth.
///
/// Layout: one collection per entity type, a mutation outbox, the
/// temp→real ID mappings and a small key/value table for checkpoints
/// and leases. Every record is keyed by entity id (or temp ID pre-sync).
///
/// Shared by all tabs of one origin. No cross-tab transaction isolation:
/// writes are small and last-write-wins per record.
#[async_trait]
pub trait DurableStore: Send + Sync {
    // --- Entities ---
    async fn get_entity(&self, entity_type: EntityType, id: &str) -> Result<Option<Value>, StorageError>;
    async fn put_entity(&self, entity_type: EntityType, id: &str, payload: &Value) -> Result<(), StorageError>;
    /// Returns whether a record was removed.
    async fn delete_entity(&self, entity_type: EntityType, id: &str) -> Result<bool, StorageError>;
    async fn list_entities(&self, entity_type: EntityType) -> Result<Vec<(String, Value)>, StorageError>;
    async fn count_entities(&self, entity_type: EntityType) -> Result<u64, StorageError>;

    // --- Mutation outbox ---
    async fn put_mutation(&self, mutation: &Mutation) -> Result<(), StorageError>;
    async fn get_mutation(&self, id: &str) -> Result<Option<Mutation>, StorageError>;
    async fn delete_mutation(&self, id: &str) -> Result<bool, StorageError>;
    /// All outbox entries, ordered by `seq` ascending.
    async fn list_mutations(&self) -> Result<Vec<Mutation>, StorageError>;

    /// Write several outbox entries. Default falls back to sequential puts.
    async fn put_mutations(&self, mutations: &[Mutation]) -> Result<(), StorageError> {
        for m in mutations {
            self.put_mutation(m).await?;
        }
        Ok(())
    }

    // --- ID mappings ---
    async fn put_mapping(&self, mapping: &IdMapping) -> Result<(), StorageError>;
    async fn list_mappings(&self) -> Result<Vec<IdMapping>, StorageError>;
    /// Remove mappings with `timestamp < cutoff`; returns how many went.
    async fn delete_mappings_before(&self, cutoff: i64) -> Result<u64, StorageError>;

    // --- Metadata (checkpoints, leases) ---
    async fn get_meta(&self, key: &str) -> Result<Option<String>, StorageError>;
    async fn put_meta(&self, key: &str, value: &str) -> Result<(), StorageError>;
    async fn delete_meta(&self, key: &str) -> Result<(), StorageError>;
}
