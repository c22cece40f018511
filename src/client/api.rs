// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Local-first write and read API.
//!
//! Every write is optimistic: the cache is updated (and subscribers fire)
//! before the mutation is queued, and nothing here waits on the network.
//! If the outbox write fails the cache change is undone, so the cache never
//! shows a local edit that will not be sent.

use serde_json::Value;
use tracing::{debug, warn};

use crate::cache::CacheEvent;
use crate::crosstab::CrossTabEvent;
use crate::error::SyncError;
use crate::model::{new_temp_id, CachedEntity, EntityType};
use crate::pubsub::{SubscribeError, Subscription};
use crate::queue::{DrainReport, MutationStats, NewMutation};
use crate::sync::{SyncOptions, SyncResult};

use super::{DiagnosticStatus, SyncClient};

impl SyncClient {
    /// Create an entity offline. Returns its temp ID; the server ID replaces
    /// it once the create has synced.
    pub async fn create(
        &self,
        entity_type: EntityType,
        endpoint: &str,
        payload: Value,
        parent_id: Option<&str>,
    ) -> Result<String, SyncError> {
        let temp_id = new_temp_id(&self.config.temp_id_prefix);
        let mut new = NewMutation::create(entity_type, temp_id.clone(), endpoint, payload.clone());
        if let Some(parent) = parent_id {
            new = new.with_parent(self.translator.resolve(parent));
        }
        new.validate()?;

        let local = with_id(payload, &temp_id);
        self.cache.set(entity_type, &temp_id, local.clone(), true).await?;
        if let Err(e) = self.queue.enqueue(new).await {
            return Err(self.roll_back(entity_type, &temp_id, None, e).await);
        }
        self.crosstab.broadcast(CrossTabEvent::CacheUpdated, Some(entity_type), Some(&temp_id), local);
        debug!(entity = %entity_type, temp_id = %temp_id, "Optimistic create");
        Ok(temp_id)
    }

    /// Patch an entity. `patch` fields are merged over the cached copy.
    pub async fn update(&self, entity_type: EntityType, id: &str, endpoint: &str, patch: Value) -> Result<(), SyncError> {
        let id = self.translator.resolve(id);
        let new = NewMutation::update(entity_type, id.clone(), endpoint, patch.clone());
        new.validate()?;

        let current = self.cache.get(entity_type, &id).await?.map(|e| e.payload);
        let merged = merge(current.clone(), patch);
        self.cache.set(entity_type, &id, merged.clone(), true).await?;
        if let Err(e) = self.queue.enqueue(new).await {
            return Err(self.roll_back(entity_type, &id, current, e).await);
        }
        self.crosstab.broadcast(CrossTabEvent::CacheUpdated, Some(entity_type), Some(&id), merged);
        Ok(())
    }

    pub async fn delete(&self, entity_type: EntityType, id: &str, endpoint: &str) -> Result<(), SyncError> {
        let id = self.translator.resolve(id);
        let new = NewMutation::delete(entity_type, id.clone(), endpoint);
        new.validate()?;

        let current = self.cache.get(entity_type, &id).await?.map(|e| e.payload);
        self.cache.remove(entity_type, &id, true).await?;
        if let Err(e) = self.queue.enqueue(new).await {
            return Err(self.roll_back(entity_type, &id, current, e).await);
        }
        self.crosstab.broadcast(CrossTabEvent::EntityDeleted, Some(entity_type), Some(&id), Value::Null);
        Ok(())
    }

    pub async fn get(&self, entity_type: EntityType, id: &str) -> Result<Option<CachedEntity>, SyncError> {
        Ok(self.cache.get(entity_type, id).await?)
    }

    pub async fn list(&self, entity_type: EntityType) -> Result<Vec<CachedEntity>, SyncError> {
        Ok(self.cache.list(entity_type).await?)
    }

    /// Cache change notifications for an entity key, a collection key or `*`.
    pub fn subscribe<F>(&self, key: impl Into<String>, callback: F) -> Result<Subscription, SubscribeError>
    where
        F: Fn(&CacheEvent) + Send + Sync + 'static,
    {
        self.cache.subscribe(key, callback)
    }

    pub async fn drain_now(&self) -> Result<DrainReport, SyncError> {
        self.queue.drain().await
    }

    pub async fn sync_now(&self, options: SyncOptions) -> SyncResult {
        self.sync.perform_incremental_sync(options).await
    }

    /// Clear an auth pause and drain right away.
    pub async fn resume_after_reauth(&self) -> Result<DrainReport, SyncError> {
        self.queue.resume();
        self.queue.drain().await
    }

    pub async fn mutation_stats(&self) -> Result<MutationStats, SyncError> {
        Ok(self.queue.get_mutation_stats().await?)
    }

    /// `{activeConnections, totalConnections, pending, failed}`.
    pub async fn diagnostics(&self) -> Result<DiagnosticStatus, SyncError> {
        let stats = self.queue.get_mutation_stats().await?;
        let (active_connections, total_connections) = match &self.push {
            Some(push) => {
                let s = push.connection_state();
                (usize::from(s.is_connected), s.total_connections)
            }
            None => (0, 0),
        };
        Ok(DiagnosticStatus { active_connections, total_connections, pending: stats.pending, failed: stats.failed })
    }
}

impl SyncClient {
    /// Undo an optimistic cache write whose mutation never reached the
    /// outbox. Returns the enqueue error for the caller.
    async fn roll_back(&self, entity_type: EntityType, id: &str, previous: Option<Value>, err: SyncError) -> SyncError {
        warn!(entity = %entity_type, id, error = %err, "Could not queue write, rolling back local change");
        let restored = match previous {
            Some(payload) => self.cache.set(entity_type, id, payload, true).await,
            None => self.cache.remove(entity_type, id, true).await,
        };
        if let Err(e) = restored {
            warn!(entity = %entity_type, id, error = %e, "Rollback of local change failed");
        }
        err
    }
}

fn with_id(payload: Value, id: &str) -> Value {
    match payload {
        Value::Object(mut map) => {
            map.entry("id").or_insert_with(|| Value::String(id.to_string()));
            Value::Object(map)
        }
        other => other,
    }
}

/// Shallow merge; a non-object patch replaces the value.
fn merge(current: Option<Value>, patch: Value) -> Value {
    match (current, patch) {
        (Some(Value::Object(mut base)), Value::Object(patch)) => {
            for (k, v) in patch {
                base.insert(k, v);
            }
            Value::Object(base)
        }
        (_, patch) => patch,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_merge_is_shallow() {
        let merged = merge(Some(json!({"a": 1, "b": {"x": 1}})), json!({"b": {"y": 2}, "c": 3}));
        assert_eq!(merged, json!({"a": 1, "b": {"y": 2}, "c": 3}));
        assert_eq!(merge(None, json!({"a": 1})), json!({"a": 1}));
    }

    #[test]
    fn test_with_id_keeps_existing() {
        assert_eq!(with_id(json!({"title": "x"}), "temp-1"), json!({"title": "x", "id": "temp-1"}));
        assert_eq!(with_id(json!({"id": "a"}), "temp-1"), json!({"id": "a"}));
    }
}
