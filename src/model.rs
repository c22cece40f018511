// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Core data model shared by every component.
//!
//! Entities are carried as untyped JSON payloads keyed by `(EntityType, id)`.
//! The sync core never interprets task/list/comment fields beyond the id
//! references it has to rewrite when a temp ID is resolved.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::atomic::{AtomicI64, Ordering};

/// Default prefix for client-generated placeholder identifiers.
pub const DEFAULT_TEMP_ID_PREFIX: &str = "temp-";

/// Current wall-clock time in epoch milliseconds.
#[must_use]
pub fn now_millis() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

/// Strictly increasing sequence derived from the clock.
///
/// Used to order outbox entries: two mutations enqueued in the same
/// millisecond still get distinct, ordered sequence numbers.
#[derive(Debug, Default)]
pub struct SequenceGen {
    last: AtomicI64,
}

impl SequenceGen {
    pub fn new() -> Self {
        Self { last: AtomicI64::new(0) }
    }

    /// Start above a previously persisted sequence (e.g. after reload).
    pub fn starting_after(seq: i64) -> Self {
        Self { last: AtomicI64::new(seq) }
    }

    /// Never hand out a value at or below `seq` from now on.
    pub fn observe(&self, seq: i64) {
        self.last.fetch_max(seq, Ordering::AcqRel);
    }

    pub fn next(&self) -> i64 {
        let candidate = now_millis() * 1000;
        let mut prev = self.last.load(Ordering::Acquire);
        loop {
            let next = candidate.max(prev + 1);
            match self.last.compare_exchange_weak(prev, next, Ordering::AcqRel, Ordering::Acquire) {
                Ok(_) => return next,
                Err(actual) => prev = actual,
            }
        }
    }
}

/// Generate a fresh temp ID with the given prefix.
#[must_use]
pub fn new_temp_id(prefix: &str) -> String {
    format!("{}{}", prefix, uuid::Uuid::new_v4())
}

/// Whether `id` is a client-generated placeholder.
#[must_use]
pub fn is_temp_id(id: &str, prefix: &str) -> bool {
    !prefix.is_empty() && id.starts_with(prefix)
}

/// Entity collections held by the durable store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    Task,
    List,
    Comment,
}

impl EntityType {
    pub const ALL: [EntityType; 3] = [EntityType::Task, EntityType::List, EntityType::Comment];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Task => "task",
            Self::List => "list",
            Self::Comment => "comment",
        }
    }

    /// Name of the durable collection (table) for this type.
    pub fn collection(&self) -> &'static str {
        match self {
            Self::Task => "tasks",
            Self::List => "lists",
            Self::Comment => "comments",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "task" | "tasks" => Some(Self::Task),
            "list" | "lists" => Some(Self::List),
            "comment" | "comments" => Some(Self::Comment),
            _ => None,
        }
    }
}

impl std::fmt::Display for EntityType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which cache tier served a read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceTier {
    Memory,
    Durable,
}

impl std::fmt::Display for SourceTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Memory => write!(f, "memory"),
            Self::Durable => write!(f, "durable"),
        }
    }
}

/// An entity as returned by the cache manager.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedEntity {
    pub entity_type: EntityType,
    pub id: String,
    pub payload: Value,
    pub source_tier: SourceTier,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MutationOp {
    Create,
    Update,
    Delete,
}

impl std::fmt::Display for MutationOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Create => write!(f, "create"),
            Self::Update => write!(f, "update"),
            Self::Delete => write!(f, "delete"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    Post,
    Put,
    Patch,
    Delete,
}

impl HttpMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Post => "POST",
            Self::Put => "PUT",
            Self::Patch => "PATCH",
            Self::Delete => "DELETE",
        }
    }
}

impl std::fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MutationStatus {
    Pending,
    Syncing,
    Failed,
    Success,
}

impl std::fmt::Display for MutationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Syncing => write!(f, "syncing"),
            Self::Failed => write!(f, "failed"),
            Self::Success => write!(f, "success"),
        }
    }
}

/// A durable, pending write against the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Mutation {
    pub id: String,
    pub entity_type: EntityType,
    pub op: MutationOp,
    /// Target entity id; a temp ID for creates made offline.
    pub entity_id: String,
    /// Placeholder id this mutation creates (creates only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temp_id: Option<String>,
    /// Server id, filled once known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub real_id: Option<String>,
    /// Entity this one depends on (e.g. the task a comment belongs to).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    pub endpoint: String,
    pub method: HttpMethod,
    #[serde(default)]
    pub body: Value,
    pub status: MutationStatus,
    pub retry_count: u32,
    pub created_at: i64,
    /// Outbox ordering key (strictly increasing per tab).
    pub seq: i64,
    /// Sent as `Idempotency-Key` so re-sent mutations can be deduplicated.
    pub idempotency_key: String,
    /// Earliest time the next attempt may run (epoch millis).
    #[serde(default)]
    pub next_attempt_at: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl Mutation {
    /// Ids this mutation must see resolved before it can be sent.
    pub fn referenced_ids(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.entity_id.as_str()).chain(self.parent_id.as_deref())
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.status, MutationStatus::Failed | MutationStatus::Success)
    }
}

/// Persistent temp→real identifier mapping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdMapping {
    pub temp_id: String,
    pub real_id: String,
    pub entity_type: EntityType,
    pub timestamp: i64,
}

/// Kind of change an event describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Created,
    Updated,
    Deleted,
    /// Membership or other container-level change; payload is incomplete.
    Invalidated,
}

/// A change to one entity, from the push channel or a pull.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncEvent {
    pub kind: ChangeKind,
    pub entity: EntityType,
    pub entity_id: String,
    pub timestamp: i64,
    #[serde(default)]
    pub payload: Value,
}
