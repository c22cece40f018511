// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Same-origin message transports.
//!
//! [`Broadcaster`] is a capability: a runtime with a real low-latency
//! channel uses [`OriginChannel`], anything else gets [`NoopBroadcaster`],
//! which accepts every message and delivers none.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;

use crate::error::SyncError;
use crate::model::EntityType;

/// Cross-tab event catalog.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CrossTabEvent {
    MutationQueued,
    /// Carries `temp_id` → `real_id` for creates.
    MutationSynced,
    MutationFailed,
    CacheUpdated,
    EntityDeleted,
    SyncStarted,
    /// Carries `success_count` and `failed_count`.
    SyncCompleted,
}

impl CrossTabEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MutationQueued => "mutation_queued",
            Self::MutationSynced => "mutation_synced",
            Self::MutationFailed => "mutation_failed",
            Self::CacheUpdated => "cache_updated",
            Self::EntityDeleted => "entity_deleted",
            Self::SyncStarted => "sync_started",
            Self::SyncCompleted => "sync_completed",
        }
    }
}

impl std::fmt::Display for CrossTabEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CrossTabMessage {
    #[serde(rename = "type")]
    pub event: CrossTabEvent,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity: Option<EntityType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity_id: Option<String>,
    #[serde(default)]
    pub data: Value,
    /// Tab id of the sender, used to drop echoes.
    pub sender: String,
    pub timestamp: i64,
}

pub trait Broadcaster: Send + Sync {
    /// Whether messages actually reach other tabs.
    fn is_supported(&self) -> bool;

    /// Fan a message out to every listener on the channel.
    fn post(&self, message: &CrossTabMessage) -> Result<(), SyncError>;

    /// A receiver for incoming messages, or `None` when unsupported.
    fn listen(&self) -> Option<broadcast::Receiver<CrossTabMessage>>;
}

/// In-process stand-in for a same-origin broadcast channel.
///
/// Every tab of one origin holds a clone; a message posted by any clone
/// reaches every listener, including the sender's own, so receivers filter
/// echoes by [`CrossTabMessage::sender`].
#[derive(Clone)]
pub struct OriginChannel {
    name: String,
    sender: broadcast::Sender<CrossTabMessage>,
}

impl OriginChannel {
    pub fn new(name: impl Into<String>, capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { name: name.into(), sender }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn listener_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Broadcaster for OriginChannel {
    fn is_supported(&self) -> bool {
        true
    }

    fn post(&self, message: &CrossTabMessage) -> Result<(), SyncError> {
        // No listeners is not an error: this may be the only tab.
        let _ = self.sender.send(message.clone());
        Ok(())
    }

    fn listen(&self) -> Option<broadcast::Receiver<CrossTabMessage>> {
        Some(self.sender.subscribe())
    }
}

/// Broadcaster for runtimes without a cross-tab primitive.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopBroadcaster;

impl Broadcaster for NoopBroadcaster {
    fn is_supported(&self) -> bool {
        false
    }

    fn post(&self, _message: &CrossTabMessage) -> Result<(), SyncError> {
        Ok(())
    }

    fn listen(&self) -> Option<broadcast::Receiver<CrossTabMessage>> {
        None
    }
}
