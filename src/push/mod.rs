// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Real-time push channel.
//!
//! - [`server::PushHub`]: per-user connections, replay from an [`EventLog`],
//!   heartbeats and horizon rotation.
//! - [`client::PushClient`]: one connection per tab, many filtered
//!   subscribers, reconnect with `since` replay.
//! - [`sse`]: `text/event-stream` encoding/decoding and the reqwest transport.
//!
//! Frames on the wire are `{type, timestamp, data}`.

pub mod client;
pub mod event_log;
pub mod server;
pub mod sse;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;

use crate::model::{ChangeKind, EntityType, SyncEvent};

pub use client::{ConnectionState, FrameStream, HubTransport, PushClient, PushTransport};
pub use event_log::{EventLog, InMemoryEventLog, RedisEventLog};
pub use server::{HubStatus, PushConnection, PushHub, PushHubConfig};
pub use sse::{SseDecoder, SseTransport};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PushEventType {
    Connected,
    Ping,
    Reconnect,
    TaskCreated,
    TaskUpdated,
    TaskDeleted,
    CommentCreated,
    CommentUpdated,
    CommentDeleted,
    ListCreated,
    ListUpdated,
    ListDeleted,
    ListMemberAdded,
    ListMemberRemoved,
    ListMemberUpdated,
    UserSettingsUpdated,
}

impl PushEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Connected => "connected",
            Self::Ping => "ping",
            Self::Reconnect => "reconnect",
            Self::TaskCreated => "task_created",
            Self::TaskUpdated => "task_updated",
            Self::TaskDeleted => "task_deleted",
            Self::CommentCreated => "comment_created",
            Self::CommentUpdated => "comment_updated",
            Self::CommentDeleted => "comment_deleted",
            Self::ListCreated => "list_created",
            Self::ListUpdated => "list_updated",
            Self::ListDeleted => "list_deleted",
            Self::ListMemberAdded => "list_member_added",
            Self::ListMemberRemoved => "list_member_removed",
            Self::ListMemberUpdated => "list_member_updated",
            Self::UserSettingsUpdated => "user_settings_updated",
        }
    }

    /// Transport-level frames that carry no entity change.
    pub fn is_control(&self) -> bool {
        matches!(self, Self::Connected | Self::Ping | Self::Reconnect)
    }

    /// Which cached entity this event touches and how.
    ///
    /// Membership changes only carry the list id, so they invalidate the
    /// list instead of overwriting it.
    pub fn change(&self) -> Option<(EntityType, ChangeKind)> {
        use ChangeKind::*;
        use EntityType::*;
        Some(match self {
            Self::TaskCreated => (Task, Created),
            Self::TaskUpdated => (Task, Updated),
            Self::TaskDeleted => (Task, Deleted),
            Self::CommentCreated => (Comment, Created),
            Self::CommentUpdated => (Comment, Updated),
            Self::CommentDeleted => (Comment, Deleted),
            Self::ListCreated => (List, Created),
            Self::ListUpdated => (List, Updated),
            Self::ListDeleted => (List, Deleted),
            Self::ListMemberAdded | Self::ListMemberRemoved | Self::ListMemberUpdated => (List, Invalidated),
            Self::Connected | Self::Ping | Self::Reconnect | Self::UserSettingsUpdated => return None,
        })
    }

    /// Event type for a change, used when publishing from the server side.
    pub fn for_change(entity: EntityType, kind: ChangeKind) -> Option<Self> {
        use ChangeKind::*;
        use EntityType::*;
        Some(match (entity, kind) {
            (Task, Created) => Self::TaskCreated,
            (Task, Updated) => Self::TaskUpdated,
            (Task, Deleted) => Self::TaskDeleted,
            (Comment, Created) => Self::CommentCreated,
            (Comment, Updated) => Self::CommentUpdated,
            (Comment, Deleted) => Self::CommentDeleted,
            (List, Created) => Self::ListCreated,
            (List, Updated) => Self::ListUpdated,
            (List, Deleted) => Self::ListDeleted,
            (List, Invalidated) => Self::ListMemberUpdated,
            (_, Invalidated) => return None,
        })
    }
}

impl std::fmt::Display for PushEventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PushFrame {
    #[serde(rename = "type")]
    pub event_type: PushEventType,
    pub timestamp: i64,
    #[serde(default)]
    pub data: Value,
}

impl PushFrame {
    pub fn new(event_type: PushEventType, timestamp: i64, data: Value) -> Self {
        Self { event_type, timestamp, data }
    }

    /// Convert an entity frame into a cache change.
    ///
    /// The entity id is read from `data.id`, then `data.<entity>.id`; for
    /// membership events from `data.list_id`. The payload is `data.<entity>`
    /// when present, else `data` itself.
    pub fn to_sync_event(&self) -> Option<SyncEvent> {
        let (entity, kind) = self.event_type.change()?;
        let nested = self.data.get(entity.as_str()).filter(|v| v.is_object());

        let id = if kind == ChangeKind::Invalidated {
            id_field(&self.data, "list_id").or_else(|| id_field(&self.data, "id"))
        } else {
            id_field(&self.data, "id").or_else(|| nested.and_then(|n| id_field(n, "id")))
        }?;

        let payload = match kind {
            ChangeKind::Deleted | ChangeKind::Invalidated => Value::Null,
            _ => nested.cloned().unwrap_or_else(|| self.data.clone()),
        };

        Some(SyncEvent { kind, entity, entity_id: id, timestamp: self.timestamp, payload })
    }
}

fn id_field(value: &Value, field: &str) -> Option<String> {
    match value.get(field)? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Which frames a subscriber wants.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventFilter {
    /// Every frame, control frames included.
    Wildcard,
    Types(HashSet<PushEventType>),
}

impl EventFilter {
    pub fn only(types: impl IntoIterator<Item = PushEventType>) -> Self {
        Self::Types(types.into_iter().collect())
    }

    pub fn matches(&self, event_type: PushEventType) -> bool {
        match self {
            Self::Wildcard => true,
            Self::Types(set) => set.contains(&event_type),
        }
    }
}
