// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Short-retention per-user event log used for reconnect replay.
//!
//! Horizontally scaled servers share one log through Redis so any instance
//! can answer `since=T`. Without Redis each instance keeps its own log in
//! memory.

use async_trait::async_trait;
use dashmap::DashMap;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client, Script};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::Duration;
use tracing::warn;

use super::PushFrame;
use crate::metrics;
use crate::model::now_millis;
use crate::resilience::retry::{retry, RetryConfig};
use crate::storage::StorageError;

#[async_trait]
pub trait EventLog: Send + Sync {
    /// Record `frame` and return it with its final timestamp.
    ///
    /// The log owns the per-user order: the stored timestamp is at least
    /// `frame.timestamp` and strictly greater than every earlier frame for
    /// the same user, across every writer sharing the log.
    async fn append(&self, user_id: &str, frame: PushFrame) -> Result<PushFrame, StorageError>;

    /// Frames recorded strictly after `since`, oldest first.
    async fn since(&self, user_id: &str, since: i64) -> Result<Vec<PushFrame>, StorageError>;
}

#[derive(Default)]
struct UserLog {
    frames: VecDeque<PushFrame>,
    last: i64,
}

pub struct InMemoryEventLog {
    users: DashMap<String, UserLog>,
    retention: Duration,
    max_per_user: usize,
}

impl InMemoryEventLog {
    pub fn new(retention: Duration, max_per_user: usize) -> Self {
        Self {
            users: DashMap::new(),
            retention,
            max_per_user: max_per_user.max(1),
        }
    }

    fn cutoff(&self) -> i64 {
        now_millis() - self.retention.as_millis() as i64
    }

    pub fn len(&self, user_id: &str) -> usize {
        self.users.get(user_id).map_or(0, |u| u.frames.len())
    }
}

#[async_trait]
impl EventLog for InMemoryEventLog {
    async fn append(&self, user_id: &str, mut frame: PushFrame) -> Result<PushFrame, StorageError> {
        let cutoff = self.cutoff();
        let mut user = self.users.entry(user_id.to_string()).or_default();

        frame.timestamp = frame.timestamp.max(user.last.saturating_add(1));
        user.last = frame.timestamp;
        user.frames.push_back(frame.clone());

        while user.frames.front().is_some_and(|f| f.timestamp < cutoff) {
            user.frames.pop_front();
        }
        while user.frames.len() > self.max_per_user {
            user.frames.pop_front();
        }
        Ok(frame)
    }

    async fn since(&self, user_id: &str, since: i64) -> Result<Vec<PushFrame>, StorageError> {
        let cutoff = self.cutoff();
        Ok(self
            .users
            .get(user_id)
            .map(|u| {
                u.frames
                    .iter()
                    .filter(|f| f.timestamp > since && f.timestamp >= cutoff)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }
}

/// Stamps, stores and trims in one step so concurrent instances never
/// hand out equal or out-of-order scores for the same user.
///
/// KEYS: events zset, last-timestamp counter.
/// ARGV: proposed ts, member, retention cutoff, max entries, ttl secs.
const APPEND_SCRIPT: &str = r"
local last = tonumber(redis.call('GET', KEYS[2]) or '0')
local ts = math.max(tonumber(ARGV[1]), last + 1)
local score = string.format('%d', ts)
redis.call('SET', KEYS[2], score, 'EX', ARGV[5])
redis.call('ZADD', KEYS[1], score, ARGV[2])
redis.call('ZREMRANGEBYSCORE', KEYS[1], '-inf', '(' .. ARGV[3])
redis.call('ZREMRANGEBYRANK', KEYS[1], 0, -(tonumber(ARGV[4]) + 1))
redis.call('EXPIRE', KEYS[1], ARGV[5])
return score
";

/// Stored zset member. The nonce keeps identical frames distinct; the
/// frame's timestamp is the member's score.
#[derive(Serialize, Deserialize)]
struct LogEntry {
    nonce: String,
    frame: PushFrame,
}

/// Redis sorted set per user, scored by frame timestamp.
///
/// Timestamps are assigned inside Redis from a per-user counter, so every
/// instance sharing the log agrees on the order and on `since` cursors.
pub struct RedisEventLog {
    connection: ConnectionManager,
    append_script: Script,
    prefix: String,
    retention: Duration,
    max_per_user: usize,
}

impl RedisEventLog {
    pub async fn new(
        connection_string: &str,
        prefix: Option<&str>,
        retention: Duration,
        max_per_user: usize,
    ) -> Result<Self, StorageError> {
        let client = Client::open(connection_string).map_err(|e| StorageError::Backend(e.to_string()))?;

        let connection = retry("redis_connect", &RetryConfig::startup(), || async {
            ConnectionManager::new(client.clone()).await
        })
        .await
        .map_err(|e: redis::RedisError| StorageError::Backend(e.to_string()))?;

        Ok(Self::from_connection(connection, prefix, retention, max_per_user))
    }

    pub fn from_connection(
        connection: ConnectionManager,
        prefix: Option<&str>,
        retention: Duration,
        max_per_user: usize,
    ) -> Self {
        Self {
            connection,
            append_script: Script::new(APPEND_SCRIPT),
            prefix: prefix.unwrap_or("").to_string(),
            retention,
            max_per_user: max_per_user.max(1),
        }
    }

    #[inline]
    fn key(&self, user_id: &str) -> String {
        format!("{}events:{}", self.prefix, user_id)
    }

    #[inline]
    fn last_key(&self, user_id: &str) -> String {
        format!("{}events_last:{}", self.prefix, user_id)
    }
}

#[async_trait]
impl EventLog for RedisEventLog {
    async fn append(&self, user_id: &str, mut frame: PushFrame) -> Result<PushFrame, StorageError> {
        let key = self.key(user_id);
        let entry = LogEntry { nonce: uuid::Uuid::new_v4().to_string(), frame: frame.clone() };
        let member = serde_json::to_string(&entry).map_err(|e| StorageError::Serialization {
            id: key.clone(),
            reason: e.to_string(),
        })?;
        let cutoff = now_millis() - self.retention.as_millis() as i64;
        let ttl = self.retention.as_secs().max(1) as i64;

        let mut conn = self.connection.clone();
        let stamped: i64 = self
            .append_script
            .key(&key)
            .key(self.last_key(user_id))
            .arg(frame.timestamp)
            .arg(member)
            .arg(cutoff)
            .arg(self.max_per_user as i64)
            .arg(ttl)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| {
                metrics::record_event_log_error("redis");
                StorageError::Backend(e.to_string())
            })?;

        frame.timestamp = stamped;
        Ok(frame)
    }

    async fn since(&self, user_id: &str, since: i64) -> Result<Vec<PushFrame>, StorageError> {
        let key = self.key(user_id);
        let cutoff = now_millis() - self.retention.as_millis() as i64;
        let lower = since.max(cutoff - 1);

        let members: Vec<(String, i64)> = retry("redis_event_log_since", &RetryConfig::query(), || {
            let mut conn = self.connection.clone();
            let key = key.clone();
            async move { conn.zrangebyscore_withscores(&key, format!("({}", lower), "+inf").await }
        })
        .await
        .map_err(|e: redis::RedisError| {
            metrics::record_event_log_error("redis");
            StorageError::Backend(e.to_string())
        })?;

        let mut frames = Vec::with_capacity(members.len());
        for (raw, score) in members {
            match serde_json::from_str::<LogEntry>(&raw) {
                Ok(LogEntry { mut frame, .. }) => {
                    frame.timestamp = score;
                    frames.push(frame);
                }
                Err(e) => warn!(key = %key, error = %e, "Skipping corrupt event log entry"),
            }
        }
        Ok(frames)
    }
}
