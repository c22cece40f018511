// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Server side of the push channel.
//!
//! Each user may hold several connections (one per device). A connection
//! receives, in order:
//!
//! ```text
//! connected ──► replay (since=T) ──► live frames + ping every heartbeat
//!                                        │
//!                                        └─► reconnect{reason} at the horizon, then close
//! ```
//!
//! Every published frame is appended to the [`EventLog`] before fan-out, so
//! a client that reconnects with the last timestamp it saw gets exactly the
//! frames it missed. The log assigns the timestamp; stamping and fan-out
//! happen under one per-user lock, so a connection sees a user's frames in
//! timestamp order.

use dashmap::DashMap;
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, sleep, Instant, MissedTickBehavior};
use tracing::{debug, info, instrument, warn};

use super::event_log::EventLog;
use super::{PushEventType, PushFrame};
use crate::config::SyncConfig;
use crate::metrics;
use crate::model::{now_millis, ChangeKind, EntityType};

#[derive(Debug, Clone)]
pub struct PushHubConfig {
    pub heartbeat_interval: Duration,
    /// Connections are rotated after this long.
    pub connection_horizon: Duration,
    /// Buffered frames per connection before it is considered stuck.
    pub channel_capacity: usize,
}

impl Default for PushHubConfig {
    fn default() -> Self {
        Self::from_config(&SyncConfig::default())
    }
}

impl PushHubConfig {
    pub fn from_config(config: &SyncConfig) -> Self {
        Self {
            heartbeat_interval: config.heartbeat_interval(),
            connection_horizon: config.connection_horizon(),
            channel_capacity: config.push_channel_capacity.max(1),
        }
    }
}

/// Snapshot for health endpoints.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct HubStatus {
    pub active_connections: usize,
    pub total_connections: u64,
    pub connected_users: usize,
    pub frames_published: u64,
}

type LiveSenders = HashMap<u64, mpsc::Sender<PushFrame>>;

pub struct PushHub {
    config: PushHubConfig,
    log: Arc<dyn EventLog>,
    connections: DashMap<String, LiveSenders>,
    publish_order: DashMap<String, Arc<Mutex<()>>>,
    next_connection_id: AtomicU64,
    total_connections: AtomicU64,
    frames_published: AtomicU64,
    last_timestamp: AtomicI64,
}

impl PushHub {
    pub fn new(config: PushHubConfig, log: Arc<dyn EventLog>) -> Self {
        Self {
            config,
            log,
            connections: DashMap::new(),
            publish_order: DashMap::new(),
            next_connection_id: AtomicU64::new(1),
            total_connections: AtomicU64::new(0),
            frames_published: AtomicU64::new(0),
            last_timestamp: AtomicI64::new(0),
        }
    }

    pub fn config(&self) -> &PushHubConfig {
        &self.config
    }

    /// Open a connection for `user_id`, replaying frames after `since`.
    ///
    /// The live sender is registered before the replay is read, so nothing
    /// published in between is lost; a live frame that was already replayed
    /// is skipped.
    #[instrument(skip(self), fields(connection_id))]
    pub fn connect(self: &Arc<Self>, user_id: &str, since: Option<i64>) -> PushConnection {
        let id = self.next_connection_id.fetch_add(1, Ordering::Relaxed);
        tracing::Span::current().record("connection_id", id);
        let capacity = self.config.channel_capacity;

        let (live_tx, live_rx) = mpsc::channel(capacity);
        let (out_tx, out_rx) = mpsc::channel(capacity);
        self.connections.entry(user_id.to_string()).or_default().insert(id, live_tx);
        self.total_connections.fetch_add(1, Ordering::Relaxed);
        self.refresh_gauge();
        metrics::record_push_connect(if since.is_some() { "resume" } else { "fresh" });

        let task = tokio::spawn(run_connection(
            Arc::downgrade(self),
            self.log.clone(),
            self.config.clone(),
            user_id.to_string(),
            id,
            since,
            live_rx,
            out_tx,
        ));

        info!(user_id, connection_id = id, since, "Push connection opened");
        PushConnection {
            id,
            user_id: user_id.to_string(),
            frames: out_rx,
            hub: Arc::downgrade(self),
            task: Some(task),
        }
    }

    /// Record a frame in the event log and fan it out to the user's live
    /// connections. A connection whose buffer is full is dropped; its client
    /// reconnects and catches up from the log.
    pub async fn publish(&self, user_id: &str, event_type: PushEventType, data: Value) -> PushFrame {
        let order = self.publish_order.entry(user_id.to_string()).or_default().clone();
        let _ordered = order.lock().await;

        let proposed = PushFrame::new(event_type, self.next_timestamp(), data);
        let frame = match self.log.append(user_id, proposed.clone()).await {
            Ok(stamped) => {
                self.last_timestamp.fetch_max(stamped.timestamp, Ordering::AcqRel);
                stamped
            }
            Err(e) => {
                warn!(user_id, event = %event_type, error = %e, "Event log append failed; frame will not replay");
                proposed
            }
        };

        let mut stuck = Vec::new();
        if let Some(mut senders) = self.connections.get_mut(user_id) {
            senders.retain(|id, tx| match tx.try_send(frame.clone()) {
                Ok(()) => true,
                Err(TrySendError::Full(_)) => {
                    stuck.push(*id);
                    false
                }
                Err(TrySendError::Closed(_)) => false,
            });
        }
        self.connections.remove_if(user_id, |_, senders| senders.is_empty());
        for id in stuck {
            warn!(user_id, connection_id = id, "Push connection fell behind, dropping it");
        }

        self.frames_published.fetch_add(1, Ordering::Relaxed);
        metrics::record_push_frame(event_type.as_str());
        self.refresh_gauge();
        frame
    }

    /// Publish an entity change in the shape clients expect.
    pub async fn publish_change(
        &self,
        user_id: &str,
        entity: EntityType,
        kind: ChangeKind,
        id: &str,
        payload: Value,
    ) -> Option<PushFrame> {
        let event_type = PushEventType::for_change(entity, kind)?;
        let data = match kind {
            ChangeKind::Deleted => json!({ "id": id }),
            ChangeKind::Invalidated => json!({ "list_id": id }),
            ChangeKind::Created | ChangeKind::Updated => {
                let mut data = match payload {
                    Value::Object(map) => Value::Object(map),
                    other => json!({ "value": other }),
                };
                if let Some(map) = data.as_object_mut() {
                    map.entry("id").or_insert_with(|| Value::String(id.to_string()));
                }
                data
            }
        };
        Some(self.publish(user_id, event_type, data).await)
    }

    pub fn status(&self) -> HubStatus {
        HubStatus {
            active_connections: self.active_connections(),
            total_connections: self.total_connections.load(Ordering::Relaxed),
            connected_users: self.connections.len(),
            frames_published: self.frames_published.load(Ordering::Relaxed),
        }
    }

    pub fn active_connections(&self) -> usize {
        self.connections.iter().map(|e| e.value().len()).sum()
    }

    /// Drop every live sender. Connection tasks notice and close.
    pub fn close_all(&self) {
        let n = self.active_connections();
        self.connections.clear();
        self.refresh_gauge();
        info!(closed = n, "Push hub closed all connections");
    }

    fn unregister(&self, user_id: &str, id: u64) {
        if let Some(mut senders) = self.connections.get_mut(user_id) {
            senders.remove(&id);
        }
        self.connections.remove_if(user_id, |_, senders| senders.is_empty());
        self.refresh_gauge();
    }

    /// Wall-clock millis, bumped so every frame gets a distinct, increasing
    /// timestamp (replay uses it as the cursor).
    fn next_timestamp(&self) -> i64 {
        let now = now_millis();
        let mut prev = self.last_timestamp.load(Ordering::Acquire);
        loop {
            let next = now.max(prev + 1);
            match self.last_timestamp.compare_exchange_weak(prev, next, Ordering::AcqRel, Ordering::Acquire) {
                Ok(_) => return next,
                Err(actual) => prev = actual,
            }
        }
    }

    fn refresh_gauge(&self) {
        metrics::set_push_connections(self.active_connections());
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_connection(
    hub: Weak<PushHub>,
    log: Arc<dyn EventLog>,
    config: PushHubConfig,
    user_id: String,
    id: u64,
    since: Option<i64>,
    mut live: mpsc::Receiver<PushFrame>,
    out: mpsc::Sender<PushFrame>,
) {
    let connected = PushFrame::new(
        PushEventType::Connected,
        now_millis(),
        json!({ "connection_id": id, "heartbeat_ms": config.heartbeat_interval.as_millis() as u64 }),
    );
    if out.send(connected).await.is_err() {
        return finish(&hub, &user_id, id, "client_gone");
    }

    // Frames sent from the replay, by timestamp. The same frame may also be
    // waiting in `live`; anything else there is new.
    let mut replayed: HashMap<i64, PushFrame> = HashMap::new();
    let mut replayed_up_to = i64::MIN;
    if let Some(since) = since {
        match log.since(&user_id, since).await {
            Ok(frames) => {
                metrics::record_push_replay(frames.len());
                debug!(user_id = %user_id, connection_id = id, count = frames.len(), "Replaying missed frames");
                for frame in frames {
                    replayed_up_to = replayed_up_to.max(frame.timestamp);
                    replayed.insert(frame.timestamp, frame.clone());
                    if out.send(frame).await.is_err() {
                        return finish(&hub, &user_id, id, "client_gone");
                    }
                }
            }
            Err(e) => {
                metrics::record_event_log_error("replay");
                warn!(user_id = %user_id, error = %e, "Replay unavailable, continuing with live frames");
            }
        }
    }

    let start = Instant::now();
    let mut heartbeat = interval_at(start + config.heartbeat_interval, config.heartbeat_interval);
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let horizon = sleep(config.connection_horizon);
    tokio::pin!(horizon);

    let reason = loop {
        tokio::select! {
            frame = live.recv() => match frame {
                Some(frame) => {
                    if replayed.get(&frame.timestamp) == Some(&frame) {
                        replayed.remove(&frame.timestamp);
                        continue;
                    }
                    if frame.timestamp > replayed_up_to {
                        replayed.clear();
                    }
                    if out.send(frame).await.is_err() {
                        break "client_gone";
                    }
                }
                None => {
                    // Hub dropped our sender (slow consumer or close_all).
                    let _ = out.try_send(reconnect_frame("server_closed"));
                    break "server_closed";
                }
            },
            _ = heartbeat.tick() => {
                let ping = PushFrame::new(PushEventType::Ping, now_millis(), Value::Null);
                if out.send(ping).await.is_err() {
                    break "client_gone";
                }
            }
            _ = &mut horizon => {
                let _ = out.send(reconnect_frame("horizon")).await;
                break "horizon";
            }
            _ = out.closed() => break "client_gone",
        }
    };

    finish(&hub, &user_id, id, reason);
}

fn reconnect_frame(reason: &str) -> PushFrame {
    PushFrame::new(PushEventType::Reconnect, now_millis(), json!({ "reason": reason }))
}

fn finish(hub: &Weak<PushHub>, user_id: &str, id: u64, reason: &str) {
    if let Some(hub) = hub.upgrade() {
        hub.unregister(user_id, id);
    }
    info!(user_id, connection_id = id, reason, "Push connection closed");
}

/// One open connection, as seen by whatever writes frames to the socket.
pub struct PushConnection {
    id: u64,
    user_id: String,
    frames: mpsc::Receiver<PushFrame>,
    hub: Weak<PushHub>,
    task: Option<JoinHandle<()>>,
}

impl PushConnection {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    /// Next frame to write, or `None` once the server has closed it.
    pub async fn next_frame(&mut self) -> Option<PushFrame> {
        self.frames.recv().await
    }
}

impl Drop for PushConnection {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
        if let Some(hub) = self.hub.upgrade() {
            hub.unregister(&self.user_id, self.id);
        }
    }
}
