// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Client side of the push channel.
//!
//! One [`PushClient`] per tab holds a single connection and fans frames out
//! to any number of filtered subscribers. Entity frames are applied to the
//! cache before subscribers see them.
//!
//! # Reconnection
//!
//! ```text
//! connect(since = last data frame) ──► frames ──► stream ends / error / silence
//!        ▲                                               │
//!        └──────── backoff (reset on success) ◄──────────┘
//! ```
//!
//! A `reconnect` frame is a clean rotation: the client reconnects at once
//! without backoff. After any reconnect the memory tier is invalidated so
//! reads go back to the durable tier while the replay catches up.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

use super::server::{PushConnection, PushHub};
use super::{EventFilter, PushEventType, PushFrame};
use crate::cache::CacheManager;
use crate::error::SyncError;
use crate::metrics;
use crate::model::{now_millis, ChangeKind, SyncEvent};
use crate::queue::MutationQueue;
use crate::pubsub::{SubscribeError, Subscription, TopicRegistry, WILDCARD_TOPIC};
use crate::resilience::retry::RetryConfig;

/// An open push connection, read one frame at a time.
#[async_trait]
pub trait FrameStream: Send {
    /// `Ok(None)` once the server closed the stream.
    async fn next_frame(&mut self) -> Result<Option<PushFrame>, SyncError>;
}

/// Opens push connections. `since` is the timestamp of the last data frame
/// this client saw.
#[async_trait]
pub trait PushTransport: Send + Sync {
    async fn connect(&self, since: Option<i64>) -> Result<Box<dyn FrameStream>, SyncError>;
}

/// In-process transport straight to a [`PushHub`].
pub struct HubTransport {
    hub: Arc<PushHub>,
    user_id: String,
}

impl HubTransport {
    pub fn new(hub: Arc<PushHub>, user_id: impl Into<String>) -> Self {
        Self { hub, user_id: user_id.into() }
    }
}

struct HubStream(PushConnection);

#[async_trait]
impl FrameStream for HubStream {
    async fn next_frame(&mut self) -> Result<Option<PushFrame>, SyncError> {
        Ok(self.0.next_frame().await)
    }
}

#[async_trait]
impl PushTransport for HubTransport {
    async fn connect(&self, since: Option<i64>) -> Result<Box<dyn FrameStream>, SyncError> {
        Ok(Box::new(HubStream(self.hub.connect(&self.user_id, since))))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ConnectionState {
    pub is_connected: bool,
    /// Consecutive failed attempts since the last successful connect.
    pub reconnect_attempts: u32,
    /// Successful connects, reconnects included.
    pub total_connections: u64,
    pub last_event_at: Option<i64>,
    pub last_error: Option<String>,
}

enum StreamEnd {
    Shutdown,
    /// Server asked us to reconnect.
    Rotate,
    Lost(String),
}

pub struct PushClient {
    transport: Arc<dyn PushTransport>,
    cache: Arc<CacheManager>,
    /// Outbox consulted before an upsert overwrites a local write.
    outbox: Option<Arc<MutationQueue>>,
    registry: TopicRegistry<PushFrame>,
    state: watch::Sender<ConnectionState>,
    shutdown: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
    heartbeat_timeout: Duration,
    backoff: RetryConfig,
    last_timestamp: AtomicI64,
}

impl PushClient {
    pub fn new(
        transport: Arc<dyn PushTransport>,
        cache: Arc<CacheManager>,
        heartbeat_timeout: Duration,
        backoff: RetryConfig,
        max_handlers_per_topic: usize,
    ) -> Self {
        Self {
            transport,
            cache,
            outbox: None,
            registry: TopicRegistry::new(max_handlers_per_topic),
            state: watch::Sender::new(ConnectionState::default()),
            shutdown: watch::Sender::new(false),
            task: Mutex::new(None),
            heartbeat_timeout,
            backoff,
            last_timestamp: AtomicI64::new(0),
        }
    }

    /// Hold back pushed creates and updates for entities that still have a
    /// queued local write, the same way a pull does. The server's copy
    /// comes back through the next pull once the write settles.
    pub fn with_pending_guard(mut self, outbox: Arc<MutationQueue>) -> Self {
        self.outbox = Some(outbox);
        self
    }

    /// Register a callback for frames matching `filter`. Control frames
    /// (`connected`, `ping`, `reconnect`) only reach wildcard subscribers
    /// or those that name them.
    pub fn subscribe<F>(&self, filter: EventFilter, callback: F) -> Result<Subscription, SubscribeError>
    where
        F: Fn(&PushFrame) + Send + Sync + 'static,
    {
        match filter {
            EventFilter::Wildcard => self.registry.subscribe(WILDCARD_TOPIC, callback),
            EventFilter::Types(wanted) => {
                if let (1, Some(only)) = (wanted.len(), wanted.iter().next()) {
                    return self.registry.subscribe(only.as_str(), callback);
                }
                self.registry.subscribe(WILDCARD_TOPIC, move |f: &PushFrame| {
                    if wanted.contains(&f.event_type) {
                        callback(f);
                    }
                })
            }
        }
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.state.borrow().clone()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Replay cursor: timestamp of the newest data frame seen.
    pub fn last_event_timestamp(&self) -> Option<i64> {
        match self.last_timestamp.load(Ordering::Acquire) {
            0 => None,
            ts => Some(ts),
        }
    }

    /// Spawn the connection loop. Calling it twice is a no-op.
    pub fn start(self: &Arc<Self>) {
        let mut slot = self.task.lock();
        if slot.is_some() {
            return;
        }
        let this = Arc::clone(self);
        *slot = Some(tokio::spawn(async move { this.run().await }));
    }

    /// Stop the loop and wait for it to exit.
    pub async fn shutdown(&self) {
        self.shutdown.send_replace(true);
        let handle = self.task.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        self.state.send_modify(|s| s.is_connected = false);
        info!("Push client stopped");
    }

    async fn run(&self) {
        let mut stop = self.shutdown.subscribe();
        let mut attempts: u32 = 0;
        let mut connected_before = false;

        loop {
            if *stop.borrow() {
                break;
            }

            let since = self.last_event_timestamp();
            let connected = tokio::select! {
                r = self.transport.connect(since) => r,
                _ = stop.changed() => break,
            };

            match connected {
                Ok(stream) => {
                    attempts = 0;
                    metrics::record_push_connect("client_connected");
                    if connected_before {
                        info!(since, "Push channel reconnected, invalidating memory tier");
                        self.cache.invalidate_all();
                    }
                    connected_before = true;
                    self.state.send_modify(|s| {
                        s.is_connected = true;
                        s.reconnect_attempts = 0;
                        s.total_connections += 1;
                        s.last_error = None;
                    });

                    let end = self.consume(stream, &mut stop).await;
                    self.state.send_modify(|s| s.is_connected = false);

                    match end {
                        StreamEnd::Shutdown => break,
                        StreamEnd::Rotate => {
                            debug!("Server rotated the push connection");
                            continue;
                        }
                        StreamEnd::Lost(reason) => {
                            warn!(reason = %reason, "Push connection lost");
                            attempts += 1;
                            self.state.send_modify(|s| {
                                s.reconnect_attempts = attempts;
                                s.last_error = Some(reason);
                            });
                        }
                    }
                }
                Err(e) => {
                    metrics::record_push_connect("client_failed");
                    attempts += 1;
                    warn!(attempt = attempts, error = %e, "Push connect failed");
                    self.state.send_modify(|s| {
                        s.reconnect_attempts = attempts;
                        s.last_error = Some(e.to_string());
                    });
                }
            }

            let delay = self.backoff.delay_for_attempt(attempts);
            tokio::select! {
                _ = sleep(delay) => {}
                _ = stop.changed() => break,
            }
        }
        debug!("Push client loop exited");
    }

    async fn consume(&self, mut stream: Box<dyn FrameStream>, stop: &mut watch::Receiver<bool>) -> StreamEnd {
        loop {
            let next = tokio::select! {
                r = timeout(self.heartbeat_timeout, stream.next_frame()) => r,
                _ = stop.changed() => return StreamEnd::Shutdown,
            };
            let frame = match next {
                Err(_) => return StreamEnd::Lost("heartbeat timeout".into()),
                Ok(Err(e)) => return StreamEnd::Lost(e.to_string()),
                Ok(Ok(None)) => return StreamEnd::Lost("stream closed".into()),
                Ok(Ok(Some(frame))) => frame,
            };

            self.handle_frame(&frame).await;
            if frame.event_type == PushEventType::Reconnect {
                return StreamEnd::Rotate;
            }
        }
    }

    async fn handle_frame(&self, frame: &PushFrame) {
        self.state.send_modify(|s| s.last_event_at = Some(now_millis()));
        if !frame.event_type.is_control() {
            self.last_timestamp.fetch_max(frame.timestamp, Ordering::AcqRel);
        }

        if let Some(event) = frame.to_sync_event() {
            if self.shadowed_by_local_write(&event).await {
                debug!(event = %frame.event_type, id = %event.entity_id, "Keeping local write over pushed value");
                metrics::record_push_frame_held();
            } else if let Err(e) = self.cache.apply_event(&event).await {
                warn!(event = %frame.event_type, id = %event.entity_id, error = %e, "Failed to apply push event");
            }
        }
        self.registry.publish_all(&[frame.event_type.as_str(), WILDCARD_TOPIC], frame);
    }

    async fn shadowed_by_local_write(&self, event: &SyncEvent) -> bool {
        let Some(outbox) = &self.outbox else {
            return false;
        };
        if !matches!(event.kind, ChangeKind::Created | ChangeKind::Updated) {
            return false;
        }
        match outbox.has_pending(event.entity, &event.entity_id).await {
            Ok(pending) => pending,
            Err(e) => {
                warn!(id = %event.entity_id, error = %e, "Could not read outbox, applying push event");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::id_translator::IdTranslator;
    use crate::model::EntityType;
    use crate::storage::memory::InMemoryStore;
    use serde_json::json;
    use std::collections::VecDeque;
    use std::sync::atomic::AtomicUsize;

    fn fast_backoff() -> RetryConfig {
        RetryConfig {
            initial_delay: Duration::from_millis(5),
            max_delay: Duration::from_millis(20),
            factor: 2.0,
            max_retries: None,
        }
    }

    fn cache() -> Arc<CacheManager> {
        let store = Arc::new(InMemoryStore::new());
        let translator = Arc::new(IdTranslator::new(store.clone()));
        Arc::new(CacheManager::new(store, translator, 16, "temp-"))
    }

    /// Each connect pops one scripted stream; an exhausted stream closes.
    #[derive(Default)]
    struct ScriptedTransport {
        streams: Mutex<VecDeque<Vec<PushFrame>>>,
        sinces: Mutex<Vec<Option<i64>>>,
        hang: bool,
        connects: AtomicUsize,
    }

    struct ScriptedStream {
        frames: VecDeque<PushFrame>,
        hang: bool,
    }

    #[async_trait]
    impl FrameStream for ScriptedStream {
        async fn next_frame(&mut self) -> Result<Option<PushFrame>, SyncError> {
            match self.frames.pop_front() {
                Some(f) => Ok(Some(f)),
                None if self.hang => std::future::pending().await,
                None => Ok(None),
            }
        }
    }

    #[async_trait]
    impl PushTransport for ScriptedTransport {
        async fn connect(&self, since: Option<i64>) -> Result<Box<dyn FrameStream>, SyncError> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            self.sinces.lock().push(since);
            match self.streams.lock().pop_front() {
                Some(frames) => Ok(Box::new(ScriptedStream { frames: frames.into(), hang: self.hang })),
                None => Err(SyncError::Network("offline".into())),
            }
        }
    }

    async fn wait_for(mut cond: impl FnMut() -> bool) {
        timeout(Duration::from_secs(2), async {
            while !cond() {
                sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_frames_reach_cache_and_filtered_subscribers() {
        let hub = Arc::new(PushHub::new(
            Default::default(),
            Arc::new(crate::push::InMemoryEventLog::new(Duration::from_secs(600), 100)),
        ));
        let cache = cache();
        let client = Arc::new(PushClient::new(
            Arc::new(HubTransport::new(hub.clone(), "u1")),
            cache.clone(),
            Duration::from_secs(30),
            fast_backoff(),
            16,
        ));

        let tasks = Arc::new(Mutex::new(Vec::new()));
        let all = Arc::new(AtomicUsize::new(0));
        let _s1 = {
            let tasks = tasks.clone();
            client
                .subscribe(EventFilter::only([PushEventType::TaskCreated]), move |f| tasks.lock().push(f.data.clone()))
                .unwrap()
        };
        let _s2 = {
            let all = all.clone();
            client.subscribe(EventFilter::Wildcard, move |_| { all.fetch_add(1, Ordering::SeqCst); }).unwrap()
        };

        client.start();
        wait_for(|| client.connection_state().is_connected && hub.active_connections() == 1).await;

        hub.publish("u1", PushEventType::TaskCreated, json!({"id": "t1", "title": "x"})).await;
        hub.publish("u1", PushEventType::CommentCreated, json!({"id": "c1"})).await;
        // connected + two entity frames
        wait_for(|| all.load(Ordering::SeqCst) == 3).await;

        assert_eq!(tasks.lock().as_slice(), &[json!({"id": "t1", "title": "x"})]);
        assert!(cache.peek(EntityType::Comment, "c1").is_some());
        assert_eq!(cache.peek(EntityType::Task, "t1"), Some(json!({"id": "t1", "title": "x"})));

        client.shutdown().await;
        assert!(!client.connection_state().is_connected);
    }

    #[tokio::test]
    async fn test_reconnect_sends_last_data_timestamp() {
        let transport = Arc::new(ScriptedTransport::default());
        transport.streams.lock().extend([
            vec![
                PushFrame::new(PushEventType::Connected, 999, json!({})),
                PushFrame::new(PushEventType::TaskUpdated, 100, json!({"id": "t1"})),
                PushFrame::new(PushEventType::Ping, 5000, serde_json::Value::Null),
            ],
            vec![PushFrame::new(PushEventType::Connected, 1, json!({}))],
        ]);

        let client = Arc::new(PushClient::new(transport.clone(), cache(), Duration::from_secs(30), fast_backoff(), 16));
        client.start();
        wait_for(|| transport.connects.load(Ordering::SeqCst) >= 3).await;
        client.shutdown().await;

        let sinces = transport.sinces.lock().clone();
        assert_eq!(&sinces[..2], &[None, Some(100)]);
        assert_eq!(client.last_event_timestamp(), Some(100));
    }

    #[tokio::test]
    async fn test_reconnect_frame_rotates_without_backoff() {
        let transport = Arc::new(ScriptedTransport::default());
        transport.streams.lock().extend([
            vec![PushFrame::new(PushEventType::Reconnect, 1, json!({"reason": "horizon"}))],
            vec![],
        ]);
        let slow = RetryConfig { initial_delay: Duration::from_secs(60), ..fast_backoff() };
        let client = Arc::new(PushClient::new(transport.clone(), cache(), Duration::from_secs(30), slow, 16));
        client.start();
        wait_for(|| transport.connects.load(Ordering::SeqCst) >= 2).await;
        client.shutdown().await;
    }

    #[tokio::test]
    async fn test_silence_triggers_reconnect() {
        let transport = Arc::new(ScriptedTransport { hang: true, ..Default::default() });
        transport.streams.lock().extend([vec![], vec![]]);
        let client = Arc::new(PushClient::new(transport.clone(), cache(), Duration::from_millis(30), fast_backoff(), 16));
        client.start();
        wait_for(|| transport.connects.load(Ordering::SeqCst) >= 2).await;
        client.shutdown().await;
    }

    #[tokio::test]
    async fn test_failed_connects_count_attempts() {
        let transport = Arc::new(ScriptedTransport::default());
        let client = Arc::new(PushClient::new(transport.clone(), cache(), Duration::from_secs(30), fast_backoff(), 16));
        client.start();
        wait_for(|| client.connection_state().reconnect_attempts >= 3).await;
        let state = client.connection_state();
        assert!(!state.is_connected);
        assert_eq!(state.last_error.as_deref(), Some("Network error: offline"));
        client.shutdown().await;
    }
}
