// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Cross-Tab Coordinator.
//!
//! Fans cache and mutation events out to the other tabs of the same origin
//! and elects one "active drainer" through an advisory lease.
//!
//! Delivery is best-effort. With a [`NoopBroadcaster`] the coordinator
//! still works: broadcasts vanish, subscribers never fire, and this tab
//! always wins the drainer lease (nobody else can hold it).
//!
//! # Lifecycle
//!
//! ```text
//! new() ──► start() spawns the listener ──► shutdown() stops it and
//!                                            releases the lease
//! ```

pub mod channel;
pub mod lease;

use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::metrics;
use crate::model::{now_millis, EntityType};
use crate::pubsub::{SubscribeError, Subscription, TopicRegistry, WILDCARD_TOPIC};
use crate::storage::{DurableStore, StorageError};

pub use channel::{Broadcaster, CrossTabEvent, CrossTabMessage, NoopBroadcaster, OriginChannel};
pub use lease::{DrainerLease, LeaseRecord, LEASE_KEY};

pub struct CrossTabCoordinator {
    tab_id: String,
    broadcaster: Arc<dyn Broadcaster>,
    registry: TopicRegistry<CrossTabMessage>,
    lease: DrainerLease,
    is_drainer: AtomicBool,
    listener: Mutex<Option<JoinHandle<()>>>,
}

impl CrossTabCoordinator {
    /// Create a coordinator with a fresh random tab id.
    pub fn new(
        broadcaster: Arc<dyn Broadcaster>,
        store: Arc<dyn DurableStore>,
        lease_ttl: Duration,
        max_handlers_per_topic: usize,
    ) -> Self {
        let tab_id = format!("tab-{}", uuid::Uuid::new_v4());
        if !broadcaster.is_supported() {
            warn!(tab_id = %tab_id, "Cross-tab channel unavailable, running single-tab");
        }
        Self {
            lease: DrainerLease::new(store, tab_id.clone(), lease_ttl),
            tab_id,
            broadcaster,
            registry: TopicRegistry::new(max_handlers_per_topic),
            is_drainer: AtomicBool::new(false),
            listener: Mutex::new(None),
        }
    }

    /// Stable for the lifetime of this instance.
    pub fn tab_id(&self) -> &str {
        &self.tab_id
    }

    pub fn is_channel_supported(&self) -> bool {
        self.broadcaster.is_supported()
    }

    /// Spawn the listener that dispatches other tabs' messages to local
    /// subscribers. Calling it twice is a no-op.
    pub fn start(self: &Arc<Self>) {
        let mut slot = self.listener.lock();
        if slot.is_some() {
            return;
        }
        let Some(mut rx) = self.broadcaster.listen() else {
            debug!("No cross-tab listener: broadcaster unsupported");
            return;
        };

        let this = Arc::downgrade(self);
        *slot = Some(tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(message) => {
                        let Some(coordinator) = this.upgrade() else { break };
                        coordinator.dispatch(&message);
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Cross-tab listener lagged; some messages were dropped");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
            debug!("Cross-tab listener stopped");
        }));
        info!(tab_id = %self.tab_id, "Cross-tab coordinator started");
    }

    /// Stop listening and give up the drainer lease.
    pub async fn shutdown(&self) -> Result<(), StorageError> {
        if let Some(handle) = self.listener.lock().take() {
            handle.abort();
        }
        if self.is_drainer.swap(false, Ordering::AcqRel) {
            metrics::set_active_drainer(false);
            self.lease.release().await?;
        }
        info!(tab_id = %self.tab_id, "Cross-tab coordinator stopped");
        Ok(())
    }

    /// Send to every other tab. Never fails: an unavailable channel
    /// degrades to a no-op.
    pub fn broadcast(&self, event: CrossTabEvent, entity: Option<EntityType>, entity_id: Option<&str>, data: Value) {
        let message = CrossTabMessage {
            event,
            entity,
            entity_id: entity_id.map(str::to_string),
            data,
            sender: self.tab_id.clone(),
            timestamp: now_millis(),
        };
        match self.broadcaster.post(&message) {
            Ok(()) => metrics::record_crosstab_message("out", event.as_str()),
            Err(e) => debug!(event = %event, error = %e, "Cross-tab broadcast dropped"),
        }
    }

    /// Every message from other tabs.
    pub fn subscribe<F>(&self, callback: F) -> Result<Subscription, SubscribeError>
    where
        F: Fn(&CrossTabMessage) + Send + Sync + 'static,
    {
        self.registry.subscribe(WILDCARD_TOPIC, callback)
    }

    /// Messages from other tabs whose type is in `events`.
    pub fn subscribe_to_events<F>(&self, events: &[CrossTabEvent], callback: F) -> Result<Subscription, SubscribeError>
    where
        F: Fn(&CrossTabMessage) + Send + Sync + 'static,
    {
        if let [single] = events {
            return self.registry.subscribe(single.as_str(), callback);
        }
        let wanted: HashSet<CrossTabEvent> = events.iter().copied().collect();
        self.registry.subscribe(WILDCARD_TOPIC, move |m: &CrossTabMessage| {
            if wanted.contains(&m.event) {
                callback(m);
            }
        })
    }

    /// Take or renew the drainer lease.
    pub async fn try_become_drainer(&self) -> Result<bool, StorageError> {
        let held = self.lease.try_acquire().await?;
        let was = self.is_drainer.swap(held, Ordering::AcqRel);
        if was != held {
            info!(tab_id = %self.tab_id, active = held, "Drainer role changed");
            metrics::set_active_drainer(held);
        }
        Ok(held)
    }

    /// Last known drainer status (as of the most recent acquire attempt).
    pub fn is_active_drainer(&self) -> bool {
        self.is_drainer.load(Ordering::Acquire)
    }

    pub async fn drainer(&self) -> Result<Option<LeaseRecord>, StorageError> {
        self.lease.holder().await
    }

    /// Deliver `message` to local subscribers unless it is our own echo.
    fn dispatch(&self, message: &CrossTabMessage) {
        if message.sender == self.tab_id {
            return;
        }
        metrics::record_crosstab_message("in", message.event.as_str());
        self.registry.publish_all(&[message.event.as_str(), WILDCARD_TOPIC], message);
    }
}

impl Drop for CrossTabCoordinator {
    fn drop(&mut self) {
        if let Some(handle) = self.listener.lock().take() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory::InMemoryStore;
    use serde_json::json;
    use tokio::time::{sleep, timeout};

    fn tab(channel: Arc<dyn Broadcaster>, store: Arc<dyn DurableStore>) -> Arc<CrossTabCoordinator> {
        let c = Arc::new(CrossTabCoordinator::new(channel, store, Duration::from_secs(10), 16));
        c.start();
        c
    }

    #[tokio::test]
    async fn test_tab_ids_are_distinct_and_stable() {
        let store: Arc<dyn DurableStore> = Arc::new(InMemoryStore::new());
        let a = CrossTabCoordinator::new(Arc::new(NoopBroadcaster), store.clone(), Duration::from_secs(1), 4);
        let b = CrossTabCoordinator::new(Arc::new(NoopBroadcaster), store, Duration::from_secs(1), 4);
        assert_ne!(a.tab_id(), b.tab_id());
        assert_eq!(a.tab_id(), a.tab_id());
    }

    #[tokio::test]
    async fn test_broadcast_reaches_other_tab_not_sender() {
        let origin = OriginChannel::new("tasks", 32);
        let store: Arc<dyn DurableStore> = Arc::new(InMemoryStore::new());
        let a = tab(Arc::new(origin.clone()), store.clone());
        let b = tab(Arc::new(origin.clone()), store);

        let (tx_a, mut rx_a) = tokio::sync::mpsc::unbounded_channel();
        let (tx_b, mut rx_b) = tokio::sync::mpsc::unbounded_channel();
        let _sa = a.subscribe(move |m| { let _ = tx_a.send(m.clone()); }).unwrap();
        let _sb = b.subscribe(move |m| { let _ = tx_b.send(m.clone()); }).unwrap();

        a.broadcast(CrossTabEvent::CacheUpdated, Some(EntityType::Task), Some("t1"), json!({"title": "x"}));

        let got = timeout(Duration::from_secs(1), rx_b.recv()).await.unwrap().unwrap();
        assert_eq!(got.sender, a.tab_id());
        assert_eq!(got.entity_id.as_deref(), Some("t1"));
        assert_eq!(got.data, json!({"title": "x"}));

        sleep(Duration::from_millis(50)).await;
        assert!(rx_a.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_subscribe_to_events_filters() {
        let origin = OriginChannel::new("tasks", 32);
        let store: Arc<dyn DurableStore> = Arc::new(InMemoryStore::new());
        let a = tab(Arc::new(origin.clone()), store.clone());
        let b = tab(Arc::new(origin.clone()), store);

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let _s = b
            .subscribe_to_events(&[CrossTabEvent::SyncStarted, CrossTabEvent::SyncCompleted], move |m| {
                let _ = tx.send(m.event);
            })
            .unwrap();

        a.broadcast(CrossTabEvent::CacheUpdated, None, None, Value::Null);
        a.broadcast(CrossTabEvent::SyncStarted, None, None, Value::Null);
        a.broadcast(CrossTabEvent::SyncCompleted, None, None, json!({"success_count": 1, "failed_count": 0}));

        let first = timeout(Duration::from_secs(1), rx.recv()).await.unwrap().unwrap();
        let second = timeout(Duration::from_secs(1), rx.recv()).await.unwrap().unwrap();
        assert_eq!((first, second), (CrossTabEvent::SyncStarted, CrossTabEvent::SyncCompleted));
    }

    #[tokio::test]
    async fn test_noop_broadcaster_degrades_silently() {
        let store: Arc<dyn DurableStore> = Arc::new(InMemoryStore::new());
        let a = tab(Arc::new(NoopBroadcaster), store);
        assert!(!a.is_channel_supported());
        a.broadcast(CrossTabEvent::MutationQueued, None, None, Value::Null);
        assert!(a.try_become_drainer().await.unwrap());
    }

    #[tokio::test]
    async fn test_only_one_drainer() {
        let origin = OriginChannel::new("tasks", 32);
        let store: Arc<dyn DurableStore> = Arc::new(InMemoryStore::new());
        let a = tab(Arc::new(origin.clone()), store.clone());
        let b = tab(Arc::new(origin), store);

        assert!(a.try_become_drainer().await.unwrap());
        assert!(!b.try_become_drainer().await.unwrap());
        assert!(a.is_active_drainer());

        a.shutdown().await.unwrap();
        assert!(!a.is_active_drainer());
        assert!(b.try_become_drainer().await.unwrap());
    }
}
