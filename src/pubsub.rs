// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Topic-keyed publish/subscribe registry.
//!
//! Delivery is synchronous: [`TopicRegistry::publish`] invokes every handler
//! registered under the topic before returning. Each topic holds a bounded
//! number of handlers. Subscribing returns a [`Subscription`] handle; dropping
//! it (or calling [`Subscription::unsubscribe`]) removes the handler.
//!
//! ```
//! use task_sync_engine::pubsub::TopicRegistry;
//! use std::sync::Arc;
//! use std::sync::atomic::{AtomicUsize, Ordering};
//!
//! let registry: TopicRegistry<u32> = TopicRegistry::new(8);
//! let seen = Arc::new(AtomicUsize::new(0));
//! let seen_clone = seen.clone();
//! let sub = registry.subscribe("task:1", move |v| {
//!     seen_clone.fetch_add(*v as usize, Ordering::SeqCst);
//! }).unwrap();
//!
//! assert_eq!(registry.publish("task:1", &5), 1);
//! sub.unsubscribe();
//! assert_eq!(registry.publish("task:1", &5), 0);
//! assert_eq!(seen.load(Ordering::SeqCst), 5);
//! ```

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use thiserror::Error;

/// Topic that receives every published message.
pub const WILDCARD_TOPIC: &str = "*";

pub type Handler<T> = Arc<dyn Fn(&T) + Send + Sync>;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum SubscribeError {
    #[error("Topic '{topic}' already has {limit} handlers")]
    TooManyHandlers { topic: String, limit: usize },
}

struct RegistryInner<T> {
    topics: RwLock<HashMap<String, Vec<(u64, Handler<T>)>>>,
    next_id: AtomicU64,
    max_handlers_per_topic: usize,
}

impl<T> RegistryInner<T> {
    fn remove(&self, topic: &str, id: u64) {
        let mut topics = self.topics.write();
        if let Some(handlers) = topics.get_mut(topic) {
            handlers.retain(|(hid, _)| *hid != id);
            if handlers.is_empty() {
                topics.remove(topic);
            }
        }
    }
}

pub struct TopicRegistry<T> {
    inner: Arc<RegistryInner<T>>,
}

impl<T> Clone for TopicRegistry<T> {
    fn clone(&self) -> Self {
        Self { inner: self.inner.clone() }
    }
}

impl<T: 'static> TopicRegistry<T> {
    #[must_use]
    pub fn new(max_handlers_per_topic: usize) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                topics: RwLock::new(HashMap::new()),
                next_id: AtomicU64::new(1),
                max_handlers_per_topic: max_handlers_per_topic.max(1),
            }),
        }
    }

    pub fn subscribe<F>(&self, topic: impl Into<String>, handler: F) -> Result<Subscription, SubscribeError>
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        let topic = topic.into();
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        {
            let mut topics = self.inner.topics.write();
            let handlers = topics.entry(topic.clone()).or_default();
            if handlers.len() >= self.inner.max_handlers_per_topic {
                return Err(SubscribeError::TooManyHandlers {
                    topic,
                    limit: self.inner.max_handlers_per_topic,
                });
            }
            handlers.push((id, Arc::new(handler)));
        }

        let weak: Weak<RegistryInner<T>> = Arc::downgrade(&self.inner);
        Ok(Subscription {
            topic: topic.clone(),
            cancel: Some(Box::new(move || {
                if let Some(inner) = weak.upgrade() {
                    inner.remove(&topic, id);
                }
            })),
        })
    }

    /// Invoke every handler under `topic`; returns how many ran.
    ///
    /// Handlers are snapshotted first, so a handler may subscribe or
    /// unsubscribe without deadlocking.
    pub fn publish(&self, topic: &str, message: &T) -> usize {
        let handlers: Vec<Handler<T>> = match self.inner.topics.read().get(topic) {
            Some(list) => list.iter().map(|(_, h)| h.clone()).collect(),
            None => return 0,
        };
        for handler in &handlers {
            handler(message);
        }
        handlers.len()
    }

    /// Publish to several topics (e.g. exact key, collection key, wildcard).
    pub fn publish_all(&self, topics: &[&str], message: &T) -> usize {
        topics.iter().map(|t| self.publish(t, message)).sum()
    }

    #[must_use]
    pub fn handler_count(&self, topic: &str) -> usize {
        self.inner.topics.read().get(topic).map_or(0, Vec::len)
    }

    #[must_use]
    pub fn topic_count(&self) -> usize {
        self.inner.topics.read().len()
    }
}

/// Handle for a registered handler. Dropping it unsubscribes.
#[must_use = "dropping a Subscription unsubscribes immediately"]
pub struct Subscription {
    topic: String,
    cancel: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn unsubscribe(mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }

    /// Keep the handler registered for the registry's lifetime.
    pub fn detach(mut self) {
        self.cancel = None;
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("topic", &self.topic)
            .field("active", &self.cancel.is_some())
            .finish()
    }
}
