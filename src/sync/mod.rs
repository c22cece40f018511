// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Data Sync Orchestrator.
//!
//! [`SyncOrchestrator::perform_incremental_sync`] is the one entry point for
//! app start, reconnect and manual refresh:
//!
//! ```text
//! drain outbox (optional) ──► pull(since = checkpoint) ──► apply via cache
//!                                                              │
//!                               advance checkpoint ◄── all applied
//! ```
//!
//! The checkpoint only moves after every event in the batch was applied, and
//! applying is idempotent, so re-running from an older checkpoint is safe.
//! Upserts held back for a pending local write are not applied, so the
//! checkpoint stops just before the earliest of them; they come back on the
//! next pull and apply once the local write has settled.

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

use crate::cache::CacheManager;
use crate::error::SyncError;
use crate::metrics::{self, SyncTimer};
use crate::model::{ChangeKind, SyncEvent};
use crate::pubsub::{SubscribeError, Subscription, TopicRegistry};
use crate::queue::{DrainGuard, DrainReport, MutationQueue};
use crate::storage::{DurableStore, StorageError};

/// Meta key holding the last applied pull checkpoint.
pub const CHECKPOINT_KEY: &str = "sync_checkpoint";

const SYNC_COMPLETE_TOPIC: &str = "sync_complete";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncOptions {
    /// Pull without draining the outbox first.
    pub skip_mutation_sync: bool,
}

/// Changes since a checkpoint, plus the checkpoint to store once applied.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PullBatch {
    #[serde(default)]
    pub events: Vec<SyncEvent>,
    pub checkpoint: i64,
}

#[async_trait]
pub trait PullSource: Send + Sync {
    /// Everything changed after `since`; `None` means a full pull.
    async fn pull(&self, since: Option<i64>) -> Result<PullBatch, SyncError>;
}

/// `GET {base}/api/sync?since=T` returning a [`PullBatch`] as JSON.
pub struct HttpPullSource {
    client: reqwest::Client,
    url: String,
    auth_token: RwLock<Option<String>>,
}

impl HttpPullSource {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, SyncError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self::with_client(client, format!("{}/api/sync", base_url.trim_end_matches('/'))))
    }

    pub fn with_client(client: reqwest::Client, url: impl Into<String>) -> Self {
        Self { client, url: url.into(), auth_token: RwLock::new(None) }
    }

    pub fn set_auth_token(&self, token: Option<String>) {
        *self.auth_token.write() = token;
    }
}

#[async_trait]
impl PullSource for HttpPullSource {
    async fn pull(&self, since: Option<i64>) -> Result<PullBatch, SyncError> {
        let mut builder = self.client.get(&self.url);
        if let Some(since) = since {
            builder = builder.query(&[("since", since)]);
        }
        if let Some(token) = self.auth_token.read().as_ref() {
            builder = builder.bearer_auth(token);
        }

        let response = builder.send().await?;
        let status = response.status();
        let text = response.text().await?;
        if !status.is_success() {
            return Err(SyncError::from_status(status.as_u16(), text));
        }
        Ok(serde_json::from_str(&text)?)
    }
}

/// Outcome of one incremental sync, also delivered to `on_sync_complete`.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SyncResult {
    pub success: bool,
    /// Another sync was already running; nothing was done.
    pub skipped: bool,
    pub drain: Option<DrainReport>,
    pub applied: usize,
    /// Upserts held back because a local write to the same entity is queued.
    pub protected: usize,
    pub checkpoint: Option<i64>,
    pub error: Option<String>,
}

pub struct SyncOrchestrator {
    store: Arc<dyn DurableStore>,
    cache: Arc<CacheManager>,
    queue: Arc<MutationQueue>,
    source: Arc<dyn PullSource>,
    listeners: TopicRegistry<SyncResult>,
    running: AtomicBool,
}

impl SyncOrchestrator {
    pub fn new(
        store: Arc<dyn DurableStore>,
        cache: Arc<CacheManager>,
        queue: Arc<MutationQueue>,
        source: Arc<dyn PullSource>,
        max_handlers_per_topic: usize,
    ) -> Self {
        Self {
            store,
            cache,
            queue,
            source,
            listeners: TopicRegistry::new(max_handlers_per_topic),
            running: AtomicBool::new(false),
        }
    }

    /// Drain (unless skipped), pull, apply, advance the checkpoint.
    ///
    /// Failures are reported in the returned [`SyncResult`], never as an
    /// error: the UI shows them as status.
    #[instrument(skip(self))]
    pub async fn perform_incremental_sync(&self, options: SyncOptions) -> SyncResult {
        if self.running.swap(true, std::sync::atomic::Ordering::AcqRel) {
            debug!("Sync already running");
            return SyncResult { skipped: true, ..Default::default() };
        }
        let _guard = DrainGuard(&self.running);
        let _timer = SyncTimer::new();

        let mut result = SyncResult::default();
        if !options.skip_mutation_sync {
            match self.queue.drain().await {
                Ok(report) => result.drain = Some(report),
                // Pull still runs; pending entities stay protected below.
                Err(e) => warn!(error = %e, "Outbox drain failed before pull"),
            }
        }

        match self.pull_and_apply(&mut result).await {
            Ok(()) => {
                result.success = true;
                info!(
                    applied = result.applied,
                    protected = result.protected,
                    checkpoint = result.checkpoint,
                    "Incremental sync complete"
                );
            }
            Err(e) => {
                warn!(error = %e, applied = result.applied, "Incremental sync failed; checkpoint unchanged");
                result.error = Some(e.to_string());
            }
        }

        metrics::record_pull(result.applied, result.protected, result.success);
        self.listeners.publish(SYNC_COMPLETE_TOPIC, &result);
        result
    }

    async fn pull_and_apply(&self, result: &mut SyncResult) -> Result<(), SyncError> {
        let since = self.checkpoint().await?;
        let batch = self.source.pull(since).await?;
        debug!(since, events = batch.events.len(), "Pulled changes");

        let protected = self.queue.pending_entities().await?;
        let mut held_from: Option<i64> = None;
        for event in &batch.events {
            let upsert = matches!(event.kind, ChangeKind::Created | ChangeKind::Updated);
            if upsert && protected.contains(&(event.entity, event.entity_id.clone())) {
                debug!(entity = %event.entity, id = %event.entity_id, "Keeping local write over pulled value");
                result.protected += 1;
                held_from = Some(held_from.map_or(event.timestamp, |t| t.min(event.timestamp)));
                continue;
            }
            self.cache.apply_event(event).await?;
            result.applied += 1;
        }

        let mut checkpoint = since.map_or(batch.checkpoint, |s| s.max(batch.checkpoint));
        if let Some(held) = held_from {
            checkpoint = checkpoint.min(held.saturating_sub(1));
            if let Some(since) = since {
                checkpoint = checkpoint.max(since);
            }
        }
        self.store.put_meta(CHECKPOINT_KEY, &checkpoint.to_string()).await?;
        result.checkpoint = Some(checkpoint);
        Ok(())
    }

    pub async fn checkpoint(&self) -> Result<Option<i64>, StorageError> {
        let Some(raw) = self.store.get_meta(CHECKPOINT_KEY).await? else {
            return Ok(None);
        };
        match raw.parse() {
            Ok(ts) => Ok(Some(ts)),
            Err(_) => {
                warn!(value = %raw, "Corrupt sync checkpoint, falling back to full pull");
                Ok(None)
            }
        }
    }

    /// Forget the checkpoint so the next sync is a full pull.
    pub async fn reset_checkpoint(&self) -> Result<(), StorageError> {
        self.store.delete_meta(CHECKPOINT_KEY).await
    }

    pub fn on_sync_complete<F>(&self, callback: F) -> Result<Subscription, SubscribeError>
    where
        F: Fn(&SyncResult) + Send + Sync + 'static,
    {
        self.listeners.subscribe(SYNC_COMPLETE_TOPIC, callback)
    }

    pub fn is_running(&self) -> bool {
        self.running.load(std::sync::atomic::Ordering::Acquire)
    }
}
