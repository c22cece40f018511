// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Offline Mutation Queue.
//!
//! # Flow
//!
//! ```text
//! enqueue ──► outbox (durable, status=pending) ──► drain()
//!                                                   │
//!                     ┌─────────────────────────────┘
//!                     ▼
//!   group into lineages (union of entity / parent / referenced temp IDs)
//!                     │
//!     lineage A ──► m1 ─► m2 ─► m3      (sequential, seq order)
//!     lineage B ──► m4                  (parallel with A)
//!                     │
//!   per mutation: resolve temp IDs ─► unmapped? defer lineage
//!                 send ─► ok: map ID, reconcile cache, rewrite outbox, delete
//!                      ─► retryable: backoff (cap → failed)
//!                      ─► 4xx: failed
//!                      ─► auth expired: pause queue
//! ```
//!
//! Only the tab holding the drainer lease drains. Failed mutations stay in
//! the outbox until [`MutationQueue::retry_failed`] or
//! [`MutationQueue::discard`]; nothing is purged automatically.

pub mod rewrite;
pub mod transport;

use futures::future::join_all;
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};

use crate::cache::CacheManager;
use crate::crosstab::{CrossTabCoordinator, CrossTabEvent};
use crate::error::SyncError;
use crate::id_translator::IdTranslator;
use crate::metrics;
use crate::model::{
    is_temp_id, now_millis, EntityType, HttpMethod, Mutation, MutationOp, MutationStatus, SequenceGen,
};
use crate::resilience::retry::RetryConfig;
use crate::storage::{DurableStore, StorageError};

use rewrite::{rewrite_mutation, unresolved_temp_ids};
use transport::{MutationRequest, MutationTransport};

/// A write requested by the UI, before it is queued.
#[derive(Debug, Clone, PartialEq)]
pub struct NewMutation {
    pub op: MutationOp,
    pub entity_type: EntityType,
    /// Temp ID for offline creates, otherwise the real id.
    pub entity_id: String,
    pub endpoint: String,
    pub method: HttpMethod,
    pub body: Value,
    pub parent_id: Option<String>,
}

impl NewMutation {
    pub fn create(entity_type: EntityType, temp_id: impl Into<String>, endpoint: impl Into<String>, body: Value) -> Self {
        Self {
            op: MutationOp::Create,
            entity_type,
            entity_id: temp_id.into(),
            endpoint: endpoint.into(),
            method: HttpMethod::Post,
            body,
            parent_id: None,
        }
    }

    pub fn update(entity_type: EntityType, id: impl Into<String>, endpoint: impl Into<String>, body: Value) -> Self {
        Self {
            op: MutationOp::Update,
            entity_type,
            entity_id: id.into(),
            endpoint: endpoint.into(),
            method: HttpMethod::Patch,
            body,
            parent_id: None,
        }
    }

    pub fn delete(entity_type: EntityType, id: impl Into<String>, endpoint: impl Into<String>) -> Self {
        Self {
            op: MutationOp::Delete,
            entity_type,
            entity_id: id.into(),
            endpoint: endpoint.into(),
            method: HttpMethod::Delete,
            body: Value::Null,
            parent_id: None,
        }
    }

    #[must_use]
    pub fn with_parent(mut self, parent_id: impl Into<String>) -> Self {
        self.parent_id = Some(parent_id.into());
        self
    }

    #[must_use]
    pub fn with_method(mut self, method: HttpMethod) -> Self {
        self.method = method;
        self
    }

    /// Synchronous input checks; [`MutationQueue::enqueue`] runs them too.
    pub fn validate(&self) -> Result<(), SyncError> {
        if self.entity_id.trim().is_empty() {
            return Err(SyncError::Validation("entity id must not be empty".into()));
        }
        if self.endpoint.trim().is_empty() {
            return Err(SyncError::Validation("endpoint must not be empty".into()));
        }
        if self.parent_id.as_deref().is_some_and(|p| p.trim().is_empty()) {
            return Err(SyncError::Validation("parent id must not be empty when given".into()));
        }
        if self.parent_id.as_deref() == Some(self.entity_id.as_str()) {
            return Err(SyncError::Validation("entity cannot be its own parent".into()));
        }
        match (self.op, self.method) {
            (MutationOp::Delete, HttpMethod::Delete) => Ok(()),
            (MutationOp::Delete, m) | (_, m @ HttpMethod::Delete) => Err(SyncError::Validation(format!(
                "{} mutation cannot use {}",
                self.op, m
            ))),
            _ if !(self.body.is_object() || self.body.is_null()) => {
                Err(SyncError::Validation("body must be a JSON object".into()))
            }
            _ => Ok(()),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MutationStats {
    /// Pending or in flight.
    pub pending: usize,
    pub failed: usize,
}

/// Why a drain did nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    Paused,
    NotDrainer,
    AlreadyDraining,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DrainReport {
    pub sent: usize,
    pub failed: usize,
    /// Waiting on an unmapped temp ID.
    pub deferred: usize,
    /// Failed transiently, next attempt scheduled.
    pub retry_scheduled: usize,
    /// Still inside a backoff window.
    pub waiting: usize,
    pub paused: bool,
    pub skipped: Option<SkipReason>,
}

impl DrainReport {
    fn skipped(reason: SkipReason) -> Self {
        Self { skipped: Some(reason), paused: reason == SkipReason::Paused, ..Default::default() }
    }

    fn absorb(&mut self, other: DrainReport) {
        self.sent += other.sent;
        self.failed += other.failed;
        self.deferred += other.deferred;
        self.retry_scheduled += other.retry_scheduled;
        self.waiting += other.waiting;
        self.paused |= other.paused;
    }
}

/// RAII guard to reset a running flag (drain, pull sync).
pub(crate) struct DrainGuard<'a>(pub(crate) &'a AtomicBool);

impl Drop for DrainGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Outcome of sending one mutation.
enum Step {
    Sent,
    Failed,
    RetryScheduled,
    Paused,
}

pub struct MutationQueue {
    store: Arc<dyn DurableStore>,
    transport: Arc<dyn MutationTransport>,
    translator: Arc<IdTranslator>,
    cache: Arc<CacheManager>,
    crosstab: Arc<CrossTabCoordinator>,
    seq: SequenceGen,
    retry: RetryConfig,
    temp_id_prefix: String,
    draining: AtomicBool,
    paused: AtomicBool,
}

impl MutationQueue {
    pub fn new(
        store: Arc<dyn DurableStore>,
        transport: Arc<dyn MutationTransport>,
        translator: Arc<IdTranslator>,
        cache: Arc<CacheManager>,
        crosstab: Arc<CrossTabCoordinator>,
        retry: RetryConfig,
        temp_id_prefix: impl Into<String>,
    ) -> Self {
        Self {
            store,
            transport,
            translator,
            cache,
            crosstab,
            seq: SequenceGen::new(),
            retry,
            temp_id_prefix: temp_id_prefix.into(),
            draining: AtomicBool::new(false),
            paused: AtomicBool::new(false),
        }
    }

    /// Recover after a reload: continue the sequence above the persisted
    /// outbox and put interrupted sends back to pending.
    pub async fn restore(&self) -> Result<MutationStats, StorageError> {
        let mut interrupted = Vec::new();
        for mut m in self.store.list_mutations().await? {
            self.seq.observe(m.seq);
            if m.status == MutationStatus::Syncing {
                m.status = MutationStatus::Pending;
                interrupted.push(m);
            }
        }
        if !interrupted.is_empty() {
            warn!(count = interrupted.len(), "Resetting mutations interrupted mid-send");
            self.store.put_mutations(&interrupted).await?;
        }
        self.get_mutation_stats().await
    }

    /// Persist a mutation to the outbox. Never touches the network.
    #[tracing::instrument(skip(self, new), fields(entity = %new.entity_type, op = %new.op))]
    pub async fn enqueue(&self, new: NewMutation) -> Result<Mutation, SyncError> {
        new.validate()?;

        let now = now_millis();
        let temp_id = (new.op == MutationOp::Create && is_temp_id(&new.entity_id, &self.temp_id_prefix))
            .then(|| new.entity_id.clone());
        let real_id = (!is_temp_id(&new.entity_id, &self.temp_id_prefix)).then(|| new.entity_id.clone());

        let mutation = Mutation {
            id: uuid::Uuid::new_v4().to_string(),
            entity_type: new.entity_type,
            op: new.op,
            entity_id: new.entity_id,
            temp_id,
            real_id,
            parent_id: new.parent_id,
            endpoint: new.endpoint,
            method: new.method,
            body: new.body,
            status: MutationStatus::Pending,
            retry_count: 0,
            created_at: now,
            seq: self.seq.next(),
            idempotency_key: uuid::Uuid::new_v4().to_string(),
            next_attempt_at: 0,
            last_error: None,
        };

        if let Err(e) = self.store.put_mutation(&mutation).await {
            error!(mutation_id = %mutation.id, error = %e, "Failed to persist mutation to outbox");
            return Err(e.into());
        }

        debug!(mutation_id = %mutation.id, entity_id = %mutation.entity_id, "Mutation queued");
        metrics::record_mutation_enqueued(mutation.entity_type.as_str(), &mutation.op.to_string());
        self.crosstab.broadcast(
            CrossTabEvent::MutationQueued,
            Some(mutation.entity_type),
            Some(&mutation.entity_id),
            json!({"mutation_id": mutation.id, "op": mutation.op}),
        );
        Ok(mutation)
    }

    /// Send pending mutations. Safe to call at any time: returns a skipped
    /// report when paused, when another tab is the drainer, or when a drain
    /// is already running.
    #[tracing::instrument(skip(self))]
    pub async fn drain(&self) -> Result<DrainReport, SyncError> {
        if self.is_paused() {
            debug!("Drain skipped: queue paused");
            return Ok(DrainReport::skipped(SkipReason::Paused));
        }
        if !self.crosstab.try_become_drainer().await? {
            debug!("Drain skipped: another tab is the active drainer");
            return Ok(DrainReport::skipped(SkipReason::NotDrainer));
        }
        if self.draining.swap(true, Ordering::AcqRel) {
            return Ok(DrainReport::skipped(SkipReason::AlreadyDraining));
        }
        let _guard = DrainGuard(&self.draining);

        let started = Instant::now();
        let ready: Vec<Mutation> = self
            .store
            .list_mutations()
            .await?
            .into_iter()
            .filter(|m| matches!(m.status, MutationStatus::Pending | MutationStatus::Syncing))
            .collect();

        if ready.is_empty() {
            return Ok(DrainReport::default());
        }

        info!(pending = ready.len(), "Starting outbox drain");
        self.crosstab.broadcast(CrossTabEvent::SyncStarted, None, None, json!({"pending": ready.len()}));

        let lineages = self.lineages(ready);
        let outcomes = join_all(lineages.into_iter().map(|l| self.run_lineage(l))).await;

        // A lineage that hit a storage error stops; the others still count
        // and still get announced before the error is returned.
        let mut report = DrainReport::default();
        let mut first_error = None;
        for outcome in outcomes {
            match outcome {
                Ok(lineage) => report.absorb(lineage),
                Err(e) => {
                    error!(error = %e, "Lineage aborted during drain");
                    first_error.get_or_insert(e);
                }
            }
        }

        info!(
            sent = report.sent,
            failed = report.failed,
            deferred = report.deferred,
            retry_scheduled = report.retry_scheduled,
            "Outbox drain complete"
        );
        metrics::record_drain(report.sent, report.failed, report.deferred, started.elapsed());
        self.crosstab.broadcast(
            CrossTabEvent::SyncCompleted,
            None,
            None,
            json!({"success_count": report.sent, "failed_count": report.failed}),
        );
        self.refresh_gauges().await;
        match first_error {
            Some(e) => Err(e),
            None => Ok(report),
        }
    }

    /// Group mutations into lineages: two mutations share a lineage when
    /// they touch a common entity (target, parent or referenced temp ID).
    /// Each lineage is in `seq` order; lineages are ordered by first `seq`.
    fn lineages(&self, mutations: Vec<Mutation>) -> Vec<Vec<Mutation>> {
        let mut parent: Vec<usize> = (0..mutations.len()).collect();
        fn find(parent: &mut [usize], mut i: usize) -> usize {
            while parent[i] != i {
                parent[i] = parent[parent[i]];
                i = parent[i];
            }
            i
        }

        let mut owner: HashMap<String, usize> = HashMap::new();
        for (i, m) in mutations.iter().enumerate() {
            let mut keys: Vec<String> = m.referenced_ids().map(|id| self.translator.resolve(id)).collect();
            keys.extend(
                unresolved_temp_ids(m, &self.temp_id_prefix)
                    .into_iter()
                    .map(|id| self.translator.resolve(&id)),
            );
            for key in keys {
                match owner.get(&key) {
                    Some(&j) => {
                        let (a, b) = (find(&mut parent, i), find(&mut parent, j));
                        if a != b {
                            parent[a.max(b)] = a.min(b);
                        }
                    }
                    None => {
                        owner.insert(key, i);
                    }
                }
            }
        }

        let mut groups: Vec<Vec<Mutation>> = Vec::new();
        let mut slot: HashMap<usize, usize> = HashMap::new();
        let roots: Vec<usize> = (0..mutations.len()).map(|i| find(&mut parent, i)).collect();
        for (m, root) in mutations.into_iter().zip(roots) {
            let idx = *slot.entry(root).or_insert_with(|| {
                groups.push(Vec::new());
                groups.len() - 1
            });
            groups[idx].push(m);
        }
        for g in &mut groups {
            g.sort_by_key(|m| m.seq);
        }
        groups.sort_by_key(|g| g.first().map_or(i64::MAX, |m| m.seq));
        groups
    }

    async fn run_lineage(&self, lineage: Vec<Mutation>) -> Result<DrainReport, SyncError> {
        let mut report = DrainReport::default();
        let total = lineage.len();

        for (idx, snapshot) in lineage.into_iter().enumerate() {
            // Re-read: an earlier success may have rewritten this entry, or
            // another tab may have sent / discarded it.
            let Some(mut m) = self.store.get_mutation(&snapshot.id).await? else {
                continue;
            };
            if !matches!(m.status, MutationStatus::Pending | MutationStatus::Syncing) {
                continue;
            }
            if self.is_paused() {
                report.paused = true;
                break;
            }
            if m.next_attempt_at > now_millis() {
                report.waiting += total - idx;
                break;
            }

            match self.resolve(&mut m).await {
                Ok(()) => {}
                Err(SyncError::DependencyNotReady { temp_id }) => {
                    debug!(mutation_id = %m.id, waiting_on = %temp_id, "Mutation deferred");
                    metrics::record_mutation_outcome(m.entity_type.as_str(), "deferred");
                    report.deferred += total - idx;
                    break;
                }
                Err(e) => return Err(e),
            }

            match self.send(m).await? {
                Step::Sent => report.sent += 1,
                Step::Failed => report.failed += 1,
                Step::RetryScheduled => {
                    report.retry_scheduled += 1;
                    report.waiting += total - idx - 1;
                    break;
                }
                Step::Paused => {
                    report.paused = true;
                    break;
                }
            }
        }
        Ok(report)
    }

    /// Rewrite every mapped temp ID in `m`; `DependencyNotReady` for the
    /// first one without a mapping.
    async fn resolve(&self, m: &mut Mutation) -> Result<(), SyncError> {
        let mut changed = false;
        for temp_id in unresolved_temp_ids(m, &self.temp_id_prefix) {
            match self.translator.get_real_id(&temp_id) {
                Some(real_id) => changed |= rewrite_mutation(m, &temp_id, &real_id),
                None => return Err(SyncError::DependencyNotReady { temp_id }),
            }
        }
        if changed {
            self.store.put_mutation(m).await?;
        }
        Ok(())
    }

    async fn send(&self, mut m: Mutation) -> Result<Step, SyncError> {
        m.status = MutationStatus::Syncing;
        self.store.put_mutation(&m).await?;

        let started = Instant::now();
        let result = self.transport.send(&MutationRequest::from(&m)).await;
        metrics::record_mutation_latency(started.elapsed());

        match result {
            Ok(response) => {
                let mut real_id = None;
                if let (MutationOp::Create, Some(temp_id)) = (m.op, m.temp_id.clone()) {
                    let Some(id) = response.real_id() else {
                        let err = SyncError::Protocol("create response carried no id".into());
                        return self.mark_failed(m, &err).await.map(|_| Step::Failed);
                    };
                    self.translator.save_mapping(&temp_id, &id, m.entity_type).await?;
                    self.cache
                        .reconcile_temp_id(m.entity_type, &temp_id, &id, response.entity_payload())
                        .await?;
                    self.rewrite_outbox(&temp_id, &id, &m.id).await?;
                    real_id = Some(id);
                }

                self.store.delete_mutation(&m.id).await?;
                m.status = MutationStatus::Success;
                debug!(mutation_id = %m.id, entity_id = %m.entity_id, real_id = ?real_id, "Mutation synced");
                metrics::record_mutation_outcome(m.entity_type.as_str(), "success");
                self.crosstab.broadcast(
                    CrossTabEvent::MutationSynced,
                    Some(m.entity_type),
                    Some(real_id.as_deref().unwrap_or(&m.entity_id)),
                    json!({
                        "mutation_id": m.id,
                        "op": m.op,
                        "temp_id": m.temp_id,
                        "real_id": real_id.as_deref().or(m.real_id.as_deref()),
                    }),
                );
                Ok(Step::Sent)
            }
            Err(SyncError::AuthExpired) => {
                m.status = MutationStatus::Pending;
                self.store.put_mutation(&m).await?;
                self.pause();
                metrics::record_mutation_outcome(m.entity_type.as_str(), "paused");
                Ok(Step::Paused)
            }
            Err(err) if err.is_retryable() => {
                m.retry_count += 1;
                m.last_error = Some(err.to_string());
                if self.retry.is_exhausted(m.retry_count) {
                    self.mark_failed(m, &err).await?;
                    return Ok(Step::Failed);
                }
                let delay = self.retry.delay_for_attempt(m.retry_count);
                m.status = MutationStatus::Pending;
                m.next_attempt_at = now_millis() + delay.as_millis() as i64;
                warn!(
                    mutation_id = %m.id,
                    attempt = m.retry_count,
                    retry_in = ?delay,
                    error = %err,
                    "Mutation send failed, retry scheduled"
                );
                self.store.put_mutation(&m).await?;
                metrics::record_mutation_outcome(m.entity_type.as_str(), "retry");
                Ok(Step::RetryScheduled)
            }
            Err(err) => {
                m.retry_count += 1;
                self.mark_failed(m, &err).await?;
                Ok(Step::Failed)
            }
        }
    }

    async fn mark_failed(&self, mut m: Mutation, err: &SyncError) -> Result<(), SyncError> {
        m.status = MutationStatus::Failed;
        m.last_error = Some(err.to_string());
        self.store.put_mutation(&m).await?;

        warn!(mutation_id = %m.id, attempts = m.retry_count, error = %err, "Mutation failed, needs manual resolution");
        metrics::record_mutation_outcome(m.entity_type.as_str(), "failed");
        self.crosstab.broadcast(
            CrossTabEvent::MutationFailed,
            Some(m.entity_type),
            Some(&m.entity_id),
            json!({"mutation_id": m.id, "error": err.to_string(), "retry_count": m.retry_count}),
        );
        Ok(())
    }

    /// Point every other outbox entry referencing `temp_id` at `real_id`.
    async fn rewrite_outbox(&self, temp_id: &str, real_id: &str, except: &str) -> Result<usize, StorageError> {
        let mut changed = Vec::new();
        for mut m in self.store.list_mutations().await? {
            if m.id != except && rewrite_mutation(&mut m, temp_id, real_id) {
                changed.push(m);
            }
        }
        if !changed.is_empty() {
            self.store.put_mutations(&changed).await?;
            debug!(temp_id, real_id, rewritten = changed.len(), "Rewrote queued mutations");
            metrics::record_id_rewrites(changed.len());
        }
        Ok(changed.len())
    }

    pub async fn get_mutation_stats(&self) -> Result<MutationStats, StorageError> {
        let mut stats = MutationStats::default();
        for m in self.store.list_mutations().await? {
            match m.status {
                MutationStatus::Failed => stats.failed += 1,
                MutationStatus::Pending | MutationStatus::Syncing => stats.pending += 1,
                MutationStatus::Success => {}
            }
        }
        Ok(stats)
    }

    /// Outbox snapshot in `seq` order.
    pub async fn mutations(&self) -> Result<Vec<Mutation>, StorageError> {
        self.store.list_mutations().await
    }

    /// Entities with a local write the server has not accepted yet, under
    /// both their queued id and its mapped real id. Incoming upserts for
    /// these must not overwrite the optimistic copy.
    pub async fn pending_entities(&self) -> Result<HashSet<(EntityType, String)>, StorageError> {
        let mut pending = HashSet::new();
        for m in self.store.list_mutations().await? {
            if matches!(m.status, MutationStatus::Pending | MutationStatus::Syncing) {
                pending.insert((m.entity_type, self.translator.resolve(&m.entity_id)));
                pending.insert((m.entity_type, m.entity_id));
            }
        }
        Ok(pending)
    }

    pub async fn has_pending(&self, entity_type: EntityType, id: &str) -> Result<bool, StorageError> {
        Ok(self.pending_entities().await?.contains(&(entity_type, id.to_string())))
    }

    /// Reset a failed mutation to pending with a fresh attempt budget.
    pub async fn retry_failed(&self, id: &str) -> Result<bool, StorageError> {
        let Some(mut m) = self.store.get_mutation(id).await? else {
            return Ok(false);
        };
        if m.status != MutationStatus::Failed {
            return Ok(false);
        }
        m.status = MutationStatus::Pending;
        m.retry_count = 0;
        m.next_attempt_at = 0;
        m.last_error = None;
        self.store.put_mutation(&m).await?;
        info!(mutation_id = %id, "Failed mutation re-queued");
        self.refresh_gauges().await;
        Ok(true)
    }

    pub async fn retry_all_failed(&self) -> Result<usize, StorageError> {
        let mut count = 0;
        for m in self.store.list_mutations().await? {
            if m.status == MutationStatus::Failed && self.retry_failed(&m.id).await? {
                count += 1;
            }
        }
        Ok(count)
    }

    /// Drop a failed mutation. A failed create also takes its optimistic
    /// cache entry with it.
    pub async fn discard(&self, id: &str) -> Result<bool, StorageError> {
        let Some(m) = self.store.get_mutation(id).await? else {
            return Ok(false);
        };
        if m.status != MutationStatus::Failed {
            return Ok(false);
        }
        self.store.delete_mutation(id).await?;
        if let (MutationOp::Create, Some(temp_id)) = (m.op, m.temp_id.as_deref()) {
            self.cache.remove(m.entity_type, temp_id, true).await?;
        }
        info!(mutation_id = %id, "Failed mutation discarded");
        self.refresh_gauges().await;
        Ok(true)
    }

    /// Stop draining until [`Self::resume`] (e.g. after the session expired).
    pub fn pause(&self) {
        if !self.paused.swap(true, Ordering::AcqRel) {
            warn!("Mutation queue paused: authentication expired");
        }
    }

    pub fn resume(&self) {
        if self.paused.swap(false, Ordering::AcqRel) {
            info!("Mutation queue resumed");
        }
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Acquire)
    }

    pub fn is_draining(&self) -> bool {
        self.draining.load(Ordering::Acquire)
    }

    async fn refresh_gauges(&self) {
        match self.get_mutation_stats().await {
            Ok(stats) => metrics::set_outbox_depth(stats.pending, stats.failed),
            Err(e) => debug!(error = %e, "Could not refresh outbox gauges"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crosstab::{Broadcaster, NoopBroadcaster, OriginChannel};
    use crate::model::IdMapping;
    use crate::storage::memory::InMemoryStore;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::collections::VecDeque;
    use std::time::Duration;
    use transport::MutationResponse;

    /// Replays scripted responses in order; records every request.
    #[derive(Default)]
    struct ScriptedTransport {
        responses: Mutex<VecDeque<Result<MutationResponse, SyncError>>>,
        sent: Mutex<Vec<MutationRequest>>,
    }

    impl ScriptedTransport {
        fn push(&self, r: Result<MutationResponse, SyncError>) {
            self.responses.lock().push_back(r);
        }
    }

    #[async_trait]
    impl MutationTransport for ScriptedTransport {
        async fn send(&self, request: &MutationRequest) -> Result<MutationResponse, SyncError> {
            self.sent.lock().push(request.clone());
            self.responses.lock().pop_front().unwrap_or_else(|| Ok(MutationResponse::ok(Value::Null)))
        }
    }

    struct Harness {
        queue: MutationQueue,
        store: Arc<InMemoryStore>,
        transport: Arc<ScriptedTransport>,
        translator: Arc<IdTranslator>,
    }

    fn harness(retry: RetryConfig) -> Harness {
        let store = Arc::new(InMemoryStore::new());
        let translator = Arc::new(IdTranslator::new(store.clone()));
        let cache = Arc::new(CacheManager::new(store.clone(), translator.clone(), 16, "temp-"));
        let crosstab = Arc::new(CrossTabCoordinator::new(
            Arc::new(NoopBroadcaster),
            store.clone(),
            Duration::from_secs(10),
            16,
        ));
        let transport = Arc::new(ScriptedTransport::default());
        let queue = MutationQueue::new(
            store.clone(),
            transport.clone(),
            translator.clone(),
            cache,
            crosstab,
            retry,
            "temp-",
        );
        Harness { queue, store, transport, translator }
    }

    fn instant_retry() -> RetryConfig {
        RetryConfig {
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            factor: 2.0,
            max_retries: Some(5),
        }
    }

    #[tokio::test]
    async fn test_enqueue_validates_input() {
        let h = harness(instant_retry());
        let bad = NewMutation::update(EntityType::Task, "", "/api/tasks/", json!({}));
        assert!(matches!(h.queue.enqueue(bad).await, Err(SyncError::Validation(_))));

        let wrong_method = NewMutation::update(EntityType::Task, "t1", "/api/tasks/t1", json!({}))
            .with_method(HttpMethod::Delete);
        assert!(matches!(h.queue.enqueue(wrong_method).await, Err(SyncError::Validation(_))));

        let not_object = NewMutation::update(EntityType::Task, "t1", "/api/tasks/t1", json!([1]));
        assert!(matches!(h.queue.enqueue(not_object).await, Err(SyncError::Validation(_))));
        assert_eq!(h.queue.get_mutation_stats().await.unwrap(), MutationStats::default());
    }

    #[tokio::test]
    async fn test_enqueue_persists_pending_with_unique_keys() {
        let h = harness(instant_retry());
        let a = h.queue.enqueue(NewMutation::create(EntityType::Task, "temp-1", "/api/tasks", json!({}))).await.unwrap();
        let b = h.queue.enqueue(NewMutation::update(EntityType::Task, "real-5", "/api/tasks/real-5", json!({}))).await.unwrap();

        assert_eq!(a.status, MutationStatus::Pending);
        assert_eq!(a.temp_id.as_deref(), Some("temp-1"));
        assert!(a.real_id.is_none());
        assert_eq!(b.real_id.as_deref(), Some("real-5"));
        assert!(b.seq > a.seq);
        assert_ne!(a.idempotency_key, b.idempotency_key);
        assert_eq!(h.queue.get_mutation_stats().await.unwrap(), MutationStats { pending: 2, failed: 0 });
        assert!(h.transport.sent.lock().is_empty());
    }

    #[tokio::test]
    async fn test_lineages_group_by_dependency() {
        let h = harness(instant_retry());
        let list = h.queue.enqueue(NewMutation::create(EntityType::List, "temp-L", "/api/lists", json!({}))).await.unwrap();
        let other = h.queue.enqueue(NewMutation::update(EntityType::Task, "real-7", "/api/tasks/real-7", json!({}))).await.unwrap();
        let task = h
            .queue
            .enqueue(NewMutation::create(EntityType::Task, "temp-T", "/api/tasks", json!({"list_id": "temp-L"})).with_parent("temp-L"))
            .await
            .unwrap();
        let comment = h
            .queue
            .enqueue(NewMutation::create(EntityType::Comment, "temp-C", "/api/tasks/temp-T/comments", json!({})))
            .await
            .unwrap();

        let groups = h.queue.lineages(h.store.list_mutations().await.unwrap());
        let ids: Vec<Vec<String>> = groups.iter().map(|g| g.iter().map(|m| m.id.clone()).collect()).collect();
        assert_eq!(ids, vec![vec![list.id, task.id, comment.id], vec![other.id]]);
    }

    #[tokio::test]
    async fn test_create_success_maps_and_rewrites_dependents() {
        let h = harness(instant_retry());
        h.queue.enqueue(NewMutation::create(EntityType::Task, "temp-1", "/api/tasks", json!({"title": "t"}))).await.unwrap();
        h.queue
            .enqueue(NewMutation::create(EntityType::Comment, "temp-c", "/api/comments", json!({"task_id": "temp-1"})).with_parent("temp-1"))
            .await
            .unwrap();

        h.transport.push(Ok(MutationResponse::ok(json!({"id": "real-99"}))));
        h.transport.push(Ok(MutationResponse::ok(json!({"id": "real-c"}))));

        let report = h.queue.drain().await.unwrap();
        assert_eq!(report.sent, 2);
        assert_eq!(h.translator.get_real_id("temp-1").as_deref(), Some("real-99"));

        let sent = h.transport.sent.lock().clone();
        assert_eq!(sent[1].body, json!({"task_id": "real-99"}));
        assert!(h.store.list_mutations().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unmapped_parent_defers_without_failing() {
        let h = harness(instant_retry());
        // Parent create already failed permanently, so its temp ID never maps
        h.transport.push(Err(SyncError::from_status(422, "invalid")));
        h.queue.enqueue(NewMutation::create(EntityType::List, "temp-L", "/api/lists", json!({}))).await.unwrap();
        h.queue
            .enqueue(NewMutation::create(EntityType::Task, "temp-T", "/api/tasks", json!({})).with_parent("temp-L"))
            .await
            .unwrap();

        let report = h.queue.drain().await.unwrap();
        assert_eq!(report.failed, 1);
        assert_eq!(report.deferred, 1);
        assert_eq!(h.transport.sent.lock().len(), 1);
        assert_eq!(h.queue.get_mutation_stats().await.unwrap(), MutationStats { pending: 1, failed: 1 });
    }

    #[tokio::test]
    async fn test_retry_cap_marks_failed() {
        let h = harness(instant_retry());
        h.queue.enqueue(NewMutation::update(EntityType::Task, "real-1", "/api/tasks/real-1", json!({}))).await.unwrap();

        for attempt in 1..=5 {
            h.transport.push(Err(SyncError::from_status(503, "down")));
            let report = h.queue.drain().await.unwrap();
            if attempt < 5 {
                assert_eq!(report.retry_scheduled, 1, "attempt {attempt}");
            } else {
                assert_eq!(report.failed, 1);
            }
        }

        let stats = h.queue.get_mutation_stats().await.unwrap();
        assert_eq!(stats, MutationStats { pending: 0, failed: 1 });
        let m = &h.store.list_mutations().await.unwrap()[0];
        assert_eq!(m.retry_count, 5);
        assert_eq!(m.status, MutationStatus::Failed);

        // Failed mutations are not retried automatically
        h.queue.drain().await.unwrap();
        assert_eq!(h.transport.sent.lock().len(), 5);
    }

    #[tokio::test]
    async fn test_backoff_window_holds_lineage() {
        let h = harness(RetryConfig::mutation());
        h.queue.enqueue(NewMutation::update(EntityType::Task, "real-1", "/api/tasks/real-1", json!({"a": 1}))).await.unwrap();
        h.queue.enqueue(NewMutation::update(EntityType::Task, "real-1", "/api/tasks/real-1", json!({"a": 2}))).await.unwrap();

        h.transport.push(Err(SyncError::Timeout));
        let report = h.queue.drain().await.unwrap();
        assert_eq!(report.retry_scheduled, 1);
        assert_eq!(report.waiting, 1);

        // Second drain inside the 1s backoff sends nothing
        let report = h.queue.drain().await.unwrap();
        assert_eq!(report.waiting, 2);
        assert_eq!(h.transport.sent.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_auth_expired_pauses_without_consuming_attempt() {
        let h = harness(instant_retry());
        h.queue.enqueue(NewMutation::update(EntityType::Task, "real-1", "/api/tasks/real-1", json!({}))).await.unwrap();
        h.transport.push(Err(SyncError::AuthExpired));

        let report = h.queue.drain().await.unwrap();
        assert!(report.paused);
        assert!(h.queue.is_paused());
        let m = &h.store.list_mutations().await.unwrap()[0];
        assert_eq!(m.retry_count, 0);
        assert_eq!(m.status, MutationStatus::Pending);

        assert_eq!(h.queue.drain().await.unwrap().skipped, Some(SkipReason::Paused));
        h.queue.resume();
        assert_eq!(h.queue.drain().await.unwrap().sent, 1);
    }

    #[tokio::test]
    async fn test_manual_retry_and_discard() {
        let h = harness(instant_retry());
        let m = h.queue.enqueue(NewMutation::create(EntityType::Task, "temp-1", "/api/tasks", json!({}))).await.unwrap();
        h.transport.push(Err(SyncError::from_status(400, "bad")));
        h.queue.drain().await.unwrap();
        assert_eq!(h.queue.get_mutation_stats().await.unwrap().failed, 1);

        assert!(h.queue.retry_failed(&m.id).await.unwrap());
        assert!(!h.queue.retry_failed(&m.id).await.unwrap());
        h.transport.push(Err(SyncError::from_status(400, "bad")));
        h.queue.drain().await.unwrap();

        assert!(h.queue.discard(&m.id).await.unwrap());
        assert_eq!(h.queue.get_mutation_stats().await.unwrap(), MutationStats::default());
        assert!(!h.queue.discard(&m.id).await.unwrap());
    }

    #[tokio::test]
    async fn test_restore_resets_interrupted_sends() {
        let h = harness(instant_retry());
        let mut m = h.queue.enqueue(NewMutation::update(EntityType::Task, "real-1", "/api/tasks/real-1", json!({}))).await.unwrap();
        m.status = MutationStatus::Syncing;
        m.seq = i64::MAX / 2;
        h.store.put_mutation(&m).await.unwrap();

        let stats = h.queue.restore().await.unwrap();
        assert_eq!(stats.pending, 1);
        assert_eq!(h.store.get_mutation(&m.id).await.unwrap().unwrap().status, MutationStatus::Pending);

        let next = h.queue.enqueue(NewMutation::update(EntityType::Task, "real-2", "/api/tasks/real-2", json!({}))).await.unwrap();
        assert!(next.seq > m.seq);
    }

    /// Delegates to memory, but reading one chosen mutation fails.
    #[derive(Default)]
    struct FlakyStore {
        inner: InMemoryStore,
        unreadable: Mutex<Option<String>>,
    }

    #[async_trait]
    impl DurableStore for FlakyStore {
        async fn get_entity(&self, entity_type: EntityType, id: &str) -> Result<Option<Value>, StorageError> {
            self.inner.get_entity(entity_type, id).await
        }
        async fn put_entity(&self, entity_type: EntityType, id: &str, payload: &Value) -> Result<(), StorageError> {
            self.inner.put_entity(entity_type, id, payload).await
        }
        async fn delete_entity(&self, entity_type: EntityType, id: &str) -> Result<bool, StorageError> {
            self.inner.delete_entity(entity_type, id).await
        }
        async fn list_entities(&self, entity_type: EntityType) -> Result<Vec<(String, Value)>, StorageError> {
            self.inner.list_entities(entity_type).await
        }
        async fn count_entities(&self, entity_type: EntityType) -> Result<u64, StorageError> {
            self.inner.count_entities(entity_type).await
        }
        async fn put_mutation(&self, mutation: &Mutation) -> Result<(), StorageError> {
            self.inner.put_mutation(mutation).await
        }
        async fn get_mutation(&self, id: &str) -> Result<Option<Mutation>, StorageError> {
            if self.unreadable.lock().as_deref() == Some(id) {
                return Err(StorageError::Backend("disk I/O error".into()));
            }
            self.inner.get_mutation(id).await
        }
        async fn delete_mutation(&self, id: &str) -> Result<bool, StorageError> {
            self.inner.delete_mutation(id).await
        }
        async fn list_mutations(&self) -> Result<Vec<Mutation>, StorageError> {
            self.inner.list_mutations().await
        }
        async fn put_mapping(&self, mapping: &IdMapping) -> Result<(), StorageError> {
            self.inner.put_mapping(mapping).await
        }
        async fn list_mappings(&self) -> Result<Vec<IdMapping>, StorageError> {
            self.inner.list_mappings().await
        }
        async fn delete_mappings_before(&self, cutoff: i64) -> Result<u64, StorageError> {
            self.inner.delete_mappings_before(cutoff).await
        }
        async fn get_meta(&self, key: &str) -> Result<Option<String>, StorageError> {
            self.inner.get_meta(key).await
        }
        async fn put_meta(&self, key: &str, value: &str) -> Result<(), StorageError> {
            self.inner.put_meta(key, value).await
        }
        async fn delete_meta(&self, key: &str) -> Result<(), StorageError> {
            self.inner.delete_meta(key).await
        }
    }

    #[tokio::test]
    async fn test_failing_lineage_does_not_hide_the_others() {
        let store = Arc::new(FlakyStore::default());
        let origin = OriginChannel::new("drain", 64);
        let mut announcements = origin.listen().unwrap();
        let translator = Arc::new(IdTranslator::new(store.clone()));
        let cache = Arc::new(CacheManager::new(store.clone(), translator.clone(), 16, "temp-"));
        let crosstab = Arc::new(CrossTabCoordinator::new(Arc::new(origin), store.clone(), Duration::from_secs(10), 16));
        let transport = Arc::new(ScriptedTransport::default());
        let queue = MutationQueue::new(store.clone(), transport.clone(), translator, cache, crosstab, instant_retry(), "temp-");

        let broken = queue
            .enqueue(NewMutation::update(EntityType::Task, "t1", "/api/tasks/t1", json!({"done": true})))
            .await
            .unwrap();
        let fine = queue
            .enqueue(NewMutation::update(EntityType::Task, "t2", "/api/tasks/t2", json!({"done": true})))
            .await
            .unwrap();
        *store.unreadable.lock() = Some(broken.id.clone());

        let err = queue.drain().await.unwrap_err();
        assert!(err.to_string().contains("disk I/O error"));

        // The healthy lineage was sent and removed
        assert_eq!(transport.sent.lock().len(), 1);
        assert_eq!(transport.sent.lock()[0].endpoint, "/api/tasks/t2");
        assert!(store.inner.get_mutation(&fine.id).await.unwrap().is_none());

        // Other tabs still hear that the drain finished, with its real count
        let mut completed = None;
        while let Ok(message) = announcements.try_recv() {
            if message.event == CrossTabEvent::SyncCompleted {
                completed = Some(message.data);
            }
        }
        assert_eq!(completed.unwrap()["success_count"], 1);
    }

    #[tokio::test]
    async fn test_pending_entities_cover_mapped_ids() {
        let h = harness(instant_retry());
        h.queue.enqueue(NewMutation::update(EntityType::Task, "temp-9", "/api/tasks/temp-9", json!({}))).await.unwrap();
        h.translator.save_mapping("temp-9", "t9", EntityType::Task).await.unwrap();

        assert!(h.queue.has_pending(EntityType::Task, "temp-9").await.unwrap());
        assert!(h.queue.has_pending(EntityType::Task, "t9").await.unwrap());
        assert!(!h.queue.has_pending(EntityType::Comment, "t9").await.unwrap());

        h.queue.drain().await.unwrap();
        assert!(!h.queue.has_pending(EntityType::Task, "t9").await.unwrap());
    }

    #[tokio::test]
    async fn test_create_without_id_in_response_fails() {
        let h = harness(instant_retry());
        h.queue.enqueue(NewMutation::create(EntityType::Task, "temp-1", "/api/tasks", json!({}))).await.unwrap();
        h.transport.push(Ok(MutationResponse::ok(json!({"ok": true}))));

        let report = h.queue.drain().await.unwrap();
        assert_eq!(report.failed, 1);
        assert!(h.translator.get_real_id("temp-1").is_none());
    }
}
