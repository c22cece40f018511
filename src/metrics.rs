// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Metrics instrumentation for the sync core.
//!
//! Uses the `metrics` crate for backend-agnostic metrics collection.
//! The host process is responsible for choosing the exporter (Prometheus, OTEL, etc.)
//!
//! # Metric Naming Convention
//! - `task_sync_` prefix for all metrics
//! - `_total` suffix for counters
//! - `_seconds` suffix for duration histograms
//!
//! # Labels
//! - `tier`: memory, durable
//! - `entity`: task, list, comment
//! - `outcome`: success, retry, failed, deferred, paused

use metrics::{counter, gauge, histogram};
use std::time::{Duration, Instant};

// ═══════════════════════════════════════════════════════════════════════════
// MUTATION QUEUE
// ═══════════════════════════════════════════════════════════════════════════

/// Record a mutation being written to the outbox
pub fn record_mutation_enqueued(entity: &str, op: &str) {
    counter!(
        "task_sync_mutations_enqueued_total",
        "entity" => entity.to_string(),
        "op" => op.to_string()
    )
    .increment(1);
}

/// Record the outcome of one send attempt
pub fn record_mutation_outcome(entity: &str, outcome: &str) {
    counter!(
        "task_sync_mutation_outcomes_total",
        "entity" => entity.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

/// Round-trip latency of a mutation request
pub fn record_mutation_latency(duration: Duration) {
    histogram!("task_sync_mutation_seconds").record(duration.as_secs_f64());
}

/// Set outbox depth gauges
pub fn set_outbox_depth(pending: usize, failed: usize) {
    gauge!("task_sync_outbox_pending").set(pending as f64);
    gauge!("task_sync_outbox_failed").set(failed as f64);
}

/// Record a completed drain pass
pub fn record_drain(sent: usize, failed: usize, deferred: usize, duration: Duration) {
    counter!("task_sync_drains_total").increment(1);
    counter!("task_sync_drain_sent_total").increment(sent as u64);
    counter!("task_sync_drain_failed_total").increment(failed as u64);
    counter!("task_sync_drain_deferred_total").increment(deferred as u64);
    histogram!("task_sync_drain_seconds").record(duration.as_secs_f64());
}

/// Record a temp→real rewrite applied to queued mutations
pub fn record_id_rewrites(count: usize) {
    counter!("task_sync_id_rewrites_total").increment(count as u64);
}

// ═══════════════════════════════════════════════════════════════════════════
// ID TRANSLATOR
// ═══════════════════════════════════════════════════════════════════════════

pub fn set_id_mappings(count: usize) {
    gauge!("task_sync_id_mappings").set(count as f64);
}

pub fn record_id_mappings_swept(count: u64) {
    counter!("task_sync_id_mappings_swept_total").increment(count);
}

// ═══════════════════════════════════════════════════════════════════════════
// CACHE
// ═══════════════════════════════════════════════════════════════════════════

/// Record a cache lookup (`result`: hit, miss)
pub fn record_cache_lookup(entity: &str, tier: &str, result: &str) {
    counter!(
        "task_sync_cache_lookups_total",
        "entity" => entity.to_string(),
        "tier" => tier.to_string(),
        "result" => result.to_string()
    )
    .increment(1);
}

/// Set memory tier item count for one entity type
pub fn set_cache_items(entity: &str, count: usize) {
    gauge!(
        "task_sync_cache_memory_items",
        "entity" => entity.to_string()
    )
    .set(count as f64);
}

/// Record a memory-tier invalidation (`scope`: entity, type, all)
pub fn record_cache_invalidation(entity: &str, scope: &str) {
    counter!(
        "task_sync_cache_invalidations_total",
        "entity" => entity.to_string(),
        "scope" => scope.to_string()
    )
    .increment(1);
}

// ═══════════════════════════════════════════════════════════════════════════
// CROSS-TAB
// ═══════════════════════════════════════════════════════════════════════════

pub fn record_crosstab_message(direction: &str, event: &str) {
    counter!(
        "task_sync_crosstab_messages_total",
        "direction" => direction.to_string(),
        "event" => event.to_string()
    )
    .increment(1);
}

/// Set whether this tab holds the drainer lease (1 = yes)
pub fn set_active_drainer(active: bool) {
    gauge!("task_sync_active_drainer").set(if active { 1.0 } else { 0.0 });
}

// ═══════════════════════════════════════════════════════════════════════════
// PUSH CHANNEL
// ═══════════════════════════════════════════════════════════════════════════

/// Server side: currently open push connections
pub fn set_push_connections(count: usize) {
    gauge!("task_sync_push_connections").set(count as f64);
}

/// Record frames written to a push connection
pub fn record_push_frame(frame_type: &str) {
    counter!(
        "task_sync_push_frames_total",
        "type" => frame_type.to_string()
    )
    .increment(1);
}

/// Client side: a pushed upsert skipped because a local write is queued
pub fn record_push_frame_held() {
    counter!("task_sync_push_frames_held_total").increment(1);
}

pub fn record_push_replay(count: usize) {
    counter!("task_sync_push_replayed_total").increment(count as u64);
}

/// Client side: a (re)connect attempt (`outcome`: connected, failed)
pub fn record_push_connect(outcome: &str) {
    counter!(
        "task_sync_push_connects_total",
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

pub fn record_event_log_error(backend: &str) {
    counter!(
        "task_sync_event_log_errors_total",
        "backend" => backend.to_string()
    )
    .increment(1);
}

// ═══════════════════════════════════════════════════════════════════════════
// PULL SYNC
// ═══════════════════════════════════════════════════════════════════════════

pub fn record_pull(applied: usize, skipped: usize, success: bool) {
    let status = if success { "success" } else { "failure" };
    counter!(
        "task_sync_pulls_total",
        "status" => status
    )
    .increment(1);

    if success {
        counter!("task_sync_pull_applied_total").increment(applied as u64);
        counter!("task_sync_pull_skipped_total").increment(skipped as u64);
    }
}

pub fn record_sync_duration(duration: Duration) {
    histogram!("task_sync_incremental_sync_seconds").record(duration.as_secs_f64());
}

/// Set client state (for monitoring state machine transitions)
pub fn set_client_state(state: &str) {
    counter!(
        "task_sync_state_transitions_total",
        "state" => state.to_string()
    )
    .increment(1);
}

/// A timing guard that records sync duration on drop
pub struct SyncTimer {
    start: Instant,
}

impl SyncTimer {
    pub fn new() -> Self {
        Self { start: Instant::now() }
    }
}

impl Default for SyncTimer {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for SyncTimer {
    fn drop(&mut self) {
        record_sync_duration(self.start.elapsed());
    }
}
