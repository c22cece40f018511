// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Basic task-sync-engine usage example.
//!
//! Demonstrates, entirely in-process:
//! 1. A push hub and a loopback "server" that assigns ids and publishes changes
//! 2. Two devices, each with its own durable store and push connection
//! 3. Offline creates on device A returning temp IDs immediately
//! 4. Draining the outbox: temp IDs become server ids
//! 5. Device B receiving the changes over push
//! 6. Diagnostics, captured metrics and clean shutdown
//!
//! # Run
//!
//! ```bash
//! RUST_LOG=task_sync_engine=debug cargo run --example basic_usage
//! ```

use async_trait::async_trait;
use metrics_util::debugging::{DebugValue, DebuggingRecorder, Snapshotter};
use serde_json::json;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

use task_sync_engine::push::{HubTransport, PushTransport};
use task_sync_engine::storage::memory::InMemoryStore;
use task_sync_engine::{
    ChangeKind, ClientBackends, EntityType, HttpMethod, InMemoryEventLog, MutationRequest, MutationResponse,
    MutationTransport, NoopBroadcaster, PullBatch, PullSource, PushHub, SyncClient, SyncConfig, SyncError,
};

const USER: &str = "demo-user";

/// Stands in for the task API: assigns ids and pushes every change to the
/// user's other devices.
struct LoopbackServer {
    hub: Arc<PushHub>,
    next_id: AtomicU64,
}

#[async_trait]
impl MutationTransport for LoopbackServer {
    async fn send(&self, request: &MutationRequest) -> Result<MutationResponse, SyncError> {
        let mut segments = request.endpoint.trim_start_matches("/api/").split('/');
        let entity = segments
            .next()
            .and_then(EntityType::parse)
            .ok_or_else(|| SyncError::from_status(404, format!("no route for {}", request.endpoint)))?;

        let (kind, id) = match request.method {
            HttpMethod::Post => (ChangeKind::Created, format!("srv-{}", self.next_id.fetch_add(1, Ordering::Relaxed))),
            HttpMethod::Delete => (ChangeKind::Deleted, segments.next().unwrap_or_default().to_string()),
            _ => (ChangeKind::Updated, segments.next().unwrap_or_default().to_string()),
        };

        let mut body = request.body.clone();
        if let Some(map) = body.as_object_mut() {
            map.insert("id".into(), json!(id));
        }
        self.hub.publish_change(USER, entity, kind, &id, body.clone()).await;
        Ok(MutationResponse::ok(body))
    }
}

struct NothingToPull;

#[async_trait]
impl PullSource for NothingToPull {
    async fn pull(&self, since: Option<i64>) -> Result<PullBatch, SyncError> {
        Ok(PullBatch { events: vec![], checkpoint: since.unwrap_or(0) })
    }
}

fn device(hub: &Arc<PushHub>, server: &Arc<LoopbackServer>) -> Arc<SyncClient> {
    let push: Arc<dyn PushTransport> = Arc::new(HubTransport::new(hub.clone(), USER));
    let backends = ClientBackends {
        store: Arc::new(InMemoryStore::new()),
        broadcaster: Arc::new(NoopBroadcaster),
        mutations: server.clone(),
        pull: Arc::new(NothingToPull),
        push: Some(push),
    };
    Arc::new(SyncClient::new(SyncConfig { drain_interval_secs: 0, ..Default::default() }, backends))
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Install metrics recorder (captures everything the engine records)
    let recorder = DebuggingRecorder::new();
    let snapshotter = recorder.snapshotter();
    recorder.install().expect("failed to install metrics recorder");

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .compact()
        .init();

    println!("\n╔═══════════════════════════════════════════════════════════════╗");
    println!("║           task-sync-engine: Basic Usage Example               ║");
    println!("╚═══════════════════════════════════════════════════════════════╝\n");

    // ─────────────────────────────────────────────────────────────────────────
    // 1. Server side: push hub with a replay log, loopback API
    // ─────────────────────────────────────────────────────────────────────────
    let hub = Arc::new(PushHub::new(
        Default::default(),
        Arc::new(InMemoryEventLog::new(Duration::from_secs(600), 1_000)),
    ));
    let server = Arc::new(LoopbackServer { hub: hub.clone(), next_id: AtomicU64::new(1) });

    // ─────────────────────────────────────────────────────────────────────────
    // 2. Two devices
    // ─────────────────────────────────────────────────────────────────────────
    let laptop = device(&hub, &server);
    let phone = device(&hub, &server);
    laptop.start().await?;
    phone.start().await?;
    tokio::time::sleep(Duration::from_millis(100)).await;
    println!("📡 Hub: {}", serde_json::to_string(&hub.status())?);

    // ─────────────────────────────────────────────────────────────────────────
    // 3. Offline writes on the laptop
    // ─────────────────────────────────────────────────────────────────────────
    let list = laptop.create(EntityType::List, "/api/lists", json!({"name": "Groceries"}), None).await?;
    let task = laptop
        .create(EntityType::Task, "/api/tasks", json!({"title": "Oat milk", "list_id": list}), Some(&list))
        .await?;
    println!("\n📝 Created offline: list={list} task={task}");
    println!("   Outbox: {:?}", laptop.mutation_stats().await?);

    // ─────────────────────────────────────────────────────────────────────────
    // 4. Back online: drain
    // ─────────────────────────────────────────────────────────────────────────
    let report = laptop.drain_now().await?;
    println!("\n🚀 Drained: sent={} failed={} deferred={}", report.sent, report.failed, report.deferred);
    if let Some(t) = laptop.get(EntityType::Task, &task).await? {
        println!("   {task} is now {} → {}", t.id, t.payload);
    }

    // ─────────────────────────────────────────────────────────────────────────
    // 5. The phone got it over push
    // ─────────────────────────────────────────────────────────────────────────
    tokio::time::sleep(Duration::from_millis(100)).await;
    println!("\n📱 Phone view:");
    for entity in [EntityType::List, EntityType::Task] {
        for e in phone.list(entity).await? {
            println!("   {} {} = {}", entity, e.id, e.payload);
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // 6. Diagnostics, metrics, shutdown
    // ─────────────────────────────────────────────────────────────────────────
    println!("\n🩺 Laptop diagnostics: {}", serde_json::to_string(&laptop.diagnostics().await?)?);
    println!("\n📊 Metrics:");
    dump_metrics(&snapshotter);

    laptop.shutdown().await;
    phone.shutdown().await;
    println!("\n✅ Shut down: laptop={} phone={}", laptop.state(), phone.state());
    Ok(())
}

/// Print captured counters and gauges, sorted by name.
fn dump_metrics(snapshotter: &Snapshotter) {
    let mut lines = Vec::new();
    for (composite_key, _, _, value) in snapshotter.snapshot().into_vec() {
        let (_, key) = composite_key.into_parts();
        let labels: Vec<_> = key.labels().map(|l| format!("{}={}", l.key(), l.value())).collect();
        let labels = if labels.is_empty() { String::new() } else { format!("{{{}}}", labels.join(",")) };
        let rendered = match value {
            DebugValue::Counter(v) => v.to_string(),
            DebugValue::Gauge(v) => format!("{:.0}", v.into_inner()),
            DebugValue::Histogram(samples) => format!("{} samples", samples.len()),
        };
        lines.push(format!("{}{} = {}", key.name(), labels, rendered));
    }
    lines.sort();
    if lines.is_empty() {
        println!("   └─ (no metrics recorded)");
    }
    for line in lines {
        println!("   └─ {line}");
    }
}
