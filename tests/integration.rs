//! Integration Tests for the Sync Core
//!
//! Tests against real backends: SQLite files via tempfile (always run) and
//! Redis via testcontainers (ignored by default).
//!
//! # Running Tests
//! ```bash
//! # SQLite-backed tests only
//! cargo test --test integration
//!
//! # Including Docker-backed Redis tests
//! cargo test --test integration -- --ignored
//! ```

use async_trait::async_trait;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tempfile::tempdir;
use testcontainers::{clients::Cli, core::WaitFor, Container, GenericImage};
use tokio::time::timeout;

use task_sync_engine::model::now_millis;
use task_sync_engine::storage::sql::SqlStore;
use task_sync_engine::{
    ClientBackends, EntityType, EventLog, MutationRequest, MutationResponse, MutationTransport, NoopBroadcaster,
    PullBatch, PullSource, PushEventType, PushFrame, PushHub, RedisEventLog, SourceTier, SyncClient, SyncConfig,
    SyncError,
};

// =============================================================================
// Test Fixtures
// =============================================================================

/// Create a Redis container
fn redis_container(docker: &Cli) -> Container<'_, GenericImage> {
    let image = GenericImage::new("redis", "7-alpine")
        .with_exposed_port(6379)
        .with_wait_for(WaitFor::message_on_stdout("Ready to accept connections"));
    docker.run(image)
}

/// Server that assigns ids from the request endpoint.
struct AssigningServer;

#[async_trait]
impl MutationTransport for AssigningServer {
    async fn send(&self, request: &MutationRequest) -> Result<MutationResponse, SyncError> {
        let mut body = request.body.clone();
        body["id"] = json!(format!("srv{}", request.endpoint.replace('/', "-")));
        Ok(MutationResponse::ok(body))
    }
}

/// Every request fails as if the device were offline.
struct Unreachable;

#[async_trait]
impl MutationTransport for Unreachable {
    async fn send(&self, _: &MutationRequest) -> Result<MutationResponse, SyncError> {
        Err(SyncError::Network("connection refused".into()))
    }
}

struct QuietPull;

#[async_trait]
impl PullSource for QuietPull {
    async fn pull(&self, since: Option<i64>) -> Result<PullBatch, SyncError> {
        Ok(PullBatch { events: vec![], checkpoint: since.unwrap_or(0) })
    }
}

async fn sqlite_client(path: &std::path::Path, transport: Arc<dyn MutationTransport>) -> SyncClient {
    let store = SqlStore::open_path(path).await.expect("open sqlite store");
    let backends = ClientBackends {
        store: Arc::new(store),
        broadcaster: Arc::new(NoopBroadcaster),
        mutations: transport,
        pull: Arc::new(QuietPull),
        push: None,
    };
    SyncClient::new(SyncConfig { drain_interval_secs: 0, ..Default::default() }, backends)
}

// =============================================================================
// Durable Store (SQLite)
// =============================================================================

#[tokio::test]
async fn offline_writes_survive_reload() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("tasks.db");

    let task = {
        let client = sqlite_client(&path, Arc::new(Unreachable)).await;
        let task = client
            .create(EntityType::Task, "/api/tasks", json!({"title": "survive reload"}), None)
            .await
            .unwrap();
        // Offline: the attempt is recorded, the write stays queued
        let report = client.drain_now().await.unwrap();
        assert_eq!(report.retry_scheduled, 1);
        task
    };

    let client = sqlite_client(&path, Arc::new(AssigningServer)).await;
    client.translator().load().await.unwrap();
    let stats = client.queue().restore().await.unwrap();
    assert_eq!(stats.pending, 1);

    // Served from the durable tier after the reload
    let cached = client.get(EntityType::Task, &task).await.unwrap().unwrap();
    assert_eq!(cached.source_tier, SourceTier::Durable);
    assert_eq!(cached.payload["title"], "survive reload");

    let outbox = client.queue().mutations().await.unwrap();
    assert_eq!(outbox[0].retry_count, 1);
    assert!(outbox[0].last_error.as_deref().unwrap().contains("connection refused"));
}

#[tokio::test]
async fn mappings_are_reloaded_and_resolve_old_references() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("tasks.db");

    let temp_list = {
        let client = sqlite_client(&path, Arc::new(AssigningServer)).await;
        let list = client.create(EntityType::List, "/api/lists", json!({"name": "Inbox"}), None).await.unwrap();
        assert_eq!(client.drain_now().await.unwrap().sent, 1);
        list
    };

    let client = sqlite_client(&path, Arc::new(AssigningServer)).await;
    assert_eq!(client.translator().load().await.unwrap(), 1);
    assert_eq!(client.translator().get_real_id(&temp_list).as_deref(), Some("srv-api-lists"));

    // A UI still holding the temp ID keeps working
    let list = client.get(EntityType::List, &temp_list).await.unwrap().unwrap();
    assert_eq!(list.id, "srv-api-lists");
    assert_eq!(list.payload["name"], "Inbox");
}

// =============================================================================
// Shared Event Log (Redis)
// =============================================================================

#[tokio::test]
#[ignore] // Requires Docker
async fn redis_event_log_replays_in_order_and_trims() {
    let docker = Cli::default();
    let redis = redis_container(&docker);
    let url = format!("redis://127.0.0.1:{}", redis.get_host_port_ipv4(6379));

    let log = RedisEventLog::new(&url, Some("test:"), Duration::from_secs(600), 3).await.expect("connect");
    let base = now_millis();

    let mut stamps = Vec::new();
    for offset in [10, 20, 30, 40] {
        let frame = PushFrame::new(PushEventType::TaskUpdated, base + offset, json!({"id": "t1", "n": offset}));
        stamps.push(log.append("u1", frame).await.unwrap().timestamp);
    }
    log.append("u2", PushFrame::new(PushEventType::ListCreated, base, json!({"id": "l1"}))).await.unwrap();
    assert_eq!(stamps, vec![base + 10, base + 20, base + 30, base + 40]);

    // Capped at 3 per user: the oldest frame is gone
    let all: Vec<i64> = log.since("u1", 0).await.unwrap().iter().map(|f| f.timestamp).collect();
    assert_eq!(all, stamps[1..].to_vec());

    // Strictly after the cursor
    let after = log.since("u1", stamps[2]).await.unwrap();
    assert_eq!(after.len(), 1);
    assert_eq!(after[0].data["n"], 40);
    assert_eq!(log.since("u2", 0).await.unwrap().len(), 1);
    assert!(log.since("nobody", 0).await.unwrap().is_empty());
}

#[tokio::test]
#[ignore] // Requires Docker
async fn redis_log_orders_writers_sharing_it() {
    let docker = Cli::default();
    let redis = redis_container(&docker);
    let url = format!("redis://127.0.0.1:{}", redis.get_host_port_ipv4(6379));

    let log_a = RedisEventLog::new(&url, Some("shared:"), Duration::from_secs(600), 100).await.unwrap();
    let log_b = RedisEventLog::new(&url, Some("shared:"), Duration::from_secs(600), 100).await.unwrap();
    let now = now_millis();

    // Both instances propose the same millisecond; the log keeps them apart
    let a = log_a.append("u1", PushFrame::new(PushEventType::TaskUpdated, now, json!({"id": "a"}))).await.unwrap();
    let b = log_b.append("u1", PushFrame::new(PushEventType::TaskUpdated, now, json!({"id": "b"}))).await.unwrap();
    assert!(b.timestamp > a.timestamp);

    // A clock running behind cannot slot in before frames already handed out
    let c = log_a.append("u1", PushFrame::new(PushEventType::TaskUpdated, now - 5, json!({"id": "c"}))).await.unwrap();
    assert!(c.timestamp > b.timestamp);

    let ids: Vec<_> = log_b.since("u1", a.timestamp).await.unwrap().into_iter().map(|f| f.data["id"].clone()).collect();
    assert_eq!(ids, vec![json!("b"), json!("c")]);
}

#[tokio::test]
#[ignore] // Requires Docker
async fn redis_log_lets_another_instance_replay() {
    let docker = Cli::default();
    let redis = redis_container(&docker);
    let url = format!("redis://127.0.0.1:{}", redis.get_host_port_ipv4(6379));

    let log_a = RedisEventLog::new(&url, Some("tasks:"), Duration::from_secs(600), 100).await.unwrap();
    let log_b = RedisEventLog::new(&url, Some("tasks:"), Duration::from_secs(600), 100).await.unwrap();
    let hub_a = Arc::new(PushHub::new(Default::default(), Arc::new(log_a)));
    let hub_b = Arc::new(PushHub::new(Default::default(), Arc::new(log_b)));

    let first = hub_a.publish("u1", PushEventType::TaskCreated, json!({"id": "t1"})).await;
    hub_a.publish("u1", PushEventType::TaskUpdated, json!({"id": "t1", "done": true})).await;

    // The client reconnects to a different instance with its cursor
    let mut conn = hub_b.connect("u1", Some(first.timestamp));
    let connected = timeout(Duration::from_secs(2), conn.next_frame()).await.unwrap().unwrap();
    assert_eq!(connected.event_type, PushEventType::Connected);

    let replayed = timeout(Duration::from_secs(2), conn.next_frame()).await.unwrap().unwrap();
    assert_eq!(replayed.event_type, PushEventType::TaskUpdated);
    assert_eq!(replayed.data["done"], true);
}
