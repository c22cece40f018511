// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! # Task Sync Engine
//!
//! Local-first synchronization core for a multi-device, multi-tab task
//! manager: works offline, renders optimistic writes instantly, survives
//! reloads, and converges with one authoritative server.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     UI write (optimistic)                    │
//! │  • CacheManager::set → subscribers fire synchronously       │
//! │  • MutationQueue::enqueue → durable outbox                  │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                   (drain, active drainer tab only)
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     Offline Mutation Queue                   │
//! │  • Lineages in parallel, creation order within a lineage    │
//! │  • Temp IDs resolved through the IdTranslator               │
//! │  • Backoff up to 5 attempts, then failed (manual retry)     │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                 (server ack → mapping → reconcile)
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │          Tiered Cache (memory → durable store)               │
//! │  • Per-key versions: a removed entity never resurrects      │
//! │  • Cross-tab broadcast keeps sibling tabs consistent        │
//! └─────────────────────────────────────────────────────────────┘
//!                              ▲
//!            (push frames, replay since=T; incremental pull)
//!                              │
//! ┌─────────────────────────────────────────────────────────────┐
//! │        Push Hub (server) / Push Client / Sync Orchestrator   │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use task_sync_engine::{ClientBackends, EntityType, NoopBroadcaster, SyncClient, SyncConfig};
//! use serde_json::json;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), task_sync_engine::SyncError> {
//!     let config = SyncConfig {
//!         api_base_url: Some("https://tasks.example.com".into()),
//!         database_url: Some("sqlite://./tasks.db?mode=rwc".into()),
//!         ..Default::default()
//!     };
//!     let backends = ClientBackends::from_config(&config, Arc::new(NoopBroadcaster), None).await?;
//!     let client = Arc::new(SyncClient::new(config, backends));
//!     client.start().await?;
//!
//!     // Works offline: returns a temp ID immediately
//!     let list = client.create(EntityType::List, "/api/lists", json!({"name": "Inbox"}), None).await?;
//!     client.create(EntityType::Task, "/api/tasks", json!({"title": "Write docs", "list_id": list}), Some(&list)).await?;
//!
//!     println!("{:?}", client.diagnostics().await?);
//!     client.shutdown().await;
//!     Ok(())
//! }
//! ```
//!
//! ## Modules
//!
//! - [`client`]: [`SyncClient`], the per-tab owner of every component
//! - [`queue`]: Offline Mutation Queue and its HTTP transport
//! - [`id_translator`]: temp → real ID mappings
//! - [`cache`]: generic two-tier cache and the entity [`CacheManager`]
//! - [`crosstab`]: same-origin tab coordination and drainer lease
//! - [`push`]: push hub, push client, event log, SSE framing
//! - [`sync`]: incremental pull orchestrator
//! - [`storage`]: durable store backends (memory, SQLite)
//! - [`resilience`]: retry policies

pub mod cache;
pub mod client;
pub mod config;
pub mod crosstab;
pub mod error;
pub mod id_translator;
pub mod metrics;
pub mod model;
pub mod pubsub;
pub mod push;
pub mod queue;
pub mod resilience;
pub mod storage;
pub mod sync;

pub use cache::{CacheChange, CacheEvent, CacheManager, CacheStats, TieredCache};
pub use client::{ClientBackends, ClientState, DiagnosticStatus, SyncClient};
pub use config::SyncConfig;
pub use crosstab::{Broadcaster, CrossTabCoordinator, CrossTabEvent, CrossTabMessage, NoopBroadcaster, OriginChannel};
pub use error::SyncError;
pub use id_translator::IdTranslator;
pub use model::{
    CachedEntity, ChangeKind, EntityType, HttpMethod, IdMapping, Mutation, MutationOp, MutationStatus, SourceTier,
    SyncEvent,
};
pub use pubsub::{SubscribeError, Subscription, TopicRegistry};
pub use push::{
    ConnectionState, EventFilter, EventLog, HubStatus, InMemoryEventLog, PushClient, PushEventType, PushFrame, PushHub,
    PushHubConfig, RedisEventLog,
};
pub use queue::transport::{HttpTransport, MutationRequest, MutationResponse, MutationTransport};
pub use queue::{DrainReport, MutationQueue, MutationStats, NewMutation};
pub use resilience::retry::RetryConfig;
pub use storage::{DurableStore, StorageError};
pub use sync::{PullBatch, PullSource, SyncOptions, SyncOrchestrator, SyncResult};
