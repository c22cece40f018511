// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Per-tab sync client.
//!
//! The [`SyncClient`] owns one instance of every component and hands out
//! handles to them:
//! - ID Translator and Tiered Cache Manager over the durable store
//! - Offline Mutation Queue draining through a [`MutationTransport`]
//! - Cross-Tab Coordinator on the origin's [`Broadcaster`]
//! - Push client (optional) and the Data Sync Orchestrator
//!
//! # Lifecycle
//!
//! ```text
//! Created → Starting → Running → ShuttingDown → Stopped
//! ```
//!
//! # Example
//!
//! ```rust,no_run
//! use task_sync_engine::{ClientBackends, ClientState, NoopBroadcaster, SyncClient, SyncConfig};
//! use std::sync::Arc;
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), task_sync_engine::SyncError> {
//! let config = SyncConfig {
//!     api_base_url: Some("https://tasks.example.com".into()),
//!     ..Default::default()
//! };
//! let backends = ClientBackends::from_config(&config, Arc::new(NoopBroadcaster), None).await?;
//! let client = Arc::new(SyncClient::new(config, backends));
//! assert_eq!(client.state(), ClientState::Created);
//!
//! client.start().await?;
//! // ... UI work ...
//! client.shutdown().await;
//! # Ok(())
//! # }
//! ```

mod api;
mod lifecycle;
mod types;

pub use types::{ClientState, DiagnosticStatus};

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::cache::CacheManager;
use crate::config::SyncConfig;
use crate::crosstab::{Broadcaster, CrossTabCoordinator};
use crate::error::SyncError;
use crate::id_translator::IdTranslator;
use crate::pubsub::Subscription;
use crate::push::{PushClient, PushTransport, SseTransport};
use crate::queue::transport::{HttpTransport, MutationTransport};
use crate::queue::MutationQueue;
use crate::resilience::retry::RetryConfig;
use crate::storage::{self, DurableStore};
use crate::sync::{HttpPullSource, PullSource, SyncOrchestrator};

/// The external collaborators a client runs against.
pub struct ClientBackends {
    pub store: Arc<dyn DurableStore>,
    pub broadcaster: Arc<dyn Broadcaster>,
    pub mutations: Arc<dyn MutationTransport>,
    pub pull: Arc<dyn PullSource>,
    /// No push channel: changes from elsewhere arrive through pulls only.
    pub push: Option<Arc<dyn PushTransport>>,
}

impl ClientBackends {
    /// HTTP transports against `api_base_url` and the configured store.
    pub async fn from_config(
        config: &SyncConfig,
        broadcaster: Arc<dyn Broadcaster>,
        auth_token: Option<String>,
    ) -> Result<Self, SyncError> {
        let base = config
            .api_base_url
            .as_deref()
            .ok_or_else(|| SyncError::Validation("api_base_url is required".into()))?;
        let store = storage::open(config.database_url.as_deref()).await?;

        let mutations = HttpTransport::new(base, config.request_timeout())?;
        mutations.set_auth_token(auth_token.clone());
        let pull = HttpPullSource::new(base, config.request_timeout())?;
        pull.set_auth_token(auth_token.clone());

        let push: Option<Arc<dyn PushTransport>> = match config.resolved_push_url() {
            Some(url) => {
                let sse = SseTransport::new(url, config.request_timeout())?;
                sse.set_auth_token(auth_token);
                Some(Arc::new(sse))
            }
            None => None,
        };

        Ok(Self {
            store,
            broadcaster,
            mutations: Arc::new(mutations),
            pull: Arc::new(pull),
            push,
        })
    }
}

/// Per-tab owner of the sync components.
pub struct SyncClient {
    pub(super) config: SyncConfig,
    pub(super) state: watch::Sender<ClientState>,
    pub(super) store: Arc<dyn DurableStore>,
    pub(super) translator: Arc<IdTranslator>,
    pub(super) cache: Arc<CacheManager>,
    pub(super) crosstab: Arc<CrossTabCoordinator>,
    pub(super) queue: Arc<MutationQueue>,
    pub(super) push: Option<Arc<PushClient>>,
    pub(super) sync: Arc<SyncOrchestrator>,
    /// Background maintenance loop
    pub(super) tasks: Mutex<Vec<JoinHandle<()>>>,
    /// Cross-tab wiring, dropped on shutdown
    pub(super) subscriptions: Mutex<Vec<Subscription>>,
    pub(super) stop: watch::Sender<bool>,
}

impl SyncClient {
    pub fn new(config: SyncConfig, backends: ClientBackends) -> Self {
        let ClientBackends { store, broadcaster, mutations, pull, push } = backends;
        let handlers = config.max_handlers_per_topic;
        let prefix = config.temp_id_prefix.clone();

        let translator = Arc::new(IdTranslator::new(store.clone()));
        let cache = Arc::new(CacheManager::new(store.clone(), translator.clone(), handlers, prefix.clone()));
        let crosstab = Arc::new(CrossTabCoordinator::new(
            broadcaster,
            store.clone(),
            Duration::from_millis(config.drainer_lease_ms),
            handlers,
        ));
        let queue = Arc::new(MutationQueue::new(
            store.clone(),
            mutations,
            translator.clone(),
            cache.clone(),
            crosstab.clone(),
            config.mutation_retry(),
            prefix,
        ));
        let push = push.map(|transport| {
            Arc::new(PushClient::new(
                transport,
                cache.clone(),
                config.client_heartbeat_timeout(),
                RetryConfig::reconnect(),
                handlers,
            )
            .with_pending_guard(queue.clone()))
        });
        let sync = Arc::new(SyncOrchestrator::new(store.clone(), cache.clone(), queue.clone(), pull, handlers));

        Self {
            config,
            state: watch::Sender::new(ClientState::Created),
            store,
            translator,
            cache,
            crosstab,
            queue,
            push,
            sync,
            tasks: Mutex::new(Vec::new()),
            subscriptions: Mutex::new(Vec::new()),
            stop: watch::Sender::new(false),
        }
    }

    pub fn state(&self) -> ClientState {
        *self.state.borrow()
    }

    pub fn state_receiver(&self) -> watch::Receiver<ClientState> {
        self.state.subscribe()
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn DurableStore> {
        &self.store
    }

    pub fn translator(&self) -> &Arc<IdTranslator> {
        &self.translator
    }

    pub fn cache(&self) -> &Arc<CacheManager> {
        &self.cache
    }

    pub fn crosstab(&self) -> &Arc<CrossTabCoordinator> {
        &self.crosstab
    }

    pub fn queue(&self) -> &Arc<MutationQueue> {
        &self.queue
    }

    pub fn push(&self) -> Option<&Arc<PushClient>> {
        self.push.as_ref()
    }

    pub fn sync(&self) -> &Arc<SyncOrchestrator> {
        &self.sync
    }

    pub(super) fn set_state(&self, state: ClientState) {
        self.state.send_replace(state);
        crate::metrics::set_client_state(state.as_str());
    }
}
