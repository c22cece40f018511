// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Client lifecycle management: start, maintenance loop, shutdown.

use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::crosstab::{CrossTabEvent, CrossTabMessage};
use crate::error::SyncError;
use crate::metrics;
use crate::model::EntityType;
use crate::push::ConnectionState;
use crate::sync::SyncOptions;

use super::{ClientState, SyncClient};

impl SyncClient {
    /// Bring the client up.
    ///
    /// 1. Load ID mappings into memory
    /// 2. Restore the outbox (interrupted sends go back to pending)
    /// 3. Start the cross-tab listener and wire its events into the cache
    /// 4. Open the push channel
    /// 5. Spawn the maintenance loop (initial sync, periodic drain, mapping
    ///    sweep, resync after a push reconnect)
    #[tracing::instrument(skip(self))]
    pub async fn start(self: &Arc<Self>) -> Result<(), SyncError> {
        if self.state() != ClientState::Created {
            debug!(state = %self.state(), "Client already started");
            return Ok(());
        }
        self.set_state(ClientState::Starting);
        info!(tab_id = %self.crosstab.tab_id(), "Starting sync client");

        let mappings = self.translator.load().await?;
        let outbox = self.queue.restore().await?;
        info!(mappings, pending = outbox.pending, failed = outbox.failed, "Local state restored");

        self.crosstab.start();
        self.wire_cross_tab()?;

        if let Some(push) = &self.push {
            push.start();
        }

        let handle = tokio::spawn(maintenance_loop(
            Arc::downgrade(self),
            self.stop.subscribe(),
            self.push.as_ref().map(|p| p.watch_state()),
            self.config.drain_interval(),
            Duration::from_secs(self.config.id_mapping_sweep_interval_secs.max(1)),
        ));
        self.tasks.lock().push(handle);

        self.set_state(ClientState::Running);
        info!("Sync client running");
        Ok(())
    }

    /// Stop background work, close the push channel and release the drainer
    /// lease. Durable state (outbox, mappings, entities) is left as is.
    #[tracing::instrument(skip(self))]
    pub async fn shutdown(&self) {
        if matches!(self.state(), ClientState::ShuttingDown | ClientState::Stopped) {
            return;
        }
        info!("Initiating sync client shutdown...");
        self.set_state(ClientState::ShuttingDown);

        self.stop.send_replace(true);
        let tasks: Vec<_> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            let _ = task.await;
        }

        if let Some(push) = &self.push {
            push.shutdown().await;
        }
        self.subscriptions.lock().clear();
        if let Err(e) = self.crosstab.shutdown().await {
            warn!(error = %e, "Could not release drainer lease");
        }

        self.set_state(ClientState::Stopped);
        info!("Sync client shutdown complete");
    }

    /// Other tabs' outcomes: reconcile mapped temp IDs, and drop memory
    /// entries another tab changed so the next read comes from the shared
    /// durable store.
    fn wire_cross_tab(self: &Arc<Self>) -> Result<(), SyncError> {
        let mut subs = self.subscriptions.lock();

        let this = Arc::downgrade(self);
        subs.push(
            self.crosstab
                .subscribe_to_events(&[CrossTabEvent::CacheUpdated, CrossTabEvent::EntityDeleted], move |m| {
                    if let (Some(client), Some(entity), Some(id)) = (this.upgrade(), m.entity, m.entity_id.as_deref()) {
                        client.cache.invalidate_entity(entity, Some(id));
                    }
                })
                .map_err(|e| SyncError::Validation(e.to_string()))?,
        );

        let this = Arc::downgrade(self);
        subs.push(
            self.crosstab
                .subscribe_to_events(&[CrossTabEvent::MutationSynced], move |m| {
                    if let Some((entity, temp_id, real_id)) = synced_mapping(m) {
                        let this = this.clone();
                        tokio::spawn(async move {
                            if let Some(client) = this.upgrade() {
                                client.apply_remote_mapping(entity, &temp_id, &real_id).await;
                            }
                        });
                    }
                })
                .map_err(|e| SyncError::Validation(e.to_string()))?,
        );
        Ok(())
    }

    async fn apply_remote_mapping(&self, entity: EntityType, temp_id: &str, real_id: &str) {
        if let Err(e) = self.translator.save_mapping(temp_id, real_id, entity).await {
            warn!(temp_id, real_id, error = %e, "Could not record mapping from another tab");
            return;
        }
        if let Err(e) = self.cache.reconcile_temp_id(entity, temp_id, real_id, None).await {
            warn!(temp_id, real_id, error = %e, "Could not reconcile mapping from another tab");
        }
    }

    pub(super) async fn drain_quietly(&self) {
        match self.queue.drain().await {
            Ok(report) if report.sent + report.failed > 0 => {
                debug!(sent = report.sent, failed = report.failed, "Periodic drain");
            }
            Ok(_) => {}
            Err(e) => warn!(error = %e, "Periodic drain failed"),
        }
    }

    async fn sweep_mappings(&self) {
        match self.translator.clear_old_mappings(self.config.id_mapping_ttl()).await {
            Ok(0) => {}
            Ok(n) => info!(removed = n, "Expired ID mappings swept"),
            Err(e) => warn!(error = %e, "ID mapping sweep failed"),
        }
    }
}

/// `(entity, temp_id, real_id)` from a `mutation_synced` message for a create.
fn synced_mapping(m: &CrossTabMessage) -> Option<(EntityType, String, String)> {
    let entity = m.entity?;
    let temp_id = m.data.get("temp_id")?.as_str()?.to_string();
    let real_id = m.data.get("real_id")?.as_str()?.to_string();
    Some((entity, temp_id, real_id))
}

/// Wait for the next push connection state change. `None` once the push
/// client is gone; never resolves without one.
async fn connection_changed(rx: &mut Option<watch::Receiver<ConnectionState>>) -> Option<bool> {
    match rx {
        Some(rx) => match rx.changed().await {
            Ok(()) => Some(rx.borrow_and_update().is_connected),
            Err(_) => None,
        },
        None => std::future::pending().await,
    }
}

async fn maintenance_loop(
    client: Weak<SyncClient>,
    mut stop: watch::Receiver<bool>,
    mut push_state: Option<watch::Receiver<ConnectionState>>,
    drain_every: Duration,
    sweep_every: Duration,
) {
    if let Some(c) = client.upgrade() {
        let result = c.sync.perform_incremental_sync(SyncOptions::default()).await;
        if !result.success {
            debug!(error = ?result.error, "Initial sync did not complete");
        }
        c.sweep_mappings().await;
    }

    // drain_interval_secs = 0 disables the periodic drain
    let mut drain_tick = interval(if drain_every.is_zero() { Duration::from_secs(3600 * 24) } else { drain_every });
    drain_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    drain_tick.reset();
    let mut sweep_tick = interval(sweep_every);
    sweep_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    sweep_tick.reset();

    let mut was_connected = push_state.as_ref().is_some_and(|rx| rx.borrow().is_connected);
    let mut connected_once = was_connected;

    loop {
        tokio::select! {
            _ = stop.changed() => break,
            _ = drain_tick.tick(), if !drain_every.is_zero() => {
                let Some(c) = client.upgrade() else { break };
                c.drain_quietly().await;
            }
            _ = sweep_tick.tick() => {
                let Some(c) = client.upgrade() else { break };
                c.sweep_mappings().await;
                metrics::set_id_mappings(c.translator.len());
            }
            changed = connection_changed(&mut push_state) => match changed {
                Some(true) if !was_connected => {
                    was_connected = true;
                    if connected_once {
                        let Some(c) = client.upgrade() else { break };
                        info!("Push channel back, running incremental sync");
                        c.sync.perform_incremental_sync(SyncOptions::default()).await;
                    }
                    connected_once = true;
                }
                Some(connected) => was_connected = connected,
                None => push_state = None,
            },
        }
    }
    debug!("Client maintenance loop stopped");
}
