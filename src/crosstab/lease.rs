// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Advisory "active drainer" lease.
//!
//! The lease lives in the shared durable store under [`LEASE_KEY`] as
//! `{tab_id, expires_at}`. A tab may take it when it is absent, expired or
//! already its own. There is no compare-and-swap: two tabs can both believe
//! they hold it for one round, which the per-mutation idempotency key makes
//! harmless.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::model::now_millis;
use crate::storage::{DurableStore, StorageError};

pub const LEASE_KEY: &str = "drainer_lease";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaseRecord {
    pub tab_id: String,
    pub expires_at: i64,
}

pub struct DrainerLease {
    store: Arc<dyn DurableStore>,
    tab_id: String,
    ttl: Duration,
}

impl DrainerLease {
    pub fn new(store: Arc<dyn DurableStore>, tab_id: impl Into<String>, ttl: Duration) -> Self {
        Self { store, tab_id: tab_id.into(), ttl }
    }

    /// Current holder, if the record is present and unexpired.
    pub async fn holder(&self) -> Result<Option<LeaseRecord>, StorageError> {
        let Some(raw) = self.store.get_meta(LEASE_KEY).await? else {
            return Ok(None);
        };
        match serde_json::from_str::<LeaseRecord>(&raw) {
            Ok(record) if record.expires_at > now_millis() => Ok(Some(record)),
            Ok(_) => Ok(None),
            Err(e) => {
                warn!(error = %e, "Ignoring corrupt drainer lease");
                Ok(None)
            }
        }
    }

    /// Take or renew the lease. Returns whether this tab holds it afterwards.
    pub async fn try_acquire(&self) -> Result<bool, StorageError> {
        if let Some(current) = self.holder().await? {
            if current.tab_id != self.tab_id {
                debug!(holder = %current.tab_id, "Drainer lease held by another tab");
                return Ok(false);
            }
        }

        let record = LeaseRecord {
            tab_id: self.tab_id.clone(),
            expires_at: now_millis() + self.ttl.as_millis() as i64,
        };
        let raw = serde_json::to_string(&record).map_err(|e| StorageError::Serialization {
            id: LEASE_KEY.to_string(),
            reason: e.to_string(),
        })?;
        self.store.put_meta(LEASE_KEY, &raw).await?;

        // Read back: a racing tab's write may have landed after ours.
        Ok(self.holder().await?.is_some_and(|r| r.tab_id == self.tab_id))
    }

    /// Give the lease up if this tab holds it.
    pub async fn release(&self) -> Result<(), StorageError> {
        if self.holder().await?.is_some_and(|r| r.tab_id == self.tab_id) {
            self.store.delete_meta(LEASE_KEY).await?;
        }
        Ok(())
    }
}
