// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Durable storage backends.
//!
//! - [`memory::InMemoryStore`]: DashMap-backed, process lifetime only
//! - [`sql::SqlStore`]: SQLite via sqlx, survives reloads

pub mod traits;
pub mod memory;
pub mod sql;

use std::sync::Arc;

pub use traits::{DurableStore, StorageError};

/// Open the durable store named by `database_url`, or an in-memory one.
pub async fn open(database_url: Option<&str>) -> Result<Arc<dyn DurableStore>, StorageError> {
    match database_url {
        Some(url) => Ok(Arc::new(sql::SqlStore::new(url).await?)),
        None => Ok(Arc::new(memory::InMemoryStore::new())),
    }
}
