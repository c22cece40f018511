// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Configuration for the sync core.
//!
//! # Example
//!
//! ```
//! use task_sync_engine::SyncConfig;
//!
//! // Minimal config (uses defaults)
//! let config = SyncConfig::default();
//! assert_eq!(config.max_mutation_attempts, 5);
//! assert_eq!(config.id_mapping_ttl_days, 7);
//!
//! // Full config
//! let config = SyncConfig {
//!     api_base_url: Some("https://tasks.example.com".into()),
//!     database_url: Some("sqlite://./tasks.db?mode=rwc".into()),
//!     drain_interval_secs: 10,
//!     ..Default::default()
//! };
//! assert_eq!(config.drain_interval().as_secs(), 10);
//! ```

use serde::Deserialize;
use std::time::Duration;

use crate::model::DEFAULT_TEMP_ID_PREFIX;
use crate::resilience::retry::RetryConfig;

/// Configuration for the sync core (client and push server).
///
/// All fields have defaults matching the observed production behaviour.
#[derive(Debug, Clone, Deserialize)]
pub struct SyncConfig {
    /// Base URL for mutation submission and pull sync (e.g. "https://api.example.com")
    #[serde(default)]
    pub api_base_url: Option<String>,

    /// Push channel endpoint (SSE). Defaults to `{api_base_url}/api/events`.
    #[serde(default)]
    pub push_url: Option<String>,

    /// Durable store location (e.g. "sqlite://./sync.db?mode=rwc"). None = in-memory.
    #[serde(default)]
    pub database_url: Option<String>,

    /// Redis for the shared server-side event log. None = per-instance memory log.
    #[serde(default)]
    pub redis_url: Option<String>,

    /// Key prefix for Redis (include trailing colon, e.g. "tasks:")
    #[serde(default)]
    pub redis_prefix: Option<String>,

    #[serde(default = "default_temp_id_prefix")]
    pub temp_id_prefix: String,

    /// Attempts before a mutation is marked failed
    #[serde(default = "default_max_mutation_attempts")]
    pub max_mutation_attempts: u32,
    #[serde(default = "default_mutation_backoff_initial_ms")]
    pub mutation_backoff_initial_ms: u64,
    #[serde(default = "default_mutation_backoff_max_ms")]
    pub mutation_backoff_max_ms: u64,

    /// Periodic drain interval (0 = only on demand)
    #[serde(default = "default_drain_interval_secs")]
    pub drain_interval_secs: u64,

    /// IdMapping retention
    #[serde(default = "default_id_mapping_ttl_days")]
    pub id_mapping_ttl_days: u64,
    #[serde(default = "default_id_mapping_sweep_interval_secs")]
    pub id_mapping_sweep_interval_secs: u64,

    /// Server heartbeat period
    #[serde(default = "default_heartbeat_interval_secs")]
    pub heartbeat_interval_secs: u64,
    /// Server closes and asks for reconnect after this long
    #[serde(default = "default_connection_horizon_secs")]
    pub connection_horizon_secs: u64,
    /// Client reconnects if nothing (not even a ping) arrives within this window
    #[serde(default = "default_client_heartbeat_timeout_secs")]
    pub client_heartbeat_timeout_secs: u64,

    /// Per-user replay log retention
    #[serde(default = "default_event_retention_secs")]
    pub event_retention_secs: u64,
    #[serde(default = "default_event_log_max_per_user")]
    pub event_log_max_per_user: usize,
    /// Outbound frame buffer per push connection
    #[serde(default = "default_push_channel_capacity")]
    pub push_channel_capacity: usize,

    /// Active-drainer lease duration
    #[serde(default = "default_drainer_lease_ms")]
    pub drainer_lease_ms: u64,

    /// Bound on handlers registered under one pub/sub topic
    #[serde(default = "default_max_handlers_per_topic")]
    pub max_handlers_per_topic: usize,

    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

fn default_temp_id_prefix() -> String { DEFAULT_TEMP_ID_PREFIX.to_string() }
fn default_max_mutation_attempts() -> u32 { 5 }
fn default_mutation_backoff_initial_ms() -> u64 { 1_000 }
fn default_mutation_backoff_max_ms() -> u64 { 60_000 }
fn default_drain_interval_secs() -> u64 { 30 }
fn default_id_mapping_ttl_days() -> u64 { 7 }
fn default_id_mapping_sweep_interval_secs() -> u64 { 3_600 }
fn default_heartbeat_interval_secs() -> u64 { 15 }
fn default_connection_horizon_secs() -> u64 { 300 } // 5 min
fn default_client_heartbeat_timeout_secs() -> u64 { 45 }
fn default_event_retention_secs() -> u64 { 600 }
fn default_event_log_max_per_user() -> usize { 1_000 }
fn default_push_channel_capacity() -> usize { 256 }
fn default_drainer_lease_ms() -> u64 { 10_000 }
fn default_max_handlers_per_topic() -> usize { 64 }
fn default_request_timeout_secs() -> u64 { 30 }

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            api_base_url: None,
            push_url: None,
            database_url: None,
            redis_url: None,
            redis_prefix: None,
            temp_id_prefix: default_temp_id_prefix(),
            max_mutation_attempts: default_max_mutation_attempts(),
            mutation_backoff_initial_ms: default_mutation_backoff_initial_ms(),
            mutation_backoff_max_ms: default_mutation_backoff_max_ms(),
            drain_interval_secs: default_drain_interval_secs(),
            id_mapping_ttl_days: default_id_mapping_ttl_days(),
            id_mapping_sweep_interval_secs: default_id_mapping_sweep_interval_secs(),
            heartbeat_interval_secs: default_heartbeat_interval_secs(),
            connection_horizon_secs: default_connection_horizon_secs(),
            client_heartbeat_timeout_secs: default_client_heartbeat_timeout_secs(),
            event_retention_secs: default_event_retention_secs(),
            event_log_max_per_user: default_event_log_max_per_user(),
            push_channel_capacity: default_push_channel_capacity(),
            drainer_lease_ms: default_drainer_lease_ms(),
            max_handlers_per_topic: default_max_handlers_per_topic(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

impl SyncConfig {
    /// Backoff policy for failed mutations (attempt cap included).
    #[must_use]
    pub fn mutation_retry(&self) -> RetryConfig {
        RetryConfig {
            initial_delay: Duration::from_millis(self.mutation_backoff_initial_ms),
            max_delay: Duration::from_millis(self.mutation_backoff_max_ms),
            factor: 2.0,
            max_retries: Some(self.max_mutation_attempts as usize),
        }
    }

    #[must_use]
    pub fn drain_interval(&self) -> Duration {
        Duration::from_secs(self.drain_interval_secs)
    }

    #[must_use]
    pub fn id_mapping_ttl(&self) -> Duration {
        Duration::from_secs(self.id_mapping_ttl_days * 24 * 60 * 60)
    }

    #[must_use]
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    #[must_use]
    pub fn connection_horizon(&self) -> Duration {
        Duration::from_secs(self.connection_horizon_secs)
    }

    #[must_use]
    pub fn client_heartbeat_timeout(&self) -> Duration {
        Duration::from_secs(self.client_heartbeat_timeout_secs)
    }

    #[must_use]
    pub fn event_retention(&self) -> Duration {
        Duration::from_secs(self.event_retention_secs)
    }

    #[must_use]
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Resolved push endpoint, if any URL is configured.
    #[must_use]
    pub fn resolved_push_url(&self) -> Option<String> {
        self.push_url.clone().or_else(|| {
            self.api_base_url
                .as_ref()
                .map(|base| format!("{}/api/events", base.trim_end_matches('/')))
        })
    }
}
