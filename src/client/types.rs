// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Public types for the sync client.

use serde::Serialize;

/// Client lifecycle state.
///
/// Use [`super::SyncClient::state()`] to check the current state or
/// [`super::SyncClient::state_receiver()`] to watch for changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ClientState {
    /// Just created, not yet started
    Created,
    /// Loading mappings, restoring the outbox, wiring channels
    Starting,
    /// Background drain, sweep and push are running
    Running,
    /// Graceful shutdown in progress
    ShuttingDown,
    Stopped,
}

impl ClientState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::ShuttingDown => "shutting_down",
            Self::Stopped => "stopped",
        }
    }
}

impl std::fmt::Display for ClientState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status query for operational visibility.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DiagnosticStatus {
    /// Open push connections held by this client (0 or 1).
    pub active_connections: usize,
    /// Push connections opened since start, reconnects included.
    pub total_connections: u64,
    pub pending: usize,
    pub failed: usize,
}
