// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Outbound submission of queued mutations.

use async_trait::async_trait;
use parking_lot::RwLock;
use reqwest::Method;
use serde_json::Value;
use std::time::Duration;
use tracing::debug;

use crate::error::SyncError;
use crate::model::{HttpMethod, Mutation};

/// Header carrying the per-mutation idempotency key.
pub const IDEMPOTENCY_HEADER: &str = "Idempotency-Key";

/// One resource-oriented HTTP call, built from a resolved mutation.
#[derive(Debug, Clone, PartialEq)]
pub struct MutationRequest {
    pub method: HttpMethod,
    pub endpoint: String,
    pub body: Value,
    pub idempotency_key: String,
}

impl From<&Mutation> for MutationRequest {
    fn from(m: &Mutation) -> Self {
        Self {
            method: m.method,
            endpoint: m.endpoint.clone(),
            body: m.body.clone(),
            idempotency_key: m.idempotency_key.clone(),
        }
    }
}

/// Successful server response.
#[derive(Debug, Clone, PartialEq)]
pub struct MutationResponse {
    pub status: u16,
    pub body: Value,
}

impl MutationResponse {
    pub fn ok(body: Value) -> Self {
        Self { status: 200, body }
    }

    /// Canonical id from a create response: `id` at the top level or under
    /// `data`. Numeric ids are stringified.
    pub fn real_id(&self) -> Option<String> {
        let candidate = self.body.get("id").or_else(|| self.body.get("data").and_then(|d| d.get("id")))?;
        match candidate {
            Value::String(s) if !s.is_empty() => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        }
    }

    /// Entity payload for the cache: `data` when the server wraps it.
    pub fn entity_payload(&self) -> Option<Value> {
        match self.body.get("data") {
            Some(data @ Value::Object(_)) => Some(data.clone()),
            _ if self.body.is_object() => Some(self.body.clone()),
            _ => None,
        }
    }
}

#[async_trait]
pub trait MutationTransport: Send + Sync {
    /// Send one request. Non-2xx responses come back as `Err` classified
    /// with [`SyncError::from_status`].
    async fn send(&self, request: &MutationRequest) -> Result<MutationResponse, SyncError>;
}

/// reqwest-backed transport against the task API.
pub struct HttpTransport {
    client: reqwest::Client,
    base_url: String,
    auth_token: RwLock<Option<String>>,
}

impl HttpTransport {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, SyncError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self::with_client(client, base_url))
    }

    pub fn with_client(client: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            auth_token: RwLock::new(None),
        }
    }

    /// Bearer token for subsequent requests (None clears it).
    pub fn set_auth_token(&self, token: Option<String>) {
        *self.auth_token.write() = token;
    }

    fn url(&self, endpoint: &str) -> String {
        if endpoint.starts_with("http://") || endpoint.starts_with("https://") {
            endpoint.to_string()
        } else if endpoint.starts_with('/') {
            format!("{}{}", self.base_url, endpoint)
        } else {
            format!("{}/{}", self.base_url, endpoint)
        }
    }
}

fn method(m: HttpMethod) -> Method {
    match m {
        HttpMethod::Post => Method::POST,
        HttpMethod::Put => Method::PUT,
        HttpMethod::Patch => Method::PATCH,
        HttpMethod::Delete => Method::DELETE,
    }
}

#[async_trait]
impl MutationTransport for HttpTransport {
    async fn send(&self, request: &MutationRequest) -> Result<MutationResponse, SyncError> {
        let url = self.url(&request.endpoint);
        let mut builder = self
            .client
            .request(method(request.method), &url)
            .header(IDEMPOTENCY_HEADER, &request.idempotency_key);
        if let Some(token) = self.auth_token.read().as_ref() {
            builder = builder.bearer_auth(token);
        }
        if !request.body.is_null() {
            builder = builder.json(&request.body);
        }

        let response = builder.send().await?;
        let status = response.status();
        let text = response.text().await?;
        debug!(method = %request.method, url = %url, status = status.as_u16(), "Mutation response");

        if !status.is_success() {
            return Err(SyncError::from_status(status.as_u16(), text));
        }

        let body = if text.trim().is_empty() {
            Value::Null
        } else {
            serde_json::from_str(&text)?
        };
        Ok(MutationResponse { status: status.as_u16(), body })
    }
}
