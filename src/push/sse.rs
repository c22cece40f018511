// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! `text/event-stream` framing for the push channel.
//!
//! Each frame is one SSE message whose `event:` is the frame type and whose
//! `data:` is the JSON frame. The decoder accepts `\n` and `\r\n` line
//! endings, comment lines, and multi-line data, and tolerates chunks split
//! anywhere (including inside a UTF-8 sequence).

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use parking_lot::RwLock;
use reqwest::header::{ACCEPT, CACHE_CONTROL};
use serde_json::Value;
use std::collections::VecDeque;
use std::time::Duration;
use tracing::{debug, warn};

use super::client::{FrameStream, PushTransport};
use super::PushFrame;
use crate::error::SyncError;

/// One dispatched SSE message.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SseMessage {
    pub event: Option<String>,
    pub data: String,
    pub id: Option<String>,
}

impl SseMessage {
    /// Parse the data as a push frame. A frame without a `type` field takes
    /// it from the `event:` line.
    pub fn into_frame(self) -> Result<PushFrame, SyncError> {
        let mut value: Value = serde_json::from_str(&self.data)?;
        if let (Some(event), Some(map)) = (self.event, value.as_object_mut()) {
            map.entry("type").or_insert(Value::String(event));
        }
        Ok(serde_json::from_value(value)?)
    }
}

/// Incremental SSE parser.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: Vec<u8>,
    event: Option<String>,
    data: Vec<String>,
    id: Option<String>,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk and return every message completed by it.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<SseMessage> {
        self.buffer.extend_from_slice(chunk);
        let mut out = Vec::new();

        while let Some(pos) = self.buffer.iter().position(|&b| b == b'\n') {
            let mut line: Vec<u8> = self.buffer.drain(..=pos).collect();
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            let line = String::from_utf8_lossy(&line);
            if let Some(message) = self.process_line(&line) {
                out.push(message);
            }
        }
        out
    }

    /// Bytes held back waiting for a line ending.
    pub fn pending_bytes(&self) -> usize {
        self.buffer.len()
    }

    fn process_line(&mut self, line: &str) -> Option<SseMessage> {
        if line.is_empty() {
            return self.dispatch();
        }
        if line.starts_with(':') {
            return None;
        }

        let (field, value) = match line.split_once(':') {
            Some((f, v)) => (f, v.strip_prefix(' ').unwrap_or(v)),
            None => (line, ""),
        };
        match field {
            "event" => self.event = Some(value.to_string()),
            "data" => self.data.push(value.to_string()),
            "id" => self.id = Some(value.to_string()),
            // retry and unknown fields are ignored
            _ => {}
        }
        None
    }

    fn dispatch(&mut self) -> Option<SseMessage> {
        let event = self.event.take();
        if self.data.is_empty() {
            return None;
        }
        let data = std::mem::take(&mut self.data).join("\n");
        Some(SseMessage { event, data, id: self.id.clone() })
    }
}

/// Render a frame as one SSE message.
pub fn encode_frame(frame: &PushFrame) -> Result<String, SyncError> {
    let json = serde_json::to_string(frame)?;
    Ok(format!("event: {}\nid: {}\ndata: {}\n\n", frame.event_type, frame.timestamp, json))
}

/// reqwest-backed push transport: `GET {url}?since=T` as an event stream.
pub struct SseTransport {
    client: reqwest::Client,
    url: String,
    auth_token: RwLock<Option<String>>,
}

impl SseTransport {
    /// The client has no overall request timeout; a silent stream is caught
    /// by the push client's heartbeat timeout instead.
    pub fn new(url: impl Into<String>, connect_timeout: Duration) -> Result<Self, SyncError> {
        let client = reqwest::Client::builder().connect_timeout(connect_timeout).build()?;
        Ok(Self::with_client(client, url))
    }

    pub fn with_client(client: reqwest::Client, url: impl Into<String>) -> Self {
        Self { client, url: url.into(), auth_token: RwLock::new(None) }
    }

    pub fn set_auth_token(&self, token: Option<String>) {
        *self.auth_token.write() = token;
    }
}

#[async_trait]
impl PushTransport for SseTransport {
    async fn connect(&self, since: Option<i64>) -> Result<Box<dyn FrameStream>, SyncError> {
        let mut builder = self
            .client
            .get(&self.url)
            .header(ACCEPT, "text/event-stream")
            .header(CACHE_CONTROL, "no-cache");
        if let Some(since) = since {
            builder = builder.query(&[("since", since)]);
        }
        if let Some(token) = self.auth_token.read().as_ref() {
            builder = builder.bearer_auth(token);
        }

        let response = builder.send().await?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(SyncError::from_status(status.as_u16(), text));
        }
        debug!(url = %self.url, since, "Event stream opened");

        let bytes = response.bytes_stream().map(|chunk| chunk.map(|b| b.to_vec())).boxed();
        Ok(Box::new(SseStream { bytes, decoder: SseDecoder::new(), ready: VecDeque::new() }))
    }
}

struct SseStream {
    bytes: BoxStream<'static, Result<Vec<u8>, reqwest::Error>>,
    decoder: SseDecoder,
    ready: VecDeque<PushFrame>,
}

#[async_trait]
impl FrameStream for SseStream {
    async fn next_frame(&mut self) -> Result<Option<PushFrame>, SyncError> {
        loop {
            if let Some(frame) = self.ready.pop_front() {
                return Ok(Some(frame));
            }
            match self.bytes.next().await {
                Some(Ok(chunk)) => {
                    for message in self.decoder.feed(&chunk) {
                        match message.into_frame() {
                            Ok(frame) => self.ready.push_back(frame),
                            Err(e) => warn!(error = %e, "Skipping malformed push frame"),
                        }
                    }
                }
                Some(Err(e)) => return Err(e.into()),
                None => return Ok(None),
            }
        }
    }
}
