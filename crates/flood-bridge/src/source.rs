// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Source store abstraction and the Realtime Database REST client.
//!
//! The source is a hierarchical key-value tree: `/<stream>/<entry_key>` holds
//! one raw sensor record. Entry keys are opaque strings ordered
//! lexicographically.

use crate::config::SourceConfig;
use crate::error::{BridgeError, Result};
use crate::live::LiveEvent;
use futures_util::StreamExt;
use reqwest::header::ACCEPT;
use reqwest::Client;
use serde_json::Value;
use std::future::Future;
use std::time::Duration;
use tokio::sync::{mpsc, watch};

/// One raw entry of a stream.
#[derive(Debug, Clone, PartialEq)]
pub struct RawEntry {
    pub key: String,
    pub payload: Value,
}

impl RawEntry {
    pub fn new(key: impl Into<String>, payload: Value) -> Self {
        Self {
            key: key.into(),
            payload,
        }
    }
}

/// Key order of a range read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadDirection {
    /// Keys `>= start`, smallest first.
    Ascending,
    /// Keys `<= start`, largest first.
    Descending,
}

/// Ordered reads over the source tree.
pub trait SourceStore: Send + Sync {
    /// Up to `limit` entries of `stream` starting at `start` (inclusive) in
    /// `direction`. Without `start` the read begins at the first (ascending)
    /// or last (descending) key.
    fn range_read(
        &self,
        stream: &str,
        start: Option<&str>,
        direction: ReadDirection,
        limit: usize,
    ) -> impl Future<Output = Result<Vec<RawEntry>>> + Send;

    /// The `limit` most recent entries of `stream`, ascending.
    fn latest(
        &self,
        stream: &str,
        limit: usize,
    ) -> impl Future<Output = Result<Vec<RawEntry>>> + Send;

    /// Health check (reachability of the source).
    fn health_check(&self) -> impl Future<Output = Result<bool>> + Send {
        async { Ok(true) }
    }
}

/// Why an event stream ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StreamEnd {
    Shutdown,
    ReceiverClosed,
    ServerClosed,
    Revoked,
}

/// Realtime Database REST client.
#[derive(Debug, Clone)]
pub struct FirebaseSource {
    base_url: String,
    auth_token: Option<String>,
    client: Client,
    /// No overall timeout: event streams stay open indefinitely.
    stream_client: Client,
}

impl FirebaseSource {
    /// Create a client; every REST request is bounded by `timeout`.
    pub fn new(config: &SourceConfig, timeout: Duration) -> Result<Self> {
        let client = Client::builder().timeout(timeout).build()?;
        let stream_client = Client::builder().connect_timeout(timeout).build()?;
        Ok(Self {
            base_url: config.url.trim_end_matches('/').to_string(),
            auth_token: config.auth_token.clone().filter(|t| !t.is_empty()),
            client,
            stream_client,
        })
    }

    fn stream_url(&self, stream: &str) -> String {
        format!("{}/{}.json", self.base_url, stream)
    }

    fn auth_params(&self) -> Vec<(&'static str, String)> {
        self.auth_token
            .iter()
            .map(|token| ("auth", token.clone()))
            .collect()
    }

    async fn get_json(&self, url: &str, params: &[(&'static str, String)]) -> Result<Value> {
        let response = self.client.get(url).query(params).send().await?;
        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(BridgeError::Source(format!("GET {} failed: {} - {}", url, status, text)));
        }
        Ok(response.json().await?)
    }

    /// Stream change events for the whole tree into `tx`, reconnecting after
    /// `reconnect_delay` whenever the stream ends, until shutdown or until the
    /// receiver is dropped.
    pub async fn subscribe(
        &self,
        tx: mpsc::Sender<LiveEvent>,
        reconnect_delay: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            if *shutdown.borrow() {
                break;
            }

            match self.stream_events(&tx, &mut shutdown).await {
                Ok(StreamEnd::Shutdown) | Ok(StreamEnd::ReceiverClosed) => break,
                Ok(StreamEnd::ServerClosed) => tracing::info!("event stream closed by server"),
                Ok(StreamEnd::Revoked) => tracing::warn!("event stream cancelled by server"),
                Err(e) => tracing::warn!(error = %e, "event stream failed"),
            }

            tracing::info!(delay = ?reconnect_delay, "reconnecting event stream");
            tokio::select! {
                _ = tokio::time::sleep(reconnect_delay) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
        tracing::info!("event subscription stopped");
    }

    async fn stream_events(
        &self,
        tx: &mpsc::Sender<LiveEvent>,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<StreamEnd> {
        let url = format!("{}/.json", self.base_url);
        let response = self
            .stream_client
            .get(&url)
            .query(&self.auth_params())
            .header(ACCEPT, "text/event-stream")
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            return Err(BridgeError::Source(format!("event stream refused: {}", status)));
        }
        tracing::info!(url = %url, "event stream connected");

        let mut stream = response.bytes_stream();
        let mut decoder = SseDecoder::new();

        loop {
            let chunk = tokio::select! {
                chunk = stream.next() => chunk,
                _ = shutdown.changed() => return Ok(StreamEnd::Shutdown),
            };
            let Some(chunk) = chunk else {
                return Ok(StreamEnd::ServerClosed);
            };

            for frame in decoder.push(&chunk?) {
                let Some(event) = LiveEvent::from_sse(&frame.event, &frame.data) else {
                    continue;
                };
                if event.kind.ends_subscription() {
                    tracing::warn!(kind = ?event.kind, reason = %event.data, "subscription ended");
                    return Ok(StreamEnd::Revoked);
                }
                if event.kind == crate::live::LiveEventKind::KeepAlive {
                    tracing::trace!("keep-alive");
                    continue;
                }
                if tx.send(event).await.is_err() {
                    return Ok(StreamEnd::ReceiverClosed);
                }
            }
        }
    }
}

impl SourceStore for FirebaseSource {
    async fn range_read(
        &self,
        stream: &str,
        start: Option<&str>,
        direction: ReadDirection,
        limit: usize,
    ) -> Result<Vec<RawEntry>> {
        let mut params = self.auth_params();
        params.push(("orderBy", quoted("$key")));
        match direction {
            ReadDirection::Ascending => {
                if let Some(start) = start {
                    params.push(("startAt", quoted(start)));
                }
                params.push(("limitToFirst", limit.to_string()));
            }
            ReadDirection::Descending => {
                if let Some(start) = start {
                    params.push(("endAt", quoted(start)));
                }
                params.push(("limitToLast", limit.to_string()));
            }
        }

        let value = self.get_json(&self.stream_url(stream), &params).await?;
        let mut entries = entries_from_value(stream, value)?;
        if direction == ReadDirection::Descending {
            entries.reverse();
        }
        Ok(entries)
    }

    async fn latest(&self, stream: &str, limit: usize) -> Result<Vec<RawEntry>> {
        let mut params = self.auth_params();
        params.push(("orderBy", quoted("$key")));
        params.push(("limitToLast", limit.to_string()));

        let value = self.get_json(&self.stream_url(stream), &params).await?;
        entries_from_value(stream, value)
    }

    async fn health_check(&self) -> Result<bool> {
        let mut params = self.auth_params();
        params.push(("shallow", "true".to_string()));
        let response = self
            .client
            .get(format!("{}/.json", self.base_url))
            .query(&params)
            .send()
            .await?;
        Ok(response.status().is_success())
    }
}

/// JSON string literal, as the REST query parameters expect.
fn quoted(s: &str) -> String {
    Value::String(s.to_string()).to_string()
}

/// Flatten a stream node into entries sorted ascending by key.
///
/// The REST interface returns arrays for nodes whose keys are all small
/// integers; missing indices come back as `null` and are skipped.
pub fn entries_from_value(stream: &str, value: Value) -> Result<Vec<RawEntry>> {
    let mut entries: Vec<RawEntry> = match value {
        Value::Null => Vec::new(),
        Value::Object(map) => map
            .into_iter()
            .map(|(key, payload)| RawEntry::new(key, payload))
            .collect(),
        Value::Array(items) => items
            .into_iter()
            .enumerate()
            .filter(|(_, payload)| !payload.is_null())
            .map(|(i, payload)| RawEntry::new(i.to_string(), payload))
            .collect(),
        other => {
            return Err(BridgeError::Source(format!(
                "stream {} is not a collection: {}",
                stream, other
            )))
        }
    };
    entries.sort_by(|a, b| a.key.cmp(&b.key));
    Ok(entries)
}

/// One dispatched server-sent event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseFrame {
    pub event: String,
    pub data: String,
}

/// Incremental `text/event-stream` decoder.
///
/// Bytes may arrive split at arbitrary points; complete frames are returned
/// once their terminating blank line has been seen.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buf: Vec<u8>,
    event: Option<String>,
    data: Vec<String>,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk and return the frames it completes.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<SseFrame> {
        self.buf.extend_from_slice(chunk);
        let mut frames = Vec::new();

        while let Some(pos) = self.buf.iter().position(|b| *b == b'\n') {
            let mut line: Vec<u8> = self.buf.drain(..=pos).collect();
            line.pop();
            if line.ends_with(b"\r") {
                line.pop();
            }
            let line = String::from_utf8_lossy(&line);

            if line.is_empty() {
                if !self.data.is_empty() || self.event.is_some() {
                    frames.push(SseFrame {
                        event: self.event.take().unwrap_or_else(|| "message".to_string()),
                        data: std::mem::take(&mut self.data).join("\n"),
                    });
                }
                continue;
            }
            if line.starts_with(':') {
                continue;
            }

            let (field, value) = match line.split_once(':') {
                Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
                None => (&*line, ""),
            };
            match field {
                "event" => self.event = Some(value.to_string()),
                "data" => self.data.push(value.to_string()),
                _ => {}
            }
        }
        frames
    }
}
