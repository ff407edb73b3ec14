// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Live event adapter.
//!
//! Push notifications from the source are turned into measurement batches and
//! written through the same [`MeasurementSink`] as the poller. The poll loop
//! remains the only path that moves cursors; live writes rely on the sink
//! overwriting points with the same series and timestamp.
//!
//! ```text
//! FirebaseSource::subscribe --LiveEvent--> run_listener --Vec<Measurement>--> run_writer --> sink
//! ```

use crate::normalize::{entry_path, normalize, Measurement};
use crate::sink::MeasurementSink;
use serde::Deserialize;
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};

/// Kind of a pushed source event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LiveEventKind {
    /// Data at `path` was replaced.
    Put,
    /// Children of `path` were updated.
    Patch,
    /// Heartbeat.
    KeepAlive,
    /// The server cancelled the subscription (e.g. rules changed).
    Cancel,
    /// The credential expired or was revoked.
    AuthRevoked,
}

impl LiveEventKind {
    /// Map a server-sent `event:` name.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "put" => Some(LiveEventKind::Put),
            "patch" => Some(LiveEventKind::Patch),
            "keep-alive" => Some(LiveEventKind::KeepAlive),
            "cancel" => Some(LiveEventKind::Cancel),
            "auth_revoked" => Some(LiveEventKind::AuthRevoked),
            _ => None,
        }
    }

    /// True when the subscription must be re-established.
    pub fn ends_subscription(self) -> bool {
        matches!(self, LiveEventKind::Cancel | LiveEventKind::AuthRevoked)
    }
}

/// One pushed change.
#[derive(Debug, Clone, PartialEq)]
pub struct LiveEvent {
    pub kind: LiveEventKind,
    pub path: String,
    pub data: Value,
}

#[derive(Deserialize)]
struct EventBody {
    path: String,
    #[serde(default)]
    data: Value,
}

impl LiveEvent {
    pub fn new(kind: LiveEventKind, path: impl Into<String>, data: Value) -> Self {
        Self {
            kind,
            path: path.into(),
            data,
        }
    }

    /// Build an event from a server-sent frame.
    ///
    /// `put`/`patch` carry `{"path": .., "data": ..}`; control events carry
    /// free-form data. Unknown event names and undecodable bodies yield `None`.
    pub fn from_sse(event: &str, data: &str) -> Option<Self> {
        let kind = LiveEventKind::from_name(event)?;
        match kind {
            LiveEventKind::Put | LiveEventKind::Patch => {
                match serde_json::from_str::<EventBody>(data) {
                    Ok(body) => Some(Self::new(kind, body.path, body.data)),
                    Err(e) => {
                        tracing::warn!(event, error = %e, "undecodable event body");
                        None
                    }
                }
            }
            _ => {
                let data = serde_json::from_str(data)
                    .unwrap_or_else(|_| Value::String(data.to_string()));
                Some(Self::new(kind, "", data))
            }
        }
    }
}

/// Turn a `put` event into measurements.
///
/// Handled shapes:
/// - path `/`: `{stream: {key: record}}` (initial full-tree delivery)
/// - path `/<stream>`: `{key: record}`
/// - path `/<stream>/<key>`: the record itself
///
/// Non-object children in the first two shapes are skipped. Records that fail
/// normalization are logged and dropped. Other event kinds and deeper paths
/// produce nothing.
pub fn measurements_from_event(event: &LiveEvent) -> Vec<Measurement> {
    if event.kind != LiveEventKind::Put || event.data.is_null() {
        return Vec::new();
    }

    let segments: Vec<&str> = event
        .path
        .trim_matches('/')
        .split('/')
        .filter(|s| !s.is_empty())
        .collect();

    let mut out = Vec::new();
    match segments.as_slice() {
        [] => {
            if let Some(streams) = event.data.as_object() {
                for (stream, entries) in streams {
                    collect_stream(stream, entries, &mut out);
                }
            }
        }
        [stream] => collect_stream(stream, &event.data, &mut out),
        [_, _] => push_normalized(&event.path, &event.data, &mut out),
        _ => {
            tracing::debug!(path = %event.path, "ignoring event below record level");
        }
    }
    out
}

fn collect_stream(stream: &str, entries: &Value, out: &mut Vec<Measurement>) {
    let Some(entries) = entries.as_object() else {
        return;
    };
    for (key, record) in entries {
        if record.is_object() {
            push_normalized(&entry_path(stream, key), record, out);
        }
    }
}

fn push_normalized(path: &str, record: &Value, out: &mut Vec<Measurement>) {
    match normalize(path, record) {
        Ok(m) => out.push(m),
        Err(e) => tracing::warn!(path, error = %e, "dropping live record"),
    }
}

/// Live path counters.
#[derive(Debug, Default)]
pub struct LiveStats {
    pub events: AtomicU64,
    pub batches: AtomicU64,
    pub records_written: AtomicU64,
    pub write_failures: AtomicU64,
}

impl LiveStats {
    pub fn snapshot(&self) -> (u64, u64, u64, u64) {
        (
            self.events.load(Ordering::Relaxed),
            self.batches.load(Ordering::Relaxed),
            self.records_written.load(Ordering::Relaxed),
            self.write_failures.load(Ordering::Relaxed),
        )
    }
}

/// Convert incoming events into batches until shutdown or until either
/// channel closes.
pub async fn run_listener(
    mut events: mpsc::Receiver<LiveEvent>,
    batches: mpsc::Sender<Vec<Measurement>>,
    stats: Arc<LiveStats>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let event = tokio::select! {
            event = events.recv() => match event {
                Some(event) => event,
                None => break,
            },
            _ = shutdown.changed() => break,
        };

        stats.events.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(kind = ?event.kind, path = %event.path, "live event");

        let batch = measurements_from_event(&event);
        if batch.is_empty() {
            continue;
        }
        if batches.send(batch).await.is_err() {
            tracing::debug!("live batch channel closed");
            break;
        }
        stats.batches.fetch_add(1, Ordering::Relaxed);
    }
    tracing::info!("live listener stopped");
}

/// Drain batches into the sink. A failed write is logged and not retried;
/// the poll loop covers the same entries.
pub async fn run_writer<K: MeasurementSink>(
    sink: Arc<K>,
    mut batches: mpsc::Receiver<Vec<Measurement>>,
    stats: Arc<LiveStats>,
) {
    while let Some(batch) = batches.recv().await {
        match sink.write_batch(&batch).await {
            Ok(()) => {
                stats
                    .records_written
                    .fetch_add(batch.len() as u64, Ordering::Relaxed);
                tracing::info!(count = batch.len(), "wrote live records");
            }
            Err(e) => {
                stats.write_failures.fetch_add(1, Ordering::Relaxed);
                if e.is_transient() {
                    tracing::warn!(count = batch.len(), error = %e, "live write failed");
                } else {
                    tracing::error!(count = batch.len(), error = %e, "live write failed");
                }
            }
        }
    }
    tracing::info!("live writer stopped");
}
