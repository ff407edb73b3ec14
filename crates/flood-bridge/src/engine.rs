// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Incremental polling sync engine.
//!
//! One cycle visits every configured stream in order:
//!
//! ```text
//! fetch (range from cursor | latest page) -> sort -> drop cursor entry
//!       -> normalize -> write batch -> advance cursor -> save snapshot
//! ```
//!
//! The cursor moves only after the sink accepted the batch, so a failed write
//! is retried from the same position next cycle (at-least-once). Errors on
//! one stream never stop the others.

use crate::config::BridgeConfig;
use crate::cursor::{CursorMap, CursorStore};
use crate::error::{bounded, BridgeError, Result};
use crate::normalize::{entry_path, normalize, Measurement};
use crate::recovery::{recover_all, RecoveryPolicy};
use crate::sink::MeasurementSink;
use crate::source::{RawEntry, ReadDirection, SourceStore};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// Result of polling one stream once.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome {
    /// Nothing newer than the cursor.
    UpToDate,
    /// The stream has no entries at all.
    Empty,
    /// New entries were handled and the cursor moved.
    Advanced {
        written: usize,
        dropped: usize,
        cursor: String,
    },
}

/// Engine counters.
#[derive(Debug, Default, Clone)]
pub struct EngineStats {
    /// Completed polling cycles
    pub cycles: u64,
    /// Records accepted by the sink
    pub records_written: u64,
    /// Entries discarded by normalization
    pub records_dropped: u64,
    /// Failed batch writes
    pub write_failures: u64,
    /// Failed source reads
    pub fetch_failures: u64,
    /// Failed snapshot saves
    pub save_failures: u64,
}

/// Engine tuning knobs.
#[derive(Debug, Clone)]
pub struct EngineOptions {
    pub streams: Vec<String>,
    pub page_size: usize,
    pub poll_interval: Duration,
    pub request_timeout: Duration,
    pub recovery: RecoveryPolicy,
}

impl EngineOptions {
    pub fn from_config(config: &BridgeConfig) -> Self {
        Self {
            streams: config.streams.clone(),
            page_size: config.sync.page_size,
            poll_interval: config.sync.poll_interval(),
            request_timeout: config.sync.request_timeout(),
            recovery: RecoveryPolicy {
                lookback: config.sync.recovery_lookback(),
                timeout: config.sync.request_timeout(),
            },
        }
    }
}

/// Polling bridge from a [`SourceStore`] into a [`MeasurementSink`].
pub struct SyncEngine<S, K, C> {
    source: Arc<S>,
    sink: Arc<K>,
    store: C,
    options: EngineOptions,
    cursors: CursorMap,
    stats: EngineStats,
}

impl<S, K, C> SyncEngine<S, K, C>
where
    S: SourceStore,
    K: MeasurementSink,
    C: CursorStore,
{
    /// Create an engine with no cursors; call [`recover`](Self::recover)
    /// before polling to resume from saved or derived state.
    pub fn new(source: Arc<S>, sink: Arc<K>, store: C, options: EngineOptions) -> Self {
        Self {
            source,
            sink,
            store,
            options,
            cursors: CursorMap::new(),
            stats: EngineStats::default(),
        }
    }

    pub fn cursors(&self) -> &CursorMap {
        &self.cursors
    }

    pub fn cursor(&self, stream: &str) -> Option<&str> {
        self.cursors.get(stream).map(String::as_str)
    }

    pub fn stats(&self) -> &EngineStats {
        &self.stats
    }

    pub fn options(&self) -> &EngineOptions {
        &self.options
    }

    /// Seed every stream's cursor (local snapshot, sink, source latest).
    pub async fn recover(&mut self) {
        self.cursors = recover_all(
            &self.options.streams,
            &self.store,
            self.source.as_ref(),
            self.sink.as_ref(),
            &self.options.recovery,
        )
        .await;
    }

    /// Poll one stream once.
    ///
    /// Returns an error when the fetch or the write failed; the cursor is
    /// unchanged in that case.
    pub async fn poll_stream(&mut self, stream: &str) -> Result<PollOutcome> {
        let cursor = self.cursors.get(stream).cloned();

        let fetched = match self.fetch(stream, cursor.as_deref()).await {
            Ok(entries) => entries,
            Err(e) => {
                self.stats.fetch_failures += 1;
                return Err(e);
            }
        };
        if fetched.is_empty() {
            return Ok(PollOutcome::Empty);
        }
        if fetched.len() == 1 && cursor.as_deref() == Some(fetched[0].key.as_str()) {
            return Ok(PollOutcome::UpToDate);
        }

        let fresh = newer_than(fetched, cursor.as_deref());
        let Some(last_key) = fresh.last().map(|e| e.key.clone()) else {
            return Ok(PollOutcome::UpToDate);
        };

        let (batch, dropped) = normalize_entries(stream, &fresh);
        self.stats.records_dropped += dropped as u64;

        if !batch.is_empty() {
            let written = bounded(self.options.request_timeout, self.sink.write_batch(&batch)).await;
            if let Err(e) = written {
                self.stats.write_failures += 1;
                return Err(e);
            }
            self.stats.records_written += batch.len() as u64;
        }

        self.advance(stream, last_key.clone());
        Ok(PollOutcome::Advanced {
            written: batch.len(),
            dropped,
            cursor: last_key,
        })
    }

    async fn fetch(&self, stream: &str, cursor: Option<&str>) -> Result<Vec<RawEntry>> {
        let limit = self.options.page_size;
        let timeout = self.options.request_timeout;
        match cursor {
            // startAt is inclusive; the cursor entry takes one slot of the page.
            Some(cursor) => {
                bounded(
                    timeout,
                    self.source.range_read(
                        stream,
                        Some(cursor),
                        ReadDirection::Ascending,
                        limit.saturating_add(1),
                    ),
                )
                .await
            }
            None => bounded(timeout, self.source.latest(stream, limit)).await,
        }
    }

    /// Move the in-memory cursor and persist the whole map. A failed save
    /// leaves the in-memory cursor advanced; the next successful save
    /// repairs the snapshot.
    fn advance(&mut self, stream: &str, key: String) {
        self.cursors.insert(stream.to_string(), key);
        if let Err(e) = self.store.save(&self.cursors) {
            self.stats.save_failures += 1;
            tracing::error!(stream, error = %e, "failed to save cursor snapshot");
        }
    }

    /// Poll every stream once. Stops early when `shutdown` is set.
    pub async fn run_cycle(&mut self, shutdown: &watch::Receiver<bool>) {
        let streams = self.options.streams.clone();
        for stream in &streams {
            if *shutdown.borrow() {
                return;
            }
            match self.poll_stream(stream).await {
                Ok(PollOutcome::Advanced {
                    written,
                    dropped,
                    cursor,
                }) => {
                    tracing::info!(stream = %stream, count = written, dropped, cursor = %cursor, "synced records");
                }
                Ok(outcome) => tracing::trace!(stream = %stream, ?outcome, "nothing new"),
                Err(e) => log_stream_error(stream, &e),
            }
        }
        self.stats.cycles += 1;
    }

    /// Poll until `shutdown` flips to true (or its sender is dropped).
    pub async fn run(&mut self, mut shutdown: watch::Receiver<bool>) {
        tracing::info!(
            streams = ?self.options.streams,
            interval = ?self.options.poll_interval,
            "sync engine started"
        );

        loop {
            if *shutdown.borrow() {
                break;
            }
            self.run_cycle(&shutdown).await;

            tokio::select! {
                _ = tokio::time::sleep(self.options.poll_interval) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        tracing::info!(
            cycles = self.stats.cycles,
            written = self.stats.records_written,
            dropped = self.stats.records_dropped,
            "sync engine stopped"
        );
    }
}

fn log_stream_error(stream: &str, e: &BridgeError) {
    if e.is_transient() {
        tracing::warn!(stream, error = %e, "stream poll failed, retrying next cycle");
    } else {
        tracing::error!(stream, error = %e, "stream poll failed");
    }
}

/// Sort ascending and keep only keys after `cursor`.
fn newer_than(mut entries: Vec<RawEntry>, cursor: Option<&str>) -> Vec<RawEntry> {
    entries.sort_by(|a, b| a.key.cmp(&b.key));
    entries.dedup_by(|a, b| a.key == b.key);
    match cursor {
        Some(cursor) => entries.into_iter().filter(|e| e.key.as_str() > cursor).collect(),
        None => entries,
    }
}

/// Normalize entries, returning the batch and the number dropped.
fn normalize_entries(stream: &str, entries: &[RawEntry]) -> (Vec<Measurement>, usize) {
    let mut batch = Vec::with_capacity(entries.len());
    let mut dropped = 0;
    for entry in entries {
        let path = entry_path(stream, &entry.key);
        match normalize(&path, &entry.payload) {
            Ok(record) => batch.push(record),
            Err(e) => {
                dropped += 1;
                tracing::warn!(path = %path, error = %e, "dropping malformed entry");
            }
        }
    }
    (batch, dropped)
}
