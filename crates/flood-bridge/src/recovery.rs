// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Startup cursor recovery.
//!
//! Each stream's resume point is taken from the first tier that yields one:
//!
//! 1. the local cursor snapshot;
//! 2. the newest `fb_key` the sink holds for the stream, within a lookback window;
//! 3. the newest key in the source itself (start after it, no backfill).
//!
//! A failing tier is logged and skipped. When every tier comes up empty the
//! cursor stays unset and the first poll reads the latest page.

use crate::cursor::{CursorMap, CursorStore};
use crate::error::bounded;
use crate::influx::FIELD_SOURCE_KEY;
use crate::sink::{MeasurementSink, TagFilter};
use crate::source::SourceStore;
use std::fmt;
use std::time::Duration;

/// Where a recovered cursor came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryTier {
    LocalFile,
    Sink,
    SourceLatest,
    /// Nothing found; cursor unset.
    Empty,
}

impl fmt::Display for RecoveryTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RecoveryTier::LocalFile => "local file",
            RecoveryTier::Sink => "sink",
            RecoveryTier::SourceLatest => "source latest",
            RecoveryTier::Empty => "empty",
        };
        f.write_str(name)
    }
}

/// Result of recovering one stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Recovered {
    pub cursor: Option<String>,
    pub tier: RecoveryTier,
}

impl Recovered {
    fn new(cursor: Option<String>, tier: RecoveryTier) -> Self {
        Self { cursor, tier }
    }
}

/// Bounds for the remote tiers.
#[derive(Debug, Clone, Copy)]
pub struct RecoveryPolicy {
    /// How far back the sink query looks.
    pub lookback: Duration,
    /// Per-request timeout.
    pub timeout: Duration,
}

impl Default for RecoveryPolicy {
    fn default() -> Self {
        Self {
            lookback: Duration::from_secs(30 * 24 * 60 * 60),
            timeout: Duration::from_secs(10),
        }
    }
}

/// Recover the cursor of one stream.
pub async fn recover_cursor<S, K>(
    stream: &str,
    saved: Option<&str>,
    source: &S,
    sink: &K,
    policy: &RecoveryPolicy,
) -> Recovered
where
    S: SourceStore,
    K: MeasurementSink,
{
    if let Some(saved) = saved.filter(|c| !c.is_empty()) {
        return Recovered::new(Some(saved.to_string()), RecoveryTier::LocalFile);
    }

    let filter = TagFilter::sensor(stream);
    match bounded(
        policy.timeout,
        sink.query_last(&filter, FIELD_SOURCE_KEY, policy.lookback),
    )
    .await
    {
        Ok(Some(key)) if !key.is_empty() => {
            return Recovered::new(Some(key), RecoveryTier::Sink);
        }
        Ok(_) => tracing::debug!(stream, "no recent key in sink"),
        Err(e) => tracing::warn!(stream, error = %e, "sink recovery failed"),
    }

    match bounded(policy.timeout, source.latest(stream, 1)).await {
        Ok(entries) => match entries.into_iter().last() {
            Some(entry) => Recovered::new(Some(entry.key), RecoveryTier::SourceLatest),
            None => Recovered::new(None, RecoveryTier::Empty),
        },
        Err(e) => {
            tracing::warn!(stream, error = %e, "source recovery failed");
            Recovered::new(None, RecoveryTier::Empty)
        }
    }
}

/// Recover every stream and save the seeded snapshot.
///
/// Snapshot entries for streams that are not configured are carried over
/// unchanged. Load and save failures are logged, never fatal.
pub async fn recover_all<S, K, C>(
    streams: &[String],
    store: &C,
    source: &S,
    sink: &K,
    policy: &RecoveryPolicy,
) -> CursorMap
where
    S: SourceStore,
    K: MeasurementSink,
    C: CursorStore,
{
    let mut cursors = match store.load() {
        Ok(cursors) => cursors,
        Err(e) => {
            tracing::warn!(error = %e, "cursor snapshot unreadable, starting without saved state");
            CursorMap::new()
        }
    };

    for stream in streams {
        let saved = cursors.get(stream).cloned();
        let recovered = recover_cursor(stream, saved.as_deref(), source, sink, policy).await;
        match &recovered.cursor {
            Some(cursor) => {
                tracing::info!(stream = %stream, cursor = %cursor, tier = %recovered.tier, "cursor recovered");
                cursors.insert(stream.clone(), cursor.clone());
            }
            None => {
                tracing::info!(stream = %stream, "no cursor found, starting from latest");
                cursors.remove(stream);
            }
        }
    }

    if let Err(e) = store.save(&cursors) {
        tracing::error!(error = %e, "failed to save recovered cursors");
    }
    cursors
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MemoryCursorStore, MemorySink, MemorySource};
    use crate::normalize::Measurement;
    use chrono::Utc;
    use serde_json::json;

    fn stored(sensor: &str, key: &str) -> Measurement {
        Measurement {
            sensor_id: sensor.into(),
            distance_cm: 120,
            battery_voltage: 12.1,
            solar_voltage: 13.9,
            source_key: key.into(),
            timestamp: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_local_cursor_wins() {
        let source = MemorySource::new();
        let sink = MemorySink::new();
        sink.seed(stored("floodmonitor1", "-Sink"));

        let got = recover_cursor("floodmonitor1", Some("-Local"), &source, &sink, &RecoveryPolicy::default()).await;
        assert_eq!(got, Recovered::new(Some("-Local".into()), RecoveryTier::LocalFile));
        assert_eq!(sink.query_count(), 0);
        assert_eq!(source.read_count(), 0);
    }

    #[tokio::test]
    async fn test_sink_recovery_skips_source() {
        let source = MemorySource::new();
        source.insert("floodmonitor2", "-Zz", json!({}));
        let sink = MemorySink::new();
        sink.seed(stored("floodmonitor2", "-Xk9"));

        let got = recover_cursor("floodmonitor2", None, &source, &sink, &RecoveryPolicy::default()).await;
        assert_eq!(got, Recovered::new(Some("-Xk9".into()), RecoveryTier::Sink));
        assert_eq!(source.read_count(), 0);
    }

    #[tokio::test]
    async fn test_source_latest_fallback() {
        let source = MemorySource::new();
        source.insert("LoRaWAN", "-A", json!({}));
        source.insert("LoRaWAN", "-B", json!({}));
        let sink = MemorySink::new();
        sink.fail_next_queries(1);

        let got = recover_cursor("LoRaWAN", None, &source, &sink, &RecoveryPolicy::default()).await;
        assert_eq!(got, Recovered::new(Some("-B".into()), RecoveryTier::SourceLatest));
    }

    #[tokio::test]
    async fn test_all_tiers_empty() {
        let source = MemorySource::new();
        source.fail_next_reads(1);
        let sink = MemorySink::new();

        let got = recover_cursor("floodmonitor1", None, &source, &sink, &RecoveryPolicy::default()).await;
        assert_eq!(got, Recovered::new(None, RecoveryTier::Empty));
        assert_eq!(got.tier.to_string(), "empty");
    }

    #[tokio::test]
    async fn test_recover_all_saves_snapshot() {
        let streams: Vec<String> = vec!["floodmonitor1".into(), "floodmonitor2".into(), "LoRaWAN".into()];
        let mut saved = CursorMap::new();
        saved.insert("floodmonitor1".into(), "-Local".into());
        saved.insert("retired".into(), "-Old".into());
        let store = MemoryCursorStore::with_snapshot(saved);

        let source = MemorySource::new();
        source.insert("LoRaWAN", "-L", json!({}));
        let sink = MemorySink::new();
        sink.seed(stored("floodmonitor2", "-Xk9"));

        let cursors = recover_all(&streams, &store, &source, &sink, &RecoveryPolicy::default()).await;

        assert_eq!(cursors.get("floodmonitor1").map(String::as_str), Some("-Local"));
        assert_eq!(cursors.get("floodmonitor2").map(String::as_str), Some("-Xk9"));
        assert_eq!(cursors.get("LoRaWAN").map(String::as_str), Some("-L"));
        assert_eq!(cursors.get("retired").map(String::as_str), Some("-Old"));
        assert_eq!(store.snapshot(), Some(cursors));
        assert_eq!(store.save_count(), 1);
    }

    #[tokio::test]
    async fn test_recover_all_tolerates_save_failure() {
        let streams = vec!["s".to_string()];
        let store = MemoryCursorStore::new();
        store.set_fail_saves(true);
        let source = MemorySource::new();

        let cursors = recover_all(&streams, &store, &source, &MemorySink::new(), &RecoveryPolicy::default()).await;
        assert!(cursors.is_empty());
        assert_eq!(store.save_count(), 0);
    }
}
