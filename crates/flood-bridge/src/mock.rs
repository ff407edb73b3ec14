// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! In-memory source and sink for testing without live services.

use crate::error::{BridgeError, Result};
use crate::influx::{FIELD_BATTERY, FIELD_DISTANCE, FIELD_SOLAR, FIELD_SOURCE_KEY, TAG_SENSOR_ID};
use crate::normalize::Measurement;
use crate::sink::{MeasurementSink, TagFilter};
use crate::source::{RawEntry, ReadDirection, SourceStore};
use chrono::Utc;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

pub use crate::cursor::MemoryCursorStore;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Take one unit from a failure budget; true when this call must fail.
fn consume_failure(budget: &Mutex<usize>) -> bool {
    let mut remaining = lock(budget);
    if *remaining > 0 {
        *remaining -= 1;
        true
    } else {
        false
    }
}

// ============================================================================
// Source
// ============================================================================

/// Mock source tree: stream -> key -> payload.
#[derive(Debug, Default)]
pub struct MemorySource {
    streams: Mutex<BTreeMap<String, BTreeMap<String, Value>>>,
    reads: Mutex<usize>,
    failing_reads: Mutex<usize>,
}

impl MemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace an entry.
    pub fn insert(&self, stream: &str, key: &str, payload: Value) {
        lock(&self.streams)
            .entry(stream.to_string())
            .or_default()
            .insert(key.to_string(), payload);
    }

    /// Number of read calls (range reads and latest) so far.
    pub fn read_count(&self) -> usize {
        *lock(&self.reads)
    }

    /// Fail the next `n` read calls with a transient error.
    pub fn fail_next_reads(&self, n: usize) {
        *lock(&self.failing_reads) = n;
    }

    fn begin_read(&self, stream: &str) -> Result<()> {
        *lock(&self.reads) += 1;
        if consume_failure(&self.failing_reads) {
            return Err(BridgeError::Source(format!("{} unreachable", stream)));
        }
        Ok(())
    }
}

impl SourceStore for MemorySource {
    async fn range_read(
        &self,
        stream: &str,
        start: Option<&str>,
        direction: ReadDirection,
        limit: usize,
    ) -> Result<Vec<RawEntry>> {
        self.begin_read(stream)?;
        let streams = lock(&self.streams);
        let Some(entries) = streams.get(stream) else {
            return Ok(Vec::new());
        };

        let to_entry = |(k, v): (&String, &Value)| RawEntry::new(k.clone(), v.clone());
        let out: Vec<RawEntry> = match (direction, start) {
            (ReadDirection::Ascending, Some(start)) => entries
                .range(start.to_string()..)
                .take(limit)
                .map(to_entry)
                .collect(),
            (ReadDirection::Ascending, None) => entries.iter().take(limit).map(to_entry).collect(),
            (ReadDirection::Descending, Some(start)) => entries
                .range(..=start.to_string())
                .rev()
                .take(limit)
                .map(to_entry)
                .collect(),
            (ReadDirection::Descending, None) => {
                entries.iter().rev().take(limit).map(to_entry).collect()
            }
        };
        Ok(out)
    }

    async fn latest(&self, stream: &str, limit: usize) -> Result<Vec<RawEntry>> {
        let mut entries = self
            .range_read(stream, None, ReadDirection::Descending, limit)
            .await?;
        entries.reverse();
        Ok(entries)
    }
}

// ============================================================================
// Sink
// ============================================================================

/// Mock sink keyed by `(sensor_id, source_key)`, the same tags that form the
/// InfluxDB series key, so replays overwrite.
#[derive(Debug, Default)]
pub struct MemorySink {
    points: Mutex<BTreeMap<(String, String), Measurement>>,
    writes: Mutex<usize>,
    queries: Mutex<usize>,
    failing_writes: Mutex<usize>,
    failing_queries: Mutex<usize>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a point directly, without counting a write.
    pub fn seed(&self, record: Measurement) {
        lock(&self.points).insert((record.sensor_id.clone(), record.source_key.clone()), record);
    }

    /// All stored points, ordered by sensor then key.
    pub fn records(&self) -> Vec<Measurement> {
        lock(&self.points).values().cloned().collect()
    }

    /// Stored keys of one sensor, ascending.
    pub fn keys_for(&self, sensor_id: &str) -> Vec<String> {
        lock(&self.points)
            .keys()
            .filter(|(sensor, _)| sensor == sensor_id)
            .map(|(_, key)| key.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        lock(&self.points).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of `write_batch` calls, failed ones included.
    pub fn write_count(&self) -> usize {
        *lock(&self.writes)
    }

    /// Number of `query_last`/`count_since` calls.
    pub fn query_count(&self) -> usize {
        *lock(&self.queries)
    }

    /// Fail the next `n` writes; nothing from a failed write is stored.
    pub fn fail_next_writes(&self, n: usize) {
        *lock(&self.failing_writes) = n;
    }

    /// Fail the next `n` queries.
    pub fn fail_next_queries(&self, n: usize) {
        *lock(&self.failing_queries) = n;
    }

    fn begin_query(&self) -> Result<()> {
        *lock(&self.queries) += 1;
        if consume_failure(&self.failing_queries) {
            return Err(BridgeError::Timeout(Duration::from_secs(10)));
        }
        Ok(())
    }

    /// Points matching `filter` within `window` of now.
    fn matching(&self, filter: &TagFilter, window: Duration) -> Vec<Measurement> {
        if filter.key != TAG_SENSOR_ID {
            return Vec::new();
        }
        let since = chrono::Duration::from_std(window)
            .ok()
            .and_then(|w| Utc::now().checked_sub_signed(w));
        lock(&self.points)
            .values()
            .filter(|m| m.sensor_id == filter.value)
            .filter(|m| since.map_or(true, |since| m.timestamp >= since))
            .cloned()
            .collect()
    }
}

impl MeasurementSink for MemorySink {
    async fn write_batch(&self, records: &[Measurement]) -> Result<()> {
        *lock(&self.writes) += 1;
        if consume_failure(&self.failing_writes) {
            return Err(BridgeError::Sink("503 Service Unavailable".into()));
        }
        let mut points = lock(&self.points);
        for record in records {
            points.insert(
                (record.sensor_id.clone(), record.source_key.clone()),
                record.clone(),
            );
        }
        Ok(())
    }

    async fn query_last(
        &self,
        filter: &TagFilter,
        field: &str,
        window: Duration,
    ) -> Result<Option<String>> {
        self.begin_query()?;
        let last = self
            .matching(filter, window)
            .into_iter()
            .max_by(|a, b| {
                a.timestamp
                    .cmp(&b.timestamp)
                    .then_with(|| a.source_key.cmp(&b.source_key))
            });
        Ok(last.and_then(|m| match field {
            FIELD_SOURCE_KEY => Some(m.source_key),
            FIELD_DISTANCE => Some(m.distance_cm.to_string()),
            FIELD_BATTERY => Some(m.battery_voltage.to_string()),
            FIELD_SOLAR => Some(m.solar_voltage.to_string()),
            _ => None,
        }))
    }

    async fn count_since(&self, filter: &TagFilter, window: Duration) -> Result<u64> {
        self.begin_query()?;
        Ok(self.matching(filter, window).len() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::DateTime;
    use serde_json::json;

    fn reading(sensor: &str, key: &str, secs_ago: i64) -> Measurement {
        Measurement {
            sensor_id: sensor.into(),
            distance_cm: 100,
            battery_voltage: 12.0,
            solar_voltage: 13.0,
            source_key: key.into(),
            timestamp: Utc::now() - chrono::Duration::seconds(secs_ago),
        }
    }

    #[tokio::test]
    async fn test_memory_source_ranges() {
        let source = MemorySource::new();
        for key in ["-A", "-B", "-C", "-D"] {
            source.insert("s", key, json!({"dist_cm": 1}));
        }

        let keys = |entries: Vec<RawEntry>| entries.into_iter().map(|e| e.key).collect::<Vec<_>>();

        let asc = source.range_read("s", Some("-B"), ReadDirection::Ascending, 2).await.unwrap();
        assert_eq!(keys(asc), vec!["-B", "-C"]);

        let desc = source.range_read("s", Some("-C"), ReadDirection::Descending, 2).await.unwrap();
        assert_eq!(keys(desc), vec!["-C", "-B"]);

        let latest = source.latest("s", 2).await.unwrap();
        assert_eq!(keys(latest), vec!["-C", "-D"]);

        assert!(source.latest("missing", 2).await.unwrap().is_empty());
        assert_eq!(source.read_count(), 4);
    }

    #[tokio::test]
    async fn test_memory_source_failure_injection() {
        let source = MemorySource::new();
        source.fail_next_reads(1);
        assert!(source.latest("s", 1).await.is_err());
        assert!(source.latest("s", 1).await.is_ok());
    }

    #[tokio::test]
    async fn test_memory_sink_query_last_and_count() {
        let sink = MemorySink::new();
        sink.seed(reading("floodmonitor2", "-Xk8", 120));
        sink.seed(reading("floodmonitor2", "-Xk9", 60));
        sink.seed(reading("floodmonitor1", "-Zz", 10));
        sink.seed(reading("floodmonitor2", "-Old", 90 * 86_400));

        let filter = TagFilter::sensor("floodmonitor2");
        let month = Duration::from_secs(30 * 86_400);

        let last = sink.query_last(&filter, FIELD_SOURCE_KEY, month).await.unwrap();
        assert_eq!(last.as_deref(), Some("-Xk9"));
        assert_eq!(sink.count_since(&filter, month).await.unwrap(), 2);
        assert_eq!(
            sink.query_last(&TagFilter::sensor("LoRaWAN"), FIELD_SOURCE_KEY, month)
                .await
                .unwrap(),
            None
        );
        assert_eq!(sink.query_count(), 3);
    }

    #[tokio::test]
    async fn test_memory_sink_failed_write_stores_nothing() {
        let sink = MemorySink::new();
        let record = Measurement {
            timestamp: DateTime::from_timestamp(1_700_000_000, 0).unwrap(),
            ..reading("s", "-A", 0)
        };

        sink.fail_next_writes(1);
        assert!(sink.write_batch(&[record.clone()]).await.is_err());
        assert!(sink.is_empty());

        sink.write_batch(&[record.clone()]).await.unwrap();
        sink.write_batch(&[record]).await.unwrap();
        assert_eq!(sink.len(), 1);
        assert_eq!(sink.write_count(), 3);
        assert_eq!(sink.keys_for("s"), vec!["-A"]);
    }
}
