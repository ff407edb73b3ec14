// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Time-series sink abstraction and the InfluxDB v2 HTTP implementation.
//!
//! # Implementations
//!
//! - `InfluxSink` -- InfluxDB v2 `/api/v2/write` + Flux `/api/v2/query`
//! - `MemorySink` -- in-process double (see [`crate::mock`])

use crate::config::InfluxDbConfig;
use crate::error::{BridgeError, Result};
use crate::influx::{self, FIELD_DISTANCE, TAG_SENSOR_ID};
use crate::normalize::Measurement;
use reqwest::header::{ACCEPT, AUTHORIZATION, CONTENT_TYPE};
use reqwest::Client;
use std::future::Future;
use std::time::Duration;

/// Equality filter on one tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TagFilter {
    pub key: String,
    pub value: String,
}

impl TagFilter {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }

    /// Filter on the `sensor_id` tag.
    pub fn sensor(sensor_id: impl Into<String>) -> Self {
        Self::new(TAG_SENSOR_ID, sensor_id)
    }
}

/// Destination for canonical measurements.
pub trait MeasurementSink: Send + Sync {
    /// Write a batch in a single call. Either the whole call succeeds or the
    /// caller must assume nothing was written.
    fn write_batch(
        &self,
        records: &[Measurement],
    ) -> impl Future<Output = Result<()>> + Send;

    /// Most recent value of `field` among points matching `filter`, looking
    /// back at most `window`.
    fn query_last(
        &self,
        filter: &TagFilter,
        field: &str,
        window: Duration,
    ) -> impl Future<Output = Result<Option<String>>> + Send;

    /// Number of stored readings matching `filter` within `window`.
    fn count_since(
        &self,
        filter: &TagFilter,
        window: Duration,
    ) -> impl Future<Output = Result<u64>> + Send;

    /// Health check (reachability of the backend).
    fn health_check(&self) -> impl Future<Output = Result<bool>> + Send {
        async { Ok(true) }
    }
}

/// InfluxDB v2 HTTP sink.
#[derive(Debug, Clone)]
pub struct InfluxSink {
    base_url: String,
    org: String,
    bucket: String,
    token: String,
    measurement: String,
    client: Client,
}

impl InfluxSink {
    /// Create a sink; every request is bounded by `timeout`.
    pub fn new(config: &InfluxDbConfig, timeout: Duration) -> Result<Self> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            base_url: config.url.trim_end_matches('/').to_string(),
            org: config.org.clone(),
            bucket: config.bucket.clone(),
            token: config.token.clone(),
            measurement: config.measurement.clone(),
            client,
        })
    }

    pub fn measurement(&self) -> &str {
        &self.measurement
    }

    fn auth_header(&self) -> String {
        format!("Token {}", self.token)
    }

    /// Run a Flux query and return the `_value` column of the first row.
    async fn query_first_value(&self, flux: String) -> Result<Option<String>> {
        let body = serde_json::json!({
            "query": flux,
            "type": "flux",
            "dialect": { "header": true, "annotations": [], "delimiter": "," }
        });

        let response = self
            .client
            .post(format!("{}/api/v2/query", self.base_url))
            .query(&[("org", self.org.as_str())])
            .header(AUTHORIZATION, self.auth_header())
            .header(ACCEPT, "application/csv")
            .json(&body)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(BridgeError::Sink(format!("query failed: {} - {}", status, text)));
        }

        let csv = response.text().await?;
        Ok(first_csv_value(&csv, "_value"))
    }

    fn base_query(&self, filter: &TagFilter, window: Duration) -> String {
        format!(
            "from(bucket: \"{bucket}\")\n  |> range(start: -{secs}s)\n  |> filter(fn: (r) => r[\"_measurement\"] == \"{measurement}\")\n  |> filter(fn: (r) => r[\"{tag}\"] == \"{value}\")",
            bucket = flux_escape(&self.bucket),
            secs = window.as_secs().max(1),
            measurement = flux_escape(&self.measurement),
            tag = flux_escape(&filter.key),
            value = flux_escape(&filter.value),
        )
    }

    /// Newest value of `field` across every series of the filtered sensor.
    /// Each entry key is its own series, so rows are merged and time-sorted
    /// before `last()`.
    fn last_value_query(&self, filter: &TagFilter, field: &str, window: Duration) -> String {
        format!(
            "{}\n  |> filter(fn: (r) => r[\"_field\"] == \"{}\")\n  |> group()\n  |> sort(columns: [\"_time\"])\n  |> last()",
            self.base_query(filter, window),
            flux_escape(field)
        )
    }

    fn count_query(&self, filter: &TagFilter, window: Duration) -> String {
        format!(
            "{}\n  |> filter(fn: (r) => r[\"_field\"] == \"{}\")\n  |> group()\n  |> count()",
            self.base_query(filter, window),
            FIELD_DISTANCE
        )
    }
}

impl MeasurementSink for InfluxSink {
    async fn write_batch(&self, records: &[Measurement]) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }

        let body = influx::encode_batch(&self.measurement, records);
        let response = self
            .client
            .post(format!("{}/api/v2/write", self.base_url))
            .query(&[
                ("org", self.org.as_str()),
                ("bucket", self.bucket.as_str()),
                ("precision", "ns"),
            ])
            .header(AUTHORIZATION, self.auth_header())
            .header(CONTENT_TYPE, "text/plain; charset=utf-8")
            .body(body)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(BridgeError::Sink(format!("write failed: {} - {}", status, text)));
        }

        tracing::debug!(count = records.len(), "wrote batch to InfluxDB");
        Ok(())
    }

    async fn query_last(
        &self,
        filter: &TagFilter,
        field: &str,
        window: Duration,
    ) -> Result<Option<String>> {
        let flux = self.last_value_query(filter, field, window);
        self.query_first_value(flux).await
    }

    async fn count_since(&self, filter: &TagFilter, window: Duration) -> Result<u64> {
        let flux = self.count_query(filter, window);
        let value = self.query_first_value(flux).await?;
        match value {
            None => Ok(0),
            Some(v) => v
                .parse::<u64>()
                .map_err(|_| BridgeError::Sink(format!("unexpected count value: {}", v))),
        }
    }

    async fn health_check(&self) -> Result<bool> {
        let response = self
            .client
            .get(format!("{}/health", self.base_url))
            .send()
            .await?;
        Ok(response.status().is_success())
    }
}

/// Escape a string literal for embedding in a Flux query.
fn flux_escape(s: &str) -> String {
    s.replace('\\', "\\\\").replace('"', "\\\"")
}

/// Value of `column` in the first data row of a Flux CSV response.
///
/// Multiple result tables are separated by blank lines, each with its own
/// header row.
fn first_csv_value(csv: &str, column: &str) -> Option<String> {
    let mut index = None;
    for line in csv.lines() {
        let line = line.trim_end_matches('\r');
        if line.is_empty() {
            index = None;
            continue;
        }
        let cells = split_csv_line(line);
        match index {
            None => index = cells.iter().position(|c| c == column),
            Some(i) => {
                if let Some(value) = cells.into_iter().nth(i) {
                    return Some(value);
                }
            }
        }
    }
    None
}

/// Split one CSV line, honouring double-quoted cells.
fn split_csv_line(line: &str) -> Vec<String> {
    let mut cells = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut chars = line.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '"' if in_quotes && chars.peek() == Some(&'"') => {
                current.push('"');
                chars.next();
            }
            '"' => in_quotes = !in_quotes,
            ',' if !in_quotes => cells.push(std::mem::take(&mut current)),
            _ => current.push(c),
        }
    }
    cells.push(current);
    cells
}
