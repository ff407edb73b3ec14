// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! InfluxDB v2 Line Protocol encoding of canonical measurements.
//!
//! Line Protocol format:
//! ```text
//! measurement,tag1=val1,tag2=val2 field1=val1,field2=val2 timestamp_ns
//! ```
//!
//! The wire names below are the schema dashboards already query, so they stay
//! fixed even though the Rust-side field names are more descriptive.
//!
//! See: <https://docs.influxdata.com/influxdb/v2/reference/syntax/line-protocol/>

use crate::normalize::Measurement;

/// Tag carrying the stream / sensor name.
pub const TAG_SENSOR_ID: &str = "sensor_id";
/// Tag carrying the source entry key. Part of the series key, so two entries
/// of one sensor sharing a timestamp stay distinct points.
pub const TAG_SOURCE_KEY: &str = "source_key";
/// Integer distance field.
pub const FIELD_DISTANCE: &str = "dist_cm";
/// Battery voltage field.
pub const FIELD_BATTERY: &str = "bat_volt";
/// Solar voltage field.
pub const FIELD_SOLAR: &str = "solar_volt";
/// Source entry key, used for cursor recovery.
pub const FIELD_SOURCE_KEY: &str = "fb_key";

/// A value that can be stored in an InfluxDB field.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    /// 64-bit floating point.
    Float(f64),
    /// 64-bit signed integer.
    Integer(i64),
    /// UTF-8 string.
    String(String),
}

impl FieldValue {
    /// Format this value for InfluxDB Line Protocol.
    ///
    /// - Float: written as-is (e.g., `3.14`); whole numbers keep no suffix
    /// - Integer: suffixed with `i` (e.g., `42i`)
    /// - String: quoted with double quotes, inner quotes escaped (e.g., `"hello"`)
    pub fn to_line_protocol(&self) -> String {
        match self {
            FieldValue::Float(v) => format!("{}", v),
            FieldValue::Integer(v) => format!("{}i", v),
            FieldValue::String(v) => {
                let escaped = v.replace('\\', "\\\\").replace('"', "\\\"");
                format!("\"{}\"", escaped)
            }
        }
    }
}

/// InfluxDB v2 Line Protocol writer.
///
/// Accumulates points in an internal buffer and produces Line Protocol strings
/// when flushed.
pub struct LineProtocolWriter {
    buffer: Vec<String>,
}

impl LineProtocolWriter {
    /// Create a new empty writer.
    pub fn new() -> Self {
        Self { buffer: Vec::new() }
    }

    /// Write a single point in Line Protocol format.
    ///
    /// Points without fields are skipped (InfluxDB rejects them).
    pub fn write_point(
        &mut self,
        measurement: &str,
        tags: &[(&str, &str)],
        fields: &[(&str, FieldValue)],
        timestamp_ns: i64,
    ) {
        if fields.is_empty() {
            tracing::debug!(measurement, "skipping point without fields");
            return;
        }

        let mut line = escape_measurement(measurement);

        // Tags sorted by key for canonical form
        let mut sorted_tags: Vec<_> = tags.iter().collect();
        sorted_tags.sort_by_key(|(k, _)| *k);
        for (key, value) in &sorted_tags {
            line.push(',');
            line.push_str(&escape_key(key));
            line.push('=');
            line.push_str(&escape_key(value));
        }

        line.push(' ');

        for (i, (key, value)) in fields.iter().enumerate() {
            if i > 0 {
                line.push(',');
            }
            line.push_str(&escape_key(key));
            line.push('=');
            line.push_str(&value.to_line_protocol());
        }

        line.push(' ');
        line.push_str(&timestamp_ns.to_string());

        self.buffer.push(line);
    }

    /// Write one canonical measurement.
    pub fn write_measurement(&mut self, measurement: &str, record: &Measurement) {
        // Normalization only yields instants in the nanosecond range.
        let timestamp_ns = record.timestamp.timestamp_nanos_opt().unwrap_or_default();
        self.write_point(
            measurement,
            &[
                (TAG_SENSOR_ID, record.sensor_id.as_str()),
                (TAG_SOURCE_KEY, record.source_key.as_str()),
            ],
            &[
                (FIELD_DISTANCE, FieldValue::Integer(record.distance_cm)),
                (FIELD_BATTERY, FieldValue::Float(record.battery_voltage)),
                (FIELD_SOLAR, FieldValue::Float(record.solar_voltage)),
                (FIELD_SOURCE_KEY, FieldValue::String(record.source_key.clone())),
            ],
            timestamp_ns,
        );
    }

    /// Flush the buffer, returning all accumulated lines.
    pub fn flush(&mut self) -> Vec<String> {
        std::mem::take(&mut self.buffer)
    }

    /// Get the current number of buffered lines.
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    /// Check if the buffer is empty.
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }
}

impl Default for LineProtocolWriter {
    fn default() -> Self {
        Self::new()
    }
}

/// Encode a batch of measurements as one newline-separated request body.
pub fn encode_batch(measurement: &str, records: &[Measurement]) -> String {
    let mut writer = LineProtocolWriter::new();
    for record in records {
        writer.write_measurement(measurement, record);
    }
    writer.flush().join("\n")
}

/// Escape measurement name per Line Protocol rules.
/// Spaces and commas must be escaped with backslash.
fn escape_measurement(s: &str) -> String {
    s.replace(',', "\\,").replace(' ', "\\ ")
}

/// Escape tag keys, tag values and field keys.
/// Commas, equals signs, and spaces must be escaped.
fn escape_key(s: &str) -> String {
    s.replace(',', "\\,")
        .replace('=', "\\=")
        .replace(' ', "\\ ")
}
