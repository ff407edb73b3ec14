// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Raw entry to canonical measurement normalization.
//!
//! Sensors in the field report the same quantity under different names and
//! encodings (`"dist_cm": "R0845"`, `"level": 512`, `"distance": 500.7`, ...).
//! Every logical field is resolved through an ordered list of candidate keys;
//! the first one present with a non-null value wins.
//!
//! Distance is permissive: anything that cannot be read as a number becomes
//! `0` and the record is kept. Voltages are strict: a present value that is
//! neither a number nor a numeric string discards the whole record.
//!
//! Normalization is a pure function of `(path, payload, now)`.

use crate::error::NormalizeError;
use chrono::{DateTime, Utc};
use regex::Regex;
use serde_json::{Map, Value};
use std::sync::OnceLock;

/// Sensor id used when the entry path carries no stream segment.
pub const UNKNOWN_SENSOR: &str = "unknown_sensor";

/// Timestamps at or above this magnitude are milliseconds (1e11 s is year 5138).
pub const MILLIS_THRESHOLD: f64 = 1e11;

/// Payload key holding the reading time.
pub const TIMESTAMP_FIELD: &str = "timestamp";

/// Logical measurement fields resolved through alias probing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogicalField {
    Distance,
    BatteryVoltage,
    SolarVoltage,
}

impl LogicalField {
    /// Candidate payload keys, highest priority first.
    pub const fn aliases(self) -> &'static [&'static str] {
        match self {
            LogicalField::Distance => &["dist_cm", "distance_cm", "ultrasound", "level", "distance"],
            LogicalField::BatteryVoltage => &["bat_volt", "battery_voltage", "battery", "voltage"],
            LogicalField::SolarVoltage => &["solar_volt", "solar_voltage", "solar"],
        }
    }

    pub const fn name(self) -> &'static str {
        match self {
            LogicalField::Distance => "distance_cm",
            LogicalField::BatteryVoltage => "battery_voltage",
            LogicalField::SolarVoltage => "solar_voltage",
        }
    }

    /// First alias present in `payload` with a non-null value.
    pub fn probe(self, payload: &Map<String, Value>) -> Option<&Value> {
        self.aliases()
            .iter()
            .filter_map(|alias| payload.get(*alias))
            .find(|value| !value.is_null())
    }
}

/// Canonical, schema-fixed reading written to the sink.
#[derive(Debug, Clone, PartialEq)]
pub struct Measurement {
    /// Stream the entry was read from (sink tag).
    pub sensor_id: String,
    /// Distance reading in centimetres; 0 when unreadable.
    pub distance_cm: i64,
    /// Battery voltage; 0.0 when absent.
    pub battery_voltage: f64,
    /// Solar panel voltage; 0.0 when absent.
    pub solar_voltage: f64,
    /// Key of the raw entry this record came from.
    pub source_key: String,
    /// Reading time.
    pub timestamp: DateTime<Utc>,
}

/// Normalize a raw entry using the current wall clock as timestamp fallback.
///
/// `path` has the form `/<stream>/<entry_key>`.
pub fn normalize(path: &str, payload: &Value) -> Result<Measurement, NormalizeError> {
    normalize_at(path, payload, Utc::now())
}

/// Normalize a raw entry; `now` is used when the payload carries no usable timestamp.
pub fn normalize_at(
    path: &str,
    payload: &Value,
    now: DateTime<Utc>,
) -> Result<Measurement, NormalizeError> {
    let fields = payload.as_object().ok_or_else(|| NormalizeError::NotAnObject {
        path: path.to_string(),
    })?;

    let (sensor_id, source_key) = split_entry_path(path);

    let distance_cm = LogicalField::Distance
        .probe(fields)
        .map(extract_distance)
        .unwrap_or(0);
    let battery_voltage = extract_voltage(path, LogicalField::BatteryVoltage, fields)?;
    let solar_voltage = extract_voltage(path, LogicalField::SolarVoltage, fields)?;
    let timestamp = fields
        .get(TIMESTAMP_FIELD)
        .and_then(parse_timestamp)
        .unwrap_or(now);

    Ok(Measurement {
        sensor_id: sensor_id.unwrap_or(UNKNOWN_SENSOR).to_string(),
        distance_cm,
        battery_voltage,
        solar_voltage,
        source_key: source_key.to_string(),
        timestamp,
    })
}

/// Split `/<stream>/<entry_key>` into the stream segment (if any) and the last segment.
pub fn split_entry_path(path: &str) -> (Option<&str>, &str) {
    let stream = if path.contains('/') {
        path.split('/').nth(1).filter(|s| !s.is_empty())
    } else {
        None
    };
    let key = path.rsplit('/').next().unwrap_or(path);
    (stream, key)
}

/// Build the entry path for a key under a stream.
pub fn entry_path(stream: &str, key: &str) -> String {
    format!("/{}/{}", stream, key)
}

fn digit_run() -> &'static Regex {
    static DIGITS: OnceLock<Regex> = OnceLock::new();
    DIGITS.get_or_init(|| Regex::new("[0-9]+").expect("digit pattern compiles"))
}

/// Numeric values truncate toward zero; text yields its first digit run.
fn extract_distance(value: &Value) -> i64 {
    match value {
        Value::Number(n) => match n.as_i64() {
            Some(i) => i,
            // `as` truncates toward zero and saturates out-of-range floats.
            None => n.as_f64().map(|f| f.trunc() as i64).unwrap_or(0),
        },
        Value::String(s) => digit_run()
            .find(s)
            .and_then(|m| m.as_str().parse::<i64>().ok())
            .unwrap_or(0),
        _ => 0,
    }
}

fn extract_voltage(
    path: &str,
    field: LogicalField,
    fields: &Map<String, Value>,
) -> Result<f64, NormalizeError> {
    let Some(value) = field.probe(fields) else {
        return Ok(0.0);
    };

    let parsed = match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    };

    match parsed {
        Some(v) if v.is_finite() => Ok(v),
        _ => Err(NormalizeError::NonNumeric {
            path: path.to_string(),
            field: field.name(),
            value: value.to_string(),
        }),
    }
}

/// Seconds or milliseconds since the epoch, as a number or numeric string.
///
/// Instants the sink cannot store (outside the i64-nanosecond range) count as
/// unparseable.
fn parse_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    let raw = match value {
        Value::Number(n) => n.as_f64()?,
        Value::String(s) => s.trim().parse::<f64>().ok()?,
        _ => return None,
    };
    if !raw.is_finite() {
        return None;
    }

    let instant = if raw.abs() >= MILLIS_THRESHOLD {
        if raw.fract() == 0.0 && raw.abs() < i64::MAX as f64 {
            DateTime::from_timestamp_millis(raw as i64)
        } else {
            seconds_to_instant(raw / 1000.0)
        }
    } else {
        seconds_to_instant(raw)
    };
    instant.filter(|dt| dt.timestamp_nanos_opt().is_some())
}

fn seconds_to_instant(secs: f64) -> Option<DateTime<Utc>> {
    let whole = secs.floor();
    if whole.abs() >= i64::MAX as f64 {
        return None;
    }
    let mut seconds = whole as i64;
    // Microsecond resolution keeps float noise out of the stored instant.
    let mut micros = ((secs - whole) * 1e6).round() as u32;
    if micros >= 1_000_000 {
        seconds += 1;
        micros -= 1_000_000;
    }
    DateTime::from_timestamp(seconds, micros * 1000)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn fixed_now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2030, 1, 1, 0, 0, 0).unwrap()
    }

    fn distance_of(payload: Value) -> i64 {
        normalize_at("/s1/k1", &payload, fixed_now())
            .expect("normalize")
            .distance_cm
    }

    #[test]
    fn test_full_record() {
        let payload = json!({
            "dist_cm": "R0845",
            "bat_volt": 12.5,
            "solar_volt": 14.2,
            "timestamp": 1700000000
        });

        let m = normalize_at("/floodmonitor1/-Oa3TR", &payload, fixed_now()).unwrap();

        assert_eq!(
            m,
            Measurement {
                sensor_id: "floodmonitor1".into(),
                distance_cm: 845,
                battery_voltage: 12.5,
                solar_voltage: 14.2,
                source_key: "-Oa3TR".into(),
                timestamp: Utc.with_ymd_and_hms(2023, 11, 14, 22, 13, 20).unwrap(),
            }
        );
    }

    #[test]
    fn test_textual_distance_takes_first_digit_run() {
        assert_eq!(distance_of(json!({"dist_cm": "R0845"})), 845);
        assert_eq!(distance_of(json!({"dist_cm": "MR0152"})), 152);
        assert_eq!(distance_of(json!({"dist_cm": "512"})), 512);
        assert_eq!(distance_of(json!({"dist_cm": "A12B34"})), 12);
    }

    #[test]
    fn test_distance_without_digits_defaults_to_zero() {
        assert_eq!(distance_of(json!({"dist_cm": "Error"})), 0);
        assert_eq!(distance_of(json!({"dist_cm": ""})), 0);
        assert_eq!(distance_of(json!({"bat_volt": 12.0})), 0);
        assert_eq!(distance_of(json!({"dist_cm": true})), 0);
        assert_eq!(distance_of(json!({"dist_cm": {"raw": 5}})), 0);
    }

    #[test]
    fn test_numeric_distance_truncates_toward_zero() {
        assert_eq!(distance_of(json!({"dist_cm": 500})), 500);
        assert_eq!(distance_of(json!({"dist_cm": 500.7})), 500);
        assert_eq!(distance_of(json!({"dist_cm": -3.9})), -3);
    }

    #[test]
    fn test_distance_alias_priority() {
        assert_eq!(distance_of(json!({"distance": 1, "level": 2})), 2);
        assert_eq!(distance_of(json!({"ultrasound": "U300", "distance_cm": 7})), 7);
        // Null does not shadow a lower-priority alias.
        assert_eq!(distance_of(json!({"dist_cm": null, "distance": 42})), 42);
        // A present zero does.
        assert_eq!(distance_of(json!({"dist_cm": 0, "distance": 42})), 0);
    }

    #[test]
    fn test_voltage_aliases_and_defaults() {
        let m = normalize_at(
            "/s/k",
            &json!({"battery": 3.7, "solar_voltage": "5.25"}),
            fixed_now(),
        )
        .unwrap();
        assert_eq!(m.battery_voltage, 3.7);
        assert_eq!(m.solar_voltage, 5.25);

        let m = normalize_at("/s/k", &json!({}), fixed_now()).unwrap();
        assert_eq!(m.battery_voltage, 0.0);
        assert_eq!(m.solar_voltage, 0.0);
        assert_eq!(m.distance_cm, 0);
    }

    #[test]
    fn test_non_numeric_voltage_discards_record() {
        let err = normalize_at("/s/k", &json!({"bat_volt": "low"}), fixed_now()).unwrap_err();
        assert_eq!(
            err,
            NormalizeError::NonNumeric {
                path: "/s/k".into(),
                field: "battery_voltage",
                value: "\"low\"".into(),
            }
        );

        assert!(normalize_at("/s/k", &json!({"solar": [1, 2]}), fixed_now()).is_err());
    }

    #[test]
    fn test_invalid_distance_record_is_kept() {
        let m = normalize_at("/floodmonitor1/123", &json!({"dist_cm": "Error"}), fixed_now())
            .unwrap();
        assert_eq!(m.distance_cm, 0);
        assert_eq!(m.battery_voltage, 0.0);
        assert_eq!(m.solar_voltage, 0.0);
        assert_eq!(m.timestamp, fixed_now());
    }

    #[test]
    fn test_timestamp_seconds_and_strings() {
        let expected = DateTime::from_timestamp(1_700_000_000, 0).unwrap();
        for ts in [json!(1700000000), json!("1700000000"), json!(" 1700000000 ")] {
            let m = normalize_at("/s/k", &json!({"timestamp": ts}), fixed_now()).unwrap();
            assert_eq!(m.timestamp, expected);
        }

        let m = normalize_at("/s/k", &json!({"timestamp": 1700000000.5}), fixed_now()).unwrap();
        assert_eq!(m.timestamp.timestamp_subsec_millis(), 500);
    }

    #[test]
    fn test_timestamp_milliseconds_detected() {
        let m = normalize_at("/s/k", &json!({"timestamp": 1700000000123u64}), fixed_now())
            .unwrap();
        assert_eq!(m.timestamp.timestamp(), 1_700_000_000);
        assert_eq!(m.timestamp.timestamp_subsec_millis(), 123);

        // The threshold itself is treated as milliseconds.
        let m = normalize_at("/s/k", &json!({"timestamp": 1e11}), fixed_now()).unwrap();
        assert_eq!(m.timestamp.timestamp(), 100_000_000);

        // Just below is read as seconds, which lands past what the sink can store.
        let m = normalize_at("/s/k", &json!({"timestamp": 99_999_999_999u64}), fixed_now())
            .unwrap();
        assert_eq!(m.timestamp, fixed_now());

        let m = normalize_at("/s/k", &json!({"timestamp": 4_102_444_800u64}), fixed_now())
            .unwrap();
        assert_eq!(m.timestamp, Utc.with_ymd_and_hms(2100, 1, 1, 0, 0, 0).unwrap());
    }

    #[test]
    fn test_unparseable_timestamp_uses_now() {
        for ts in [json!("yesterday"), json!(null), json!(true), json!({"s": 1})] {
            let m = normalize_at("/s/k", &json!({"timestamp": ts}), fixed_now()).unwrap();
            assert_eq!(m.timestamp, fixed_now());
        }
    }

    #[test]
    fn test_non_object_payload_fails() {
        for payload in [json!(42), json!("R0845"), json!([1, 2]), json!(null)] {
            let err = normalize_at("/s/k", &payload, fixed_now()).unwrap_err();
            assert_eq!(err, NormalizeError::NotAnObject { path: "/s/k".into() });
        }
    }

    #[test]
    fn test_sensor_id_from_path() {
        assert_eq!(split_entry_path("/floodmonitor1/-Oa3TR"), (Some("floodmonitor1"), "-Oa3TR"));
        assert_eq!(split_entry_path("floodmonitor1/-Oa3TR"), (Some("-Oa3TR"), "-Oa3TR"));
        assert_eq!(split_entry_path("-Oa3TR"), (None, "-Oa3TR"));
        assert_eq!(split_entry_path("//k"), (None, "k"));

        let m = normalize_at("-Oa3TR", &json!({}), fixed_now()).unwrap();
        assert_eq!(m.sensor_id, UNKNOWN_SENSOR);
        assert_eq!(m.source_key, "-Oa3TR");
    }

    #[test]
    fn test_entry_path_roundtrips_through_split() {
        let path = entry_path("LoRaWAN", "-Nx1");
        assert_eq!(path, "/LoRaWAN/-Nx1");
        assert_eq!(split_entry_path(&path), (Some("LoRaWAN"), "-Nx1"));
    }
}
