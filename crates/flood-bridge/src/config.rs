// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! YAML configuration for the bridge.
//!
//! Credentials can be supplied (or overridden) through the environment so that
//! secrets never have to live in the config file:
//!
//! | Variable              | Field                 |
//! |-----------------------|-----------------------|
//! | `FIREBASE_DB_URL`     | `source.url`          |
//! | `FIREBASE_AUTH_TOKEN` | `source.auth_token`   |
//! | `INFLUX_URL`          | `influxdb.url`        |
//! | `INFLUX_TOKEN`        | `influxdb.token`      |
//! | `INFLUX_ORG`          | `influxdb.org`        |
//! | `INFLUX_BUCKET`       | `influxdb.bucket`     |

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML parse error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Missing required setting: {0}")]
    Missing(&'static str),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Top-level bridge configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BridgeConfig {
    /// Source store connection settings.
    #[serde(default)]
    pub source: SourceConfig,

    /// InfluxDB connection settings.
    #[serde(default)]
    pub influxdb: InfluxDbConfig,

    /// Streams (top-level nodes of the source tree) to relay.
    #[serde(default = "default_streams")]
    pub streams: Vec<String>,

    /// Polling loop tuning.
    #[serde(default)]
    pub sync: SyncConfig,

    /// Live event listener.
    #[serde(default)]
    pub live: LiveConfig,
}

/// Source store (realtime database REST interface) settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SourceConfig {
    /// Database base URL (e.g. "https://my-db.firebaseio.com").
    #[serde(default)]
    pub url: String,

    /// Database secret or ID token, sent as the `auth` query parameter.
    #[serde(default)]
    pub auth_token: Option<String>,
}

/// InfluxDB v2 connection configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InfluxDbConfig {
    /// InfluxDB URL (e.g., "http://localhost:8086").
    #[serde(default)]
    pub url: String,
    /// InfluxDB organization.
    #[serde(default)]
    pub org: String,
    /// InfluxDB bucket.
    #[serde(default)]
    pub bucket: String,
    /// Authentication token.
    #[serde(default)]
    pub token: String,
    /// Measurement the canonical records are written to.
    #[serde(default = "default_measurement")]
    pub measurement: String,
}

impl Default for InfluxDbConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            org: String::new(),
            bucket: String::new(),
            token: String::new(),
            measurement: default_measurement(),
        }
    }
}

/// Polling loop settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Pause between full sweeps over all streams (milliseconds).
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Maximum entries requested per fetch.
    #[serde(default = "default_page_size")]
    pub page_size: usize,

    /// How far back the sink is searched when recovering a cursor (days).
    #[serde(default = "default_recovery_lookback_days")]
    pub recovery_lookback_days: u32,

    /// Upper bound for every source/sink request (milliseconds).
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,

    /// Cursor snapshot file.
    #[serde(default = "default_state_file")]
    pub state_file: PathBuf,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            page_size: default_page_size(),
            recovery_lookback_days: default_recovery_lookback_days(),
            request_timeout_ms: default_request_timeout_ms(),
            state_file: default_state_file(),
        }
    }
}

impl SyncConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn recovery_lookback(&self) -> Duration {
        Duration::from_secs(u64::from(self.recovery_lookback_days) * 24 * 60 * 60)
    }
}

/// Live event listener settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LiveConfig {
    /// Subscribe to push notifications in addition to polling.
    #[serde(default)]
    pub enabled: bool,

    /// Delay before re-opening a dropped event stream (milliseconds).
    #[serde(default = "default_reconnect_delay_ms")]
    pub reconnect_delay_ms: u64,

    /// Capacity of the batch queue between listener and writer.
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
}

impl Default for LiveConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            reconnect_delay_ms: default_reconnect_delay_ms(),
            channel_capacity: default_channel_capacity(),
        }
    }
}

impl LiveConfig {
    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }
}

fn default_streams() -> Vec<String> {
    vec![
        "floodmonitor1".to_string(),
        "floodmonitor2".to_string(),
        "LoRaWAN".to_string(),
    ]
}

fn default_measurement() -> String {
    "sensor_reading".to_string()
}

fn default_poll_interval_ms() -> u64 {
    1000
}

fn default_page_size() -> usize {
    100
}

fn default_recovery_lookback_days() -> u32 {
    30
}

fn default_request_timeout_ms() -> u64 {
    10_000
}

fn default_state_file() -> PathBuf {
    PathBuf::from("bridge_state.json")
}

fn default_reconnect_delay_ms() -> u64 {
    5000
}

fn default_channel_capacity() -> usize {
    64
}

impl BridgeConfig {
    /// Parse configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigError> {
        let config: BridgeConfig = serde_yaml::from_str(yaml)?;
        Ok(config)
    }

    /// Parse configuration from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    /// Configuration with built-in defaults and no credentials.
    pub fn defaults() -> Self {
        Self {
            streams: default_streams(),
            ..Default::default()
        }
    }

    /// Overlay credentials from the process environment.
    pub fn apply_env(&mut self) {
        self.apply_overrides(|name| std::env::var(name).ok());
    }

    /// Overlay credentials from an arbitrary lookup (the environment in production).
    ///
    /// Empty values are ignored.
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        if let Some(v) = get("FIREBASE_DB_URL") {
            self.source.url = v;
        }
        if let Some(v) = get("FIREBASE_AUTH_TOKEN") {
            self.source.auth_token = Some(v);
        }
        if let Some(v) = get("INFLUX_URL") {
            self.influxdb.url = v;
        }
        if let Some(v) = get("INFLUX_TOKEN") {
            self.influxdb.token = v;
        }
        if let Some(v) = get("INFLUX_ORG") {
            self.influxdb.org = v;
        }
        if let Some(v) = get("INFLUX_BUCKET") {
            self.influxdb.bucket = v;
        }
    }

    /// Validate the configuration. Any error here is fatal at startup.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.source.url.trim().is_empty() {
            return Err(ConfigError::Missing("source.url (FIREBASE_DB_URL)"));
        }
        if self.influxdb.url.trim().is_empty() {
            return Err(ConfigError::Missing("influxdb.url (INFLUX_URL)"));
        }
        if self.influxdb.token.trim().is_empty() {
            return Err(ConfigError::Missing("influxdb.token (INFLUX_TOKEN)"));
        }
        if self.influxdb.org.trim().is_empty() {
            return Err(ConfigError::Missing("influxdb.org (INFLUX_ORG)"));
        }
        if self.influxdb.bucket.trim().is_empty() {
            return Err(ConfigError::Missing("influxdb.bucket (INFLUX_BUCKET)"));
        }
        if self.influxdb.measurement.trim().is_empty() {
            return Err(ConfigError::Invalid("Empty measurement name".into()));
        }

        if self.streams.is_empty() {
            return Err(ConfigError::Invalid("No streams configured".into()));
        }
        let mut seen = HashSet::new();
        for stream in &self.streams {
            if stream.is_empty() || stream.contains('/') {
                return Err(ConfigError::Invalid(format!(
                    "Stream name {:?} must be a single non-empty path segment",
                    stream
                )));
            }
            if !seen.insert(stream.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "Stream {} is listed twice",
                    stream
                )));
            }
        }

        if self.sync.page_size == 0 {
            return Err(ConfigError::Invalid("sync.page_size must be > 0".into()));
        }
        if self.sync.poll_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "sync.poll_interval_ms must be > 0".into(),
            ));
        }
        if self.sync.request_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "sync.request_timeout_ms must be > 0".into(),
            ));
        }
        if self.live.enabled && self.live.channel_capacity == 0 {
            return Err(ConfigError::Invalid(
                "live.channel_capacity must be > 0".into(),
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    const MINIMAL_YAML: &str = r#"
source:
  url: "https://flood-db.example.com"
influxdb:
  url: "http://localhost:8086"
  org: "myorg"
  bucket: "mybucket"
  token: "mytoken"
"#;

    const FULL_YAML: &str = r#"
source:
  url: "https://flood-db.example.com"
  auth_token: "secret"
influxdb:
  url: "http://influx.example.com:8086"
  org: "example-org"
  bucket: "telemetry"
  token: "test-token-placeholder"
  measurement: "river_level"
streams:
  - gauge_a
  - gauge_b
sync:
  poll_interval_ms: 2500
  page_size: 50
  recovery_lookback_days: 7
  request_timeout_ms: 3000
  state_file: "/var/lib/flood-bridge/state.json"
live:
  enabled: true
  reconnect_delay_ms: 1000
  channel_capacity: 8
"#;

    #[test]
    fn test_config_parse_minimal() {
        let config = BridgeConfig::from_yaml(MINIMAL_YAML).expect("parse minimal yaml");

        assert_eq!(config.source.url, "https://flood-db.example.com");
        assert!(config.source.auth_token.is_none());
        assert_eq!(config.influxdb.bucket, "mybucket");
        assert_eq!(config.influxdb.measurement, "sensor_reading");
        assert_eq!(
            config.streams,
            vec!["floodmonitor1", "floodmonitor2", "LoRaWAN"]
        );
        assert_eq!(config.sync.page_size, 100);
        assert_eq!(config.sync.poll_interval(), Duration::from_secs(1));
        assert_eq!(
            config.sync.recovery_lookback(),
            Duration::from_secs(30 * 86_400)
        );
        assert_eq!(config.sync.state_file, PathBuf::from("bridge_state.json"));
        assert!(!config.live.enabled);
        config.validate().expect("minimal config is valid");
    }

    #[test]
    fn test_config_parse_all_fields() {
        let config = BridgeConfig::from_yaml(FULL_YAML).expect("parse full yaml");

        assert_eq!(config.source.auth_token.as_deref(), Some("secret"));
        assert_eq!(config.influxdb.org, "example-org");
        assert_eq!(config.influxdb.measurement, "river_level");
        assert_eq!(config.streams, vec!["gauge_a", "gauge_b"]);
        assert_eq!(config.sync.poll_interval_ms, 2500);
        assert_eq!(config.sync.page_size, 50);
        assert_eq!(config.sync.recovery_lookback_days, 7);
        assert_eq!(config.sync.request_timeout(), Duration::from_secs(3));
        assert_eq!(
            config.sync.state_file,
            PathBuf::from("/var/lib/flood-bridge/state.json")
        );
        assert!(config.live.enabled);
        assert_eq!(config.live.reconnect_delay(), Duration::from_secs(1));
        assert_eq!(config.live.channel_capacity, 8);
        config.validate().expect("full config is valid");
    }

    #[test]
    fn test_env_overrides_fill_credentials() {
        let env: HashMap<&str, &str> = [
            ("FIREBASE_DB_URL", "https://env-db.example.com"),
            ("INFLUX_URL", "http://influx:8086"),
            ("INFLUX_TOKEN", "env-token"),
            ("INFLUX_ORG", "env-org"),
            ("INFLUX_BUCKET", "env-bucket"),
            ("FIREBASE_AUTH_TOKEN", "   "),
        ]
        .into_iter()
        .collect();

        let mut config = BridgeConfig::defaults();
        assert!(config.validate().is_err());

        config.apply_overrides(|name| env.get(name).map(|v| v.to_string()));

        assert_eq!(config.source.url, "https://env-db.example.com");
        assert_eq!(config.influxdb.token, "env-token");
        // Blank values do not override.
        assert!(config.source.auth_token.is_none());
        config.validate().expect("env-provided credentials are enough");
    }

    #[test]
    fn test_missing_token_is_fatal() {
        let mut config = BridgeConfig::from_yaml(MINIMAL_YAML).unwrap();
        config.influxdb.token.clear();

        match config.validate() {
            Err(ConfigError::Missing(what)) => assert!(what.contains("INFLUX_TOKEN")),
            other => panic!("expected Missing, got {:?}", other),
        }
    }

    #[test]
    fn test_invalid_streams_rejected() {
        let mut config = BridgeConfig::from_yaml(MINIMAL_YAML).unwrap();
        config.streams = vec!["a".into(), "a".into()];
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        config.streams = vec!["a/b".into()];
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        config.streams.clear();
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_zero_page_size_rejected() {
        let mut config = BridgeConfig::from_yaml(MINIMAL_YAML).unwrap();
        config.sync.page_size = 0;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }
}
