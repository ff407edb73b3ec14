// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Flood sensor bridge
//!
//! Relays sensor readings from a realtime key-value tree into InfluxDB v2.
//!
//! # Features
//!
//! - **Incremental polling**: per-stream cursors, ordered range reads, one
//!   batch write per stream per cycle
//! - **Cursor recovery**: local snapshot, then the sink's newest key, then the
//!   source's newest key
//! - **Normalization**: alias probing for heterogeneous payloads, lossy
//!   distance parsing, seconds/milliseconds timestamp detection
//! - **Live events**: optional server-sent event listener feeding the same sink
//!
//! # Overview
//!
//! ```text
//! SourceStore --RawEntry--> normalize --Measurement--> MeasurementSink
//!      |                                                    |
//!      +---------------- CursorStore (after write) ---------+
//! ```
//!
//! # Quick Start
//!
//! ```bash
//! # Run with a config file
//! flood-bridge --config bridge.yaml
//!
//! # Credentials from the environment, live listener enabled
//! FIREBASE_DB_URL=https://example.firebaseio.com INFLUX_URL=http://localhost:8086 \
//! INFLUX_TOKEN=... INFLUX_ORG=flood INFLUX_BUCKET=sensors flood-bridge --live
//! ```
//!
//! # Configuration File
//!
//! ```yaml
//! source:
//!   url: "https://example.firebaseio.com"
//! influxdb:
//!   url: "http://localhost:8086"
//!   org: "flood"
//!   bucket: "sensors"
//!   token: "..."
//! streams: ["floodmonitor1", "floodmonitor2", "LoRaWAN"]
//! sync:
//!   poll_interval_ms: 1000
//!   page_size: 100
//! ```

pub mod config;
pub mod cursor;
pub mod engine;
pub mod error;
pub mod influx;
pub mod live;
pub mod mock;
pub mod normalize;
pub mod recovery;
pub mod sink;
pub mod source;

pub use config::{BridgeConfig, ConfigError};
pub use cursor::{CursorMap, CursorStore, JsonFileCursorStore, MemoryCursorStore};
pub use engine::{EngineOptions, EngineStats, PollOutcome, SyncEngine};
pub use error::{BridgeError, NormalizeError, Result};
pub use influx::LineProtocolWriter;
pub use live::{LiveEvent, LiveEventKind, LiveStats};
pub use normalize::{normalize, Measurement};
pub use recovery::{recover_all, recover_cursor, Recovered, RecoveryPolicy, RecoveryTier};
pub use sink::{InfluxSink, MeasurementSink, TagFilter};
pub use source::{FirebaseSource, RawEntry, ReadDirection, SourceStore};
