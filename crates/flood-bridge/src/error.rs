// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Bridge error types.

use std::time::Duration;
use thiserror::Error;

/// Errors surfaced by the source, sink and cursor layers.
#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    #[error("Source error: {0}")]
    Source(String),

    #[error("Sink error: {0}")]
    Sink(String),

    #[error("Cursor store error: {0}")]
    Cursor(String),

    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl BridgeError {
    /// True for failures expected to clear up on their own (network, timeouts,
    /// upstream 5xx). The engine retries these next cycle without escalating.
    pub fn is_transient(&self) -> bool {
        match self {
            BridgeError::Timeout(_) | BridgeError::Source(_) | BridgeError::Sink(_) => true,
            BridgeError::Http(e) => !e.is_builder(),
            BridgeError::Config(_)
            | BridgeError::Cursor(_)
            | BridgeError::Json(_)
            | BridgeError::Io(_) => false,
        }
    }
}

/// Why a raw entry could not be turned into a measurement.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NormalizeError {
    #[error("payload at {path} is not an object")]
    NotAnObject { path: String },

    #[error("field {field} at {path} is not a number: {value}")]
    NonNumeric {
        path: String,
        field: &'static str,
        value: String,
    },
}

pub type Result<T> = std::result::Result<T, BridgeError>;

/// Run `fut`, failing with [`BridgeError::Timeout`] once `limit` elapses.
pub async fn bounded<T, F>(limit: Duration, fut: F) -> Result<T>
where
    F: std::future::Future<Output = Result<T>>,
{
    tokio::time::timeout(limit, fut)
        .await
        .map_err(|_| BridgeError::Timeout(limit))?
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(BridgeError::Timeout(Duration::from_secs(1)).is_transient());
        assert!(BridgeError::Sink("503".into()).is_transient());
        assert!(!BridgeError::Cursor("disk full".into()).is_transient());
        assert!(!BridgeError::Io(std::io::Error::other("x")).is_transient());
    }

    #[test]
    fn test_normalize_error_display_names_path() {
        let err = NormalizeError::NotAnObject {
            path: "/floodmonitor1/-Oa3TR".into(),
        };
        assert_eq!(err.to_string(), "payload at /floodmonitor1/-Oa3TR is not an object");
    }

    #[tokio::test]
    async fn test_bounded_times_out() {
        let limit = Duration::from_millis(10);
        let err = bounded(limit, async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        })
        .await
        .unwrap_err();
        assert!(matches!(err, BridgeError::Timeout(d) if d == limit));

        assert_eq!(bounded(limit, async { Ok(7) }).await.unwrap(), 7);
    }
}
