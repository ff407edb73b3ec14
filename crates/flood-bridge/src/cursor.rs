// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Cursor snapshot persistence.
//!
//! A cursor is the key of the last entry of a stream that was durably written
//! to the sink. The whole map is saved as one flat JSON object after every
//! successful per-stream write.

use crate::error::{BridgeError, Result};
use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Stream name -> last processed key.
pub type CursorMap = BTreeMap<String, String>;

/// Cursor snapshot backend.
pub trait CursorStore: Send + Sync {
    /// Load the saved snapshot. A missing snapshot is an empty map.
    fn load(&self) -> Result<CursorMap>;

    /// Replace the saved snapshot. After a crash, either the previous or the
    /// new snapshot is visible, never a partial one.
    fn save(&self, cursors: &CursorMap) -> Result<()>;
}

/// JSON file snapshot, written via temp file + rename.
#[derive(Debug, Clone)]
pub struct JsonFileCursorStore {
    path: PathBuf,
}

impl JsonFileCursorStore {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| "cursors".into());
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

impl CursorStore for JsonFileCursorStore {
    fn load(&self) -> Result<CursorMap> {
        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(CursorMap::new()),
            Err(e) => return Err(e.into()),
        };

        // Older snapshots store `null` for streams that never had a cursor.
        let raw: BTreeMap<String, Option<String>> = serde_json::from_str(&content)?;
        Ok(raw
            .into_iter()
            .filter_map(|(stream, cursor)| cursor.map(|c| (stream, c)))
            .collect())
    }

    fn save(&self, cursors: &CursorMap) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let json = serde_json::to_vec_pretty(cursors)?;
        let tmp = self.temp_path();
        {
            let mut file = fs::File::create(&tmp)?;
            file.write_all(&json)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &self.path).map_err(|e| {
            let _ = fs::remove_file(&tmp);
            BridgeError::Cursor(format!("rename {} failed: {}", self.path.display(), e))
        })?;

        tracing::debug!(path = %self.path.display(), streams = cursors.len(), "cursor snapshot saved");
        Ok(())
    }
}

/// In-memory snapshot, for tests and dry runs.
#[derive(Debug, Default)]
pub struct MemoryCursorStore {
    snapshot: Mutex<Option<CursorMap>>,
    saves: Mutex<usize>,
    fail_saves: Mutex<bool>,
}

impl MemoryCursorStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from an existing snapshot.
    pub fn with_snapshot(cursors: CursorMap) -> Self {
        let store = Self::default();
        *store.snapshot.lock().unwrap_or_else(|e| e.into_inner()) = Some(cursors);
        store
    }

    /// Last saved snapshot, if any.
    pub fn snapshot(&self) -> Option<CursorMap> {
        self.snapshot.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Number of successful saves.
    pub fn save_count(&self) -> usize {
        *self.saves.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Make subsequent saves fail (simulates a full disk).
    pub fn set_fail_saves(&self, fail: bool) {
        *self.fail_saves.lock().unwrap_or_else(|e| e.into_inner()) = fail;
    }
}

impl CursorStore for MemoryCursorStore {
    fn load(&self) -> Result<CursorMap> {
        Ok(self.snapshot().unwrap_or_default())
    }

    fn save(&self, cursors: &CursorMap) -> Result<()> {
        if *self.fail_saves.lock().unwrap_or_else(|e| e.into_inner()) {
            return Err(BridgeError::Cursor("save disabled".into()));
        }
        *self.snapshot.lock().unwrap_or_else(|e| e.into_inner()) = Some(cursors.clone());
        *self.saves.lock().unwrap_or_else(|e| e.into_inner()) += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn cursors(pairs: &[(&str, &str)]) -> CursorMap {
        pairs
            .iter()
            .map(|(s, c)| (s.to_string(), c.to_string()))
            .collect()
    }

    #[test]
    fn test_missing_file_loads_empty() {
        let dir = TempDir::new().unwrap();
        let store = JsonFileCursorStore::new(dir.path().join("bridge_state.json"));
        assert!(store.load().unwrap().is_empty());
    }

    #[test]
    fn test_save_then_load() {
        let dir = TempDir::new().unwrap();
        let store = JsonFileCursorStore::new(dir.path().join("bridge_state.json"));
        let map = cursors(&[("floodmonitor1", "-Oa3TR"), ("LoRaWAN", "-Nz01")]);

        store.save(&map).unwrap();
        assert_eq!(store.load().unwrap(), map);
        assert!(!store.temp_path().exists());
    }

    #[test]
    fn test_save_creates_parent_dir() {
        let dir = TempDir::new().unwrap();
        let store = JsonFileCursorStore::new(dir.path().join("state/nested/cursors.json"));
        store.save(&cursors(&[("s", "k")])).unwrap();
        assert_eq!(store.load().unwrap().get("s").map(String::as_str), Some("k"));
    }

    #[test]
    fn test_load_ignores_null_cursors() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("bridge_state.json");
        fs::write(&path, r#"{"floodmonitor1": "-Oa3TR", "floodmonitor2": null}"#).unwrap();

        let loaded = JsonFileCursorStore::new(&path).load().unwrap();
        assert_eq!(loaded, cursors(&[("floodmonitor1", "-Oa3TR")]));
    }

    #[test]
    fn test_corrupt_file_is_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("bridge_state.json");
        fs::write(&path, "{not json").unwrap();

        let err = JsonFileCursorStore::new(&path).load().unwrap_err();
        assert!(matches!(err, BridgeError::Json(_)));
    }

    #[test]
    fn test_save_overwrites_previous_snapshot() {
        let dir = TempDir::new().unwrap();
        let store = JsonFileCursorStore::new(dir.path().join("c.json"));
        store.save(&cursors(&[("a", "1"), ("b", "1")])).unwrap();
        store.save(&cursors(&[("a", "2")])).unwrap();
        assert_eq!(store.load().unwrap(), cursors(&[("a", "2")]));
    }

    #[test]
    fn test_memory_store_failure_injection() {
        let store = MemoryCursorStore::with_snapshot(cursors(&[("a", "1")]));
        assert_eq!(store.load().unwrap(), cursors(&[("a", "1")]));

        store.set_fail_saves(true);
        assert!(store.save(&cursors(&[("a", "2")])).is_err());
        assert_eq!(store.save_count(), 0);

        store.set_fail_saves(false);
        store.save(&cursors(&[("a", "2")])).unwrap();
        assert_eq!(store.save_count(), 1);
        assert_eq!(store.snapshot(), Some(cursors(&[("a", "2")])));
    }
}
