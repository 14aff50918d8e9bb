//! State document persistence.
//!
//! The whole operational state serializes to a single JSON document written
//! atomically (write to a temp file, then rename) on every mutation. A
//! snapshot is additionally mirrored to a pluggable cache for multi-process
//! visibility.

use guardian_common::GuardianError;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, info};

use super::StoreState;

/// Mirror key under which the state snapshot is published.
pub const STATE_MIRROR_KEY: &str = "guardian:state";

/// Shared-cache boundary. The daemon publishes the serialized state document
/// here after every successful file write; other processes read it from the
/// cache rather than from the state file.
pub trait CacheMirror: Send + Sync {
    fn store_snapshot(&self, key: &str, json: &str) -> Result<(), GuardianError>;
}

/// File-backed mirror: one JSON file per key inside a mirror directory.
pub struct FileMirror {
    dir: PathBuf,
}

impl FileMirror {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }
}

impl CacheMirror for FileMirror {
    fn store_snapshot(&self, key: &str, json: &str) -> Result<(), GuardianError> {
        std::fs::create_dir_all(&self.dir)
            .map_err(|e| GuardianError::Storage(format!("create mirror dir: {}", e)))?;
        let file = self.dir.join(format!("{}.json", key.replace(':', "_")));
        let tmp = file.with_extension("json.tmp");
        std::fs::write(&tmp, json)
            .and_then(|_| std::fs::rename(&tmp, &file))
            .map_err(|e| GuardianError::Storage(format!("mirror write {}: {}", file.display(), e)))
    }
}

/// In-memory mirror for tests and single-process deployments. Can be told
/// to fail to exercise the rollback path.
#[derive(Default)]
pub struct MemoryMirror {
    entries: Mutex<HashMap<String, String>>,
    fail: std::sync::atomic::AtomicBool,
}

impl MemoryMirror {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_fail(&self, fail: bool) {
        self.fail.store(fail, std::sync::atomic::Ordering::SeqCst);
    }

    pub fn get(&self, key: &str) -> Option<String> {
        self.entries.lock().unwrap().get(key).cloned()
    }
}

impl CacheMirror for MemoryMirror {
    fn store_snapshot(&self, key: &str, json: &str) -> Result<(), GuardianError> {
        if self.fail.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(GuardianError::Storage("mirror unavailable".to_string()));
        }
        self.entries
            .lock()
            .unwrap()
            .insert(key.to_string(), json.to_string());
        Ok(())
    }
}

/// Write `contents` to `path` atomically.
pub async fn write_atomic(path: &Path, contents: &str) -> Result<(), GuardianError> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| GuardianError::Storage(format!("create state dir: {}", e)))?;
    }
    let tmp = path.with_extension("json.tmp");
    tokio::fs::write(&tmp, contents)
        .await
        .map_err(|e| GuardianError::Storage(format!("write {}: {}", tmp.display(), e)))?;
    tokio::fs::rename(&tmp, path)
        .await
        .map_err(|e| GuardianError::Storage(format!("rename into {}: {}", path.display(), e)))?;
    debug!("Persisted state to {}", path.display());
    Ok(())
}

/// Load the state document, if one exists.
pub async fn load_state(path: &Path) -> Result<Option<StoreState>, GuardianError> {
    match tokio::fs::read_to_string(path).await {
        Ok(contents) => {
            let state: StoreState = serde_json::from_str(&contents)
                .map_err(|e| GuardianError::Storage(format!("parse {}: {}", path.display(), e)))?;
            info!("Loaded state version {} from {}", state.version, path.display());
            Ok(Some(state))
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            info!("No existing state at {}, starting fresh", path.display());
            Ok(None)
        }
        Err(e) => Err(GuardianError::Storage(format!(
            "read {}: {}",
            path.display(),
            e
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_write_atomic_leaves_no_temp_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        write_atomic(&path, "{\"ok\":true}").await.unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "{\"ok\":true}");
        assert!(!path.with_extension("json.tmp").exists());
    }

    #[tokio::test]
    async fn test_load_missing_state_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let loaded = load_state(&dir.path().join("state.json")).await.unwrap();
        assert!(loaded.is_none());
    }

    #[test]
    fn test_memory_mirror_failure_toggle() {
        let mirror = MemoryMirror::new();
        mirror.store_snapshot("k", "v").unwrap();
        assert_eq!(mirror.get("k").unwrap(), "v");

        mirror.set_fail(true);
        assert!(mirror.store_snapshot("k", "v2").is_err());
        assert_eq!(mirror.get("k").unwrap(), "v");
    }
}
