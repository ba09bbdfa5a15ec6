// Durable key-value storage backends.

use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};

use tracing::debug;

use crate::error::{EtaError, Result};

/// String values under string keys. No multi-key transactions.
pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> impl Future<Output = Result<Option<String>>> + Send;

    fn set(&self, key: &str, value: &str) -> impl Future<Output = Result<()>> + Send;
}

// ============================================================================
// File backend
// ============================================================================

/// One JSON file per key inside a data directory.
pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        FileStore { dir: dir.into() }
    }

    /// `<data dir>/kmb_eta`, or the working directory when the platform has
    /// no data dir.
    pub fn default_dir() -> PathBuf {
        let mut path = dirs::data_dir().unwrap_or_else(|| PathBuf::from("."));
        path.push("kmb_eta");
        path
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, key: &str) -> PathBuf {
        let file_name: String = key
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        self.dir.join(format!("{}.json", file_name.to_lowercase()))
    }
}

impl KeyValueStore for FileStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let path = self.path_for(key);
        match tokio::fs::read_to_string(&path).await {
            Ok(contents) => Ok(Some(contents)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(EtaError::Storage(format!("Failed to read {:?}: {}", path, e))),
        }
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| EtaError::Storage(format!("Failed to create {:?}: {}", self.dir, e)))?;

        // Write aside, then rename over the old file.
        let path = self.path_for(key);
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, value)
            .await
            .map_err(|e| EtaError::Storage(format!("Failed to write {:?}: {}", tmp, e)))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|e| EtaError::Storage(format!("Failed to replace {:?}: {}", path, e)))?;

        debug!("💾 Saved {} to {:?}", key, path);
        Ok(())
    }
}

// ============================================================================
// In-memory backend
// ============================================================================

/// Process-local store. Every access yields to the scheduler first, the way
/// a real storage round-trip would.
#[derive(Default)]
pub struct MemoryStore {
    values: Mutex<HashMap<String, String>>,
    fail_writes: AtomicBool,
    fail_reads: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_raw(&self, key: &str, value: &str) {
        self.values
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.to_string(), value.to_string());
    }

    pub fn raw(&self, key: &str) -> Option<String> {
        self.values
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }
}

impl KeyValueStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        tokio::task::yield_now().await;
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(EtaError::Storage(format!("read of {} refused", key)));
        }
        Ok(self.raw(key))
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        tokio::task::yield_now().await;
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(EtaError::Storage(format!("write of {} refused", key)));
        }
        self.insert_raw(key, value);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("kmb_eta_test_{}_{}", name, std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        dir
    }

    #[tokio::test]
    async fn test_file_store_round_trip() {
        let dir = scratch_dir("round_trip");
        let store = FileStore::new(&dir);

        assert_eq!(store.get("baseRoutesToFetch").await.unwrap(), None);

        store.set("baseRoutesToFetch", "[]").await.unwrap();
        assert_eq!(store.get("baseRoutesToFetch").await.unwrap().as_deref(), Some("[]"));

        store.set("baseRoutesToFetch", r#"[{"stop":"S1"}]"#).await.unwrap();
        assert_eq!(
            store.get("baseRoutesToFetch").await.unwrap().as_deref(),
            Some(r#"[{"stop":"S1"}]"#)
        );
        assert!(!store.path_for("baseRoutesToFetch").with_extension("json.tmp").exists());

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_file_store_key_paths() {
        let store = FileStore::new("/data");
        assert_eq!(store.path_for("FAVORITE_STOP_IDS"), PathBuf::from("/data/favorite_stop_ids.json"));
        assert_eq!(store.path_for("../x"), PathBuf::from("/data/___x.json"));
    }

    #[tokio::test]
    async fn test_memory_store_failures() {
        let store = MemoryStore::new();
        store.set("k", "v").await.unwrap();

        store.set_fail_writes(true);
        assert!(matches!(store.set("k", "w").await, Err(EtaError::Storage(_))));
        assert_eq!(store.raw("k").as_deref(), Some("v"));

        store.set_fail_reads(true);
        assert!(matches!(store.get("k").await, Err(EtaError::Storage(_))));
    }
}
