// Persisted watch-list and favorite stops.
//
// Every read-modify-write against a key runs while holding that key's lock,
// so two mutations can never both read the same stale value.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, error, info, warn};

use crate::error::{EtaError, Result};
use crate::models::{EntryKey, WatchEntry};
use crate::storage::KeyValueStore;

pub const ROUTES_KEY: &str = "baseRoutesToFetch";
pub const FAVORITES_KEY: &str = "FAVORITE_STOP_IDS";

// ============================================================================
// Per-key exclusive access
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessState {
    Idle,
    Acquiring,
    Exclusive,
}

/// FIFO lock for one storage key. Waiters are served in arrival order.
#[derive(Default)]
pub struct KeyLock {
    lock: Mutex<()>,
    waiting: AtomicUsize,
    held: AtomicBool,
}

pub struct KeyGuard<'a> {
    _guard: MutexGuard<'a, ()>,
    held: &'a AtomicBool,
}

impl Drop for KeyGuard<'_> {
    fn drop(&mut self) {
        self.held.store(false, Ordering::SeqCst);
    }
}

impl KeyLock {
    pub async fn acquire(&self) -> KeyGuard<'_> {
        self.waiting.fetch_add(1, Ordering::SeqCst);
        let guard = self.lock.lock().await;
        self.waiting.fetch_sub(1, Ordering::SeqCst);
        self.held.store(true, Ordering::SeqCst);
        KeyGuard {
            _guard: guard,
            held: &self.held,
        }
    }

    pub fn state(&self) -> AccessState {
        if self.held.load(Ordering::SeqCst) {
            AccessState::Exclusive
        } else if self.waiting.load(Ordering::SeqCst) > 0 {
            AccessState::Acquiring
        } else {
            AccessState::Idle
        }
    }
}

// ============================================================================
// Watch-list store
// ============================================================================

pub struct WatchListStore<K> {
    kv: K,
    seed: Vec<WatchEntry>,
    routes: KeyLock,
    favorites: KeyLock,
}

impl<K: KeyValueStore> WatchListStore<K> {
    /// `seed` is what [`load`](Self::load) returns before anything has been
    /// saved, or when the saved list is unreadable.
    pub fn new(kv: K, seed: Vec<WatchEntry>) -> Self {
        WatchListStore {
            kv,
            seed: dedupe_entries(seed),
            routes: KeyLock::default(),
            favorites: KeyLock::default(),
        }
    }

    pub fn backend(&self) -> &K {
        &self.kv
    }

    pub fn routes_state(&self) -> AccessState {
        self.routes.state()
    }

    /// Current watch-list. Falls back to the seed list when nothing is stored
    /// or the stored value cannot be used.
    pub async fn load(&self) -> Vec<WatchEntry> {
        match self.current_entries().await {
            Ok(entries) => entries,
            Err(e) => {
                error!("❌ Failed to load watch-list ({}), using defaults", e);
                self.seed.clone()
            }
        }
    }

    /// Appends `entry` unless an entry with the same key exists. Returns
    /// whether the entry is present in storage afterwards.
    pub async fn add_entry(&self, entry: WatchEntry) -> bool {
        let _exclusive = self.routes.acquire().await;

        match self.append_entry(&entry).await {
            Ok(present) => present,
            Err(e) => {
                error!("❌ Failed to add {} to watch-list: {}", entry.key(), e);
                false
            }
        }
    }

    /// Drops every entry matching `key` and persists the result, whether or
    /// not anything matched.
    pub async fn remove_entry(&self, key: EntryKey<'_>) -> Result<()> {
        let _exclusive = self.routes.acquire().await;

        let mut entries = self.current_entries().await?;
        let before = entries.len();
        entries.retain(|e| !e.matches(&key));
        self.write_json(ROUTES_KEY, &entries).await?;

        if entries.len() < before {
            info!("🗑️  Removed {} from watch-list", key);
        } else {
            debug!("ℹ️  {} was not in the watch-list", key);
        }
        Ok(())
    }

    /// Replaces the whole watch-list. Later duplicates of a key are dropped.
    pub async fn save(&self, entries: Vec<WatchEntry>) -> Result<()> {
        let _exclusive = self.routes.acquire().await;
        self.write_json(ROUTES_KEY, &dedupe_entries(entries)).await
    }

    async fn append_entry(&self, entry: &WatchEntry) -> Result<bool> {
        let mut entries = self.current_entries().await?;
        if entries.iter().any(|e| e.matches(&entry.key())) {
            debug!("ℹ️  {} already watched", entry.key());
            return Ok(true);
        }

        entries.push(entry.clone());
        self.write_json(ROUTES_KEY, &entries).await?;

        // Confirm against what storage actually holds now.
        let committed: Vec<WatchEntry> = self.read_json(ROUTES_KEY).await?.unwrap_or_default();
        let present = committed.iter().any(|e| e.matches(&entry.key()));
        if present {
            info!("✓ Added {} to watch-list", entry.key());
        } else {
            warn!("⚠️  {} missing from watch-list after write", entry.key());
        }
        Ok(present)
    }

    // Storage failures propagate; a corrupt value reads as the seed list.
    async fn current_entries(&self) -> Result<Vec<WatchEntry>> {
        match self.read_json::<Vec<WatchEntry>>(ROUTES_KEY).await {
            Ok(Some(entries)) => Ok(dedupe_entries(entries)),
            Ok(None) => Ok(self.seed.clone()),
            Err(EtaError::Validation(msg)) => {
                warn!("⚠️  Stored watch-list is unusable ({}), using defaults", msg);
                Ok(self.seed.clone())
            }
            Err(e) => Err(e),
        }
    }

    // ========================================================================
    // Favorite stops
    // ========================================================================

    pub async fn load_favorite_stop_ids(&self) -> Vec<String> {
        match self.current_favorites().await {
            Ok(ids) => ids,
            Err(e) => {
                error!("❌ Failed to load favorite stop ids ({})", e);
                Vec::new()
            }
        }
    }

    /// Adds `stop_id` to the favorites. Returns whether it is stored
    /// afterwards.
    pub async fn add_favorite_stop(&self, stop_id: &str) -> bool {
        let _exclusive = self.favorites.acquire().await;

        match self.append_favorite(stop_id).await {
            Ok(present) => present,
            Err(e) => {
                error!("❌ Failed to append favorite stop id {}: {}", stop_id, e);
                false
            }
        }
    }

    pub async fn remove_favorite_stop(&self, stop_id: &str) -> Result<()> {
        let _exclusive = self.favorites.acquire().await;

        let mut ids = self.current_favorites().await?;
        ids.retain(|id| id != stop_id);
        self.write_json(FAVORITES_KEY, &ids).await
    }

    async fn append_favorite(&self, stop_id: &str) -> Result<bool> {
        let mut ids = self.current_favorites().await?;
        if ids.iter().any(|id| id == stop_id) {
            return Ok(true);
        }

        ids.push(stop_id.to_string());
        self.write_json(FAVORITES_KEY, &ids).await?;

        let committed: Vec<String> = self.read_json(FAVORITES_KEY).await?.unwrap_or_default();
        Ok(committed.iter().any(|id| id == stop_id))
    }

    async fn current_favorites(&self) -> Result<Vec<String>> {
        match self.read_json::<Vec<String>>(FAVORITES_KEY).await {
            Ok(Some(ids)) => {
                let mut unique = Vec::with_capacity(ids.len());
                for id in ids {
                    if !unique.contains(&id) {
                        unique.push(id);
                    }
                }
                Ok(unique)
            }
            Ok(None) => Ok(Vec::new()),
            Err(EtaError::Validation(msg)) => {
                warn!("⚠️  Stored favorites are unusable ({}), starting empty", msg);
                Ok(Vec::new())
            }
            Err(e) => Err(e),
        }
    }

    // ========================================================================
    // JSON helpers
    // ========================================================================

    async fn read_json<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        match self.kv.get(key).await? {
            None => Ok(None),
            Some(raw) if raw.trim().is_empty() => Ok(None),
            Some(raw) => serde_json::from_str(&raw)
                .map(Some)
                .map_err(|e| EtaError::Validation(format!("{}: {}", key, e))),
        }
    }

    async fn write_json<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> Result<()> {
        let json = serde_json::to_string(value)
            .map_err(|e| EtaError::Storage(format!("Failed to serialize {}: {}", key, e)))?;
        self.kv.set(key, &json).await
    }
}

fn dedupe_entries(entries: Vec<WatchEntry>) -> Vec<WatchEntry> {
    let mut unique: Vec<WatchEntry> = Vec::with_capacity(entries.len());
    for entry in entries {
        if !unique.iter().any(|e| e.matches(&entry.key())) {
            unique.push(entry);
        }
    }
    unique
}
