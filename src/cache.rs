use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::hash::Hash;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::error::AppError;

pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

pub fn hash_key(input: &[u8]) -> String {
    blake3::hash(input).to_hex().to_string()
}

/// A timestamped payload. Valid only while `now - timestamp < ttl`; expired
/// entries are purged on the next lookup, never by a background sweep.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CacheEntry<T> {
    pub timestamp_ms: i64,
    pub payload: T,
}

impl<T> CacheEntry<T> {
    pub fn new(payload: T) -> Self {
        Self {
            timestamp_ms: now_ms(),
            payload,
        }
    }

    pub fn is_fresh(&self, ttl_ms: u64, now: i64) -> bool {
        now.saturating_sub(self.timestamp_ms) < ttl_ms as i64
    }
}

/// In-process TTL-bounded map shared by the raw-dump, hierarchy, and
/// observation layers.
pub struct TtlCache<K, V> {
    ttl_ms: u64,
    entries: Mutex<HashMap<K, CacheEntry<V>>>,
}

impl<K: Eq + Hash + Clone, V: Clone> TtlCache<K, V> {
    pub fn new(ttl_ms: u64) -> Self {
        Self {
            ttl_ms,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn get(&self, key: &K) -> Option<V> {
        let now = now_ms();
        let mut guard = self.entries.lock().expect("cache lock poisoned");
        let fresh = guard
            .get(key)
            .map(|entry| entry.is_fresh(self.ttl_ms, now))
            .unwrap_or(false);
        if !fresh {
            guard.remove(key);
            return None;
        }
        guard.get(key).map(|entry| entry.payload.clone())
    }

    pub fn put(&self, key: K, value: V) {
        let mut guard = self.entries.lock().expect("cache lock poisoned");
        guard.insert(key, CacheEntry::new(value));
    }

    pub fn evict(&self, key: &K) {
        let mut guard = self.entries.lock().expect("cache lock poisoned");
        guard.remove(key);
    }

    pub fn clear(&self) {
        let mut guard = self.entries.lock().expect("cache lock poisoned");
        guard.clear();
    }

    /// Fresh entries, most recent first. Expired entries are dropped as a
    /// side effect.
    pub fn recent(&self) -> Vec<(K, V)> {
        let now = now_ms();
        let mut guard = self.entries.lock().expect("cache lock poisoned");
        guard.retain(|_, entry| entry.is_fresh(self.ttl_ms, now));
        let mut items: Vec<(K, i64, V)> = guard
            .iter()
            .map(|(key, entry)| (key.clone(), entry.timestamp_ms, entry.payload.clone()))
            .collect();
        items.sort_by_key(|(_, ts, _)| std::cmp::Reverse(*ts));
        items.into_iter().map(|(key, _, value)| (key, value)).collect()
    }
}

/// One cache service per process, passed explicitly to each component.
/// Owns the on-disk layout:
///
/// ```text
/// <cache-root>/observe_results/observe_<timestamp>.json
/// <cache-root>/window/<hash-of-device-id>
/// <cache-root>/screenshots/screenshot_<timestamp>.<ext>
/// <cache-root>/hierarchy/<content-hash>.json
/// <cache-root>/dumpsys/<hash-of-device-id>
/// ```
pub struct CacheService {
    root: PathBuf,
}

impl CacheService {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    pub fn from_default_location() -> Self {
        if let Ok(path) = std::env::var("DEVICELENS_CACHE_PATH") {
            return Self::new(PathBuf::from(path));
        }
        let base = dirs::cache_dir().unwrap_or_else(|| PathBuf::from("."));
        Self::new(base.join("devicelens"))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn observe_results_dir(&self) -> PathBuf {
        self.root.join("observe_results")
    }

    pub fn window_dir(&self) -> PathBuf {
        self.root.join("window")
    }

    pub fn screenshots_dir(&self) -> PathBuf {
        self.root.join("screenshots")
    }

    pub fn hierarchy_dir(&self) -> PathBuf {
        self.root.join("hierarchy")
    }

    pub fn dumpsys_dir(&self) -> PathBuf {
        self.root.join("dumpsys")
    }

    pub fn window_mirror_path(&self, serial: &str) -> PathBuf {
        self.window_dir().join(hash_key(serial.as_bytes()))
    }

    pub fn dumpsys_mirror_path(&self, serial: &str) -> PathBuf {
        self.dumpsys_dir().join(hash_key(serial.as_bytes()))
    }

    pub fn read_json<T: DeserializeOwned>(&self, path: &Path) -> Option<CacheEntry<T>> {
        let raw = fs::read_to_string(path).ok()?;
        match serde_json::from_str(&raw) {
            Ok(entry) => Some(entry),
            Err(err) => {
                tracing::debug!(path = %path.display(), error = %err, "Discarding unreadable cache file");
                None
            }
        }
    }

    /// Disk persistence is best-effort: failures are logged and swallowed,
    /// never surfaced to the request.
    pub fn write_json<T: Serialize>(&self, path: &Path, payload: &T) {
        let entry = CacheEntry::new(payload);
        if let Some(parent) = path.parent() {
            if let Err(err) = fs::create_dir_all(parent) {
                tracing::warn!(path = %path.display(), error = %err, "Failed to create cache dir");
                return;
            }
        }
        match serde_json::to_string(&entry) {
            Ok(raw) => {
                if let Err(err) = fs::write(path, raw) {
                    tracing::warn!(path = %path.display(), error = %err, "Failed to persist cache file");
                }
            }
            Err(err) => {
                tracing::warn!(path = %path.display(), error = %err, "Failed to serialize cache payload");
            }
        }
    }

    pub fn ensure_dir(&self, dir: &Path) -> Result<(), AppError> {
        fs::create_dir_all(dir)
            .map_err(|err| AppError::system(format!("Failed to create {}: {err}", dir.display()), ""))
    }
}
