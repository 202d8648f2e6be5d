// src/store_manager.rs
//
// Key-value persistence for link state.
// The link only ever touches one slot (the last connected device identity),
// but the store is a plain string map so hosts can share it.
//
// JsonFileStore caches the data in memory and persists every change to disk
// with an atomic temp-file-and-rename write.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

// ============================================================================
// Trait
// ============================================================================

/// Persistence collaborator. Implementations must be cheap to call from the
/// foreground control path.
pub trait KeyValueStore: Send + Sync {
    /// Get a value, `None` if never set or unreadable.
    fn get(&self, key: &str) -> Option<String>;

    /// Overwrite a value.
    fn set(&self, key: &str, value: &str) -> Result<(), String>;

    /// Remove a value. Returns whether it existed.
    fn delete(&self, key: &str) -> Result<bool, String>;
}

// ============================================================================
// JSON file store
// ============================================================================

/// The on-disk structure - a flat JSON object
#[derive(Debug, Default, Serialize, Deserialize)]
struct StoreData {
    #[serde(flatten)]
    entries: HashMap<String, serde_json::Value>,
}

/// File-backed store. One JSON object per file.
pub struct JsonFileStore {
    path: PathBuf,
    data: RwLock<StoreData>,
}

impl JsonFileStore {
    /// Open (or lazily create) the store at `path`.
    ///
    /// The parent directory is created if missing; the file itself is only
    /// written on the first `set`. A file that cannot be read or parsed is
    /// moved aside to `<name>.corrupt` and the store starts empty.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, String> {
        let path = path.into();

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .map_err(|e| format!("Failed to create store dir: {}", e))?;
            }
        }

        let data = match load_from_disk(&path) {
            Ok(data) => data,
            Err(e) => {
                tlog!(
                    "[StoreManager] Warning: {} is unusable ({}), starting empty",
                    path.display(),
                    e
                );
                quarantine(&path);
                StoreData::default()
            }
        };
        tlog!(
            "[StoreManager] Opened {} with {} entries",
            path.display(),
            data.entries.len()
        );

        Ok(Self {
            path,
            data: RwLock::new(data),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Atomic write: write to temp file, then rename
    fn save_to_disk(&self) -> Result<(), String> {
        let json = {
            let data = self
                .data
                .read()
                .map_err(|e| format!("Failed to acquire read lock: {}", e))?;
            serde_json::to_string_pretty(&*data)
                .map_err(|e| format!("Failed to serialise store: {}", e))?
        };

        let temp_path = self.path.with_extension("json.tmp");

        fs::write(&temp_path, &json).map_err(|e| format!("Failed to write temp file: {}", e))?;

        fs::rename(&temp_path, &self.path)
            .map_err(|e| format!("Failed to rename temp file: {}", e))?;

        Ok(())
    }
}

/// Load store data from disk
fn load_from_disk(path: &Path) -> Result<StoreData, String> {
    if !path.exists() {
        return Ok(StoreData::default());
    }

    let content =
        fs::read_to_string(path).map_err(|e| format!("Failed to read store file: {}", e))?;

    serde_json::from_str(&content).map_err(|e| format!("Failed to parse store file: {}", e))
}

/// Keep an unusable store file around for inspection instead of overwriting
/// it on the next save.
fn quarantine(path: &Path) {
    let mut aside = path.as_os_str().to_owned();
    aside.push(".corrupt");
    if let Err(e) = fs::rename(path, &aside) {
        tlog!(
            "[StoreManager] Warning: could not move {} aside: {}",
            path.display(),
            e
        );
    }
}

impl KeyValueStore for JsonFileStore {
    fn get(&self, key: &str) -> Option<String> {
        let data = self.data.read().ok()?;
        data.entries
            .get(key)
            .and_then(|v| v.as_str())
            .map(str::to_string)
    }

    fn set(&self, key: &str, value: &str) -> Result<(), String> {
        {
            let mut data = self
                .data
                .write()
                .map_err(|e| format!("Failed to acquire write lock: {}", e))?;
            data.entries
                .insert(key.to_string(), serde_json::Value::String(value.to_string()));
        }
        self.save_to_disk()
    }

    fn delete(&self, key: &str) -> Result<bool, String> {
        let existed = {
            let mut data = self
                .data
                .write()
                .map_err(|e| format!("Failed to acquire write lock: {}", e))?;
            data.entries.remove(key).is_some()
        };

        if existed {
            self.save_to_disk()?;
        }

        Ok(existed)
    }
}

// ============================================================================
// Memory store
// ============================================================================

/// Non-persistent store for hosts without storage, and for tests.
#[derive(Default)]
pub struct MemoryStore {
    entries: RwLock<HashMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Option<String> {
        self.entries.read().ok()?.get(key).cloned()
    }

    fn set(&self, key: &str, value: &str) -> Result<(), String> {
        self.entries
            .write()
            .map_err(|e| format!("Failed to acquire write lock: {}", e))?
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<bool, String> {
        Ok(self
            .entries
            .write()
            .map_err(|e| format!("Failed to acquire write lock: {}", e))?
            .remove(key)
            .is_some())
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_json_store_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("state.json");

        let store = JsonFileStore::open(&path).unwrap();
        assert_eq!(store.get("serialPortInfo"), None);
        store.set("serialPortInfo", "9025:67").unwrap();

        let reopened = JsonFileStore::open(&path).unwrap();
        assert_eq!(reopened.get("serialPortInfo").as_deref(), Some("9025:67"));
        assert_eq!(reopened.path(), path.as_path());
    }

    #[test]
    fn test_json_store_leaves_no_temp_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        let store = JsonFileStore::open(&path).unwrap();
        store.set("a", "1").unwrap();

        assert!(path.exists());
        assert!(!path.with_extension("json.tmp").exists());
    }

    #[test]
    fn test_json_store_delete() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::open(dir.path().join("state.json")).unwrap();
        store.set("a", "1").unwrap();
        assert!(store.delete("a").unwrap());
        assert!(!store.delete("a").unwrap());
        assert_eq!(store.get("a"), None);
    }

    #[test]
    fn test_json_store_recovers_from_corrupt_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        fs::write(&path, "{trunc").unwrap();

        let store = JsonFileStore::open(&path).unwrap();
        assert_eq!(store.get("serialPortInfo"), None);
        assert_eq!(
            fs::read_to_string(dir.path().join("state.json.corrupt")).unwrap(),
            "{trunc"
        );

        // the next save writes a fresh, valid file
        store.set("serialPortInfo", "1:2").unwrap();
        let reopened = JsonFileStore::open(&path).unwrap();
        assert_eq!(reopened.get("serialPortInfo").as_deref(), Some("1:2"));
    }

    #[test]
    fn test_json_store_fails_when_dir_cannot_be_created() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("not-a-dir");
        fs::write(&blocker, "").unwrap();
        assert!(JsonFileStore::open(blocker.join("state.json")).is_err());
    }

    #[test]
    fn test_json_store_ignores_non_string_values() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        fs::write(&path, r#"{"serialPortInfo": 42, "other": "x"}"#).unwrap();
        let store = JsonFileStore::open(&path).unwrap();
        assert_eq!(store.get("serialPortInfo"), None);
        assert_eq!(store.get("other").as_deref(), Some("x"));
    }

    #[test]
    fn test_memory_store() {
        let store = MemoryStore::new();
        store.set("k", "v").unwrap();
        assert_eq!(store.get("k").as_deref(), Some("v"));
        store.set("k", "w").unwrap();
        assert_eq!(store.get("k").as_deref(), Some("w"));
        assert!(store.delete("k").unwrap());
        assert_eq!(store.get("k"), None);
    }
}
