//! Durable storage for cache entries and database snapshots
//!
//! Artifacts are plain JSON documents addressed by a `/`-separated key. The backend is
//! chosen when a component is constructed: [`FileStore`] writes one human-readable JSON
//! file per key, [`MemoryStore`] keeps documents in the process, and [`NullStore`]
//! persists nothing.

use crate::error::{FlowProbeError, Result};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::debug;

/// Key/value store of JSON artifacts
pub trait ArtifactStore: Send + Sync {
    /// Load an artifact, `None` if absent
    fn load(&self, key: &str) -> Result<Option<Value>>;

    /// Create or overwrite an artifact
    fn save(&self, key: &str, value: &Value) -> Result<()>;

    /// Delete an artifact; deleting a missing key is not an error
    fn remove(&self, key: &str) -> Result<()>;

    /// Every stored key
    fn keys(&self) -> Result<Vec<String>>;

    /// Delete every artifact
    fn clear(&self) -> Result<()> {
        for key in self.keys()? {
            self.remove(&key)?;
        }
        Ok(())
    }
}

/// Shared store handle
pub type SharedStore = Arc<dyn ArtifactStore>;

/// One JSON file per key under a root directory
#[derive(Debug, Clone)]
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &str) -> Result<PathBuf> {
        let mut path = self.root.clone();
        let segments: Vec<&str> = key.split('/').collect();
        if segments.iter().any(|s| s.is_empty() || *s == "." || *s == "..") {
            return Err(FlowProbeError::Other(format!("Invalid artifact key: {}", key)));
        }
        for (i, segment) in segments.iter().enumerate() {
            let clean = sanitize_segment(segment);
            if i + 1 == segments.len() {
                path.push(format!("{}.json", clean));
            } else {
                path.push(clean);
            }
        }
        Ok(path)
    }

    fn collect_keys(dir: &Path, prefix: &str, out: &mut Vec<String>) -> Result<()> {
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            let path = entry.path();
            let name = entry.file_name().to_string_lossy().to_string();
            if path.is_dir() {
                let nested = format!("{}{}/", prefix, name);
                Self::collect_keys(&path, &nested, out)?;
            } else if let Some(stem) = name.strip_suffix(".json") {
                out.push(format!("{}{}", prefix, stem));
            }
        }
        Ok(())
    }
}

/// Replace characters that are unsafe in file names
pub fn sanitize_segment(segment: &str) -> String {
    segment
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

impl ArtifactStore for FileStore {
    fn load(&self, key: &str) -> Result<Option<Value>> {
        let path = self.path_for(key)?;
        if !path.exists() {
            return Ok(None);
        }
        let content = fs::read_to_string(&path)?;
        Ok(Some(serde_json::from_str(&content)?))
    }

    fn save(&self, key: &str, value: &Value) -> Result<()> {
        let path = self.path_for(key)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&path, serde_json::to_string_pretty(value)?)?;
        debug!(path = %path.display(), "Artifact written");
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        let path = self.path_for(key)?;
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn keys(&self) -> Result<Vec<String>> {
        let mut keys = Vec::new();
        if self.root.is_dir() {
            Self::collect_keys(&self.root, "", &mut keys)?;
        }
        keys.sort();
        Ok(keys)
    }
}

/// Process-local store
#[derive(Debug, Default, Clone)]
pub struct MemoryStore {
    inner: Arc<Mutex<BTreeMap<String, Value>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ArtifactStore for MemoryStore {
    fn load(&self, key: &str) -> Result<Option<Value>> {
        Ok(self
            .inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(key)
            .cloned())
    }

    fn save(&self, key: &str, value: &Value) -> Result<()> {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key.to_string(), value.clone());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(key);
        Ok(())
    }

    fn keys(&self) -> Result<Vec<String>> {
        Ok(self
            .inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect())
    }
}

/// Store that keeps nothing
#[derive(Debug, Default, Clone, Copy)]
pub struct NullStore;

impl ArtifactStore for NullStore {
    fn load(&self, _key: &str) -> Result<Option<Value>> {
        Ok(None)
    }

    fn save(&self, _key: &str, _value: &Value) -> Result<()> {
        Ok(())
    }

    fn remove(&self, _key: &str) -> Result<()> {
        Ok(())
    }

    fn keys(&self) -> Result<Vec<String>> {
        Ok(Vec::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    #[test]
    fn test_file_store_roundtrip_and_keys() {
        let dir = TempDir::new().unwrap();
        let store = FileStore::new(dir.path());

        store.save("wf/step/abc", &json!({"a": 1})).unwrap();
        store.save("other", &json!([1, 2])).unwrap();

        assert_eq!(store.load("wf/step/abc").unwrap(), Some(json!({"a": 1})));
        assert!(dir.path().join("wf/step/abc.json").exists());
        assert_eq!(store.keys().unwrap(), vec!["other", "wf/step/abc"]);

        store.remove("wf/step/abc").unwrap();
        store.remove("wf/step/abc").unwrap();
        assert_eq!(store.load("wf/step/abc").unwrap(), None);
    }

    #[test]
    fn test_file_store_rejects_traversal() {
        let dir = TempDir::new().unwrap();
        let store = FileStore::new(dir.path());
        assert!(store.save("../escape", &json!(1)).is_err());
        assert!(store.load("a//b").is_err());
    }

    #[test]
    fn test_file_store_sanitizes_segments() {
        let dir = TempDir::new().unwrap();
        let store = FileStore::new(dir.path());
        store.save("my workflow/step:1", &json!(true)).unwrap();
        assert!(dir.path().join("my_workflow/step_1.json").exists());
    }

    #[test]
    fn test_file_store_malformed_json_is_error() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("bad.json"), "{not json").unwrap();
        let store = FileStore::new(dir.path());
        assert!(store.load("bad").is_err());
    }

    #[test]
    fn test_memory_store_clear() {
        let store = MemoryStore::new();
        store.save("a", &json!(1)).unwrap();
        store.save("b", &json!(2)).unwrap();
        store.clear().unwrap();
        assert!(store.keys().unwrap().is_empty());
    }

    #[test]
    fn test_null_store_keeps_nothing() {
        let store = NullStore;
        store.save("a", &json!(1)).unwrap();
        assert_eq!(store.load("a").unwrap(), None);
    }
}
