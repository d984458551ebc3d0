use anyhow::{Context, Result};
use dashmap::DashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

/// Named raster storage. Presence of an entry is the only cache signal.
///
/// Entries are keyed by frame name; the backing format is always PNG bytes.
pub trait ImageStore: Send + Sync {
    fn has(&self, name: &str) -> bool;

    fn get(&self, name: &str) -> Result<Vec<u8>>;

    /// Store `data` under `name`, replacing any previous entry.
    fn put(&self, name: &str, data: &[u8]) -> Result<()>;

    /// Human readable location of an entry, used in reports and remediation messages.
    fn location(&self, name: &str) -> String;

    /// Where the store keeps its entries.
    fn root_location(&self) -> String;
}

/// Directory-backed store writing `{dir}/{name}.png`.
#[derive(Debug, Clone)]
pub struct FsStore {
    root: PathBuf,
}

impl FsStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path_for(&self, name: &str) -> PathBuf {
        self.root.join(format!("{name}.png"))
    }
}

impl ImageStore for FsStore {
    fn has(&self, name: &str) -> bool {
        self.path_for(name).is_file()
    }

    fn get(&self, name: &str) -> Result<Vec<u8>> {
        let path = self.path_for(name);
        fs::read(&path).with_context(|| format!("failed to read {}", path.display()))
    }

    fn put(&self, name: &str, data: &[u8]) -> Result<()> {
        let start = Instant::now();
        let path = self.path_for(name);
        crate::utils::fs::write_creating_dirs(&path, data)?;
        tracing::debug!(elapsed = ?start.elapsed(), bytes = data.len(), path = %path.display(), "store.put");
        Ok(())
    }

    fn location(&self, name: &str) -> String {
        self.path_for(name).display().to_string()
    }

    fn root_location(&self) -> String {
        self.root.display().to_string()
    }
}

/// In-memory store, shared between clones.
#[derive(Clone, Default)]
pub struct MemoryStore {
    label: String,
    entries: Arc<DashMap<String, Vec<u8>>>,
}

impl MemoryStore {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            entries: Arc::new(DashMap::new()),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.entries.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }
}

impl ImageStore for MemoryStore {
    fn has(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    fn get(&self, name: &str) -> Result<Vec<u8>> {
        self.entries
            .get(name)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| anyhow::anyhow!("no entry named {} in {}", name, self.label))
    }

    fn put(&self, name: &str, data: &[u8]) -> Result<()> {
        self.entries.insert(name.to_string(), data.to_vec());
        Ok(())
    }

    fn location(&self, name: &str) -> String {
        format!("memory://{}/{}.png", self.label, name)
    }

    fn root_location(&self) -> String {
        format!("memory://{}", self.label)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fs_store_put_creates_directories() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsStore::new(dir.path().join("nested").join("baselines"));

        assert!(!store.has("home"));
        store.put("home", b"png-bytes").unwrap();

        assert!(store.has("home"));
        assert_eq!(store.get("home").unwrap(), b"png-bytes");
        assert!(store.location("home").ends_with("home.png"));
    }

    #[test]
    fn test_fs_store_put_overwrites() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsStore::new(dir.path());

        store.put("home", b"old").unwrap();
        store.put("home", b"new").unwrap();

        assert_eq!(store.get("home").unwrap(), b"new");
    }

    #[test]
    fn test_fs_store_get_missing_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsStore::new(dir.path());

        let err = store.get("missing").unwrap_err();
        assert!(err.to_string().contains("failed to read"));
    }

    #[test]
    fn test_memory_store_shared_between_clones() {
        let store = MemoryStore::new("baseline");
        let other = store.clone();

        store.put("a", &[1, 2, 3]).unwrap();

        assert!(other.has("a"));
        assert_eq!(other.get("a").unwrap(), vec![1, 2, 3]);
        assert_eq!(other.names(), vec!["a".to_string()]);
        assert_eq!(store.location("a"), "memory://baseline/a.png");
    }

    #[test]
    fn test_memory_store_missing_entry() {
        let store = MemoryStore::new("screenshots");
        assert!(store.is_empty());
        assert!(store.get("nope").is_err());
    }
}
