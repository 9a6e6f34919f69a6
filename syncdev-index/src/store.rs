//! Index persistence
//!
//! One JSON document per folder-pair id, kept under a single directory with
//! an in-memory cache in front. Saves replace the file atomically
//! (write-to-temp + rename), so readers never observe a torn index.

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use tokio::fs;
use tokio::sync::Mutex;
use tracing::debug;

use crate::errors::Result;
use crate::model::FileIndex;

/// Persists and caches per-pair file indices.
pub struct IndexStore {
    index_dir: PathBuf,
    cache: Mutex<HashMap<String, Arc<FileIndex>>>,
}

impl IndexStore {
    /// Open a store rooted at `index_dir`, creating the directory if needed.
    pub async fn open(index_dir: impl Into<PathBuf>) -> Result<Self> {
        let index_dir = index_dir.into();
        fs::create_dir_all(&index_dir).await?;
        Ok(Self {
            index_dir,
            cache: Mutex::new(HashMap::new()),
        })
    }

    /// Load the index stored under `id`, or `None` if never saved.
    pub async fn load(&self, id: &str) -> Result<Option<Arc<FileIndex>>> {
        let mut cache = self.cache.lock().await;
        if let Some(index) = cache.get(id) {
            return Ok(Some(index.clone()));
        }

        let path = self.index_path(id);
        let data = match fs::read(&path).await {
            Ok(data) => data,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };

        let index: FileIndex = serde_json::from_slice(&data)?;
        let index = Arc::new(index);
        cache.insert(id.to_string(), index.clone());
        Ok(Some(index))
    }

    /// Persist an index under `id`, stamping `updated_at`.
    pub async fn save(&self, id: &str, mut index: FileIndex) -> Result<()> {
        index.updated_at = Utc::now();
        let data = serde_json::to_vec_pretty(&index)?;

        let path = self.index_path(id);
        let tmp = path.with_extension("json.tmp");

        let mut cache = self.cache.lock().await;
        fs::write(&tmp, &data).await?;
        fs::rename(&tmp, &path).await?;
        cache.insert(id.to_string(), Arc::new(index));
        debug!(id, "index saved");
        Ok(())
    }

    /// Drop the index stored under `id`, if any.
    pub async fn remove(&self, id: &str) -> Result<()> {
        let mut cache = self.cache.lock().await;
        cache.remove(id);
        match fs::remove_file(self.index_path(id)).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    pub fn index_dir(&self) -> &Path {
        &self.index_dir
    }

    fn index_path(&self, id: &str) -> PathBuf {
        self.index_dir.join(format!("{id}.json"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::FileInfo;
    use tempfile::tempdir;

    fn sample_index() -> FileIndex {
        let mut index = FileIndex::new("/tmp/folder");
        index.files.insert(
            "a.txt".to_string(),
            FileInfo {
                path: "a.txt".to_string(),
                size: 12,
                mod_time: Utc::now(),
                hash: "deadbeef".to_string(),
                is_dir: false,
                permission: 0o644,
            },
        );
        index
    }

    #[tokio::test]
    async fn test_save_load_roundtrip() {
        let dir = tempdir().unwrap();
        let store = IndexStore::open(dir.path().join("indices")).await.unwrap();

        store.save("pair-1", sample_index()).await.unwrap();
        let loaded = store.load("pair-1").await.unwrap().unwrap();
        assert_eq!(loaded.folder_path, "/tmp/folder");
        assert_eq!(loaded.files["a.txt"].hash, "deadbeef");
    }

    #[tokio::test]
    async fn test_load_missing_returns_none() {
        let dir = tempdir().unwrap();
        let store = IndexStore::open(dir.path()).await.unwrap();
        assert!(store.load("absent").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_save_leaves_no_temp_file() {
        let dir = tempdir().unwrap();
        let store = IndexStore::open(dir.path()).await.unwrap();
        store.save("pair-1", sample_index()).await.unwrap();

        let names: Vec<String> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["pair-1.json".to_string()]);
    }

    #[tokio::test]
    async fn test_load_survives_cache_miss() {
        let dir = tempdir().unwrap();
        {
            let store = IndexStore::open(dir.path()).await.unwrap();
            store.save("pair-1", sample_index()).await.unwrap();
        }
        // Fresh store, cold cache: must read from disk
        let store = IndexStore::open(dir.path()).await.unwrap();
        let loaded = store.load("pair-1").await.unwrap().unwrap();
        assert_eq!(loaded.files.len(), 1);
    }

    #[tokio::test]
    async fn test_remove() {
        let dir = tempdir().unwrap();
        let store = IndexStore::open(dir.path()).await.unwrap();
        store.save("pair-1", sample_index()).await.unwrap();

        store.remove("pair-1").await.unwrap();
        assert!(store.load("pair-1").await.unwrap().is_none());

        // Removing twice is fine
        store.remove("pair-1").await.unwrap();
    }
}
