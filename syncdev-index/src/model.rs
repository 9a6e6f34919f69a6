//! Index data model

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Metadata about one entry in a sync index.
///
/// Paths are relative to the folder root and use forward-slash separators
/// regardless of the host OS. `hash` is the hex SHA-256 of the file contents
/// and is empty for directories (and for quick scans).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileInfo {
    pub path: String,
    pub size: u64,
    pub mod_time: DateTime<Utc>,
    #[serde(default)]
    pub hash: String,
    pub is_dir: bool,
    pub permission: u32,
}

/// A snapshot of a directory's contents.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileIndex {
    pub folder_path: String,
    pub files: HashMap<String, FileInfo>,
    pub updated_at: DateTime<Utc>,
}

impl FileIndex {
    pub fn new(folder_path: impl Into<String>) -> Self {
        Self {
            folder_path: folder_path.into(),
            files: HashMap::new(),
            updated_at: Utc::now(),
        }
    }

    /// Number of regular files (directories excluded).
    pub fn file_count(&self) -> usize {
        self.files.values().filter(|f| !f.is_dir).count()
    }

    /// Total size of regular files in bytes.
    pub fn total_size(&self) -> u64 {
        self.files
            .values()
            .filter(|f| !f.is_dir)
            .map(|f| f.size)
            .sum()
    }
}
