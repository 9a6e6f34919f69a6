//! Directory scanner
//!
//! Walks a directory tree and builds a [`FileIndex`]. Exclusion globs are
//! matched against both the full relative path and the basename. Symlinks
//! are never followed, and entries that cannot be read are skipped without
//! failing the scan.

use std::path::{Path, PathBuf};

use globset::{Glob, GlobSet, GlobSetBuilder};
use sha2::{Digest, Sha256};
use tokio::fs;
use tokio::io::AsyncReadExt;
use tracing::{debug, trace, warn};

use crate::errors::{IndexError, Result};
use crate::model::{FileIndex, FileInfo};

/// OS junk that is excluded regardless of configured patterns.
const BUILTIN_EXCLUSIONS: &[&str] = &[
    ".DS_Store",
    ".git",
    ".svn",
    ".hg",
    ".Spotlight-V100",
    ".Trashes",
    ".fseventsd",
];

/// Scans directories and builds file indices.
pub struct Scanner {
    exclusions: GlobSet,
}

impl Scanner {
    /// Create a scanner with the given exclusion patterns. Invalid patterns
    /// are logged and ignored.
    pub fn new(patterns: &[String]) -> Self {
        let mut builder = GlobSetBuilder::new();
        for pattern in patterns {
            match Glob::new(pattern) {
                Ok(glob) => {
                    builder.add(glob);
                }
                Err(err) => warn!(pattern, %err, "ignoring invalid exclusion pattern"),
            }
        }
        let exclusions = builder.build().unwrap_or_else(|err| {
            warn!(%err, "failed to build exclusion set, continuing without patterns");
            GlobSet::empty()
        });
        Self { exclusions }
    }

    /// Scan a directory, computing content hashes for every regular file.
    pub async fn scan(&self, root: impl AsRef<Path>) -> Result<FileIndex> {
        self.walk(root.as_ref(), true).await
    }

    /// Scan using metadata only, without hashing. Intended for UI previews;
    /// quick indices must not feed the differ.
    pub async fn scan_quick(&self, root: impl AsRef<Path>) -> Result<FileIndex> {
        self.walk(root.as_ref(), false).await
    }

    async fn walk(&self, root: &Path, with_hashes: bool) -> Result<FileIndex> {
        let meta = fs::metadata(root).await?;
        if !meta.is_dir() {
            return Err(IndexError::NotADirectory(root.to_path_buf()));
        }

        let mut index = FileIndex::new(root.to_string_lossy().into_owned());
        let mut pending: Vec<PathBuf> = vec![root.to_path_buf()];

        while let Some(dir) = pending.pop() {
            let mut entries = match fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(err) => {
                    debug!(path = %dir.display(), %err, "skipping unreadable directory");
                    continue;
                }
            };

            loop {
                let entry = match entries.next_entry().await {
                    Ok(Some(entry)) => entry,
                    Ok(None) => break,
                    Err(err) => {
                        debug!(path = %dir.display(), %err, "aborting unreadable directory");
                        break;
                    }
                };

                let path = entry.path();
                let Some(rel) = relative_slash_path(root, &path) else {
                    continue;
                };

                let meta = match fs::symlink_metadata(&path).await {
                    Ok(meta) => meta,
                    Err(_) => continue,
                };
                if meta.file_type().is_symlink() {
                    trace!(path = %rel, "skipping symlink");
                    continue;
                }

                // An excluded directory is not descended into
                if self.is_excluded(&rel) {
                    trace!(path = %rel, "excluded");
                    continue;
                }

                let Ok(modified) = meta.modified() else {
                    continue;
                };

                let mut info = FileInfo {
                    path: rel.clone(),
                    size: meta.len(),
                    mod_time: modified.into(),
                    hash: String::new(),
                    is_dir: meta.is_dir(),
                    permission: permission_bits(&meta),
                };

                if meta.is_dir() {
                    pending.push(path);
                } else if with_hashes {
                    match hash_file(&path).await {
                        Ok(hash) => info.hash = hash,
                        Err(_) => continue,
                    }
                }

                index.files.insert(rel, info);
            }
        }

        Ok(index)
    }

    fn is_excluded(&self, rel: &str) -> bool {
        let name = rel.rsplit('/').next().unwrap_or(rel);
        if BUILTIN_EXCLUSIONS.contains(&name) {
            return true;
        }
        self.exclusions.is_match(rel) || self.exclusions.is_match(name)
    }

    /// Build the [`FileInfo`] for a single entry under `root`, including the
    /// content hash for regular files.
    pub async fn file_info(&self, root: impl AsRef<Path>, rel_path: &str) -> Result<FileInfo> {
        let full = root.as_ref().join(rel_path);
        let meta = fs::metadata(&full).await?;

        let mut info = FileInfo {
            path: rel_path.to_string(),
            size: meta.len(),
            mod_time: meta.modified()?.into(),
            hash: String::new(),
            is_dir: meta.is_dir(),
            permission: permission_bits(&meta),
        };
        if !meta.is_dir() {
            info.hash = hash_file(&full).await?;
        }
        Ok(info)
    }
}

/// Relative path from `root` to `path` with forward-slash separators.
fn relative_slash_path(root: &Path, path: &Path) -> Option<String> {
    let rel = path.strip_prefix(root).ok()?;
    let mut parts = Vec::new();
    for component in rel.components() {
        parts.push(component.as_os_str().to_str()?);
    }
    if parts.is_empty() {
        return None;
    }
    Some(parts.join("/"))
}

fn permission_bits(meta: &std::fs::Metadata) -> u32 {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        meta.permissions().mode() & 0o777
    }

    #[cfg(not(unix))]
    {
        if meta.is_dir() {
            0o755
        } else {
            0o644
        }
    }
}

/// Hex SHA-256 of a file's contents, streamed in 64 KiB reads.
pub async fn hash_file(path: impl AsRef<Path>) -> Result<String> {
    let mut file = fs::File::open(path.as_ref()).await?;
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buffer).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const HI_SHA256: &str = "98ea6e4f216f2fb4b69fff9b3a44842c38686ca685f3f55dc48c5d3fb1107be4";

    async fn write(path: &Path, contents: &[u8]) {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await.unwrap();
        }
        fs::write(path, contents).await.unwrap();
    }

    #[tokio::test]
    async fn test_scan_hashes_files() {
        let dir = tempdir().unwrap();
        write(&dir.path().join("hello.txt"), b"hi\n").await;

        let scanner = Scanner::new(&[]);
        let index = scanner.scan(dir.path()).await.unwrap();

        let info = &index.files["hello.txt"];
        assert_eq!(info.size, 3);
        assert!(!info.is_dir);
        assert_eq!(info.hash, HI_SHA256);
    }

    #[tokio::test]
    async fn test_scan_walks_subdirectories() {
        let dir = tempdir().unwrap();
        write(&dir.path().join("work/a.txt"), b"a").await;
        write(&dir.path().join("work/deep/b.txt"), b"b").await;

        let scanner = Scanner::new(&[]);
        let index = scanner.scan(dir.path()).await.unwrap();

        assert!(index.files.contains_key("work"));
        assert!(index.files["work"].is_dir);
        assert!(index.files.contains_key("work/a.txt"));
        assert!(index.files.contains_key("work/deep/b.txt"));
        assert_eq!(index.file_count(), 2);
    }

    #[tokio::test]
    async fn test_builtin_denylist() {
        let dir = tempdir().unwrap();
        write(&dir.path().join(".DS_Store"), b"junk").await;
        write(&dir.path().join(".git/config"), b"junk").await;
        write(&dir.path().join("work/a.txt"), b"keep").await;

        let scanner = Scanner::new(&[]);
        let index = scanner.scan(dir.path()).await.unwrap();

        assert!(!index.files.contains_key(".DS_Store"));
        assert!(!index.files.contains_key(".git"));
        assert!(!index.files.contains_key(".git/config"));
        assert!(index.files.contains_key("work/a.txt"));
    }

    #[tokio::test]
    async fn test_glob_exclusions_match_basename() {
        let dir = tempdir().unwrap();
        write(&dir.path().join("keep.txt"), b"keep").await;
        write(&dir.path().join("nested/skip.tmp"), b"skip").await;
        write(&dir.path().join("node_modules/pkg/index.js"), b"skip").await;

        let scanner = Scanner::new(&["*.tmp".to_string(), "node_modules".to_string()]);
        let index = scanner.scan(dir.path()).await.unwrap();

        assert!(index.files.contains_key("keep.txt"));
        assert!(!index.files.contains_key("nested/skip.tmp"));
        assert!(!index.files.contains_key("node_modules"));
        assert!(!index.files.contains_key("node_modules/pkg/index.js"));
    }

    #[tokio::test]
    async fn test_scan_quick_omits_hashes() {
        let dir = tempdir().unwrap();
        write(&dir.path().join("hello.txt"), b"hi\n").await;

        let scanner = Scanner::new(&[]);
        let index = scanner.scan_quick(dir.path()).await.unwrap();

        let info = &index.files["hello.txt"];
        assert!(info.hash.is_empty());
        assert_eq!(info.size, 3);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_symlinks_are_skipped() {
        let dir = tempdir().unwrap();
        write(&dir.path().join("target.txt"), b"data").await;
        tokio::fs::symlink(dir.path().join("target.txt"), dir.path().join("link.txt"))
            .await
            .unwrap();

        let scanner = Scanner::new(&[]);
        let index = scanner.scan(dir.path()).await.unwrap();

        assert!(index.files.contains_key("target.txt"));
        assert!(!index.files.contains_key("link.txt"));
    }

    #[tokio::test]
    async fn test_missing_root_is_an_error() {
        let dir = tempdir().unwrap();
        let scanner = Scanner::new(&[]);
        assert!(scanner.scan(dir.path().join("nope")).await.is_err());
    }

    #[tokio::test]
    async fn test_file_info_single_entry() {
        let dir = tempdir().unwrap();
        write(&dir.path().join("docs/hello.txt"), b"hi\n").await;

        let scanner = Scanner::new(&[]);
        let info = scanner.file_info(dir.path(), "docs/hello.txt").await.unwrap();
        assert_eq!(info.path, "docs/hello.txt");
        assert_eq!(info.hash, HI_SHA256);

        assert!(scanner.file_info(dir.path(), "absent.txt").await.is_err());
    }
}
