//! Index diff computation
//!
//! Compares a local and a remote [`FileIndex`] and decides, per path, which
//! side wins under last-writer-wins. The differ is pure: same inputs, same
//! actions, in a stable path order. It never produces deletions; a file
//! absent on one side is copied back from the other.

use std::cmp::Ordering;
use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use tracing::debug;

use syncdev_index::{FileIndex, FileInfo};

/// A single file operation produced by the differ.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum SyncAction {
    /// Send the local version to the peer.
    Push { local: FileInfo },
    /// Fetch the remote version from the peer.
    Pull { remote: FileInfo },
    /// Remove a file. Defined for the wire; the differ never produces it.
    Delete {
        local: Option<FileInfo>,
        remote: Option<FileInfo>,
    },
    /// Nothing to do for this path.
    Skip,
}

impl SyncAction {
    /// The file the action operates on, if any.
    pub fn file(&self) -> Option<&FileInfo> {
        match self {
            SyncAction::Push { local } => Some(local),
            SyncAction::Pull { remote } => Some(remote),
            SyncAction::Delete { local, remote } => local.as_ref().or(remote.as_ref()),
            SyncAction::Skip => None,
        }
    }
}

/// Compare two indices and return the actions needed to converge them.
/// Paths with nothing to do are omitted, so `diff(a, a)` is empty.
pub fn diff(local: &FileIndex, remote: &FileIndex) -> Vec<SyncAction> {
    let paths: BTreeSet<&str> = local
        .files
        .keys()
        .chain(remote.files.keys())
        .map(String::as_str)
        .collect();

    let mut actions = Vec::new();
    for path in paths {
        match (local.files.get(path), remote.files.get(path)) {
            (Some(local_file), None) => actions.push(SyncAction::Push {
                local: local_file.clone(),
            }),
            (None, Some(remote_file)) => actions.push(SyncAction::Pull {
                remote: remote_file.clone(),
            }),
            (Some(local_file), Some(remote_file)) => {
                if let Some(action) = compare_entries(local_file, remote_file) {
                    actions.push(action);
                }
            }
            (None, None) => unreachable!("path came from one of the indices"),
        }
    }

    debug!(
        local = %local.folder_path,
        remote = %remote.folder_path,
        actions = actions.len(),
        "diff computed"
    );
    actions
}

fn compare_entries(local: &FileInfo, remote: &FileInfo) -> Option<SyncAction> {
    if local.is_dir && remote.is_dir {
        return None;
    }

    // Type conflict (directory vs file): the newer mtime wins, a tie
    // preserves both sides.
    if local.is_dir != remote.is_dir {
        return match local.mod_time.cmp(&remote.mod_time) {
            Ordering::Greater => Some(SyncAction::Push {
                local: local.clone(),
            }),
            Ordering::Less => Some(SyncAction::Pull {
                remote: remote.clone(),
            }),
            Ordering::Equal => None,
        };
    }

    if !local.hash.is_empty() && !remote.hash.is_empty() {
        if local.hash == remote.hash {
            return None;
        }
    } else if local.size == remote.size && local.mod_time == remote.mod_time {
        return None;
    }

    match local.mod_time.cmp(&remote.mod_time) {
        Ordering::Greater => Some(SyncAction::Push {
            local: local.clone(),
        }),
        Ordering::Less => Some(SyncAction::Pull {
            remote: remote.clone(),
        }),
        // Same mtime, different content: keep both rather than lose data
        Ordering::Equal => None,
    }
}
