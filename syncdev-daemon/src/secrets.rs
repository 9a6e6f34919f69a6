//! Shared secret storage
//!
//! Secrets never round-trip through the configuration document; the engine
//! stores them through this capability keyed by peer id. The file-backed
//! implementation keeps one restrictively-permissioned file per peer under
//! the data directory.

use std::io;
use std::path::PathBuf;

use crate::errors::Result;

/// Capability for storing per-peer shared secrets.
pub trait SecretStore: Send + Sync {
    /// Fetch the secret for a peer, or `None` if never stored.
    fn get(&self, peer_id: &str) -> Result<Option<String>>;

    /// Store (or replace) the secret for a peer.
    fn set(&self, peer_id: &str, secret: &str) -> Result<()>;

    /// Remove the secret for a peer. Removing a missing secret is not an
    /// error.
    fn delete(&self, peer_id: &str) -> Result<()>;
}

/// Secret store backed by one file per peer id.
pub struct FileSecretStore {
    dir: PathBuf,
}

impl FileSecretStore {
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&dir, std::fs::Permissions::from_mode(0o700))?;
        }

        Ok(Self { dir })
    }

    fn secret_path(&self, peer_id: &str) -> PathBuf {
        // Peer ids are UUIDs; a separator would escape the store directory
        let safe: String = peer_id
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
            .collect();
        self.dir.join(safe)
    }
}

impl SecretStore for FileSecretStore {
    fn get(&self, peer_id: &str) -> Result<Option<String>> {
        match std::fs::read_to_string(self.secret_path(peer_id)) {
            Ok(secret) => Ok(Some(secret.trim_end().to_string())),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    fn set(&self, peer_id: &str, secret: &str) -> Result<()> {
        let path = self.secret_path(peer_id);
        let tmp = self.dir.join(".secret.tmp");
        std::fs::write(&tmp, secret)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&tmp, std::fs::Permissions::from_mode(0o600))?;
        }

        std::fs::rename(&tmp, &path)?;
        Ok(())
    }

    fn delete(&self, peer_id: &str) -> Result<()> {
        match std::fs::remove_file(self.secret_path(peer_id)) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}
