//! Configuration persistence
//!
//! One JSON document on disk behind a reader/writer lock. Readers get a deep
//! copy so they never observe a half-applied update; writes go through
//! [`ConfigStore::update`] and are persisted atomically before the lock is
//! released.

use std::path::{Path, PathBuf};

use parking_lot::RwLock;
use tracing::info;
use uuid::Uuid;

use crate::config::Config;
use crate::errors::Result;

pub struct ConfigStore {
    config_path: PathBuf,
    data_dir: PathBuf,
    config: RwLock<Config>,
}

impl ConfigStore {
    /// Open the store rooted at `data_dir`, creating a default configuration
    /// with a fresh device id on first run.
    pub fn open(data_dir: impl Into<PathBuf>) -> Result<Self> {
        let data_dir = data_dir.into();
        std::fs::create_dir_all(&data_dir)?;
        let config_path = data_dir.join("config.json");

        let config = match std::fs::read(&config_path) {
            Ok(data) => serde_json::from_slice(&data)?,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                let mut config = Config::default();
                config.device_id = Uuid::new_v4().to_string();
                config.device_name = gethostname::gethostname().to_string_lossy().into_owned();
                info!(device_id = %config.device_id, "created default configuration");
                persist(&config_path, &config)?;
                config
            }
            Err(err) => return Err(err.into()),
        };

        Ok(Self {
            config_path,
            data_dir,
            config: RwLock::new(config),
        })
    }

    /// A deep copy of the current configuration.
    pub fn get(&self) -> Config {
        self.config.read().clone()
    }

    /// Mutate the configuration and persist it atomically.
    pub fn update<F: FnOnce(&mut Config)>(&self, mutate: F) -> Result<()> {
        let mut config = self.config.write();
        mutate(&mut config);
        persist(&self.config_path, &config)
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn index_dir(&self) -> PathBuf {
        self.data_dir.join("indices")
    }

    pub fn secrets_dir(&self) -> PathBuf {
        self.data_dir.join("secrets")
    }
}

fn persist(path: &Path, config: &Config) -> Result<()> {
    let data = serde_json::to_vec_pretty(config)?;
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, &data)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}
