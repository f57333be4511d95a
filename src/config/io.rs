use std::env::current_exe;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::Mutex;
use directories_next::ProjectDirs;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use fd_lock::{RwLock, RwLockWriteGuard};
use log::{info, warn};
use std::fs::OpenOptions;
use std::str;

use crate::config::types::Config;
use crate::error::ConfigError;

// fan-link.json next to the executable, for installs that should carry their settings along
fn get_portable_config_path() -> Option<PathBuf> {
    match current_exe() {
        Ok(mut path) => {
            if !path.set_extension("json") {
                warn!("current exe has no filename: {}", path.to_string_lossy());
                return None
            }

            Some(path)
        },
        Err(err) => {
            warn!("failed to get current exe path: {:?}", err);
            None
        },
    }
}

// fan-link.json in the os dependent config directory, such as ~/.config/fan-link on linux
fn get_local_config_path() -> Option<PathBuf> {
    ProjectDirs::from("com", "windtrax", "fan-link").map(|dirs| {
        dirs.config_dir().join("fan-link.json")
    })
}

fn get_config_path() -> Result<PathBuf, ConfigError> {
    if let Some(path) = get_portable_config_path() {
        match std::fs::metadata(&path) {
            Ok(attr) if attr.is_file() => return Ok(path),
            Ok(_) => {},
            Err(err) => {
                info!("No portable config at {} ({}); using local path instead", path.to_string_lossy(), err);
            },
        }
    }

    get_local_config_path().ok_or(ConfigError::NoConfigPath)
}

/// Holds the exclusive lock that keeps a second instance (and a second device session) from starting.
pub struct ConfigIOLocker {
    rw_lock: RwLock<std::fs::File>,
}

impl ConfigIOLocker {
    pub fn lock(&mut self) -> Result<RwLockWriteGuard<std::fs::File>, ConfigError> {
        self.rw_lock.try_write().map_err(|source| ConfigError::CanNotLock { source })
    }
}

struct ConfigIOInner {
    file: std::fs::File,
}

#[derive(Clone)]
pub struct ConfigIO {
    inner: Arc<Mutex<ConfigIOInner>>,
}

impl ConfigIO {
    pub fn new_sync() -> Result<Self, ConfigError> {
        let path = get_config_path()?;
        Self::open_sync(&path)
    }

    pub fn open_sync(path: &Path) -> Result<Self, ConfigError> {
        info!("Using config file {}", path.to_string_lossy());

        if let Some(directory) = path.parent() {
            std::fs::create_dir_all(directory)?;
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .truncate(false)
            .append(false)
            .create(true)
            .open(path)?;

        let inner = ConfigIOInner {
            file,
        };
        Ok(ConfigIO { inner: Arc::new(Mutex::new(inner)) })
    }

    pub fn locker(&self) -> Result<ConfigIOLocker, ConfigError> {
        Ok(ConfigIOLocker {
            rw_lock: RwLock::new(self.clone_file()?),
        })
    }

    fn clone_file(&self) -> Result<std::fs::File, ConfigError> {
        let inner = self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        Ok(inner.file.try_clone()?)
    }

    // The File returned from here should never be closed!
    fn get_file(&self) -> Result<File, ConfigError> {
        Ok(File::from_std(self.clone_file()?))
    }

    /// Reads the config; an empty file means defaults.
    pub async fn read(&self) -> Result<Option<Config>, ConfigError> {
        let mut file = self.get_file()?;
        info!("Reading config file");

        let mut content = vec![];
        file.rewind().await?;
        file.read_to_end(&mut content).await?;

        if content.iter().all(u8::is_ascii_whitespace) {
            return Ok(None);
        }

        let content = str::from_utf8(&content)?;
        Ok(Some(serde_json::from_str(content)?))
    }

    /// Reads the config, writing the defaults out first if there is none yet so they can be edited.
    pub async fn load(&self) -> Result<Config, ConfigError> {
        match self.read().await? {
            Some(config) => Ok(config),
            None => {
                info!("Config file is empty, writing defaults");
                let config = Config::default();
                self.save(&config).await?;
                Ok(config)
            },
        }
    }

    pub async fn save(&self, config: &Config) -> Result<(), ConfigError> {
        let mut file = self.get_file()?;
        info!("Saving config");

        let content = serde_json::to_string_pretty(config)?;
        file.rewind().await?;
        file.set_len(0).await?;
        file.write_all(content.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }
}
