//! Configuration for the backup and recovery engines
//!
//! A [`VaultConfig`] names the database to protect, the backup directory and
//! the operational knobs (retention, chunking, compression, scheduling and
//! timeouts). It can be built in code or loaded from a JSON file.

use crate::{Result, VaultError};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Which database backend to connect to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "backend", rename_all = "lowercase")]
pub enum DatabaseConfig {
    /// SQLite database file
    Sqlite { path: PathBuf },
}

impl DatabaseConfig {
    /// Parse a database URI
    ///
    /// Supports formats:
    /// - `sqlite://path/to/db.sqlite` (also `sqlite:` without slashes)
    /// - `/local/path.db` or `./relative.db`, treated as SQLite
    pub fn from_uri(uri: &str) -> Result<Self> {
        let uri = uri.trim();
        if uri.is_empty() {
            return Err(VaultError::validation("database URI cannot be empty"));
        }

        let path = match uri.split_once("://") {
            Some(("sqlite", path)) => path,
            Some((scheme, _)) => {
                return Err(VaultError::validation(format!(
                    "unsupported database scheme '{scheme}'"
                )))
            }
            None => uri.strip_prefix("sqlite:").unwrap_or(uri),
        };

        if path.is_empty() {
            return Err(VaultError::validation("database URI is missing a path"));
        }
        Ok(DatabaseConfig::Sqlite {
            path: PathBuf::from(path),
        })
    }
}

fn default_retention() -> usize {
    10
}

fn default_chunk_size() -> u64 {
    1000
}

fn default_compression_level() -> u32 {
    6
}

fn default_schedule_interval_secs() -> u64 {
    86_400
}

fn default_backup_timeout_secs() -> u64 {
    300
}

fn default_restore_timeout_secs() -> u64 {
    600
}

/// Complete engine configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VaultConfig {
    /// Database to back up and restore into
    pub database: DatabaseConfig,

    /// Directory holding artifacts, the catalog and schedule state
    pub backup_dir: PathBuf,

    /// Number of most recent backups to keep
    #[serde(default = "default_retention")]
    pub retention: usize,

    /// Rows per insert statement
    #[serde(default = "default_chunk_size")]
    pub chunk_size: u64,

    /// Gzip level (0-9)
    #[serde(default = "default_compression_level")]
    pub compression_level: u32,

    #[serde(default = "default_schedule_interval_secs")]
    pub schedule_interval_secs: u64,

    #[serde(default = "default_backup_timeout_secs")]
    pub backup_timeout_secs: u64,

    #[serde(default = "default_restore_timeout_secs")]
    pub restore_timeout_secs: u64,
}

impl VaultConfig {
    /// Configuration with defaults for everything but the two locations
    pub fn new<P: Into<PathBuf>>(database: DatabaseConfig, backup_dir: P) -> Self {
        Self {
            database,
            backup_dir: backup_dir.into(),
            retention: default_retention(),
            chunk_size: default_chunk_size(),
            compression_level: default_compression_level(),
            schedule_interval_secs: default_schedule_interval_secs(),
            backup_timeout_secs: default_backup_timeout_secs(),
            restore_timeout_secs: default_restore_timeout_secs(),
        }
    }

    /// Load and validate a JSON configuration file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            VaultError::validation(format!("Failed to read config {}: {}", path.display(), e))
        })?;
        let config: VaultConfig = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.backup_dir.as_os_str().is_empty() {
            return Err(VaultError::validation("backup_dir cannot be empty"));
        }
        if self.retention == 0 {
            return Err(VaultError::validation("retention must be at least 1"));
        }
        if self.chunk_size == 0 {
            return Err(VaultError::validation("chunk_size must be at least 1"));
        }
        if self.compression_level > 9 {
            return Err(VaultError::validation("compression_level must be between 0 and 9"));
        }
        if self.schedule_interval_secs == 0 {
            return Err(VaultError::validation("schedule_interval_secs must be positive"));
        }
        if self.backup_timeout_secs == 0 || self.restore_timeout_secs == 0 {
            return Err(VaultError::validation("timeouts must be positive"));
        }
        Ok(())
    }

    pub fn schedule_interval(&self) -> Duration {
        Duration::from_secs(self.schedule_interval_secs)
    }

    pub fn backup_timeout(&self) -> Duration {
        Duration::from_secs(self.backup_timeout_secs)
    }

    pub fn restore_timeout(&self) -> Duration {
        Duration::from_secs(self.restore_timeout_secs)
    }

    /// Location of the persisted schedule state
    pub fn schedule_state_path(&self) -> PathBuf {
        self.backup_dir.join("schedule.json")
    }
}
