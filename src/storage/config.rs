//! Block store configuration

use crate::core::error::Error;
use crate::core::types::Result;
use crate::storage::cache::DEFAULT_CACHE_CAPACITY;
use crate::storage::codec::Compression;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Configuration for a persistent block store
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// SQLite database file, one per volume
    pub database_path: PathBuf,
    /// Maximum number of saves held in the write-back cache
    pub cache_capacity: usize,
    /// Compression for newly written blobs
    pub compression: Compression,
    /// How long a connection waits on a locked database before failing
    pub busy_timeout_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            database_path: PathBuf::from("assets/worlds/blocks.sqlite"),
            cache_capacity: DEFAULT_CACHE_CAPACITY,
            compression: Compression::Lz4,
            busy_timeout_ms: 5000,
        }
    }
}

impl StoreConfig {
    /// Default configuration for the given database file
    pub fn new(database_path: impl Into<PathBuf>) -> Self {
        Self {
            database_path: database_path.into(),
            ..Default::default()
        }
    }

    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.database_path.as_os_str().is_empty() {
            return Err(Error::Config("database_path is empty".into()));
        }
        if self.cache_capacity == 0 {
            return Err(Error::Config("cache_capacity must be at least 1".into()));
        }
        Ok(())
    }

    /// Save to file (sync)
    pub fn save_sync(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| Error::Config(e.to_string()))?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        std::fs::write(path, json)?;
        Ok(())
    }

    /// Load from file (sync)
    pub fn load_sync(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&json)
            .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_config() {
        let cfg = StoreConfig::default();
        assert_eq!(cfg.cache_capacity, 64);
        assert_eq!(cfg.compression, Compression::Lz4);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_zero_capacity() {
        let cfg = StoreConfig { cache_capacity: 0, ..Default::default() };
        assert!(matches!(cfg.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_save_load_roundtrip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config").join("store.json");
        let cfg = StoreConfig {
            compression: Compression::None,
            cache_capacity: 16,
            ..StoreConfig::new(dir.path().join("volume.sqlite"))
        };

        cfg.save_sync(&path).unwrap();
        assert_eq!(StoreConfig::load_sync(&path).unwrap(), cfg);
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("store.json");
        std::fs::write(&path, r#"{ "database_path": "a.sqlite", "compression": "none" }"#).unwrap();

        let cfg = StoreConfig::load_sync(&path).unwrap();
        assert_eq!(cfg.database_path, PathBuf::from("a.sqlite"));
        assert_eq!(cfg.compression, Compression::None);
        assert_eq!(cfg.cache_capacity, DEFAULT_CACHE_CAPACITY);
    }
}
