//! Storage configuration.

use std::path::PathBuf;

/// Storage layout and RocksDB tuning.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Base path for all storage
    pub base_path: PathBuf,
    /// Sync writes to disk
    pub sync_writes: bool,
    /// Compression enabled
    pub compression: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            base_path: PathBuf::from(".bep"),
            sync_writes: false,
            compression: true,
        }
    }
}

impl StoreConfig {
    /// Creates a new configuration with the given base path.
    pub fn new(base_path: PathBuf) -> Self {
        Self {
            base_path,
            ..Default::default()
        }
    }

    /// Returns the path of the index database.
    pub fn index_path(&self) -> PathBuf {
        self.base_path.join("index")
    }

    /// Creates all necessary directories.
    pub fn create_dirs(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.base_path)?;
        std::fs::create_dir_all(self.index_path())?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_paths() {
        let config = StoreConfig::new(PathBuf::from("/tmp/bep"));
        assert_eq!(config.index_path(), PathBuf::from("/tmp/bep/index"));
        assert!(!config.sync_writes);
    }

    #[test]
    fn test_create_dirs() {
        let dir = tempfile::TempDir::new().unwrap();
        let config = StoreConfig::new(dir.path().join("store"));
        config.create_dirs().unwrap();
        assert!(config.index_path().is_dir());
    }
}
