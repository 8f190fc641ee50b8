//! Store configuration.

use std::path::{Path, PathBuf};

/// Default number of buffer pool frames.
pub const DEFAULT_BUFFER_CAPACITY: usize = 1024;

/// Where a store lives and how much memory its buffer pool gets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreConfig {
    /// Directory holding one file per partition.
    pub data_dir: PathBuf,
    /// Number of frames in the buffer pool.
    pub buffer_capacity: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        StoreConfig {
            data_dir: PathBuf::from("./tierdb_data"),
            buffer_capacity: DEFAULT_BUFFER_CAPACITY,
        }
    }
}

impl StoreConfig {
    pub fn new(data_dir: impl AsRef<Path>) -> Self {
        StoreConfig {
            data_dir: data_dir.as_ref().to_path_buf(),
            ..Default::default()
        }
    }

    pub fn data_dir(mut self, data_dir: impl AsRef<Path>) -> Self {
        self.data_dir = data_dir.as_ref().to_path_buf();
        self
    }

    pub fn buffer_capacity(mut self, capacity: usize) -> Self {
        self.buffer_capacity = capacity;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = StoreConfig::default();
        assert_eq!(config.data_dir, PathBuf::from("./tierdb_data"));
        assert_eq!(config.buffer_capacity, 1024);
    }

    #[test]
    fn test_builder() {
        let config = StoreConfig::new("/tmp/a").buffer_capacity(8).data_dir("/tmp/b");
        assert_eq!(config.data_dir, PathBuf::from("/tmp/b"));
        assert_eq!(config.buffer_capacity, 8);
    }
}
