//! Store configuration stored at `<root>/config.json`.

use crate::error::Result;
use crate::fsutil;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

pub const CONFIG_FILE: &str = "config.json";

/// Shard size used when none is requested at creation
pub const DEFAULT_SHARD_SIZE: u64 = 1000;

/// Tunables for encoding and packing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Revisions per shard. Used when creating a store; when set on open it
    /// must agree with the `format` file.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub shard_size: Option<u64>,
    /// Store directory listings as deltas against their previous version.
    pub enable_dir_deltification: bool,
    /// Store node property lists as deltas against their previous version.
    pub enable_props_deltification: bool,
    /// Compress packed revision-property shards.
    pub compress_packed_revprops: bool,
    /// Allow `PLAIN-COMPRESSED` representations.
    pub compress_representations: bool,
    /// Longest delta chain a writer may create; 0 disables deltas.
    pub max_delta_chain: u32,
    /// Content shorter than this is never deltified.
    pub delta_min_size: usize,
    /// zstd level for representations and revprop packs.
    pub compression_level: i32,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            shard_size: None,
            enable_dir_deltification: true,
            enable_props_deltification: true,
            compress_packed_revprops: false,
            compress_representations: true,
            max_delta_chain: 16,
            delta_min_size: 0,
            compression_level: 3,
        }
    }
}

impl StoreConfig {
    /// Load config from a store root, falling back to defaults.
    pub fn load(root: &Path) -> Result<Self> {
        let config_path = root.join(CONFIG_FILE);
        if !config_path.exists() {
            return Ok(Self::default());
        }
        let data = fs::read_to_string(&config_path)?;
        let config: StoreConfig = serde_json::from_str(&data)?;
        Ok(config)
    }

    /// Save config to a store root.
    pub fn save(&self, root: &Path) -> Result<()> {
        let data = serde_json::to_string_pretty(self)?;
        fsutil::write_atomic(&root.join(CONFIG_FILE), data.as_bytes())?;
        Ok(())
    }

    pub fn with_shard_size(mut self, shard_size: u64) -> Self {
        self.shard_size = Some(shard_size);
        self
    }

    pub fn with_compressed_revprops(mut self, compress: bool) -> Self {
        self.compress_packed_revprops = compress;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_config_defaults_when_missing() {
        let tmp = TempDir::new().unwrap();
        let config = StoreConfig::load(tmp.path()).unwrap();
        assert_eq!(config, StoreConfig::default());
        assert!(config.enable_dir_deltification);
        assert!(!config.compress_packed_revprops);
    }

    #[test]
    fn test_config_save_and_load() {
        let tmp = TempDir::new().unwrap();
        let config = StoreConfig {
            enable_props_deltification: false,
            max_delta_chain: 4,
            ..StoreConfig::default()
        }
        .with_compressed_revprops(true);
        config.save(tmp.path()).unwrap();

        let loaded = StoreConfig::load(tmp.path()).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_config_partial_json_uses_defaults() {
        let tmp = TempDir::new().unwrap();
        fs::write(
            tmp.path().join(CONFIG_FILE),
            r#"{ "compress_packed_revprops": true }"#,
        )
        .unwrap();
        let config = StoreConfig::load(tmp.path()).unwrap();
        assert!(config.compress_packed_revprops);
        assert_eq!(config.max_delta_chain, 16);
        assert_eq!(config.shard_size, None);
    }
}
