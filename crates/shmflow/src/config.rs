//! Top-level configuration, loaded from JSON.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use shmflow_accum::StoreConfig;
use shmflow_error::Result;
use shmflow_shard::ShardConfig;

/// Everything needed to open a store and run its shards.
///
/// Every field has a default, so `{}` is a valid configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ShmflowConfig {
    /// Backing file shared between processes. `None` keeps the store in
    /// process memory.
    pub region_path: Option<PathBuf>,
    pub store: StoreConfig,
    pub shards: ShardConfig,
}

impl ShmflowConfig {
    /// Parse and validate a JSON document.
    pub fn from_json_str(text: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a JSON file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }

    pub fn validate(&self) -> Result<()> {
        self.store.validate()?;
        self.shards.validate()?;
        self.shards.check_writer_timeout(&self.store)
    }

    pub fn to_json_string(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}
