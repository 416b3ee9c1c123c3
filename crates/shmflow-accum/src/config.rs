use serde::{Deserialize, Serialize};
use shmflow_error::{Result, ShmflowError};

use crate::block::DEFAULT_BLOCK_CAPACITY;
use crate::layout::MIN_BLOCK_CAPACITY;

/// Default number of block slots in a store.
pub const DEFAULT_MAX_BLOCKS: u32 = 1024;

/// Default idle time after which an open block is closed (100 ms).
pub const DEFAULT_BLOCK_IDLE_TIMEOUT_US: u64 = 100_000;

/// Default idle time after which a writer forgets a flow (5 s).
pub const DEFAULT_WRITER_FLOW_TIMEOUT_US: u64 = 5_000_000;

/// Store geometry and write-path timing.
///
/// Geometry (`block_capacity`, `max_blocks`) is fixed when the region is
/// formatted; attaching processes take it from the region header.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Payload bytes per block.
    pub block_capacity: u32,
    /// Number of block slots.
    pub max_blocks: u32,
    /// Idle time before an open block is closed, and the grace window a
    /// closed block ages before it may be drained.
    pub block_idle_timeout_us: u64,
    /// Idle time before the writer drops its per-flow cursor.
    pub writer_flow_timeout_us: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            block_capacity: DEFAULT_BLOCK_CAPACITY,
            max_blocks: DEFAULT_MAX_BLOCKS,
            block_idle_timeout_us: DEFAULT_BLOCK_IDLE_TIMEOUT_US,
            writer_flow_timeout_us: DEFAULT_WRITER_FLOW_TIMEOUT_US,
        }
    }
}

impl StoreConfig {
    pub fn validate(&self) -> Result<()> {
        if self.block_capacity < MIN_BLOCK_CAPACITY {
            return Err(ShmflowError::invalid_config(format!(
                "store.block_capacity must be at least {MIN_BLOCK_CAPACITY}, got {}",
                self.block_capacity
            )));
        }
        if self.max_blocks == 0 {
            return Err(ShmflowError::invalid_config(
                "store.max_blocks must be non-zero",
            ));
        }
        if self.block_idle_timeout_us == 0 {
            return Err(ShmflowError::invalid_config(
                "store.block_idle_timeout_us must be non-zero",
            ));
        }
        if self.writer_flow_timeout_us == 0 {
            return Err(ShmflowError::invalid_config(
                "store.writer_flow_timeout_us must be non-zero",
            ));
        }
        Ok(())
    }
}
