use serde::{Deserialize, Serialize};
use shmflow_accum::StoreConfig;
use shmflow_error::{Result, ShmflowError};
use shmflow_types::Micros;

/// Default number of handler threads.
pub const DEFAULT_HANDLER_COUNT: usize = 4;

/// Default idle time after which a handler drops a flow (10 s).
pub const DEFAULT_FLOW_TIMEOUT_US: Micros = 10_000_000;

/// Default interval between assignment-map sweeps (5 s).
pub const DEFAULT_ASSIGNMENT_SWEEP_INTERVAL_US: Micros = 5_000_000;

/// Default minimum interval between distributor polls (1 s).
pub const DEFAULT_IDLE_CHECK_INTERVAL_US: Micros = 1_000_000;

/// Sharding layer settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ShardConfig {
    /// Number of handler threads (shards).
    pub handler_count: usize,
    /// Idle time after which a handler expires a flow with nothing pending.
    pub flow_timeout_us: Micros,
    /// How often the distributor releases assignments of expired flows.
    pub assignment_sweep_interval_us: Micros,
    /// Minimum time between two distributor polls.
    pub idle_check_interval_us: Micros,
}

impl Default for ShardConfig {
    fn default() -> Self {
        Self {
            handler_count: DEFAULT_HANDLER_COUNT,
            flow_timeout_us: DEFAULT_FLOW_TIMEOUT_US,
            assignment_sweep_interval_us: DEFAULT_ASSIGNMENT_SWEEP_INTERVAL_US,
            idle_check_interval_us: DEFAULT_IDLE_CHECK_INTERVAL_US,
        }
    }
}

impl ShardConfig {
    pub fn validate(&self) -> Result<()> {
        if self.handler_count == 0 {
            return Err(ShmflowError::invalid_config(
                "shards.handler_count must be at least 1",
            ));
        }
        if self.flow_timeout_us == 0 {
            return Err(ShmflowError::invalid_config(
                "shards.flow_timeout_us must be non-zero",
            ));
        }
        Ok(())
    }

    /// Check the handler timeout against the writer's.
    ///
    /// A writer must forget a flow before the handler does, otherwise the
    /// flow's next burst carries no StartFlow marker and no handler claims it.
    pub fn check_writer_timeout(&self, store: &StoreConfig) -> Result<()> {
        if store.writer_flow_timeout_us >= self.flow_timeout_us {
            return Err(ShmflowError::invalid_config(format!(
                "store.writer_flow_timeout_us ({}) must be below shards.flow_timeout_us ({})",
                store.writer_flow_timeout_us, self.flow_timeout_us
            )));
        }
        Ok(())
    }
}
