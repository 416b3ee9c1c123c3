//! Sharded draining of the flow store.
//!
//! The [`Distributor`] discovers new flows through StartFlow markers and
//! assigns each to exactly one [`Handler`]; handlers drain their flows' blocks
//! in sequence order into a [`StreamSink`]. [`ShardPool`] runs them on OS
//! threads until cancelled.

pub mod config;
pub mod distributor;
pub mod handler;
pub mod pool;
pub mod sink;

pub use config::{
    DEFAULT_ASSIGNMENT_SWEEP_INTERVAL_US, DEFAULT_FLOW_TIMEOUT_US, DEFAULT_HANDLER_COUNT,
    DEFAULT_IDLE_CHECK_INTERVAL_US, ShardConfig,
};
pub use distributor::{Distributor, PollStats};
pub use handler::{DrainStats, Handler, HandlerHandle};
pub use pool::ShardPool;
pub use sink::{CollectingSink, GapEvent, StreamSink};
