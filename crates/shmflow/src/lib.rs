//! Public API facade for shmflow.
//!
//! Reassembles TCP byte streams into a block store that independent
//! processes share through one backing file, and drains it with a pool of
//! shard threads.
//!
//! ```no_run
//! use std::sync::Arc;
//! use shmflow::{CollectingSink, ShardPool, ShmflowConfig, open_store};
//!
//! # fn main() -> shmflow::Result<()> {
//! let config = ShmflowConfig::from_json_str(r#"{"region_path": "/dev/shm/flows"}"#)?;
//! let store = Arc::new(open_store(&config)?);
//! let sink = CollectingSink::new();
//! let pool = ShardPool::spawn(Arc::clone(&store), Arc::new(sink.clone()), config.shards)?;
//! // ... feed `store.put(&segment)` from the decoder ...
//! pool.shutdown()?;
//! # Ok(())
//! # }
//! ```

pub mod config;

use std::io;
use std::path::Path;

use shmflow_shm::ShmRegion;
use tracing::{debug, info};

pub use config::ShmflowConfig;
pub use shmflow_accum::{
    Accumulator, BlockHeader, BlockKind, BlockRef, BlockSegments, FRAME_PREFIX_LEN,
    ISN_PREFIX_LEN, PayloadWriter, PushCode, PutOutcome, SequenceGate, StoreConfig, StoreStats,
    StoredBlock,
};
pub use shmflow_error::{Result, ShmflowError};
pub use shmflow_shard::{
    CollectingSink, Distributor, DrainStats, GapEvent, Handler, HandlerHandle, PollStats,
    ShardConfig, ShardPool, StreamSink,
};
pub use shmflow_shm::default_region_path;
pub use shmflow_types::{
    Clock, Cx, FlowId, FlowKey, ManualClock, Micros, Segment, Seq, Side, SystemClock,
};

/// Format a fresh store. A file-backed region is created or truncated.
pub fn create_store(config: &ShmflowConfig) -> Result<Accumulator> {
    config.validate()?;
    let len = Accumulator::required_region_len(&config.store)?;
    let region = match &config.region_path {
        Some(path) => ShmRegion::create(path, len)?,
        None => ShmRegion::heap(len),
    };
    Accumulator::create(region, config.store.clone())
}

/// Attach to the store at `config.region_path`, formatting it first if the
/// file does not exist yet. Without a path this is [`create_store`].
///
/// Processes racing to create the same store all end up attached to one
/// formatted region: the store is formatted under a temporary name and
/// published with a no-clobber link, so the path never names a partially
/// formatted file.
pub fn open_store(config: &ShmflowConfig) -> Result<Accumulator> {
    config.validate()?;
    let Some(path) = &config.region_path else {
        return create_store(config);
    };
    if !path.exists() {
        publish_new_store(config, path)?;
    }
    let region = ShmRegion::open(path)?;
    Accumulator::attach(region, config.store.clone())
}

fn publish_new_store(config: &ShmflowConfig, path: &Path) -> Result<()> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    // Closed before formatting: closing any descriptor of the published
    // inode would release this process's record locks on it.
    let staging = tempfile::Builder::new()
        .prefix(".shmflow-")
        .tempfile_in(dir)?
        .into_temp_path();
    let len = Accumulator::required_region_len(&config.store)?;
    drop(Accumulator::create(
        ShmRegion::create(&staging, len)?,
        config.store.clone(),
    )?);

    match staging.persist_noclobber(path) {
        Ok(()) => {
            info!(path = %path.display(), "created flow store");
            Ok(())
        }
        Err(err) if err.error.kind() == io::ErrorKind::AlreadyExists => {
            debug!(path = %path.display(), "flow store created concurrently");
            Ok(())
        }
        Err(err) => Err(err.error.into()),
    }
}
