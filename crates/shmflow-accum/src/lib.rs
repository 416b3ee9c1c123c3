//! Shared flow accumulator.
//!
//! The store is one fixed-size region holding a header, a sorted index of
//! `(FlowKey, generation)` entries and a slab of equally sized blocks:
//!
//! ```text
//! [ header 128 B ][ index: max_blocks x 24 B ][ slab: max_blocks x slot_size ]
//! ```
//!
//! Writers append segments through [`Accumulator::put`]; the
//! [`SequenceGate`] decides whether a segment continues a block. Readers
//! discover new flows through StartFlow markers ([`Accumulator::get`]) and
//! walk a flow's blocks in key order.

pub mod accumulator;
pub mod block;
pub mod config;
pub mod index;
pub mod layout;
mod slab;
mod store;

pub use accumulator::{Accumulator, PutOutcome, StoreStats, StoredBlock};
pub use block::{
    BLOCK_HEADER_SIZE, BlockHeader, BlockKind, BlockSegments, DEFAULT_BLOCK_CAPACITY,
    FRAME_PREFIX_LEN, ISN_PREFIX_LEN, PayloadWriter, PushCode, SequenceGate,
};
pub use config::{
    DEFAULT_BLOCK_IDLE_TIMEOUT_US, DEFAULT_MAX_BLOCKS, DEFAULT_WRITER_FLOW_TIMEOUT_US, StoreConfig,
};
pub use index::{BlockRef, INDEX_ENTRY_SIZE, IndexEntry};
pub use layout::{LAYOUT_VERSION, MIN_BLOCK_CAPACITY, STORE_HEADER_SIZE, StoreLayout};
