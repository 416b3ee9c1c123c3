//! Store header layout.
//!
//! A store region is laid out as:
//!
//! ```text
//! header (128 B) | index (max_blocks × 24 B) | slab (max_blocks × slot_size)
//! ```
//!
//! The header carries immutable geometry (magic, version, block capacity,
//! block count, region offsets, slot size) protected by an xxh3_64 checksum,
//! followed by the dynamic counters that every structural operation updates
//! under the region lock. All fields are little-endian at fixed offsets; no
//! pointers are stored anywhere in the region.

use shmflow_error::{Result, ShmflowError};
use shmflow_shm::RegionGuard;
use xxhash_rust::xxh3::xxh3_64;

use crate::block::{
    BLOCK_HEADER_SIZE, FRAME_PREFIX_LEN, ISN_PREFIX_LEN, read_u32, read_u64, write_u32, write_u64,
};
use crate::index::INDEX_ENTRY_SIZE;

// ---------------------------------------------------------------------------
// Wire-format offsets
// ---------------------------------------------------------------------------

/// Byte offsets and sizes for the store header wire format.
mod offsets {
    /// `[u8;8]`: `"SHMFLOW\0"`.
    pub const MAGIC: usize = 0;
    pub const MAGIC_LEN: usize = 8;

    /// `u32`: layout version.
    pub const VERSION: usize = 8;

    /// `u32`: payload bytes per block.
    pub const BLOCK_CAPACITY: usize = 12;

    /// `u32`: number of block slots (and index entries).
    pub const MAX_BLOCKS: usize = 16;

    /// `u32`: alignment padding (always 0).
    pub const ALIGN0: usize = 20;

    /// `u64`: index region offset.
    pub const INDEX_OFFSET: usize = 24;

    /// `u64`: slab region offset.
    pub const SLAB_OFFSET: usize = 32;

    /// `u64`: bytes per slab slot.
    pub const SLOT_SIZE: usize = 40;

    /// `u64`: xxh3_64 checksum over immutable fields.
    pub const LAYOUT_CHECKSUM: usize = 48;

    /// `u32`: live index entries.
    pub const ENTRY_COUNT: usize = 56;

    /// `u32`: head of the slot free list (`slot + 1`, 0 = empty).
    pub const FREE_HEAD: usize = 60;

    /// `u32`: slots ever handed out; slots at or above are untouched.
    pub const HIGH_WATER: usize = 64;

    /// `u32`: alignment padding (always 0).
    pub const ALIGN1: usize = 68;

    /// `u64`: next insertion generation.
    pub const NEXT_GENERATION: usize = 72;

    /// Reserved padding to 128 bytes.
    pub const _PADDING: usize = 80;

    /// Total header size in bytes.
    pub const HEADER_SIZE: usize = 128;
}

/// Magic bytes identifying a shmflow store.
const MAGIC: [u8; 8] = *b"SHMFLOW\0";

/// Current layout version.
pub const LAYOUT_VERSION: u32 = 1;

/// Size of the store header.
pub const STORE_HEADER_SIZE: usize = offsets::HEADER_SIZE;

/// Smallest block capacity that can frame a one-byte segment.
#[allow(clippy::cast_possible_truncation)]
pub const MIN_BLOCK_CAPACITY: u32 = (ISN_PREFIX_LEN + FRAME_PREFIX_LEN + 1) as u32;

// ---------------------------------------------------------------------------
// StoreLayout
// ---------------------------------------------------------------------------

/// Immutable store geometry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreLayout {
    block_capacity: u32,
    max_blocks: u32,
    index_offset: u64,
    slab_offset: u64,
    slot_size: u64,
    layout_checksum: u64,
}

impl StoreLayout {
    /// Compute the layout for `max_blocks` blocks of `block_capacity` payload bytes.
    pub fn new(block_capacity: u32, max_blocks: u32) -> Result<Self> {
        if block_capacity < MIN_BLOCK_CAPACITY {
            return Err(ShmflowError::invalid_config(format!(
                "block capacity {block_capacity} cannot frame a segment (minimum {MIN_BLOCK_CAPACITY})"
            )));
        }
        if max_blocks == 0 {
            return Err(ShmflowError::invalid_config("store needs at least one block"));
        }

        let index_offset = STORE_HEADER_SIZE as u64;
        let index_bytes = u64::from(max_blocks) * INDEX_ENTRY_SIZE as u64;
        let slab_offset = align8(index_offset + index_bytes);
        let slot_size = align8(BLOCK_HEADER_SIZE as u64 + u64::from(block_capacity));

        let layout = Self {
            block_capacity,
            max_blocks,
            index_offset,
            slab_offset,
            slot_size,
            layout_checksum: 0,
        };
        // Reject geometries that do not fit the address space up front.
        layout.required_len()?;
        Ok(Self {
            layout_checksum: layout.compute_checksum(),
            ..layout
        })
    }

    /// Total region length this layout occupies.
    pub fn required_len(&self) -> Result<usize> {
        u64::from(self.max_blocks)
            .checked_mul(self.slot_size)
            .and_then(|slab| slab.checked_add(self.slab_offset))
            .and_then(|total| usize::try_from(total).ok())
            .ok_or_else(|| ShmflowError::layout("store geometry exceeds address space"))
    }

    #[must_use]
    pub const fn block_capacity(&self) -> u32 {
        self.block_capacity
    }

    #[must_use]
    pub const fn max_blocks(&self) -> u32 {
        self.max_blocks
    }

    #[must_use]
    pub const fn layout_checksum(&self) -> u64 {
        self.layout_checksum
    }

    /// Region offset of index entry `pos`.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn index_entry_offset(&self, pos: usize) -> usize {
        self.index_offset as usize + pos * INDEX_ENTRY_SIZE
    }

    /// Region offset of slab slot `slot`.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn slot_offset(&self, slot: u32) -> usize {
        self.slab_offset as usize + slot as usize * self.slot_size as usize
    }

    /// Write a fresh header with zeroed counters.
    pub fn format(&self, guard: &mut RegionGuard<'_>) -> Result<()> {
        let required = self.required_len()?;
        if guard.len() < required {
            return Err(ShmflowError::RegionTooSmall {
                required,
                actual: guard.len(),
            });
        }
        guard.write_at(0, &self.to_bytes())
    }

    /// Read and validate the header of an already formatted region.
    ///
    /// Validates magic, version, checksum, offsets, and region length. Any
    /// mismatch is fatal: the caller must not use the region.
    pub fn attach(guard: &RegionGuard<'_>) -> Result<Self> {
        if guard.len() < STORE_HEADER_SIZE {
            return Err(ShmflowError::RegionTooSmall {
                required: STORE_HEADER_SIZE,
                actual: guard.len(),
            });
        }
        let buf = guard.read_vec(0, STORE_HEADER_SIZE)?;
        let layout = Self::from_bytes(&buf)?;
        let required = layout.required_len()?;
        if guard.len() < required {
            return Err(ShmflowError::RegionTooSmall {
                required,
                actual: guard.len(),
            });
        }
        Ok(layout)
    }

    /// Parse the immutable header fields.
    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        if buf.len() < STORE_HEADER_SIZE {
            return Err(ShmflowError::RegionTooSmall {
                required: STORE_HEADER_SIZE,
                actual: buf.len(),
            });
        }

        // Validate magic.
        if buf[offsets::MAGIC..offsets::MAGIC + offsets::MAGIC_LEN] != MAGIC {
            return Err(ShmflowError::BadMagic);
        }

        // Validate version.
        let version = read_u32(buf, offsets::VERSION);
        if version != LAYOUT_VERSION {
            return Err(ShmflowError::VersionMismatch {
                expected: LAYOUT_VERSION,
                found: version,
            });
        }

        let layout = Self {
            block_capacity: read_u32(buf, offsets::BLOCK_CAPACITY),
            max_blocks: read_u32(buf, offsets::MAX_BLOCKS),
            index_offset: read_u64(buf, offsets::INDEX_OFFSET),
            slab_offset: read_u64(buf, offsets::SLAB_OFFSET),
            slot_size: read_u64(buf, offsets::SLOT_SIZE),
            layout_checksum: read_u64(buf, offsets::LAYOUT_CHECKSUM),
        };

        // Validate checksum.
        if layout.layout_checksum != layout.compute_checksum() {
            return Err(ShmflowError::ChecksumMismatch);
        }

        // A consistent checksum over a geometry we would not produce means a
        // foreign writer; refuse it rather than trust its offsets.
        let expected = Self::new(layout.block_capacity, layout.max_blocks)
            .map_err(|e| ShmflowError::layout(e.to_string()))?;
        if expected != layout {
            return Err(ShmflowError::layout(format!(
                "offsets do not match geometry: found {layout:?}, expected {expected:?}"
            )));
        }
        Ok(layout)
    }

    /// Serialize the immutable fields into a header buffer (counters zeroed).
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = vec![0_u8; STORE_HEADER_SIZE];
        buf[offsets::MAGIC..offsets::MAGIC + offsets::MAGIC_LEN].copy_from_slice(&MAGIC);
        write_u32(&mut buf, offsets::VERSION, LAYOUT_VERSION);
        write_u32(&mut buf, offsets::BLOCK_CAPACITY, self.block_capacity);
        write_u32(&mut buf, offsets::MAX_BLOCKS, self.max_blocks);
        write_u32(&mut buf, offsets::ALIGN0, 0);
        write_u64(&mut buf, offsets::INDEX_OFFSET, self.index_offset);
        write_u64(&mut buf, offsets::SLAB_OFFSET, self.slab_offset);
        write_u64(&mut buf, offsets::SLOT_SIZE, self.slot_size);
        write_u64(&mut buf, offsets::LAYOUT_CHECKSUM, self.layout_checksum);
        write_u32(&mut buf, offsets::ALIGN1, 0);
        buf
    }

    /// Compute the xxh3_64 checksum over all immutable fields.
    fn compute_checksum(&self) -> u64 {
        // Feed immutable fields in a canonical LE byte order.
        let mut data = Vec::with_capacity(48);
        data.extend_from_slice(&MAGIC);
        data.extend_from_slice(&LAYOUT_VERSION.to_le_bytes());
        data.extend_from_slice(&self.block_capacity.to_le_bytes());
        data.extend_from_slice(&self.max_blocks.to_le_bytes());
        data.extend_from_slice(&self.index_offset.to_le_bytes());
        data.extend_from_slice(&self.slab_offset.to_le_bytes());
        data.extend_from_slice(&self.slot_size.to_le_bytes());
        xxh3_64(&data)
    }
}

// ---------------------------------------------------------------------------
// Counters
// ---------------------------------------------------------------------------

/// Dynamic header fields. Read at the start of every locked operation and
/// written back before the lock is released.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Counters {
    pub entry_count: u32,
    pub free_head: u32,
    pub high_water: u32,
    pub next_generation: u64,
}

impl Counters {
    pub fn load(guard: &RegionGuard<'_>) -> Result<Self> {
        Ok(Self {
            entry_count: guard.read_u32(offsets::ENTRY_COUNT)?,
            free_head: guard.read_u32(offsets::FREE_HEAD)?,
            high_water: guard.read_u32(offsets::HIGH_WATER)?,
            next_generation: guard.read_u64(offsets::NEXT_GENERATION)?,
        })
    }

    pub fn store(&self, guard: &mut RegionGuard<'_>) -> Result<()> {
        guard.write_u32(offsets::ENTRY_COUNT, self.entry_count)?;
        guard.write_u32(offsets::FREE_HEAD, self.free_head)?;
        guard.write_u32(offsets::HIGH_WATER, self.high_water)?;
        guard.write_u64(offsets::NEXT_GENERATION, self.next_generation)
    }
}

const fn align8(n: u64) -> u64 {
    (n + 7) & !7
}
