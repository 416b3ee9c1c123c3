//! Ordered block directory.
//!
//! The index is a sorted array of fixed 24-byte entries living in the region
//! right after the header. Entries are ordered by `(FlowKey, generation)`;
//! `generation` is a store-wide insertion serial, so two blocks may share a
//! key (a flow's StartFlow marker and its first payload block do) while every
//! entry stays uniquely addressable.
//!
//! Lookups binary-search the array; inserts and removes shift the tail with a
//! single `copy_within`. Positions are never handed out: callers hold a
//! [`BlockRef`] and re-resolve it on every access.

use shmflow_error::Result;
use shmflow_shm::RegionGuard;
use shmflow_types::FlowKey;

use crate::layout::StoreLayout;

/// Serialized size of one index entry.
pub const INDEX_ENTRY_SIZE: usize = 24;

mod offsets {
    /// `u64`: raw [`shmflow_types::FlowKey`].
    pub const KEY: usize = 0;
    /// `u64`: insertion generation.
    pub const GENERATION: usize = 8;
    /// `u32`: slab slot holding the block.
    pub const SLOT: usize = 16;
}

/// Stable handle to a stored block.
///
/// Orders like the index itself. Survives concurrent inserts and erases; a
/// handle whose entry was erased simply no longer resolves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BlockRef {
    key: FlowKey,
    generation: u64,
}

impl BlockRef {
    #[must_use]
    pub const fn new(key: FlowKey, generation: u64) -> Self {
        Self { key, generation }
    }

    #[must_use]
    pub const fn key(&self) -> FlowKey {
        self.key
    }

    #[must_use]
    pub const fn generation(&self) -> u64 {
        self.generation
    }
}

/// One decoded index entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexEntry {
    pub key: FlowKey,
    pub generation: u64,
    pub slot: u32,
}

impl IndexEntry {
    #[must_use]
    pub const fn block_ref(&self) -> BlockRef {
        BlockRef::new(self.key, self.generation)
    }

    fn to_bytes(self) -> [u8; INDEX_ENTRY_SIZE] {
        let mut buf = [0_u8; INDEX_ENTRY_SIZE];
        buf[offsets::KEY..offsets::KEY + 8].copy_from_slice(&self.key.raw().to_le_bytes());
        buf[offsets::GENERATION..offsets::GENERATION + 8]
            .copy_from_slice(&self.generation.to_le_bytes());
        buf[offsets::SLOT..offsets::SLOT + 4].copy_from_slice(&self.slot.to_le_bytes());
        buf
    }
}

/// Index operations for one store layout. The caller holds the region lock
/// and owns the live entry count.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Index<'l> {
    layout: &'l StoreLayout,
}

impl<'l> Index<'l> {
    pub(crate) const fn new(layout: &'l StoreLayout) -> Self {
        Self { layout }
    }

    pub(crate) fn read(&self, guard: &RegionGuard<'_>, pos: usize) -> Result<IndexEntry> {
        let base = self.layout.index_entry_offset(pos);
        Ok(IndexEntry {
            key: FlowKey::from_raw(guard.read_u64(base + offsets::KEY)?),
            generation: guard.read_u64(base + offsets::GENERATION)?,
            slot: guard.read_u32(base + offsets::SLOT)?,
        })
    }

    fn read_ref(&self, guard: &RegionGuard<'_>, pos: usize) -> Result<BlockRef> {
        let base = self.layout.index_entry_offset(pos);
        Ok(BlockRef::new(
            FlowKey::from_raw(guard.read_u64(base + offsets::KEY)?),
            guard.read_u64(base + offsets::GENERATION)?,
        ))
    }

    /// First position in `[0, count)` whose entry does not satisfy `pred`.
    ///
    /// `pred` must be true for a prefix of the array and false afterwards.
    fn partition_point(
        &self,
        guard: &RegionGuard<'_>,
        count: usize,
        pred: impl Fn(BlockRef) -> bool,
    ) -> Result<usize> {
        let (mut lo, mut hi) = (0, count);
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            if pred(self.read_ref(guard, mid)?) {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        Ok(lo)
    }

    /// First position whose entry orders at or after `target`.
    pub(crate) fn lower_bound(
        &self,
        guard: &RegionGuard<'_>,
        count: usize,
        target: BlockRef,
    ) -> Result<usize> {
        self.partition_point(guard, count, |r| r < target)
    }

    /// First position whose entry orders strictly after `target`.
    pub(crate) fn upper_bound(
        &self,
        guard: &RegionGuard<'_>,
        count: usize,
        target: BlockRef,
    ) -> Result<usize> {
        self.partition_point(guard, count, |r| r <= target)
    }

    /// Position and entry of `target`, if still present.
    pub(crate) fn find(
        &self,
        guard: &RegionGuard<'_>,
        count: usize,
        target: BlockRef,
    ) -> Result<Option<(usize, IndexEntry)>> {
        let pos = self.lower_bound(guard, count, target)?;
        if pos == count {
            return Ok(None);
        }
        let entry = self.read(guard, pos)?;
        Ok((entry.block_ref() == target).then_some((pos, entry)))
    }

    /// Insert `entry` in order. `count` must be below the layout's capacity.
    pub(crate) fn insert(
        &self,
        guard: &mut RegionGuard<'_>,
        count: usize,
        entry: IndexEntry,
    ) -> Result<usize> {
        let pos = self.upper_bound(guard, count, entry.block_ref())?;
        if pos < count {
            guard.copy_within(
                self.layout.index_entry_offset(pos),
                self.layout.index_entry_offset(pos + 1),
                (count - pos) * INDEX_ENTRY_SIZE,
            )?;
        }
        guard.write_at(self.layout.index_entry_offset(pos), &entry.to_bytes())?;
        Ok(pos)
    }

    /// Remove the entry at `pos` and close the hole.
    pub(crate) fn remove(
        &self,
        guard: &mut RegionGuard<'_>,
        count: usize,
        pos: usize,
    ) -> Result<()> {
        let tail = count - pos - 1;
        if tail > 0 {
            guard.copy_within(
                self.layout.index_entry_offset(pos + 1),
                self.layout.index_entry_offset(pos),
                tail * INDEX_ENTRY_SIZE,
            )?;
        }
        guard.zero(self.layout.index_entry_offset(count - 1), INDEX_ENTRY_SIZE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shmflow_shm::ShmRegion;
    use shmflow_types::{FlowId, Side};

    fn key(flow: u32, seq: u32) -> FlowKey {
        FlowKey::new(FlowId::new(flow).unwrap(), Side::Source, seq)
    }

    fn entry(flow: u32, seq: u32, generation: u64) -> IndexEntry {
        IndexEntry {
            key: key(flow, seq),
            generation,
            slot: u32::try_from(generation).unwrap(),
        }
    }

    fn setup() -> (StoreLayout, ShmRegion) {
        let layout = StoreLayout::new(64, 16).unwrap();
        let region = ShmRegion::heap(layout.required_len().unwrap());
        (layout, region)
    }

    fn keys(index: &Index<'_>, guard: &RegionGuard<'_>, count: usize) -> Vec<(u32, u64)> {
        (0..count)
            .map(|pos| {
                let e = index.read(guard, pos).unwrap();
                (e.key.seq(), e.generation)
            })
            .collect()
    }

    #[test]
    fn test_insert_keeps_order() {
        let (layout, region) = setup();
        let index = Index::new(&layout);
        let mut guard = region.lock().unwrap();
        for (n, seq) in [300, 100, 200, 100].into_iter().enumerate() {
            index
                .insert(&mut guard, n, entry(1, seq, n as u64))
                .unwrap();
        }
        assert_eq!(
            keys(&index, &guard, 4),
            vec![(100, 1), (100, 3), (200, 2), (300, 0)]
        );
    }

    #[test]
    fn test_find_and_remove() {
        let (layout, region) = setup();
        let index = Index::new(&layout);
        let mut guard = region.lock().unwrap();
        for (n, seq) in [10, 20, 30].into_iter().enumerate() {
            index
                .insert(&mut guard, n, entry(1, seq, n as u64))
                .unwrap();
        }
        let target = entry(1, 20, 1).block_ref();
        let (pos, found) = index.find(&guard, 3, target).unwrap().unwrap();
        assert_eq!(pos, 1);
        assert_eq!(found.slot, 1);

        index.remove(&mut guard, 3, pos).unwrap();
        assert!(index.find(&guard, 2, target).unwrap().is_none());
        assert_eq!(keys(&index, &guard, 2), vec![(10, 0), (30, 2)]);
    }

    #[test]
    fn test_find_requires_matching_generation() {
        let (layout, region) = setup();
        let index = Index::new(&layout);
        let mut guard = region.lock().unwrap();
        index.insert(&mut guard, 0, entry(1, 10, 5)).unwrap();
        assert!(
            index
                .find(&guard, 1, BlockRef::new(key(1, 10), 4))
                .unwrap()
                .is_none()
        );
        assert!(
            index
                .find(&guard, 1, BlockRef::new(key(1, 10), 5))
                .unwrap()
                .is_some()
        );
    }

    #[test]
    fn test_bounds() {
        let (layout, region) = setup();
        let index = Index::new(&layout);
        let mut guard = region.lock().unwrap();
        for (n, seq) in [10, 20, 20, 30].into_iter().enumerate() {
            index
                .insert(&mut guard, n, entry(1, seq, n as u64))
                .unwrap();
        }
        let at_20 = BlockRef::new(key(1, 20), 0);
        assert_eq!(index.lower_bound(&guard, 4, at_20).unwrap(), 1);
        let past_20 = BlockRef::new(key(1, 20), u64::MAX);
        assert_eq!(index.upper_bound(&guard, 4, past_20).unwrap(), 3);
        let beyond = BlockRef::new(key(2, 0), 0);
        assert_eq!(index.lower_bound(&guard, 4, beyond).unwrap(), 4);
        assert_eq!(index.lower_bound(&guard, 0, beyond).unwrap(), 0);
    }

    #[test]
    fn test_remove_last_entry() {
        let (layout, region) = setup();
        let index = Index::new(&layout);
        let mut guard = region.lock().unwrap();
        index.insert(&mut guard, 0, entry(1, 10, 0)).unwrap();
        index.remove(&mut guard, 1, 0).unwrap();
        assert_eq!(index.read(&guard, 0).unwrap().key.raw(), 0);
    }
}
