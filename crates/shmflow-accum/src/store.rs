//! A locked view of the store region.
//!
//! [`LockedStore`] bundles the region guard with the layout and the dynamic
//! counters read at lock time. Every structural change (insert, remove)
//! updates the index, the slab, and the counters together and persists the
//! counters before returning, so another process taking the lock next always
//! sees a consistent header.

use shmflow_error::{Result, ShmflowError};
use shmflow_shm::{RegionGuard, ShmRegion};
use shmflow_types::{FlowKey, Micros};

use crate::block::{BlockHeader, BlockKind, PayloadWriter};
use crate::index::{BlockRef, Index, IndexEntry};
use crate::layout::{Counters, StoreLayout};
use crate::slab::{Slab, SlotWriter};

pub(crate) struct LockedStore<'a> {
    guard: RegionGuard<'a>,
    layout: &'a StoreLayout,
    counters: Counters,
}

impl<'a> LockedStore<'a> {
    pub(crate) fn lock(region: &'a ShmRegion, layout: &'a StoreLayout) -> Result<Self> {
        let guard = region.lock()?;
        let counters = Counters::load(&guard)?;
        if counters.entry_count > layout.max_blocks() {
            return Err(ShmflowError::layout(format!(
                "entry count {} exceeds capacity {}",
                counters.entry_count,
                layout.max_blocks()
            )));
        }
        Ok(Self {
            guard,
            layout,
            counters,
        })
    }

    const fn index(&self) -> Index<'a> {
        Index::new(self.layout)
    }

    const fn slab(&self) -> Slab<'a> {
        Slab::new(self.layout)
    }

    pub(crate) const fn len(&self) -> usize {
        self.counters.entry_count as usize
    }

    pub(crate) const fn is_empty(&self) -> bool {
        self.counters.entry_count == 0
    }

    pub(crate) const fn counters(&self) -> &Counters {
        &self.counters
    }

    pub(crate) fn entry(&self, pos: usize) -> Result<IndexEntry> {
        self.index().read(&self.guard, pos)
    }

    /// First position ordering at or after `(key, generation)`.
    pub(crate) fn lower_bound(&self, key: FlowKey, generation: u64) -> Result<usize> {
        self.index()
            .lower_bound(&self.guard, self.len(), BlockRef::new(key, generation))
    }

    /// First position ordering strictly after `(key, generation)`.
    pub(crate) fn upper_bound(&self, key: FlowKey, generation: u64) -> Result<usize> {
        self.index()
            .upper_bound(&self.guard, self.len(), BlockRef::new(key, generation))
    }

    pub(crate) fn resolve(&self, handle: &BlockRef) -> Result<Option<(usize, IndexEntry)>> {
        self.index().find(&self.guard, self.len(), *handle)
    }

    pub(crate) fn header(&self, slot: u32) -> Result<BlockHeader> {
        self.slab().read_header(&self.guard, slot)
    }

    pub(crate) fn set_header(&mut self, slot: u32, header: &BlockHeader) -> Result<()> {
        let slab = self.slab();
        slab.write_header(&mut self.guard, slot, header)
    }

    pub(crate) fn payload(&self, slot: u32, len: usize) -> Result<Vec<u8>> {
        self.slab().read_payload(&self.guard, slot, len)
    }

    pub(crate) fn writer(&mut self, slot: u32) -> SlotWriter<'_, 'a> {
        let slab = self.slab();
        slab.writer(&mut self.guard, slot)
    }

    /// Allocate a slot, write a new block with `prefix` as its first payload
    /// bytes, and index it under `key`.
    pub(crate) fn insert_block(
        &mut self,
        kind: BlockKind,
        key: FlowKey,
        prefix: &[u8],
        complete: bool,
        now: Micros,
    ) -> Result<IndexEntry> {
        let slab = self.slab();
        let mut counters = self.counters;
        let slot = slab.alloc(&self.guard, &mut counters)?;

        let mut header = BlockHeader::new(kind, key.seq(), prefix.len() as u64, now);
        header.is_complete = complete;
        slab.write_header(&mut self.guard, slot, &header)?;
        slab.writer(&mut self.guard, slot).write_payload(0, prefix)?;

        let entry = IndexEntry {
            key,
            generation: counters.next_generation,
            slot,
        };
        let count = self.len();
        self.index().insert(&mut self.guard, count, entry)?;
        counters.next_generation += 1;
        counters.entry_count += 1;
        self.persist(counters)?;
        Ok(entry)
    }

    /// Remove the entry at `pos` and free its slot.
    pub(crate) fn remove_at(&mut self, pos: usize) -> Result<IndexEntry> {
        let entry = self.entry(pos)?;
        let mut counters = self.counters;
        let count = self.len();
        self.index().remove(&mut self.guard, count, pos)?;
        self.slab().free(&mut self.guard, &mut counters, entry.slot)?;
        counters.entry_count -= 1;
        self.persist(counters)?;
        Ok(entry)
    }

    fn persist(&mut self, counters: Counters) -> Result<()> {
        counters.store(&mut self.guard)?;
        self.counters = counters;
        Ok(())
    }
}
