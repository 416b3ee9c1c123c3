//! Fixed-size block slots.
//!
//! Slots are handed out from a singly linked free list threaded through the
//! free slots themselves (`kind = FREE_KIND`, `reserved = next + 1`), falling
//! back to the high-water mark for slots never used. Links are slot indices,
//! never addresses.

use shmflow_error::{Result, ShmflowError};
use shmflow_shm::RegionGuard;

use crate::block::{self, BLOCK_HEADER_SIZE, BlockHeader, FREE_KIND, PayloadWriter};
use crate::layout::{Counters, StoreLayout};

#[derive(Debug, Clone, Copy)]
pub(crate) struct Slab<'l> {
    layout: &'l StoreLayout,
}

impl<'l> Slab<'l> {
    pub(crate) const fn new(layout: &'l StoreLayout) -> Self {
        Self { layout }
    }

    /// Take a slot off the free list, or the next never-used slot.
    pub(crate) fn alloc(&self, guard: &RegionGuard<'_>, counters: &mut Counters) -> Result<u32> {
        if counters.free_head != 0 {
            let slot = counters.free_head - 1;
            if slot >= counters.high_water {
                return Err(ShmflowError::layout(format!(
                    "free list points past high water: slot {slot}"
                )));
            }
            let base = self.layout.slot_offset(slot);
            if guard.read_u32(base + block::offsets::KIND)? != FREE_KIND {
                return Err(ShmflowError::layout(format!(
                    "free list entry {slot} is in use"
                )));
            }
            counters.free_head = guard.read_u32(base + block::offsets::RESERVED)?;
            return Ok(slot);
        }
        if counters.high_water < self.layout.max_blocks() {
            let slot = counters.high_water;
            counters.high_water += 1;
            return Ok(slot);
        }
        Err(ShmflowError::StoreFull {
            max_blocks: self.layout.max_blocks(),
        })
    }

    /// Return `slot` to the free list.
    pub(crate) fn free(
        &self,
        guard: &mut RegionGuard<'_>,
        counters: &mut Counters,
        slot: u32,
    ) -> Result<()> {
        let base = self.layout.slot_offset(slot);
        guard.write_u32(base + block::offsets::KIND, FREE_KIND)?;
        guard.write_u32(base + block::offsets::RESERVED, counters.free_head)?;
        counters.free_head = slot + 1;
        Ok(())
    }

    pub(crate) fn read_header(&self, guard: &RegionGuard<'_>, slot: u32) -> Result<BlockHeader> {
        let mut buf = [0_u8; BLOCK_HEADER_SIZE];
        guard.read_at(self.layout.slot_offset(slot), &mut buf)?;
        Ok(BlockHeader::from_bytes(&buf))
    }

    pub(crate) fn write_header(
        &self,
        guard: &mut RegionGuard<'_>,
        slot: u32,
        header: &BlockHeader,
    ) -> Result<()> {
        guard.write_at(self.layout.slot_offset(slot), &header.to_bytes())
    }

    /// Copy out the first `len` bytes of the payload area.
    pub(crate) fn read_payload(
        &self,
        guard: &RegionGuard<'_>,
        slot: u32,
        len: usize,
    ) -> Result<Vec<u8>> {
        let len = len.min(self.layout.block_capacity() as usize);
        guard.read_vec(self.layout.slot_offset(slot) + BLOCK_HEADER_SIZE, len)
    }

    pub(crate) fn writer<'g, 'r>(
        &self,
        guard: &'g mut RegionGuard<'r>,
        slot: u32,
    ) -> SlotWriter<'g, 'r> {
        SlotWriter {
            guard,
            base: self.layout.slot_offset(slot) + BLOCK_HEADER_SIZE,
            capacity: self.layout.block_capacity() as usize,
        }
    }
}

/// Writes into one slot's payload area, refusing to spill into the next slot.
pub(crate) struct SlotWriter<'g, 'r> {
    guard: &'g mut RegionGuard<'r>,
    base: usize,
    capacity: usize,
}

impl PayloadWriter for SlotWriter<'_, '_> {
    fn write_payload(&mut self, at: usize, bytes: &[u8]) -> Result<()> {
        if at + bytes.len() > self.capacity {
            return Err(ShmflowError::OutOfBounds {
                offset: at,
                len: bytes.len(),
                region_len: self.capacity,
            });
        }
        self.guard.write_at(self.base + at, bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::BlockKind;
    use shmflow_shm::ShmRegion;

    fn setup(blocks: u32) -> (StoreLayout, ShmRegion) {
        let layout = StoreLayout::new(64, blocks).unwrap();
        let region = ShmRegion::heap(layout.required_len().unwrap());
        (layout, region)
    }

    #[test]
    fn test_alloc_until_full() {
        let (layout, region) = setup(3);
        let slab = Slab::new(&layout);
        let guard = region.lock().unwrap();
        let mut counters = Counters::default();
        let slots: Vec<u32> = (0..3)
            .map(|_| slab.alloc(&guard, &mut counters).unwrap())
            .collect();
        assert_eq!(slots, vec![0, 1, 2]);
        assert!(matches!(
            slab.alloc(&guard, &mut counters),
            Err(ShmflowError::StoreFull { max_blocks: 3 })
        ));
    }

    #[test]
    fn test_freed_slots_are_reused_lifo() {
        let (layout, region) = setup(4);
        let slab = Slab::new(&layout);
        let mut guard = region.lock().unwrap();
        let mut counters = Counters::default();
        for _ in 0..3 {
            slab.alloc(&guard, &mut counters).unwrap();
        }
        slab.free(&mut guard, &mut counters, 0).unwrap();
        slab.free(&mut guard, &mut counters, 2).unwrap();
        assert_eq!(slab.alloc(&guard, &mut counters).unwrap(), 2);
        assert_eq!(slab.alloc(&guard, &mut counters).unwrap(), 0);
        assert_eq!(slab.alloc(&guard, &mut counters).unwrap(), 3);
        assert_eq!(counters.free_head, 0);
        assert_eq!(counters.high_water, 4);
    }

    #[test]
    fn test_corrupt_free_list_detected() {
        let (layout, region) = setup(4);
        let slab = Slab::new(&layout);
        let mut guard = region.lock().unwrap();
        let mut counters = Counters::default();
        let slot = slab.alloc(&guard, &mut counters).unwrap();
        slab.free(&mut guard, &mut counters, slot).unwrap();
        let header = BlockHeader::new(BlockKind::L4Payload, 0, 4, 1);
        slab.write_header(&mut guard, slot, &header).unwrap();
        assert!(slab.alloc(&guard, &mut counters).unwrap_err().is_layout_error());
    }

    #[test]
    fn test_header_and_payload_round_trip() {
        let (layout, region) = setup(2);
        let slab = Slab::new(&layout);
        let mut guard = region.lock().unwrap();
        let header = BlockHeader::new(BlockKind::L4Payload, 77, 4, 5);
        slab.write_header(&mut guard, 1, &header).unwrap();
        slab.writer(&mut guard, 1)
            .write_payload(0, &[1, 2, 3, 4])
            .unwrap();
        assert_eq!(slab.read_header(&guard, 1).unwrap(), header);
        assert_eq!(slab.read_payload(&guard, 1, 4).unwrap(), vec![1, 2, 3, 4]);
        // Slot 0 untouched.
        assert!(slab.read_payload(&guard, 0, 4).unwrap().iter().all(|&b| b == 0));
    }

    #[test]
    fn test_writer_refuses_overflow() {
        let (layout, region) = setup(2);
        let slab = Slab::new(&layout);
        let mut guard = region.lock().unwrap();
        let mut writer = slab.writer(&mut guard, 0);
        assert!(writer.write_payload(60, &[0; 4]).is_ok());
        assert!(matches!(
            writer.write_payload(61, &[0; 4]),
            Err(ShmflowError::OutOfBounds { .. })
        ));
    }
}
