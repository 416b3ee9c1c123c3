//! Fixed-size block records and the sequence-continuity gate.
//!
//! A block is a 40-byte little-endian header followed by a payload area of
//! `capacity` bytes. Payload blocks begin with the 4-byte initial sequence
//! number of their (flow, side); every accepted segment after that is framed
//! as `[len: u32 LE][bytes]`. The header is serialized with explicit
//! `to_le_bytes`/`from_le_bytes` at fixed offsets so any process can read it.

use shmflow_error::Result;
use shmflow_types::{Micros, Seq};

/// Default payload bytes per block (32 × 256).
pub const DEFAULT_BLOCK_CAPACITY: u32 = 32 * 256;

/// Length of the per-segment frame prefix.
pub const FRAME_PREFIX_LEN: usize = 4;

/// Length of the initial-sequence prefix at the start of every payload area.
pub const ISN_PREFIX_LEN: usize = 4;

/// Byte offsets of the block header wire format.
pub(crate) mod offsets {
    /// `u32`: [`super::BlockKind`], or `FREE_KIND` for an unused slot.
    pub const KIND: usize = 0;
    /// `u32`: free-list link (`next slot + 1`) while free, 0 otherwise.
    pub const RESERVED: usize = 4;
    /// `u8`: 1 once the block accepts no more segments.
    pub const IS_COMPLETE: usize = 8;
    /// `u8`: 1 once the first segment was accepted.
    pub const HAS_DATA: usize = 9;
    /// `u32`: sequence of the first payload byte.
    pub const BASE_SEQ: usize = 12;
    /// `u64`: microsecond timestamp of the last change.
    pub const LAST_UPDATE: usize = 16;
    /// `u32`: sequence of the last accepted byte.
    pub const LAST_ACCEPTED_SEQ: usize = 24;
    /// `u64`: bytes of the payload area in use.
    pub const USED_LEN: usize = 32;

    pub const HEADER_SIZE: usize = 40;
}

/// Size of the serialized block header.
pub const BLOCK_HEADER_SIZE: usize = offsets::HEADER_SIZE;

/// `kind` value marking a slot on the free list.
pub(crate) const FREE_KIND: u32 = 0xFFFF_FFFF;

// ---------------------------------------------------------------------------
// BlockKind
// ---------------------------------------------------------------------------

/// What a block holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum BlockKind {
    Unknown = 0,
    Addr = 1,
    L3Payload = 2,
    L4Payload = 3,
    L7Payload = 4,
    /// Zero-payload marker announcing a new flow.
    StartFlow = 5,
    EndFlow = 6,
}

impl BlockKind {
    /// Decode a wire value; anything unrecognized is `Unknown`.
    #[must_use]
    pub const fn from_raw(raw: u32) -> Self {
        match raw {
            1 => Self::Addr,
            2 => Self::L3Payload,
            3 => Self::L4Payload,
            4 => Self::L7Payload,
            5 => Self::StartFlow,
            6 => Self::EndFlow,
            _ => Self::Unknown,
        }
    }

    #[must_use]
    pub const fn as_raw(self) -> u32 {
        self as u32
    }

    /// Whether blocks of this kind carry stream bytes.
    #[must_use]
    pub const fn is_payload(self) -> bool {
        matches!(self, Self::L3Payload | Self::L4Payload | Self::L7Payload)
    }
}

// ---------------------------------------------------------------------------
// BlockHeader
// ---------------------------------------------------------------------------

/// Decoded block header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockHeader {
    pub kind: BlockKind,
    pub reserved: u32,
    pub is_complete: bool,
    pub has_data: bool,
    pub base_seq: Seq,
    pub last_update_us: Micros,
    pub last_accepted_seq: Seq,
    pub used_len: u64,
}

impl BlockHeader {
    /// A fresh, open block whose payload area holds `used_len` prefix bytes.
    #[must_use]
    pub const fn new(kind: BlockKind, base_seq: Seq, used_len: u64, now: Micros) -> Self {
        Self {
            kind,
            reserved: 0,
            is_complete: false,
            has_data: false,
            base_seq,
            last_update_us: now,
            last_accepted_seq: base_seq.wrapping_sub(1),
            used_len,
        }
    }

    /// Bytes of the payload area in use.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn used(&self) -> usize {
        self.used_len as usize
    }

    /// Sequence one past the last accepted byte, or `base_seq` if empty.
    #[must_use]
    pub const fn end_seq(&self) -> Seq {
        if self.has_data {
            self.last_accepted_seq.wrapping_add(1)
        } else {
            self.base_seq
        }
    }

    /// Whether the block has been idle for longer than `idle_us`.
    #[must_use]
    pub const fn expired(&self, now: Micros, idle_us: Micros) -> bool {
        self.used_len > 0
            && self.last_update_us != 0
            && now.saturating_sub(self.last_update_us) > idle_us
    }

    /// Complete and past its grace window: safe for a reader to consume.
    #[must_use]
    pub const fn is_ready(&self, now: Micros, idle_us: Micros) -> bool {
        self.is_complete && self.expired(now, idle_us)
    }

    /// Whether a further segment of `len` bytes fits.
    #[must_use]
    pub const fn has_room(&self, len: usize, capacity: usize) -> bool {
        self.used() + FRAME_PREFIX_LEN + len <= capacity
    }

    /// Mark complete. Never undone.
    pub const fn close(&mut self) {
        self.is_complete = true;
    }

    #[must_use]
    pub fn to_bytes(&self) -> [u8; BLOCK_HEADER_SIZE] {
        let mut buf = [0_u8; BLOCK_HEADER_SIZE];
        write_u32(&mut buf, offsets::KIND, self.kind.as_raw());
        write_u32(&mut buf, offsets::RESERVED, self.reserved);
        buf[offsets::IS_COMPLETE] = u8::from(self.is_complete);
        buf[offsets::HAS_DATA] = u8::from(self.has_data);
        write_u32(&mut buf, offsets::BASE_SEQ, self.base_seq);
        write_u64(&mut buf, offsets::LAST_UPDATE, self.last_update_us);
        write_u32(&mut buf, offsets::LAST_ACCEPTED_SEQ, self.last_accepted_seq);
        write_u64(&mut buf, offsets::USED_LEN, self.used_len);
        buf
    }

    #[must_use]
    pub fn from_bytes(buf: &[u8; BLOCK_HEADER_SIZE]) -> Self {
        Self {
            kind: BlockKind::from_raw(read_u32(buf, offsets::KIND)),
            reserved: read_u32(buf, offsets::RESERVED),
            is_complete: buf[offsets::IS_COMPLETE] != 0,
            has_data: buf[offsets::HAS_DATA] != 0,
            base_seq: read_u32(buf, offsets::BASE_SEQ),
            last_update_us: read_u64(buf, offsets::LAST_UPDATE),
            last_accepted_seq: read_u32(buf, offsets::LAST_ACCEPTED_SEQ),
            used_len: read_u64(buf, offsets::USED_LEN),
        }
    }
}

// ---------------------------------------------------------------------------
// SequenceGate
// ---------------------------------------------------------------------------

/// Result of offering a segment to a block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PushCode {
    /// Segment framed and appended.
    Ok,
    /// No block was supplied.
    NoBlock,
    /// Segment does not fit; the block is now complete.
    NoSpace,
    /// Segment does not continue the block's accepted range.
    InconsistentSeq,
    /// Block is already complete.
    BlockClosed,
    /// Segment could not be framed (empty payload).
    PushError,
}

/// Destination for framed payload bytes, addressed relative to the payload area.
pub trait PayloadWriter {
    fn write_payload(&mut self, at: usize, bytes: &[u8]) -> Result<()>;
}

impl PayloadWriter for Vec<u8> {
    fn write_payload(&mut self, at: usize, bytes: &[u8]) -> Result<()> {
        let end = at + bytes.len();
        if self.len() < end {
            self.resize(end, 0);
        }
        self[at..end].copy_from_slice(bytes);
        Ok(())
    }
}

/// Decides whether a segment may be appended to a block, and frames it if so.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SequenceGate {
    capacity: usize,
}

impl SequenceGate {
    #[must_use]
    pub const fn new(capacity: usize) -> Self {
        Self { capacity }
    }

    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    /// Largest segment an empty payload block can take in one frame.
    #[must_use]
    pub const fn max_segment_len(&self) -> usize {
        self.capacity.saturating_sub(ISN_PREFIX_LEN + FRAME_PREFIX_LEN)
    }

    /// Offer `data` starting at `new_seq` to `block`.
    ///
    /// On [`PushCode::Ok`] the frame has been written through `writer` and the
    /// header updated; the caller persists the header. [`PushCode::NoSpace`]
    /// also mutates the header (it is now complete).
    pub fn push<W: PayloadWriter + ?Sized>(
        &self,
        block: Option<&mut BlockHeader>,
        writer: &mut W,
        data: &[u8],
        new_seq: Seq,
        now: Micros,
    ) -> Result<PushCode> {
        let Some(header) = block else {
            return Ok(PushCode::NoBlock);
        };
        if header.is_complete {
            return Ok(PushCode::BlockClosed);
        }
        if data.is_empty() {
            return Ok(PushCode::PushError);
        }
        if !header.has_room(data.len(), self.capacity) {
            header.close();
            return Ok(PushCode::NoSpace);
        }
        if header.has_data && new_seq != header.last_accepted_seq.wrapping_add(1) {
            return Ok(PushCode::InconsistentSeq);
        }
        let Ok(frame_len) = u32::try_from(data.len()) else {
            return Ok(PushCode::PushError);
        };

        let at = header.used();
        writer.write_payload(at, &frame_len.to_le_bytes())?;
        writer.write_payload(at + FRAME_PREFIX_LEN, data)?;

        if !header.has_data {
            header.base_seq = new_seq;
            header.has_data = true;
        }
        header.used_len += (FRAME_PREFIX_LEN + data.len()) as u64;
        header.last_accepted_seq = new_seq.wrapping_add(frame_len).wrapping_sub(1);
        header.last_update_us = now;
        Ok(PushCode::Ok)
    }
}

// ---------------------------------------------------------------------------
// Segment iteration
// ---------------------------------------------------------------------------

/// Iterates the `(seq, bytes)` frames of a payload block.
///
/// Sequences are derived from `base_seq` plus the cumulative frame lengths.
/// A truncated trailing frame ends the iteration.
#[derive(Debug, Clone)]
pub struct BlockSegments<'a> {
    payload: &'a [u8],
    pos: usize,
    seq: Seq,
}

impl<'a> BlockSegments<'a> {
    /// `payload` is the used part of the payload area, ISN prefix included.
    #[must_use]
    pub const fn new(payload: &'a [u8], base_seq: Seq) -> Self {
        Self {
            payload,
            pos: ISN_PREFIX_LEN,
            seq: base_seq,
        }
    }
}

impl<'a> Iterator for BlockSegments<'a> {
    type Item = (Seq, &'a [u8]);

    fn next(&mut self) -> Option<Self::Item> {
        let prefix = self.payload.get(self.pos..self.pos + FRAME_PREFIX_LEN)?;
        let len = read_u32(prefix, 0);
        let start = self.pos + FRAME_PREFIX_LEN;
        let bytes = self.payload.get(start..start + len as usize)?;
        let seq = self.seq;
        self.pos = start + bytes.len();
        self.seq = seq.wrapping_add(len);
        Some((seq, bytes))
    }
}

// ---------------------------------------------------------------------------
// Wire-format helpers (little-endian)
// ---------------------------------------------------------------------------

pub(crate) fn read_u32(buf: &[u8], offset: usize) -> u32 {
    let mut bytes = [0_u8; 4];
    bytes.copy_from_slice(&buf[offset..offset + 4]);
    u32::from_le_bytes(bytes)
}

pub(crate) fn read_u64(buf: &[u8], offset: usize) -> u64 {
    let mut bytes = [0_u8; 8];
    bytes.copy_from_slice(&buf[offset..offset + 8]);
    u64::from_le_bytes(bytes)
}

pub(crate) fn write_u32(buf: &mut [u8], offset: usize, val: u32) {
    buf[offset..offset + 4].copy_from_slice(&val.to_le_bytes());
}

pub(crate) fn write_u64(buf: &mut [u8], offset: usize, val: u64) {
    buf[offset..offset + 8].copy_from_slice(&val.to_le_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;

    const CAP: usize = 256;

    fn payload_block(now: Micros) -> (BlockHeader, Vec<u8>) {
        let mut payload = Vec::new();
        payload.write_payload(0, &1000_u32.to_le_bytes()).unwrap();
        (
            BlockHeader::new(BlockKind::L4Payload, 1000, ISN_PREFIX_LEN as u64, now),
            payload,
        )
    }

    #[test]
    fn test_header_size_is_40() {
        assert_eq!(BLOCK_HEADER_SIZE, 40);
    }

    #[test]
    fn test_header_wire_offsets() {
        let mut header = BlockHeader::new(BlockKind::StartFlow, 0x0102_0304, 4, 99);
        header.is_complete = true;
        let bytes = header.to_bytes();
        assert_eq!(read_u32(&bytes, 0), 5);
        assert_eq!(bytes[8], 1);
        assert_eq!(bytes[9], 0);
        assert_eq!(read_u32(&bytes, 12), 0x0102_0304);
        assert_eq!(read_u64(&bytes, 16), 99);
        assert_eq!(read_u64(&bytes, 32), 4);
        assert_eq!(BlockHeader::from_bytes(&bytes), header);
    }

    #[test]
    fn test_unknown_kind_decodes_as_unknown() {
        assert_eq!(BlockKind::from_raw(42), BlockKind::Unknown);
        assert_eq!(BlockKind::from_raw(FREE_KIND), BlockKind::Unknown);
        assert!(BlockKind::L4Payload.is_payload());
        assert!(!BlockKind::StartFlow.is_payload());
    }

    #[test]
    fn test_push_without_block() {
        let gate = SequenceGate::new(CAP);
        let mut sink = Vec::new();
        assert_eq!(
            gate.push(None, &mut sink, b"abc", 1, 1).unwrap(),
            PushCode::NoBlock
        );
    }

    #[test]
    fn test_push_accepts_first_segment_at_any_sequence() {
        let gate = SequenceGate::new(CAP);
        let (mut header, mut payload) = payload_block(1);
        let code = gate.push(Some(&mut header), &mut payload, &[7; 100], 5000, 2).unwrap();
        assert_eq!(code, PushCode::Ok);
        assert_eq!(header.base_seq, 5000);
        assert_eq!(header.last_accepted_seq, 5099);
        assert_eq!(header.end_seq(), 5100);
        assert_eq!(header.used_len, 108);
        assert_eq!(header.last_update_us, 2);
    }

    #[test]
    fn test_push_contiguous_then_inconsistent() {
        let gate = SequenceGate::new(CAP);
        let (mut header, mut payload) = payload_block(1);
        gate.push(Some(&mut header), &mut payload, &[1; 10], 1000, 1).unwrap();
        assert_eq!(
            gate.push(Some(&mut header), &mut payload, &[2; 10], 1010, 1).unwrap(),
            PushCode::Ok
        );
        assert_eq!(
            gate.push(Some(&mut header), &mut payload, &[3; 10], 1030, 1).unwrap(),
            PushCode::InconsistentSeq
        );
        assert_eq!(header.end_seq(), 1020);
    }

    #[test]
    fn test_push_across_sequence_wrap() {
        let gate = SequenceGate::new(CAP);
        let (mut header, mut payload) = payload_block(1);
        gate.push(Some(&mut header), &mut payload, &[1; 6], u32::MAX - 5, 1).unwrap();
        assert_eq!(header.last_accepted_seq, u32::MAX);
        assert_eq!(
            gate.push(Some(&mut header), &mut payload, &[2; 4], 0, 1).unwrap(),
            PushCode::Ok
        );
        assert_eq!(header.end_seq(), 4);
    }

    #[test]
    fn test_push_no_space_closes_block() {
        let gate = SequenceGate::new(CAP);
        let (mut header, mut payload) = payload_block(1);
        gate.push(Some(&mut header), &mut payload, &[0; 100], 1000, 1).unwrap();
        gate.push(Some(&mut header), &mut payload, &[0; 100], 1100, 1).unwrap();
        assert_eq!(header.used_len, 212);
        assert_eq!(
            gate.push(Some(&mut header), &mut payload, &[0; 100], 1200, 1).unwrap(),
            PushCode::NoSpace
        );
        assert!(header.is_complete);
        assert_eq!(
            gate.push(Some(&mut header), &mut payload, &[0; 1], 1200, 1).unwrap(),
            PushCode::BlockClosed
        );
    }

    #[test]
    fn test_push_exact_fit() {
        let gate = SequenceGate::new(CAP);
        let (mut header, mut payload) = payload_block(1);
        let len = gate.max_segment_len();
        assert_eq!(
            gate.push(Some(&mut header), &mut payload, &vec![9; len], 0, 1).unwrap(),
            PushCode::Ok
        );
        assert_eq!(header.used(), CAP);
        assert!(!header.is_complete);
    }

    #[test]
    fn test_push_empty_payload_is_error() {
        let gate = SequenceGate::new(CAP);
        let (mut header, mut payload) = payload_block(1);
        assert_eq!(
            gate.push(Some(&mut header), &mut payload, &[], 1000, 1).unwrap(),
            PushCode::PushError
        );
        assert!(!header.has_data);
    }

    #[test]
    fn test_expired_and_ready() {
        let mut header = BlockHeader::new(BlockKind::L4Payload, 0, 4, 1_000);
        assert!(!header.expired(1_100, 100));
        assert!(header.expired(1_101, 100));
        assert!(!header.is_ready(1_101, 100));
        header.close();
        assert!(header.is_ready(1_101, 100));

        let never_touched = BlockHeader::new(BlockKind::L4Payload, 0, 4, 0);
        assert!(!never_touched.expired(u64::MAX, 100));
        let empty = BlockHeader::new(BlockKind::L4Payload, 0, 0, 1);
        assert!(!empty.expired(u64::MAX, 100));
    }

    #[test]
    fn test_segments_iterate_frames() {
        let gate = SequenceGate::new(CAP);
        let (mut header, mut payload) = payload_block(1);
        gate.push(Some(&mut header), &mut payload, b"hello", 1000, 1).unwrap();
        gate.push(Some(&mut header), &mut payload, b" world", 1005, 1).unwrap();
        let frames: Vec<_> =
            BlockSegments::new(&payload[..header.used()], header.base_seq).collect();
        assert_eq!(frames, vec![(1000, &b"hello"[..]), (1005, &b" world"[..])]);
    }

    #[test]
    fn test_segments_stop_at_truncated_frame() {
        let mut payload = vec![0_u8; 4];
        payload.extend_from_slice(&10_u32.to_le_bytes());
        payload.extend_from_slice(b"short");
        assert_eq!(BlockSegments::new(&payload, 0).count(), 0);
    }
}
