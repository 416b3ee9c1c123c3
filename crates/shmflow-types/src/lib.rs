//! Core value types shared by every shmflow crate.
//!
//! - [`FlowId`], [`Side`], [`Seq`] and [`FlowKey`]: identity and ordering of
//!   stored blocks. `FlowKey` has a bit-exact encoding because it is written
//!   into the shared region and compared by independent processes.
//! - [`Segment`]: the decoded TCP segment handed to the accumulator.
//! - [`cx::Cx`]: cancellation context threaded through worker loops.
//! - [`clock::Clock`]: microsecond time source, swappable in tests.

pub mod clock;
pub mod cx;
pub mod seq;

use std::fmt;

pub use clock::{Clock, ManualClock, Micros, SystemClock};
pub use cx::Cx;
pub use seq::Seq;

// ---------------------------------------------------------------------------
// FlowId
// ---------------------------------------------------------------------------

/// Process-local flow identifier assigned upstream from the 5-tuple.
///
/// Only 31 bits are usable: the top bit of the key's high half carries the
/// [`Side`].
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize,
)]
#[repr(transparent)]
pub struct FlowId(u32);

impl FlowId {
    /// Largest representable flow id.
    pub const MAX: u32 = 0x7FFF_FFFF;

    /// Create a flow id. Returns `None` if `raw` does not fit in 31 bits.
    #[inline]
    pub const fn new(raw: u32) -> Option<Self> {
        if raw > Self::MAX {
            None
        } else {
            Some(Self(raw))
        }
    }

    /// Get the raw value.
    #[inline]
    pub const fn get(self) -> u32 {
        self.0
    }
}

impl fmt::Display for FlowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl TryFrom<u32> for FlowId {
    type Error = InvalidFlowId;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        Self::new(value).ok_or(InvalidFlowId(value))
    }
}

/// Error returned when a flow id does not fit in 31 bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InvalidFlowId(pub u32);

impl fmt::Display for InvalidFlowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "flow id {:#x} exceeds 31 bits", self.0)
    }
}

impl std::error::Error for InvalidFlowId {}

// ---------------------------------------------------------------------------
// Side
// ---------------------------------------------------------------------------

/// Which endpoint of a flow originated a segment.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize,
)]
pub enum Side {
    /// Connection initiator (`false` on the wire).
    Source,
    /// Connection responder (`true` on the wire).
    Destination,
}

impl Side {
    /// Both sides, in key order.
    pub const BOTH: [Self; 2] = [Self::Source, Self::Destination];

    #[inline]
    pub const fn from_bit(bit: bool) -> Self {
        if bit { Self::Destination } else { Self::Source }
    }

    #[inline]
    pub const fn bit(self) -> bool {
        matches!(self, Self::Destination)
    }

    /// Array index for per-side state.
    #[inline]
    pub const fn index(self) -> usize {
        self.bit() as usize
    }
}

// ---------------------------------------------------------------------------
// FlowKey
// ---------------------------------------------------------------------------

/// Sortable store key: `((flow | side << 31) << 32) | seq`.
///
/// Keys of one (flow, side) form a contiguous range ordered by raw sequence.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct FlowKey(u64);

impl FlowKey {
    const SIDE_BIT: u32 = 1 << 31;

    #[inline]
    pub const fn new(flow: FlowId, side: Side, seq: Seq) -> Self {
        let high = flow.get() | if side.bit() { Self::SIDE_BIT } else { 0 };
        Self(((high as u64) << 32) | seq as u64)
    }

    /// First key of the (flow, side) range.
    #[inline]
    pub const fn range_start(flow: FlowId, side: Side) -> Self {
        Self::new(flow, side, 0)
    }

    /// Last key of the (flow, side) range.
    #[inline]
    pub const fn range_end(flow: FlowId, side: Side) -> Self {
        Self::new(flow, side, u32::MAX)
    }

    #[inline]
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    #[inline]
    pub const fn raw(self) -> u64 {
        self.0
    }

    #[inline]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn flow(self) -> FlowId {
        FlowId(((self.0 >> 32) as u32) & FlowId::MAX)
    }

    #[inline]
    pub const fn side(self) -> Side {
        Side::from_bit((self.0 >> 63) & 1 == 1)
    }

    #[inline]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn seq(self) -> Seq {
        self.0 as u32
    }

    /// Whether this key lies in the (flow, side) range.
    #[inline]
    pub fn belongs_to(self, flow: FlowId, side: Side) -> bool {
        self.flow() == flow && self.side() == side
    }
}

impl fmt::Debug for FlowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "FlowKey({}/{:?}/{})",
            self.flow(),
            self.side(),
            self.seq()
        )
    }
}

// ---------------------------------------------------------------------------
// Segment
// ---------------------------------------------------------------------------

/// A decoded TCP segment ready for accumulation.
///
/// `sequence` is already SYN-adjusted: the first payload byte's sequence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    pub flow: FlowId,
    pub side: Side,
    pub sequence: Seq,
    pub payload: Vec<u8>,
}

impl Segment {
    #[must_use]
    pub fn new(flow: FlowId, side: Side, sequence: Seq, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            flow,
            side,
            sequence,
            payload: payload.into(),
        }
    }

    /// Build from a raw header sequence number, applying the SYN adjustment.
    #[must_use]
    pub fn from_raw(
        flow: FlowId,
        side: Side,
        raw_sequence: Seq,
        syn: bool,
        payload: impl Into<Vec<u8>>,
    ) -> Self {
        let sequence = if syn {
            raw_sequence.wrapping_add(1)
        } else {
            raw_sequence
        };
        Self::new(flow, side, sequence, payload)
    }

    #[must_use]
    pub fn key(&self) -> FlowKey {
        FlowKey::new(self.flow, self.side, self.sequence)
    }

    /// Sequence one past the last payload byte.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn end_seq(&self) -> Seq {
        self.sequence.wrapping_add(self.payload.len() as u32)
    }
}
