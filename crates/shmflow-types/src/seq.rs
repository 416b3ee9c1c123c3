//! TCP sequence arithmetic modulo 2^32 (RFC 1982 serial numbers).

/// A 32-bit TCP sequence number.
pub type Seq = u32;

/// Forward distance from `from` to `to`, wrapping.
#[inline]
pub const fn distance(from: Seq, to: Seq) -> u32 {
    to.wrapping_sub(from)
}

/// Whether `a` precedes `b` in serial-number order.
#[inline]
#[allow(clippy::cast_possible_wrap)]
pub const fn before(a: Seq, b: Seq) -> bool {
    (a.wrapping_sub(b) as i32) < 0
}

/// Whether `a` precedes or equals `b` in serial-number order.
#[inline]
pub const fn before_eq(a: Seq, b: Seq) -> bool {
    a == b || before(a, b)
}

/// Whether `seq` lies in the half-open range `[start, end)`.
///
/// The range is measured forward from `start`, so it may cross `u32::MAX`.
#[inline]
pub const fn in_range(seq: Seq, start: Seq, end: Seq) -> bool {
    distance(start, seq) < distance(start, end)
}
