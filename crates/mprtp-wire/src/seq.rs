//! # Sequence Arithmetic
//!
//! RTP sequence numbers are 16 bits wide and wrap. Two numbers are ordered by
//! the shorter forward distance: `a` is ahead of `b` when stepping forward
//! from `b` reaches `a` in fewer than 32768 steps.
//!
//! ```text
//!   b        a = b + d
//!   │──── d < 0x8000 ────▶│   a ahead of b
//!   │──── d ≥ 0x8000 ────▶│   a behind b
//! ```
//!
//! A distance of exactly 0x8000 is ambiguous: `seq_diff` reports it as
//! behind from both sides, so neither number is newer than the other, and
//! `seq_cmp` orders the pair as equal.
//!
//! Extended sequence numbers (`cycle << 16 | seq`) use the same rule on 32
//! bits.

use std::cmp::Ordering;

/// Half of the 16-bit sequence space.
pub const HALF_RANGE: u16 = 0x8000;

/// Half of the 32-bit extended sequence space.
pub const EXT_HALF_RANGE: u32 = 0x8000_0000;

// ─── 16-bit ─────────────────────────────────────────────────────────────────

/// Signed distance from `b` to `a`, in `[-32768, 32767]`.
#[inline]
pub fn seq_diff(a: u16, b: u16) -> i32 {
    let d = a.wrapping_sub(b);
    if d < HALF_RANGE {
        d as i32
    } else {
        d as i32 - 0x1_0000
    }
}

/// Whether `a` is strictly ahead of `b`.
#[inline]
pub fn seq_newer(a: u16, b: u16) -> bool {
    seq_diff(a, b) > 0
}

/// Wrap-aware ordering of two sequence numbers. Numbers half the space
/// apart compare equal, which keeps the ordering antisymmetric.
#[inline]
pub fn seq_cmp(a: u16, b: u16) -> Ordering {
    if a.wrapping_sub(b) == HALF_RANGE {
        return Ordering::Equal;
    }
    seq_diff(a, b).cmp(&0)
}

// ─── Extended (cycle << 16 | seq) ───────────────────────────────────────────

/// Join a cycle count and a sequence number.
#[inline]
pub fn extend(cycle: u16, seq: u16) -> u32 {
    ((cycle as u32) << 16) | seq as u32
}

/// Split an extended sequence number into `(cycle, seq)`.
#[inline]
pub fn split(ext: u32) -> (u16, u16) {
    ((ext >> 16) as u16, ext as u16)
}

/// Signed distance from `b` to `a` on the 32-bit extended space.
#[inline]
pub fn ext_diff(a: u32, b: u32) -> i64 {
    let d = a.wrapping_sub(b);
    if d < EXT_HALF_RANGE {
        d as i64
    } else {
        d as i64 - 0x1_0000_0000
    }
}

/// Whether extended sequence `a` is strictly ahead of `b`.
#[inline]
pub fn ext_newer(a: u32, b: u32) -> bool {
    ext_diff(a, b) > 0
}

// ─── Extender ───────────────────────────────────────────────────────────────

/// Turns a stream of 16-bit sequence numbers into extended ones by counting
/// wraps of the highest number seen.
#[derive(Debug, Clone, Default)]
pub struct SeqExtender {
    cycle: u16,
    highest: Option<u16>,
}

impl SeqExtender {
    pub fn new() -> Self {
        Self::default()
    }

    /// Extend `seq`. Reordered packets from before the last wrap map onto the
    /// previous cycle.
    pub fn extend(&mut self, seq: u16) -> u32 {
        let Some(highest) = self.highest else {
            self.highest = Some(seq);
            return extend(self.cycle, seq);
        };

        if seq_newer(seq, highest) {
            if seq < highest {
                self.cycle = self.cycle.wrapping_add(1);
            }
            self.highest = Some(seq);
            extend(self.cycle, seq)
        } else if seq > highest {
            extend(self.cycle.wrapping_sub(1), seq)
        } else {
            extend(self.cycle, seq)
        }
    }

    /// Highest extended sequence number seen so far.
    pub fn highest(&self) -> Option<u32> {
        self.highest.map(|seq| extend(self.cycle, seq))
    }
}
