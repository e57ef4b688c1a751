//! # Time Scales
//!
//! Delays on the wire are 16.16 fixed-point seconds: one unit is 1/65536 s,
//! the same resolution as the middle 32 bits of an NTP timestamp ("compact
//! NTP"). Both directions round to nearest so that
//! `delay_to_wire(delay_from_wire(u)) == u` for every `u`.

use std::time::Duration;

/// Wire delay units per second.
pub const DELAY_UNITS_PER_SEC: u64 = 1 << 16;

const NANOS_PER_SEC: u128 = 1_000_000_000;

// ─── 16.16 delays ───────────────────────────────────────────────────────────

/// Convert an elapsed time into wire delay units, saturating at `u32::MAX`.
pub fn delay_to_wire(delay: Duration) -> u32 {
    let scaled = delay.as_nanos() * DELAY_UNITS_PER_SEC as u128;
    let units = (scaled + NANOS_PER_SEC / 2) / NANOS_PER_SEC;
    units.min(u32::MAX as u128) as u32
}

/// Convert wire delay units into an elapsed time.
pub fn delay_from_wire(units: u32) -> Duration {
    let nanos = (units as u128 * NANOS_PER_SEC + DELAY_UNITS_PER_SEC as u128 / 2) >> 16;
    Duration::from_nanos(nanos as u64)
}

// ─── NTP ────────────────────────────────────────────────────────────────────

/// 64-bit NTP timestamp (32.32 fixed point seconds) to a duration since the
/// NTP epoch.
pub fn ntp_to_duration(ntp: u64) -> Duration {
    let nanos = (ntp as u128 * NANOS_PER_SEC) >> 32;
    Duration::from_nanos(nanos as u64)
}

/// Duration since the NTP epoch to a 64-bit NTP timestamp.
pub fn duration_to_ntp(d: Duration) -> u64 {
    let secs = d.as_secs() << 32;
    let frac = ((d.subsec_nanos() as u128) << 32) / NANOS_PER_SEC;
    secs | frac as u64
}

/// Middle 32 bits of a 64-bit NTP timestamp, as carried in the LSR field of a
/// receiver report.
#[inline]
pub fn compact_ntp(ntp: u64) -> u32 {
    (ntp >> 16) as u32
}

/// Round-trip time from a receiver report, all values in compact NTP units.
///
/// `arrival` is the compact NTP time the report arrived at, `lsr` and `dlsr`
/// are the report's last-SR and delay-since-last-SR fields. Returns `None`
/// when no sender report was echoed (`lsr == 0`) or the clocks disagree.
pub fn rtt_from_report(arrival: u32, lsr: u32, dlsr: u32) -> Option<Duration> {
    if lsr == 0 {
        return None;
    }
    let rtt = arrival.wrapping_sub(lsr).checked_sub(dlsr)?;
    // A "negative" wrap-around shows up as a huge value.
    if rtt >= 1 << 31 {
        return None;
    }
    Some(delay_from_wire(rtt))
}
