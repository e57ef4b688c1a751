//! # Subflow
//!
//! Everything the sender knows about one path. Feedback is kept as two
//! double-buffered snapshots:
//!
//! ```text
//!   incoming moments   what the receiver reported (loss, seq, OWD, discards)
//!   outgoing moments   what we had sent when that report arrived
//! ```
//!
//! The difference between the current and previous snapshot of each gives
//! the per-interval loss, goodput and sending rate.

use std::time::Duration;

use mprtp_wire::report::{IntervalMetric, SubflowBlock};
use mprtp_wire::seq::{ext_diff, ext_newer};
use mprtp_wire::time::rtt_from_report;
use quanta::Instant;

use crate::allocator::PathStatus;
use crate::analyzer::{DelayTrendAnalyzer, TrendOutput};
use crate::config::ControlConfig;
use crate::error::ControlError;
use crate::rate::{GoodputSample, RateController};
use crate::state::{SubflowEvent, SubflowState, SubflowStateMachine, Transition};
use crate::stats::SubflowStats;
use crate::SubflowId;

/// Cumulative-lost is a signed 24-bit field.
const CUMULATIVE_LOST_MASK: u32 = 0x00FF_FFFF;
const CUMULATIVE_LOST_SIGN: u32 = 0x0080_0000;

/// Weight of a new RTT sample in the smoothed estimate.
const RTT_ALPHA: f64 = 0.125;

// ─── Report Moments ─────────────────────────────────────────────────────────

/// Current and previous snapshot; pushing rotates them.
#[derive(Debug, Clone)]
pub struct ReportMoments<T> {
    slots: [Option<T>; 2],
    current: usize,
}

impl<T> Default for ReportMoments<T> {
    fn default() -> Self {
        Self {
            slots: [None, None],
            current: 0,
        }
    }
}

impl<T> ReportMoments<T> {
    pub fn push(&mut self, moments: T) {
        self.current ^= 1;
        self.slots[self.current] = Some(moments);
    }

    pub fn current(&self) -> Option<&T> {
        self.slots[self.current].as_ref()
    }

    pub fn previous(&self) -> Option<&T> {
        self.slots[self.current ^ 1].as_ref()
    }

    pub fn clear(&mut self) {
        self.slots = [None, None];
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OwdMoments {
    pub median: Duration,
    pub min: Duration,
    pub max: Duration,
}

/// Receiver-side counters as of one report.
#[derive(Debug, Clone, PartialEq)]
pub struct IncomingMoments {
    pub received_at: Instant,
    pub cumulative_lost: u32,
    pub ext_highest_seq: Option<u32>,
    pub fraction_lost: u8,
    pub jitter: u32,
    pub owd: Option<OwdMoments>,
    /// Cumulative, whatever interval metric the receiver used.
    pub discarded_bytes: u64,
    pub discarded_packets: u64,
    /// Lost and covered packets of the last loss run-length block.
    pub rle_lost: usize,
    pub rle_span: usize,
}

impl IncomingMoments {
    fn empty(received_at: Instant) -> Self {
        Self {
            received_at,
            cumulative_lost: 0,
            ext_highest_seq: None,
            fraction_lost: 0,
            jitter: 0,
            owd: None,
            discarded_bytes: 0,
            discarded_packets: 0,
            rle_lost: 0,
            rle_span: 0,
        }
    }
}

/// Sender-side counters when a report was applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutgoingMoments {
    pub taken_at: Instant,
    pub sent_bytes: u64,
    pub sent_packets: u64,
}

// ─── Subflow ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct Subflow {
    id: SubflowId,
    machine: SubflowStateMachine,
    rate: RateController,
    analyzer: DelayTrendAnalyzer,
    incoming: ReportMoments<IncomingMoments>,
    outgoing: ReportMoments<OutgoingMoments>,
    pacing_time: Instant,
    rtt: Option<Duration>,
    actual_bitrate: f64,
    loss_fraction: f64,
    last_trend: TrendOutput,
    sent_bytes: u64,
    sent_packets: u64,
    reports: u64,
    last_feedback: Instant,
    last_sample: Instant,
    fresh: bool,
}

impl Subflow {
    pub fn new(id: SubflowId, initial_target: u64, now: Instant, config: &ControlConfig) -> Self {
        Self {
            id,
            machine: SubflowStateMachine::new(),
            rate: RateController::new(config.rate.clone(), initial_target),
            analyzer: DelayTrendAnalyzer::new(&config.analyzer),
            incoming: ReportMoments::default(),
            outgoing: ReportMoments::default(),
            pacing_time: now,
            rtt: None,
            actual_bitrate: 0.0,
            loss_fraction: 0.0,
            last_trend: TrendOutput::default(),
            sent_bytes: 0,
            sent_packets: 0,
            reports: 0,
            last_feedback: now,
            last_sample: now,
            fresh: false,
        }
    }

    pub fn id(&self) -> SubflowId {
        self.id
    }

    pub fn state(&self) -> SubflowState {
        self.machine.state()
    }

    pub fn target_bitrate(&self) -> u64 {
        self.rate.target()
    }

    pub fn rtt(&self) -> Option<Duration> {
        self.rtt
    }

    pub fn loss_fraction(&self) -> f64 {
        self.loss_fraction
    }

    pub fn sent_bytes(&self) -> u64 {
        self.sent_bytes
    }

    pub fn sent_packets(&self) -> u64 {
        self.sent_packets
    }

    pub fn incoming(&self) -> &ReportMoments<IncomingMoments> {
        &self.incoming
    }

    pub fn outgoing(&self) -> &ReportMoments<OutgoingMoments> {
        &self.outgoing
    }

    pub fn analyzer(&self) -> &DelayTrendAnalyzer {
        &self.analyzer
    }

    pub fn path_status(&self) -> PathStatus {
        PathStatus {
            state: self.machine.state(),
            pacing_time: self.pacing_time,
        }
    }

    /// Account an approved packet. With pacing enabled the subflow may not
    /// send again until its target rate has drained the packet.
    pub fn record_sent(&mut self, bytes: usize, now: Instant, pacing_gain: Option<f64>) {
        self.sent_bytes += bytes as u64;
        self.sent_packets += 1;
        let target = self.rate.target();
        if let Some(gain) = pacing_gain.filter(|_| target > 0) {
            let secs = bytes as f64 * 8.0 / (target as f64 * gain);
            self.pacing_time = now + Duration::from_secs_f64(secs);
        }
    }

    /// Fold one report block into the moments. A block whose extended highest
    /// sequence is behind the applied one is rejected untouched.
    pub fn apply_block(
        &mut self,
        block: &SubflowBlock,
        now: Instant,
        arrival_ntp: u32,
    ) -> Result<(), ControlError> {
        let rr = block.receiver_report();
        let previous = self.incoming.current().cloned();

        if let (Some(rr), Some(applied)) = (rr, previous.as_ref().and_then(|m| m.ext_highest_seq)) {
            if ext_newer(applied, rr.ext_highest_seq) {
                return Err(ControlError::StaleReport {
                    subflow_id: self.id,
                    received: rr.ext_highest_seq,
                    applied,
                });
            }
        }

        let mut moments = previous.clone().unwrap_or_else(|| IncomingMoments::empty(now));
        moments.received_at = now;
        if let Some(rr) = rr {
            moments.cumulative_lost = rr.cumulative_lost;
            moments.ext_highest_seq = Some(rr.ext_highest_seq);
            moments.fraction_lost = rr.fraction_lost;
            moments.jitter = rr.jitter;
            if let Some(sample) = rtt_from_report(arrival_ntp, rr.last_sr, rr.delay_since_last_sr) {
                self.rtt = Some(match self.rtt {
                    Some(srtt) => srtt.mul_f64(1.0 - RTT_ALPHA) + sample.mul_f64(RTT_ALPHA),
                    None => sample,
                });
            }
        }
        moments.owd = block.one_way_delay().map(|owd| OwdMoments {
            median: owd.median(),
            min: owd.min(),
            max: owd.max(),
        });
        if let Some(db) = block.discarded_bytes() {
            let bytes = db.discarded_bytes as u64;
            moments.discarded_bytes = match db.interval_metric {
                IntervalMetric::Interval => moments.discarded_bytes + bytes,
                _ => bytes,
            };
        }
        if let Some(rle) = block.discarded_rle() {
            moments.discarded_packets += rle.count_set() as u64;
        }
        match block.lost_rle() {
            Some(rle) => {
                moments.rle_lost = rle.count_set();
                moments.rle_span = rle.span();
            }
            None => {
                moments.rle_lost = 0;
                moments.rle_span = 0;
            }
        }

        let out = OutgoingMoments {
            taken_at: now,
            sent_bytes: self.sent_bytes,
            sent_packets: self.sent_packets,
        };
        let previous_out = self.outgoing.current().copied();

        self.loss_fraction = interval_loss(previous.as_ref(), &moments);
        if let (Some(prev), Some(prev_out)) = (previous.as_ref(), previous_out) {
            let elapsed = now.saturating_duration_since(prev.received_at);
            let sent = out.sent_bytes.saturating_sub(prev_out.sent_bytes);
            self.rate.record_goodput(GoodputSample {
                sent_bytes: sent,
                discarded_bytes: moments.discarded_bytes.saturating_sub(prev.discarded_bytes),
                loss_fraction: self.loss_fraction,
                elapsed,
            });
            if !elapsed.is_zero() {
                self.actual_bitrate = sent as f64 * 8.0 / elapsed.as_secs_f64();
            }
        }

        if let Some(owd) = moments.owd {
            if self.analyzer.add_sample(owd.median) {
                self.last_sample = now;
            }
        }

        self.incoming.push(moments);
        self.outgoing.push(out);
        self.reports += 1;
        self.last_feedback = now;
        self.fresh = true;
        Ok(())
    }

    /// Raw one-way delay sample from outside the report path.
    pub fn add_delay_sample(&mut self, delay: Duration, now: Instant) -> bool {
        if !self.analyzer.add_sample(delay) {
            return false;
        }
        self.last_sample = now;
        self.last_feedback = now;
        self.fresh = true;
        true
    }

    /// Push one zero through the analyzer if no delay sample arrived for
    /// `silence`.
    pub fn age_if_silent(&mut self, now: Instant, silence: Duration) -> bool {
        if now.saturating_duration_since(self.last_sample) < silence {
            return false;
        }
        self.analyzer.age();
        true
    }

    /// Event for this tick. `Late` wins; the others need a report applied
    /// since the previous tick.
    pub fn derive_event(
        &mut self,
        now: Instant,
        late_timeout: Duration,
        loss_threshold: f64,
    ) -> SubflowEvent {
        if !self.state().is_active() {
            return SubflowEvent::NoOp;
        }
        if now.saturating_duration_since(self.last_feedback) > late_timeout {
            return SubflowEvent::Late;
        }
        if !std::mem::take(&mut self.fresh) {
            return SubflowEvent::NoOp;
        }
        let trend = self.analyzer.output();
        self.last_trend = trend;
        if trend.distortion {
            SubflowEvent::Distortion
        } else if self.loss_fraction > loss_threshold {
            SubflowEvent::Lost
        } else if trend.stability {
            SubflowEvent::Settlement
        } else {
            SubflowEvent::NoOp
        }
    }

    pub fn fire(&mut self, event: SubflowEvent, now: Instant) -> Transition {
        let t = self.machine.fire(event);
        self.rate.apply(&t, now, self.rtt);
        if t.changed() && t.to == SubflowState::Passive {
            self.actual_bitrate = 0.0;
            self.fresh = false;
        }
        t
    }

    /// Bring a passive subflow back with a fresh target and empty history.
    pub fn rejoin(&mut self, initial_target: u64, now: Instant) -> bool {
        if !self.machine.rejoin() {
            return false;
        }
        self.rate.reset(initial_target);
        self.analyzer.reset();
        self.incoming.clear();
        self.outgoing.clear();
        self.pacing_time = now;
        self.rtt = None;
        self.loss_fraction = 0.0;
        self.last_trend = TrendOutput::default();
        self.last_feedback = now;
        self.last_sample = now;
        self.fresh = false;
        true
    }

    pub fn stats(&self, tree_units: u32) -> SubflowStats {
        SubflowStats {
            id: self.id,
            state: self.state(),
            target_bitrate: self.rate.target(),
            actual_bitrate: self.actual_bitrate,
            goodput_bitrate: self.rate.goodput(),
            rtt_ms: self.rtt.map(|r| r.as_secs_f64() * 1000.0),
            loss_fraction: self.loss_fraction,
            trend: self.last_trend.trend,
            packets_sent: self.sent_packets,
            bytes_sent: self.sent_bytes,
            reports: self.reports,
            transitions: self.machine.transitions(),
            tree_units,
        }
    }
}

/// Loss over the interval between two reports: from RR counters when both
/// carry them, else the run-length block, else the RR's own fraction.
fn interval_loss(previous: Option<&IncomingMoments>, current: &IncomingMoments) -> f64 {
    if let (Some(prev), Some(cur_seq)) = (previous, current.ext_highest_seq) {
        if let Some(prev_seq) = prev.ext_highest_seq {
            let expected = ext_diff(cur_seq, prev_seq);
            if expected > 0 {
                let lost = current.cumulative_lost.wrapping_sub(prev.cumulative_lost);
                let lost = lost & CUMULATIVE_LOST_MASK;
                // Duplicates can make the counter go backwards.
                let lost = if lost & CUMULATIVE_LOST_SIGN != 0 { 0 } else { lost };
                return (lost as f64 / expected as f64).min(1.0);
            }
        }
    }
    if current.rle_span > 0 {
        return current.rle_lost as f64 / current.rle_span as f64;
    }
    current.fraction_lost as f64 / 256.0
}
