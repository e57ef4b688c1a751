//! Receiver side of the simulation: per-subflow sequence tracking, loss and
//! jitter accounting, and one MPRTCP report per report interval.

use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::Result;
use bytes::Bytes;

use mprtp_control::SubflowId;
use mprtp_wire::report::{
    DiscardedBytesBlock, IntervalMetric, OneWayDelayBlock, ReceiverReportBlock,
};
use mprtp_wire::seq::SeqExtender;
use mprtp_wire::time::{compact_ntp, delay_to_wire, duration_to_ntp};
use mprtp_wire::ReportBuilder;

/// RTP clock rate used for the jitter estimate.
const RTP_CLOCK_HZ: f64 = 90_000.0;
const CUMULATIVE_LOST_MAX: u64 = 0x00FF_FFFF;

#[derive(Debug, Default)]
struct SubflowReceiver {
    extender: SeqExtender,
    first: Option<u32>,
    received: u64,
    expected_prior: u64,
    received_prior: u64,
    /// Delays of the current interval, sorted at report time.
    delays: Vec<Duration>,
    discarded_bytes: u64,
    jitter: f64,
    last_transit: Option<f64>,
    /// Compact NTP of the last sender report and when it arrived.
    last_sr: Option<(u32, Duration)>,
    delay_sum: Duration,
    delivered: u64,
}

impl SubflowReceiver {
    fn expected(&self) -> u64 {
        match (self.first, self.extender.highest()) {
            (Some(first), Some(highest)) => u64::from(highest.wrapping_sub(first)) + 1,
            _ => 0,
        }
    }

    fn on_packet(&mut self, seq: u16, delay: Duration, bytes: usize, deadline: Duration) {
        let ext = self.extender.extend(seq);
        if self.first.is_none() {
            self.first = Some(ext);
        }
        self.received += 1;
        self.delivered += 1;
        self.delay_sum += delay;
        if delay > deadline {
            self.discarded_bytes += bytes as u64;
        }

        let transit = delay.as_secs_f64() * RTP_CLOCK_HZ;
        if let Some(last) = self.last_transit {
            self.jitter += ((transit - last).abs() - self.jitter) / 16.0;
        }
        self.last_transit = Some(transit);
        self.delays.push(delay);
    }
}

/// Totals for one subflow as seen by the receiver.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ReceiverTotals {
    pub delivered: u64,
    pub mean_delay: Duration,
}

#[derive(Debug)]
pub struct ReceiverModel {
    subflows: BTreeMap<SubflowId, SubflowReceiver>,
    builder: ReportBuilder,
    playout_deadline: Duration,
}

impl ReceiverModel {
    pub fn new(ssrc: u32, media_ssrc: u32, playout_deadline: Duration) -> Self {
        Self {
            subflows: BTreeMap::new(),
            builder: ReportBuilder::new(ssrc, media_ssrc),
            playout_deadline,
        }
    }

    pub fn on_packet(
        &mut self,
        id: SubflowId,
        seq: u16,
        sent_at: Duration,
        arrival: Duration,
        bytes: usize,
    ) {
        let deadline = self.playout_deadline;
        self.subflows
            .entry(id)
            .or_default()
            .on_packet(seq, arrival.saturating_sub(sent_at), bytes, deadline);
    }

    pub fn on_sender_report(&mut self, id: SubflowId, ntp_compact: u32, arrival: Duration) {
        self.subflows.entry(id).or_default().last_sr = Some((ntp_compact, arrival));
    }

    pub fn totals(&self, id: SubflowId) -> ReceiverTotals {
        let Some(sf) = self.subflows.get(&id) else {
            return ReceiverTotals::default();
        };
        let mean_delay = if sf.delivered == 0 {
            Duration::ZERO
        } else {
            sf.delay_sum / sf.delivered as u32
        };
        ReceiverTotals {
            delivered: sf.delivered,
            mean_delay,
        }
    }

    /// Build the report for everything received since the previous one.
    /// Subflows that never delivered a packet get no block.
    pub fn build_report(&mut self, now: Duration, media_ssrc: u32) -> Result<Option<Bytes>> {
        let mut open = false;
        for (&id, sf) in self.subflows.iter_mut() {
            let Some(highest) = sf.extender.highest() else {
                continue;
            };
            if open {
                self.builder.next_block(id)?;
            } else {
                self.builder.begin(id);
                open = true;
            }

            let expected = sf.expected();
            let expected_interval = expected.saturating_sub(sf.expected_prior);
            let received_interval = sf.received.saturating_sub(sf.received_prior);
            sf.expected_prior = expected;
            sf.received_prior = sf.received;
            let fraction_lost = match expected_interval {
                0 => 0,
                n => (n.saturating_sub(received_interval) * 256 / n).min(255) as u8,
            };
            let (last_sr, delay_since_last_sr) = match sf.last_sr {
                Some((lsr, at)) => (lsr, compact_ntp(duration_to_ntp(now.saturating_sub(at)))),
                None => (0, 0),
            };
            let cumulative_lost = expected.saturating_sub(sf.received).min(CUMULATIVE_LOST_MAX);
            self.builder.add_rr(ReceiverReportBlock {
                ssrc: media_ssrc,
                fraction_lost,
                cumulative_lost: cumulative_lost as u32,
                ext_highest_seq: highest,
                jitter: sf.jitter as u32,
                last_sr,
                delay_since_last_sr,
            })?;

            if !sf.delays.is_empty() {
                sf.delays.sort_unstable();
                let median = sf.delays[sf.delays.len() / 2];
                let min = sf.delays[0];
                let max = sf.delays[sf.delays.len() - 1];
                self.builder.add_owd(OneWayDelayBlock {
                    interval_metric: IntervalMetric::Interval,
                    ssrc: media_ssrc,
                    median_delay: delay_to_wire(median),
                    min_delay: delay_to_wire(min),
                    max_delay: delay_to_wire(max),
                })?;
                sf.delays.clear();
            }
            if sf.discarded_bytes > 0 {
                self.builder.add_discarded_bytes(DiscardedBytesBlock {
                    interval_metric: IntervalMetric::Interval,
                    early: false,
                    ssrc: media_ssrc,
                    discarded_bytes: u32::try_from(sf.discarded_bytes).unwrap_or(u32::MAX),
                })?;
                sf.discarded_bytes = 0;
            }
        }
        Ok(if open { self.builder.end() } else { None })
    }
}
