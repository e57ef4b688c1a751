//! # Simulation Loop
//!
//! Fixed-step discrete simulation. Every step:
//!
//! ```text
//!   1. deliver packets and sender reports that have arrived
//!   2. apply feedback reports that reached the sender
//!   3. emit media at the summed target bitrate through select_path
//!   4. every report interval: sender reports out, receiver report back
//!   5. every tick interval:   SchedulerLoop::tick
//!   6. every second:          capacity walk, timeline sample, re-joins
//! ```

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use bytes::Bytes;
use quanta::{Clock, Mock};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::Serialize;
use tracing::{debug, info, warn};

use mprtp_control::stats::SchedulerStats;
use mprtp_control::{Packet, SchedulerLoop, SubflowId, SubflowState};

use crate::path::{PathCounters, PathModel, Transmit};
use crate::receiver::ReceiverModel;
use crate::scenario::ScenarioConfig;

const RECEIVER_SSRC: u32 = 0x5E4D_0002;
const MEDIA_SSRC: u32 = 0x5E4D_1000;
const SAMPLE_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy)]
enum Arrival {
    Media {
        id: SubflowId,
        seq: u16,
        sent_at: Duration,
        bytes: usize,
    },
    SenderReport {
        id: SubflowId,
        ntp_compact: u32,
    },
}

/// Per-second snapshot of the controller's view.
#[derive(Debug, Clone, Serialize)]
pub struct TimelineSample {
    pub t_ms: u64,
    pub media_bitrate: u64,
    pub targets: BTreeMap<SubflowId, u64>,
    pub states: BTreeMap<SubflowId, SubflowState>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PathReport {
    pub id: SubflowId,
    pub final_capacity_kbit: u64,
    #[serde(flatten)]
    pub counters: PathCounters,
    pub delivered_packets: u64,
    pub mean_owd_ms: f64,
}

/// Result of one run, printed as JSON by the binary.
#[derive(Debug, Clone, Serialize)]
pub struct SimulationReport {
    pub seed: u64,
    pub duration_ms: u64,
    pub media_packets: u64,
    /// Packets no subflow could take.
    pub unsent_packets: u64,
    pub rejoins: u64,
    pub paths: Vec<PathReport>,
    pub timeline: Vec<TimelineSample>,
    pub control: SchedulerStats,
}

impl SimulationReport {
    /// Mean target of `id` over timeline samples taken at or after `from`.
    pub fn mean_target_since(&self, id: SubflowId, from: Duration) -> Option<f64> {
        let from_ms = from.as_millis() as u64;
        let targets: Vec<u64> = self
            .timeline
            .iter()
            .filter(|s| s.t_ms >= from_ms)
            .filter_map(|s| s.targets.get(&id).copied())
            .collect();
        if targets.is_empty() {
            return None;
        }
        Some(targets.iter().sum::<u64>() as f64 / targets.len() as f64)
    }
}

pub struct Simulation {
    config: ScenarioConfig,
    sched: SchedulerLoop,
    mock: Arc<Mock>,
    rng: StdRng,
    paths: Vec<PathModel>,
    receiver: ReceiverModel,
    /// In flight towards the receiver, keyed by arrival time then send order.
    in_flight: BTreeMap<(Duration, u64), Arrival>,
    /// Reports in flight towards the sender.
    feedback: VecDeque<(Duration, Bytes)>,
    passive_since: BTreeMap<SubflowId, Duration>,
    t: Duration,
    ordinal: u64,
    budget_bits: f64,
    media_bitrate: u64,
    media_packets: u64,
    unsent_packets: u64,
    rejoins: u64,
    timeline: Vec<TimelineSample>,
}

impl Simulation {
    pub fn new(config: ScenarioConfig) -> Result<Self> {
        config.validate()?;
        let control = config.control_config()?;
        let (clock, mock) = Clock::mock();
        let sched = SchedulerLoop::with_clock(control, clock);
        let initial_target = config.initial_target_kbit * 1000;
        for path in &config.paths {
            sched.add_subflow(path.id, initial_target)?;
        }
        let paths = config.paths.iter().cloned().map(PathModel::new).collect();
        let receiver = ReceiverModel::new(
            RECEIVER_SSRC,
            MEDIA_SSRC,
            Duration::from_millis(config.playout_deadline_ms),
        );
        let mut sim = Self {
            rng: StdRng::seed_from_u64(config.seed),
            config,
            sched,
            mock,
            paths,
            receiver,
            in_flight: BTreeMap::new(),
            feedback: VecDeque::new(),
            passive_since: BTreeMap::new(),
            t: Duration::ZERO,
            ordinal: 0,
            budget_bits: 0.0,
            media_bitrate: 0,
            media_packets: 0,
            unsent_packets: 0,
            rejoins: 0,
            timeline: Vec::new(),
        };
        sim.media_bitrate = sim.media_bitrate();
        Ok(sim)
    }

    pub fn scheduler(&self) -> &SchedulerLoop {
        &self.sched
    }

    pub fn run(mut self) -> Result<SimulationReport> {
        let step = self.config.step();
        let end = self.config.duration();
        let tick_interval = self.sched.config().scheduler.tick_interval;
        let report_interval = self.sched.config().scheduler.report_interval;
        let mut next_tick = tick_interval;
        let mut next_report = report_interval;
        let mut next_sample = SAMPLE_INTERVAL;
        info!(
            seed = self.config.seed,
            paths = self.paths.len(),
            duration_s = self.config.duration_s,
            "simulation started"
        );

        while self.t < end {
            self.t += step;
            self.mock.increment(step);

            self.deliver();
            self.apply_feedback();
            self.send_media(step);
            if self.t >= next_report {
                self.exchange_reports()?;
                next_report += report_interval;
            }
            if self.t >= next_tick {
                self.sched.tick(self.sched.clock().now());
                self.media_bitrate = self.media_bitrate();
                next_tick += tick_interval;
            }
            if self.t >= next_sample {
                self.sample();
                next_sample += SAMPLE_INTERVAL;
            }
        }

        Ok(self.finish())
    }

    fn deliver(&mut self) {
        while let Some(entry) = self.in_flight.first_entry() {
            let (arrival, _) = *entry.key();
            if arrival > self.t {
                break;
            }
            match entry.remove() {
                Arrival::Media {
                    id,
                    seq,
                    sent_at,
                    bytes,
                } => self.receiver.on_packet(id, seq, sent_at, arrival, bytes),
                Arrival::SenderReport { id, ntp_compact } => {
                    self.receiver.on_sender_report(id, ntp_compact, arrival)
                }
            }
        }
    }

    fn apply_feedback(&mut self) {
        let now = self.sched.clock().now();
        while self.feedback.front().is_some_and(|(at, _)| *at <= self.t) {
            let Some((_, raw)) = self.feedback.pop_front() else { break };
            if let Err(e) = self.sched.on_feedback_at(&raw, now) {
                warn!(error = %e, "simulated feedback rejected");
            }
        }
    }

    fn send_media(&mut self, step: Duration) {
        let packet_bits = self.config.packet_size as f64 * 8.0;
        self.budget_bits += self.media_bitrate as f64 * step.as_secs_f64();
        // Idle time does not bank a burst.
        self.budget_bits = self.budget_bits.min(packet_bits * 8.0);
        let now = self.sched.clock().now();

        while self.budget_bits >= packet_bits {
            self.budget_bits -= packet_bits;
            let packet = Packet {
                sequence: self.media_packets as u16,
                payload_size: self.config.packet_size,
                is_keyframe: self.is_keyframe(),
            };
            self.media_packets += 1;

            let Some(id) = self.sched.select_path(&packet, now) else {
                self.unsent_packets += 1;
                continue;
            };
            let Some(path) = self.paths.iter_mut().find(|p| p.id() == id) else {
                continue;
            };
            match path.transmit(self.t, packet.payload_size, &mut self.rng) {
                Transmit::Delivered { seq, arrival } => {
                    self.ordinal += 1;
                    self.in_flight.insert(
                        (arrival, self.ordinal),
                        Arrival::Media {
                            id,
                            seq,
                            sent_at: self.t,
                            bytes: packet.payload_size,
                        },
                    );
                }
                Transmit::Lost { .. } | Transmit::QueueDrop { .. } => {}
            }
        }
    }

    fn is_keyframe(&self) -> bool {
        let interval = self.config.keyframe_interval;
        interval > 0 && self.media_packets % interval < self.config.keyframe_packets
    }

    fn exchange_reports(&mut self) -> Result<()> {
        let ntp_compact = self.sched.compact_ntp(self.sched.clock().now());
        for path in &self.paths {
            self.ordinal += 1;
            self.in_flight.insert(
                (path.control_arrival(self.t), self.ordinal),
                Arrival::SenderReport {
                    id: path.id(),
                    ntp_compact,
                },
            );
        }
        if let Some(raw) = self.receiver.build_report(self.t, MEDIA_SSRC)? {
            let at = self.t + Duration::from_millis(self.config.feedback_delay_ms);
            self.feedback.push_back((at, raw));
        }
        Ok(())
    }

    fn sample(&mut self) {
        for path in &mut self.paths {
            path.walk_capacity(&mut self.rng);
        }
        let stats = self.sched.stats();
        self.rejoin_passive(&stats);
        let t_ms = self.t.as_millis() as u64;
        debug!(t_ms, media_bitrate = self.media_bitrate, "timeline sample");
        self.timeline.push(TimelineSample {
            t_ms,
            media_bitrate: self.media_bitrate,
            targets: stats.subflows.iter().map(|s| (s.id, s.target_bitrate)).collect(),
            states: stats.subflows.iter().map(|s| (s.id, s.state)).collect(),
        });
    }

    fn rejoin_passive(&mut self, stats: &SchedulerStats) {
        let Some(after) = self.config.rejoin_after_ms.map(Duration::from_millis) else {
            return;
        };
        for sf in &stats.subflows {
            if sf.state.is_active() {
                self.passive_since.remove(&sf.id);
                continue;
            }
            let since = *self.passive_since.entry(sf.id).or_insert(self.t);
            if self.t.saturating_sub(since) < after {
                continue;
            }
            let target = self.config.initial_target_kbit * 1000;
            match self.sched.add_subflow(sf.id, target) {
                Ok(()) => {
                    let t_ms = self.t.as_millis() as u64;
                    info!(subflow_id = sf.id, t_ms, "re-joined passive subflow");
                    self.passive_since.remove(&sf.id);
                    self.rejoins += 1;
                }
                Err(e) => warn!(subflow_id = sf.id, error = %e, "re-join failed"),
            }
        }
    }

    fn media_bitrate(&self) -> u64 {
        let stats = self.sched.stats();
        let total: u64 = stats
            .subflows
            .iter()
            .filter(|s| s.state.is_active())
            .map(|s| s.target_bitrate)
            .sum();
        match self.config.media_max_kbit {
            Some(max) => total.min(max * 1000),
            None => total,
        }
    }

    fn finish(self) -> SimulationReport {
        let paths = self
            .paths
            .iter()
            .map(|p| {
                let totals = self.receiver.totals(p.id());
                PathReport {
                    id: p.id(),
                    final_capacity_kbit: (p.capacity_bps() / 1000.0).round() as u64,
                    counters: p.counters().clone(),
                    delivered_packets: totals.delivered,
                    mean_owd_ms: totals.mean_delay.as_secs_f64() * 1000.0,
                }
            })
            .collect();
        let control = self.sched.stats();
        info!(
            media_packets = self.media_packets,
            unsent_packets = self.unsent_packets,
            reports = control.counters.reports_applied,
            rebuilds = control.rebuilds,
            "simulation finished"
        );
        SimulationReport {
            seed: self.config.seed,
            duration_ms: self.t.as_millis() as u64,
            media_packets: self.media_packets,
            unsent_packets: self.unsent_packets,
            rejoins: self.rejoins,
            paths,
            timeline: self.timeline,
            control,
        }
    }
}

/// Build and run a scenario.
pub fn run(config: ScenarioConfig) -> Result<SimulationReport> {
    Simulation::new(config)?.run()
}
