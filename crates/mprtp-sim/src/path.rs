//! # Path Model
//!
//! Each path is a FIFO bottleneck with a fixed propagation delay:
//!
//! ```text
//!   send ──▶ [ queue │ serialize ] ──▶ loss? ──▶ base delay + jitter ──▶ arrive
//!                 │
//!                 └── tail drop once the standing queue exceeds queue_limit
//! ```
//!
//! Capacity optionally follows a bounded random walk, stepped once per
//! simulated second.

use std::time::Duration;

use rand::rngs::StdRng;
use rand::RngExt as _;
use serde::Serialize;

use mprtp_control::SubflowId;

use crate::scenario::PathConfig;

/// Fate of one packet handed to a path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transmit {
    Delivered { seq: u16, arrival: Duration },
    /// Dropped on the wire; the sequence number is consumed.
    Lost { seq: u16 },
    /// Tail-dropped at the bottleneck queue.
    QueueDrop { seq: u16 },
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct PathCounters {
    pub sent_packets: u64,
    pub sent_bytes: u64,
    pub lost_packets: u64,
    pub queue_drops: u64,
}

#[derive(Debug)]
pub struct PathModel {
    config: PathConfig,
    capacity_bps: f64,
    /// When the bottleneck finishes serializing everything queued so far.
    busy_until: Duration,
    next_seq: u16,
    counters: PathCounters,
}

impl PathModel {
    pub fn new(config: PathConfig) -> Self {
        let capacity_bps = config.capacity_kbit as f64 * 1000.0;
        Self {
            config,
            capacity_bps,
            busy_until: Duration::ZERO,
            next_seq: 0,
            counters: PathCounters::default(),
        }
    }

    pub fn id(&self) -> SubflowId {
        self.config.id
    }

    pub fn config(&self) -> &PathConfig {
        &self.config
    }

    pub fn capacity_bps(&self) -> f64 {
        self.capacity_bps
    }

    pub fn counters(&self) -> &PathCounters {
        &self.counters
    }

    /// Queueing delay a packet entering at `now` would see.
    pub fn queue_delay(&self, now: Duration) -> Duration {
        self.busy_until.saturating_sub(now)
    }

    pub fn transmit(&mut self, now: Duration, bytes: usize, rng: &mut StdRng) -> Transmit {
        let seq = self.next_seq;
        self.next_seq = self.next_seq.wrapping_add(1);
        self.counters.sent_packets += 1;
        self.counters.sent_bytes += bytes as u64;

        if self.queue_delay(now) > Duration::from_millis(self.config.queue_limit_ms) {
            self.counters.queue_drops += 1;
            return Transmit::QueueDrop { seq };
        }
        let serialize = Duration::from_secs_f64(bytes as f64 * 8.0 / self.capacity_bps);
        let departure = self.busy_until.max(now) + serialize;
        self.busy_until = departure;

        if rng.random::<f64>() * 100.0 < self.config.loss_percent {
            self.counters.lost_packets += 1;
            return Transmit::Lost { seq };
        }
        let jitter_s = rng.random::<f64>() * self.config.jitter_ms as f64 / 1000.0;
        let jitter = Duration::from_secs_f64(jitter_s);
        Transmit::Delivered {
            seq,
            arrival: departure + Duration::from_millis(self.config.base_delay_ms) + jitter,
        }
    }

    /// Arrival time of a small control packet sent at `now`. It waits behind
    /// the queue but takes no capacity itself.
    pub fn control_arrival(&self, now: Duration) -> Duration {
        now + self.queue_delay(now) + Duration::from_millis(self.config.base_delay_ms)
    }

    /// One random-walk step of the capacity within its configured bounds.
    pub fn walk_capacity(&mut self, rng: &mut StdRng) {
        let (min, max) = self.config.capacity_bounds_kbit();
        if min == max {
            return;
        }
        let delta = rand_signed(rng, self.config.capacity_step_kbit as f64 * 1000.0);
        self.capacity_bps =
            (self.capacity_bps + delta).clamp(min as f64 * 1000.0, max as f64 * 1000.0);
    }
}

fn rand_signed(rng: &mut StdRng, max_step: f64) -> f64 {
    if max_step <= 0.0 {
        return 0.0;
    }
    let mag = rng.random::<f64>() * max_step;
    if rng.random::<bool>() {
        mag
    } else {
        -mag
    }
}
