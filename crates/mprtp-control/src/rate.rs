//! # Rate Controller
//!
//! Turns state-machine transitions into a target bitrate per subflow:
//!
//! | Action         | Effect on target                                            |
//! |----------------|-------------------------------------------------------------|
//! | `Increase`     | `+ clamp(target·γ, ramp_up_min, ramp_up_max)` after hold-off |
//! | `Shrink`       | `× (1 − β)`                                                 |
//! | `ShrinkByLoss` | `× (1 − min(loss, 0.5))`                                    |
//! | `Restore`      | `min(pre_congestion, max(target, goodput))`                 |
//! | `Zero`         | `0`                                                         |
//!
//! Every decrease opens an increase hold-off of `clamp(2·rtt, min, max)`.

use std::time::Duration;

use quanta::Instant;

use crate::config::RateConfig;
use crate::state::{RateAction, SubflowState, Transition};

/// Largest loss fraction a single `Lost` event may take off the target.
const MAX_LOSS_CUT: f64 = 0.5;

/// Bytes seen by the receiver over one report interval.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GoodputSample {
    pub sent_bytes: u64,
    pub discarded_bytes: u64,
    /// Interval loss fraction in `[0, 1]`.
    pub loss_fraction: f64,
    pub elapsed: Duration,
}

impl GoodputSample {
    /// Useful bits per second: received bytes, estimated from sent bytes and
    /// loss, minus bytes the receiver had to discard.
    pub fn bitrate(&self) -> Option<f64> {
        let secs = self.elapsed.as_secs_f64();
        if secs <= 0.0 {
            return None;
        }
        let received = self.sent_bytes as f64 * (1.0 - self.loss_fraction.clamp(0.0, 1.0));
        let useful = (received - self.discarded_bytes as f64).max(0.0);
        Some(useful * 8.0 / secs)
    }
}

#[derive(Debug, Clone)]
pub struct RateController {
    config: RateConfig,
    target: f64,
    pre_congestion_target: f64,
    goodput: Option<f64>,
    loss_fraction: f64,
    holdoff_until: Option<Instant>,
}

impl RateController {
    pub fn new(config: RateConfig, initial_target: u64) -> Self {
        let target = bounded(initial_target as f64, config.min_bitrate, config.max_bitrate);
        Self {
            config,
            target,
            pre_congestion_target: target,
            goodput: None,
            loss_fraction: 0.0,
            holdoff_until: None,
        }
    }

    /// Target bitrate in bits per second.
    pub fn target(&self) -> u64 {
        self.target.round() as u64
    }

    pub fn pre_congestion_target(&self) -> u64 {
        self.pre_congestion_target.round() as u64
    }

    pub fn goodput(&self) -> Option<f64> {
        self.goodput
    }

    pub fn loss_fraction(&self) -> f64 {
        self.loss_fraction
    }

    pub fn in_holdoff(&self, now: Instant) -> bool {
        self.holdoff_until.is_some_and(|until| now < until)
    }

    pub fn record_goodput(&mut self, sample: GoodputSample) {
        self.loss_fraction = sample.loss_fraction.clamp(0.0, 1.0);
        if let Some(bps) = sample.bitrate() {
            self.goodput = Some(bps);
        }
    }

    /// Re-arm after a re-join: fresh target, measurements forgotten.
    pub fn reset(&mut self, initial_target: u64) {
        *self = Self::new(self.config.clone(), initial_target);
    }

    /// Apply the rate side of `transition`. Returns the new target.
    pub fn apply(&mut self, transition: &Transition, now: Instant, rtt: Option<Duration>) -> u64 {
        let before = self.target;
        match transition.action {
            RateAction::Keep => {}
            RateAction::Increase => {
                if !self.in_holdoff(now) {
                    let step = bounded(
                        self.target * self.config.gamma,
                        self.config.ramp_up_min,
                        self.config.ramp_up_max,
                    );
                    self.target += step;
                    self.pre_congestion_target = self.target;
                }
            }
            RateAction::Shrink => {
                self.remember_pre_congestion(transition);
                self.target *= 1.0 - self.config.beta;
            }
            RateAction::ShrinkByLoss => {
                self.remember_pre_congestion(transition);
                self.target *= 1.0 - self.loss_fraction.min(MAX_LOSS_CUT);
            }
            RateAction::Restore => {
                let floor = self.goodput.map_or(self.target, |g| g.max(self.target));
                self.target = floor.min(self.pre_congestion_target).max(self.target);
            }
            RateAction::Zero => {
                self.target = 0.0;
                return 0;
            }
        }

        self.target = bounded(self.target, self.config.min_bitrate, self.config.max_bitrate);
        if self.target < before {
            self.holdoff_until = Some(now + self.holdoff(rtt));
        }
        self.target()
    }

    fn remember_pre_congestion(&mut self, transition: &Transition) {
        if transition.from == SubflowState::NonCongested {
            self.pre_congestion_target = self.target;
        }
    }

    fn holdoff(&self, rtt: Option<Duration>) -> Duration {
        rtt.map_or(self.config.holdoff_min, |rtt| {
            (rtt * 2).max(self.config.holdoff_min).min(self.config.holdoff_max)
        })
    }
}

/// Clamp to `[lo, hi]`; the upper bound wins if the two are inverted.
fn bounded(x: f64, lo: u64, hi: u64) -> f64 {
    x.max(lo as f64).min(hi as f64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{transition, SubflowEvent, SubflowState};
    use quanta::Clock;

    fn controller(initial: u64) -> RateController {
        RateController::new(RateConfig::default(), initial)
    }

    #[test]
    fn initial_target_is_clamped() {
        assert_eq!(controller(1).target(), RateConfig::default().min_bitrate);
        assert_eq!(controller(u64::MAX).target(), RateConfig::default().max_bitrate);
    }

    #[test]
    fn inverted_bounds_do_not_panic() {
        let (clock, _mock) = Clock::mock();
        let config = RateConfig {
            min_bitrate: 2_000_000,
            max_bitrate: 1_000_000,
            ramp_up_min: 500_000,
            ramp_up_max: 10_000,
            holdoff_min: Duration::from_secs(2),
            holdoff_max: Duration::from_millis(300),
            ..RateConfig::default()
        };
        let mut rc = RateController::new(config, 1_500_000);
        assert_eq!(rc.target(), 1_000_000);
        let shrink = transition(SubflowState::NonCongested, SubflowEvent::Distortion);
        rc.apply(&shrink, clock.now(), Some(Duration::from_millis(400)));
        assert_eq!(rc.target(), 1_000_000);
        let settle = transition(SubflowState::NonCongested, SubflowEvent::Settlement);
        assert_eq!(rc.apply(&settle, clock.now(), None), 1_000_000);
    }

    #[test]
    fn distortion_shrinks_by_beta() {
        let (clock, _mock) = Clock::mock();
        let mut rc = controller(1_000_000);
        let t = transition(SubflowState::NonCongested, SubflowEvent::Distortion);
        assert_eq!(rc.apply(&t, clock.now(), None), 850_000);
        let t = transition(SubflowState::Congested, SubflowEvent::Distortion);
        assert_eq!(rc.apply(&t, clock.now(), None), 722_500);
        assert_eq!(rc.pre_congestion_target(), 1_000_000);
    }

    #[test]
    fn loss_cut_is_capped() {
        let (clock, _mock) = Clock::mock();
        let mut rc = controller(1_000_000);
        rc.record_goodput(GoodputSample {
            sent_bytes: 100_000,
            discarded_bytes: 0,
            loss_fraction: 0.9,
            elapsed: Duration::from_secs(1),
        });
        let t = transition(SubflowState::NonCongested, SubflowEvent::Lost);
        assert_eq!(rc.apply(&t, clock.now(), None), 500_000);
    }

    #[test]
    fn increase_waits_for_holdoff() {
        let (clock, mock) = Clock::mock();
        let mut rc = controller(1_000_000);
        let shrink = transition(SubflowState::NonCongested, SubflowEvent::Distortion);
        let settle = transition(SubflowState::NonCongested, SubflowEvent::Settlement);

        rc.apply(&shrink, clock.now(), Some(Duration::from_millis(400)));
        // hold-off = clamp(800 ms, 300 ms, 2 s)
        mock.increment(Duration::from_millis(700));
        assert_eq!(rc.apply(&settle, clock.now(), None), 850_000);
        mock.increment(Duration::from_millis(100));
        assert!(!rc.in_holdoff(clock.now()));
        // 850k · 3 % = 25.5k
        assert_eq!(rc.apply(&settle, clock.now(), None), 875_500);
    }

    #[test]
    fn increase_step_is_clamped() {
        let (clock, _mock) = Clock::mock();
        let settle = transition(SubflowState::NonCongested, SubflowEvent::Settlement);

        let mut small = controller(100_000);
        assert_eq!(small.apply(&settle, clock.now(), None), 110_000);

        let mut large = controller(19_000_000);
        assert_eq!(large.apply(&settle, clock.now(), None), 19_500_000);
        assert_eq!(large.apply(&settle, clock.now(), None), 20_000_000);
    }

    #[test]
    fn restore_is_bounded_by_pre_congestion_target() {
        let (clock, _mock) = Clock::mock();
        let mut rc = controller(1_000_000);
        rc.apply(
            &transition(SubflowState::NonCongested, SubflowEvent::Distortion),
            clock.now(),
            None,
        );
        rc.record_goodput(GoodputSample {
            sent_bytes: 250_000,
            discarded_bytes: 0,
            loss_fraction: 0.0,
            elapsed: Duration::from_secs(1),
        });
        assert_eq!(rc.goodput(), Some(2_000_000.0));
        let restore = transition(SubflowState::Congested, SubflowEvent::Settlement);
        assert_eq!(rc.apply(&restore, clock.now(), None), 1_000_000);
    }

    #[test]
    fn restore_never_lowers_target() {
        let (clock, _mock) = Clock::mock();
        let mut rc = controller(1_000_000);
        rc.apply(
            &transition(SubflowState::NonCongested, SubflowEvent::Distortion),
            clock.now(),
            None,
        );
        rc.record_goodput(GoodputSample {
            sent_bytes: 10_000,
            discarded_bytes: 5_000,
            loss_fraction: 0.0,
            elapsed: Duration::from_secs(1),
        });
        let restore = transition(SubflowState::Congested, SubflowEvent::Settlement);
        assert_eq!(rc.apply(&restore, clock.now(), None), 850_000);
    }

    #[test]
    fn late_zeroes_target() {
        let (clock, _mock) = Clock::mock();
        let mut rc = controller(1_000_000);
        let late = transition(SubflowState::Congested, SubflowEvent::Late);
        assert_eq!(rc.apply(&late, clock.now(), None), 0);
        assert_eq!(rc.target(), 0);
        rc.reset(400_000);
        assert_eq!(rc.target(), 400_000);
        assert_eq!(rc.goodput(), None);
    }

    #[test]
    fn goodput_subtracts_loss_and_discards() {
        let sample = GoodputSample {
            sent_bytes: 100_000,
            discarded_bytes: 10_000,
            loss_fraction: 0.1,
            elapsed: Duration::from_millis(500),
        };
        // (90_000 − 10_000) · 8 / 0.5
        assert_eq!(sample.bitrate(), Some(1_280_000.0));
        let idle = GoodputSample {
            elapsed: Duration::ZERO,
            ..sample
        };
        assert_eq!(idle.bitrate(), None);
    }
}
