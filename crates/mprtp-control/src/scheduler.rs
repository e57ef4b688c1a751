//! # Scheduler Loop
//!
//! Three actors share one lock:
//!
//! ```text
//!   send path ──── select_path ────┐
//!   feedback ───── on_feedback ────┼──▶ Mutex<Inner> { subflows, allocator, counters }
//!   timer ──────── tick ───────────┘
//! ```
//!
//! `select_path` holds the lock for select + approve, so the allocator tree
//! is never observed half-updated; rebuilds swap the whole tree under the
//! same lock.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use mprtp_wire::report::FeedbackReport;
use mprtp_wire::time::{compact_ntp, duration_to_ntp};
use mprtp_wire::DecodeError;
use quanta::{Clock, Instant};
use tracing::{debug, warn};

use crate::allocator::{BandwidthAllocator, Packet};
use crate::config::ControlConfig;
use crate::error::ControlError;
use crate::state::{SubflowEvent, SubflowState, Transition};
use crate::stats::{LoopCounters, SchedulerStats};
use crate::subflow::Subflow;
use crate::SubflowId;

/// Sender NTP time at construction. Non-zero so an echoed LSR is never
/// mistaken for "no sender report".
const NTP_ORIGIN: Duration = Duration::from_secs(1);

struct Inner {
    subflows: BTreeMap<SubflowId, Subflow>,
    allocator: BandwidthAllocator,
    counters: LoopCounters,
}

impl Inner {
    fn active_targets(&self) -> Vec<(SubflowId, u64)> {
        self.subflows
            .values()
            .filter(|sf| sf.state().is_active())
            .map(|sf| (sf.id(), sf.target_bitrate()))
            .collect()
    }

    fn rebuild(&mut self, reason: &'static str) {
        let targets = self.active_targets();
        self.allocator.rebuild(&targets);
        debug!(
            reason,
            subflows = targets.len(),
            total_bitrate = self.allocator.tree().total(),
            rebuilds = self.allocator.rebuilds(),
            "allocator rebuilt"
        );
    }

    fn refresh(&mut self) {
        let targets = self.active_targets();
        if self.allocator.refresh(&targets) {
            debug!(
                subflows = targets.len(),
                total_bitrate = self.allocator.tree().total(),
                rebuilds = self.allocator.rebuilds(),
                "allocator rebuilt after target drift"
            );
        }
    }
}

fn log_transition(id: SubflowId, t: &Transition, target: u64) {
    if !t.changed() {
        return;
    }
    if t.to == SubflowState::Passive {
        warn!(subflow_id = id, from = ?t.from, "subflow detached: feedback timed out");
    } else {
        debug!(
            subflow_id = id,
            from = ?t.from,
            to = ?t.to,
            event = ?t.event,
            target_bitrate = target,
            "subflow state transition"
        );
    }
}

/// Send-side control loop for one multipath session.
pub struct SchedulerLoop {
    config: ControlConfig,
    clock: Clock,
    origin: Instant,
    inner: Mutex<Inner>,
}

impl SchedulerLoop {
    pub fn new(config: ControlConfig) -> Self {
        Self::with_clock(config, Clock::new())
    }

    /// Use a specific clock, e.g. `Clock::mock()` in tests.
    pub fn with_clock(config: ControlConfig, clock: Clock) -> Self {
        let origin = clock.now();
        let allocator = BandwidthAllocator::new(config.allocator.clone());
        Self {
            config,
            clock,
            origin,
            inner: Mutex::new(Inner {
                subflows: BTreeMap::new(),
                allocator,
                counters: LoopCounters::default(),
            }),
        }
    }

    pub fn config(&self) -> &ControlConfig {
        &self.config
    }

    pub fn clock(&self) -> &Clock {
        &self.clock
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // ─── Membership ─────────────────────────────────────────────────────

    /// Start tracking `id`, or re-join it if it went passive.
    pub fn add_subflow(&self, id: SubflowId, initial_target: u64) -> Result<(), ControlError> {
        let now = self.clock.now();
        let mut guard = self.lock();
        let inner = &mut *guard;
        match inner.subflows.get_mut(&id) {
            Some(sf) if sf.state().is_active() => return Err(ControlError::DuplicateSubflow(id)),
            Some(sf) => {
                sf.rejoin(initial_target, now);
                debug!(subflow_id = id, target_bitrate = sf.target_bitrate(), "subflow re-joined");
            }
            None => {
                let sf = Subflow::new(id, initial_target, now, &self.config);
                debug!(subflow_id = id, target_bitrate = sf.target_bitrate(), "subflow added");
                inner.subflows.insert(id, sf);
            }
        }
        inner.rebuild("join");
        Ok(())
    }

    pub fn remove_subflow(&self, id: SubflowId) -> bool {
        let mut guard = self.lock();
        if guard.subflows.remove(&id).is_none() {
            return false;
        }
        debug!(subflow_id = id, "subflow removed");
        guard.rebuild("leave");
        true
    }

    // ─── Send Path ──────────────────────────────────────────────────────

    /// Choose the subflow for `packet`, or `None` if no subflow may send now.
    pub fn select_path(&self, packet: &Packet, now: Instant) -> Option<SubflowId> {
        let mut guard = self.lock();
        let inner = &mut *guard;
        let subflows = &inner.subflows;
        let Some(selection) = inner
            .allocator
            .select(packet, now, |id| subflows.get(&id).map(Subflow::path_status))
        else {
            inner.counters.no_path_selections += 1;
            return None;
        };
        inner.allocator.approve(&selection, packet.payload_size as u64);
        if let Some(sf) = inner.subflows.get_mut(&selection.subflow) {
            sf.record_sent(packet.payload_size, now, self.config.allocator.pacing_gain);
        }
        inner.counters.packets_selected += 1;
        Some(selection.subflow)
    }

    // ─── Feedback Path ──────────────────────────────────────────────────

    pub fn on_feedback(&self, raw: &[u8]) -> Result<(), DecodeError> {
        self.on_feedback_at(raw, self.clock.now())
    }

    /// Apply a feedback report received at `now`. Malformed reports touch no
    /// state; blocks for unknown subflows and stale blocks are counted and
    /// skipped.
    pub fn on_feedback_at(&self, raw: &[u8], now: Instant) -> Result<(), DecodeError> {
        let report = match FeedbackReport::decode(raw) {
            Ok(report) => report,
            Err(e) => {
                warn!(error = %e, len = raw.len(), "dropping malformed feedback report");
                self.lock().counters.malformed_reports += 1;
                return Err(e);
            }
        };
        let arrival = self.compact_ntp(now);

        let mut guard = self.lock();
        let inner = &mut *guard;
        for block in &report.blocks {
            let applied = match inner.subflows.get_mut(&block.subflow_id) {
                Some(sf) => sf.apply_block(block, now, arrival),
                None => Err(ControlError::UnknownSubflow(block.subflow_id)),
            };
            match applied {
                Ok(()) => inner.counters.blocks_applied += 1,
                Err(e) => {
                    debug!(subflow_id = block.subflow_id, error = %e, "feedback block ignored");
                    let counter = match e {
                        ControlError::UnknownSubflow(_) => {
                            &mut inner.counters.unknown_subflow_blocks
                        }
                        _ => &mut inner.counters.stale_blocks,
                    };
                    *counter += 1;
                }
            }
        }
        inner.counters.reports_applied += 1;
        Ok(())
    }

    /// Feed a one-way delay sample measured outside the report path.
    pub fn on_delay_sample(&self, id: SubflowId, delay: Duration) -> bool {
        let now = self.clock.now();
        self.lock()
            .subflows
            .get_mut(&id)
            .is_some_and(|sf| sf.add_delay_sample(delay, now))
    }

    // ─── Timer ──────────────────────────────────────────────────────────

    /// Derive one event per subflow, apply it, then rebuild the allocator if
    /// membership changed or targets drifted.
    pub fn tick(&self, now: Instant) {
        let late_timeout = self.config.scheduler.late_timeout;
        let loss_threshold = self.config.rate.loss_threshold;
        let silence = self.config.scheduler.report_interval * 2;

        let mut guard = self.lock();
        let inner = &mut *guard;
        inner.counters.ticks += 1;
        let mut detached = false;
        for (&id, sf) in inner.subflows.iter_mut() {
            if !sf.state().is_active() {
                continue;
            }
            sf.age_if_silent(now, silence);
            let event = sf.derive_event(now, late_timeout, loss_threshold);
            let t = sf.fire(event, now);
            log_transition(id, &t, sf.target_bitrate());
            detached |= t.changed() && t.to == SubflowState::Passive;
        }
        if detached {
            inner.rebuild("passive");
        } else {
            inner.refresh();
        }
    }

    /// Apply `event` to `id` right away, as if a tick had derived it. The
    /// allocator follows at the next tick unless the subflow went passive.
    pub fn inject_event(
        &self,
        id: SubflowId,
        event: SubflowEvent,
        now: Instant,
    ) -> Option<Transition> {
        let mut guard = self.lock();
        let sf = guard.subflows.get_mut(&id)?;
        let t = sf.fire(event, now);
        log_transition(id, &t, sf.target_bitrate());
        if t.changed() && t.to == SubflowState::Passive {
            guard.rebuild("passive");
        }
        Some(t)
    }

    // ─── Queries ────────────────────────────────────────────────────────

    pub fn subflow_state(&self, id: SubflowId) -> Option<SubflowState> {
        self.lock().subflows.get(&id).map(Subflow::state)
    }

    pub fn target_bitrate(&self, id: SubflowId) -> Option<u64> {
        self.lock().subflows.get(&id).map(Subflow::target_bitrate)
    }

    pub fn subflow_ids(&self) -> Vec<SubflowId> {
        self.lock().subflows.keys().copied().collect()
    }

    pub fn stats(&self) -> SchedulerStats {
        let guard = self.lock();
        let tree = guard.allocator.tree();
        SchedulerStats {
            counters: guard.counters,
            rebuilds: guard.allocator.rebuilds(),
            allocated_bitrate: tree.total(),
            subflows: guard
                .subflows
                .values()
                .map(|sf| sf.stats(tree.units_of(sf.id())))
                .collect(),
        }
    }

    /// Sender NTP timestamp for `now`, as placed in sender reports.
    pub fn ntp_time(&self, now: Instant) -> u64 {
        duration_to_ntp(now.saturating_duration_since(self.origin) + NTP_ORIGIN)
    }

    /// Compact form of [`ntp_time`](Self::ntp_time), the unit of LSR/DLSR.
    pub fn compact_ntp(&self, now: Instant) -> u32 {
        compact_ntp(self.ntp_time(now))
    }
}
