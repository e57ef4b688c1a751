use std::sync::Arc;
use std::thread;

use bytes::Bytes;
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};
use tracing::{debug, info, warn};

use crate::error::ControlError;
use crate::scheduler::SchedulerLoop;
use crate::SubflowId;

enum RuntimeMessage {
    Feedback(Bytes),
    AddSubflow(SubflowId, u64),
    RemoveSubflow(SubflowId),
    Shutdown,
}

/// Drives a [`SchedulerLoop`] from a worker thread: ticks at the configured
/// interval and applies feedback in arrival order. The send path calls
/// [`SchedulerLoop::select_path`] directly through [`scheduler`](Self::scheduler).
pub struct ControlRuntime {
    scheduler: Arc<SchedulerLoop>,
    sender: Sender<RuntimeMessage>,
    handle: Option<thread::JoinHandle<()>>,
}

impl ControlRuntime {
    pub fn new(scheduler: Arc<SchedulerLoop>) -> Self {
        let (tx, rx) = bounded(scheduler.config().scheduler.feedback_channel_capacity);
        let worker_scheduler = scheduler.clone();
        let handle = thread::spawn(move || runtime_worker(rx, worker_scheduler));
        Self {
            scheduler,
            sender: tx,
            handle: Some(handle),
        }
    }

    pub fn scheduler(&self) -> &Arc<SchedulerLoop> {
        &self.scheduler
    }

    /// Queue a raw feedback report. Never blocks the caller.
    pub fn try_submit_feedback(&self, report: Bytes) -> Result<(), ControlError> {
        match self.sender.try_send(RuntimeMessage::Feedback(report)) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(ControlError::FeedbackQueueFull),
            Err(TrySendError::Disconnected(_)) => Err(ControlError::RuntimeStopped),
        }
    }

    /// Add or re-join a subflow after feedback already queued.
    pub fn add_subflow(&self, id: SubflowId, initial_target: u64) -> Result<(), ControlError> {
        self.sender
            .send(RuntimeMessage::AddSubflow(id, initial_target))
            .map_err(|_| ControlError::RuntimeStopped)
    }

    pub fn remove_subflow(&self, id: SubflowId) -> Result<(), ControlError> {
        self.sender
            .send(RuntimeMessage::RemoveSubflow(id))
            .map_err(|_| ControlError::RuntimeStopped)
    }

    pub fn shutdown(&mut self) {
        let _ = self.sender.send(RuntimeMessage::Shutdown);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for ControlRuntime {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn runtime_worker(rx: Receiver<RuntimeMessage>, scheduler: Arc<SchedulerLoop>) {
    let tick_interval = scheduler.config().scheduler.tick_interval;
    let clock = scheduler.clock().clone();
    info!(tick_ms = tick_interval.as_millis() as u64, "control runtime started");

    let mut next_tick = clock.now() + tick_interval;
    loop {
        let timeout = next_tick.saturating_duration_since(clock.now());
        match rx.recv_timeout(timeout) {
            Ok(RuntimeMessage::Feedback(report)) => {
                // Already logged and counted by the scheduler.
                let _ = scheduler.on_feedback(&report);
            }
            Ok(RuntimeMessage::AddSubflow(id, target)) => {
                if let Err(e) = scheduler.add_subflow(id, target) {
                    warn!(subflow_id = id, error = %e, "add subflow rejected");
                }
            }
            Ok(RuntimeMessage::RemoveSubflow(id)) => {
                scheduler.remove_subflow(id);
            }
            Ok(RuntimeMessage::Shutdown) => break,
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }

        let now = clock.now();
        if now >= next_tick {
            scheduler.tick(now);
            next_tick = now + tick_interval;
        }
    }
    debug!("control runtime stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ControlConfig;
    use crate::state::SubflowState;
    use mprtp_wire::report::{IntervalMetric, OneWayDelayBlock};
    use mprtp_wire::ReportBuilder;
    use std::time::{Duration, Instant};

    fn wait_for(mut cond: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        false
    }

    #[test]
    fn applies_feedback_and_ticks() {
        let config = ControlConfig::from_toml_str(
            "[scheduler]\ntick_interval_ms = 10\nlate_timeout_ms = 60000\n",
        )
        .unwrap();
        let scheduler = Arc::new(SchedulerLoop::new(config));
        let runtime = ControlRuntime::new(scheduler.clone());
        runtime.add_subflow(1, 1_000_000).unwrap();

        let mut builder = ReportBuilder::new(1, 2);
        builder.begin(1);
        builder
            .add_owd(OneWayDelayBlock {
                interval_metric: IntervalMetric::Interval,
                ssrc: 2,
                median_delay: 1000,
                min_delay: 900,
                max_delay: 1100,
            })
            .unwrap();
        runtime.try_submit_feedback(builder.end().unwrap()).unwrap();

        assert!(wait_for(|| {
            let c = scheduler.stats().counters;
            c.blocks_applied == 1 && c.ticks >= 3
        }));
        assert_eq!(scheduler.subflow_state(1), Some(SubflowState::NonCongested));
    }

    #[test]
    fn drop_joins_worker() {
        let scheduler = Arc::new(SchedulerLoop::new(ControlConfig::default()));
        let mut runtime = ControlRuntime::new(scheduler.clone());
        runtime.shutdown();
        assert_eq!(
            runtime.try_submit_feedback(Bytes::from_static(b"x")),
            Err(ControlError::RuntimeStopped)
        );
        assert_eq!(Arc::strong_count(&scheduler), 2);
    }
}
