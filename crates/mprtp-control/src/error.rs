use thiserror::Error;

use crate::SubflowId;

// ── Errors ──────────────────────────────────────────────────────────

/// Conditions on the control path. None of them is fatal: the offending
/// report block or call is skipped and the loop keeps running.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ControlError {
    /// A report block names a subflow that is not tracked (it may just have
    /// been removed).
    #[error("unknown subflow {0}")]
    UnknownSubflow(SubflowId),
    /// A report is older than the snapshot already applied for its subflow.
    #[error("stale report on subflow {subflow_id}: seq {received:#x} behind {applied:#x}")]
    StaleReport {
        subflow_id: SubflowId,
        received: u32,
        applied: u32,
    },
    #[error("subflow {0} is already active")]
    DuplicateSubflow(SubflowId),
    #[error("feedback queue is full")]
    FeedbackQueueFull,
    #[error("control runtime has stopped")]
    RuntimeStopped,
}
