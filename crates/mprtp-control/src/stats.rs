use serde::Serialize;

use crate::state::SubflowState;
use crate::SubflowId;

/// Snapshot of one subflow.
#[derive(Debug, Clone, Serialize)]
pub struct SubflowStats {
    pub id: SubflowId,
    pub state: SubflowState,
    pub target_bitrate: u64,
    /// Sending rate over the last report interval.
    pub actual_bitrate: f64,
    pub goodput_bitrate: Option<f64>,
    pub rtt_ms: Option<f64>,
    pub loss_fraction: f64,
    /// Delay trend at the last evaluated tick.
    pub trend: f64,
    pub packets_sent: u64,
    pub bytes_sent: u64,
    pub reports: u64,
    pub transitions: u64,
    /// Allocator units currently owned.
    pub tree_units: u32,
}

/// Counters kept by the scheduler loop.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LoopCounters {
    pub reports_applied: u64,
    pub blocks_applied: u64,
    pub malformed_reports: u64,
    pub stale_blocks: u64,
    pub unknown_subflow_blocks: u64,
    pub packets_selected: u64,
    pub no_path_selections: u64,
    pub ticks: u64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SchedulerStats {
    #[serde(flatten)]
    pub counters: LoopCounters,
    pub rebuilds: u64,
    /// Capacity the current allocator tree was built for.
    pub allocated_bitrate: u64,
    pub subflows: Vec<SubflowStats>,
}

impl SchedulerStats {
    pub fn subflow(&self, id: SubflowId) -> Option<&SubflowStats> {
        self.subflows.iter().find(|s| s.id == id)
    }

    /// Fraction of all selected bytes that went to `id`.
    pub fn byte_share(&self, id: SubflowId) -> f64 {
        let total: u64 = self.subflows.iter().map(|s| s.bytes_sent).sum();
        if total == 0 {
            return 0.0;
        }
        self.subflow(id).map_or(0.0, |s| s.bytes_sent as f64 / total as f64)
    }
}
