//! # mprtp-control
//!
//! Send-side control core of a multipath RTP sender.
//!
//! Receiver feedback flows in through [`SchedulerLoop::on_feedback`], a
//! periodic [`SchedulerLoop::tick`] turns it into per-subflow target bitrates,
//! and [`SchedulerLoop::select_path`] picks a subflow for every outgoing
//! packet in proportion to those targets.
//!
//! ```text
//!  feedback ──▶ FeedbackReport ──▶ Subflow moments ──▶ DelayTrendAnalyzer
//!                                                            │
//!                                        tick ──▶ SubflowStateMachine ──▶ RateController
//!                                                                              │
//!  packet ──▶ select_path ◀── BandwidthAllocator ◀──── rebuild on drift ◀──────┘
//! ```
//!
//! ## Crate structure
//!
//! - [`analyzer`]: Correlation-block cascade detecting queue-delay growth
//! - [`state`]: Per-subflow congestion state machine
//! - [`rate`]: Target bitrate controller
//! - [`allocator`]: Weighted binary scheduling tree
//! - [`subflow`]: Per-path data model and report moments
//! - [`scheduler`]: The lock-protected orchestrator
//! - [`runtime`]: Worker thread driving ticks and feedback
//! - [`config`]: TOML configuration
//! - [`stats`]: Serializable statistics snapshots
//! - [`error`]: Control-path errors

pub mod allocator;
pub mod analyzer;
pub mod config;
pub mod error;
pub mod rate;
pub mod runtime;
pub mod scheduler;
pub mod state;
pub mod stats;
pub mod subflow;

/// Subflow identifier as carried in MPRTCP blocks.
pub type SubflowId = u16;

pub use allocator::{BandwidthAllocator, Packet};
pub use config::ControlConfig;
pub use error::ControlError;
pub use runtime::ControlRuntime;
pub use scheduler::SchedulerLoop;
pub use state::{SubflowEvent, SubflowState};
