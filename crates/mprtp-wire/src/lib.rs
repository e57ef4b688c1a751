//! # mprtp-wire
//!
//! Wire format for multipath RTP feedback.
//!
//! A feedback report is one MPRTCP packet (RTCP payload type 212) carrying a
//! chain of per-subflow blocks. Every block embeds ordinary RTCP packets: a
//! receiver report and extended reports for one-way delay, discarded bytes and
//! run-length encoded loss/discard maps.
//!
//! ## Crate structure
//!
//! - [`report`]: Block types, RTCP headers, report decoding
//! - [`builder`]: Incremental three-phase report builder
//! - [`seq`]: Wrap-aware 16-bit and extended sequence arithmetic
//! - [`time`]: Fixed-point delay and NTP timestamp conversions
//! - [`error`]: Decode and encode errors

pub mod builder;
pub mod error;
pub mod report;
pub mod seq;
pub mod time;

pub use builder::ReportBuilder;
pub use error::{DecodeError, EncodeError};
pub use report::{FeedbackReport, ReportItem, SubflowBlock};
