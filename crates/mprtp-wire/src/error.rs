use thiserror::Error;

// ── Errors ──────────────────────────────────────────────────────────

/// Failure to decode a feedback report.
///
/// Any error means the whole report is discarded; the decoder never hands out
/// a partially parsed report.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    /// A length field points past the end of the buffer, or a block is too
    /// short for its declared type.
    #[error("malformed report: {context} needs {needed} bytes, {available} available")]
    Malformed {
        context: &'static str,
        needed: usize,
        available: usize,
    },
    #[error("unsupported RTCP version {0}")]
    UnsupportedVersion(u8),
    #[error("unexpected RTCP packet type {0}")]
    UnexpectedPacketType(u8),
}

impl DecodeError {
    pub(crate) fn malformed(context: &'static str, needed: usize, available: usize) -> Self {
        DecodeError::Malformed {
            context,
            needed,
            available,
        }
    }
}

/// Misuse of the [`ReportBuilder`](crate::builder::ReportBuilder).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EncodeError {
    #[error("no subflow block is open, call begin() first")]
    NoOpenBlock,
    #[error("subflow block would grow to {words} words, limit is 255")]
    BlockTooLong { words: usize },
    #[error("report already carries the maximum of 31 subflow blocks")]
    TooManyBlocks,
    #[error("run-length block has {chunks} chunks, limit is {max}")]
    TooManyChunks { chunks: usize, max: usize },
}
