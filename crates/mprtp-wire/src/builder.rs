//! # Report Builder
//!
//! Reports are produced in three phases:
//!
//! ```text
//!   begin(subflow) ──▶ add_rr / add_owd / add_discarded_* ... ──▶ end()
//!        │                        │                                  │
//!   header + info          block length and                   finished bytes,
//!   lengths zeroed         header length grow                 builder reset
//! ```
//!
//! `end()` returns `None` when nothing was added, so an idle interval does not
//! put an empty report on the wire. The builder keeps its buffer between
//! reports.

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::EncodeError;
use crate::report::{
    DiscardedBytesBlock, FeedbackReport, OneWayDelayBlock, ReceiverReportBlock, ReportItem,
    RtcpHeader, RunLengthBlock, BLOCK_TYPE_REPORT, MAX_BLOCKS, MAX_BLOCK_WORDS, PT_MPRTCP,
};

/// Words of the report prefix: RTCP header (2) + media SSRC (1).
const PREFIX_WORDS: u16 = 3;

/// Incremental MPRTCP report writer.
#[derive(Debug)]
pub struct ReportBuilder {
    ssrc: u32,
    media_ssrc: u32,
    buf: BytesMut,
    /// Byte offset of the open block's info word.
    block_offset: Option<usize>,
    block_words: usize,
    blocks: usize,
    items: usize,
}

impl ReportBuilder {
    pub fn new(ssrc: u32, media_ssrc: u32) -> Self {
        ReportBuilder {
            ssrc,
            media_ssrc,
            buf: BytesMut::with_capacity(256),
            block_offset: None,
            block_words: 0,
            blocks: 0,
            items: 0,
        }
    }

    /// Start a new report whose first block describes `subflow_id`. Anything
    /// built since the last `end()` is dropped.
    pub fn begin(&mut self, subflow_id: u16) {
        self.start();
        self.open_block(subflow_id);
    }

    /// Open another subflow block in the current report.
    pub fn next_block(&mut self, subflow_id: u16) -> Result<(), EncodeError> {
        if self.block_offset.is_none() {
            return Err(EncodeError::NoOpenBlock);
        }
        if self.blocks >= MAX_BLOCKS {
            return Err(EncodeError::TooManyBlocks);
        }
        self.open_block(subflow_id);
        Ok(())
    }

    pub fn add_rr(&mut self, rr: ReceiverReportBlock) -> Result<(), EncodeError> {
        self.add_item(ReportItem::ReceiverReport(rr))
    }

    pub fn add_owd(&mut self, owd: OneWayDelayBlock) -> Result<(), EncodeError> {
        self.add_item(ReportItem::OneWayDelay(owd))
    }

    pub fn add_discarded_bytes(&mut self, block: DiscardedBytesBlock) -> Result<(), EncodeError> {
        self.add_item(ReportItem::DiscardedBytes(block))
    }

    pub fn add_discarded_rle(&mut self, block: RunLengthBlock) -> Result<(), EncodeError> {
        self.add_item(ReportItem::DiscardedRle(block))
    }

    pub fn add_lost_rle(&mut self, block: RunLengthBlock) -> Result<(), EncodeError> {
        self.add_item(ReportItem::LostRle(block))
    }

    /// Append one item to the open block. On error nothing is written.
    pub fn add_item(&mut self, item: ReportItem) -> Result<(), EncodeError> {
        let offset = self.block_offset.ok_or(EncodeError::NoOpenBlock)?;
        if let ReportItem::DiscardedRle(rle) | ReportItem::LostRle(rle) = &item {
            if rle.chunks.len() > RunLengthBlock::MAX_CHUNKS {
                return Err(EncodeError::TooManyChunks {
                    chunks: rle.chunks.len(),
                    max: RunLengthBlock::MAX_CHUNKS,
                });
            }
        }
        let words = item.encoded_words();
        if self.block_words + words > MAX_BLOCK_WORDS {
            return Err(EncodeError::BlockTooLong {
                words: self.block_words + words,
            });
        }

        item.encode(self.ssrc, &mut self.buf);
        self.block_words += words;
        self.buf[offset + 1] = self.block_words as u8;
        self.grow_length(words as u16);
        self.items += 1;
        Ok(())
    }

    /// Finish the report. `None` if no item was added since `begin`.
    pub fn end(&mut self) -> Option<Bytes> {
        if self.items == 0 {
            self.reset();
            return None;
        }
        Some(self.finish())
    }

    /// Whether a report is currently being built.
    pub fn is_open(&self) -> bool {
        self.block_offset.is_some()
    }

    // ─── Internals ──────────────────────────────────────────────────────

    fn start(&mut self) {
        self.reset();
        RtcpHeader::new(PT_MPRTCP, 0, PREFIX_WORDS - 1, self.ssrc).encode(&mut self.buf);
        self.buf.put_u32(self.media_ssrc);
    }

    fn open_block(&mut self, subflow_id: u16) {
        self.block_offset = Some(self.buf.len());
        self.buf.put_u8(BLOCK_TYPE_REPORT);
        self.buf.put_u8(0);
        self.buf.put_u16(subflow_id);
        self.block_words = 0;
        self.blocks += 1;
        self.grow_length(1);
    }

    fn grow_length(&mut self, words: u16) {
        let length = u16::from_be_bytes([self.buf[2], self.buf[3]]) + words;
        self.buf[2..4].copy_from_slice(&length.to_be_bytes());
    }

    fn finish(&mut self) -> Bytes {
        self.buf[0] = (self.buf[0] & !0x1F) | (self.blocks as u8 & 0x1F);
        let out = self.buf.split().freeze();
        self.reset();
        out
    }

    fn reset(&mut self) {
        self.buf.clear();
        self.block_offset = None;
        self.block_words = 0;
        self.blocks = 0;
        self.items = 0;
    }
}

impl FeedbackReport {
    /// Encode a whole report, including blocks without items.
    pub fn encode(&self) -> Result<Bytes, EncodeError> {
        if self.blocks.len() > MAX_BLOCKS {
            return Err(EncodeError::TooManyBlocks);
        }
        let mut builder = ReportBuilder::new(self.ssrc, self.media_ssrc);
        builder.start();
        for block in &self.blocks {
            builder.open_block(block.subflow_id);
            for item in &block.items {
                builder.add_item(item.clone())?;
            }
        }
        Ok(builder.finish())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::report::{IntervalMetric, SubflowBlock};

    fn owd(median: u32) -> OneWayDelayBlock {
        OneWayDelayBlock {
            interval_metric: IntervalMetric::Interval,
            ssrc: 1,
            median_delay: median,
            min_delay: median / 2,
            max_delay: median * 2,
        }
    }

    #[test]
    fn end_without_items_is_none() {
        let mut builder = ReportBuilder::new(1, 2);
        builder.begin(3);
        assert!(builder.is_open());
        assert!(builder.end().is_none());
        assert!(!builder.is_open());
    }

    #[test]
    fn add_without_begin_fails() {
        let mut builder = ReportBuilder::new(1, 2);
        assert_eq!(builder.add_owd(owd(10)), Err(EncodeError::NoOpenBlock));
        assert_eq!(builder.next_block(1), Err(EncodeError::NoOpenBlock));
    }

    #[test]
    fn lengths_grow_with_each_item() {
        let mut builder = ReportBuilder::new(1, 2);
        builder.begin(3);
        builder.add_rr(ReceiverReportBlock::default()).unwrap();
        builder.add_owd(owd(100)).unwrap();
        let bytes = builder.end().unwrap();

        // prefix 3 + info 1 + RR 8 + XR(OWD) 7 = 19 words
        assert_eq!(bytes.len(), 19 * 4);
        assert_eq!(u16::from_be_bytes([bytes[2], bytes[3]]), 18);
        assert_eq!(bytes[0] & 0x1F, 1);
        // block length byte counts embedded words only
        assert_eq!(bytes[13], 15);
        assert_eq!(u16::from_be_bytes([bytes[14], bytes[15]]), 3);
    }

    #[test]
    fn builder_is_reusable() {
        let mut builder = ReportBuilder::new(1, 2);
        builder.begin(1);
        builder.add_owd(owd(5)).unwrap();
        let first = builder.end().unwrap();
        builder.begin(1);
        builder.add_owd(owd(5)).unwrap();
        let second = builder.end().unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn multiple_blocks() {
        let mut builder = ReportBuilder::new(9, 8);
        builder.begin(1);
        builder.add_owd(owd(10)).unwrap();
        builder.next_block(2).unwrap();
        builder.add_owd(owd(20)).unwrap();
        let bytes = builder.end().unwrap();

        let report = FeedbackReport::decode(&bytes).unwrap();
        assert_eq!(report.blocks.len(), 2);
        assert_eq!(report.block(2).unwrap().one_way_delay().unwrap().median_delay, 20);
        assert_eq!(bytes[0] & 0x1F, 2);
    }

    #[test]
    fn block_word_limit() {
        let mut builder = ReportBuilder::new(1, 2);
        builder.begin(1);
        // 7 words each: 36 fit in 255, the 37th does not.
        for _ in 0..36 {
            builder.add_owd(owd(1)).unwrap();
        }
        assert_eq!(
            builder.add_owd(owd(1)),
            Err(EncodeError::BlockTooLong { words: 259 })
        );
        // The failed add left the report intact.
        let report = FeedbackReport::decode(&builder.end().unwrap()).unwrap();
        assert_eq!(report.blocks[0].items.len(), 36);
    }

    #[test]
    fn encode_keeps_empty_blocks() {
        let report = FeedbackReport {
            ssrc: 5,
            media_ssrc: 6,
            blocks: vec![
                SubflowBlock::new(1),
                SubflowBlock {
                    subflow_id: 2,
                    items: vec![ReportItem::OneWayDelay(owd(3))],
                },
            ],
        };
        let bytes = report.encode().unwrap();
        assert_eq!(FeedbackReport::decode(&bytes).unwrap(), report);
    }
}
