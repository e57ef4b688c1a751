//! # MPRTCP Feedback Report
//!
//! One report per UDP payload. An RTCP header with payload type 212 is
//! followed by the media SSRC and a chain of per-subflow blocks. Each block
//! wraps ordinary RTCP packets (RR, XR) that describe that subflow.
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |V=2|P|   RC    |    PT=212     |       Length (words - 1)      |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                       SSRC of reporter                        |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                          Media SSRC                           |
//! +=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+
//! |   Type = 0    | Block length  |          Subflow ID           |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |        Embedded RTCP packets (RR / XR), Block length words    |
//! +=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+
//! |                       ... next block ...                      |
//! ```
//!
//! RC counts the subflow blocks. The block length byte counts the words of
//! embedded packets that follow the block's info word.
//!
//! ## XR blocks
//!
//! | Type | Block | RFC |
//! |------|-------|-----|
//! | 1 | Loss run-length (bit set = received) | 3611 |
//! | 25 | Discard run-length (bit set = discarded) | 7097 |
//! | 26 | Discarded bytes | 7243 |
//! | 28 | One-way delay (median/min/max) | none |

use bytes::{Buf, BufMut, BytesMut};

use crate::error::DecodeError;
use crate::seq;
use crate::time;

// ─── Constants ───────────────────────────────────────────────────────────────

/// RTCP version carried in every header.
pub const RTCP_VERSION: u8 = 2;

/// Payload type of the MPRTCP report.
pub const PT_MPRTCP: u8 = 212;
/// Payload type of an embedded receiver report.
pub const PT_RR: u8 = 201;
/// Payload type of an embedded extended report.
pub const PT_XR: u8 = 207;

/// Subflow block type for reports (other values are skipped).
pub const BLOCK_TYPE_REPORT: u8 = 0;

pub const XR_LOSS_RLE: u8 = 1;
pub const XR_DISCARDED_RLE: u8 = 25;
pub const XR_DISCARDED_BYTES: u8 = 26;
pub const XR_OWD: u8 = 28;

/// Bytes of an RTCP header including the SSRC.
pub const RTCP_HEADER_LEN: usize = 8;
/// Bytes of the MPRTCP prefix: header + media SSRC.
pub const REPORT_PREFIX_LEN: usize = RTCP_HEADER_LEN + 4;
/// Bytes of a subflow block info word.
pub const SUBFLOW_INFO_LEN: usize = 4;

/// Maximum subflow blocks per report (5-bit RC field).
pub const MAX_BLOCKS: usize = 31;
/// Maximum words of embedded packets per block (8-bit length field).
pub const MAX_BLOCK_WORDS: usize = u8::MAX as usize;

// ─── RTCP Header ─────────────────────────────────────────────────────────────

/// Common RTCP header with the sender SSRC.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RtcpHeader {
    pub version: u8,
    pub padding: bool,
    /// Report count / subtype (5 bits).
    pub count: u8,
    pub packet_type: u8,
    /// Packet length in 32-bit words minus one.
    pub length: u16,
    pub ssrc: u32,
}

impl RtcpHeader {
    pub const ENCODED_LEN: usize = RTCP_HEADER_LEN;

    pub fn new(packet_type: u8, count: u8, length: u16, ssrc: u32) -> Self {
        RtcpHeader {
            version: RTCP_VERSION,
            padding: false,
            count,
            packet_type,
            length,
            ssrc,
        }
    }

    pub fn encode(&self, buf: &mut impl BufMut) {
        buf.put_u8((self.version << 6) | ((self.padding as u8) << 5) | (self.count & 0x1F));
        buf.put_u8(self.packet_type);
        buf.put_u16(self.length);
        buf.put_u32(self.ssrc);
    }

    pub fn decode(buf: &mut impl Buf) -> Option<Self> {
        if buf.remaining() < Self::ENCODED_LEN {
            return None;
        }
        let b0 = buf.get_u8();
        Some(RtcpHeader {
            version: b0 >> 6,
            padding: b0 & 0x20 != 0,
            count: b0 & 0x1F,
            packet_type: buf.get_u8(),
            length: buf.get_u16(),
            ssrc: buf.get_u32(),
        })
    }

    /// Total packet size in bytes as declared by the length field.
    pub fn packet_len(&self) -> usize {
        (self.length as usize + 1) * 4
    }
}

// ─── Receiver Report Block ───────────────────────────────────────────────────

/// RFC 3550 report block describing one subflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ReceiverReportBlock {
    /// Media source this block reports on.
    pub ssrc: u32,
    /// Loss fraction since the previous report, in 1/256.
    pub fraction_lost: u8,
    /// Cumulative packets lost (24 bits).
    pub cumulative_lost: u32,
    /// `cycle << 16 | highest sequence received`.
    pub ext_highest_seq: u32,
    /// Interarrival jitter in RTP timestamp units.
    pub jitter: u32,
    /// Compact NTP time of the last sender report received.
    pub last_sr: u32,
    /// Delay since that sender report, compact NTP units.
    pub delay_since_last_sr: u32,
}

impl ReceiverReportBlock {
    pub const ENCODED_LEN: usize = 24;

    pub fn encode(&self, buf: &mut impl BufMut) {
        buf.put_u32(self.ssrc);
        buf.put_u32(((self.fraction_lost as u32) << 24) | (self.cumulative_lost & 0x00FF_FFFF));
        buf.put_u32(self.ext_highest_seq);
        buf.put_u32(self.jitter);
        buf.put_u32(self.last_sr);
        buf.put_u32(self.delay_since_last_sr);
    }

    pub fn decode(buf: &mut impl Buf) -> Option<Self> {
        if buf.remaining() < Self::ENCODED_LEN {
            return None;
        }
        let ssrc = buf.get_u32();
        let lost = buf.get_u32();
        Some(ReceiverReportBlock {
            ssrc,
            fraction_lost: (lost >> 24) as u8,
            cumulative_lost: lost & 0x00FF_FFFF,
            ext_highest_seq: buf.get_u32(),
            jitter: buf.get_u32(),
            last_sr: buf.get_u32(),
            delay_since_last_sr: buf.get_u32(),
        })
    }

    /// Wrap cycle count of the highest sequence.
    pub fn cycle(&self) -> u16 {
        seq::split(self.ext_highest_seq).0
    }

    /// Highest 16-bit sequence number received.
    pub fn highest_seq(&self) -> u16 {
        seq::split(self.ext_highest_seq).1
    }

    pub fn fraction_lost_f64(&self) -> f64 {
        self.fraction_lost as f64 / 256.0
    }
}

// ─── Interval Metric ─────────────────────────────────────────────────────────

/// Interval metric flag of RFC 6792 style XR blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum IntervalMetric {
    Reserved = 0,
    /// Value sampled at report time.
    Sampled = 1,
    /// Value covers the interval since the previous report.
    Interval = 2,
    /// Value accumulates since the start of the session.
    Cumulative = 3,
}

impl IntervalMetric {
    pub fn from_bits(bits: u8) -> Self {
        match bits & 0x03 {
            1 => IntervalMetric::Sampled,
            2 => IntervalMetric::Interval,
            3 => IntervalMetric::Cumulative,
            _ => IntervalMetric::Reserved,
        }
    }
}

// ─── One-Way Delay ───────────────────────────────────────────────────────────

/// One-way delay statistics over the report interval, 16.16 fixed point
/// seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OneWayDelayBlock {
    pub interval_metric: IntervalMetric,
    pub ssrc: u32,
    pub median_delay: u32,
    pub min_delay: u32,
    pub max_delay: u32,
}

impl OneWayDelayBlock {
    /// Words after the XR block header.
    pub const BODY_WORDS: u16 = 4;

    pub fn encode(&self, buf: &mut impl BufMut) {
        buf.put_u8(XR_OWD);
        buf.put_u8((self.interval_metric as u8) << 6);
        buf.put_u16(Self::BODY_WORDS);
        buf.put_u32(self.ssrc);
        buf.put_u32(self.median_delay);
        buf.put_u32(self.min_delay);
        buf.put_u32(self.max_delay);
    }

    fn decode_body(type_specific: u8, buf: &mut impl Buf) -> Option<Self> {
        if buf.remaining() < Self::BODY_WORDS as usize * 4 {
            return None;
        }
        Some(OneWayDelayBlock {
            interval_metric: IntervalMetric::from_bits(type_specific >> 6),
            ssrc: buf.get_u32(),
            median_delay: buf.get_u32(),
            min_delay: buf.get_u32(),
            max_delay: buf.get_u32(),
        })
    }

    pub fn median(&self) -> std::time::Duration {
        time::delay_from_wire(self.median_delay)
    }

    pub fn min(&self) -> std::time::Duration {
        time::delay_from_wire(self.min_delay)
    }

    pub fn max(&self) -> std::time::Duration {
        time::delay_from_wire(self.max_delay)
    }
}

// ─── Discarded Bytes (RFC 7243) ──────────────────────────────────────────────

/// Bytes the receiver discarded because they arrived too late (or, with the
/// early bit, too early) to be played out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiscardedBytesBlock {
    pub interval_metric: IntervalMetric,
    pub early: bool,
    pub ssrc: u32,
    pub discarded_bytes: u32,
}

impl DiscardedBytesBlock {
    pub const BODY_WORDS: u16 = 2;

    pub fn encode(&self, buf: &mut impl BufMut) {
        buf.put_u8(XR_DISCARDED_BYTES);
        buf.put_u8(((self.interval_metric as u8) << 6) | ((self.early as u8) << 5));
        buf.put_u16(Self::BODY_WORDS);
        buf.put_u32(self.ssrc);
        buf.put_u32(self.discarded_bytes);
    }

    fn decode_body(type_specific: u8, buf: &mut impl Buf) -> Option<Self> {
        if buf.remaining() < Self::BODY_WORDS as usize * 4 {
            return None;
        }
        Some(DiscardedBytesBlock {
            interval_metric: IntervalMetric::from_bits(type_specific >> 6),
            early: type_specific & 0x20 != 0,
            ssrc: buf.get_u32(),
            discarded_bytes: buf.get_u32(),
        })
    }
}

// ─── Run-Length Chunks (RFC 3611 §4.1.1) ────────────────────────────────────

/// Bits carried by one bit-vector chunk.
pub const CHUNK_VECTOR_BITS: usize = 15;
/// Longest run one run-length chunk can describe.
pub const CHUNK_MAX_RUN: u16 = 0x3FFF;

/// One 16-bit chunk of a run-length block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RleChunk {
    /// `length` consecutive sequence numbers all set to `run_type`.
    Run { run_type: bool, length: u16 },
    /// Up to 15 flags, first sequence number in the most significant bit.
    Vector(u16),
}

impl RleChunk {
    pub fn to_u16(self) -> u16 {
        match self {
            RleChunk::Run { run_type, length } => {
                ((run_type as u16) << 14) | (length & CHUNK_MAX_RUN)
            }
            RleChunk::Vector(bits) => 0x8000 | (bits & 0x7FFF),
        }
    }

    /// Decode a chunk; the all-zero null chunk yields `None`.
    pub fn from_u16(raw: u16) -> Option<Self> {
        if raw == 0 {
            None
        } else if raw & 0x8000 != 0 {
            Some(RleChunk::Vector(raw & 0x7FFF))
        } else {
            Some(RleChunk::Run {
                run_type: raw & 0x4000 != 0,
                length: raw & CHUNK_MAX_RUN,
            })
        }
    }
}

/// Per-sequence-number flag map over `[begin_seq, end_seq)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunLengthBlock {
    /// Early-discard flag; only meaningful for discard maps.
    pub early: bool,
    /// Thinning exponent: every `2^thinning`-th sequence is reported.
    pub thinning: u8,
    pub ssrc: u32,
    pub begin_seq: u16,
    /// One past the last sequence number covered.
    pub end_seq: u16,
    pub chunks: Vec<RleChunk>,
}

impl RunLengthBlock {
    /// Chunks that still fit in the 16-bit block length (and a u8 subflow
    /// block, which is the tighter bound in practice).
    pub const MAX_CHUNKS: usize = 2 * (MAX_BLOCK_WORDS - 5);

    /// Compress a flag map starting at `begin_seq`. Runs of at least one
    /// vector's worth of equal flags become run chunks.
    pub fn from_flags(ssrc: u32, begin_seq: u16, flags: &[bool]) -> Self {
        let mut chunks = Vec::new();
        let mut i = 0;
        while i < flags.len() {
            let value = flags[i];
            let run = flags[i..].iter().take_while(|&&f| f == value).count();
            if run >= CHUNK_VECTOR_BITS {
                let length = run.min(CHUNK_MAX_RUN as usize);
                chunks.push(RleChunk::Run {
                    run_type: value,
                    length: length as u16,
                });
                i += length;
            } else {
                let mut bits = 0u16;
                for (pos, &flag) in flags[i..].iter().take(CHUNK_VECTOR_BITS).enumerate() {
                    if flag {
                        bits |= 1 << (CHUNK_VECTOR_BITS - 1 - pos);
                    }
                }
                chunks.push(RleChunk::Vector(bits));
                i += CHUNK_VECTOR_BITS;
            }
        }

        RunLengthBlock {
            early: false,
            thinning: 0,
            ssrc,
            begin_seq,
            end_seq: begin_seq.wrapping_add(flags.len() as u16),
            chunks,
        }
    }

    /// Number of sequence numbers the block covers.
    pub fn span(&self) -> usize {
        self.end_seq.wrapping_sub(self.begin_seq) as usize
    }

    /// Expand the chunks back into one flag per covered sequence number.
    pub fn flags(&self) -> Vec<bool> {
        let span = self.span();
        let mut out = Vec::with_capacity(span);
        for chunk in &self.chunks {
            match *chunk {
                RleChunk::Run { run_type, length } => {
                    out.extend(std::iter::repeat(run_type).take(length as usize));
                }
                RleChunk::Vector(bits) => {
                    out.extend(
                        (0..CHUNK_VECTOR_BITS)
                            .map(|pos| bits & (1 << (CHUNK_VECTOR_BITS - 1 - pos)) != 0),
                    );
                }
            }
            if out.len() >= span {
                break;
            }
        }
        out.truncate(span);
        out
    }

    /// Number of covered sequence numbers whose flag is set.
    pub fn count_set(&self) -> usize {
        self.flags().iter().filter(|&&f| f).count()
    }

    /// XR block length field: SSRC word, sequence word, chunk words.
    pub fn body_words(&self) -> u16 {
        (2 + self.chunks.len().div_ceil(2)) as u16
    }

    pub fn encode(&self, block_type: u8, buf: &mut impl BufMut) {
        let type_specific = if block_type == XR_DISCARDED_RLE {
            ((self.early as u8) << 4) | (self.thinning & 0x0F)
        } else {
            self.thinning & 0x0F
        };
        buf.put_u8(block_type);
        buf.put_u8(type_specific);
        buf.put_u16(self.body_words());
        buf.put_u32(self.ssrc);
        buf.put_u16(self.begin_seq);
        buf.put_u16(self.end_seq);
        for chunk in &self.chunks {
            buf.put_u16(chunk.to_u16());
        }
        if self.chunks.len() % 2 == 1 {
            buf.put_u16(0);
        }
    }

    fn decode_body(
        block_type: u8,
        type_specific: u8,
        body_words: u16,
        buf: &mut impl Buf,
    ) -> Option<Self> {
        if body_words < 2 || buf.remaining() < body_words as usize * 4 {
            return None;
        }
        let ssrc = buf.get_u32();
        let begin_seq = buf.get_u16();
        let end_seq = buf.get_u16();
        let raw_chunks = (body_words as usize - 2) * 2;
        let chunks = (0..raw_chunks)
            .filter_map(|_| RleChunk::from_u16(buf.get_u16()))
            .collect();
        Some(RunLengthBlock {
            early: block_type == XR_DISCARDED_RLE && type_specific & 0x10 != 0,
            thinning: type_specific & 0x0F,
            ssrc,
            begin_seq,
            end_seq,
            chunks,
        })
    }
}

// ─── Report Items ────────────────────────────────────────────────────────────

/// One embedded item of a subflow block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReportItem {
    ReceiverReport(ReceiverReportBlock),
    OneWayDelay(OneWayDelayBlock),
    DiscardedBytes(DiscardedBytesBlock),
    DiscardedRle(RunLengthBlock),
    LostRle(RunLengthBlock),
}

impl ReportItem {
    /// Words of the embedded RTCP packet this item is written as.
    pub fn encoded_words(&self) -> usize {
        let xr_block_words = match self {
            ReportItem::ReceiverReport(_) => {
                return (RTCP_HEADER_LEN + ReceiverReportBlock::ENCODED_LEN) / 4;
            }
            ReportItem::OneWayDelay(_) => 1 + OneWayDelayBlock::BODY_WORDS as usize,
            ReportItem::DiscardedBytes(_) => 1 + DiscardedBytesBlock::BODY_WORDS as usize,
            ReportItem::DiscardedRle(b) | ReportItem::LostRle(b) => 1 + b.body_words() as usize,
        };
        RTCP_HEADER_LEN / 4 + xr_block_words
    }

    /// Write the item as a standalone RR or XR packet from `reporter_ssrc`.
    pub fn encode(&self, reporter_ssrc: u32, buf: &mut BytesMut) {
        let length = (self.encoded_words() - 1) as u16;
        match self {
            ReportItem::ReceiverReport(rr) => {
                RtcpHeader::new(PT_RR, 1, length, reporter_ssrc).encode(buf);
                rr.encode(buf);
            }
            ReportItem::OneWayDelay(owd) => {
                RtcpHeader::new(PT_XR, 0, length, reporter_ssrc).encode(buf);
                owd.encode(buf);
            }
            ReportItem::DiscardedBytes(db) => {
                RtcpHeader::new(PT_XR, 0, length, reporter_ssrc).encode(buf);
                db.encode(buf);
            }
            ReportItem::DiscardedRle(rle) => {
                RtcpHeader::new(PT_XR, 0, length, reporter_ssrc).encode(buf);
                rle.encode(XR_DISCARDED_RLE, buf);
            }
            ReportItem::LostRle(rle) => {
                RtcpHeader::new(PT_XR, 0, length, reporter_ssrc).encode(buf);
                rle.encode(XR_LOSS_RLE, buf);
            }
        }
    }
}

// ─── Subflow Block ───────────────────────────────────────────────────────────

/// Everything a report says about one subflow.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SubflowBlock {
    pub subflow_id: u16,
    pub items: Vec<ReportItem>,
}

impl SubflowBlock {
    pub fn new(subflow_id: u16) -> Self {
        SubflowBlock {
            subflow_id,
            items: Vec::new(),
        }
    }

    pub fn receiver_report(&self) -> Option<&ReceiverReportBlock> {
        self.items.iter().find_map(|item| match item {
            ReportItem::ReceiverReport(rr) => Some(rr),
            _ => None,
        })
    }

    pub fn one_way_delay(&self) -> Option<&OneWayDelayBlock> {
        self.items.iter().find_map(|item| match item {
            ReportItem::OneWayDelay(owd) => Some(owd),
            _ => None,
        })
    }

    pub fn discarded_bytes(&self) -> Option<&DiscardedBytesBlock> {
        self.items.iter().find_map(|item| match item {
            ReportItem::DiscardedBytes(db) => Some(db),
            _ => None,
        })
    }

    pub fn discarded_rle(&self) -> Option<&RunLengthBlock> {
        self.items.iter().find_map(|item| match item {
            ReportItem::DiscardedRle(rle) => Some(rle),
            _ => None,
        })
    }

    pub fn lost_rle(&self) -> Option<&RunLengthBlock> {
        self.items.iter().find_map(|item| match item {
            ReportItem::LostRle(rle) => Some(rle),
            _ => None,
        })
    }

    /// Words of embedded packets, the value of the block length byte.
    pub fn encoded_words(&self) -> usize {
        self.items.iter().map(ReportItem::encoded_words).sum()
    }

    fn decode_embedded(&mut self, mut data: &[u8]) -> Result<(), DecodeError> {
        while data.has_remaining() {
            let available = data.remaining();
            let header = RtcpHeader::decode(&mut data).ok_or_else(|| {
                DecodeError::malformed("embedded RTCP header", RTCP_HEADER_LEN, available)
            })?;
            if header.packet_len() < RTCP_HEADER_LEN {
                return Err(DecodeError::malformed(
                    "embedded RTCP length",
                    RTCP_HEADER_LEN,
                    header.packet_len(),
                ));
            }
            let body_len = header.packet_len() - RTCP_HEADER_LEN;
            if body_len > data.remaining() {
                return Err(DecodeError::malformed(
                    "embedded RTCP packet",
                    header.packet_len(),
                    available,
                ));
            }
            let mut body = &data[..body_len];
            data.advance(body_len);

            match header.packet_type {
                PT_RR => {
                    let needed = header.count as usize * ReceiverReportBlock::ENCODED_LEN;
                    if needed > body.remaining() {
                        return Err(DecodeError::malformed(
                            "receiver report blocks",
                            needed,
                            body.remaining(),
                        ));
                    }
                    for _ in 0..header.count {
                        if let Some(rr) = ReceiverReportBlock::decode(&mut body) {
                            self.items.push(ReportItem::ReceiverReport(rr));
                        }
                    }
                }
                PT_XR => self.decode_xr(body)?,
                // SR, SDES and friends carry nothing the controller uses.
                _ => {}
            }
        }
        Ok(())
    }

    fn decode_xr(&mut self, mut data: &[u8]) -> Result<(), DecodeError> {
        while data.has_remaining() {
            if data.remaining() < 4 {
                return Err(DecodeError::malformed("XR block header", 4, data.remaining()));
            }
            let block_type = data.get_u8();
            let type_specific = data.get_u8();
            let body_words = data.get_u16();
            let body_len = body_words as usize * 4;
            if body_len > data.remaining() {
                return Err(DecodeError::malformed("XR block", body_len, data.remaining()));
            }
            let mut body = &data[..body_len];
            data.advance(body_len);

            let item = match block_type {
                XR_OWD => OneWayDelayBlock::decode_body(type_specific, &mut body)
                    .map(ReportItem::OneWayDelay)
                    .ok_or_else(|| DecodeError::malformed("one-way delay block", 16, body_len))?,
                XR_DISCARDED_BYTES => DiscardedBytesBlock::decode_body(type_specific, &mut body)
                    .map(ReportItem::DiscardedBytes)
                    .ok_or_else(|| DecodeError::malformed("discarded bytes block", 8, body_len))?,
                XR_DISCARDED_RLE | XR_LOSS_RLE => {
                    let rle = RunLengthBlock::decode_body(
                        block_type,
                        type_specific,
                        body_words,
                        &mut body,
                    )
                    .ok_or_else(|| DecodeError::malformed("run-length block", 8, body_len))?;
                    if block_type == XR_LOSS_RLE {
                        ReportItem::LostRle(rle)
                    } else {
                        ReportItem::DiscardedRle(rle)
                    }
                }
                _ => continue,
            };
            self.items.push(item);
        }
        Ok(())
    }
}

// ─── Feedback Report ─────────────────────────────────────────────────────────

/// A decoded MPRTCP report.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FeedbackReport {
    /// SSRC of the reporting receiver.
    pub ssrc: u32,
    /// SSRC of the media stream being reported on.
    pub media_ssrc: u32,
    pub blocks: Vec<SubflowBlock>,
}

impl FeedbackReport {
    /// Decode one report. Unknown block, packet and XR types are skipped; any
    /// length that reaches past its container is [`DecodeError::Malformed`].
    pub fn decode(data: &[u8]) -> Result<Self, DecodeError> {
        let mut buf = data;
        if buf.remaining() < REPORT_PREFIX_LEN {
            return Err(DecodeError::malformed("report header", REPORT_PREFIX_LEN, buf.remaining()));
        }
        let header = RtcpHeader::decode(&mut buf)
            .ok_or_else(|| DecodeError::malformed("report header", REPORT_PREFIX_LEN, data.len()))?;
        if header.version != RTCP_VERSION {
            return Err(DecodeError::UnsupportedVersion(header.version));
        }
        if header.packet_type != PT_MPRTCP {
            return Err(DecodeError::UnexpectedPacketType(header.packet_type));
        }
        if header.packet_len() > data.len() || header.packet_len() < REPORT_PREFIX_LEN {
            return Err(DecodeError::malformed("report", header.packet_len(), data.len()));
        }

        // Trailing bytes past the declared length belong to a compound
        // packet we do not parse.
        let mut body = &data[RTCP_HEADER_LEN..header.packet_len()];
        let media_ssrc = body.get_u32();

        let mut report = FeedbackReport {
            ssrc: header.ssrc,
            media_ssrc,
            blocks: Vec::with_capacity(header.count as usize),
        };

        while body.has_remaining() {
            if body.remaining() < SUBFLOW_INFO_LEN {
                return Err(DecodeError::malformed(
                    "subflow info",
                    SUBFLOW_INFO_LEN,
                    body.remaining(),
                ));
            }
            let block_type = body.get_u8();
            let block_words = body.get_u8() as usize;
            let subflow_id = body.get_u16();
            let block_len = block_words * 4;
            if block_len > body.remaining() {
                return Err(DecodeError::malformed("subflow block", block_len, body.remaining()));
            }
            let block_data = &body[..block_len];
            body.advance(block_len);

            if block_type != BLOCK_TYPE_REPORT {
                continue;
            }
            let mut block = SubflowBlock::new(subflow_id);
            block.decode_embedded(block_data)?;
            report.blocks.push(block);
        }

        Ok(report)
    }

    /// The block for `subflow_id`, if the report carries one.
    pub fn block(&self, subflow_id: u16) -> Option<&SubflowBlock> {
        self.blocks.iter().find(|b| b.subflow_id == subflow_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::ReportBuilder;

    fn rr() -> ReceiverReportBlock {
        ReceiverReportBlock {
            ssrc: 0xCAFE_BABE,
            fraction_lost: 25,
            cumulative_lost: 0x12_3456,
            ext_highest_seq: seq::extend(2, 40_000),
            jitter: 77,
            last_sr: 0x0001_8000,
            delay_since_last_sr: 0x0000_4000,
        }
    }

    fn owd() -> OneWayDelayBlock {
        OneWayDelayBlock {
            interval_metric: IntervalMetric::Interval,
            ssrc: 0xCAFE_BABE,
            median_delay: time::delay_to_wire(std::time::Duration::from_millis(40)),
            min_delay: time::delay_to_wire(std::time::Duration::from_millis(30)),
            max_delay: time::delay_to_wire(std::time::Duration::from_millis(90)),
        }
    }

    #[test]
    fn rtcp_header_roundtrip() {
        let header = RtcpHeader::new(PT_MPRTCP, 3, 17, 0xDEAD_BEEF);
        let mut buf = BytesMut::new();
        header.encode(&mut buf);
        assert_eq!(buf.len(), RtcpHeader::ENCODED_LEN);
        assert_eq!(buf[0], 0x83);
        assert_eq!(buf[1], 212);
        let decoded = RtcpHeader::decode(&mut buf.freeze()).unwrap();
        assert_eq!(decoded, header);
        assert_eq!(decoded.packet_len(), 72);
    }

    #[test]
    fn receiver_report_wire_layout() {
        let mut buf = BytesMut::new();
        rr().encode(&mut buf);
        assert_eq!(buf.len(), ReceiverReportBlock::ENCODED_LEN);
        // fraction_lost in the top byte, cumulative_lost in the low 24 bits
        assert_eq!(&buf[4..8], &[25, 0x12, 0x34, 0x56]);
        let decoded = ReceiverReportBlock::decode(&mut buf.freeze()).unwrap();
        assert_eq!(decoded, rr());
        assert_eq!(decoded.cycle(), 2);
        assert_eq!(decoded.highest_seq(), 40_000);
    }

    #[test]
    fn owd_block_wire_layout() {
        let mut buf = BytesMut::new();
        owd().encode(&mut buf);
        assert_eq!(buf.len(), 20);
        assert_eq!(buf[0], XR_OWD);
        assert_eq!(buf[1], 0x80);
        assert_eq!(&buf[2..4], &[0, 4]);
    }

    #[test]
    fn discarded_bytes_flags() {
        let block = DiscardedBytesBlock {
            interval_metric: IntervalMetric::Cumulative,
            early: true,
            ssrc: 1,
            discarded_bytes: 1500,
        };
        let mut buf = BytesMut::new();
        block.encode(&mut buf);
        assert_eq!(buf.len(), 12);
        assert_eq!(buf[1], 0xE0);
        assert_eq!(&buf[2..4], &[0, 2]);
    }

    #[test]
    fn rle_chunk_encoding() {
        assert_eq!(RleChunk::Run { run_type: true, length: 100 }.to_u16(), 0x4064);
        assert_eq!(RleChunk::Vector(0x7FFF).to_u16(), 0xFFFF);
        assert_eq!(RleChunk::from_u16(0), None);
        assert_eq!(
            RleChunk::from_u16(0x0010),
            Some(RleChunk::Run { run_type: false, length: 16 })
        );
    }

    #[test]
    fn rle_from_flags_uses_runs_and_vectors() {
        let mut flags = vec![true; 40];
        flags.extend([false, true, false]);
        let block = RunLengthBlock::from_flags(9, 65530, &flags);
        assert_eq!(block.chunks[0], RleChunk::Run { run_type: true, length: 40 });
        assert_eq!(block.chunks[1], RleChunk::Vector(0b010 << 12));
        assert_eq!(block.end_seq, 65530u16.wrapping_add(43));
        assert_eq!(block.span(), 43);
        assert_eq!(block.flags(), flags);
        assert_eq!(block.count_set(), 41);
    }

    #[test]
    fn decode_full_report() {
        let mut builder = ReportBuilder::new(0x1111, 0x2222);
        builder.begin(7);
        builder.add_rr(rr()).unwrap();
        builder.add_owd(owd()).unwrap();
        let bytes = builder.end().unwrap();

        let report = FeedbackReport::decode(&bytes).unwrap();
        assert_eq!(report.ssrc, 0x1111);
        assert_eq!(report.media_ssrc, 0x2222);
        assert_eq!(report.blocks.len(), 1);
        let block = report.block(7).unwrap();
        assert_eq!(block.receiver_report(), Some(&rr()));
        assert_eq!(block.one_way_delay(), Some(&owd()));
        assert!(block.discarded_bytes().is_none());
        assert_eq!(block.one_way_delay().unwrap().median(), std::time::Duration::from_millis(40));
    }

    #[test]
    fn truncated_report_is_malformed() {
        let mut builder = ReportBuilder::new(1, 2);
        builder.begin(1);
        builder.add_rr(rr()).unwrap();
        let bytes = builder.end().unwrap();
        let err = FeedbackReport::decode(&bytes[..bytes.len() - 4]).unwrap_err();
        assert!(matches!(err, DecodeError::Malformed { .. }));
    }

    #[test]
    fn short_buffer_is_malformed() {
        assert!(matches!(
            FeedbackReport::decode(&[0x80, 212]),
            Err(DecodeError::Malformed { .. })
        ));
    }

    #[test]
    fn inner_length_past_block_is_malformed() {
        let mut builder = ReportBuilder::new(1, 2);
        builder.begin(1);
        builder.add_rr(rr()).unwrap();
        let mut bytes = BytesMut::from(&builder.end().unwrap()[..]);
        // Embedded RR header length lives at offset 16 + 2.
        bytes[18] = 0;
        bytes[19] = 40;
        assert!(matches!(
            FeedbackReport::decode(&bytes),
            Err(DecodeError::Malformed { .. })
        ));
    }

    #[test]
    fn wrong_version_and_type() {
        let mut buf = BytesMut::new();
        RtcpHeader::new(PT_MPRTCP, 0, 2, 1).encode(&mut buf);
        buf.put_u32(2);
        let mut wrong_version = buf.clone();
        wrong_version[0] = 0x40;
        assert_eq!(
            FeedbackReport::decode(&wrong_version),
            Err(DecodeError::UnsupportedVersion(1))
        );
        let mut wrong_type = buf.clone();
        wrong_type[1] = PT_RR;
        assert_eq!(
            FeedbackReport::decode(&wrong_type),
            Err(DecodeError::UnexpectedPacketType(PT_RR))
        );
        // Header alone with no blocks is a valid, empty report.
        assert_eq!(FeedbackReport::decode(&buf).unwrap().blocks.len(), 0);
    }

    #[test]
    fn unknown_block_and_xr_types_are_skipped() {
        let mut buf = BytesMut::new();
        let mut block = BytesMut::new();
        // XR packet carrying an unknown block type 99 then an OWD block.
        RtcpHeader::new(PT_XR, 0, 1 + 2 + 5, 5).encode(&mut block);
        block.put_u8(99);
        block.put_u8(0);
        block.put_u16(1);
        block.put_u32(0xFFFF_FFFF);
        owd().encode(&mut block);
        let block_words = block.len() / 4;

        let total_words = 3 + 2 + 1 + block_words;
        RtcpHeader::new(PT_MPRTCP, 2, (total_words - 1) as u16, 5).encode(&mut buf);
        buf.put_u32(6);
        // Unknown subflow block type 9 with one word of payload.
        buf.put_u8(9);
        buf.put_u8(1);
        buf.put_u16(3);
        buf.put_u32(0);
        // Report block.
        buf.put_u8(BLOCK_TYPE_REPORT);
        buf.put_u8(block_words as u8);
        buf.put_u16(4);
        buf.extend_from_slice(&block);

        let report = FeedbackReport::decode(&buf).unwrap();
        assert_eq!(report.blocks.len(), 1);
        assert_eq!(report.blocks[0].subflow_id, 4);
        assert_eq!(report.blocks[0].items, vec![ReportItem::OneWayDelay(owd())]);
    }
}
