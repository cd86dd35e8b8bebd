//! # RTCP Compound Parser
//!
//! Parses the report sections the receiver acts on: SR (200), RR (201),
//! BYE (203), generic NACK (205/1), PLI (206/1) and FIR (206/4).
//!
//! ## Common header
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |V=2|P| RC/FMT  |      PT       |          length (words-1)     |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```
//!
//! Sections are handled independently: an unknown type or a malformed body
//! is skipped and parsing continues with the next section. A length field
//! running past the end of the datagram ends parsing, since nothing after it
//! can be located.

use bytes::{Buf, BufMut, BytesMut};

use crate::clock::ntp_to_ms;

pub const RTCP_SR: u8 = 200;
pub const RTCP_RR: u8 = 201;
pub const RTCP_SDES: u8 = 202;
pub const RTCP_BYE: u8 = 203;
pub const RTCP_RTPFB: u8 = 205;
pub const RTCP_PSFB: u8 = 206;

const FMT_GENERIC_NACK: u8 = 1;
const FMT_PLI: u8 = 1;
const FMT_FIR: u8 = 4;

const HEADER_LEN: usize = 4;
const REPORT_BLOCK_LEN: usize = 24;
const SENDER_INFO_LEN: usize = 20;

// ─── Packet Types ───────────────────────────────────────────────────────────

/// One reception report block (RFC 3550 §6.4.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReportBlock {
    /// Source this block reports on.
    pub ssrc: u32,
    pub fraction_lost: u8,
    /// Signed 24-bit cumulative loss.
    pub cumulative_lost: i32,
    pub extended_highest_seq: u32,
    pub jitter: u32,
    /// Compact NTP of the last SR received from `ssrc`, 0 if none.
    pub last_sr: u32,
    /// Compact NTP delay since that SR.
    pub delay_since_last_sr: u32,
}

impl ReportBlock {
    fn decode(buf: &mut impl Buf) -> Self {
        let ssrc = buf.get_u32();
        let word = buf.get_u32();
        let fraction_lost = (word >> 24) as u8;
        let cumulative_lost = ((word << 8) as i32) >> 8;
        ReportBlock {
            ssrc,
            fraction_lost,
            cumulative_lost,
            extended_highest_seq: buf.get_u32(),
            jitter: buf.get_u32(),
            last_sr: buf.get_u32(),
            delay_since_last_sr: buf.get_u32(),
        }
    }

    pub fn encode(&self, buf: &mut impl BufMut) {
        buf.put_u32(self.ssrc);
        buf.put_u32(((self.fraction_lost as u32) << 24) | (self.cumulative_lost as u32 & 0x00FF_FFFF));
        buf.put_u32(self.extended_highest_seq);
        buf.put_u32(self.jitter);
        buf.put_u32(self.last_sr);
        buf.put_u32(self.delay_since_last_sr);
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SenderReport {
    pub sender_ssrc: u32,
    pub ntp_seconds: u32,
    pub ntp_fraction: u32,
    pub rtp_timestamp: u32,
    pub packet_count: u32,
    pub octet_count: u32,
    pub reports: Vec<ReportBlock>,
}

impl SenderReport {
    pub fn ntp_ms(&self) -> i64 {
        ntp_to_ms(self.ntp_seconds, self.ntp_fraction)
    }

    /// Middle 32 bits of the NTP timestamp, echoed back as LSR.
    pub fn compact_ntp(&self) -> u32 {
        (self.ntp_seconds << 16) | (self.ntp_fraction >> 16)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceiverReport {
    pub sender_ssrc: u32,
    pub reports: Vec<ReportBlock>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Goodbye {
    pub sources: Vec<u32>,
}

/// Generic NACK with the PID/BLP pairs expanded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Nack {
    pub sender_ssrc: u32,
    pub media_ssrc: u32,
    pub lost: Vec<u16>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pli {
    pub sender_ssrc: u32,
    pub media_ssrc: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FirEntry {
    pub ssrc: u32,
    pub sequence_number: u8,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fir {
    pub sender_ssrc: u32,
    pub entries: Vec<FirEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RtcpPacket {
    SenderReport(SenderReport),
    ReceiverReport(ReceiverReport),
    Goodbye(Goodbye),
    Nack(Nack),
    Pli(Pli),
    Fir(Fir),
}

/// Result of parsing one compound datagram.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Compound {
    pub packets: Vec<RtcpPacket>,
    /// Sections not turned into a packet: unknown, unhandled or malformed.
    pub skipped: usize,
}

// ─── Parsing ────────────────────────────────────────────────────────────────

/// Parse a compound RTCP datagram. `None` when not even the first section
/// header is valid.
pub fn parse_compound(data: &[u8]) -> Option<Compound> {
    let mut out = Compound::default();
    let mut rest = data;
    let mut first = true;

    while !rest.is_empty() {
        let Some((header, body, len)) = split_section(rest) else {
            if first {
                return None;
            }
            out.skipped += 1;
            break;
        };
        first = false;
        rest = &rest[len..];

        match body.and_then(|body| decode_section(header, body)) {
            Some(packet) => out.packets.push(packet),
            None => out.skipped += 1,
        }
    }

    if first {
        return None;
    }
    Some(out)
}

#[derive(Debug, Clone, Copy)]
struct SectionHeader {
    count: u8,
    packet_type: u8,
}

/// Locate one section. The body is `None` when the padding is invalid; the
/// section length is still usable to move on.
fn split_section(data: &[u8]) -> Option<(SectionHeader, Option<&[u8]>, usize)> {
    let mut buf = data;
    if buf.remaining() < HEADER_LEN {
        return None;
    }
    let b0 = buf.get_u8();
    if b0 >> 6 != 2 {
        return None;
    }
    let header = SectionHeader {
        count: b0 & 0x1F,
        packet_type: buf.get_u8(),
    };
    let len = (buf.get_u16() as usize + 1) * 4;
    if len > data.len() {
        return None;
    }

    let mut body = &data[HEADER_LEN..len];
    if b0 & 0x20 != 0 {
        let padding = body.last().copied().unwrap_or(0) as usize;
        if padding == 0 || padding > body.len() {
            return Some((header, None, len));
        }
        body = &body[..body.len() - padding];
    }
    Some((header, Some(body), len))
}

fn decode_section(header: SectionHeader, mut body: &[u8]) -> Option<RtcpPacket> {
    match (header.packet_type, header.count) {
        (RTCP_SR, count) => {
            let count = count as usize;
            if body.remaining() < 4 + SENDER_INFO_LEN + count * REPORT_BLOCK_LEN {
                return None;
            }
            Some(RtcpPacket::SenderReport(SenderReport {
                sender_ssrc: body.get_u32(),
                ntp_seconds: body.get_u32(),
                ntp_fraction: body.get_u32(),
                rtp_timestamp: body.get_u32(),
                packet_count: body.get_u32(),
                octet_count: body.get_u32(),
                reports: (0..count).map(|_| ReportBlock::decode(&mut body)).collect(),
            }))
        }
        (RTCP_RR, count) => {
            let count = count as usize;
            if body.remaining() < 4 + count * REPORT_BLOCK_LEN {
                return None;
            }
            let sender_ssrc = body.get_u32();
            Some(RtcpPacket::ReceiverReport(ReceiverReport {
                sender_ssrc,
                reports: (0..count).map(|_| ReportBlock::decode(&mut body)).collect(),
            }))
        }
        (RTCP_BYE, count) => {
            let count = count as usize;
            if body.remaining() < count * 4 {
                return None;
            }
            Some(RtcpPacket::Goodbye(Goodbye {
                sources: (0..count).map(|_| body.get_u32()).collect(),
            }))
        }
        (RTCP_RTPFB, FMT_GENERIC_NACK) => {
            if body.remaining() < 8 || (body.remaining() - 8) % 4 != 0 {
                return None;
            }
            let sender_ssrc = body.get_u32();
            let media_ssrc = body.get_u32();
            let mut lost = Vec::new();
            while body.has_remaining() {
                let pid = body.get_u16();
                let blp = body.get_u16();
                lost.push(pid);
                for bit in 0..16u16 {
                    if blp & (1 << bit) != 0 {
                        lost.push(pid.wrapping_add(bit + 1));
                    }
                }
            }
            Some(RtcpPacket::Nack(Nack {
                sender_ssrc,
                media_ssrc,
                lost,
            }))
        }
        (RTCP_PSFB, FMT_PLI) => {
            if body.remaining() < 8 {
                return None;
            }
            Some(RtcpPacket::Pli(Pli {
                sender_ssrc: body.get_u32(),
                media_ssrc: body.get_u32(),
            }))
        }
        (RTCP_PSFB, FMT_FIR) => {
            if body.remaining() < 8 || (body.remaining() - 8) % 8 != 0 {
                return None;
            }
            let sender_ssrc = body.get_u32();
            body.advance(4); // media SSRC, unused for FIR
            let mut entries = Vec::with_capacity(body.remaining() / 8);
            while body.has_remaining() {
                let ssrc = body.get_u32();
                let sequence_number = body.get_u8();
                body.advance(3);
                entries.push(FirEntry {
                    ssrc,
                    sequence_number,
                });
            }
            Some(RtcpPacket::Fir(Fir {
                sender_ssrc,
                entries,
            }))
        }
        _ => None,
    }
}

// ─── Encoding ───────────────────────────────────────────────────────────────

/// Writes sections into a compound datagram. Used by tests, benches and the
/// fuzz harness to produce well-formed input.
#[derive(Debug, Default)]
pub struct CompoundBuilder {
    buf: BytesMut,
}

impl CompoundBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    fn header(&mut self, count: u8, packet_type: u8, body_len: usize) {
        self.buf.put_u8(0x80 | (count & 0x1F));
        self.buf.put_u8(packet_type);
        self.buf.put_u16((body_len / 4) as u16);
    }

    pub fn sender_report(mut self, sr: &SenderReport) -> Self {
        let body_len = 4 + SENDER_INFO_LEN + sr.reports.len() * REPORT_BLOCK_LEN;
        self.header(sr.reports.len() as u8, RTCP_SR, body_len);
        self.buf.put_u32(sr.sender_ssrc);
        self.buf.put_u32(sr.ntp_seconds);
        self.buf.put_u32(sr.ntp_fraction);
        self.buf.put_u32(sr.rtp_timestamp);
        self.buf.put_u32(sr.packet_count);
        self.buf.put_u32(sr.octet_count);
        for block in &sr.reports {
            block.encode(&mut self.buf);
        }
        self
    }

    pub fn receiver_report(mut self, sender_ssrc: u32, reports: &[ReportBlock]) -> Self {
        self.header(reports.len() as u8, RTCP_RR, 4 + reports.len() * REPORT_BLOCK_LEN);
        self.buf.put_u32(sender_ssrc);
        for block in reports {
            block.encode(&mut self.buf);
        }
        self
    }

    /// SDES with one CNAME chunk.
    pub fn sdes_cname(mut self, ssrc: u32, cname: &str) -> Self {
        let item_len = 2 + cname.len();
        // Chunk: SSRC, items, END, pad to 32 bits.
        let chunk_len = (4 + item_len + 1).div_ceil(4) * 4;
        self.header(1, RTCP_SDES, chunk_len);
        self.buf.put_u32(ssrc);
        self.buf.put_u8(1);
        self.buf.put_u8(cname.len() as u8);
        self.buf.extend_from_slice(cname.as_bytes());
        self.buf.put_bytes(0, chunk_len - 4 - item_len);
        self
    }

    pub fn bye(mut self, sources: &[u32]) -> Self {
        self.header(sources.len() as u8, RTCP_BYE, sources.len() * 4);
        for ssrc in sources {
            self.buf.put_u32(*ssrc);
        }
        self
    }

    /// Generic NACK; one PID per listed sequence number.
    pub fn nack(mut self, sender_ssrc: u32, media_ssrc: u32, lost: &[u16]) -> Self {
        self.header(FMT_GENERIC_NACK, RTCP_RTPFB, 8 + lost.len() * 4);
        self.buf.put_u32(sender_ssrc);
        self.buf.put_u32(media_ssrc);
        for seq in lost {
            self.buf.put_u16(*seq);
            self.buf.put_u16(0);
        }
        self
    }

    pub fn pli(mut self, sender_ssrc: u32, media_ssrc: u32) -> Self {
        self.header(FMT_PLI, RTCP_PSFB, 8);
        self.buf.put_u32(sender_ssrc);
        self.buf.put_u32(media_ssrc);
        self
    }

    pub fn fir(mut self, sender_ssrc: u32, entries: &[FirEntry]) -> Self {
        self.header(FMT_FIR, RTCP_PSFB, 8 + entries.len() * 8);
        self.buf.put_u32(sender_ssrc);
        self.buf.put_u32(0);
        for entry in entries {
            self.buf.put_u32(entry.ssrc);
            self.buf.put_u8(entry.sequence_number);
            self.buf.put_bytes(0, 3);
        }
        self
    }

    /// Raw section bytes, appended as-is.
    pub fn raw(mut self, bytes: &[u8]) -> Self {
        self.buf.extend_from_slice(bytes);
        self
    }

    pub fn build(self) -> BytesMut {
        self.buf
    }
}
