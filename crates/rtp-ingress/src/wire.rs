//! # RTP Wire Format
//!
//! RTP fixed header (RFC 3550 §5.1), RFC 8285 header extensions, and the two
//! encapsulations the receive pipeline unwraps: RTX (RFC 4588) and RED
//! (RFC 2198).
//!
//! ## Fixed header (12 bytes + 4 × CC)
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |V=2|P|X|  CC   |M|     PT      |       sequence number         |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                           timestamp                           |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |           synchronization source (SSRC) identifier            |
//! +=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+
//! |            contributing source (CSRC) identifiers             |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```
//!
//! ## RTX payload
//!
//! ```text
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |            OSN                |  original sequence number
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |  original RTP payload ...     |
//! ```
//!
//! ## RED block header
//!
//! ```text
//! |F|   block PT  |  timestamp offset (14)  | block length (10) |   F=1
//! |0|   block PT  |                                                F=0 (primary)
//! ```

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::ConfigError;

// ─── Constants ───────────────────────────────────────────────────────────────

/// RTP version (RFC 3550).
pub const RTP_VERSION: u8 = 2;

/// Fixed header length without CSRCs or extensions.
pub const FIXED_HEADER_LEN: usize = 12;

/// Length of the RTX original-sequence-number prefix.
pub const RTX_HEADER_LEN: usize = 2;

/// Maximum CSRC count (4-bit field).
pub const MAX_CSRC_COUNT: usize = 15;

/// Largest id usable with the one-byte extension form.
pub const MAX_ONE_BYTE_EXTENSION_ID: u8 = 14;

const ONE_BYTE_PROFILE: u16 = 0xBEDE;
const TWO_BYTE_PROFILE_MASK: u16 = 0xFFF0;
const TWO_BYTE_PROFILE: u16 = 0x1000;
const MARKER_BIT: u8 = 0x80;
const PADDING_BIT: u8 = 0x20;

// ─── Header Extensions ───────────────────────────────────────────────────────

/// Header extensions the receiver knows how to decode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExtensionKind {
    TransmissionTimeOffset,
    AbsoluteSendTime,
    VideoOrientation,
    TransportSequenceNumber,
    AudioLevel,
}

impl ExtensionKind {
    pub const ALL: [ExtensionKind; 5] = [
        ExtensionKind::TransmissionTimeOffset,
        ExtensionKind::AbsoluteSendTime,
        ExtensionKind::VideoOrientation,
        ExtensionKind::TransportSequenceNumber,
        ExtensionKind::AudioLevel,
    ];

    /// The URI negotiated in SDP `a=extmap` lines.
    pub const fn uri(self) -> &'static str {
        match self {
            ExtensionKind::TransmissionTimeOffset => "urn:ietf:params:rtp-hdrext:toffset",
            ExtensionKind::AbsoluteSendTime => {
                "http://www.webrtc.org/experiments/rtp-hdrext/abs-send-time"
            }
            ExtensionKind::VideoOrientation => "urn:3gpp:video-orientation",
            ExtensionKind::TransportSequenceNumber => {
                "http://www.ietf.org/id/draft-holmer-rmcat-transport-wide-cc-extensions-01"
            }
            ExtensionKind::AudioLevel => "urn:ietf:params:rtp-hdrext:ssrc-audio-level",
        }
    }

    pub fn from_uri(uri: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.uri() == uri)
    }
}

/// Id → extension bindings for the receive direction.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExtensionMap {
    /// Indexed by extension id; slot 0 is never used.
    ids: [Option<ExtensionKind>; MAX_ONE_BYTE_EXTENSION_ID as usize + 1],
}

impl ExtensionMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `kind` to `id`. Re-binding the same pair is a no-op; binding a
    /// kind to a new id moves it.
    pub fn register(&mut self, kind: ExtensionKind, id: u8) -> Result<(), ConfigError> {
        if id == 0 || id > MAX_ONE_BYTE_EXTENSION_ID {
            return Err(ConfigError::InvalidExtensionId(id));
        }
        match self.ids[id as usize] {
            Some(existing) if existing == kind => return Ok(()),
            Some(_) => return Err(ConfigError::ExtensionIdInUse(id)),
            None => {}
        }
        if let Some(old) = self.id_of(kind) {
            self.ids[old as usize] = None;
        }
        self.ids[id as usize] = Some(kind);
        Ok(())
    }

    pub fn kind(&self, id: u8) -> Option<ExtensionKind> {
        self.ids.get(id as usize).copied().flatten()
    }

    pub fn id_of(&self, kind: ExtensionKind) -> Option<u8> {
        self.ids
            .iter()
            .position(|slot| *slot == Some(kind))
            .map(|idx| idx as u8)
    }

    pub fn is_empty(&self) -> bool {
        self.ids.iter().all(Option::is_none)
    }
}

/// Audio level indication (RFC 6464).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioLevel {
    pub voice_activity: bool,
    /// Level in -dBov, 0..=127.
    pub level: u8,
}

/// Decoded values of the registered extensions present on a packet.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeaderExtensions {
    /// Signed 24-bit offset in RTP timestamp units.
    pub transmission_time_offset: Option<i32>,
    /// 6.18 fixed-point seconds, 24 bits.
    pub absolute_send_time: Option<u32>,
    /// Rotation in degrees (0, 90, 180, 270).
    pub video_rotation: Option<u16>,
    pub transport_sequence_number: Option<u16>,
    pub audio_level: Option<AudioLevel>,
}

impl HeaderExtensions {
    /// Store one element. Elements with an unexpected length are ignored.
    fn apply(&mut self, kind: ExtensionKind, value: &[u8]) {
        match (kind, value) {
            (ExtensionKind::TransmissionTimeOffset, &[a, b, c]) => {
                let raw = u32::from_be_bytes([0, a, b, c]);
                // Sign-extend the 24-bit value.
                self.transmission_time_offset = Some(((raw << 8) as i32) >> 8);
            }
            (ExtensionKind::AbsoluteSendTime, &[a, b, c]) => {
                self.absolute_send_time = Some(u32::from_be_bytes([0, a, b, c]));
            }
            (ExtensionKind::VideoOrientation, &[cvo]) => {
                self.video_rotation = Some(match cvo & 0x03 {
                    0 => 0,
                    1 => 90,
                    2 => 180,
                    _ => 270,
                });
            }
            (ExtensionKind::TransportSequenceNumber, &[a, b]) => {
                self.transport_sequence_number = Some(u16::from_be_bytes([a, b]));
            }
            (ExtensionKind::AudioLevel, &[byte]) => {
                self.audio_level = Some(AudioLevel {
                    voice_activity: byte & 0x80 != 0,
                    level: byte & 0x7F,
                });
            }
            _ => {}
        }
    }

    fn decode(profile: u16, mut block: &[u8], map: &ExtensionMap) -> Self {
        let mut out = HeaderExtensions::default();
        if profile == ONE_BYTE_PROFILE {
            while block.has_remaining() {
                let b = block.get_u8();
                let id = b >> 4;
                if id == 0 {
                    continue; // padding
                }
                if id == 15 {
                    break;
                }
                let len = (b & 0x0F) as usize + 1;
                if block.remaining() < len {
                    break;
                }
                if let Some(kind) = map.kind(id) {
                    out.apply(kind, &block[..len]);
                }
                block.advance(len);
            }
        } else if profile & TWO_BYTE_PROFILE_MASK == TWO_BYTE_PROFILE {
            while block.has_remaining() {
                let id = block.get_u8();
                if id == 0 {
                    continue; // padding
                }
                if !block.has_remaining() {
                    break;
                }
                let len = block.get_u8() as usize;
                if block.remaining() < len {
                    break;
                }
                if let Some(kind) = map.kind(id) {
                    out.apply(kind, &block[..len]);
                }
                block.advance(len);
            }
        }
        out
    }
}

// ─── RTP Header ─────────────────────────────────────────────────────────────

/// Decoded RTP header. Immutable once parsed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtpHeader {
    pub marker: bool,
    /// 7-bit payload type.
    pub payload_type: u8,
    pub sequence_number: u16,
    pub timestamp: u32,
    pub ssrc: u32,
    pub csrcs: Vec<u32>,
    pub extensions: HeaderExtensions,
    /// Bytes before the payload (fixed header + CSRCs + extension block).
    pub header_len: usize,
    /// Trailing padding bytes (including the count byte).
    pub padding_len: usize,
    pub payload_len: usize,
}

impl RtpHeader {
    /// Create a header with no CSRCs or extensions.
    pub fn new(ssrc: u32, sequence_number: u16, timestamp: u32, payload_type: u8) -> Self {
        RtpHeader {
            marker: false,
            payload_type: payload_type & 0x7F,
            sequence_number,
            timestamp,
            ssrc,
            csrcs: Vec::new(),
            extensions: HeaderExtensions::default(),
            header_len: FIXED_HEADER_LEN,
            padding_len: 0,
            payload_len: 0,
        }
    }

    pub fn with_marker(mut self) -> Self {
        self.marker = true;
        self
    }

    pub fn with_csrcs(mut self, csrcs: &[u32]) -> Self {
        self.csrcs = csrcs.iter().copied().take(MAX_CSRC_COUNT).collect();
        self.header_len = FIXED_HEADER_LEN + 4 * self.csrcs.len();
        self
    }

    /// Decode a header from a complete packet. Extensions are decoded for ids
    /// bound in `map`; anything else is skipped. Returns `None` on any
    /// structural violation.
    pub fn decode(packet: &[u8], map: &ExtensionMap) -> Option<Self> {
        let mut buf = packet;
        if buf.remaining() < FIXED_HEADER_LEN {
            return None;
        }

        let b0 = buf.get_u8();
        if b0 >> 6 != RTP_VERSION {
            return None;
        }
        let has_padding = b0 & PADDING_BIT != 0;
        let has_extension = b0 & 0x10 != 0;
        let csrc_count = (b0 & 0x0F) as usize;

        let b1 = buf.get_u8();
        let marker = b1 & MARKER_BIT != 0;
        let payload_type = b1 & 0x7F;
        let sequence_number = buf.get_u16();
        let timestamp = buf.get_u32();
        let ssrc = buf.get_u32();

        if buf.remaining() < csrc_count * 4 {
            return None;
        }
        let csrcs = (0..csrc_count).map(|_| buf.get_u32()).collect();

        let mut extensions = HeaderExtensions::default();
        if has_extension {
            if buf.remaining() < 4 {
                return None;
            }
            let profile = buf.get_u16();
            let len = buf.get_u16() as usize * 4;
            if buf.remaining() < len {
                return None;
            }
            extensions = HeaderExtensions::decode(profile, &buf[..len], map);
            buf.advance(len);
        }

        let header_len = packet.len() - buf.remaining();
        let padding_len = if has_padding {
            let count = *packet.last()? as usize;
            if count == 0 || header_len + count > packet.len() {
                return None;
            }
            count
        } else {
            0
        };

        Some(RtpHeader {
            marker,
            payload_type,
            sequence_number,
            timestamp,
            ssrc,
            csrcs,
            extensions,
            header_len,
            padding_len,
            payload_len: packet.len() - header_len - padding_len,
        })
    }

    /// Encode the fixed header and CSRC list. Extensions are not written.
    pub fn encode(&self, buf: &mut impl BufMut) {
        let csrc_count = self.csrcs.len().min(MAX_CSRC_COUNT);
        buf.put_u8((RTP_VERSION << 6) | csrc_count as u8);
        buf.put_u8(((self.marker as u8) << 7) | (self.payload_type & 0x7F));
        buf.put_u16(self.sequence_number);
        buf.put_u32(self.timestamp);
        buf.put_u32(self.ssrc);
        for csrc in &self.csrcs[..csrc_count] {
            buf.put_u32(*csrc);
        }
    }

    /// The payload slice of the packet this header was decoded from.
    pub fn payload<'a>(&self, packet: &'a [u8]) -> &'a [u8] {
        packet
            .get(self.header_len..self.header_len + self.payload_len)
            .unwrap_or(&[])
    }

    /// Whether the packet carries nothing but header and padding.
    pub fn is_padding_only(&self) -> bool {
        self.payload_len == 0 && self.padding_len > 0
    }
}

// ─── Full Packet ────────────────────────────────────────────────────────────

/// An RTP packet: header + payload.
#[derive(Debug, Clone)]
pub struct RtpPacket {
    pub header: RtpHeader,
    pub payload: Bytes,
}

impl RtpPacket {
    pub fn new(header: RtpHeader, payload: Bytes) -> Self {
        RtpPacket { header, payload }
    }

    /// Serialize header (without extensions) and payload.
    pub fn encode(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(
            FIXED_HEADER_LEN + 4 * self.header.csrcs.len() + self.payload.len(),
        );
        self.header.encode(&mut buf);
        buf.extend_from_slice(&self.payload);
        buf
    }

    /// Wrap this packet as RTX: the payload is prefixed with the original
    /// sequence number and sent under `rtx_ssrc`/`rtx_payload_type`.
    pub fn to_rtx(&self, rtx_ssrc: u32, rtx_sequence: u16, rtx_payload_type: u8) -> BytesMut {
        let mut header = self.header.clone();
        header.ssrc = rtx_ssrc;
        header.sequence_number = rtx_sequence;
        header.payload_type = rtx_payload_type & 0x7F;

        let mut payload = BytesMut::with_capacity(RTX_HEADER_LEN + self.payload.len());
        payload.put_u16(self.header.sequence_number);
        payload.extend_from_slice(&self.payload);
        RtpPacket::new(header, payload.freeze()).encode()
    }
}

// ─── RTX ────────────────────────────────────────────────────────────────────

/// Read the original sequence number from an RTX packet.
pub fn rtx_original_sequence(header: &RtpHeader, packet: &[u8]) -> Option<u16> {
    let mut osn = header.payload(packet);
    if osn.remaining() < RTX_HEADER_LEN {
        return None;
    }
    Some(osn.get_u16())
}

/// Length of the packet [`restore_rtx`] produces from `packet`.
pub fn restored_rtx_len(header: &RtpHeader, packet: &[u8]) -> Option<usize> {
    if header.payload_len < RTX_HEADER_LEN {
        return None;
    }
    Some(packet.len() - RTX_HEADER_LEN)
}

/// Rebuild the original packet from an RTX packet into `out`.
///
/// The header bytes are copied verbatim, then sequence number, SSRC and
/// payload type are patched (the marker bit survives). The 2-byte OSN is
/// dropped. Returns the restored length, or `None` if `packet` is not a
/// well-formed RTX packet or `out` is too small.
pub fn restore_rtx(
    packet: &[u8],
    header: &RtpHeader,
    original_ssrc: u32,
    original_payload_type: u8,
    out: &mut [u8],
) -> Option<usize> {
    let osn = rtx_original_sequence(header, packet)?;
    let restored_len = restored_rtx_len(header, packet)?;
    if out.len() < restored_len {
        return None;
    }

    let hlen = header.header_len;
    out[..hlen].copy_from_slice(&packet[..hlen]);
    out[hlen..restored_len].copy_from_slice(&packet[hlen + RTX_HEADER_LEN..]);

    out[1] = (original_payload_type & 0x7F) | if header.marker { MARKER_BIT } else { 0 };
    out[2..4].copy_from_slice(&osn.to_be_bytes());
    out[8..12].copy_from_slice(&original_ssrc.to_be_bytes());
    Some(restored_len)
}

// ─── RED ────────────────────────────────────────────────────────────────────

/// One block of a RED payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedBlock {
    pub payload_type: u8,
    /// Offset subtracted from the RED packet's timestamp (0 for the primary).
    pub timestamp_offset: u16,
    pub data: Bytes,
    /// The last block; carries the packet's own media.
    pub primary: bool,
}

/// Split a RED payload into its blocks, redundant blocks first, primary last.
pub fn split_red(payload: &Bytes) -> Option<Vec<RedBlock>> {
    struct BlockHeader {
        payload_type: u8,
        timestamp_offset: u16,
        len: Option<usize>,
    }

    let mut headers = Vec::new();
    let mut buf = &payload[..];
    loop {
        if !buf.has_remaining() {
            return None;
        }
        let b = buf.get_u8();
        let payload_type = b & 0x7F;
        if b & 0x80 == 0 {
            headers.push(BlockHeader {
                payload_type,
                timestamp_offset: 0,
                len: None,
            });
            break;
        }
        if buf.remaining() < 3 {
            return None;
        }
        let word = ((buf.get_u8() as u32) << 16) | ((buf.get_u8() as u32) << 8) | buf.get_u8() as u32;
        headers.push(BlockHeader {
            payload_type,
            timestamp_offset: (word >> 10) as u16,
            len: Some((word & 0x3FF) as usize),
        });
    }

    let mut offset = payload.len() - buf.remaining();
    let mut blocks = Vec::with_capacity(headers.len());
    for hdr in headers {
        let (data, primary) = match hdr.len {
            Some(len) => {
                if offset + len > payload.len() {
                    return None;
                }
                let data = payload.slice(offset..offset + len);
                offset += len;
                (data, false)
            }
            None => (payload.slice(offset..), true),
        };
        blocks.push(RedBlock {
            payload_type: hdr.payload_type,
            timestamp_offset: hdr.timestamp_offset,
            data,
            primary,
        });
    }
    Some(blocks)
}

/// Rebuild a media packet from a RED block: the RED packet's header bytes
/// with the block's payload type (and timestamp offset applied), followed by
/// the block data. The padding bit is cleared since the RED padding is gone.
pub fn rebuild_red_block(packet: &[u8], header: &RtpHeader, block: &RedBlock) -> BytesMut {
    let hlen = header.header_len;
    let mut out = BytesMut::with_capacity(hlen + block.data.len());
    out.extend_from_slice(&packet[..hlen]);
    out[0] &= !PADDING_BIT;
    out[1] = (block.payload_type & 0x7F) | if header.marker { MARKER_BIT } else { 0 };
    let ts = header.timestamp.wrapping_sub(block.timestamp_offset as u32);
    out[4..8].copy_from_slice(&ts.to_be_bytes());
    out.extend_from_slice(&block.data);
    out
}
