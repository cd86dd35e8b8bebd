//! # Errors
//!
//! Per-packet drop reasons and configuration errors. Every per-packet error
//! is local: the packet is dropped, the call returns `Err`, and the receiver
//! keeps running.

use thiserror::Error;

// ── Per-packet ──────────────────────────────────────────────────────

/// Why a packet (or one component of an encapsulated packet) was dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DropReason {
    #[error("malformed RTP/RTCP packet")]
    ParseError,
    #[error("receiver is stopped")]
    NotReceiving,
    #[error("no codec or RTX mapping for payload type {0}")]
    UnknownPayloadType(u8),
    #[error("encapsulation nested deeper than {0} levels")]
    EncapsulationTooDeep(usize),
    #[error("reconstruction buffer is in use")]
    BufferBusy,
    #[error("packet of {len} bytes exceeds the {capacity}-byte reconstruction buffer")]
    OversizedPacket { len: usize, capacity: usize },
    #[error("decoder rejected payload with status {0}")]
    DecoderRejected(i32),
    #[error("FEC packet received but no FEC receiver is attached")]
    NoFecReceiver,
}

// ── Configuration ───────────────────────────────────────────────────

/// Configuration rejected by a setter or by config resolution.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("codec {name} rejected for payload type {payload_type}: {reason}")]
    CodecRejected {
        name: String,
        payload_type: u8,
        reason: &'static str,
    },
    #[error("invalid payload type {0}")]
    InvalidPayloadType(u8),
    #[error("unknown RTP header extension {0}")]
    UnknownHeaderExtension(String),
    #[error("header extension id {0} out of range")]
    InvalidExtensionId(u8),
    #[error("header extension id {0} already bound to another extension")]
    ExtensionIdInUse(u8),
    #[error("unsupported config version {0}")]
    UnsupportedVersion(u32),
    #[error("config parse error: {0}")]
    Parse(String),
}

// ── Clock ───────────────────────────────────────────────────────────

/// Clock correlation failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ClockError {
    #[error("no sender report sample ingested yet")]
    Unavailable,
}
