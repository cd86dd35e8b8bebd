//! # Payload Type Registry
//!
//! Maps wire payload types to codec descriptors, and RTX wrapper payload
//! types to the payload type they carry. Mutated only by configuration
//! calls; the receiver reads an immutable snapshot per packet.

use std::collections::HashMap;

use compact_str::CompactString;
use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, DropReason};

/// Highest valid 7-bit payload type.
pub const MAX_PAYLOAD_TYPE: u8 = 127;

/// Highest accepted codec clock rate. Above this an RTP timestamp wraps in
/// well under an hour.
pub const MAX_CLOCK_RATE_HZ: u32 = 1_000_000;

/// Codec names with container semantics rather than media semantics.
pub const RED_CODEC_NAME: &str = "red";
pub const ULPFEC_CODEC_NAME: &str = "ulpfec";

/// Payload types that collide with RTCP packet types 192..=207 once the
/// marker bit is folded into the second header byte.
pub fn is_reserved_payload_type(payload_type: u8) -> bool {
    payload_type == 64 || (72..=79).contains(&payload_type)
}

// ─── Codec Descriptor ───────────────────────────────────────────────────────

/// One negotiated receive codec.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodecDescriptor {
    pub name: CompactString,
    pub payload_type: u8,
    pub clock_rate_hz: u32,
    /// 0 = unspecified.
    #[serde(default)]
    pub max_bitrate_kbps: u32,
}

impl CodecDescriptor {
    pub fn new(name: &str, payload_type: u8, clock_rate_hz: u32) -> Self {
        CodecDescriptor {
            name: CompactString::from(name),
            payload_type,
            clock_rate_hz,
            max_bitrate_kbps: 0,
        }
    }

    pub fn is_red(&self) -> bool {
        self.name.eq_ignore_ascii_case(RED_CODEC_NAME)
    }

    pub fn is_ulpfec(&self) -> bool {
        self.name.eq_ignore_ascii_case(ULPFEC_CODEC_NAME)
    }

    /// Same codec for the purpose of re-registration on the same type.
    fn is_compatible(&self, other: &CodecDescriptor) -> bool {
        self.name.eq_ignore_ascii_case(&other.name) && self.clock_rate_hz == other.clock_rate_hz
    }

    fn rejected(&self, reason: &'static str) -> ConfigError {
        ConfigError::CodecRejected {
            name: self.name.to_string(),
            payload_type: self.payload_type,
            reason,
        }
    }
}

// ─── Registry ───────────────────────────────────────────────────────────────

/// Payload type → codec, and RTX wrapper → original payload type.
#[derive(Debug, Clone, Default)]
pub struct PayloadRegistry {
    codecs: HashMap<u8, CodecDescriptor>,
    rtx: HashMap<u8, u8>,
    red_payload_type: Option<u8>,
    ulpfec_payload_type: Option<u8>,
}

impl PayloadRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install a codec mapping.
    ///
    /// Re-registering a compatible codec on the same payload type updates it
    /// in place; the same codec name under a new payload type moves the
    /// mapping.
    pub fn register_codec(&mut self, codec: CodecDescriptor) -> Result<(), ConfigError> {
        if codec.payload_type > MAX_PAYLOAD_TYPE {
            return Err(codec.rejected("payload type out of range"));
        }
        if is_reserved_payload_type(codec.payload_type) {
            return Err(codec.rejected("payload type reserved for RTCP"));
        }
        if codec.clock_rate_hz == 0 && !codec.is_red() && !codec.is_ulpfec() {
            return Err(codec.rejected("clock rate must be non-zero"));
        }
        if codec.clock_rate_hz > MAX_CLOCK_RATE_HZ {
            return Err(codec.rejected("clock rate out of range"));
        }
        if let Some(existing) = self.codecs.get(&codec.payload_type) {
            if !existing.is_compatible(&codec) {
                return Err(codec.rejected("payload type bound to another codec"));
            }
        }
        if self.rtx.contains_key(&codec.payload_type) {
            return Err(codec.rejected("payload type bound to RTX"));
        }

        let stale: Vec<u8> = self
            .codecs
            .values()
            .filter(|c| c.payload_type != codec.payload_type && c.name.eq_ignore_ascii_case(&codec.name))
            .map(|c| c.payload_type)
            .collect();
        for pt in stale {
            self.remove(pt);
        }

        if codec.is_red() {
            self.red_payload_type = Some(codec.payload_type);
        } else if codec.is_ulpfec() {
            self.ulpfec_payload_type = Some(codec.payload_type);
        }
        self.codecs.insert(codec.payload_type, codec);
        Ok(())
    }

    /// Remove a codec mapping; returns the removed descriptor.
    pub fn remove(&mut self, payload_type: u8) -> Option<CodecDescriptor> {
        let removed = self.codecs.remove(&payload_type)?;
        if self.red_payload_type == Some(payload_type) {
            self.red_payload_type = None;
        }
        if self.ulpfec_payload_type == Some(payload_type) {
            self.ulpfec_payload_type = None;
        }
        Some(removed)
    }

    /// Install or replace the RTX wrapper → original association.
    ///
    /// The wrapper type may not carry itself and may not already name a
    /// codec, otherwise every packet of that codec would be unwrapped as RTX.
    pub fn set_rtx_mapping(&mut self, rtx_payload_type: u8, original: u8) -> Result<(), ConfigError> {
        for pt in [rtx_payload_type, original] {
            if pt > MAX_PAYLOAD_TYPE || is_reserved_payload_type(pt) {
                return Err(ConfigError::InvalidPayloadType(pt));
            }
        }
        if rtx_payload_type == original || self.codecs.contains_key(&rtx_payload_type) {
            return Err(ConfigError::InvalidPayloadType(rtx_payload_type));
        }
        self.rtx.insert(rtx_payload_type, original);
        Ok(())
    }

    /// Resolve the payload type an RTX packet restores to.
    ///
    /// With `use_explicit_mapping` the installed association is used and a
    /// miss is an error. Without it, `last_known` is returned and the table
    /// is ignored; `None` there means no media has been seen yet.
    pub fn resolve_original(
        &self,
        rtx_payload_type: u8,
        use_explicit_mapping: bool,
        last_known: Option<u8>,
    ) -> Result<u8, DropReason> {
        if use_explicit_mapping {
            self.rtx
                .get(&rtx_payload_type)
                .copied()
                .ok_or(DropReason::UnknownPayloadType(rtx_payload_type))
        } else {
            last_known.ok_or(DropReason::UnknownPayloadType(rtx_payload_type))
        }
    }

    pub fn is_rtx(&self, payload_type: u8) -> bool {
        self.rtx.contains_key(&payload_type)
    }

    pub fn is_red(&self, payload_type: u8) -> bool {
        self.red_payload_type == Some(payload_type)
    }

    pub fn is_ulpfec(&self, payload_type: u8) -> bool {
        self.ulpfec_payload_type == Some(payload_type)
    }

    pub fn red_payload_type(&self) -> Option<u8> {
        self.red_payload_type
    }

    pub fn ulpfec_payload_type(&self) -> Option<u8> {
        self.ulpfec_payload_type
    }

    pub fn codec(&self, payload_type: u8) -> Option<&CodecDescriptor> {
        self.codecs.get(&payload_type)
    }

    /// Nominal clock rate for a media payload type.
    pub fn clock_rate(&self, payload_type: u8) -> Option<u32> {
        self.codecs
            .get(&payload_type)
            .map(|c| c.clock_rate_hz)
            .filter(|rate| *rate > 0)
    }

    pub fn len(&self) -> usize {
        self.codecs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.codecs.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vp8() -> CodecDescriptor {
        CodecDescriptor::new("VP8", 96, 90_000)
    }

    #[test]
    fn register_and_lookup() {
        let mut reg = PayloadRegistry::new();
        reg.register_codec(vp8()).unwrap();
        assert_eq!(reg.codec(96).unwrap().name, "VP8");
        assert_eq!(reg.clock_rate(96), Some(90_000));
        assert_eq!(reg.clock_rate(97), None);
    }

    #[test]
    fn reserved_payload_types_rejected() {
        let mut reg = PayloadRegistry::new();
        for pt in [64, 72, 79] {
            let err = reg
                .register_codec(CodecDescriptor::new("VP8", pt, 90_000))
                .unwrap_err();
            assert!(matches!(err, ConfigError::CodecRejected { payload_type, .. } if payload_type == pt));
        }
        assert!(reg.register_codec(CodecDescriptor::new("VP8", 128, 90_000)).is_err());
        assert!(reg.is_empty());
    }

    #[test]
    fn conflicting_codec_on_same_type_rejected() {
        let mut reg = PayloadRegistry::new();
        reg.register_codec(vp8()).unwrap();
        assert!(reg
            .register_codec(CodecDescriptor::new("H264", 96, 90_000))
            .is_err());
        // Compatible update is accepted.
        let mut updated = vp8();
        updated.max_bitrate_kbps = 2500;
        reg.register_codec(updated).unwrap();
        assert_eq!(reg.codec(96).unwrap().max_bitrate_kbps, 2500);
    }

    #[test]
    fn same_name_new_type_moves_mapping() {
        let mut reg = PayloadRegistry::new();
        reg.register_codec(vp8()).unwrap();
        reg.register_codec(CodecDescriptor::new("vp8", 100, 90_000)).unwrap();
        assert!(reg.codec(96).is_none());
        assert!(reg.codec(100).is_some());
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn red_and_ulpfec_tracked() {
        let mut reg = PayloadRegistry::new();
        reg.register_codec(CodecDescriptor::new("red", 116, 90_000)).unwrap();
        reg.register_codec(CodecDescriptor::new("ulpfec", 117, 90_000)).unwrap();
        assert!(reg.is_red(116));
        assert!(reg.is_ulpfec(117));
        assert_eq!(reg.ulpfec_payload_type(), Some(117));

        reg.remove(117);
        assert_eq!(reg.ulpfec_payload_type(), None);
    }

    #[test]
    fn resolve_uses_mapping_when_flag_on() {
        let mut reg = PayloadRegistry::new();
        reg.set_rtx_mapping(97, 96).unwrap();
        assert_eq!(reg.resolve_original(97, true, Some(100)), Ok(96));
        assert_eq!(
            reg.resolve_original(98, true, Some(100)),
            Err(DropReason::UnknownPayloadType(98))
        );
    }

    #[test]
    fn resolve_ignores_mapping_when_flag_off() {
        let mut reg = PayloadRegistry::new();
        reg.set_rtx_mapping(97, 96).unwrap();
        assert_eq!(reg.resolve_original(97, false, Some(100)), Ok(100));
        assert_eq!(
            reg.resolve_original(97, false, None),
            Err(DropReason::UnknownPayloadType(97))
        );
    }

    #[test]
    fn rtx_mapping_is_idempotent_and_replaceable() {
        let mut reg = PayloadRegistry::new();
        reg.set_rtx_mapping(97, 96).unwrap();
        reg.set_rtx_mapping(97, 96).unwrap();
        reg.set_rtx_mapping(97, 100).unwrap();
        assert_eq!(reg.resolve_original(97, true, None), Ok(100));
        assert_eq!(reg.set_rtx_mapping(72, 96), Err(ConfigError::InvalidPayloadType(72)));
    }

    #[test]
    fn clock_rate_bounded() {
        let mut reg = PayloadRegistry::new();
        let err = reg
            .register_codec(CodecDescriptor::new("L16", 100, 5_000_000))
            .unwrap_err();
        assert!(matches!(
            err,
            ConfigError::CodecRejected { payload_type: 100, reason: "clock rate out of range", .. }
        ));
        reg.register_codec(CodecDescriptor::new("L16", 100, MAX_CLOCK_RATE_HZ)).unwrap();
        assert_eq!(reg.clock_rate(100), Some(MAX_CLOCK_RATE_HZ));
    }

    #[test]
    fn rtx_type_may_not_shadow_a_codec() {
        let mut reg = PayloadRegistry::new();
        reg.register_codec(vp8()).unwrap();
        assert_eq!(reg.set_rtx_mapping(96, 96), Err(ConfigError::InvalidPayloadType(96)));
        assert_eq!(reg.set_rtx_mapping(96, 100), Err(ConfigError::InvalidPayloadType(96)));
        assert_eq!(reg.set_rtx_mapping(97, 97), Err(ConfigError::InvalidPayloadType(97)));
        assert!(!reg.is_rtx(96));
        assert!(!reg.is_rtx(97));
        reg.set_rtx_mapping(97, 96).unwrap();
        assert!(reg.is_rtx(97));
    }

    #[test]
    fn codec_on_rtx_type_rejected() {
        let mut reg = PayloadRegistry::new();
        reg.set_rtx_mapping(97, 96).unwrap();
        assert!(reg.register_codec(CodecDescriptor::new("VP9", 97, 90_000)).is_err());
    }
}
