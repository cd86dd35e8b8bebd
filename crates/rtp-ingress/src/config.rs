//! # Receiver Configuration
//!
//! TOML-backed configuration. Everything in the input is optional; `resolve`
//! fills defaults and validates codecs, RTX mappings and header extensions
//! up front so that [`crate::receiver::PacketReceiver::new`] can apply them
//! without surprises.

use std::path::Path;

use anyhow::Context;
use compact_str::CompactString;
use serde::Deserialize;

use crate::error::ConfigError;
use crate::ordering::MAX_REORDERING_THRESHOLD;
use crate::payload::{CodecDescriptor, PayloadRegistry};
use crate::pool::IP_PACKET_SIZE;
use crate::wire::{ExtensionKind, ExtensionMap};

pub const CONFIG_VERSION: u32 = 1;

pub const DEFAULT_MAX_REORDERING_THRESHOLD: u16 = 50;
pub const DEFAULT_CLOCK_RATE_HZ: u32 = 90_000;
pub const DEFAULT_STATS_LOG_INTERVAL_MS: i64 = 10_000;

// ─── Input ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ReceiverConfigInput {
    pub version: u32,
    pub nack_enabled: Option<bool>,
    pub max_reordering_threshold: Option<u16>,
    pub use_rtx_payload_mapping_on_restore: Option<bool>,
    pub rtx_ssrc: Option<u32>,
    pub local_ssrc: Option<u32>,
    pub default_clock_rate_hz: Option<u32>,
    pub stats_log_interval_ms: Option<i64>,
    pub scratch_capacity: Option<usize>,
    pub codecs: Vec<CodecInput>,
    pub rtx: Vec<RtxInput>,
    pub header_extensions: Vec<HeaderExtensionInput>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct CodecInput {
    pub name: String,
    pub payload_type: u8,
    pub clock_rate_hz: Option<u32>,
    pub max_bitrate_kbps: Option<u32>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RtxInput {
    pub payload_type: u8,
    pub associated_payload_type: u8,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct HeaderExtensionInput {
    pub uri: String,
    pub id: u8,
}

// ─── Resolved ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct ReceiverConfig {
    pub version: u32,
    pub nack_enabled: bool,
    pub max_reordering_threshold: u16,
    pub use_rtx_payload_mapping_on_restore: bool,
    pub rtx_ssrc: Option<u32>,
    /// Our own SSRC; receiver report blocks addressed to it yield RTT.
    pub local_ssrc: Option<u32>,
    /// Clock rate for streams whose payload type has no registered codec.
    pub default_clock_rate_hz: u32,
    pub stats_log_interval_ms: i64,
    pub scratch_capacity: usize,
    pub codecs: Vec<CodecDescriptor>,
    /// (RTX payload type, original payload type).
    pub rtx: Vec<(u8, u8)>,
    pub header_extensions: Vec<(ExtensionKind, u8)>,
}

impl Default for ReceiverConfig {
    fn default() -> Self {
        Self {
            version: CONFIG_VERSION,
            nack_enabled: false,
            max_reordering_threshold: DEFAULT_MAX_REORDERING_THRESHOLD,
            use_rtx_payload_mapping_on_restore: false,
            rtx_ssrc: None,
            local_ssrc: None,
            default_clock_rate_hz: DEFAULT_CLOCK_RATE_HZ,
            stats_log_interval_ms: DEFAULT_STATS_LOG_INTERVAL_MS,
            scratch_capacity: IP_PACKET_SIZE,
            codecs: Vec::new(),
            rtx: Vec::new(),
            header_extensions: Vec::new(),
        }
    }
}

impl ReceiverConfigInput {
    pub fn resolve(self) -> Result<ReceiverConfig, ConfigError> {
        let version = if self.version == 0 {
            CONFIG_VERSION
        } else {
            self.version
        };
        if version != CONFIG_VERSION {
            return Err(ConfigError::UnsupportedVersion(version));
        }
        let defaults = ReceiverConfig::default();
        let default_clock_rate_hz = self
            .default_clock_rate_hz
            .filter(|rate| *rate > 0)
            .unwrap_or(defaults.default_clock_rate_hz);

        // Dry-run the registry so conflicts surface here, not at start-up.
        let mut registry = PayloadRegistry::new();
        let mut codecs = Vec::with_capacity(self.codecs.len());
        for codec in self.codecs {
            let descriptor = CodecDescriptor {
                name: CompactString::from(codec.name.trim()),
                payload_type: codec.payload_type,
                clock_rate_hz: codec.clock_rate_hz.unwrap_or(default_clock_rate_hz),
                max_bitrate_kbps: codec.max_bitrate_kbps.unwrap_or(0),
            };
            registry.register_codec(descriptor.clone())?;
            codecs.push(descriptor);
        }

        let mut rtx = Vec::with_capacity(self.rtx.len());
        for mapping in self.rtx {
            registry.set_rtx_mapping(mapping.payload_type, mapping.associated_payload_type)?;
            rtx.push((mapping.payload_type, mapping.associated_payload_type));
        }

        let mut extension_map = ExtensionMap::new();
        let mut header_extensions = Vec::with_capacity(self.header_extensions.len());
        for ext in self.header_extensions {
            let uri = ext.uri.trim();
            let kind = ExtensionKind::from_uri(uri)
                .ok_or_else(|| ConfigError::UnknownHeaderExtension(uri.to_string()))?;
            extension_map.register(kind, ext.id)?;
            header_extensions.push((kind, ext.id));
        }

        Ok(ReceiverConfig {
            version,
            nack_enabled: self.nack_enabled.unwrap_or(defaults.nack_enabled),
            max_reordering_threshold: self
                .max_reordering_threshold
                .unwrap_or(defaults.max_reordering_threshold)
                .min(MAX_REORDERING_THRESHOLD),
            use_rtx_payload_mapping_on_restore: self
                .use_rtx_payload_mapping_on_restore
                .unwrap_or(defaults.use_rtx_payload_mapping_on_restore),
            rtx_ssrc: self.rtx_ssrc,
            local_ssrc: self.local_ssrc,
            default_clock_rate_hz,
            stats_log_interval_ms: self
                .stats_log_interval_ms
                .unwrap_or(defaults.stats_log_interval_ms)
                .max(1),
            scratch_capacity: self
                .scratch_capacity
                .unwrap_or(defaults.scratch_capacity)
                .max(crate::wire::FIXED_HEADER_LEN),
            codecs,
            rtx,
            header_extensions,
        })
    }
}

impl ReceiverConfig {
    pub fn from_toml_str(input: &str) -> Result<Self, ConfigError> {
        if input.trim().is_empty() {
            return ReceiverConfigInput::default().resolve();
        }
        let parsed: ReceiverConfigInput =
            toml::from_str(input).map_err(|e| ConfigError::Parse(e.to_string()))?;
        parsed.resolve()
    }

    pub fn from_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading receiver config {}", path.display()))?;
        Self::from_toml_str(&text).with_context(|| format!("resolving {}", path.display()))
    }

    /// Reordering window in effect: 0 while NACK is off.
    pub fn effective_threshold(&self) -> u16 {
        if self.nack_enabled {
            self.max_reordering_threshold
        } else {
            0
        }
    }
}
