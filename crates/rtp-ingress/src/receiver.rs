//! # Packet Receiver
//!
//! Pure logic, no I/O. Accepts raw RTP/RTCP datagrams from the transport,
//! unwraps RTX and RED, classifies ordering, records statistics and hands
//! the media payload to the decoder.
//!
//! ## Per-packet flow
//!
//! 1. **Parse** the outer header (`ParseError` on failure)
//! 2. **Gate** on the receiving flag (`NotReceiving`)
//! 3. **Bandwidth estimator** sees the outer packet, whatever happens next
//! 4. **Encapsulation**: RTX is restored through the scratch buffer, RED is
//!    split into FEC blocks (to the FEC receiver) and the primary media block;
//!    restored packets re-enter the flow, at most two levels deep
//! 5. **Classify** against the stream's highest sequence and record stats
//! 6. **Dispatch** payload + header to the decoder; a negative status fails
//!    the call
//!
//! ## Locking
//!
//! - The receiving flag, the scratch buffer and the periodic-log gate share one
//!   critical section (`section`), held only for O(1) bookkeeping.
//! - Configuration is an immutable [`Settings`] snapshot behind `arc-swap`;
//!   each packet loads it once, writers clone-modify-store under `settings_writer`.
//! - Stream state is under `streams`; statistics are recorded while it is
//!   held so one stream's updates are serialized.
//! - Observer callbacks run after the stream lock is released.

use std::collections::HashMap;
use std::sync::Arc;

use arc_swap::ArcSwap;
use bytes::Bytes;
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info, trace, warn};

use crate::clock::{compact_ntp_to_ms, ms_to_compact_ntp, ClockEstimator, WallClock};
use crate::config::ReceiverConfig;
use crate::error::{ClockError, ConfigError, DropReason};
use crate::observer::{
    ObserverSlot, RtcpPacketTypeCounter, RtcpPacketTypeCounterObserver, RttObserver,
    StreamObserver,
};
use crate::ordering::{extend_sequence, SequenceTracker, Verdict, MAX_REORDERING_THRESHOLD};
use crate::payload::{CodecDescriptor, PayloadRegistry};
use crate::pool::{ScratchGuard, ScratchSlot, SlotHost};
use crate::rtcp::{parse_compound, ReportBlock, RtcpPacket};
use crate::stats::{Ewma, PacketSample, PeriodicLog, ReceiveStatistics, StreamStatistics};
use crate::wire::{
    rebuild_red_block, restore_rtx, restored_rtx_len, split_red, ExtensionKind, ExtensionMap,
    RedBlock, RtpHeader, RTX_HEADER_LEN,
};

/// Deepest wrapper nesting unwrapped (e.g. RED carrying RTX).
pub const MAX_ENCAPSULATION_DEPTH: usize = 2;

/// Smoothing factor for the reported average RTT.
const RTT_ALPHA: f64 = 0.125;

// ─── Collaborators ──────────────────────────────────────────────────────────

/// What the decoder receives alongside the payload.
#[derive(Debug, Clone)]
pub struct PacketInfo {
    pub header: RtpHeader,
    pub verdict: Verdict,
    pub arrival_ms: i64,
    /// Sender wall-clock time of this frame, once an SR has been seen.
    pub ntp_time_ms: Option<i64>,
    pub restored_from_rtx: bool,
    pub recovered: bool,
}

/// Accepts media payloads. A negative status is reported as
/// [`DropReason::DecoderRejected`].
pub trait PayloadSink: Send + Sync {
    fn on_received_payload_data(&self, payload: &[u8], info: &PacketInfo) -> i32;
}

/// Receives one sample per incoming RTP datagram, before any unwrapping.
pub trait BandwidthEstimator: Send + Sync {
    fn incoming_packet(&self, arrival_ms: i64, payload_len: usize, header: &RtpHeader);
}

/// The FEC decoder. Recovered packets come back through
/// [`PacketReceiver::on_recovered_packet`].
pub trait FecReceiver: Send + Sync {
    /// A ULPFEC block taken out of a RED packet.
    fn on_fec_packet(&self, red_header: &RtpHeader, block: &RedBlock);

    /// A media packet rebuilt from a RED primary block, kept as protection
    /// input for later recovery.
    fn on_protected_media(&self, _packet: &[u8], _header: &RtpHeader) {}
}

/// Externally owned collaborators, borrowed for the receiver's lifetime.
#[derive(Clone)]
pub struct Collaborators {
    pub payload_sink: Arc<dyn PayloadSink>,
    pub bandwidth_estimator: Arc<dyn BandwidthEstimator>,
    pub fec_receiver: Option<Arc<dyn FecReceiver>>,
}

impl Collaborators {
    pub fn new(
        payload_sink: Arc<dyn PayloadSink>,
        bandwidth_estimator: Arc<dyn BandwidthEstimator>,
    ) -> Self {
        Collaborators {
            payload_sink,
            bandwidth_estimator,
            fec_receiver: None,
        }
    }

    pub fn with_fec_receiver(mut self, fec_receiver: Arc<dyn FecReceiver>) -> Self {
        self.fec_receiver = Some(fec_receiver);
        self
    }
}

// ─── Results ────────────────────────────────────────────────────────────────

/// Successful outcome of delivering one RTP datagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Payload handed to the decoder.
    Dispatched { verdict: Verdict, status: i32 },
    /// RTX packet with nothing but padding (bandwidth probing).
    PaddingOnly,
    /// RED/ULPFEC packet whose content all went to the FEC receiver.
    FecOnly,
}

impl Delivery {
    pub fn verdict(&self) -> Option<Verdict> {
        match self {
            Delivery::Dispatched { verdict, .. } => Some(*verdict),
            _ => None,
        }
    }
}

/// What one compound RTCP datagram contained.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RtcpSummary {
    pub sender_reports: usize,
    pub receiver_reports: usize,
    pub nacks: usize,
    pub plis: usize,
    pub firs: usize,
    pub byes: usize,
    pub skipped: usize,
    /// Latest RTT sample from a report block addressed to us.
    pub rtt_ms: Option<i64>,
}

/// Read-only view of one stream's ordering state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StreamSnapshot {
    pub ssrc: u32,
    pub highest_ext_seq: Option<i64>,
    pub last_media_payload_type: Option<u8>,
    pub last_activity_ms: i64,
}

// ─── Internal State ─────────────────────────────────────────────────────────

/// Configuration snapshot read once per packet.
#[derive(Debug, Clone)]
struct Settings {
    registry: PayloadRegistry,
    extensions: ExtensionMap,
    nack_enabled: bool,
    max_reordering_threshold: u16,
    use_rtx_payload_mapping_on_restore: bool,
    rtx_ssrc: Option<u32>,
    local_ssrc: Option<u32>,
    default_clock_rate_hz: u32,
}

impl Settings {
    fn threshold(&self) -> u16 {
        if self.nack_enabled {
            self.max_reordering_threshold
        } else {
            0
        }
    }

    /// A restored packet may still carry the RTX SSRC when no media SSRC is
    /// known yet, so only the payload type can mark it as RTX again.
    fn is_rtx(&self, header: &RtpHeader, origin: Origin) -> bool {
        self.registry.is_rtx(header.payload_type)
            || (origin != Origin::Rtx && self.rtx_ssrc == Some(header.ssrc))
    }

    fn clock_rate(&self, payload_type: u8) -> u32 {
        self.registry
            .clock_rate(payload_type)
            .unwrap_or(self.default_clock_rate_hz)
    }
}

/// Fields that only change inside the receive critical section.
struct ReceiveSection {
    receiving: bool,
    scratch: ScratchSlot,
    log_gate: PeriodicLog,
}

impl SlotHost for Mutex<ReceiveSection> {
    fn with_slot<R>(&self, f: impl FnOnce(&mut ScratchSlot) -> R) -> R {
        f(&mut self.lock().scratch)
    }
}

#[derive(Debug, Default)]
struct StreamState {
    tracker: SequenceTracker,
    last_media_payload_type: Option<u8>,
    last_activity_ms: i64,
}

#[derive(Debug, Default)]
struct StreamTable {
    streams: HashMap<u32, StreamState>,
    remote_ssrc: Option<u32>,
    csrcs: Vec<u32>,
}

#[derive(Debug, Default)]
struct FeedbackCounter {
    counter: RtcpPacketTypeCounter,
    /// Newest NACKed sequence, for telling repeat requests from new ones.
    newest_nacked: Option<i64>,
}

struct RttState {
    avg: Ewma,
    max_ms: i64,
}

/// How a packet reached classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Origin {
    Network,
    Rtx,
    Recovered,
}

// ─── Receiver ───────────────────────────────────────────────────────────────

/// Receive-side RTP pipeline for one media session.
pub struct PacketReceiver {
    collaborators: Collaborators,
    clock: WallClock,
    section: Mutex<ReceiveSection>,
    settings: ArcSwap<Settings>,
    settings_writer: Mutex<()>,
    streams: Mutex<StreamTable>,
    clocks: Mutex<HashMap<u32, ClockEstimator>>,
    statistics: ReceiveStatistics,
    feedback: Mutex<HashMap<u32, FeedbackCounter>>,
    rtt: Mutex<RttState>,
    packet_type_observer: ObserverSlot<dyn RtcpPacketTypeCounterObserver>,
    rtt_observer: ObserverSlot<dyn RttObserver>,
    stream_observer: ObserverSlot<dyn StreamObserver>,
}

impl PacketReceiver {
    /// Build a receiver on real time. It starts stopped.
    pub fn new(config: ReceiverConfig, collaborators: Collaborators) -> Result<Self, ConfigError> {
        Self::with_clock(config, collaborators, WallClock::new())
    }

    pub fn with_clock(
        config: ReceiverConfig,
        collaborators: Collaborators,
        clock: WallClock,
    ) -> Result<Self, ConfigError> {
        let receiver = PacketReceiver {
            collaborators,
            clock,
            section: Mutex::new(ReceiveSection {
                receiving: false,
                scratch: ScratchSlot::new(config.scratch_capacity),
                log_gate: PeriodicLog::new(config.stats_log_interval_ms),
            }),
            settings: ArcSwap::from_pointee(Settings {
                registry: PayloadRegistry::new(),
                extensions: ExtensionMap::new(),
                nack_enabled: false,
                max_reordering_threshold: 0,
                use_rtx_payload_mapping_on_restore: false,
                rtx_ssrc: None,
                local_ssrc: None,
                default_clock_rate_hz: config.default_clock_rate_hz,
            }),
            settings_writer: Mutex::new(()),
            streams: Mutex::new(StreamTable::default()),
            clocks: Mutex::new(HashMap::new()),
            statistics: ReceiveStatistics::new(),
            feedback: Mutex::new(HashMap::new()),
            rtt: Mutex::new(RttState {
                avg: Ewma::new(RTT_ALPHA),
                max_ms: 0,
            }),
            packet_type_observer: ObserverSlot::new(),
            rtt_observer: ObserverSlot::new(),
            stream_observer: ObserverSlot::new(),
        };

        for codec in config.codecs {
            receiver.set_receive_codec(codec)?;
        }
        for (rtx_payload_type, original) in config.rtx {
            receiver.set_rtx_payload_type(rtx_payload_type, original)?;
        }
        for (kind, id) in config.header_extensions {
            receiver.enable_receive_rtp_header_extension(kind.uri(), id)?;
        }
        receiver.set_nack_status(config.nack_enabled, config.max_reordering_threshold);
        receiver.set_use_rtx_payload_mapping_on_restore(config.use_rtx_payload_mapping_on_restore);
        if let Some(ssrc) = config.rtx_ssrc {
            receiver.set_rtx_ssrc(ssrc);
        }
        if let Some(ssrc) = config.local_ssrc {
            receiver.set_local_ssrc(ssrc);
        }
        Ok(receiver)
    }

    // ─── Lifecycle ──────────────────────────────────────────────────────

    pub fn start_receive(&self) {
        self.section.lock().receiving = true;
    }

    /// Stop admitting packets. Calls already past the receiving check finish.
    pub fn stop_receive(&self) {
        self.section.lock().receiving = false;
    }

    pub fn is_receiving(&self) -> bool {
        self.section.lock().receiving
    }

    // ─── Configuration ──────────────────────────────────────────────────

    fn update_settings<R>(
        &self,
        f: impl FnOnce(&mut Settings) -> Result<R, ConfigError>,
    ) -> Result<R, ConfigError> {
        let _writer = self.settings_writer.lock();
        let mut next = Settings::clone(&self.settings.load());
        let result = f(&mut next)?;
        self.settings.store(Arc::new(next));
        Ok(result)
    }

    /// Register a receive codec. A `ulpfec` codec enables FEC handling.
    pub fn set_receive_codec(&self, codec: CodecDescriptor) -> Result<(), ConfigError> {
        let name = codec.name.clone();
        let payload_type = codec.payload_type;
        self.update_settings(|s| s.registry.register_codec(codec))
            .inspect(|_| debug!(codec = %name, payload_type, "receive codec registered"))
            .inspect_err(|e| warn!(codec = %name, payload_type, error = %e, "receive codec rejected"))
    }

    /// Enable NACK with a reordering window, or disable both.
    pub fn set_nack_status(&self, enabled: bool, max_reordering_threshold: u16) {
        let _ = self.update_settings(|s| {
            s.nack_enabled = enabled;
            s.max_reordering_threshold = max_reordering_threshold.min(MAX_REORDERING_THRESHOLD);
            Ok(())
        });
    }

    pub fn set_rtx_payload_type(
        &self,
        rtx_payload_type: u8,
        original_payload_type: u8,
    ) -> Result<(), ConfigError> {
        self.update_settings(|s| s.registry.set_rtx_mapping(rtx_payload_type, original_payload_type))
            .inspect_err(|e| warn!(rtx_payload_type, original_payload_type, error = %e, "rtx mapping rejected"))
    }

    pub fn set_use_rtx_payload_mapping_on_restore(&self, enabled: bool) {
        let _ = self.update_settings(|s| {
            s.use_rtx_payload_mapping_on_restore = enabled;
            Ok(())
        });
    }

    pub fn set_rtx_ssrc(&self, ssrc: u32) {
        let _ = self.update_settings(|s| {
            s.rtx_ssrc = Some(ssrc);
            Ok(())
        });
    }

    pub fn get_rtx_ssrc(&self) -> Option<u32> {
        self.settings.load().rtx_ssrc
    }

    /// Our own SSRC, used to pick RR blocks that carry RTT for us.
    pub fn set_local_ssrc(&self, ssrc: u32) {
        let _ = self.update_settings(|s| {
            s.local_ssrc = Some(ssrc);
            Ok(())
        });
    }

    pub fn enable_receive_rtp_header_extension(&self, uri: &str, id: u8) -> Result<(), ConfigError> {
        let kind = ExtensionKind::from_uri(uri)
            .ok_or_else(|| ConfigError::UnknownHeaderExtension(uri.to_string()))
            .inspect_err(|e| warn!(uri, id, error = %e, "header extension rejected"))?;
        self.update_settings(|s| s.extensions.register(kind, id))
            .inspect_err(|e| warn!(uri, id, error = %e, "header extension rejected"))
    }

    pub fn is_fec_enabled(&self) -> bool {
        self.settings.load().registry.ulpfec_payload_type().is_some()
    }

    // ─── Observers ──────────────────────────────────────────────────────
    //
    // Callbacks run under their slot's lock. Registering on the same slot
    // from inside a callback deadlocks.

    pub fn register_packet_type_counter_observer(
        &self,
        observer: Option<Arc<dyn RtcpPacketTypeCounterObserver>>,
    ) {
        self.packet_type_observer.set(observer);
    }

    pub fn register_rtt_observer(&self, observer: Option<Arc<dyn RttObserver>>) {
        self.rtt_observer.set(observer);
    }

    pub fn register_stream_observer(&self, observer: Option<Arc<dyn StreamObserver>>) {
        self.stream_observer.set(observer);
    }

    // ─── Accessors ──────────────────────────────────────────────────────

    pub fn remote_ssrc(&self) -> Option<u32> {
        self.streams.lock().remote_ssrc
    }

    pub fn get_csrcs(&self) -> Vec<u32> {
        self.streams.lock().csrcs.clone()
    }

    pub fn stream_state(&self, ssrc: u32) -> Option<StreamSnapshot> {
        self.streams.lock().streams.get(&ssrc).map(|s| StreamSnapshot {
            ssrc,
            highest_ext_seq: s.tracker.highest(),
            last_media_payload_type: s.last_media_payload_type,
            last_activity_ms: s.last_activity_ms,
        })
    }

    pub fn receive_statistics(&self) -> &ReceiveStatistics {
        &self.statistics
    }

    pub fn stream_statistics(&self, ssrc: u32) -> Option<StreamStatistics> {
        self.statistics.snapshot(ssrc, self.clock.now_ms())
    }

    pub fn rtcp_packet_type_counter(&self, ssrc: u32) -> Option<RtcpPacketTypeCounter> {
        self.feedback.lock().get(&ssrc).map(|f| f.counter)
    }

    /// Sender wall-clock time for an RTP timestamp of `ssrc`.
    pub fn estimate_ntp_ms(&self, ssrc: u32, rtp_timestamp: u32) -> Result<i64, ClockError> {
        self.clocks
            .lock()
            .get(&ssrc)
            .ok_or(ClockError::Unavailable)?
            .estimate(rtp_timestamp)
    }

    /// Scratch acquisitions refused because the buffer was in use.
    pub fn scratch_busy_rejections(&self) -> u64 {
        self.section.lock().scratch.busy_rejections()
    }

    // ─── RTP ────────────────────────────────────────────────────────────

    /// Deliver one RTP datagram. `arrival_ms` defaults to the receiver's clock.
    pub fn deliver_rtp(&self, packet: Bytes, arrival_ms: Option<i64>) -> Result<Delivery, DropReason> {
        let arrival_ms = arrival_ms.unwrap_or_else(|| self.clock.now_ms());
        let settings = self.settings.load_full();
        let header = RtpHeader::decode(&packet, &settings.extensions).ok_or_else(|| {
            trace!(len = packet.len(), "dropping malformed rtp packet");
            DropReason::ParseError
        })?;

        let log_due = {
            let mut section = self.section.lock();
            if !section.receiving {
                return Err(DropReason::NotReceiving);
            }
            section.log_gate.due(arrival_ms)
        };
        if log_due {
            self.log_periodic(&header, arrival_ms);
        }

        self.collaborators
            .bandwidth_estimator
            .incoming_packet(arrival_ms, header.payload_len, &header);

        self.process(&settings, packet, header, arrival_ms, 0, Origin::Network)
            .inspect_err(|reason| {
                debug!(arrival_ms, reason = %reason, "rtp packet dropped");
            })
    }

    /// Entry point for packets rebuilt by the FEC receiver. Not gated on
    /// the receiving flag and not fed to the bandwidth estimator.
    pub fn on_recovered_packet(&self, packet: Bytes) -> Result<Delivery, DropReason> {
        let arrival_ms = self.clock.now_ms();
        let settings = self.settings.load_full();
        let header =
            RtpHeader::decode(&packet, &settings.extensions).ok_or(DropReason::ParseError)?;
        self.process(&settings, packet, header, arrival_ms, 0, Origin::Recovered)
    }

    fn process(
        &self,
        settings: &Settings,
        packet: Bytes,
        header: RtpHeader,
        arrival_ms: i64,
        depth: usize,
        origin: Origin,
    ) -> Result<Delivery, DropReason> {
        if settings.is_rtx(&header, origin) {
            self.unwrap_rtx(settings, packet, header, arrival_ms, depth)
        } else if settings.registry.is_red(header.payload_type) {
            self.unwrap_red(settings, packet, header, arrival_ms, depth, origin)
        } else if settings.registry.is_ulpfec(header.payload_type) {
            self.forward_bare_fec(packet, header)
        } else {
            self.accept(settings, packet, header, arrival_ms, origin)
        }
    }

    fn check_depth(depth: usize) -> Result<(), DropReason> {
        if depth >= MAX_ENCAPSULATION_DEPTH {
            return Err(DropReason::EncapsulationTooDeep(MAX_ENCAPSULATION_DEPTH));
        }
        Ok(())
    }

    fn unwrap_rtx(
        &self,
        settings: &Settings,
        packet: Bytes,
        header: RtpHeader,
        arrival_ms: i64,
        depth: usize,
    ) -> Result<Delivery, DropReason> {
        if header.payload_len == 0 {
            trace!(ssrc = header.ssrc, seq = header.sequence_number, "rtx padding packet");
            return Ok(Delivery::PaddingOnly);
        }
        if header.payload_len < RTX_HEADER_LEN {
            return Err(DropReason::ParseError);
        }
        Self::check_depth(depth)?;

        let (original_ssrc, last_known) = {
            let table = self.streams.lock();
            let ssrc = table.remote_ssrc.unwrap_or(header.ssrc);
            let last = table
                .streams
                .get(&ssrc)
                .and_then(|s| s.last_media_payload_type);
            (ssrc, last)
        };
        let original_payload_type = settings.registry.resolve_original(
            header.payload_type,
            settings.use_rtx_payload_mapping_on_restore,
            last_known,
        )?;

        let restored_len = restored_rtx_len(&header, &packet).ok_or(DropReason::ParseError)?;
        let guard = ScratchGuard::acquire(&self.section).inspect_err(|_| {
            warn!(ssrc = header.ssrc, seq = header.sequence_number, "multiple rtx headers detected, dropping packet");
        })?;
        let guard = guard.fill(restored_len, |out| {
            restore_rtx(&packet, &header, original_ssrc, original_payload_type, out)
        })?;
        // Released here, before the restored packet re-enters the pipeline.
        let restored = guard.detach();

        let inner =
            RtpHeader::decode(&restored, &settings.extensions).ok_or(DropReason::ParseError)?;
        trace!(
            rtx_ssrc = header.ssrc,
            ssrc = inner.ssrc,
            seq = inner.sequence_number,
            payload_type = inner.payload_type,
            "rtx packet restored"
        );
        self.process(settings, restored, inner, arrival_ms, depth + 1, Origin::Rtx)
    }

    fn unwrap_red(
        &self,
        settings: &Settings,
        packet: Bytes,
        header: RtpHeader,
        arrival_ms: i64,
        depth: usize,
        origin: Origin,
    ) -> Result<Delivery, DropReason> {
        Self::check_depth(depth)?;
        let payload = packet.slice(header.header_len..header.header_len + header.payload_len);
        let blocks = split_red(&payload).ok_or(DropReason::ParseError)?;

        let mut media = None;
        let mut fec_dropped = false;
        for block in &blocks {
            if settings.registry.is_ulpfec(block.payload_type) {
                match &self.collaborators.fec_receiver {
                    Some(fec) => {
                        fec.on_fec_packet(&header, block);
                        self.statistics.record_fec(header.ssrc);
                    }
                    None => fec_dropped = true,
                }
            } else if block.primary {
                let rebuilt = rebuild_red_block(&packet, &header, block).freeze();
                let inner = RtpHeader::decode(&rebuilt, &settings.extensions)
                    .ok_or(DropReason::ParseError)?;
                if let Some(fec) = &self.collaborators.fec_receiver {
                    fec.on_protected_media(&rebuilt, &inner);
                }
                media = Some((rebuilt, inner));
            }
        }

        match media {
            Some((rebuilt, inner)) => self.process(settings, rebuilt, inner, arrival_ms, depth + 1, origin),
            None if fec_dropped => Err(DropReason::NoFecReceiver),
            None => Ok(Delivery::FecOnly),
        }
    }

    /// ULPFEC sent on its own payload type rather than inside RED.
    fn forward_bare_fec(&self, packet: Bytes, header: RtpHeader) -> Result<Delivery, DropReason> {
        let fec = self
            .collaborators
            .fec_receiver
            .as_ref()
            .ok_or(DropReason::NoFecReceiver)?;
        let block = RedBlock {
            payload_type: header.payload_type,
            timestamp_offset: 0,
            data: packet.slice(header.header_len..header.header_len + header.payload_len),
            primary: true,
        };
        fec.on_fec_packet(&header, &block);
        self.statistics.record_fec(header.ssrc);
        Ok(Delivery::FecOnly)
    }

    fn accept(
        &self,
        settings: &Settings,
        packet: Bytes,
        header: RtpHeader,
        arrival_ms: i64,
        origin: Origin,
    ) -> Result<Delivery, DropReason> {
        let clock_rate_hz = settings.clock_rate(header.payload_type);
        let threshold = settings.threshold();

        let (classification, ssrc_changed, csrcs_changed) = {
            let mut table = self.streams.lock();
            let stream = table.streams.entry(header.ssrc).or_default();
            let classification = match origin {
                Origin::Recovered => stream.tracker.classify_recovered(header.sequence_number, threshold),
                Origin::Rtx => stream.tracker.classify(header.sequence_number, true, threshold),
                Origin::Network => stream.tracker.classify(header.sequence_number, false, threshold),
            };
            stream.last_activity_ms = arrival_ms;
            if origin == Origin::Network {
                stream.last_media_payload_type = Some(header.payload_type);
            }

            let sample = PacketSample {
                classification,
                bytes: packet.len(),
                rtp_timestamp: header.timestamp,
                arrival_ms,
                clock_rate_hz,
            };
            if classification.verdict == Verdict::Recovered {
                self.statistics.record_recovered(header.ssrc, &sample);
            } else {
                self.statistics.record_accepted(header.ssrc, &sample);
            }

            let ssrc_changed = table.remote_ssrc != Some(header.ssrc);
            if ssrc_changed {
                table.remote_ssrc = Some(header.ssrc);
            }
            let csrcs_changed =
                classification.verdict.is_in_order() && table.csrcs != header.csrcs;
            if csrcs_changed {
                table.csrcs = header.csrcs.clone();
            }
            (classification, ssrc_changed, csrcs_changed)
        };

        if ssrc_changed {
            debug!(ssrc = header.ssrc, "incoming ssrc changed");
            self.stream_observer
                .with(|o| o.on_incoming_ssrc_changed(header.ssrc));
        }
        if csrcs_changed {
            self.stream_observer
                .with(|o| o.on_incoming_csrcs_changed(&header.csrcs));
        }

        let ntp_time_ms = {
            let mut clocks = self.clocks.lock();
            let estimator = clocks
                .entry(header.ssrc)
                .or_insert_with(|| ClockEstimator::new(clock_rate_hz));
            estimator.set_clock_rate(clock_rate_hz);
            estimator.estimate(header.timestamp).ok()
        };

        let verdict = classification.verdict;
        trace!(
            ssrc = header.ssrc,
            seq = header.sequence_number,
            ext_seq = classification.extended_seq,
            ?verdict,
            "rtp packet classified"
        );

        let info = PacketInfo {
            verdict,
            arrival_ms,
            ntp_time_ms,
            restored_from_rtx: origin == Origin::Rtx,
            recovered: origin == Origin::Recovered,
            header,
        };
        let status = self
            .collaborators
            .payload_sink
            .on_received_payload_data(info.header.payload(&packet), &info);
        if status < 0 {
            return Err(DropReason::DecoderRejected(status));
        }
        Ok(Delivery::Dispatched { verdict, status })
    }

    fn log_periodic(&self, header: &RtpHeader, now_ms: i64) {
        let all = self.statistics.snapshot_all(now_ms);
        let packets: u64 = all.iter().map(|s| s.packets).sum();
        let lost: i64 = all.iter().map(|s| s.cumulative_lost).sum();
        let retransmitted: u64 = all.iter().map(|s| s.retransmitted).sum();
        info!(
            ssrc = header.ssrc,
            seq = header.sequence_number,
            payload_type = header.payload_type,
            timestamp = header.timestamp,
            streams = all.len(),
            packets,
            lost,
            retransmitted,
            "rtp receive summary"
        );
    }

    // ─── RTCP ───────────────────────────────────────────────────────────

    /// Deliver one compound RTCP datagram.
    pub fn deliver_rtcp(&self, packet: &[u8]) -> Result<RtcpSummary, DropReason> {
        if !self.section.lock().receiving {
            return Err(DropReason::NotReceiving);
        }
        let compound = parse_compound(packet).ok_or_else(|| {
            trace!(len = packet.len(), "dropping malformed rtcp packet");
            DropReason::ParseError
        })?;
        let settings = self.settings.load_full();
        let now_ms = self.clock.now_ms();

        let mut summary = RtcpSummary {
            skipped: compound.skipped,
            ..Default::default()
        };
        let mut rtt_samples = Vec::new();
        let mut updated_counters = Vec::new();

        for rtcp in compound.packets {
            match rtcp {
                RtcpPacket::SenderReport(sr) => {
                    summary.sender_reports += 1;
                    let taken = self
                        .clocks
                        .lock()
                        .entry(sr.sender_ssrc)
                        .or_insert_with(|| ClockEstimator::new(settings.default_clock_rate_hz))
                        .ingest(sr.rtp_timestamp, sr.ntp_ms());
                    trace!(ssrc = sr.sender_ssrc, rtp_ts = sr.rtp_timestamp, taken, "sender report");
                    rtt_samples.extend(self.rtt_from_blocks(&settings, &sr.reports, now_ms));
                }
                RtcpPacket::ReceiverReport(rr) => {
                    summary.receiver_reports += 1;
                    rtt_samples.extend(self.rtt_from_blocks(&settings, &rr.reports, now_ms));
                }
                RtcpPacket::Nack(nack) => {
                    summary.nacks += 1;
                    let mut feedback = self.feedback.lock();
                    let entry = feedback.entry(nack.media_ssrc).or_default();
                    entry.counter.nack_packets += 1;
                    for seq in &nack.lost {
                        entry.counter.nack_requests += 1;
                        let ext = match entry.newest_nacked {
                            Some(newest) => extend_sequence(*seq, newest),
                            None => *seq as i64,
                        };
                        if entry.newest_nacked.map_or(true, |newest| ext > newest) {
                            entry.counter.unique_nack_requests += 1;
                            entry.newest_nacked = Some(ext);
                        }
                    }
                    updated_counters.push((nack.media_ssrc, entry.counter));
                }
                RtcpPacket::Pli(pli) => {
                    summary.plis += 1;
                    let mut feedback = self.feedback.lock();
                    let entry = feedback.entry(pli.media_ssrc).or_default();
                    entry.counter.pli_packets += 1;
                    updated_counters.push((pli.media_ssrc, entry.counter));
                }
                RtcpPacket::Fir(fir) => {
                    summary.firs += 1;
                    let mut feedback = self.feedback.lock();
                    for e in &fir.entries {
                        let entry = feedback.entry(e.ssrc).or_default();
                        entry.counter.fir_packets += 1;
                        updated_counters.push((e.ssrc, entry.counter));
                    }
                }
                RtcpPacket::Goodbye(bye) => {
                    summary.byes += 1;
                    debug!(sources = ?bye.sources, "rtcp bye");
                }
            }
        }

        if let Some(&last) = rtt_samples.last() {
            let (avg_ms, max_ms) = {
                let mut rtt = self.rtt.lock();
                for sample in &rtt_samples {
                    rtt.avg.update(*sample as f64);
                    rtt.max_ms = rtt.max_ms.max(*sample);
                }
                (rtt.avg.value().round() as i64, rtt.max_ms)
            };
            summary.rtt_ms = Some(last);
            self.rtt_observer.with(|o| o.on_rtt_update(avg_ms, max_ms));
        }
        for (ssrc, counter) in updated_counters {
            self.packet_type_observer
                .with(|o| o.rtcp_packet_types_counter_updated(ssrc, &counter));
        }
        if summary.skipped > 0 {
            debug!(skipped = summary.skipped, "rtcp sections skipped");
        }
        Ok(summary)
    }

    /// RTT samples from report blocks about our own stream.
    fn rtt_from_blocks(&self, settings: &Settings, blocks: &[ReportBlock], now_ms: i64) -> Vec<i64> {
        let Some(local_ssrc) = settings.local_ssrc else {
            return Vec::new();
        };
        let now = ms_to_compact_ntp(now_ms);
        blocks
            .iter()
            .filter(|b| b.ssrc == local_ssrc && b.last_sr != 0)
            .map(|b| {
                let rtt = now
                    .wrapping_sub(b.last_sr)
                    .wrapping_sub(b.delay_since_last_sr);
                // A negative interval wraps to a huge one; treat it as minimal.
                if rtt > 0x8000_0000 {
                    1
                } else {
                    compact_ntp_to_ms(rtt).max(1)
                }
            })
            .collect()
    }
}
