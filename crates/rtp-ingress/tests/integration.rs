//! # Integration tests: transport bytes → PacketReceiver → decoder sink
//!
//! The "network" is a sequence of encoded datagrams handed straight to the
//! receiver. Collaborators are in-memory fakes that record what they see.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use rtp_ingress::clock::{ms_to_compact_ntp, WallClock};
use rtp_ingress::observer::{RtcpPacketTypeCounter, RtcpPacketTypeCounterObserver, RttObserver};
use rtp_ingress::ordering::Verdict;
use rtp_ingress::payload::CodecDescriptor;
use rtp_ingress::receiver::{BandwidthEstimator, FecReceiver, PacketInfo, PayloadSink};
use rtp_ingress::rtcp::{CompoundBuilder, ReportBlock, SenderReport};
use rtp_ingress::wire::{ExtensionKind, RedBlock, RtpHeader, RtpPacket};
use rtp_ingress::{Collaborators, ConfigError, Delivery, DropReason, PacketReceiver, ReceiverConfig};

// ─── Fakes ──────────────────────────────────────────────────────────────────

#[derive(Default)]
struct Decoder {
    frames: Mutex<Vec<(Vec<u8>, PacketInfo)>>,
}

impl PayloadSink for Decoder {
    fn on_received_payload_data(&self, payload: &[u8], info: &PacketInfo) -> i32 {
        self.frames.lock().push((payload.to_vec(), info.clone()));
        0
    }
}

#[derive(Default)]
struct Estimator {
    samples: Mutex<Vec<(i64, usize)>>,
}

impl BandwidthEstimator for Estimator {
    fn incoming_packet(&self, arrival_ms: i64, payload_len: usize, _header: &RtpHeader) {
        self.samples.lock().push((arrival_ms, payload_len));
    }
}

#[derive(Default)]
struct Fec {
    blocks: Mutex<Vec<Vec<u8>>>,
}

impl FecReceiver for Fec {
    fn on_fec_packet(&self, _red_header: &RtpHeader, block: &RedBlock) {
        self.blocks.lock().push(block.data.to_vec());
    }
}

#[derive(Default)]
struct RttLog {
    updates: Mutex<Vec<(i64, i64)>>,
}

impl RttObserver for RttLog {
    fn on_rtt_update(&self, avg_rtt_ms: i64, max_rtt_ms: i64) {
        self.updates.lock().push((avg_rtt_ms, max_rtt_ms));
    }
}

#[derive(Default)]
struct CounterLog {
    calls: AtomicUsize,
    last: Mutex<Option<(u32, RtcpPacketTypeCounter)>>,
}

impl RtcpPacketTypeCounterObserver for CounterLog {
    fn rtcp_packet_types_counter_updated(&self, ssrc: u32, counter: &RtcpPacketTypeCounter) {
        self.calls.fetch_add(1, Ordering::Relaxed);
        *self.last.lock() = Some((ssrc, *counter));
    }
}

// ─── Helpers ────────────────────────────────────────────────────────────────

const SSRC: u32 = 12345;
const NOW_NTP_MS: i64 = 3_950_000_000_000;

struct Session {
    rx: PacketReceiver,
    decoder: Arc<Decoder>,
    estimator: Arc<Estimator>,
    fec: Arc<Fec>,
    clock: Arc<quanta::Mock>,
}

/// Route receiver logs to the test output; `RUST_LOG=rtp_ingress=trace` to see them.
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

fn session(config: ReceiverConfig) -> Session {
    init_tracing();
    let decoder = Arc::new(Decoder::default());
    let estimator = Arc::new(Estimator::default());
    let fec = Arc::new(Fec::default());
    let collaborators =
        Collaborators::new(decoder.clone(), estimator.clone()).with_fec_receiver(fec.clone());
    let (wall, clock) = WallClock::mock(NOW_NTP_MS);
    let rx = PacketReceiver::with_clock(config, collaborators, wall).unwrap();
    rx.start_receive();
    Session {
        rx,
        decoder,
        estimator,
        fec,
        clock,
    }
}

fn config() -> ReceiverConfig {
    ReceiverConfig::from_toml_str(
        r#"
        nack_enabled = true
        max_reordering_threshold = 50
        use_rtx_payload_mapping_on_restore = true

        [[codecs]]
        name = "VP8"
        payload_type = 96

        [[codecs]]
        name = "red"
        payload_type = 116

        [[codecs]]
        name = "ulpfec"
        payload_type = 117

        [[rtx]]
        payload_type = 97
        associated_payload_type = 96
        "#,
    )
    .unwrap()
}

fn media(seq: u16, payload: &[u8]) -> RtpPacket {
    RtpPacket::new(
        RtpHeader::new(SSRC, seq, 1000 + seq as u32 * 3000, 96),
        Bytes::copy_from_slice(payload),
    )
}

fn wire(pkt: &RtpPacket) -> Bytes {
    pkt.encode().freeze()
}

// ─── Media & RTX ────────────────────────────────────────────────────────────

#[test]
fn rtx_retransmission_fills_nothing_and_counts_once() {
    let s = session(config());

    let d = s.rx.deliver_rtp(wire(&media(100, b"first")), None).unwrap();
    assert_eq!(d.verdict(), Some(Verdict::InOrder));

    let rtx = media(99, b"late").to_rtx(SSRC, 7, 97).freeze();
    let d = s.rx.deliver_rtp(rtx, None).unwrap();
    assert_eq!(d.verdict(), Some(Verdict::Retransmitted));

    let stats = s.rx.stream_statistics(SSRC).unwrap();
    assert_eq!(stats.packets, 2);
    assert_eq!(stats.retransmitted, 1);
    assert_eq!(stats.cumulative_lost, 0);
    assert_eq!(stats.highest_ext_seq, 100);

    let frames = s.decoder.frames.lock();
    assert_eq!(frames.len(), 2);
    assert_eq!(frames[1].0, b"late");
    assert_eq!(frames[1].1.header.payload_type, 96);
    assert_eq!(frames[1].1.header.ssrc, SSRC);
    assert!(frames[1].1.restored_from_rtx);
    assert_eq!(s.estimator.samples.lock().len(), 2);
}

#[test]
fn rtx_fills_a_reported_gap() {
    let s = session(config());
    s.rx.deliver_rtp(wire(&media(1, b"a")), None).unwrap();
    s.rx.deliver_rtp(wire(&media(3, b"c")), None).unwrap();
    assert_eq!(s.rx.stream_statistics(SSRC).unwrap().cumulative_lost, 1);

    let rtx = media(2, b"b").to_rtx(SSRC, 50, 97).freeze();
    s.rx.deliver_rtp(rtx, None).unwrap();
    assert_eq!(s.rx.stream_statistics(SSRC).unwrap().cumulative_lost, 0);
}

#[test]
fn rtx_payload_policy_follows_flag() {
    let mut cfg = config();
    cfg.use_rtx_payload_mapping_on_restore = false;
    cfg.rtx = vec![(97, 111)];
    let s = session(cfg);

    // Flag off: the last media payload type wins over the mapping.
    s.rx.deliver_rtp(wire(&media(10, b"m")), None).unwrap();
    let rtx = media(9, b"r").to_rtx(SSRC, 1, 97).freeze();
    s.rx.deliver_rtp(rtx.clone(), None).unwrap();
    assert_eq!(s.decoder.frames.lock()[1].1.header.payload_type, 96);

    // Flag on: the explicit mapping is used.
    s.rx.set_use_rtx_payload_mapping_on_restore(true);
    let rtx = media(8, b"r").to_rtx(SSRC, 2, 97).freeze();
    s.rx.deliver_rtp(rtx, None).unwrap();
    assert_eq!(s.decoder.frames.lock()[2].1.header.payload_type, 111);
}

#[test]
fn rtx_before_any_media_without_mapping_is_dropped() {
    let mut cfg = config();
    cfg.use_rtx_payload_mapping_on_restore = false;
    let s = session(cfg);
    let rtx = media(9, b"r").to_rtx(SSRC, 1, 97).freeze();
    assert_eq!(
        s.rx.deliver_rtp(rtx, None),
        Err(DropReason::UnknownPayloadType(97))
    );
    assert!(s.decoder.frames.lock().is_empty());
    // The estimator saw it anyway.
    assert_eq!(s.estimator.samples.lock().len(), 1);
}

#[test]
fn sequence_wrap_is_in_order() {
    let s = session(config());
    for seq in [65534u16, 65535, 0, 1] {
        let d = s.rx.deliver_rtp(wire(&media(seq, b"x")), None).unwrap();
        assert_eq!(d.verdict(), Some(Verdict::InOrder), "seq={seq}");
    }
    let stats = s.rx.stream_statistics(SSRC).unwrap();
    assert_eq!(stats.highest_ext_seq, 65536 + 1);
    assert_eq!(stats.cumulative_lost, 0);
}

#[test]
fn nack_disabled_treats_old_packets_as_stale() {
    let mut cfg = config();
    cfg.nack_enabled = false;
    let s = session(cfg);
    s.rx.deliver_rtp(wire(&media(20, b"x")), None).unwrap();
    let d = s.rx.deliver_rtp(wire(&media(19, b"y")), None).unwrap();
    assert_eq!(d.verdict(), Some(Verdict::Stale));
    // A stale packet is still decoded.
    assert_eq!(s.decoder.frames.lock().len(), 2);
}

#[test]
fn audio_level_extension_parsed_once_enabled() {
    let s = session(config());
    s.rx.enable_receive_rtp_header_extension(ExtensionKind::AudioLevel.uri(), 1)
        .unwrap();
    assert_eq!(
        s.rx.enable_receive_rtp_header_extension(ExtensionKind::AudioLevel.uri(), 15),
        Err(ConfigError::InvalidExtensionId(15))
    );

    // One-byte extension block: id 1, len 0 → 1 byte (V=1, level 42).
    let mut raw = media(5, b"opus").encode();
    raw[0] |= 0x10;
    let tail = raw.split_off(12);
    raw.extend_from_slice(&[0xBE, 0xDE, 0x00, 0x01, 0x10, 0x80 | 42, 0, 0]);
    raw.extend_from_slice(&tail);

    s.rx.deliver_rtp(raw.freeze(), None).unwrap();
    let frames = s.decoder.frames.lock();
    assert_eq!(frames[0].0, b"opus");
    let level = frames[0].1.header.extensions.audio_level.unwrap();
    assert!(level.voice_activity);
    assert_eq!(level.level, 42);
}

// ─── Gating ─────────────────────────────────────────────────────────────────

#[test]
fn receiver_starts_stopped_and_gates() {
    let decoder = Arc::new(Decoder::default());
    let estimator = Arc::new(Estimator::default());
    let (wall, _clock) = WallClock::mock(NOW_NTP_MS);
    let rx = PacketReceiver::with_clock(
        config(),
        Collaborators::new(decoder.clone(), estimator.clone()),
        wall,
    )
    .unwrap();
    assert!(!rx.is_receiving());
    assert_eq!(
        rx.deliver_rtp(wire(&media(1, b"x")), None),
        Err(DropReason::NotReceiving)
    );
    assert!(rx.stream_state(SSRC).is_none());

    rx.start_receive();
    assert!(rx.deliver_rtp(wire(&media(2, b"x")), None).is_ok());
    let stats_before = rx.stream_statistics(SSRC).unwrap();
    let state_before = rx.stream_state(SSRC).unwrap();
    assert_eq!(state_before.highest_ext_seq, Some(2));

    // Stopped: nothing about the stream moves, even for a newer packet.
    rx.stop_receive();
    assert_eq!(
        rx.deliver_rtp(wire(&media(3, b"x")), Some(NOW_NTP_MS + 500)),
        Err(DropReason::NotReceiving)
    );
    assert_eq!(rx.stream_statistics(SSRC).unwrap(), stats_before);
    assert_eq!(rx.stream_state(SSRC).unwrap(), state_before);
    assert_eq!(decoder.frames.lock().len(), 1);
    assert_eq!(estimator.samples.lock().len(), 1);

    // Restarted: the stream picks up where it left off.
    rx.start_receive();
    let d = rx.deliver_rtp(wire(&media(3, b"x")), None).unwrap();
    assert_eq!(d.verdict(), Some(Verdict::InOrder));
    let stats = rx.stream_statistics(SSRC).unwrap();
    assert_eq!(stats.highest_ext_seq, 3);
    assert_eq!(stats.packets, 2);
    assert_eq!(stats.cumulative_lost, 0);
    assert_eq!(rx.stream_state(SSRC).unwrap().highest_ext_seq, Some(3));
}

#[test]
fn recovered_packets_bypass_gate_and_are_idempotent() {
    let s = session(config());
    s.rx.deliver_rtp(wire(&media(10, b"a")), None).unwrap();
    s.rx.deliver_rtp(wire(&media(13, b"d")), None).unwrap();
    assert_eq!(s.rx.stream_statistics(SSRC).unwrap().cumulative_lost, 2);

    s.rx.stop_receive();
    let d = s.rx.on_recovered_packet(wire(&media(11, b"b"))).unwrap();
    assert_eq!(d.verdict(), Some(Verdict::Recovered));
    let again = s.rx.on_recovered_packet(wire(&media(11, b"b"))).unwrap();
    assert_eq!(again.verdict(), Some(Verdict::Duplicate));

    let stats = s.rx.stream_statistics(SSRC).unwrap();
    assert_eq!(stats.cumulative_lost, 1);
    assert_eq!(stats.recovered, 1);
    assert_eq!(s.estimator.samples.lock().len(), 2);
}

// ─── RED / ULPFEC ───────────────────────────────────────────────────────────

#[test]
fn red_splits_fec_and_media() {
    let s = session(config());
    // One redundant ULPFEC block ("parity") then the primary VP8 block.
    let mut payload = vec![0x80 | 117, 0x00, 0x00, 6, 96];
    payload.extend_from_slice(b"parity");
    payload.extend_from_slice(b"frame");
    let red = RtpPacket::new(RtpHeader::new(SSRC, 40, 5000, 116), Bytes::from(payload));

    let d = s.rx.deliver_rtp(wire(&red), None).unwrap();
    assert!(matches!(d, Delivery::Dispatched { .. }));
    assert_eq!(*s.fec.blocks.lock(), vec![b"parity".to_vec()]);

    let frames = s.decoder.frames.lock();
    assert_eq!(frames[0].0, b"frame");
    assert_eq!(frames[0].1.header.payload_type, 96);
    assert_eq!(frames[0].1.header.sequence_number, 40);
    assert_eq!(s.rx.stream_statistics(SSRC).unwrap().fec_packets, 1);
}

// ─── RTCP ───────────────────────────────────────────────────────────────────

#[test]
fn rtcp_round_trip_time_and_feedback() {
    let mut cfg = config();
    cfg.local_ssrc = Some(0xABCD);
    let s = session(cfg);
    let rtt = Arc::new(RttLog::default());
    let counters = Arc::new(CounterLog::default());
    s.rx.register_rtt_observer(Some(rtt.clone()));
    s.rx.register_packet_type_counter_observer(Some(counters.clone()));

    let sent_at = ms_to_compact_ntp(NOW_NTP_MS);
    s.clock.increment(Duration::from_millis(300));
    let block = ReportBlock {
        ssrc: 0xABCD,
        fraction_lost: 0,
        cumulative_lost: 0,
        extended_highest_seq: 1,
        jitter: 0,
        last_sr: sent_at,
        delay_since_last_sr: ms_to_compact_ntp(200),
    };
    let sr = SenderReport {
        sender_ssrc: SSRC,
        ntp_seconds: (NOW_NTP_MS / 1000) as u32,
        ntp_fraction: 0,
        rtp_timestamp: 1000,
        packet_count: 10,
        octet_count: 1000,
        reports: vec![block],
    };
    let compound = CompoundBuilder::new()
        .sender_report(&sr)
        .sdes_cname(SSRC, "peer@example")
        .nack(SSRC, 0xABCD, &[5, 6])
        .pli(SSRC, 0xABCD)
        .bye(&[SSRC])
        .build();

    let summary = s.rx.deliver_rtcp(&compound).unwrap();
    assert_eq!(summary.sender_reports, 1);
    assert_eq!(summary.nacks, 1);
    assert_eq!(summary.plis, 1);
    assert_eq!(summary.byes, 1);
    assert_eq!(summary.skipped, 1);
    let sample = summary.rtt_ms.unwrap();
    assert!((99..=101).contains(&sample), "rtt={sample}");

    let updates = rtt.updates.lock();
    assert_eq!(updates.len(), 1);
    assert_eq!(updates[0].1, sample);

    assert_eq!(counters.calls.load(Ordering::Relaxed), 2);
    let (ssrc, counter) = counters.last.lock().unwrap();
    assert_eq!(ssrc, 0xABCD);
    assert_eq!(counter.nack_requests, 2);
    assert_eq!(counter.pli_packets, 1);

    // SR time base now maps this stream's RTP timestamps.
    assert_eq!(s.rx.estimate_ntp_ms(SSRC, 1000 + 90_000), Ok(NOW_NTP_MS / 1000 * 1000 + 1000));
}

#[test]
fn garbage_rtcp_is_parse_error() {
    let s = session(config());
    assert_eq!(s.rx.deliver_rtcp(&[0xFF; 3]), Err(DropReason::ParseError));
}

// ─── Concurrency ────────────────────────────────────────────────────────────

#[test]
fn concurrent_rtx_never_corrupts() {
    const THREADS: u16 = 8;
    const PER_THREAD: u16 = 50;

    let s = session(config());
    s.rx.deliver_rtp(wire(&media(10_000, b"anchor")), None).unwrap();

    let outcomes: Vec<Result<Delivery, DropReason>> = std::thread::scope(|scope| {
        let handles: Vec<_> = (0..THREADS)
            .map(|t| {
                let rx = &s.rx;
                scope.spawn(move || {
                    (0..PER_THREAD)
                        .map(|i| {
                            let seq = 9_000 + t * PER_THREAD + i;
                            let payload = seq.to_be_bytes();
                            let rtx = media(seq, &payload).to_rtx(SSRC, seq, 97).freeze();
                            rx.deliver_rtp(rtx, None)
                        })
                        .collect::<Vec<_>>()
                })
            })
            .collect();
        handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect()
    });

    let mut busy = 0;
    for outcome in &outcomes {
        match outcome {
            Ok(d) => assert!(d.verdict().is_some()),
            Err(DropReason::BufferBusy) => busy += 1,
            Err(other) => panic!("unexpected drop: {other}"),
        }
    }
    assert_eq!(busy as u64, s.rx.scratch_busy_rejections());

    // Every dispatched payload matches the sequence number it was restored to.
    for (payload, info) in s.decoder.frames.lock().iter().skip(1) {
        assert_eq!(payload.as_slice(), info.header.sequence_number.to_be_bytes());
        assert_eq!(info.header.payload_type, 96);
    }
    assert_eq!(s.decoder.frames.lock().len(), 1 + outcomes.len() - busy);
}

#[test]
fn codec_rejection_is_reported() {
    let s = session(config());
    let err = s
        .rx
        .set_receive_codec(CodecDescriptor::new("H264", 97, 90_000))
        .unwrap_err();
    assert!(matches!(err, ConfigError::CodecRejected { payload_type: 97, .. }));
}
