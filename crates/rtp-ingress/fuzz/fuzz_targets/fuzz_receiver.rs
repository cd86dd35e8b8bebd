#![no_main]

use std::sync::Arc;

use bytes::Bytes;
use libfuzzer_sys::fuzz_target;
use rtp_ingress::payload::CodecDescriptor;
use rtp_ingress::receiver::{BandwidthEstimator, FecReceiver, PacketInfo, PayloadSink};
use rtp_ingress::wire::{RedBlock, RtpHeader};
use rtp_ingress::{Collaborators, PacketReceiver, ReceiverConfig};

struct Sink;

impl PayloadSink for Sink {
    fn on_received_payload_data(&self, _payload: &[u8], _info: &PacketInfo) -> i32 {
        0
    }
}

struct Estimator;

impl BandwidthEstimator for Estimator {
    fn incoming_packet(&self, _arrival_ms: i64, _payload_len: usize, _header: &RtpHeader) {}
}

struct Fec;

impl FecReceiver for Fec {
    fn on_fec_packet(&self, _red_header: &RtpHeader, _block: &RedBlock) {}
}

/// Fuzz the full receive path with RTX, RED and ULPFEC all configured.
///
/// The input is a run of length-prefixed datagrams (one length byte each) so
/// a single case can exercise stateful interactions such as ordering or RTX
/// against an already known stream. Each datagram goes in as both RTP and RTCP. The receiver must never panic, and
/// the scratch buffer must be free again after every call.
fuzz_target!(|data: &[u8]| {
    let config = ReceiverConfig {
        nack_enabled: true,
        use_rtx_payload_mapping_on_restore: true,
        rtx_ssrc: Some(0xDEAD_BEEF),
        local_ssrc: Some(1),
        codecs: vec![
            CodecDescriptor::new("VP8", 96, 90_000),
            CodecDescriptor::new("red", 116, 90_000),
            CodecDescriptor::new("ulpfec", 117, 90_000),
        ],
        rtx: vec![(97, 96), (98, 116)],
        ..Default::default()
    };
    let collaborators =
        Collaborators::new(Arc::new(Sink), Arc::new(Estimator)).with_fec_receiver(Arc::new(Fec));
    let Ok(rx) = PacketReceiver::new(config, collaborators) else {
        return;
    };
    rx.start_receive();

    let mut rest = data;
    let mut arrival_ms = 0i64;
    while let Some((&len, tail)) = rest.split_first() {
        let len = (len as usize).min(tail.len());
        let (datagram, next) = tail.split_at(len);
        rest = next;
        arrival_ms += 5;

        let _ = rx.deliver_rtp(Bytes::copy_from_slice(datagram), Some(arrival_ms));
        let _ = rx.deliver_rtcp(datagram);
        let _ = rx.on_recovered_packet(Bytes::copy_from_slice(datagram));
        assert_eq!(rx.scratch_busy_rejections(), 0);
    }
});
