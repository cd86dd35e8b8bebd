#![no_main]

use bytes::Bytes;
use libfuzzer_sys::fuzz_target;
use rtp_ingress::wire::{restore_rtx, restored_rtx_len, split_red, ExtensionKind, ExtensionMap, RtpHeader};

/// Fuzz RTP header parsing with every extension registered, then the RTX and
/// RED unwrapping that follows it. Nothing here may panic.
fuzz_target!(|data: &[u8]| {
    let mut map = ExtensionMap::new();
    for (i, kind) in ExtensionKind::ALL.iter().enumerate() {
        let _ = map.register(*kind, i as u8 + 1);
    }

    let Some(header) = RtpHeader::decode(data, &map) else {
        return;
    };
    assert_eq!(header.header_len + header.payload_len + header.padding_len, data.len());

    if let Some(len) = restored_rtx_len(&header, data) {
        let mut out = vec![0u8; len];
        let _ = restore_rtx(data, &header, 1, 96, &mut out);
    }

    let payload = Bytes::copy_from_slice(header.payload(data));
    let _ = split_red(&payload);
});
