#![no_main]

use libfuzzer_sys::fuzz_target;
use rtp_ingress::rtcp::parse_compound;

/// Fuzz compound RTCP parsing. Malformed sections must be skipped, never
/// panic.
fuzz_target!(|data: &[u8]| {
    if let Some(compound) = parse_compound(data) {
        assert!(compound.packets.len() + compound.skipped <= data.len().div_ceil(4));
    }
});
