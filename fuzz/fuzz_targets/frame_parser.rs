//! Fuzz target for payload decoding
//!
//! Tests that the packet and frame decoder handles arbitrary input without panicking.

#![no_main]

use libfuzzer_sys::fuzz_target;
use paystream_core::StreamPacket;

fuzz_target!(|data: &[u8]| {
    // The decoder should never panic, only return Ok or Err
    if let Ok(packet) = StreamPacket::decode(data) {
        // Anything that decodes re-encodes to something that decodes the same
        let encoded = packet.encode();
        assert_eq!(StreamPacket::decode(&encoded).ok(), Some(packet));
    }
});
