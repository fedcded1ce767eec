//! Fuzz target for transport record parsing
//!
//! Tests that Prepare, Fulfill and Reject parsing handles arbitrary input.

#![no_main]

use libfuzzer_sys::fuzz_target;
use paystream_transport::{Packet, Prepare};

fuzz_target!(|data: &[u8]| {
    if let Ok(packet) = Packet::from_bytes(data) {
        let _ = Packet::from_bytes(&packet.to_bytes());
        if let Packet::Reject(reject) = &packet {
            let _ = reject.amount_too_large();
        }
    }
    let _ = Prepare::from_bytes(data);
});
