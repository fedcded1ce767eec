//! Fuzz target for payload encryption
//!
//! Tests that sealing and opening handle arbitrary keys and payloads.

#![no_main]

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use paystream_crypto::{PacketCipher, SharedSecret};

#[derive(Debug, Arbitrary)]
struct CryptoInput {
    key: [u8; 32],
    plaintext: Vec<u8>,
    sealed: Vec<u8>,
}

fuzz_target!(|input: CryptoInput| {
    let cipher = PacketCipher::new(&SharedSecret::from_bytes(input.key));

    if let Ok(sealed) = cipher.encrypt(&input.plaintext) {
        assert_eq!(cipher.decrypt(&sealed).ok(), Some(input.plaintext));
    }

    // Opening arbitrary bytes should never panic
    let _ = cipher.decrypt(&input.sealed);
    let _ = cipher.fulfillment(&input.sealed);
});
