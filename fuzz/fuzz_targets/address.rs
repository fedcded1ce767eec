//! Fuzz target for destination address parsing
//!
//! Tests that connection id extraction and token decoding accept any string.

#![no_main]

use libfuzzer_sys::fuzz_target;
use paystream_core::address::{connection_id, is_valid_connection_id, split_tag};
use paystream_crypto::Token;

fuzz_target!(|data: &[u8]| {
    let Ok(destination) = std::str::from_utf8(data) else {
        return;
    };
    if let Some(id) = connection_id("test.server", destination) {
        assert!(is_valid_connection_id(id));
        let (token, _tag) = split_tag(id);
        if let Ok(decoded) = Token::decode(token) {
            assert_eq!(decoded.encode(), token);
        }
    }
});
