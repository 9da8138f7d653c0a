//! Fuzz target for the stored-payload codec.
//!
//! `decode_payload` must reject, never panic on, arbitrary queue rows.

#![no_main]

use libfuzzer_sys::fuzz_target;
use replay_engine::queue::{decode_payload, encode_payload};

fuzz_target!(|data: &[u8]| {
    if let Ok(value) = decode_payload(data) {
        // Anything that decodes must survive a compressed round through storage
        let stored = encode_payload(&value, 0).expect("decoded json re-encodes");
        assert_eq!(decode_payload(&stored).expect("fresh frame decodes"), value);
    }
});
