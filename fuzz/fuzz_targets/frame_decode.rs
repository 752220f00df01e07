//! Fuzz target for wire frame decoding.
//!
//! Decoded message bodies are checked against their own signature, which
//! must never panic whatever the frame claims.

#![no_main]

use busloop::codec::{Codec, SignatureCodec};
use busloop::transport::decode_frame;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if let Ok(message) = decode_frame(data) {
        let _ = SignatureCodec.decode(&message.body, Some(&message.body.signature));
    }
});
