//! Fuzz target for type signature parsing.
//!
//! Any signature that parses must render back to the same text.

#![no_main]

use busloop::codec::signature;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if let Ok(s) = std::str::from_utf8(data) {
        if let Ok(types) = signature::parse(s) {
            assert_eq!(signature::render(&types), s);
        }
    }
});
