#![no_main]

//! Fuzz target for Slack interaction payload parsing.
//!
//! The payload is attacker-reachable once a request passes signature
//! checks (or when no signing secret is configured). Parsing must never
//! panic regardless of shape.

use libfuzzer_sys::fuzz_target;

use gatebridge_core::chat::slack::parse_interaction;

fuzz_target!(|data: &[u8]| {
    if let Ok(payload) = std::str::from_utf8(data) {
        let _ = parse_interaction(payload);
    }
});
