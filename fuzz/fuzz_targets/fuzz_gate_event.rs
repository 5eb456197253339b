#![no_main]

//! Fuzz target for inbound gate event parsing.
//!
//! Event fields come straight off the stream from other producers, so
//! `parse_event` must never panic, and whatever it accepts must carry a
//! non-empty request id and gate type.

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;

use gatebridge_core::events::{EventFields, InboundEvent, parse_event};

#[derive(Arbitrary, Debug)]
struct FuzzEventInput {
    /// Well-known fields, each optionally present
    event_type: Option<FuzzEventType>,
    request_id: Option<String>,
    gate_type: Option<String>,
    environment: Option<String>,
    requested_by: Option<String>,
    requester: Option<String>,
    /// Arbitrary extra fields
    extra: Vec<(String, String)>,
}

#[derive(Arbitrary, Debug)]
enum FuzzEventType {
    GateRequested,
    GateApproved,
    Other(String),
}

fuzz_target!(|input: FuzzEventInput| {
    let mut fields = EventFields::new();
    for (key, value) in input.extra {
        fields.insert(key, value);
    }
    if let Some(kind) = input.event_type {
        let value = match kind {
            FuzzEventType::GateRequested => "GATE_REQUESTED".to_string(),
            FuzzEventType::GateApproved => "GATE_APPROVED".to_string(),
            FuzzEventType::Other(s) => s,
        };
        fields.insert("event_type".to_string(), value);
    }
    for (key, value) in [
        ("request_id", input.request_id),
        ("gate_type", input.gate_type),
        ("environment", input.environment),
        ("requested_by", input.requested_by),
        ("requester", input.requester),
    ] {
        if let Some(value) = value {
            fields.insert(key.to_string(), value);
        }
    }

    if let Ok(InboundEvent::GateRequested(request)) = parse_event(&fields) {
        assert!(!request.request_id.trim().is_empty());
        assert!(!request.gate_type.trim().is_empty());
        if let Some(env) = &request.environment {
            assert!(!env.trim().is_empty());
        }
    }
});
