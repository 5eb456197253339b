#![no_main]

//! Fuzz target for configuration parsing.
//!
//! Substitution, YAML parsing and validation must reject bad input with an
//! error, never a panic.

use libfuzzer_sys::fuzz_target;

use gatebridge_core::config::{Config, substitute_env_vars, validate};

fuzz_target!(|data: &[u8]| {
    let Ok(raw) = std::str::from_utf8(data) else {
        return;
    };
    let Ok(substituted) = substitute_env_vars(raw) else {
        return;
    };
    if let Ok(config) = serde_saphyr::from_str::<Config>(&substituted) {
        let _ = validate(&config);
    }
});
