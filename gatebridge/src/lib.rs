//! GateBridge service binary support.
//!
//! This crate holds the pieces that face the network: the Slack interaction
//! endpoint and its signature check, the admin server, and the [`bridge`]
//! orchestrator that wires `gatebridge-core` components together.

pub mod admin;
pub mod bridge;
pub mod interactions;
pub mod signature;
