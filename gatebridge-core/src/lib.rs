//! GateBridge Core: the gate notification and decision bridge, minus the
//! process around it.
//!
//! A pipeline emits `GATE_REQUESTED` events. The [`consumer`] posts one
//! notification per request to the channel chosen by [`routing`]. Reviewers
//! click approve or reject; the [`interaction`] dispatcher hands the click to
//! the [`decision`] machine, which checks [`rbac`], moves the gate status
//! exactly once, rewrites the notification and publishes
//! `GATE_APPROVED`/`GATE_REJECTED`.
//!
//! Storage ([`store`]), the event log ([`events`]) and the chat surface
//! ([`chat`]) sit behind traits with in-memory and production
//! implementations. The `gatebridge` crate wires them together.

pub mod chat;
pub mod config;
pub mod consumer;
pub mod decision;
pub mod events;
pub mod gate;
pub mod interaction;
pub mod lifecycle;
pub mod metrics;
pub mod rbac;
pub mod routing;
pub mod store;
