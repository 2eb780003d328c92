//! LAO Test Harness - relay simulation and protocol scenarios
//!
//! This crate provides:
//! - A simulated relay speaking the JSON-RPC protocol to any number of clients
//! - Deterministic fixtures: organizer, witnesses and signed protocol messages
//! - End-to-end scenarios covering witnessing, catch-up and reconnects

pub mod fixtures;
pub mod integration;
pub mod relay;

pub use fixtures::*;
pub use relay::*;
