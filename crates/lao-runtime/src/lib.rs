//! LAO Runtime - client orchestration
//!
//! Frame flow through the client:
//! 1. The transport delivers a text frame
//! 2. The RPC layer resolves answers by request id
//! 3. Broadcast messages become signed envelopes
//! 4. The reconciliation store verifies and applies them
//! 5. Snapshot changes are published to `updates()` subscribers

pub mod client;
pub mod config;
pub mod error;
pub mod rpc;
pub mod telemetry;

pub use client::*;
pub use config::*;
pub use error::*;
pub use rpc::*;
pub use telemetry::*;
