//! LAO Wire Protocol - JSON text frames
//!
//! This crate implements the wire format spoken with the relay:
//! - JSON-RPC requests, answers and broadcasts
//! - The signed envelope in its JSON form
//! - The protocol data codec, an explicit table keyed by (object, action)

pub mod data;
pub mod error;
pub mod message;
pub mod rpc;

pub use data::*;
pub use error::*;
pub use message::*;
pub use rpc::*;
