//! LAO Core - Fundamental types and primitives
//!
//! This crate defines the core types used throughout the LAO client:
//! - Content-addressed identifiers (MessageId, EntityId)
//! - Public keys and signatures
//! - Channel addressing
//! - Protocol timestamps and the injectable clock
//! - Error taxonomy

pub mod channel;
pub mod error;
pub mod id;
pub mod keys;
pub mod time;

pub use channel::*;
pub use error::*;
pub use id::*;
pub use keys::*;
pub use time::*;
