//! LAO Crypto - Signing capability and signed envelopes
//!
//! Provides:
//! - Identity management (Ed25519) behind the `Signer` / `Verifier` traits
//! - Signed envelopes with content-addressed ids and witness signatures

pub mod envelope;
pub mod identity;

pub use envelope::*;
pub use identity::*;
