//! LAO State - witness-consensus reconciliation
//!
//! - `EntitySnapshot`: per-kind state and its pure reducers
//! - `TrackedEntity`: modifications and witnesses, the snapshot derived from them
//! - `QuorumPolicy`: how many witnesses make a modification authoritative
//! - `OrphanBuffer`: witnesses that arrived before their target
//! - `MessageStore`: persistence collaborator, replay ordered
//! - `ReconciliationStore`: the single entry point applying envelopes

pub mod entity;
pub mod error;
pub mod orphan;
pub mod persist;
pub mod quorum;
pub mod snapshot;
pub mod store;

pub use entity::*;
pub use error::*;
pub use orphan::*;
pub use persist::*;
pub use quorum::*;
pub use snapshot::*;
pub use store::*;
