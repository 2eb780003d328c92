//! Apply errors

use lao_core::{EntityId, ProtocolError};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ApplyError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// The message depends on an entity not seen yet. Not persisted;
    /// the caller may retry once the dependency arrives.
    #[error("Unknown entity {0}")]
    UnknownEntity(EntityId),
}

impl ApplyError {
    /// Worth retrying after later messages are applied
    pub fn is_deferrable(&self) -> bool {
        matches!(self, ApplyError::UnknownEntity(_))
    }
}

pub type ApplyResult<T> = Result<T, ApplyError>;
