//! Client-facing errors

use lao_core::{ProtocolError, RequestError};
use lao_state::ApplyError;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ClientError {
    #[error(transparent)]
    Request(#[from] RequestError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Apply(#[from] ApplyError),
}

pub type ClientResult<T> = Result<T, ClientError>;

/// Invalid configuration override
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid value {value:?} for {key}: {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
}
