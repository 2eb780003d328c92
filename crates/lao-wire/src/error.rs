//! Wire decoding errors

use lao_core::ProtocolError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum WireError {
    #[error("Invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid frame: {0}")]
    InvalidFrame(String),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

pub type WireResult<T> = Result<T, WireError>;
