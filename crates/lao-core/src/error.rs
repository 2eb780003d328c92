//! Error types for the LAO client

use thiserror::Error;

use crate::{MessageId, PublicKey};

/// Channel construction errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChannelError {
    #[error("Invalid channel {path:?}: {reason}")]
    InvalidChannel { path: String, reason: &'static str },
}

/// Rejected message. Logged and dropped, never fatal.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Bad signature from {0}")]
    BadSignature(PublicKey),

    #[error("Identifier mismatch: carried {carried}, computed {computed}")]
    IdentifierMismatch {
        carried: MessageId,
        computed: MessageId,
    },

    #[error("Bad witness signature from {0}")]
    BadWitnessSignature(PublicKey),

    #[error("Malformed data: {0}")]
    MalformedData(String),

    #[error("Unauthorized sender {0}")]
    Unauthorized(PublicKey),

    #[error("{0} is not a witness of this entity")]
    NotAWitness(PublicKey),
}

/// Transport collaborator failures
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("Transport closed")]
    Closed,

    #[error("Transport send failed: {0}")]
    Send(String),
}

/// Failures that resolve a caller's pending request
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RequestError {
    #[error("Request timed out")]
    RequestTimeout,

    #[error("Server error {code}: {description}")]
    ServerError { code: i64, description: String },

    #[error("Request cancelled")]
    Cancelled,

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("Unexpected result: {0}")]
    UnexpectedResult(String),

    #[error(transparent)]
    Malformed(#[from] ProtocolError),
}

/// Result type for protocol-level operations
pub type ProtocolResult<T> = Result<T, ProtocolError>;
