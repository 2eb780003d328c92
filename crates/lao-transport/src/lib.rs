//! LAO Transport Layer
//!
//! The socket itself lives outside this workspace. This crate provides:
//! - The `Transport` contract: send whole text frames
//! - `TransportEvent`: inbound frames and connection notifications
//! - `ChannelTransport`: an in-memory pair for tests and simulation

pub mod channel;

pub use channel::*;

use lao_core::TransportError;
use tokio::sync::mpsc;

/// Outbound half of a duplex text-frame connection
pub trait Transport: Send + Sync {
    /// Hand one frame to the connection. Must not block on the peer.
    fn send_frame(&self, frame: String) -> Result<(), TransportError>;
}

/// Inbound notifications, delivered on one receiving task
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TransportEvent {
    Frame(String),
    Disconnected,
    Reconnected,
}

/// Event receiver channel
pub type EventReceiver = mpsc::UnboundedReceiver<TransportEvent>;

/// Event sender channel
pub type EventSender = mpsc::UnboundedSender<TransportEvent>;
