//! ChannelTransport - in-memory transport
//!
//! Both directions are unbounded tokio channels. The relay end can drop
//! and restore the link to exercise reconnect handling.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;

use lao_core::TransportError;

use crate::{EventReceiver, EventSender, Transport, TransportEvent};

#[derive(Debug)]
struct LinkState {
    connected: bool,
    frames_sent: u64,
}

/// Client side of an in-memory link
#[derive(Clone, Debug)]
pub struct ChannelTransport {
    outbound: mpsc::UnboundedSender<String>,
    link: Arc<Mutex<LinkState>>,
}

/// Relay side of an in-memory link
#[derive(Debug)]
pub struct RelayEnd {
    inbound: mpsc::UnboundedReceiver<String>,
    events: EventSender,
    link: Arc<Mutex<LinkState>>,
}

impl ChannelTransport {
    /// Connected transport, the client's event receiver, and the relay end
    pub fn pair() -> (ChannelTransport, EventReceiver, RelayEnd) {
        let (outbound, inbound) = mpsc::unbounded_channel();
        let (events, event_rx) = mpsc::unbounded_channel();
        let link = Arc::new(Mutex::new(LinkState {
            connected: true,
            frames_sent: 0,
        }));

        let transport = ChannelTransport {
            outbound,
            link: Arc::clone(&link),
        };
        let relay = RelayEnd {
            inbound,
            events,
            link,
        };
        (transport, event_rx, relay)
    }

    /// Frames accepted so far
    pub fn frames_sent(&self) -> u64 {
        self.link.lock().frames_sent
    }
}

impl Transport for ChannelTransport {
    fn send_frame(&self, frame: String) -> Result<(), TransportError> {
        let mut link = self.link.lock();
        if !link.connected {
            return Err(TransportError::Closed);
        }
        self.outbound
            .send(frame)
            .map_err(|_| TransportError::Closed)?;
        link.frames_sent += 1;
        Ok(())
    }
}

impl RelayEnd {
    /// Next frame sent by the client; `None` once every client handle is gone
    pub async fn recv_frame(&mut self) -> Option<String> {
        self.inbound.recv().await
    }

    /// Next frame if one is already queued
    pub fn try_recv_frame(&mut self) -> Option<String> {
        self.inbound.try_recv().ok()
    }

    /// Deliver a frame to the client
    pub fn send_frame(&self, frame: String) -> Result<(), TransportError> {
        if !self.link.lock().connected {
            return Err(TransportError::Closed);
        }
        self.events
            .send(TransportEvent::Frame(frame))
            .map_err(|_| TransportError::Closed)
    }

    /// Drop the link; client sends fail until `reconnect`
    pub fn disconnect(&self) {
        self.link.lock().connected = false;
        if self.events.send(TransportEvent::Disconnected).is_err() {
            tracing::debug!("Client gone before disconnect notification");
        }
    }

    /// Restore the link and notify the client
    pub fn reconnect(&self) {
        self.link.lock().connected = true;
        if self.events.send(TransportEvent::Reconnected).is_err() {
            tracing::debug!("Client gone before reconnect notification");
        }
    }

    pub fn is_connected(&self) -> bool {
        self.link.lock().connected
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_frames_flow_both_ways() {
        let (transport, mut events, mut relay) = ChannelTransport::pair();

        transport.send_frame("hello".into()).unwrap();
        assert_eq!(relay.recv_frame().await.as_deref(), Some("hello"));
        assert_eq!(transport.frames_sent(), 1);

        relay.send_frame("world".into()).unwrap();
        assert_eq!(events.recv().await, Some(TransportEvent::Frame("world".into())));
    }

    #[tokio::test]
    async fn test_disconnect_and_reconnect() {
        let (transport, mut events, relay) = ChannelTransport::pair();

        relay.disconnect();
        assert_eq!(events.recv().await, Some(TransportEvent::Disconnected));
        assert_eq!(transport.send_frame("x".into()), Err(TransportError::Closed));
        assert!(relay.send_frame("y".into()).is_err());

        relay.reconnect();
        assert_eq!(events.recv().await, Some(TransportEvent::Reconnected));
        assert!(transport.send_frame("x".into()).is_ok());
    }

    #[tokio::test]
    async fn test_dropped_relay_closes() {
        let (transport, _events, relay) = ChannelTransport::pair();
        drop(relay);
        assert_eq!(transport.send_frame("x".into()), Err(TransportError::Closed));
    }
}
