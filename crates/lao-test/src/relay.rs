//! Simulated relay
//!
//! Speaks the JSON-RPC protocol over in-memory links. Each connected peer
//! gets its own serving task; the channel history and subscriptions are
//! shared behind one lock. Published messages are verified, stored and
//! broadcast to every other subscriber of the channel. A `lao#create`
//! published on `/root` is stored on the organization's own channel so
//! that catch-up there starts with it.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::mpsc;

use lao_core::{Channel, MessageId};
use lao_crypto::{Ed25519Verifier, SignedEnvelope};
use lao_transport::{ChannelTransport, EventReceiver, RelayEnd};
use lao_wire::{error_code, Answer, Broadcast, Method, ProtocolData, Request, WireMessage};

/// Error answer the relay gives to a request
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Rejection {
    pub code: i64,
    pub description: String,
}

impl Rejection {
    fn new(code: i64, description: impl Into<String>) -> Self {
        Rejection {
            code,
            description: description.into(),
        }
    }
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.description, self.code)
    }
}

enum PeerCommand {
    Deliver(String),
    Disconnect,
    Reconnect,
}

struct PeerEntry {
    subscriptions: BTreeSet<Channel>,
    commands: mpsc::UnboundedSender<PeerCommand>,
}

#[derive(Default)]
struct RelayState {
    history: HashMap<Channel, Vec<WireMessage>>,
    seen: HashSet<MessageId>,
    peers: HashMap<usize, PeerEntry>,
    next_peer: usize,
    /// Ignore requests without answering
    silent: bool,
}

impl RelayState {
    fn handle(&mut self, peer: usize, request: Request) -> Option<Answer> {
        if self.silent {
            tracing::debug!(peer, id = request.id, "Silent relay dropping request");
            return None;
        }

        let channel = request.params.channel;
        let outcome = match request.method {
            Method::Subscribe => {
                if let Some(entry) = self.peers.get_mut(&peer) {
                    entry.subscriptions.insert(channel);
                }
                Ok(Value::from(0))
            }
            Method::Unsubscribe => {
                let removed = self
                    .peers
                    .get_mut(&peer)
                    .is_some_and(|entry| entry.subscriptions.remove(&channel));
                if removed {
                    Ok(Value::from(0))
                } else {
                    Err(Rejection::new(error_code::INVALID_RESOURCE, "not subscribed"))
                }
            }
            Method::Catchup => self.catchup(&channel),
            Method::Publish => match request.params.message {
                Some(message) => self.publish(Some(peer), &channel, message).map(|()| Value::from(0)),
                None => Err(Rejection::new(
                    error_code::INVALID_MESSAGE_DATA,
                    "publish without message",
                )),
            },
            Method::Broadcast => Err(Rejection::new(
                error_code::INVALID_ACTION,
                "broadcast is not a request",
            )),
        };

        Some(match outcome {
            Ok(result) => Answer::result(request.id, result),
            Err(rejection) => Answer::error(request.id, rejection.code, rejection.description),
        })
    }

    fn catchup(&self, channel: &Channel) -> Result<Value, Rejection> {
        let history = self.history.get(channel).map(Vec::as_slice).unwrap_or(&[]);
        serde_json::to_value(history)
            .map_err(|e| Rejection::new(error_code::INTERNAL_SERVER_ERROR, e.to_string()))
    }

    fn publish(
        &mut self,
        publisher: Option<usize>,
        channel: &Channel,
        message: WireMessage,
    ) -> Result<(), Rejection> {
        let invalid = |e: &dyn fmt::Display| Rejection::new(error_code::INVALID_MESSAGE_DATA, e.to_string());

        let envelope = SignedEnvelope::try_from(message.clone()).map_err(|e| invalid(&e))?;
        envelope.verify(&Ed25519Verifier).map_err(|e| invalid(&e))?;
        let data = ProtocolData::decode(envelope.data()).map_err(|e| invalid(&e))?;

        let stored_on = match &data {
            ProtocolData::CreateLao(create) if *channel == Channel::root() => {
                Channel::for_lao(create.id.as_str())
                    .map_err(|e| Rejection::new(error_code::INVALID_RESOURCE, e.to_string()))?
            }
            _ => channel.clone(),
        };

        // Duplicates are acknowledged but not broadcast again
        if !self.seen.insert(envelope.message_id()) {
            return Ok(());
        }
        self.history
            .entry(stored_on.clone())
            .or_default()
            .push(message.clone());

        let frame = Broadcast {
            channel: channel.clone(),
            message,
        }
        .encode()
        .map_err(|e| Rejection::new(error_code::INTERNAL_SERVER_ERROR, e.to_string()))?;

        for (id, entry) in &self.peers {
            if Some(*id) == publisher {
                continue;
            }
            if entry.subscriptions.contains(channel) || entry.subscriptions.contains(&stored_on) {
                let _ = entry.commands.send(PeerCommand::Deliver(frame.clone()));
            }
        }
        tracing::debug!(%channel, message_id = %envelope.message_id(), "Relay stored message");
        Ok(())
    }
}

/// In-process relay serving any number of clients
#[derive(Clone, Default)]
pub struct SimulatedRelay {
    state: Arc<Mutex<RelayState>>,
}

impl SimulatedRelay {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a link to a new peer. Must be called inside a tokio runtime;
    /// the peer is served by a spawned task.
    pub fn connect(&self) -> (ChannelTransport, EventReceiver, PeerHandle) {
        let (transport, events, relay_end) = ChannelTransport::pair();
        let (commands, command_rx) = mpsc::unbounded_channel();

        let id = {
            let mut state = self.state.lock();
            let id = state.next_peer;
            state.next_peer += 1;
            state.peers.insert(
                id,
                PeerEntry {
                    subscriptions: BTreeSet::new(),
                    commands: commands.clone(),
                },
            );
            id
        };

        tokio::spawn(serve(Arc::clone(&self.state), id, relay_end, command_rx));
        let handle = PeerHandle {
            id,
            commands,
            state: Arc::clone(&self.state),
        };
        (transport, events, handle)
    }

    /// Publish `envelope` as if from a client outside the simulation
    pub fn inject(&self, channel: &Channel, envelope: &SignedEnvelope) -> Result<(), Rejection> {
        self.state
            .lock()
            .publish(None, channel, WireMessage::from(envelope))
    }

    /// Stored messages of `channel`, in arrival order
    pub fn history(&self, channel: &Channel) -> Vec<WireMessage> {
        self.state
            .lock()
            .history
            .get(channel)
            .cloned()
            .unwrap_or_default()
    }

    /// Stop answering requests; they are dropped silently
    pub fn set_silent(&self, silent: bool) {
        self.state.lock().silent = silent;
    }

    pub fn peer_count(&self) -> usize {
        self.state.lock().peers.len()
    }
}

/// Relay-side control of one peer link
pub struct PeerHandle {
    id: usize,
    commands: mpsc::UnboundedSender<PeerCommand>,
    state: Arc<Mutex<RelayState>>,
}

impl PeerHandle {
    pub fn id(&self) -> usize {
        self.id
    }

    /// Drop the link. Subscriptions do not survive on the relay side.
    pub fn disconnect(&self) {
        let _ = self.commands.send(PeerCommand::Disconnect);
    }

    pub fn reconnect(&self) {
        let _ = self.commands.send(PeerCommand::Reconnect);
    }

    pub fn subscriptions(&self) -> Vec<Channel> {
        self.state
            .lock()
            .peers
            .get(&self.id)
            .map(|entry| entry.subscriptions.iter().cloned().collect())
            .unwrap_or_default()
    }
}

async fn serve(
    state: Arc<Mutex<RelayState>>,
    peer: usize,
    mut link: RelayEnd,
    mut commands: mpsc::UnboundedReceiver<PeerCommand>,
) {
    loop {
        tokio::select! {
            frame = link.recv_frame() => {
                let Some(frame) = frame else { break };
                let request = match Request::decode(&frame) {
                    Ok(request) => request,
                    Err(e) => {
                        tracing::warn!(peer, error = %e, "Relay dropping undecodable request");
                        continue;
                    }
                };
                let answer = state.lock().handle(peer, request);
                if let Some(frame) = answer.and_then(|a| a.encode().ok()) {
                    if link.send_frame(frame).is_err() {
                        tracing::debug!(peer, "Answer lost on a dropped link");
                    }
                }
            }
            command = commands.recv() => {
                let Some(command) = command else { break };
                match command {
                    PeerCommand::Deliver(frame) => {
                        if link.send_frame(frame).is_err() {
                            tracing::debug!(peer, "Broadcast lost on a dropped link");
                        }
                    }
                    PeerCommand::Disconnect => {
                        if let Some(entry) = state.lock().peers.get_mut(&peer) {
                            entry.subscriptions.clear();
                        }
                        link.disconnect();
                    }
                    PeerCommand::Reconnect => link.reconnect(),
                }
            }
        }
    }

    state.lock().peers.remove(&peer);
    tracing::debug!(peer, "Relay peer closed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::LaoFixture;
    use lao_transport::{Transport, TransportEvent};
    use lao_wire::{decode_frame, Incoming, RequestKind};

    async fn roundtrip(
        transport: &ChannelTransport,
        events: &mut EventReceiver,
        request: Request,
    ) -> Answer {
        transport.send_frame(request.encode().unwrap()).unwrap();
        loop {
            let Some(TransportEvent::Frame(frame)) = events.recv().await else {
                panic!("link closed");
            };
            if let Incoming::Answer(answer) = decode_frame(&frame).unwrap() {
                return answer;
            }
        }
    }

    #[tokio::test]
    async fn test_publish_broadcasts_to_other_subscribers() {
        let relay = SimulatedRelay::new();
        let lao = LaoFixture::new("LAO", 0).unwrap();
        let (publisher, mut publisher_events, _p) = relay.connect();
        let (observer, mut observer_events, _o) = relay.connect();

        let subscribe = Request::new(1, RequestKind::Subscribe, lao.channel.clone(), None);
        let answer = roundtrip(&observer, &mut observer_events, subscribe).await;
        assert_eq!(answer.into_result(), Ok(Value::from(0)));

        let create = lao.create_envelope().unwrap();
        let publish = Request::new(
            1,
            RequestKind::Publish,
            Channel::root(),
            Some(WireMessage::from(&create)),
        );
        let answer = roundtrip(&publisher, &mut publisher_events, publish).await;
        assert_eq!(answer.into_result(), Ok(Value::from(0)));

        let Some(TransportEvent::Frame(frame)) = observer_events.recv().await else {
            panic!("expected broadcast");
        };
        let Incoming::Broadcast(broadcast) = decode_frame(&frame).unwrap() else {
            panic!("expected broadcast");
        };
        assert_eq!(broadcast.message, WireMessage::from(&create));
        assert_eq!(relay.history(&lao.channel).len(), 1);
        assert!(relay.history(&Channel::root()).is_empty());
    }

    #[tokio::test]
    async fn test_rejects_tampered_message() {
        let relay = SimulatedRelay::new();
        let lao = LaoFixture::new("LAO", 0).unwrap();
        let mut message = WireMessage::from(&lao.create_envelope().unwrap());
        message.sender = lao_core::PublicKey::from_bytes([9; 32]);

        let (transport, mut events, _h) = relay.connect();
        let publish = Request::new(7, RequestKind::Publish, Channel::root(), Some(message));
        let answer = roundtrip(&transport, &mut events, publish).await;

        assert!(matches!(
            answer.into_result(),
            Err(lao_core::RequestError::ServerError { code: -4, .. })
        ));
    }

    #[tokio::test]
    async fn test_unsubscribe_unknown_channel() {
        let relay = SimulatedRelay::new();
        let (transport, mut events, _h) = relay.connect();

        let request = Request::new(3, RequestKind::Unsubscribe, Channel::root(), None);
        let answer = roundtrip(&transport, &mut events, request).await;
        assert!(answer.into_result().is_err());
    }

    #[test]
    fn test_inject_stores_once() {
        let relay = SimulatedRelay::new();
        let lao = LaoFixture::new("LAO", 0).unwrap();
        let create = lao.create_envelope().unwrap();

        relay.inject(&Channel::root(), &create).unwrap();
        relay.inject(&Channel::root(), &create).unwrap();
        assert_eq!(relay.history(&lao.channel).len(), 1);
    }
}
