//! RPC correlation layer
//!
//! Requests are registered before they reach the transport, so an answer
//! can never overtake its own registration. Each request resolves exactly
//! once: answered, timed out, cancelled, or failed by the transport.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::oneshot;

use lao_core::{Channel, ProtocolError, RequestError, TransportError};
use lao_transport::Transport;
use lao_wire::{decode_frame, Answer, Broadcast, Incoming, Request, RequestKind, WireMessage, WireResult};

type Completion = oneshot::Sender<Result<Value, RequestError>>;

struct Slot {
    channel: Channel,
    kind: RequestKind,
    completion: Completion,
}

#[derive(Default)]
struct Registry {
    last_id: u64,
    slots: HashMap<u64, Slot>,
}

impl Registry {
    /// Next id, skipping 0 and ids still in flight after wrap-around
    fn allocate(&mut self) -> u64 {
        loop {
            self.last_id = self.last_id.wrapping_add(1);
            if self.last_id != 0 && !self.slots.contains_key(&self.last_id) {
                return self.last_id;
            }
        }
    }

    /// Allocate an id and register `slot` under it. A taken id is a
    /// broken registry, never a recoverable condition.
    fn register(&mut self, slot: Slot) -> u64 {
        let id = self.allocate();
        self.insert(id, slot);
        id
    }

    fn insert(&mut self, id: u64, slot: Slot) {
        let previous = self.slots.insert(id, slot);
        assert!(previous.is_none(), "request id {id} registered twice");
    }
}

/// Handle on an in-flight request. Dropping it cancels the request.
pub struct PendingRequest {
    id: u64,
    channel: Channel,
    kind: RequestKind,
    completion: oneshot::Receiver<Result<Value, RequestError>>,
    registry: Arc<Mutex<Registry>>,
    resolved: bool,
}

impl PendingRequest {
    #[inline]
    pub fn id(&self) -> u64 {
        self.id
    }

    #[inline]
    pub fn channel(&self) -> &Channel {
        &self.channel
    }

    #[inline]
    pub fn kind(&self) -> RequestKind {
        self.kind
    }

    /// Wait for the answer. On expiry the request is removed and resolves
    /// with `RequestTimeout`; a later answer is discarded.
    pub async fn wait(mut self, timeout: Duration) -> Result<Value, RequestError> {
        let outcome = tokio::time::timeout(timeout, &mut self.completion).await;
        self.resolved = true;

        match outcome {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(RequestError::Cancelled),
            Err(_) => {
                self.registry.lock().slots.remove(&self.id);
                tracing::warn!(id = self.id, channel = %self.channel, kind = ?self.kind, "Request timed out");
                Err(RequestError::RequestTimeout)
            }
        }
    }

    /// Give up on the request
    pub fn cancel(self) {}
}

impl Drop for PendingRequest {
    fn drop(&mut self) {
        if !self.resolved && self.registry.lock().slots.remove(&self.id).is_some() {
            tracing::debug!(id = self.id, "Request cancelled");
        }
    }
}

impl std::fmt::Debug for PendingRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingRequest")
            .field("id", &self.id)
            .field("channel", &self.channel)
            .field("kind", &self.kind)
            .finish_non_exhaustive()
    }
}

/// Request/answer correlation over a transport
pub struct RpcLayer {
    transport: Arc<dyn Transport>,
    registry: Arc<Mutex<Registry>>,
    subscriptions: Mutex<BTreeSet<Channel>>,
}

impl RpcLayer {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        RpcLayer {
            transport,
            registry: Arc::new(Mutex::new(Registry::default())),
            subscriptions: Mutex::new(BTreeSet::new()),
        }
    }

    /// Register and send a request. Never waits for the answer.
    pub fn send(
        &self,
        kind: RequestKind,
        channel: Channel,
        message: Option<WireMessage>,
    ) -> Result<PendingRequest, RequestError> {
        let (tx, rx) = oneshot::channel();

        let id = self.registry.lock().register(Slot {
            channel: channel.clone(),
            kind,
            completion: tx,
        });

        let frame = match Request::new(id, kind, channel.clone(), message).encode() {
            Ok(frame) => frame,
            Err(e) => {
                self.registry.lock().slots.remove(&id);
                return Err(ProtocolError::MalformedData(e.to_string()).into());
            }
        };

        if let Err(e) = self.transport.send_frame(frame) {
            self.registry.lock().slots.remove(&id);
            tracing::error!(id, %channel, error = %e, "Transport rejected request");
            return Err(e.into());
        }

        tracing::debug!(id, %channel, ?kind, "Request sent");
        Ok(PendingRequest {
            id,
            channel,
            kind,
            completion: rx,
            registry: Arc::clone(&self.registry),
            resolved: false,
        })
    }

    /// Route one inbound frame. Answers resolve their request; broadcasts
    /// are handed back to the caller.
    pub fn handle_frame(&self, frame: &str) -> WireResult<Option<Broadcast>> {
        match decode_frame(frame)? {
            Incoming::Answer(answer) => {
                self.resolve(answer);
                Ok(None)
            }
            Incoming::Broadcast(broadcast) => Ok(Some(broadcast)),
        }
    }

    fn resolve(&self, answer: Answer) {
        let id = answer.id;
        let Some(slot) = self.registry.lock().slots.remove(&id) else {
            tracing::warn!(id, "Discarding late or unknown answer");
            return;
        };

        let result = answer.into_result();
        if result.is_ok() {
            match slot.kind {
                RequestKind::Subscribe => {
                    if self.subscriptions.lock().insert(slot.channel.clone()) {
                        tracing::info!(channel = %slot.channel, "Subscribed");
                    }
                }
                RequestKind::Unsubscribe => {
                    if self.subscriptions.lock().remove(&slot.channel) {
                        tracing::info!(channel = %slot.channel, "Unsubscribed");
                    }
                }
                RequestKind::Publish | RequestKind::Catchup => {}
            }
        }

        if slot.completion.send(result).is_err() {
            tracing::debug!(id, "Answer arrived after the caller gave up");
        }
    }

    /// Fail every in-flight request, e.g. when the link drops
    pub fn fail_all(&self, error: TransportError) {
        let slots: Vec<Slot> = self.registry.lock().slots.drain().map(|(_, s)| s).collect();
        if !slots.is_empty() {
            tracing::warn!(count = slots.len(), error = %error, "Failing in-flight requests");
        }
        for slot in slots {
            let _ = slot.completion.send(Err(error.clone().into()));
        }
    }

    /// Re-issue Subscribe for every recorded channel
    pub fn resubscribe(&self) -> Vec<(Channel, Result<PendingRequest, RequestError>)> {
        self.subscriptions()
            .into_iter()
            .map(|channel| {
                let pending = self.send(RequestKind::Subscribe, channel.clone(), None);
                (channel, pending)
            })
            .collect()
    }

    pub fn subscriptions(&self) -> Vec<Channel> {
        self.subscriptions.lock().iter().cloned().collect()
    }

    pub fn in_flight(&self) -> usize {
        self.registry.lock().slots.len()
    }

    pub fn is_in_flight(&self, id: u64) -> bool {
        self.registry.lock().slots.contains_key(&id)
    }
}
