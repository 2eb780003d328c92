//! LAO client - ties the RPC layer to the reconciliation store

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::broadcast;

use lao_core::{Channel, EntityId, MessageId, RequestError, TransportError};
use lao_crypto::{SignedEnvelope, Signer};
use lao_state::{ApplyError, ApplyOutcome, Applied, EntitySnapshot, ReconciliationStore};
use lao_transport::{EventReceiver, Transport, TransportEvent};
use lao_wire::{
    catchup_messages, expect_ack, Broadcast, ProtocolData, RequestKind, WireMessage,
    WitnessMessage,
};

use crate::{ClientConfig, ClientResult, RpcLayer};

/// Snapshot change published to presentation collaborators
#[derive(Clone, Debug, PartialEq)]
pub struct SnapshotUpdate {
    pub channel: Channel,
    pub entity: EntityId,
    pub snapshot: EntitySnapshot,
    pub outcome: ApplyOutcome,
}

/// Envelope waiting for an entity it depends on
#[derive(Debug)]
struct Deferred {
    channel: Channel,
    envelope: SignedEnvelope,
    attempts: u32,
}

/// LAO client
pub struct LaoClient {
    config: ClientConfig,
    rpc: RpcLayer,
    store: Mutex<ReconciliationStore>,
    deferred: Mutex<VecDeque<Deferred>>,
    updates: broadcast::Sender<SnapshotUpdate>,
    signer: Arc<dyn Signer>,
}

impl LaoClient {
    pub fn new(config: ClientConfig, transport: Arc<dyn Transport>, signer: Arc<dyn Signer>) -> Self {
        let store = ReconciliationStore::new(config.store_config());
        Self::with_store(config, transport, signer, store)
    }

    /// Client over an already constructed store
    pub fn with_store(
        config: ClientConfig,
        transport: Arc<dyn Transport>,
        signer: Arc<dyn Signer>,
        store: ReconciliationStore,
    ) -> Self {
        let (updates, _) = broadcast::channel(config.event_buffer.max(1));
        LaoClient {
            config,
            rpc: RpcLayer::new(transport),
            store: Mutex::new(store),
            deferred: Mutex::new(VecDeque::new()),
            updates,
            signer,
        }
    }

    /// Receive snapshot changes from now on
    pub fn updates(&self) -> broadcast::Receiver<SnapshotUpdate> {
        self.updates.subscribe()
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn rpc(&self) -> &RpcLayer {
        &self.rpc
    }

    async fn request(
        &self,
        kind: RequestKind,
        channel: &Channel,
        message: Option<WireMessage>,
    ) -> Result<Value, RequestError> {
        self.rpc
            .send(kind, channel.clone(), message)?
            .wait(self.config.request_timeout)
            .await
    }

    /// Subscribe to `channel`, then catch up on its history.
    /// Returns the number of catch-up messages applied.
    pub async fn subscribe(&self, channel: &Channel) -> ClientResult<usize> {
        let result = self.request(RequestKind::Subscribe, channel, None).await?;
        expect_ack(&result)?;
        self.catchup(channel).await
    }

    pub async fn unsubscribe(&self, channel: &Channel) -> ClientResult<()> {
        let result = self.request(RequestKind::Unsubscribe, channel, None).await?;
        expect_ack(&result)?;
        Ok(())
    }

    /// Fetch and apply the relay's history for `channel`
    pub async fn catchup(&self, channel: &Channel) -> ClientResult<usize> {
        let result = self.request(RequestKind::Catchup, channel, None).await?;
        let messages = catchup_messages(result)?;
        let total = messages.len();

        let mut applied = 0;
        for message in messages {
            let envelope = match SignedEnvelope::try_from(message) {
                Ok(envelope) => envelope,
                Err(e) => {
                    tracing::warn!(%channel, error = %e, "Skipping undecodable catch-up message");
                    continue;
                }
            };
            if self.apply(channel, envelope).is_ok() {
                applied += 1;
            }
        }

        tracing::debug!(%channel, total, applied, "Catch-up complete");
        Ok(applied)
    }

    /// Sign, publish and locally apply `data`
    pub async fn publish(&self, channel: &Channel, data: &ProtocolData) -> ClientResult<SignedEnvelope> {
        let envelope = SignedEnvelope::seal(data.encode()?, self.signer.as_ref());
        self.publish_envelope(channel, &envelope).await?;
        Ok(envelope)
    }

    /// Publish an already sealed envelope
    pub async fn publish_envelope(&self, channel: &Channel, envelope: &SignedEnvelope) -> ClientResult<()> {
        let result = self
            .request(RequestKind::Publish, channel, Some(WireMessage::from(envelope)))
            .await?;
        expect_ack(&result)?;

        // The relay does not echo our own message back
        if let Err(e) = self.apply(channel, envelope.clone()) {
            tracing::debug!(%channel, message_id = %envelope.message_id(), error = %e, "Published message not applied locally");
        }
        Ok(())
    }

    /// Publish this client's witness signature for `target`
    pub async fn witness(&self, channel: &Channel, target: MessageId) -> ClientResult<SignedEnvelope> {
        let data = ProtocolData::Witness(WitnessMessage {
            message_id: target,
            signature: self.signer.sign(&target.digest()),
        });
        self.publish(channel, &data).await
    }

    /// Apply one envelope to the store. Envelopes whose entity is not
    /// known yet are deferred and retried after later successes.
    pub fn apply(&self, channel: &Channel, envelope: SignedEnvelope) -> ClientResult<Applied> {
        let result = self.store.lock().apply_incoming(channel, envelope.clone());
        match result {
            Ok(applied) => {
                self.notify(channel, &applied);
                self.reprocess_deferred();
                Ok(applied)
            }
            Err(e) => {
                if e.is_deferrable() {
                    self.defer(channel, envelope);
                }
                Err(e.into())
            }
        }
    }

    fn defer(&self, channel: &Channel, envelope: SignedEnvelope) {
        let message_id = envelope.message_id();
        let mut deferred = self.deferred.lock();
        if deferred.iter().any(|d| d.envelope.message_id() == message_id) {
            return;
        }
        tracing::debug!(%channel, %message_id, "Deferring message");
        deferred.push_back(Deferred {
            channel: channel.clone(),
            envelope,
            attempts: 0,
        });
    }

    /// Retry deferred envelopes until a pass makes no progress.
    /// Each call counts as one attempt per envelope.
    fn reprocess_deferred(&self) {
        let mut first_pass = true;
        loop {
            let batch: Vec<Deferred> = self.deferred.lock().drain(..).collect();
            if batch.is_empty() {
                return;
            }

            let mut progressed = false;
            let mut waiting = Vec::new();
            for mut item in batch {
                let result = self
                    .store
                    .lock()
                    .apply_incoming(&item.channel, item.envelope.clone());
                match result {
                    Ok(applied) => {
                        progressed = true;
                        self.notify(&item.channel, &applied);
                    }
                    Err(ApplyError::UnknownEntity(entity)) => {
                        if first_pass {
                            item.attempts += 1;
                        }
                        if item.attempts >= self.config.max_reprocessing {
                            tracing::warn!(
                                channel = %item.channel,
                                message_id = %item.envelope.message_id(),
                                %entity,
                                attempts = item.attempts,
                                "Dropping message after repeated reprocessing"
                            );
                        } else {
                            waiting.push(item);
                        }
                    }
                    Err(e) => {
                        tracing::debug!(
                            message_id = %item.envelope.message_id(),
                            error = %e,
                            "Deferred message rejected"
                        );
                    }
                }
            }

            self.deferred.lock().extend(waiting);
            if !progressed {
                return;
            }
            first_pass = false;
        }
    }

    fn notify(&self, channel: &Channel, applied: &Applied) {
        if !matches!(applied.outcome, ApplyOutcome::Created | ApplyOutcome::Promoted) {
            return;
        }
        let (Some(entity), Some(snapshot)) = (applied.entity, applied.snapshot.clone()) else {
            return;
        };
        if applied.outcome == ApplyOutcome::Promoted {
            tracing::info!(%channel, %entity, message_id = %applied.message_id, "Modification promoted");
        }
        // No receivers is fine
        let _ = self.updates.send(SnapshotUpdate {
            channel: channel.clone(),
            entity,
            snapshot,
            outcome: applied.outcome,
        });
    }

    /// Handle one inbound frame
    pub fn handle_frame(&self, frame: &str) {
        match self.rpc.handle_frame(frame) {
            Ok(Some(broadcast)) => self.on_broadcast(broadcast),
            Ok(None) => {}
            Err(e) => tracing::warn!(error = %e, "Dropping undecodable frame"),
        }
    }

    fn on_broadcast(&self, broadcast: Broadcast) {
        let Broadcast { channel, message } = broadcast;
        match SignedEnvelope::try_from(message) {
            // Rejections are logged by the store
            Ok(envelope) => {
                let _ = self.apply(&channel, envelope);
            }
            Err(e) => tracing::warn!(%channel, error = %e, "Dropping undecodable broadcast"),
        }
    }

    fn on_reconnected(self: &Arc<Self>) {
        let timeout = self.config.request_timeout;
        for (channel, pending) in self.rpc.resubscribe() {
            let pending = match pending {
                Ok(pending) => pending,
                Err(e) => {
                    tracing::error!(%channel, error = %e, "Resubscribe failed");
                    continue;
                }
            };

            let client = Arc::clone(self);
            tokio::spawn(async move {
                let resubscribed = pending
                    .wait(timeout)
                    .await
                    .and_then(|result| expect_ack(&result));
                if let Err(e) = resubscribed {
                    tracing::warn!(%channel, error = %e, "Resubscribe not acknowledged");
                    return;
                }
                if let Err(e) = client.catchup(&channel).await {
                    tracing::warn!(%channel, error = %e, "Catch-up after reconnect failed");
                }
            });
        }
    }

    /// Receive loop. Runs until the transport event stream closes.
    pub async fn run(self: Arc<Self>, mut events: EventReceiver) {
        let period = self.config.orphan_horizon.max(Duration::from_secs(1));
        let mut prune = tokio::time::interval(period);
        prune.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                event = events.recv() => {
                    let Some(event) = event else { break };
                    match event {
                        TransportEvent::Frame(frame) => self.handle_frame(&frame),
                        TransportEvent::Disconnected => {
                            tracing::warn!("Transport disconnected");
                            self.rpc.fail_all(TransportError::Closed);
                        }
                        TransportEvent::Reconnected => {
                            tracing::info!("Transport reconnected");
                            self.on_reconnected();
                        }
                    }
                }
                _ = prune.tick() => {
                    let dropped = self.store.lock().prune_orphans();
                    if dropped > 0 {
                        tracing::debug!(dropped, "Pruned expired orphan witnesses");
                    }
                }
            }
        }
        tracing::debug!("Transport event stream closed");
    }

    pub fn snapshot(&self, id: &EntityId) -> Option<EntitySnapshot> {
        self.store.lock().snapshot(id).cloned()
    }

    pub fn is_applied(&self, id: &MessageId) -> bool {
        self.store.lock().is_applied(id)
    }

    pub fn deferred_count(&self) -> usize {
        self.deferred.lock().len()
    }

    pub fn subscriptions(&self) -> Vec<Channel> {
        self.rpc.subscriptions()
    }

    /// Run `f` against the store
    pub fn with_store_ref<R>(&self, f: impl FnOnce(&ReconciliationStore) -> R) -> R {
        f(&*self.store.lock())
    }
}
