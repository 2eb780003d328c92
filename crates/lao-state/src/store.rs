//! Reconciliation store - verification, routing and idempotent application
//!
//! Pipeline for every incoming envelope:
//! 1. Verify signature and message id
//! 2. Decode and validate the protocol data
//! 3. Route by role: Create / Modify / Witness
//! 4. Re-derive the entity, and the children inheriting its witnesses
//!
//! Any error leaves every tracked entity untouched.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use lao_core::{
    Channel, Clock, EntityId, MessageId, ProtocolError, PublicKey, SystemClock, Timestamp,
};
use lao_crypto::{Ed25519Verifier, SignedEnvelope, Verifier, WitnessSignature};
use lao_wire::{DataRole, ProtocolData};

use crate::{
    ApplyError, ApplyResult, EntitySnapshot, Inherited, MemoryStore, MessageStore, Modification,
    ModificationOrder, OrphanBuffer, OrphanWitness, QuorumPolicy, ReplayKey, StoredMessage,
    TrackedEntity, WitnessSource,
};

/// Store configuration
#[derive(Clone, Debug, PartialEq)]
pub struct StoreConfig {
    pub quorum: QuorumPolicy,
    pub orphan_horizon: Duration,
    pub max_orphans_per_channel: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        StoreConfig {
            quorum: QuorumPolicy::AllWitnesses,
            orphan_horizon: Duration::from_secs(300),
            max_orphans_per_channel: 256,
        }
    }
}

/// What applying an envelope did
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// A new entity was created
    Created,
    /// The modification waits for more witnesses
    Pending,
    /// The modification became authoritative
    Promoted,
    /// The modification reached quorum but ranks below the current state
    Stale,
    /// A witness was parked until its target arrives
    Buffered,
    /// Already applied; nothing changed
    Duplicate,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Applied {
    pub message_id: MessageId,
    pub entity: Option<EntityId>,
    pub snapshot: Option<EntitySnapshot>,
    pub outcome: ApplyOutcome,
}

/// Append-only log of settled message ids
#[derive(Debug, Default)]
pub struct AppliedLog {
    order: Vec<MessageId>,
    members: HashSet<MessageId>,
}

impl AppliedLog {
    /// Returns false if `id` was already recorded
    pub fn record(&mut self, id: MessageId) -> bool {
        if !self.members.insert(id) {
            return false;
        }
        self.order.push(id);
        true
    }

    pub fn contains(&self, id: &MessageId) -> bool {
        self.members.contains(id)
    }

    pub fn as_slice(&self) -> &[MessageId] {
        &self.order
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

/// Local replica of every entity the client follows
pub struct ReconciliationStore {
    config: StoreConfig,
    verifier: Arc<dyn Verifier>,
    clock: Arc<dyn Clock>,
    entities: HashMap<EntityId, TrackedEntity>,
    /// Roll-call update id -> roll-call id
    aliases: HashMap<EntityId, EntityId>,
    /// Create or modification message -> entity it belongs to
    owners: HashMap<MessageId, EntityId>,
    applied: AppliedLog,
    orphans: OrphanBuffer,
    persistence: Box<dyn MessageStore>,
}

impl ReconciliationStore {
    pub fn new(config: StoreConfig) -> Self {
        Self::with_collaborators(
            config,
            Arc::new(Ed25519Verifier),
            Arc::new(SystemClock),
            Box::new(MemoryStore::new()),
        )
    }

    pub fn with_collaborators(
        config: StoreConfig,
        verifier: Arc<dyn Verifier>,
        clock: Arc<dyn Clock>,
        persistence: Box<dyn MessageStore>,
    ) -> Self {
        let orphans = OrphanBuffer::new(config.orphan_horizon, config.max_orphans_per_channel);
        ReconciliationStore {
            config,
            verifier,
            clock,
            entities: HashMap::new(),
            aliases: HashMap::new(),
            owners: HashMap::new(),
            applied: AppliedLog::default(),
            orphans,
            persistence,
        }
    }

    /// Apply one envelope received on `channel`
    pub fn apply_incoming(
        &mut self,
        channel: &Channel,
        envelope: SignedEnvelope,
    ) -> ApplyResult<Applied> {
        let message_id = envelope.message_id();

        if let Err(e) = envelope.verify(self.verifier.as_ref()) {
            tracing::warn!(
                %channel,
                %message_id,
                sender = %envelope.sender(),
                error = %e,
                "Rejected envelope failing verification"
            );
            return Err(e.into());
        }

        let data = ProtocolData::decode(envelope.data())
            .and_then(|data| data.validate_on(channel).map(|()| data))
            .map_err(|e| {
                tracing::warn!(%channel, %message_id, error = %e, "Rejected malformed data");
                e
            })?;

        let (object, action) = data.kind();
        tracing::debug!(%channel, %message_id, %object, %action, "Applying message");

        let result = match data.role() {
            DataRole::Create => self.apply_create(channel, envelope, data),
            DataRole::Modify => self.apply_modify(channel, envelope, data),
            DataRole::Witness => self.apply_witness(channel, envelope, data),
        };

        match &result {
            Err(ApplyError::Protocol(e)) => {
                tracing::warn!(%channel, %message_id, error = %e, "Rejected message");
            }
            Err(ApplyError::UnknownEntity(id)) => {
                tracing::debug!(%channel, %message_id, entity = %id, "Message waits for unknown entity");
            }
            Ok(applied) => {
                tracing::debug!(%message_id, outcome = ?applied.outcome, "Message applied");
            }
        }
        result
    }

    /// Apply a sequence of stored messages, in the order given
    pub fn replay<I>(&mut self, messages: I) -> Vec<ApplyResult<Applied>>
    where
        I: IntoIterator<Item = StoredMessage>,
    {
        messages
            .into_iter()
            .map(|m| self.apply_incoming(&m.channel, m.envelope))
            .collect()
    }

    /// Stored messages for `channel` and its sub-channels, in replay order
    pub fn catch_up(&self, channel: &Channel) -> Vec<StoredMessage> {
        self.persistence.scan(channel)
    }

    fn apply_create(
        &mut self,
        channel: &Channel,
        envelope: SignedEnvelope,
        data: ProtocolData,
    ) -> ApplyResult<Applied> {
        let message_id = envelope.message_id();
        let id = data
            .target()
            .ok_or_else(|| malformed("create without entity id"))?;

        if let Some(entity) = self.entities.get(&id) {
            let snapshot = entity.snapshot.clone();
            self.merge_stored(&envelope);
            return Ok(self.settled(message_id, id, snapshot));
        }

        let sender = *envelope.sender();
        let created_at = data.last_modified().unwrap_or(Timestamp::ZERO);
        let (organizer, source, witnesses, entity_channel) = match &data {
            ProtocolData::CreateLao(d) => {
                if sender != d.organizer {
                    return Err(ProtocolError::Unauthorized(sender).into());
                }
                let lao_channel = Channel::for_lao(d.id.as_str())
                    .map_err(|e| malformed(e.to_string()))?;
                let declared: BTreeSet<PublicKey> = d.witnesses.iter().copied().collect();
                let witnesses = Inherited {
                    governing: declared.clone(),
                    recognized: declared,
                };
                (d.organizer, WitnessSource::Declared, witnesses, lao_channel)
            }
            _ => {
                let lao = self.organization_of(channel)?;
                if sender != lao.organizer {
                    return Err(ProtocolError::Unauthorized(sender).into());
                }
                (
                    lao.organizer,
                    WitnessSource::Organization(lao.id),
                    lao.inherited_at(created_at),
                    channel.clone(),
                )
            }
        };

        let snapshot = EntitySnapshot::from_create(&data)
            .ok_or_else(|| malformed("create without initial state"))?;
        let entity = TrackedEntity::new(
            entity_channel.clone(),
            organizer,
            source,
            message_id,
            created_at,
            snapshot.clone(),
            witnesses,
        );

        tracing::info!(
            entity = %id,
            kind = %snapshot.kind(),
            witnesses = entity.witness_set.len(),
            "Entity created"
        );

        self.entities.insert(id, entity);
        self.owners.insert(message_id, id);
        self.applied.record(message_id);
        self.persist(&entity_channel, envelope, &data);

        Ok(Applied {
            message_id,
            entity: Some(id),
            snapshot: Some(snapshot),
            outcome: ApplyOutcome::Created,
        })
    }

    fn apply_modify(
        &mut self,
        channel: &Channel,
        envelope: SignedEnvelope,
        data: ProtocolData,
    ) -> ApplyResult<Applied> {
        let message_id = envelope.message_id();
        let target = data
            .target()
            .ok_or_else(|| malformed("modification without target"))?;
        let entity_id = self.resolve(&target);

        let entity = self
            .entities
            .get(&entity_id)
            .ok_or(ApplyError::UnknownEntity(target))?;
        let sender = *envelope.sender();
        if sender != entity.organizer {
            return Err(ProtocolError::Unauthorized(sender).into());
        }

        let signers = self.verified_signers(&envelope, &data);

        if entity.modifications.contains_key(&message_id) {
            let grew = self
                .entities
                .get_mut(&entity_id)
                .and_then(|e| e.modifications.get_mut(&message_id))
                .map(|m| {
                    let before = m.witnesses.len();
                    m.witnesses.extend(signers);
                    m.witnesses.len() > before
                })
                .unwrap_or(false);

            self.merge_stored(&envelope);
            if !grew {
                return self.current(message_id, entity_id, ApplyOutcome::Duplicate);
            }
            return self.evaluate(entity_id, message_id);
        }

        // Reject kind mismatches before anything is recorded
        entity.admits(&data)?;

        let order = ModificationOrder {
            at: data.last_modified().unwrap_or(Timestamp::ZERO),
            id: message_id,
        };
        if order.at < entity.created_at {
            let snapshot = entity.snapshot.clone();
            tracing::debug!(entity = %entity_id, %message_id, at = %order.at, "Modification predates its entity");
            self.applied.record(message_id);
            self.owners.insert(message_id, entity_id);
            self.persist(channel, envelope, &data);
            return Ok(Applied {
                message_id,
                entity: Some(entity_id),
                snapshot: Some(snapshot),
                outcome: ApplyOutcome::Stale,
            });
        }

        let now = self.clock.now();
        let mut witnesses = signers;
        for orphan in self.orphans.take(channel, &message_id, now) {
            if entity.recognizes(&orphan.witness) {
                witnesses.insert(orphan.witness);
            } else {
                tracing::warn!(
                    witness = %orphan.witness,
                    %message_id,
                    "Dropping buffered signature from non-witness"
                );
            }
        }

        let update_id = data.update_id();
        let modification = Modification {
            data: data.clone(),
            envelope: envelope.clone(),
            order,
            witnesses,
            promoted: false,
        };

        if let Some(entity) = self.entities.get_mut(&entity_id) {
            entity.insert(modification);
        }
        if let Some(update_id) = update_id {
            self.aliases.insert(update_id, entity_id);
        }
        self.owners.insert(message_id, entity_id);
        self.persist(channel, envelope, &data);

        self.evaluate(entity_id, message_id)
    }

    fn apply_witness(
        &mut self,
        channel: &Channel,
        envelope: SignedEnvelope,
        data: ProtocolData,
    ) -> ApplyResult<Applied> {
        let message_id = envelope.message_id();
        let ProtocolData::Witness(witness_data) = &data else {
            return Err(malformed("witness role without witness data").into());
        };
        let target = witness_data.message_id;
        let attestation = WitnessSignature {
            witness: *envelope.sender(),
            signature: witness_data.signature,
        };
        if !attestation.verify(&target, self.verifier.as_ref()) {
            return Err(ProtocolError::BadWitnessSignature(attestation.witness).into());
        }

        let Some(entity_id) = self.owners.get(&target).copied() else {
            let evicted = self.orphans.insert(
                channel,
                OrphanWitness {
                    target,
                    witness: attestation.witness,
                    signature: attestation.signature,
                    received_at: self.clock.now(),
                },
            );
            if let Some(evicted) = evicted {
                tracing::warn!(%channel, target = %evicted.target, "Orphan buffer full, evicted oldest witness");
            }
            tracing::debug!(%channel, %target, witness = %attestation.witness, "Buffered orphan witness");
            self.persist(channel, envelope, &data);
            return Ok(Applied {
                message_id,
                entity: None,
                snapshot: None,
                outcome: ApplyOutcome::Buffered,
            });
        };

        let entity = self
            .entities
            .get_mut(&entity_id)
            .ok_or(ApplyError::UnknownEntity(entity_id))?;
        if !entity.recognizes(&attestation.witness) {
            return Err(ProtocolError::NotAWitness(attestation.witness).into());
        }

        let added = match entity.modifications.get_mut(&target) {
            Some(modification) => modification.witnesses.insert(attestation.witness),
            // Creates and modifications predating their entity
            None => false,
        };
        self.persist(channel, envelope, &data);

        if added {
            self.evaluate(entity_id, target)
        } else {
            self.current(target, entity_id, ApplyOutcome::Duplicate)
        }
    }

    /// Re-derive `entity_id` after `message_id` changed, then every child
    /// whose inherited witness set moved with it
    fn evaluate(&mut self, entity_id: EntityId, message_id: MessageId) -> ApplyResult<Applied> {
        let policy = self.config.quorum;
        let entity = self
            .entities
            .get_mut(&entity_id)
            .ok_or(ApplyError::UnknownEntity(entity_id))?;

        let before = entity.snapshot.clone();
        let was_promoted = entity.modifications.get(&message_id).is_some_and(|m| m.promoted);
        let folded = entity.derive(&policy);
        let now_promoted = entity.modifications.get(&message_id).is_some_and(|m| m.promoted);
        let changed = entity.snapshot != before;
        let is_head = entity.last_modification == message_id;
        let snapshot = entity.snapshot.clone();
        let at = entity.last_modified_at;

        for id in folded {
            self.applied.record(id);
        }

        let outcome = if !now_promoted {
            ApplyOutcome::Pending
        } else if was_promoted && !changed {
            ApplyOutcome::Duplicate
        } else if changed || is_head {
            ApplyOutcome::Promoted
        } else {
            ApplyOutcome::Stale
        };
        match outcome {
            ApplyOutcome::Promoted => {
                tracing::info!(entity = %entity_id, %message_id, %at, "Modification promoted");
            }
            ApplyOutcome::Stale => {
                tracing::debug!(entity = %entity_id, %message_id, "Quorum reached by outranked modification");
            }
            _ => {}
        }

        self.cascade(entity_id);

        Ok(Applied {
            message_id,
            entity: Some(entity_id),
            snapshot: Some(snapshot),
            outcome,
        })
    }

    /// Push an organization's witness sets down to its children
    fn cascade(&mut self, lao_id: EntityId) {
        let Some(lao) = self.entities.get(&lao_id) else {
            return;
        };
        if lao.source != WitnessSource::Declared {
            return;
        }
        let lao = lao.clone();

        let policy = self.config.quorum;
        let mut folded = Vec::new();
        for child in self.entities.values_mut() {
            if child.source != WitnessSource::Organization(lao_id) {
                continue;
            }
            if !child.inherit(lao.inherited_at(child.created_at)) {
                continue;
            }
            let before = child.snapshot.clone();
            folded.extend(child.derive(&policy));
            if child.snapshot != before {
                tracing::debug!(entity = %child.id, organization = %lao_id, "Witness set change re-derived entity");
            }
        }
        for id in folded {
            self.applied.record(id);
        }
    }

    /// Keys vouching for a modification: verified carried signatures,
    /// plus the aggregated signatures of a state message. Membership is
    /// decided when the snapshot is derived.
    fn verified_signers(&self, envelope: &SignedEnvelope, data: &ProtocolData) -> BTreeSet<PublicKey> {
        let verifier = self.verifier.as_ref();
        let mut signers: BTreeSet<PublicKey> = envelope.verified_witnesses(verifier).collect();

        if let Some((modification_id, signatures)) = data.modification_signatures() {
            signers.extend(
                signatures
                    .iter()
                    .filter(|s| {
                        WitnessSignature {
                            witness: s.witness,
                            signature: s.signature,
                        }
                        .verify(&modification_id, verifier)
                    })
                    .map(|s| s.witness),
            );
        }
        signers
    }

    fn organization_of(&self, channel: &Channel) -> ApplyResult<&TrackedEntity> {
        let lao_id: EntityId = channel
            .lao_id()
            .ok_or_else(|| malformed(format!("{channel} has no organization")))?
            .parse()?;
        self.entities
            .get(&lao_id)
            .ok_or(ApplyError::UnknownEntity(lao_id))
    }

    fn persist(&mut self, channel: &Channel, envelope: SignedEnvelope, data: &ProtocolData) {
        let id = envelope.message_id();
        let key = ReplayKey::new(data.last_modified(), data.role(), id);
        self.persistence.put(
            id,
            StoredMessage {
                channel: channel.clone(),
                envelope,
                key,
            },
        );
    }

    /// Fold newly carried witness signatures into the stored copy
    fn merge_stored(&mut self, incoming: &SignedEnvelope) {
        let id = incoming.message_id();
        let Some(mut stored) = self.persistence.get(&id) else {
            return;
        };

        let mut merged = stored.envelope.clone();
        for w in incoming.witness_signatures() {
            if merged.witness_signatures().iter().any(|e| e.witness == w.witness) {
                continue;
            }
            if let Ok(next) = merged.add_witness(w.witness, w.signature, self.verifier.as_ref()) {
                merged = next;
            }
        }

        if merged != stored.envelope {
            stored.envelope = merged;
            self.persistence.put(id, stored);
        }
    }

    fn settled(&self, message_id: MessageId, entity: EntityId, snapshot: EntitySnapshot) -> Applied {
        Applied {
            message_id,
            entity: Some(entity),
            snapshot: Some(snapshot),
            outcome: ApplyOutcome::Duplicate,
        }
    }

    fn current(
        &self,
        message_id: MessageId,
        entity_id: EntityId,
        outcome: ApplyOutcome,
    ) -> ApplyResult<Applied> {
        let entity = self
            .entities
            .get(&entity_id)
            .ok_or(ApplyError::UnknownEntity(entity_id))?;
        Ok(Applied {
            message_id,
            entity: Some(entity_id),
            snapshot: Some(entity.snapshot.clone()),
            outcome,
        })
    }

    /// Follow a roll-call update id to its roll-call
    pub fn resolve(&self, id: &EntityId) -> EntityId {
        self.aliases.get(id).copied().unwrap_or(*id)
    }

    pub fn entity(&self, id: &EntityId) -> Option<&TrackedEntity> {
        self.entities.get(&self.resolve(id))
    }

    pub fn snapshot(&self, id: &EntityId) -> Option<&EntitySnapshot> {
        self.entity(id).map(|e| &e.snapshot)
    }

    pub fn entities(&self) -> impl Iterator<Item = &TrackedEntity> {
        self.entities.values()
    }

    pub fn is_applied(&self, id: &MessageId) -> bool {
        self.applied.contains(id)
    }

    pub fn applied_log(&self) -> &AppliedLog {
        &self.applied
    }

    pub fn orphan_count(&self) -> usize {
        self.orphans.len()
    }

    /// Drop orphan witnesses past the horizon
    pub fn prune_orphans(&mut self) -> usize {
        self.orphans.prune(self.clock.now())
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }
}

impl Default for ReconciliationStore {
    fn default() -> Self {
        Self::new(StoreConfig::default())
    }
}

fn malformed(msg: impl Into<String>) -> ProtocolError {
    ProtocolError::MalformedData(msg.into())
}
