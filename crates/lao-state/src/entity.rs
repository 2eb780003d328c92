//! Tracked entity - the witnessing aggregate of one protocol object
//!
//! Every accepted modification is kept together with the witnesses
//! collected for it. The authoritative snapshot is derived from them:
//! starting at the Create, modifications are folded in ascending
//! `ModificationOrder`, skipping those without quorum under the witness
//! set in force at their rank. The result is a function of which messages
//! and signatures are known, never of the order they arrived in.

use std::cmp::Ordering;
use std::collections::{BTreeSet, HashMap, HashSet};

use lao_core::{Channel, EntityId, MessageId, ProtocolResult, PublicKey, Timestamp};
use lao_crypto::SignedEnvelope;
use lao_wire::ProtocolData;

use crate::{EntitySnapshot, QuorumPolicy};

/// Total order over modifications of one entity.
///
/// Later `at` ranks higher; on equal `at` the lexicographically smaller
/// message id ranks higher. The highest ranked modification wins.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ModificationOrder {
    pub at: Timestamp,
    pub id: MessageId,
}

impl Ord for ModificationOrder {
    fn cmp(&self, other: &Self) -> Ordering {
        self.at.cmp(&other.at).then_with(|| other.id.cmp(&self.id))
    }
}

impl PartialOrd for ModificationOrder {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Modification with the witness signatures gathered for it
#[derive(Clone, Debug)]
pub struct Modification {
    pub data: ProtocolData,
    pub envelope: SignedEnvelope,
    pub order: ModificationOrder,
    /// Keys whose signature over the message id verified
    pub witnesses: BTreeSet<PublicKey>,
    /// Folded into the snapshot by the last derivation
    pub promoted: bool,
}

/// Where the witness set of an entity comes from
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WitnessSource {
    /// Declared by the Create and redeclared by each folded state
    Declared,
    /// The organization's set at the entity's creation time
    Organization(EntityId),
}

/// Witness sets inherited from an organization
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Inherited {
    pub governing: BTreeSet<PublicKey>,
    pub recognized: BTreeSet<PublicKey>,
}

/// Entity under reconciliation
#[derive(Clone, Debug)]
pub struct TrackedEntity {
    pub id: EntityId,
    pub channel: Channel,
    pub organizer: PublicKey,
    pub source: WitnessSource,
    pub create_id: MessageId,
    pub created_at: Timestamp,
    initial: EntitySnapshot,
    initial_witnesses: BTreeSet<PublicKey>,
    /// Witness set governing the next modification
    pub witness_set: BTreeSet<PublicKey>,
    /// Witness set in force from each folded timestamp on
    history: Vec<(Timestamp, BTreeSet<PublicKey>)>,
    /// Every key any known state of the entity names as witness
    recognized: BTreeSet<PublicKey>,
    pub last_modification: MessageId,
    pub last_modified_at: Timestamp,
    pub modifications: HashMap<MessageId, Modification>,
    pub snapshot: EntitySnapshot,
}

impl TrackedEntity {
    pub fn new(
        channel: Channel,
        organizer: PublicKey,
        source: WitnessSource,
        create_id: MessageId,
        created_at: Timestamp,
        snapshot: EntitySnapshot,
        witnesses: Inherited,
    ) -> Self {
        TrackedEntity {
            id: snapshot.id(),
            channel,
            organizer,
            source,
            create_id,
            created_at,
            initial: snapshot.clone(),
            initial_witnesses: witnesses.governing.clone(),
            witness_set: witnesses.governing.clone(),
            history: vec![(created_at, witnesses.governing)],
            recognized: witnesses.recognized,
            last_modification: create_id,
            last_modified_at: created_at,
            modifications: HashMap::new(),
            snapshot,
        }
    }

    /// Fails if `data` can never apply to this entity
    pub fn admits(&self, data: &ProtocolData) -> ProtocolResult<()> {
        self.initial.reduce(data).map(|_| ())
    }

    /// True if `key` is named as witness by any known state
    pub fn recognizes(&self, key: &PublicKey) -> bool {
        self.recognized.contains(key)
    }

    pub fn recognized(&self) -> &BTreeSet<PublicKey> {
        &self.recognized
    }

    /// Witness set in force at `at`
    pub fn witnesses_at(&self, at: Timestamp) -> &BTreeSet<PublicKey> {
        self.history
            .iter()
            .rev()
            .find(|(from, _)| *from <= at)
            .or_else(|| self.history.first())
            .map_or(&self.initial_witnesses, |(_, set)| set)
    }

    /// Sets an organization passes down to a child created at `at`
    pub fn inherited_at(&self, at: Timestamp) -> Inherited {
        Inherited {
            governing: self.witnesses_at(at).clone(),
            recognized: self.recognized.clone(),
        }
    }

    /// Replace inherited sets; returns false when nothing changed
    pub(crate) fn inherit(&mut self, witnesses: Inherited) -> bool {
        if witnesses.governing == self.initial_witnesses && witnesses.recognized == self.recognized {
            return false;
        }
        self.initial_witnesses = witnesses.governing;
        self.recognized = witnesses.recognized;
        true
    }

    pub fn is_pending(&self, id: &MessageId) -> bool {
        self.modifications.get(id).is_some_and(|m| !m.promoted)
    }

    /// Modifications still short of quorum
    pub fn pending(&self) -> impl Iterator<Item = &Modification> {
        self.modifications.values().filter(|m| !m.promoted)
    }

    pub(crate) fn insert(&mut self, modification: Modification) {
        if self.source == WitnessSource::Declared {
            if let Some(declared) = declared_witnesses(&modification.data) {
                self.recognized.extend(declared.iter().copied());
            }
        }
        self.modifications.insert(modification.order.id, modification);
    }

    /// Recompute the snapshot from the Create and every modification.
    /// Returns the ids folded in.
    pub(crate) fn derive(&mut self, policy: &QuorumPolicy) -> Vec<MessageId> {
        let mut ordered: Vec<&Modification> = self.modifications.values().collect();
        ordered.sort_by_key(|m| m.order);

        let mut state = self.initial.clone();
        let mut governing = self.initial_witnesses.clone();
        let mut history = vec![(self.created_at, governing.clone())];
        let mut head = None;
        let mut folded = Vec::new();

        for m in ordered {
            if m.order.at < self.created_at {
                continue;
            }
            let signed = m.witnesses.intersection(&governing).count();
            if !policy.is_met(signed, governing.len()) {
                continue;
            }
            let Ok(next) = state.reduce(&m.data) else {
                continue;
            };
            state = next;
            if self.source == WitnessSource::Declared {
                if let Some(declared) = state.declared_witnesses() {
                    governing = declared.iter().copied().collect();
                    history.push((m.order.at, governing.clone()));
                }
            }
            head = Some(m.order);
            folded.push(m.order.id);
        }

        let promoted: HashSet<MessageId> = folded.iter().copied().collect();
        for m in self.modifications.values_mut() {
            m.promoted = promoted.contains(&m.order.id);
        }

        self.snapshot = state;
        self.witness_set = governing;
        self.history = history;
        (self.last_modification, self.last_modified_at) = match head {
            Some(order) => (order.id, order.at),
            None => (self.create_id, self.created_at),
        };
        folded
    }
}

/// Witnesses named by organization modifications
fn declared_witnesses(data: &ProtocolData) -> Option<&[PublicKey]> {
    match data {
        ProtocolData::UpdateLao(d) => Some(&d.witnesses),
        ProtocolData::StateLao(d) => Some(&d.witnesses),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lao_crypto::{Identity, Signer};
    use lao_wire::{CreateLao, UpdateLao};

    fn id(s: &[u8]) -> MessageId {
        MessageId::compute(s, b"sig")
    }

    fn key(b: u8) -> PublicKey {
        PublicKey::from_bytes([b; 32])
    }

    fn organization(witnesses: Vec<PublicKey>) -> (TrackedEntity, Identity, CreateLao) {
        let organizer = Identity::from_bytes(&[1; 32]);
        let create = CreateLao::new(organizer.public_key(), "LAO", Timestamp(100), witnesses.clone());
        let snapshot = EntitySnapshot::from_create(&ProtocolData::CreateLao(create.clone())).unwrap();
        let set: BTreeSet<_> = witnesses.into_iter().collect();
        let entity = TrackedEntity::new(
            Channel::for_lao(create.id.as_str()).unwrap(),
            organizer.public_key(),
            WitnessSource::Declared,
            id(b"create"),
            Timestamp(100),
            snapshot,
            Inherited {
                governing: set.clone(),
                recognized: set,
            },
        );
        (entity, organizer, create)
    }

    fn update(
        organizer: &Identity,
        create: &CreateLao,
        at: i64,
        witnesses: Vec<PublicKey>,
        signed_by: &[PublicKey],
    ) -> Modification {
        let data = ProtocolData::UpdateLao(UpdateLao {
            id: create.id,
            name: format!("at-{at}"),
            last_modified: Timestamp(at),
            witnesses,
        });
        let envelope = SignedEnvelope::seal(data.encode().unwrap(), organizer);
        Modification {
            order: ModificationOrder {
                at: Timestamp(at),
                id: envelope.message_id(),
            },
            data,
            envelope,
            witnesses: signed_by.iter().copied().collect(),
            promoted: false,
        }
    }

    #[test]
    fn test_later_timestamp_wins() {
        let a = ModificationOrder { at: Timestamp(100), id: id(b"a") };
        let b = ModificationOrder { at: Timestamp(200), id: id(b"b") };
        assert!(b > a);
    }

    #[test]
    fn test_tie_goes_to_smaller_id() {
        let x = id(b"x");
        let y = id(b"y");
        let (small, large) = if x < y { (x, y) } else { (y, x) };

        let winner = ModificationOrder { at: Timestamp(5), id: small };
        let loser = ModificationOrder { at: Timestamp(5), id: large };
        assert!(winner > loser);
        assert_eq!(
            [loser, winner].into_iter().max(),
            Some(winner)
        );
    }

    #[test]
    fn test_witness_change_governs_later_modifications() {
        let (mut entity, organizer, create) = organization(vec![key(10)]);

        // Drops witness 10 in favour of 11, signed under the old set
        entity.insert(update(&organizer, &create, 200, vec![key(11)], &[key(10)]));
        // Signed only by the old witness, so it needs 11 now
        entity.insert(update(&organizer, &create, 300, vec![key(11)], &[key(10)]));

        let folded = entity.derive(&QuorumPolicy::AllWitnesses);
        assert_eq!(folded.len(), 1);
        assert_eq!(entity.last_modified_at, Timestamp(200));
        assert_eq!(entity.witness_set, BTreeSet::from([key(11)]));
        assert_eq!(entity.witnesses_at(Timestamp(150)), &BTreeSet::from([key(10)]));
        assert_eq!(entity.witnesses_at(Timestamp(250)), &BTreeSet::from([key(11)]));
        assert!(entity.recognizes(&key(10)) && entity.recognizes(&key(11)));
        assert_eq!(entity.pending().count(), 1);
    }

    #[test]
    fn test_derive_is_insertion_order_independent() {
        let (template, organizer, create) = organization(vec![key(10)]);
        let mods = vec![
            update(&organizer, &create, 300, vec![], &[key(10)]),
            update(&organizer, &create, 200, vec![], &[key(10)]),
            update(&organizer, &create, 400, vec![key(10)], &[]),
        ];

        let mut forward = template.clone();
        for m in mods.iter().cloned() {
            forward.insert(m);
            forward.derive(&QuorumPolicy::AllWitnesses);
        }
        let mut backward = template;
        for m in mods.into_iter().rev() {
            backward.insert(m);
            backward.derive(&QuorumPolicy::AllWitnesses);
        }

        assert_eq!(forward.snapshot, backward.snapshot);
        assert_eq!(forward.witness_set, backward.witness_set);
        // 200 empties the set, so 300 and 400 need no witness
        assert_eq!(forward.last_modified_at, Timestamp(400));
        assert!(forward.witness_set.contains(&key(10)));
    }
}
