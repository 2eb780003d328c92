//! Deterministic identities and protocol messages

use std::future::Future;
use std::time::Duration;

use lao_core::{Channel, ChannelError, EntityId, ProtocolResult, PublicKey, Timestamp};
use lao_crypto::{Identity, SignedEnvelope, Signer};
use lao_wire::{
    CloseRollCall, CreateLao, CreateRollCall, EndElection, OpenElection, OpenRollCall,
    ProtocolData, SetupElection, UpdateLao, WitnessMessage,
};

/// Seal `data` with `signer`
pub fn seal(data: &ProtocolData, signer: &dyn Signer) -> ProtocolResult<SignedEnvelope> {
    Ok(SignedEnvelope::seal(data.encode()?, signer))
}

/// Witness message from `witness` attesting `target`
pub fn witness_message(target: &SignedEnvelope, witness: &dyn Signer) -> ProtocolResult<SignedEnvelope> {
    let message_id = target.message_id();
    let data = ProtocolData::Witness(WitnessMessage {
        message_id,
        signature: witness.sign(&message_id.digest()),
    });
    seal(&data, witness)
}

/// One organization with its organizer and witnesses
#[derive(Clone)]
pub struct LaoFixture {
    pub organizer: Identity,
    pub witnesses: Vec<Identity>,
    pub create: CreateLao,
    pub channel: Channel,
}

impl LaoFixture {
    pub const CREATION: Timestamp = Timestamp(1_000);

    /// Organizer seeded with 1, witness `i` with `10 + i`
    pub fn new(name: &str, witness_count: u8) -> Result<Self, ChannelError> {
        Self::with_organizer(Identity::from_bytes(&[1; 32]), name, witness_count)
    }

    pub fn with_organizer(
        organizer: Identity,
        name: &str,
        witness_count: u8,
    ) -> Result<Self, ChannelError> {
        let witnesses: Vec<Identity> = (0..witness_count)
            .map(|i| Identity::from_bytes(&[10 + i; 32]))
            .collect();
        let create = CreateLao::new(
            organizer.public_key(),
            name,
            Self::CREATION,
            witnesses.iter().map(|w| w.public_key()).collect(),
        );
        let channel = Channel::for_lao(create.id.as_str())?;
        Ok(LaoFixture {
            organizer,
            witnesses,
            create,
            channel,
        })
    }

    pub fn id(&self) -> EntityId {
        self.create.id
    }

    pub fn witness_keys(&self) -> Vec<PublicKey> {
        self.witnesses.iter().map(|w| w.public_key()).collect()
    }

    pub fn create_data(&self) -> ProtocolData {
        ProtocolData::CreateLao(self.create.clone())
    }

    pub fn create_envelope(&self) -> ProtocolResult<SignedEnvelope> {
        seal(&self.create_data(), &self.organizer)
    }

    /// Rename keeping the witness set
    pub fn update_data(&self, name: &str, at: Timestamp) -> ProtocolData {
        self.witness_change_data(name, at, self.witness_keys())
    }

    /// Rename declaring `witnesses` as the new witness set
    pub fn witness_change_data(&self, name: &str, at: Timestamp, witnesses: Vec<PublicKey>) -> ProtocolData {
        ProtocolData::UpdateLao(UpdateLao {
            id: self.create.id,
            name: name.to_string(),
            last_modified: at,
            witnesses,
        })
    }

    /// `data` sealed by the organizer
    pub fn organizer_envelope(&self, data: &ProtocolData) -> ProtocolResult<SignedEnvelope> {
        seal(data, &self.organizer)
    }

    pub fn update_envelope(&self, name: &str, at: Timestamp) -> ProtocolResult<SignedEnvelope> {
        seal(&self.update_data(name, at), &self.organizer)
    }

    /// Witness messages for `target` from the first `count` witnesses
    pub fn witness_messages(
        &self,
        target: &SignedEnvelope,
        count: usize,
    ) -> ProtocolResult<Vec<SignedEnvelope>> {
        self.witnesses
            .iter()
            .take(count)
            .map(|w| witness_message(target, w))
            .collect()
    }

    /// Roll-call create, open and close data sharing one roll call
    pub fn roll_call_lifecycle(
        &self,
        name: &str,
        attendees: Vec<PublicKey>,
    ) -> (CreateRollCall, OpenRollCall, CloseRollCall) {
        let lao_id = self.create.id;
        let create = CreateRollCall::new(
            &lao_id,
            name,
            Timestamp(1_100),
            Timestamp(1_200),
            Timestamp(1_300),
            "main hall",
        );
        let open = OpenRollCall::new(&lao_id, create.id, Timestamp(1_200));
        let close = CloseRollCall::new(&lao_id, open.update_id, Timestamp(1_300), attendees);
        (create, open, close)
    }

    /// Election set up at `created_at`, ended at `ended_at` and opened at
    /// `opened_at`, whichever order those fall in
    pub fn election_lifecycle(
        &self,
        name: &str,
        created_at: Timestamp,
        ended_at: Timestamp,
        opened_at: Timestamp,
    ) -> (SetupElection, EndElection, OpenElection) {
        let lao = self.create.id;
        let setup = SetupElection::new(&lao, name, created_at, created_at, ended_at);
        let end = EndElection {
            lao,
            election: setup.id,
            created_at: ended_at,
            registered_votes: format!("{name}-tally"),
        };
        let open = OpenElection {
            lao,
            election: setup.id,
            opened_at,
        };
        (setup, end, open)
    }
}

/// Poll `condition` until it holds or `timeout` elapses
pub async fn wait_until<F>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let polling = async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    };
    tokio::time::timeout(timeout, polling).await.is_ok()
}

/// Await `future`, giving up after `timeout`
pub async fn within<F: Future>(timeout: Duration, future: F) -> Option<F::Output> {
    tokio::time::timeout(timeout, future).await.ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use lao_crypto::Ed25519Verifier;

    #[test]
    fn test_fixture_is_deterministic() {
        let a = LaoFixture::new("LAO", 3).unwrap();
        let b = LaoFixture::new("LAO", 3).unwrap();
        assert_eq!(a.id(), b.id());
        assert_eq!(a.channel, b.channel);
        assert_eq!(a.witness_keys().len(), 3);
    }

    #[test]
    fn test_messages_verify() {
        let lao = LaoFixture::new("LAO", 2).unwrap();
        let update = lao.update_envelope("Renamed", Timestamp(2_000)).unwrap();
        update.verify(&Ed25519Verifier).unwrap();

        for witness in lao.witness_messages(&update, 2).unwrap() {
            witness.verify(&Ed25519Verifier).unwrap();
            let ProtocolData::Witness(w) = ProtocolData::decode(witness.data()).unwrap() else {
                panic!("expected witness data");
            };
            assert_eq!(w.message_id, update.message_id());
        }
    }

    #[test]
    fn test_lifecycles_are_valid_on_lao_channel() {
        let lao = LaoFixture::new("LAO", 0).unwrap();
        let (create, open, close) = lao.roll_call_lifecycle("RC", vec![]);
        let (setup, end, open_election) =
            lao.election_lifecycle("Vote", Timestamp(2_000), Timestamp(2_100), Timestamp(2_200));

        for data in [
            ProtocolData::CreateRollCall(create),
            ProtocolData::OpenRollCall(open),
            ProtocolData::CloseRollCall(close),
            ProtocolData::SetupElection(setup),
            ProtocolData::EndElection(end),
            ProtocolData::OpenElection(open_election),
        ] {
            let decoded = ProtocolData::decode(&data.encode().unwrap()).unwrap();
            decoded.validate_on(&lao.channel).unwrap();
        }
    }
}
