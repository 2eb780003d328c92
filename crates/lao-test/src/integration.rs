//! End-to-end scenarios
//!
//! Clients run against the simulated relay:
//! - Subscribe, publish and catch-up round trips
//! - Witnessed updates reaching quorum across clients
//! - Reconnect with resubscription and catch-up
//! - Order independence of the reconciliation store

use std::sync::Arc;
use std::time::Duration;

use lao_crypto::{Identity, Signer};
use lao_runtime::{ClientConfig, LaoClient};
use lao_transport::EventReceiver;

use crate::{PeerHandle, SimulatedRelay};

/// A client wired to the relay with its receive loop running
pub struct ConnectedClient {
    pub client: Arc<LaoClient>,
    pub peer: PeerHandle,
}

impl ConnectedClient {
    /// Must be called inside a tokio runtime
    pub fn connect(relay: &SimulatedRelay, identity: Identity, config: ClientConfig) -> Self {
        let (transport, events, peer) = relay.connect();
        let client = Arc::new(LaoClient::new(config, Arc::new(transport), Arc::new(identity)));
        spawn_receiver(&client, events);
        ConnectedClient { client, peer }
    }
}

fn spawn_receiver(client: &Arc<LaoClient>, events: EventReceiver) {
    tokio::spawn(Arc::clone(client).run(events));
}

/// Default scenario timeout
pub const SCENARIO_TIMEOUT: Duration = Duration::from_secs(5);

/// Key used by observers that are neither organizer nor witness
pub fn observer_identity() -> Identity {
    Identity::from_bytes(&[99; 32])
}

/// Public key of `identity`, handy in assertions
pub fn key_of(identity: &Identity) -> lao_core::PublicKey {
    identity.public_key()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{wait_until, within, LaoFixture};
    use lao_core::{Channel, RequestError, Timestamp};
    use lao_runtime::ClientError;
    use lao_state::{ApplyOutcome, ElectionStatus, EntitySnapshot, RollCallStatus};
    use lao_wire::ProtocolData;
    use proptest::prelude::*;

    fn organization_name(client: &LaoClient, lao: &LaoFixture) -> Option<String> {
        match client.snapshot(&lao.id()) {
            Some(EntitySnapshot::Organization(org)) => Some(org.name),
            _ => None,
        }
    }

    #[tokio::test]
    async fn test_subscribe_resolves_and_clears_registry() {
        let relay = SimulatedRelay::new();
        let alice = ConnectedClient::connect(&relay, observer_identity(), ClientConfig::default());
        let channel = Channel::parse("/root/abc").unwrap();

        let applied = within(SCENARIO_TIMEOUT, alice.client.subscribe(&channel)).await;
        assert_eq!(applied, Some(Ok(0)));
        assert_eq!(alice.client.rpc().in_flight(), 0);
        assert_eq!(alice.peer.subscriptions(), vec![channel]);
    }

    #[tokio::test]
    async fn test_organizer_only_create_is_immediately_authoritative() {
        let relay = SimulatedRelay::new();
        let lao = LaoFixture::new("Organizer only", 0).unwrap();
        let organizer = ConnectedClient::connect(&relay, lao.organizer.clone(), ClientConfig::default());

        organizer
            .client
            .publish(&Channel::root(), &lao.create_data())
            .await
            .unwrap();

        let Some(EntitySnapshot::Organization(org)) = organizer.client.snapshot(&lao.id()) else {
            panic!("expected organization");
        };
        assert_eq!(org.name, lao.create.name);
        assert_eq!(org.creation, lao.create.creation);
        assert_eq!(org.organizer, lao.create.organizer);
        assert!(org.witnesses.is_empty());

        // A late subscriber gets it through catch-up
        let observer = ConnectedClient::connect(&relay, observer_identity(), ClientConfig::default());
        assert_eq!(observer.client.subscribe(&lao.channel).await, Ok(1));
        assert_eq!(observer.client.snapshot(&lao.id()), organizer.client.snapshot(&lao.id()));
    }

    #[tokio::test]
    async fn test_update_promotes_after_every_witness_signs() {
        let relay = SimulatedRelay::new();
        let lao = LaoFixture::new("Witnessed", 3).unwrap();
        relay.inject(&Channel::root(), &lao.create_envelope().unwrap()).unwrap();

        let observer = ConnectedClient::connect(&relay, observer_identity(), ClientConfig::default());
        observer.client.subscribe(&lao.channel).await.unwrap();
        let mut updates = observer.client.updates();

        let organizer = ConnectedClient::connect(&relay, lao.organizer.clone(), ClientConfig::default());
        organizer.client.subscribe(&lao.channel).await.unwrap();
        let update = organizer
            .client
            .publish(&lao.channel, &lao.update_data("Renamed", Timestamp(2_000)))
            .await
            .unwrap();

        let witnesses: Vec<ConnectedClient> = lao
            .witnesses
            .iter()
            .map(|w| ConnectedClient::connect(&relay, w.clone(), ClientConfig::default()))
            .collect();

        for witness in &witnesses[..2] {
            witness
                .client
                .witness(&lao.channel, update.message_id())
                .await
                .unwrap();
        }

        let collected = || {
            observer.client.with_store_ref(|store| {
                store
                    .entity(&lao.id())
                    .and_then(|e| e.modifications.get(&update.message_id()))
                    .map_or(0, |p| p.witnesses.len())
            })
        };
        assert!(wait_until(SCENARIO_TIMEOUT, || collected() == 2).await);
        assert_eq!(organization_name(&observer.client, &lao).as_deref(), Some("Witnessed"));

        witnesses[2]
            .client
            .witness(&lao.channel, update.message_id())
            .await
            .unwrap();

        let promoted = within(SCENARIO_TIMEOUT, updates.recv()).await.unwrap().unwrap();
        assert_eq!(promoted.outcome, ApplyOutcome::Promoted);
        assert_eq!(promoted.entity, lao.id());
        assert_eq!(organization_name(&observer.client, &lao).as_deref(), Some("Renamed"));

        // The organizer's replica converges too
        assert!(
            wait_until(SCENARIO_TIMEOUT, || {
                organization_name(&organizer.client, &lao).as_deref() == Some("Renamed")
            })
            .await
        );
    }

    #[tokio::test]
    async fn test_reconnect_catches_up_on_missed_messages() {
        let relay = SimulatedRelay::new();
        let lao = LaoFixture::new("Flaky", 0).unwrap();
        relay.inject(&Channel::root(), &lao.create_envelope().unwrap()).unwrap();

        let observer = ConnectedClient::connect(&relay, observer_identity(), ClientConfig::default());
        observer.client.subscribe(&lao.channel).await.unwrap();

        observer.peer.disconnect();
        assert!(wait_until(SCENARIO_TIMEOUT, || observer.peer.subscriptions().is_empty()).await);

        let update = lao.update_envelope("Missed", Timestamp(3_000)).unwrap();
        relay.inject(&lao.channel, &update).unwrap();
        assert_eq!(organization_name(&observer.client, &lao).as_deref(), Some("Flaky"));

        observer.peer.reconnect();
        assert!(
            wait_until(SCENARIO_TIMEOUT, || {
                organization_name(&observer.client, &lao).as_deref() == Some("Missed")
            })
            .await
        );
        assert_eq!(observer.peer.subscriptions(), vec![lao.channel.clone()]);
        assert!(observer.client.is_applied(&update.message_id()));
    }

    #[tokio::test]
    async fn test_roll_call_lifecycle() {
        let relay = SimulatedRelay::new();
        let lao = LaoFixture::new("Events", 0).unwrap();
        let organizer = ConnectedClient::connect(&relay, lao.organizer.clone(), ClientConfig::default());
        organizer.client.publish(&Channel::root(), &lao.create_data()).await.unwrap();

        let attendees = vec![key_of(&observer_identity()), lao.organizer.public_key()];
        let (create, open, close) = lao.roll_call_lifecycle("Check-in", attendees.clone());
        let roll_call = create.id;
        for data in [
            ProtocolData::CreateRollCall(create),
            ProtocolData::OpenRollCall(open),
            ProtocolData::CloseRollCall(close),
        ] {
            organizer.client.publish(&lao.channel, &data).await.unwrap();
        }

        let observer = ConnectedClient::connect(&relay, observer_identity(), ClientConfig::default());
        assert_eq!(observer.client.subscribe(&lao.channel).await, Ok(4));

        let Some(EntitySnapshot::RollCall(rc)) = observer.client.snapshot(&roll_call) else {
            panic!("expected roll call");
        };
        let mut expected = attendees;
        expected.sort();
        assert_eq!(rc.status, RollCallStatus::Closed);
        assert_eq!(rc.opened_at, Some(Timestamp(1_200)));
        assert_eq!(rc.attendees, expected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_relay_times_out() {
        let relay = SimulatedRelay::new();
        relay.set_silent(true);
        let config = ClientConfig::default().with_request_timeout(Duration::from_secs(1));
        let alice = ConnectedClient::connect(&relay, observer_identity(), config);

        let result = alice.client.subscribe(&Channel::root()).await;
        assert_eq!(result, Err(ClientError::Request(RequestError::RequestTimeout)));
        assert!(alice.client.subscriptions().is_empty());
    }

    #[tokio::test]
    async fn test_catchup_twice_converges() {
        let relay = SimulatedRelay::new();
        let lao = LaoFixture::new("Replay", 2).unwrap();
        let update = lao.update_envelope("Replayed", Timestamp(2_500)).unwrap();

        relay.inject(&Channel::root(), &lao.create_envelope().unwrap()).unwrap();
        relay.inject(&lao.channel, &update).unwrap();
        for witness in lao.witness_messages(&update, 2).unwrap() {
            relay.inject(&lao.channel, &witness).unwrap();
        }

        let observer = ConnectedClient::connect(&relay, observer_identity(), ClientConfig::default());
        observer.client.subscribe(&lao.channel).await.unwrap();
        let first = observer.client.snapshot(&lao.id());

        observer.client.catchup(&lao.channel).await.unwrap();
        assert_eq!(observer.client.snapshot(&lao.id()), first);
        assert_eq!(organization_name(&observer.client, &lao).as_deref(), Some("Replayed"));
    }

    /// Roll call, election and organization messages whose witnesses
    /// depend on a witness-set change
    struct Corpus {
        messages: Vec<lao_crypto::SignedEnvelope>,
        roll_call: lao_core::EntityId,
        election: lao_core::EntityId,
        attendees: Vec<lao_core::PublicKey>,
    }

    fn witnessed(
        lao: &LaoFixture,
        messages: &mut Vec<lao_crypto::SignedEnvelope>,
        data: ProtocolData,
        witnesses: usize,
    ) {
        let envelope = lao.organizer_envelope(&data).unwrap();
        messages.extend(lao.witness_messages(&envelope, witnesses).unwrap());
        messages.push(envelope);
    }

    /// With witnesses A, B, C:
    /// - the trim at 1500 drops C, signed by all three
    /// - the rename at 3000 is signed by A and B only
    /// - the roll call, created at 1100, needs all three
    /// - the election, set up at 2500, needs A and B; it ends before it opens
    fn mixed_corpus(lao: &LaoFixture) -> Corpus {
        let [a, b, _c] = [0, 1, 2].map(|i| lao.witnesses[i].public_key());
        let mut messages = vec![lao.create_envelope().unwrap()];

        witnessed(lao, &mut messages, lao.witness_change_data("trimmed", Timestamp(1_500), vec![a, b]), 3);
        witnessed(lao, &mut messages, lao.witness_change_data("late", Timestamp(3_000), vec![a, b]), 2);

        let attendees = vec![key_of(&observer_identity()), lao.organizer.public_key()];
        let (create, open, close) = lao.roll_call_lifecycle("Check-in", attendees.clone());
        let roll_call = create.id;
        messages.push(lao.organizer_envelope(&ProtocolData::CreateRollCall(create)).unwrap());
        witnessed(lao, &mut messages, ProtocolData::OpenRollCall(open), 3);
        witnessed(lao, &mut messages, ProtocolData::CloseRollCall(close), 3);

        let (setup, end, open) =
            lao.election_lifecycle("Board", Timestamp(2_500), Timestamp(2_600), Timestamp(2_700));
        let election = setup.id;
        messages.push(lao.organizer_envelope(&ProtocolData::SetupElection(setup)).unwrap());
        witnessed(lao, &mut messages, ProtocolData::EndElection(end), 2);
        witnessed(lao, &mut messages, ProtocolData::OpenElection(open), 2);

        Corpus {
            messages,
            roll_call,
            election,
            attendees,
        }
    }

    fn offline_client() -> LaoClient {
        let (transport, _events, _relay) = lao_transport::ChannelTransport::pair();
        LaoClient::new(
            ClientConfig::default().with_max_reprocessing(64),
            Arc::new(transport),
            Arc::new(observer_identity()),
        )
    }

    fn snapshots(
        store: &lao_state::ReconciliationStore,
        ids: &[lao_core::EntityId],
    ) -> Vec<Option<EntitySnapshot>> {
        ids.iter().map(|id| store.snapshot(id).cloned()).collect()
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn prop_any_arrival_order_converges(order in Just((0..24usize).collect::<Vec<_>>()).prop_shuffle()) {
            let lao = LaoFixture::new("Converge", 3).unwrap();
            let corpus = mixed_corpus(&lao);
            prop_assert_eq!(corpus.messages.len(), 24);
            let ids = [lao.id(), corpus.roll_call, corpus.election];

            let client = offline_client();
            for i in order {
                let _ = client.apply(&lao.channel, corpus.messages[i].clone());
            }
            prop_assert_eq!(client.deferred_count(), 0);

            let Some(EntitySnapshot::Organization(org)) = client.snapshot(&lao.id()) else {
                return Err(TestCaseError::fail("organization missing"));
            };
            prop_assert_eq!(org.name, "late");
            prop_assert_eq!(org.last_modified, Timestamp(3_000));
            prop_assert_eq!(org.witnesses.len(), 2);

            let Some(EntitySnapshot::RollCall(rc)) = client.snapshot(&corpus.roll_call) else {
                return Err(TestCaseError::fail("roll call missing"));
            };
            let mut attendees = corpus.attendees.clone();
            attendees.sort();
            prop_assert_eq!(rc.status, RollCallStatus::Closed);
            prop_assert_eq!(rc.opened_at, Some(Timestamp(1_200)));
            prop_assert_eq!(rc.attendees, attendees);

            let Some(EntitySnapshot::Election(election)) = client.snapshot(&corpus.election) else {
                return Err(TestCaseError::fail("election missing"));
            };
            prop_assert_eq!(election.status, ElectionStatus::Ended);
            prop_assert_eq!(election.ended_at, Some(Timestamp(2_600)));
            prop_assert_eq!(election.opened_at, None);

            // A replica fed the catch-up sequence lands on the same state
            let live = client.with_store_ref(|store| snapshots(store, &ids));
            let stored = client.with_store_ref(|store| store.catch_up(&lao.channel));
            let mut replica = lao_state::ReconciliationStore::default();
            replica.replay(stored);
            prop_assert_eq!(snapshots(&replica, &ids), live);
        }
    }
}
