use meshcall_protocol::event::IceCandidate;
use meshcall_protocol::{Answer, Candidate, Offer, ParticipantId, RoomEvent, RoomTopic};
use meshcall_signaling::memory::MemoryBroker;
use meshcall_signaling::{RoomChannel, SignalingChannel, Subscription};
use meshcall_webrtc::config::PEER_EVENTS_CAPACITY;
use meshcall_webrtc::test_utils::LoopbackNetwork;
use meshcall_webrtc::{
    MediaConstraints, MediaDevices, MediaKind, NegotiationRole, PeerConnectionManager,
    PeerConnectionState, PeerEvent, PeerEventKind, SampleTrackDevices, SignalOutcome,
    SignalingState,
};
use pretty_assertions::{assert_eq, assert_matches};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use test_log::test;
use tokio::sync::mpsc;

fn id(s: &str) -> ParticipantId {
    ParticipantId::from(s)
}

fn topic() -> RoomTopic {
    RoomTopic::team("engineering")
}

struct TestPeer {
    id: ParticipantId,
    manager: PeerConnectionManager,
    room_rx: mpsc::Receiver<RoomEvent>,
    events_rx: mpsc::Receiver<PeerEvent>,
}

impl TestPeer {
    async fn new(broker: &MemoryBroker, network: &LoopbackNetwork, name: &str) -> Self {
        let channel: Arc<dyn SignalingChannel> = Arc::new(broker.clone());
        let subscription = channel.subscribe(&topic()).await.unwrap();
        let room = RoomChannel::new(channel, subscription.handle);

        let stream = SampleTrackDevices::new(name)
            .acquire(MediaConstraints::audio_video())
            .await
            .unwrap();
        let (events_tx, events_rx) = mpsc::channel(PEER_EVENTS_CAPACITY);

        Self {
            id: id(name),
            manager: PeerConnectionManager::new(
                id(name),
                name.to_uppercase(),
                stream,
                Arc::new(network.factory(name)),
                room,
                events_tx,
            ),
            room_rx: subscription.events,
            events_rx,
        }
    }

    /// Handles everything currently queued. Returns whether anything was processed.
    async fn step(&mut self) -> bool {
        let mut progressed = false;

        while let Ok(event) = self.room_rx.try_recv() {
            progressed = true;
            if !event.is_relevant_to(&self.id) {
                continue;
            }
            match event {
                RoomEvent::Offer(offer) => {
                    self.manager.handle_offer(offer).await.unwrap();
                }
                RoomEvent::Answer(answer) => {
                    self.manager.handle_answer(answer).await.unwrap();
                }
                RoomEvent::Candidate(candidate) => {
                    self.manager.handle_candidate(candidate).await.unwrap();
                }
                _ => {}
            }
        }

        while let Ok(event) = self.events_rx.try_recv() {
            progressed = true;
            self.manager.handle_peer_event(event).await.unwrap();
        }

        progressed
    }
}

/// Pumps all peers until nothing happened for a few rounds.
async fn settle(peers: &mut [&mut TestPeer]) {
    let mut idle_rounds = 0;
    while idle_rounds < 5 {
        let mut progressed = false;
        for peer in peers.iter_mut() {
            progressed |= peer.step().await;
        }
        if progressed {
            idle_rounds = 0;
        } else {
            idle_rounds += 1;
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
}

/// A bare subscription standing in for a remote participant that is driven by hand.
async fn raw_subscription(broker: &MemoryBroker) -> (RoomChannel, Subscription) {
    let channel: Arc<dyn SignalingChannel> = Arc::new(broker.clone());
    let subscription = channel.subscribe(&topic()).await.unwrap();
    (
        RoomChannel::new(channel, subscription.handle.clone()),
        subscription,
    )
}

async fn next_event(subscription: &mut Subscription) -> RoomEvent {
    tokio::time::timeout(Duration::from_secs(1), subscription.events.recv())
        .await
        .expect("timed out waiting for room event")
        .expect("subscription closed")
}

fn candidate(from: &str, to: &str, n: u16) -> Candidate {
    Candidate {
        from: id(from),
        to: id(to),
        candidate: IceCandidate {
            candidate: format!("candidate:{n} 1 udp 2122260223 10.0.0.9 {n} typ host"),
            sdp_mid: Some("0".to_string()),
            sdp_mline_index: Some(0),
            username_fragment: None,
        },
    }
}

#[test(tokio::test)]
async fn offer_answer_connects_pair() {
    let broker = MemoryBroker::new();
    let network = LoopbackNetwork::new();
    let mut zoe = TestPeer::new(&broker, &network, "zoe").await;
    let mut adam = TestPeer::new(&broker, &network, "adam").await;

    assert!(zoe.manager.connect_to(&id("adam")).await.unwrap());
    settle(&mut [&mut zoe, &mut adam]).await;

    assert_eq!(
        network.connected_pairs(),
        BTreeSet::from([(id("adam"), id("zoe"))])
    );
    assert_eq!(
        zoe.manager.link(&id("adam")).unwrap().connection_state(),
        PeerConnectionState::Connected
    );
    assert_eq!(
        zoe.manager.link(&id("adam")).unwrap().role(),
        NegotiationRole::Offerer
    );
    assert_eq!(
        adam.manager.link(&id("zoe")).unwrap().role(),
        NegotiationRole::Answerer
    );

    let stream = adam.manager.remote_stream(&id("zoe")).unwrap();
    assert!(stream.has_kind(MediaKind::Audio));
    assert!(stream.has_kind(MediaKind::Video));

    let applied = network.applied_candidates();
    assert!(!applied.is_empty());
    assert!(applied.iter().all(|c| c.remote_description_set));
    assert_eq!(network.offer_count(&id("zoe"), &id("adam")), 1);
    assert_eq!(network.offer_count(&id("adam"), &id("zoe")), 0);
}

#[test(tokio::test)]
async fn candidates_before_offer_are_buffered_then_applied_in_order() {
    let broker = MemoryBroker::new();
    let network = LoopbackNetwork::new();
    let mut adam = TestPeer::new(&broker, &network, "adam").await;
    let (_zoe_room, mut zoe) = raw_subscription(&broker).await;

    for n in 1..=3 {
        assert_eq!(
            adam.manager
                .handle_candidate(candidate("zoe", "adam", n))
                .await
                .unwrap(),
            SignalOutcome::Buffered
        );
    }
    assert_eq!(adam.manager.pending_candidates(&id("zoe")), 3);
    assert!(network.applied_candidates().is_empty());

    let outcome = adam
        .manager
        .handle_offer(Offer {
            from: id("zoe"),
            to: id("adam"),
            from_name: "Zoe".to_string(),
            sdp: "v=0 remote offer".to_string(),
        })
        .await
        .unwrap();
    assert_eq!(outcome, SignalOutcome::Applied);
    assert_eq!(adam.manager.pending_candidates(&id("zoe")), 0);

    let applied: Vec<_> = network
        .applied_candidates()
        .into_iter()
        .filter(|c| c.local_id == id("adam"))
        .collect();
    assert_eq!(
        applied.iter().map(|c| c.candidate.clone()).collect::<Vec<_>>(),
        (1..=3)
            .map(|n| candidate("zoe", "adam", n).candidate.candidate)
            .collect::<Vec<_>>()
    );
    assert!(applied.iter().all(|c| c.remote_description_set));

    assert_matches!(
        next_event(&mut zoe).await,
        RoomEvent::Answer(Answer { from, to, .. }) if from == id("adam") && to == id("zoe")
    );

    // Once the remote description is applied, candidates go straight to the connection.
    assert_eq!(
        adam.manager
            .handle_candidate(candidate("zoe", "adam", 4))
            .await
            .unwrap(),
        SignalOutcome::Applied
    );
}

#[test(tokio::test)]
async fn duplicate_answer_is_ignored() {
    let broker = MemoryBroker::new();
    let network = LoopbackNetwork::new();
    let mut zoe = TestPeer::new(&broker, &network, "zoe").await;
    let (_adam_room, mut adam) = raw_subscription(&broker).await;

    zoe.manager.connect_to(&id("adam")).await.unwrap();
    assert_matches!(next_event(&mut adam).await, RoomEvent::Offer(offer) if offer.to == id("adam"));

    let answer = Answer {
        from: id("adam"),
        to: id("zoe"),
        from_name: "Adam".to_string(),
        sdp: "v=0 remote answer".to_string(),
    };
    assert_eq!(
        zoe.manager.handle_answer(answer.clone()).await.unwrap(),
        SignalOutcome::Applied
    );
    assert_eq!(
        zoe.manager.handle_answer(answer).await.unwrap(),
        SignalOutcome::Ignored
    );

    let link = zoe.manager.link(&id("adam")).unwrap();
    assert_eq!(link.signaling_state(), SignalingState::Stable);
    assert!(link.remote_description_applied());
    assert_eq!(zoe.manager.len(), 1);
}

#[test(tokio::test)]
async fn answer_without_offer_is_ignored() {
    let broker = MemoryBroker::new();
    let network = LoopbackNetwork::new();
    let mut adam = TestPeer::new(&broker, &network, "adam").await;

    let outcome = adam
        .manager
        .handle_answer(Answer {
            from: id("zoe"),
            to: id("adam"),
            from_name: "Zoe".to_string(),
            sdp: "v=0".to_string(),
        })
        .await
        .unwrap();
    assert_eq!(outcome, SignalOutcome::Ignored);
    assert!(adam.manager.is_empty());
}

#[test(tokio::test)]
async fn connect_to_existing_link_is_noop() {
    let broker = MemoryBroker::new();
    let network = LoopbackNetwork::new();
    let mut zoe = TestPeer::new(&broker, &network, "zoe").await;

    assert!(zoe.manager.connect_to(&id("adam")).await.unwrap());
    assert!(!zoe.manager.connect_to(&id("adam")).await.unwrap());

    assert_eq!(zoe.manager.len(), 1);
    assert_eq!(network.offers(), vec![(id("zoe"), id("adam"))]);
}

#[test(tokio::test)]
async fn offer_collision_is_resolved_by_id_order() {
    let broker = MemoryBroker::new();
    let network = LoopbackNetwork::new();
    let mut zoe = TestPeer::new(&broker, &network, "zoe").await;
    let mut adam = TestPeer::new(&broker, &network, "adam").await;

    zoe.manager.connect_to(&id("adam")).await.unwrap();
    adam.manager.connect_to(&id("zoe")).await.unwrap();
    settle(&mut [&mut zoe, &mut adam]).await;

    assert_eq!(zoe.manager.len(), 1);
    assert_eq!(adam.manager.len(), 1);
    assert_eq!(
        adam.manager.link(&id("zoe")).unwrap().role(),
        NegotiationRole::Answerer
    );
    assert_eq!(
        network.connected_pairs(),
        BTreeSet::from([(id("adam"), id("zoe"))])
    );
}

#[test(tokio::test)]
async fn superseded_link_events_are_ignored() {
    let broker = MemoryBroker::new();
    let network = LoopbackNetwork::new();
    let mut zoe = TestPeer::new(&broker, &network, "zoe").await;

    zoe.manager.connect_to(&id("adam")).await.unwrap();
    let first = zoe.manager.link(&id("adam")).unwrap().link_id();
    assert!(zoe.manager.close(&id("adam")).await);
    zoe.manager.connect_to(&id("adam")).await.unwrap();
    let second = zoe.manager.link(&id("adam")).unwrap().link_id();
    assert_ne!(first, second);

    let update = zoe
        .manager
        .handle_peer_event(PeerEvent {
            remote_id: id("adam"),
            link_id: first,
            kind: PeerEventKind::StateChanged(PeerConnectionState::Failed),
        })
        .await
        .unwrap();
    assert_eq!(update, None);
    assert_eq!(zoe.manager.link(&id("adam")).unwrap().link_id(), second);
}

#[test(tokio::test)]
async fn failed_connection_tears_down_both_sides() {
    let broker = MemoryBroker::new();
    let network = LoopbackNetwork::new();
    let mut zoe = TestPeer::new(&broker, &network, "zoe").await;
    let mut adam = TestPeer::new(&broker, &network, "adam").await;

    zoe.manager.connect_to(&id("adam")).await.unwrap();
    settle(&mut [&mut zoe, &mut adam]).await;
    assert_eq!(network.connected_pairs().len(), 1);

    network.fail_link(&id("zoe"), &id("adam"));
    settle(&mut [&mut zoe, &mut adam]).await;

    assert!(zoe.manager.is_empty());
    assert!(adam.manager.is_empty());
    assert!(network.connected_pairs().is_empty());
}

#[test(tokio::test)]
async fn close_discards_buffered_candidates_and_is_idempotent() {
    let broker = MemoryBroker::new();
    let network = LoopbackNetwork::new();
    let mut adam = TestPeer::new(&broker, &network, "adam").await;

    adam.manager
        .handle_candidate(candidate("zoe", "adam", 1))
        .await
        .unwrap();
    assert_eq!(adam.manager.pending_candidates(&id("zoe")), 1);

    assert!(!adam.manager.close(&id("zoe")).await);
    assert!(!adam.manager.close(&id("zoe")).await);
    assert_eq!(adam.manager.pending_candidates(&id("zoe")), 0);
}

#[test(tokio::test)]
async fn late_candidates_after_close_are_dropped_until_readmitted() {
    let broker = MemoryBroker::new();
    let network = LoopbackNetwork::new();
    let mut zoe = TestPeer::new(&broker, &network, "zoe").await;
    let mut adam = TestPeer::new(&broker, &network, "adam").await;

    zoe.manager.connect_to(&id("adam")).await.unwrap();
    settle(&mut [&mut zoe, &mut adam]).await;
    assert!(adam.manager.close(&id("zoe")).await);

    let outcome = adam
        .manager
        .handle_candidate(candidate("zoe", "adam", 7))
        .await
        .unwrap();
    assert_eq!(outcome, SignalOutcome::Ignored);
    assert_eq!(adam.manager.pending_candidates(&id("zoe")), 0);

    adam.manager.readmit(&id("zoe"));
    let outcome = adam
        .manager
        .handle_candidate(candidate("zoe", "adam", 8))
        .await
        .unwrap();
    assert_eq!(outcome, SignalOutcome::Buffered);
    assert_eq!(adam.manager.pending_candidates(&id("zoe")), 1);
}

#[test(tokio::test)]
async fn offer_for_closed_participant_accepts_its_candidates() {
    let broker = MemoryBroker::new();
    let network = LoopbackNetwork::new();
    let mut zoe = TestPeer::new(&broker, &network, "zoe").await;
    let mut adam = TestPeer::new(&broker, &network, "adam").await;

    zoe.manager.connect_to(&id("adam")).await.unwrap();
    settle(&mut [&mut zoe, &mut adam]).await;
    adam.manager.close(&id("zoe")).await;

    drop(zoe);
    let mut zoe = TestPeer::new(&broker, &network, "zoe").await;
    zoe.manager.connect_to(&id("adam")).await.unwrap();
    settle(&mut [&mut zoe, &mut adam]).await;

    let link = adam.manager.link(&id("zoe")).unwrap();
    assert_eq!(link.connection_state(), PeerConnectionState::Connected);
    let outcome = adam
        .manager
        .handle_candidate(candidate("zoe", "adam", 9))
        .await
        .unwrap();
    assert_eq!(outcome, SignalOutcome::Applied);
}

#[test(tokio::test)]
async fn offer_for_negotiated_link_starts_new_lifecycle() {
    let broker = MemoryBroker::new();
    let network = LoopbackNetwork::new();
    let mut zoe = TestPeer::new(&broker, &network, "zoe").await;
    let mut adam = TestPeer::new(&broker, &network, "adam").await;

    zoe.manager.connect_to(&id("adam")).await.unwrap();
    settle(&mut [&mut zoe, &mut adam]).await;
    let first = adam.manager.link(&id("zoe")).unwrap().link_id();

    // Zoe comes back without adam ever seeing her leave.
    drop(zoe);
    let mut zoe = TestPeer::new(&broker, &network, "zoe").await;
    zoe.manager.connect_to(&id("adam")).await.unwrap();
    settle(&mut [&mut zoe, &mut adam]).await;

    let link = adam.manager.link(&id("zoe")).unwrap();
    assert_ne!(link.link_id(), first);
    assert_eq!(link.connection_state(), PeerConnectionState::Connected);
    assert_eq!(adam.manager.len(), 1);
}

#[test(tokio::test)]
async fn close_all_empties_manager() {
    let broker = MemoryBroker::new();
    let network = LoopbackNetwork::new();
    let mut zoe = TestPeer::new(&broker, &network, "zoe").await;

    zoe.manager.connect_to(&id("adam")).await.unwrap();
    zoe.manager.connect_to(&id("bob")).await.unwrap();
    zoe.manager
        .handle_candidate(candidate("carol", "zoe", 1))
        .await
        .unwrap();
    assert_eq!(zoe.manager.len(), 2);

    zoe.manager.close_all().await;
    assert!(zoe.manager.is_empty());
    assert_eq!(zoe.manager.pending_candidates(&id("carol")), 0);
}
