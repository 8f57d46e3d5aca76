use async_trait::async_trait;
use meshcall_protocol::{Join, Leave, Offer, ParticipantId, RoomEvent, RoomTopic};
use meshcall_session::{
    CallError, CallSession, Profile, SessionConfig, SessionDeps, SessionState, StaticDirectory,
};
use meshcall_signaling::memory::MemoryBroker;
use meshcall_signaling::{RoomChannel, SignalingChannel};
use meshcall_webrtc::test_utils::LoopbackNetwork;
use meshcall_webrtc::{
    LinkId, LocalStream, MediaError, MediaKind, PeerConnection, PeerConnectionFactory,
    PeerConnectionState, PeerError, PeerEvent, SampleTrackDevices,
};
use pretty_assertions::{assert_eq, assert_matches};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use test_log::test;

fn id(s: &str) -> ParticipantId {
    ParticipantId::from(s)
}

fn topic() -> RoomTopic {
    RoomTopic::meeting("standup")
}

fn config() -> SessionConfig {
    SessionConfig {
        announce_repeats: 3,
        announce_interval_millis: 50,
        leave_publish_timeout_millis: 200,
        ..Default::default()
    }
}

struct Harness {
    broker: MemoryBroker,
    network: LoopbackNetwork,
    directory: Arc<StaticDirectory>,
}

impl Harness {
    fn new() -> Self {
        Self {
            broker: MemoryBroker::new(),
            network: LoopbackNetwork::new(),
            directory: Arc::new(StaticDirectory::default()),
        }
    }

    fn session(&self, name: &str) -> CallSession {
        self.session_with_devices(name, SampleTrackDevices::new(name))
    }

    fn session_with_devices(&self, name: &str, devices: SampleTrackDevices) -> CallSession {
        CallSession::new(
            id(name),
            name.to_uppercase(),
            config(),
            SessionDeps {
                signaling: Arc::new(self.broker.clone()),
                devices: Arc::new(devices),
                peers: Arc::new(self.network.factory(name)),
                directory: self.directory.clone(),
            },
        )
    }

    async fn raw_room(&self) -> RoomChannel {
        let channel: Arc<dyn SignalingChannel> = Arc::new(self.broker.clone());
        let subscription = channel.subscribe(&topic()).await.unwrap();
        RoomChannel::new(channel, subscription.handle)
    }
}

async fn eventually(what: &str, mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

fn connected_peers(session: &CallSession) -> BTreeSet<ParticipantId> {
    session
        .participants()
        .into_iter()
        .filter(|view| view.connection_state == Some(PeerConnectionState::Connected))
        .map(|view| view.participant.id)
        .collect()
}

fn pairs(ids: &[(&str, &str)]) -> BTreeSet<(ParticipantId, ParticipantId)> {
    ids.iter().map(|(a, b)| (id(a), id(b))).collect()
}

#[test(tokio::test)]
async fn three_participants_form_full_mesh() {
    let harness = Harness::new();
    let alice = harness.session("alice");
    let bob = harness.session("bob");
    let carol = harness.session("carol");

    alice.join(topic(), false).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    bob.join(topic(), false).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    carol.join(topic(), false).await.unwrap();

    eventually("all pairs connected", || {
        harness.network.connected_pairs()
            == pairs(&[("alice", "bob"), ("alice", "carol"), ("bob", "carol")])
    })
    .await;
    eventually("every session sees two connected peers", || {
        connected_peers(&alice) == BTreeSet::from([id("bob"), id("carol")])
            && connected_peers(&bob) == BTreeSet::from([id("alice"), id("carol")])
            && connected_peers(&carol) == BTreeSet::from([id("alice"), id("bob")])
    })
    .await;

    // One offer per pair, always from the higher id.
    let offers: BTreeSet<_> = harness.network.offers().into_iter().collect();
    assert_eq!(harness.network.offers().len(), 3);
    assert_eq!(
        offers,
        pairs(&[("bob", "alice"), ("carol", "alice"), ("carol", "bob")])
    );

    assert!(
        harness
            .network
            .applied_candidates()
            .iter()
            .all(|candidate| candidate.remote_description_set)
    );

    for view in carol.participants() {
        let stream = view.stream.expect("remote stream");
        assert!(stream.has_kind(MediaKind::Audio));
        assert!(!stream.has_kind(MediaKind::Video));
    }

    for session in [&alice, &bob, &carol] {
        session.leave().await;
    }
}

#[test(tokio::test)]
async fn simultaneous_join_produces_single_offer() {
    let harness = Harness::new();
    let adam = harness.session("adam");
    let zoe = harness.session("zoe");

    let (a, z) = tokio::join!(adam.join(topic(), false), zoe.join(topic(), false));
    a.unwrap();
    z.unwrap();

    eventually("pair connected", || {
        harness.network.connected_pairs() == pairs(&[("adam", "zoe")])
    })
    .await;
    // Let repeated announcements play out.
    tokio::time::sleep(Duration::from_millis(250)).await;

    assert_eq!(harness.network.offer_count(&id("zoe"), &id("adam")), 1);
    assert_eq!(harness.network.offer_count(&id("adam"), &id("zoe")), 0);

    adam.leave().await;
    zoe.leave().await;
}

#[test(tokio::test)]
async fn lone_participant_is_connected() {
    let harness = Harness::new();
    let alice = harness.session("alice");
    assert_eq!(alice.connection_state(), SessionState::Idle);

    alice.join(topic(), true).await.unwrap();

    assert_eq!(alice.connection_state(), SessionState::Connected);
    assert!(alice.participants().is_empty());
    assert_eq!(alice.room_topic().await, Some(topic()));
    assert_eq!(harness.broker.subscriber_count(&topic()), 1);

    alice.leave().await;
}

#[test(tokio::test)]
async fn remote_leave_closes_link_and_removes_participant() {
    let harness = Harness::new();
    let alice = harness.session("alice");
    let bob = harness.session("bob");

    alice.join(topic(), false).await.unwrap();
    bob.join(topic(), false).await.unwrap();
    eventually("alice connected to bob", || {
        connected_peers(&alice) == BTreeSet::from([id("bob")])
    })
    .await;

    // Bob vanishes: one leave broadcast, then silence.
    drop(bob);
    let room = harness.raw_room().await;
    room.publish(Leave { user_id: id("bob") }).await.unwrap();

    eventually("bob removed", || alice.participants().is_empty()).await;
    assert_eq!(
        harness.network.connection_state(&id("alice"), &id("bob")),
        None
    );

    // A leave for somebody without a link is harmless.
    room.publish(Leave { user_id: id("bob") }).await.unwrap();
    room.publish(Leave {
        user_id: id("nobody"),
    })
    .await
    .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(alice.connection_state(), SessionState::Connected);
    assert!(alice.participants().is_empty());

    alice.leave().await;
}

#[test(tokio::test)]
async fn denied_microphone_leaves_no_subscription() {
    let harness = Harness::new();
    let alice = harness.session_with_devices(
        "alice",
        SampleTrackDevices::new("alice").deny(MediaKind::Audio),
    );

    let result = alice.join(topic(), false).await;

    assert_matches!(
        result,
        Err(CallError::MediaAcquisitionDenied(MediaError::PermissionDenied(
            MediaKind::Audio
        )))
    );
    assert_eq!(harness.broker.subscriber_count(&topic()), 0);
    assert_eq!(alice.connection_state(), SessionState::Failed);
    assert_eq!(alice.room_topic().await, None);
}

#[test(tokio::test)]
async fn unavailable_signaling_fails_join_until_retried() {
    let harness = Harness::new();
    let alice = harness.session("alice");
    harness.broker.set_available(false);

    assert_matches!(
        alice.join(topic(), false).await,
        Err(CallError::SignalingUnavailable(_))
    );
    assert_eq!(alice.connection_state(), SessionState::Failed);
    assert!(alice.local_stream().await.is_none());

    harness.broker.set_available(true);
    alice.join(topic(), false).await.unwrap();
    assert_eq!(alice.connection_state(), SessionState::Connected);

    alice.leave().await;
}

#[test(tokio::test)]
async fn second_join_is_rejected() {
    let harness = Harness::new();
    let alice = harness.session("alice");

    alice.join(topic(), false).await.unwrap();
    assert_matches!(
        alice.join(RoomTopic::team("other"), false).await,
        Err(CallError::AlreadyJoined(t)) if t == topic()
    );
    assert_eq!(harness.broker.subscriber_count(&topic()), 1);
    assert_eq!(harness.broker.subscriber_count(&RoomTopic::team("other")), 0);

    alice.leave().await;
}

#[test(tokio::test)]
async fn leave_is_idempotent_and_releases_everything() {
    let harness = Harness::new();
    let alice = harness.session("alice");
    let bob = harness.session("bob");

    // Leaving without ever joining is fine.
    alice.leave().await;

    alice.join(topic(), true).await.unwrap();
    bob.join(topic(), true).await.unwrap();
    eventually("pair connected", || {
        harness.network.connected_pairs() == pairs(&[("alice", "bob")])
    })
    .await;
    let stream = alice.local_stream().await.unwrap();

    alice.leave().await;
    alice.leave().await;

    assert_eq!(alice.connection_state(), SessionState::Idle);
    assert!(alice.participants().is_empty());
    assert!(stream.is_stopped());
    assert!(alice.local_stream().await.is_none());
    assert_eq!(harness.broker.subscriber_count(&topic()), 1);
    assert!(harness.network.connected_pairs().is_empty());

    eventually("bob saw alice leave", || bob.participants().is_empty()).await;

    bob.leave().await;
    assert_eq!(harness.broker.subscriber_count(&topic()), 0);
}

#[test(tokio::test)]
async fn rejoin_starts_new_link() {
    let harness = Harness::new();
    let alice = harness.session("alice");
    let bob = harness.session("bob");

    alice.join(topic(), false).await.unwrap();
    bob.join(topic(), false).await.unwrap();
    eventually("pair connected", || {
        connected_peers(&bob) == BTreeSet::from([id("alice")])
    })
    .await;

    alice.leave().await;
    eventually("bob saw alice leave", || bob.participants().is_empty()).await;

    alice.join(topic(), false).await.unwrap();
    eventually("pair reconnected", || {
        connected_peers(&bob) == BTreeSet::from([id("alice")])
            && connected_peers(&alice) == BTreeSet::from([id("bob")])
    })
    .await;
    assert_eq!(harness.network.offer_count(&id("bob"), &id("alice")), 2);

    alice.leave().await;
    bob.leave().await;
}

#[test(tokio::test)]
async fn toggles_flip_tracks_without_renegotiation() {
    let harness = Harness::new();
    let alice = harness.session("alice");
    let bob = harness.session("bob");

    assert_matches!(alice.toggle_mute().await, Err(CallError::NotInRoom));
    assert_matches!(alice.toggle_camera().await, Err(CallError::NotInRoom));

    alice.join(topic(), true).await.unwrap();
    bob.join(topic(), true).await.unwrap();
    eventually("pair connected", || {
        harness.network.connected_pairs() == pairs(&[("alice", "bob")])
    })
    .await;
    let offers_before = harness.network.offers().len();
    let stream = alice.local_stream().await.unwrap();

    assert!(alice.toggle_mute().await.unwrap());
    assert!(!stream.track(MediaKind::Audio).unwrap().is_enabled());
    assert!(stream.track(MediaKind::Video).unwrap().is_enabled());

    assert!(alice.toggle_camera().await.unwrap());
    assert!(!stream.track(MediaKind::Video).unwrap().is_enabled());
    assert_eq!(alice.is_muted().await, Some(true));
    assert_eq!(alice.is_camera_off().await, Some(true));

    eventually("bob sees alice muted with camera off", || {
        bob.participants()
            .iter()
            .any(|view| view.participant.id == id("alice") && view.muted && view.camera_off)
    })
    .await;

    assert!(!alice.toggle_mute().await.unwrap());
    assert!(stream.track(MediaKind::Audio).unwrap().is_enabled());
    eventually("bob sees alice unmuted", || {
        bob.participants()
            .iter()
            .any(|view| view.participant.id == id("alice") && !view.muted)
    })
    .await;

    assert_eq!(harness.network.offers().len(), offers_before);
    assert_eq!(
        harness.network.connected_pairs(),
        pairs(&[("alice", "bob")])
    );

    alice.leave().await;
    bob.leave().await;
}

#[test(tokio::test)]
async fn participants_are_labelled_from_directory() {
    let harness = Harness::new();
    harness.directory.insert(
        id("bob"),
        Profile {
            display_name: "Bob Builder".to_string(),
            avatar_url: Some("https://avatars.example.com/bob.png".to_string()),
        },
    );
    let alice = harness.session("alice");
    let bob = harness.session("bob");
    let carol = harness.session("carol");

    alice.join(topic(), false).await.unwrap();
    bob.join(topic(), false).await.unwrap();
    carol.join(topic(), false).await.unwrap();

    eventually("alice labelled everybody", || {
        let labels: Vec<_> = alice
            .participants()
            .into_iter()
            .map(|view| (view.participant.display_name, view.participant.avatar_url))
            .collect();
        labels
            == vec![
                (
                    "Bob Builder".to_string(),
                    Some("https://avatars.example.com/bob.png".to_string()),
                ),
                ("CAROL".to_string(), None),
            ]
    })
    .await;

    for session in [&alice, &bob, &carol] {
        session.leave().await;
    }
}

#[test(tokio::test)]
async fn failed_link_removes_participant() {
    let harness = Harness::new();
    let alice = harness.session("alice");
    let bob = harness.session("bob");

    alice.join(topic(), false).await.unwrap();
    bob.join(topic(), false).await.unwrap();
    eventually("pair connected", || {
        harness.network.connected_pairs() == pairs(&[("alice", "bob")])
    })
    .await;
    // Wait for the announcements to end so nobody renegotiates right away.
    tokio::time::sleep(Duration::from_millis(250)).await;

    harness.network.fail_link(&id("alice"), &id("bob"));

    eventually("both sides dropped the peer", || {
        alice.participants().is_empty() && bob.participants().is_empty()
    })
    .await;
    assert_eq!(alice.connection_state(), SessionState::Connected);

    alice.leave().await;
    bob.leave().await;
}

#[test(tokio::test)]
async fn events_for_other_participants_are_ignored() {
    let harness = Harness::new();
    let alice = harness.session("alice");
    alice.join(topic(), false).await.unwrap();

    let room = harness.raw_room().await;
    room.publish(RoomEvent::Offer(Offer {
        from: id("mallory"),
        to: id("somebody-else"),
        from_name: "Mallory".to_string(),
        sdp: "v=0".to_string(),
    }))
    .await
    .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert!(alice.participants().is_empty());
    assert!(harness.network.offers().is_empty());

    alice.leave().await;
}

/// Refuses every connection, as a browser would without a usable network stack.
struct RejectingPeers;

#[async_trait]
impl PeerConnectionFactory for RejectingPeers {
    async fn create(
        &self,
        _remote_id: &ParticipantId,
        _link_id: LinkId,
        _local_stream: &LocalStream,
        _events: tokio::sync::mpsc::Sender<PeerEvent>,
    ) -> Result<Arc<dyn PeerConnection>, PeerError> {
        Err(PeerError::Transport("no route".to_string()))
    }
}

#[test(tokio::test)]
async fn failed_negotiation_removes_participant() {
    let harness = Harness::new();
    let alice = CallSession::new(
        id("alice"),
        "ALICE",
        config(),
        SessionDeps {
            signaling: Arc::new(harness.broker.clone()),
            devices: Arc::new(SampleTrackDevices::new("alice")),
            peers: Arc::new(RejectingPeers),
            directory: harness.directory.clone(),
        },
    );
    alice.join(topic(), false).await.unwrap();

    let room = harness.raw_room().await;
    // Alice has to offer to aaron and answer zed, both of which fail.
    room.publish(Join {
        user_id: id("aaron"),
        display_name: "Aaron".to_string(),
    })
    .await
    .unwrap();
    room.publish(Offer {
        from: id("zed"),
        to: id("alice"),
        from_name: "Zed".to_string(),
        sdp: "v=0".to_string(),
    })
    .await
    .unwrap();
    // Amy only gets an announce-back, which needs no connection.
    room.publish(Join {
        user_id: id("amy"),
        display_name: "Amy".to_string(),
    })
    .await
    .unwrap();

    eventually("amy observed", || {
        alice
            .participants()
            .iter()
            .any(|view| view.participant.id == id("amy"))
    })
    .await;
    let ids: Vec<_> = alice
        .participants()
        .into_iter()
        .map(|view| view.participant.id)
        .collect();
    assert_eq!(ids, vec![id("amy")]);
    assert_eq!(alice.connection_state(), SessionState::Connected);

    alice.leave().await;
}
