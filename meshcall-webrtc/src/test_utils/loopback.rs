use crate::connection::{
    LinkId, PeerConnection, PeerConnectionFactory, PeerConnectionState, PeerEvent, PeerEventKind,
    SdpType, SessionDescription, SignalingState,
};
use crate::error::PeerError;
use crate::media::{LocalStream, MediaKind, RemoteTrack};
use async_trait::async_trait;
use meshcall_protocol::ParticipantId;
use meshcall_protocol::event::IceCandidate;
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;

/// Candidates trickled per local description.
const CANDIDATES_PER_DESCRIPTION: u16 = 2;

/// An in-process stand-in for the network between peer connections.
///
/// Connections created through [`LoopbackNetwork::factory`] follow the offer/answer state machine,
/// reject candidates before a remote description, trickle synthetic host candidates and become
/// `Connected` once both ends of a pair applied each other's descriptions. Every offer and candidate
/// application is recorded for assertions.
#[derive(Clone, Default)]
pub struct LoopbackNetwork {
    inner: Arc<Mutex<NetworkState>>,
}

#[derive(Default)]
struct NetworkState {
    endpoints: HashMap<(ParticipantId, ParticipantId), Weak<Endpoint>>,
    offers: Vec<(ParticipantId, ParticipantId)>,
    candidates: Vec<AppliedCandidate>,
    failed_pairs: HashSet<(ParticipantId, ParticipantId)>,
    next_port: u16,
}

/// A remote candidate handed to a loopback connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppliedCandidate {
    pub local_id: ParticipantId,
    pub remote_id: ParticipantId,
    pub candidate: String,
    /// Whether the connection had a remote description at that point.
    pub remote_description_set: bool,
}

fn sorted_pair(a: &ParticipantId, b: &ParticipantId) -> (ParticipantId, ParticipantId) {
    if a <= b {
        (a.clone(), b.clone())
    } else {
        (b.clone(), a.clone())
    }
}

impl LoopbackNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn factory(&self, local_id: impl Into<ParticipantId>) -> LoopbackFactory {
        LoopbackFactory {
            network: self.clone(),
            local_id: local_id.into(),
        }
    }

    /// All offers created so far as `(from, to)`, in creation order.
    pub fn offers(&self) -> Vec<(ParticipantId, ParticipantId)> {
        self.inner.lock().offers.clone()
    }

    pub fn offer_count(&self, from: &ParticipantId, to: &ParticipantId) -> usize {
        self.inner
            .lock()
            .offers
            .iter()
            .filter(|(f, t)| f == from && t == to)
            .count()
    }

    pub fn applied_candidates(&self) -> Vec<AppliedCandidate> {
        self.inner.lock().candidates.clone()
    }

    /// Connection state of the current link from `local_id` to `remote_id`.
    pub fn connection_state(
        &self,
        local_id: &ParticipantId,
        remote_id: &ParticipantId,
    ) -> Option<PeerConnectionState> {
        let endpoint = self.endpoint(local_id, remote_id)?;
        let state = endpoint.state.lock().connection;
        Some(state)
    }

    /// Pairs (sorted) whose links are connected on both ends.
    pub fn connected_pairs(&self) -> BTreeSet<(ParticipantId, ParticipantId)> {
        let endpoints: Vec<Arc<Endpoint>> = self
            .inner
            .lock()
            .endpoints
            .values()
            .filter_map(Weak::upgrade)
            .collect();

        let connected: HashSet<(ParticipantId, ParticipantId)> = endpoints
            .iter()
            .filter(|endpoint| endpoint.state.lock().connection == PeerConnectionState::Connected)
            .map(|endpoint| (endpoint.local_id.clone(), endpoint.remote_id.clone()))
            .collect();

        connected
            .iter()
            .filter(|(local, remote)| connected.contains(&(remote.clone(), local.clone())))
            .map(|(local, remote)| sorted_pair(local, remote))
            .collect()
    }

    /// Breaks the pair: both current connections fail, and so do all future ones.
    pub fn fail_link(&self, a: &ParticipantId, b: &ParticipantId) {
        let mut state = self.inner.lock();
        state.failed_pairs.insert(sorted_pair(a, b));

        for key in [(a.clone(), b.clone()), (b.clone(), a.clone())] {
            let Some(endpoint) = state.endpoints.get(&key).and_then(Weak::upgrade) else {
                continue;
            };
            let mut endpoint_state = endpoint.state.lock();
            if !endpoint_state.connection.is_terminal() {
                endpoint_state.connection = PeerConnectionState::Failed;
                endpoint.emit(PeerEventKind::StateChanged(PeerConnectionState::Failed));
            }
        }
    }

    fn endpoint(&self, local_id: &ParticipantId, remote_id: &ParticipantId) -> Option<Arc<Endpoint>> {
        self.inner
            .lock()
            .endpoints
            .get(&(local_id.clone(), remote_id.clone()))
            .and_then(Weak::upgrade)
    }

    fn register(&self, endpoint: &Arc<Endpoint>) {
        self.inner.lock().endpoints.insert(
            (endpoint.local_id.clone(), endpoint.remote_id.clone()),
            Arc::downgrade(endpoint),
        );
    }

    fn record_offer(&self, from: &ParticipantId, to: &ParticipantId) {
        self.inner.lock().offers.push((from.clone(), to.clone()));
    }

    fn record_candidate(&self, candidate: AppliedCandidate) {
        self.inner.lock().candidates.push(candidate);
    }

    fn next_ports(&self) -> std::ops::Range<u16> {
        let mut state = self.inner.lock();
        let start = 40_000u16.wrapping_add(state.next_port);
        state.next_port = state.next_port.wrapping_add(CANDIDATES_PER_DESCRIPTION);
        start..start.wrapping_add(CANDIDATES_PER_DESCRIPTION)
    }

    /// Connects the pair once both ends applied each other's descriptions.
    fn try_connect(&self, endpoint: &Arc<Endpoint>) {
        let state = self.inner.lock();
        let Some(counterpart) = state
            .endpoints
            .get(&(endpoint.remote_id.clone(), endpoint.local_id.clone()))
            .and_then(Weak::upgrade)
        else {
            return;
        };
        let failed = state
            .failed_pairs
            .contains(&sorted_pair(&endpoint.local_id, &endpoint.remote_id));

        let mut local = endpoint.state.lock();
        let mut remote = counterpart.state.lock();

        let negotiated = local.signaling == SignalingState::Stable
            && remote.signaling == SignalingState::Stable
            && local.local_sdp.is_some()
            && local.local_sdp == remote.remote_sdp
            && local.remote_sdp == remote.local_sdp;
        if !negotiated
            || local.connection != PeerConnectionState::New
            || remote.connection != PeerConnectionState::New
        {
            return;
        }

        let sides: [(&Arc<Endpoint>, &Arc<Endpoint>); 2] =
            [(endpoint, &counterpart), (&counterpart, endpoint)];
        for (side, other) in sides {
            side.emit(PeerEventKind::StateChanged(PeerConnectionState::Connecting));
            if failed {
                side.emit(PeerEventKind::StateChanged(PeerConnectionState::Failed));
                continue;
            }
            for (id, kind) in &other.local_tracks {
                side.emit(PeerEventKind::Track(RemoteTrack::new(id.clone(), *kind)));
            }
            side.emit(PeerEventKind::StateChanged(PeerConnectionState::Connected));
        }

        let outcome = if failed {
            PeerConnectionState::Failed
        } else {
            PeerConnectionState::Connected
        };
        local.connection = outcome;
        remote.connection = outcome;
    }

    /// Unregisters a closed endpoint and tells its counterpart the connection went away.
    fn disconnect(&self, endpoint: &Arc<Endpoint>) {
        let mut state = self.inner.lock();
        let key = (endpoint.local_id.clone(), endpoint.remote_id.clone());
        if state
            .endpoints
            .get(&key)
            .is_some_and(|registered| registered.as_ptr() == Arc::as_ptr(endpoint))
        {
            state.endpoints.remove(&key);
        }

        let Some(counterpart) = state
            .endpoints
            .get(&(endpoint.remote_id.clone(), endpoint.local_id.clone()))
            .and_then(Weak::upgrade)
        else {
            return;
        };
        let mut remote = counterpart.state.lock();
        if matches!(
            remote.connection,
            PeerConnectionState::Connecting | PeerConnectionState::Connected
        ) {
            remote.connection = PeerConnectionState::Disconnected;
            counterpart.emit(PeerEventKind::StateChanged(
                PeerConnectionState::Disconnected,
            ));
        }
    }
}

/// Creates loopback connections for one local participant.
#[derive(Clone)]
pub struct LoopbackFactory {
    network: LoopbackNetwork,
    local_id: ParticipantId,
}

#[async_trait]
impl PeerConnectionFactory for LoopbackFactory {
    async fn create(
        &self,
        remote_id: &ParticipantId,
        link_id: LinkId,
        local_stream: &LocalStream,
        events: mpsc::Sender<PeerEvent>,
    ) -> Result<Arc<dyn PeerConnection>, PeerError> {
        // Callbacks are queued without blocking and forwarded in order, like a real stack raising
        // them from its own tasks.
        let (events_tx, mut events_rx) = mpsc::unbounded_channel::<PeerEvent>();
        tokio::spawn(async move {
            while let Some(event) = events_rx.recv().await {
                if events.send(event).await.is_err() {
                    break;
                }
            }
        });

        let endpoint = Arc::new(Endpoint {
            local_id: self.local_id.clone(),
            remote_id: remote_id.clone(),
            link_id,
            local_tracks: local_stream
                .tracks()
                .iter()
                .map(|track| (track.id().to_string(), track.kind()))
                .collect(),
            state: Mutex::new(EndpointState::default()),
            events: events_tx,
        });
        self.network.register(&endpoint);

        Ok(Arc::new(LoopbackPeer {
            network: self.network.clone(),
            endpoint,
        }))
    }
}

struct Endpoint {
    local_id: ParticipantId,
    remote_id: ParticipantId,
    link_id: LinkId,
    local_tracks: Vec<(String, MediaKind)>,
    state: Mutex<EndpointState>,
    events: mpsc::UnboundedSender<PeerEvent>,
}

struct EndpointState {
    signaling: SignalingState,
    connection: PeerConnectionState,
    local_sdp: Option<String>,
    remote_sdp: Option<String>,
}

impl Default for EndpointState {
    fn default() -> Self {
        Self {
            signaling: SignalingState::Stable,
            connection: PeerConnectionState::New,
            local_sdp: None,
            remote_sdp: None,
        }
    }
}

impl Endpoint {
    fn emit(&self, kind: PeerEventKind) {
        let _ = self.events.send(PeerEvent {
            remote_id: self.remote_id.clone(),
            link_id: self.link_id,
            kind,
        });
    }

    fn description(&self, sdp_type: &str) -> String {
        let tracks: Vec<String> = self
            .local_tracks
            .iter()
            .map(|(id, kind)| format!("{kind}:{id}"))
            .collect();
        format!(
            "v=0 loopback {sdp_type} {}->{} link={} tracks={}",
            self.local_id,
            self.remote_id,
            self.link_id,
            tracks.join(",")
        )
    }
}

pub struct LoopbackPeer {
    network: LoopbackNetwork,
    endpoint: Arc<Endpoint>,
}

impl LoopbackPeer {
    fn trickle(&self) {
        for port in self.network.next_ports() {
            self.endpoint
                .emit(PeerEventKind::LocalCandidate(IceCandidate {
                    candidate: format!("candidate:{port} 1 udp 2122260223 127.0.0.1 {port} typ host"),
                    sdp_mid: Some("0".to_string()),
                    sdp_mline_index: Some(0),
                    username_fragment: None,
                }));
        }
    }
}

#[async_trait]
impl PeerConnection for LoopbackPeer {
    async fn create_offer(&self) -> Result<SessionDescription, PeerError> {
        let sdp = {
            let mut state = self.endpoint.state.lock();
            if state.signaling != SignalingState::Stable || state.local_sdp.is_some() {
                return Err(PeerError::InvalidState(format!(
                    "cannot create offer in {:?}",
                    state.signaling
                )));
            }
            let sdp = self.endpoint.description("offer");
            state.local_sdp = Some(sdp.clone());
            state.signaling = SignalingState::HaveLocalOffer;
            sdp
        };

        self.network
            .record_offer(&self.endpoint.local_id, &self.endpoint.remote_id);
        self.trickle();
        Ok(SessionDescription::offer(sdp))
    }

    async fn create_answer(&self) -> Result<SessionDescription, PeerError> {
        let sdp = {
            let mut state = self.endpoint.state.lock();
            if state.signaling != SignalingState::HaveRemoteOffer {
                return Err(PeerError::InvalidState(format!(
                    "cannot create answer in {:?}",
                    state.signaling
                )));
            }
            let sdp = self.endpoint.description("answer");
            state.local_sdp = Some(sdp.clone());
            state.signaling = SignalingState::Stable;
            sdp
        };

        self.trickle();
        self.network.try_connect(&self.endpoint);
        Ok(SessionDescription::answer(sdp))
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), PeerError> {
        let completed = {
            let mut state = self.endpoint.state.lock();
            match (desc.sdp_type, state.signaling) {
                (SdpType::Offer, SignalingState::Stable) if state.remote_sdp.is_none() => {
                    state.signaling = SignalingState::HaveRemoteOffer;
                    state.remote_sdp = Some(desc.sdp);
                    false
                }
                (SdpType::Answer, SignalingState::HaveLocalOffer) => {
                    state.signaling = SignalingState::Stable;
                    state.remote_sdp = Some(desc.sdp);
                    true
                }
                (sdp_type, signaling) => {
                    return Err(PeerError::InvalidState(format!(
                        "cannot apply remote {sdp_type:?} in {signaling:?}"
                    )));
                }
            }
        };

        if completed {
            self.network.try_connect(&self.endpoint);
        }
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), PeerError> {
        let (remote_description_set, closed) = {
            let state = self.endpoint.state.lock();
            (
                state.remote_sdp.is_some(),
                state.signaling == SignalingState::Closed,
            )
        };

        self.network.record_candidate(AppliedCandidate {
            local_id: self.endpoint.local_id.clone(),
            remote_id: self.endpoint.remote_id.clone(),
            candidate: candidate.candidate,
            remote_description_set,
        });

        if closed {
            return Err(PeerError::InvalidState("connection closed".to_string()));
        }
        if !remote_description_set {
            return Err(PeerError::Ice("remote description not set".to_string()));
        }
        Ok(())
    }

    fn signaling_state(&self) -> SignalingState {
        self.endpoint.state.lock().signaling
    }

    async fn close(&self) -> Result<(), PeerError> {
        {
            let mut state = self.endpoint.state.lock();
            if state.signaling == SignalingState::Closed {
                return Ok(());
            }
            state.signaling = SignalingState::Closed;
            state.connection = PeerConnectionState::Closed;
        }
        self.network.disconnect(&self.endpoint);
        Ok(())
    }
}
