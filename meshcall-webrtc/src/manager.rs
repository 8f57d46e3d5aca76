//! Per-remote negotiation state of one room.

use crate::connection::{
    LinkId, PeerConnection, PeerConnectionFactory, PeerConnectionState, PeerEvent, PeerEventKind,
    SessionDescription, SignalingState,
};
use crate::error::PeerError;
use crate::ice::IceCandidateBuffer;
use crate::media::{LocalStream, MediaKind, RemoteStream};
use crate::peer::{NegotiationRole, PeerLink};
use meshcall_protocol::{Answer, Candidate, Offer, ParticipantId};
use meshcall_signaling::RoomChannel;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::instrument;

/// What happened to an incoming signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalOutcome {
    Applied,
    /// Held back until the link can accept it.
    Buffered,
    /// Stale or duplicate; dropped without side effects.
    Ignored,
}

/// Observable link changes resulting from a [`PeerEvent`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkUpdate {
    StateChanged {
        remote_id: ParticipantId,
        state: PeerConnectionState,
    },
    TrackAdded {
        remote_id: ParticipantId,
        kind: MediaKind,
    },
    /// The link reached a terminal state on its own and was torn down.
    Closed {
        remote_id: ParticipantId,
        state: PeerConnectionState,
    },
}

/// Owns every [`PeerLink`] of a room and drives offer/answer/candidate exchange for them.
///
/// All methods take `&mut self`: the manager is owned by exactly one session, which serializes
/// signals and connection callbacks through it. Remote candidates are never handed to a connection
/// before its remote description is applied; until then they wait in an [`IceCandidateBuffer`].
pub struct PeerConnectionManager {
    local_id: ParticipantId,
    local_name: String,
    local_stream: LocalStream,
    factory: Arc<dyn PeerConnectionFactory>,
    room: RoomChannel,
    events_tx: mpsc::Sender<PeerEvent>,
    links: HashMap<ParticipantId, PeerLink>,
    pending: IceCandidateBuffer,
    /// Remotes whose link was torn down. Their late candidates belong to the old lifecycle.
    closed: HashSet<ParticipantId>,
    next_link_id: LinkId,
}

impl PeerConnectionManager {
    pub fn new(
        local_id: ParticipantId,
        local_name: impl Into<String>,
        local_stream: LocalStream,
        factory: Arc<dyn PeerConnectionFactory>,
        room: RoomChannel,
        events_tx: mpsc::Sender<PeerEvent>,
    ) -> Self {
        Self {
            local_id,
            local_name: local_name.into(),
            local_stream,
            factory,
            room,
            events_tx,
            links: HashMap::new(),
            pending: IceCandidateBuffer::new(),
            closed: HashSet::new(),
            next_link_id: 0,
        }
    }

    pub fn local_id(&self) -> &ParticipantId {
        &self.local_id
    }

    pub fn link(&self, remote_id: &ParticipantId) -> Option<&PeerLink> {
        self.links.get(remote_id)
    }

    pub fn links(&self) -> impl Iterator<Item = &PeerLink> {
        self.links.values()
    }

    pub fn contains(&self, remote_id: &ParticipantId) -> bool {
        self.links.contains_key(remote_id)
    }

    pub fn len(&self) -> usize {
        self.links.len()
    }

    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }

    pub fn pending_candidates(&self, remote_id: &ParticipantId) -> usize {
        self.pending.len(remote_id)
    }

    pub fn remote_stream(&self, remote_id: &ParticipantId) -> Option<&RemoteStream> {
        self.links.get(remote_id).map(PeerLink::remote_stream)
    }

    /// Creates a link as offerer and publishes the offer.
    ///
    /// Returns `Ok(false)` without side effects if a link to `remote_id` already exists.
    #[instrument(level = "debug", skip(self), fields(local_id = %self.local_id), err)]
    pub async fn connect_to(&mut self, remote_id: &ParticipantId) -> Result<bool, PeerError> {
        if self.links.contains_key(remote_id) {
            tracing::debug!("Link already exists, not offering again");
            return Ok(false);
        }

        let connection = self
            .create_link(remote_id, NegotiationRole::Offerer)
            .await?;

        let result = async {
            let offer = connection.create_offer().await?;
            self.room
                .publish(Offer {
                    from: self.local_id.clone(),
                    to: remote_id.clone(),
                    from_name: self.local_name.clone(),
                    sdp: offer.sdp,
                })
                .await?;
            Ok::<_, PeerError>(())
        }
        .await;

        if let Err(err) = result {
            tracing::warn!(?err, "Failed to send offer, tearing down link");
            self.close(remote_id).await;
            return Err(err);
        }

        tracing::debug!("Offer sent");
        Ok(true)
    }

    /// Applies a remote offer and answers it, creating or replacing the link as needed.
    #[instrument(level = "debug", skip(self, offer), fields(local_id = %self.local_id, remote_id = %offer.from), err)]
    pub async fn handle_offer(&mut self, offer: Offer) -> Result<SignalOutcome, PeerError> {
        let remote_id = offer.from;

        if let Some(link) = self.links.get(&remote_id) {
            match link.signaling_state() {
                SignalingState::HaveLocalOffer => {
                    if NegotiationRole::for_pair(&self.local_id, &remote_id)
                        == NegotiationRole::Offerer
                    {
                        tracing::debug!("Offer collision, keeping our own offer");
                        return Ok(SignalOutcome::Ignored);
                    }
                    tracing::debug!("Offer collision, dropping our own offer and answering");
                    self.close_link(&remote_id, false).await;
                }
                SignalingState::HaveRemoteOffer => {
                    tracing::debug!("Already answering an offer from this participant, ignoring");
                    return Ok(SignalOutcome::Ignored);
                }
                SignalingState::Stable | SignalingState::Closed => {
                    tracing::debug!(link_id = link.link_id, "Offer for existing link, starting new lifecycle");
                    self.close_link(&remote_id, false).await;
                }
            }
        }

        let connection = self
            .create_link(&remote_id, NegotiationRole::Answerer)
            .await?;

        match self.answer(&remote_id, &connection, offer.sdp).await {
            Ok(()) => {
                tracing::debug!("Answer sent");
                Ok(SignalOutcome::Applied)
            }
            Err(err) => {
                tracing::warn!(?err, "Failed to answer offer, tearing down link");
                self.close(&remote_id).await;
                Err(err)
            }
        }
    }

    /// Applies a remote answer if we are waiting for one.
    #[instrument(level = "debug", skip(self, answer), fields(local_id = %self.local_id, remote_id = %answer.from), err)]
    pub async fn handle_answer(&mut self, answer: Answer) -> Result<SignalOutcome, PeerError> {
        let remote_id = answer.from;

        let Some(link) = self.links.get(&remote_id) else {
            tracing::debug!("Answer without link, ignoring");
            return Ok(SignalOutcome::Ignored);
        };
        if link.signaling_state() != SignalingState::HaveLocalOffer {
            tracing::debug!(state = ?link.signaling_state(), "No offer outstanding, ignoring answer");
            return Ok(SignalOutcome::Ignored);
        }
        let connection = link.connection.clone();

        if let Err(err) = connection
            .set_remote_description(SessionDescription::answer(answer.sdp))
            .await
        {
            tracing::warn!(?err, "Failed to apply answer, tearing down link");
            self.close(&remote_id).await;
            return Err(err);
        }

        if let Some(link) = self.links.get_mut(&remote_id) {
            link.remote_description_applied = true;
        }
        self.apply_buffered(&remote_id, &connection).await;

        Ok(SignalOutcome::Applied)
    }

    /// Applies a remote candidate, or buffers it if the link cannot accept it yet.
    #[instrument(level = "trace", skip(self, candidate), fields(local_id = %self.local_id, remote_id = %candidate.from), err)]
    pub async fn handle_candidate(
        &mut self,
        candidate: Candidate,
    ) -> Result<SignalOutcome, PeerError> {
        let connection = self
            .links
            .get(&candidate.from)
            .filter(|link| link.remote_description_applied)
            .map(|link| link.connection.clone());

        let Some(connection) = connection else {
            if self.closed.contains(&candidate.from) {
                tracing::debug!("Candidate for closed link, ignoring");
                return Ok(SignalOutcome::Ignored);
            }
            tracing::trace!("Link not ready, buffering candidate");
            self.pending.enqueue(&candidate.from, candidate.candidate);
            return Ok(SignalOutcome::Buffered);
        };
        connection.add_ice_candidate(candidate.candidate).await?;
        Ok(SignalOutcome::Applied)
    }

    /// Processes a connection callback. Callbacks of superseded links are ignored.
    #[instrument(level = "trace", skip(self, event), fields(local_id = %self.local_id, remote_id = %event.remote_id, link_id = event.link_id), err)]
    pub async fn handle_peer_event(
        &mut self,
        event: PeerEvent,
    ) -> Result<Option<LinkUpdate>, PeerError> {
        let PeerEvent {
            remote_id,
            link_id,
            kind,
        } = event;

        let Some(link) = self.links.get_mut(&remote_id) else {
            tracing::trace!("Event for unknown link, ignoring");
            return Ok(None);
        };
        if link.link_id != link_id {
            tracing::debug!(current_link_id = link.link_id, "Event for superseded link, ignoring");
            return Ok(None);
        }

        match kind {
            PeerEventKind::LocalCandidate(candidate) => {
                self.room
                    .publish(Candidate {
                        from: self.local_id.clone(),
                        to: remote_id,
                        candidate,
                    })
                    .await?;
                Ok(None)
            }
            PeerEventKind::StateChanged(state) => {
                link.connection_state = state;
                if state.is_terminal() {
                    tracing::info!(?state, "Peer connection ended, tearing down link");
                    self.close(&remote_id).await;
                    return Ok(Some(LinkUpdate::Closed { remote_id, state }));
                }
                tracing::debug!(?state, "Peer connection state changed");
                Ok(Some(LinkUpdate::StateChanged { remote_id, state }))
            }
            PeerEventKind::Track(track) => {
                let kind = track.kind;
                link.remote_stream.add_track(track);
                Ok(Some(LinkUpdate::TrackAdded { remote_id, kind }))
            }
        }
    }

    /// Closes the link to `remote_id` and discards its buffered candidates. Returns whether a link
    /// existed.
    #[instrument(level = "debug", skip(self), fields(local_id = %self.local_id))]
    pub async fn close(&mut self, remote_id: &ParticipantId) -> bool {
        self.closed.insert(remote_id.clone());
        self.close_link(remote_id, true).await
    }

    /// Accepts candidates from a remote that was closed before, once it announced itself again.
    pub fn readmit(&mut self, remote_id: &ParticipantId) {
        if self.closed.remove(remote_id) {
            tracing::trace!(%remote_id, "Readmitted closed participant");
        }
    }

    /// Closes every link.
    #[instrument(level = "debug", skip(self), fields(local_id = %self.local_id))]
    pub async fn close_all(&mut self) {
        let links: Vec<PeerLink> = self.links.drain().map(|(_, link)| link).collect();
        self.pending.clear();
        self.closed.extend(links.iter().map(|link| link.remote_id.clone()));
        for link in links {
            if let Err(err) = link.connection.close().await {
                tracing::warn!(remote_id = %link.remote_id, ?err, "Failed to close peer connection");
            }
        }
    }

    async fn create_link(
        &mut self,
        remote_id: &ParticipantId,
        role: NegotiationRole,
    ) -> Result<Arc<dyn PeerConnection>, PeerError> {
        self.next_link_id += 1;
        let link_id = self.next_link_id;

        let connection = self
            .factory
            .create(
                remote_id,
                link_id,
                &self.local_stream,
                self.events_tx.clone(),
            )
            .await?;

        tracing::debug!(%remote_id, link_id, ?role, "Created peer link");
        self.closed.remove(remote_id);
        self.links.insert(
            remote_id.clone(),
            PeerLink::new(remote_id.clone(), link_id, role, connection.clone()),
        );
        Ok(connection)
    }

    async fn answer(
        &mut self,
        remote_id: &ParticipantId,
        connection: &Arc<dyn PeerConnection>,
        sdp: String,
    ) -> Result<(), PeerError> {
        connection
            .set_remote_description(SessionDescription::offer(sdp))
            .await?;
        if let Some(link) = self.links.get_mut(remote_id) {
            link.remote_description_applied = true;
        }

        self.apply_buffered(remote_id, connection).await;

        let answer = connection.create_answer().await?;
        self.room
            .publish(Answer {
                from: self.local_id.clone(),
                to: remote_id.clone(),
                from_name: self.local_name.clone(),
                sdp: answer.sdp,
            })
            .await?;
        Ok(())
    }

    async fn apply_buffered(
        &mut self,
        remote_id: &ParticipantId,
        connection: &Arc<dyn PeerConnection>,
    ) {
        let candidates = self.pending.drain(remote_id);
        if candidates.is_empty() {
            return;
        }

        tracing::debug!(%remote_id, count = candidates.len(), "Applying buffered candidates");
        for candidate in candidates {
            if let Err(err) = connection.add_ice_candidate(candidate).await {
                tracing::warn!(%remote_id, ?err, "Failed to apply buffered candidate");
            }
        }
    }

    async fn close_link(&mut self, remote_id: &ParticipantId, discard_candidates: bool) -> bool {
        if discard_candidates {
            self.pending.discard(remote_id);
        }

        let Some(link) = self.links.remove(remote_id) else {
            return false;
        };
        if let Err(err) = link.connection.close().await {
            tracing::warn!(%remote_id, ?err, "Failed to close peer connection");
        }
        tracing::debug!(%remote_id, link_id = link.link_id, "Closed peer link");
        true
    }
}

impl std::fmt::Debug for PeerConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerConnectionManager")
            .field("local_id", &self.local_id)
            .field("links", &self.links.len())
            .field("next_link_id", &self.next_link_id)
            .finish_non_exhaustive()
    }
}
