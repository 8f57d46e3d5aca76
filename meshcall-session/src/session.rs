use crate::config::SessionConfig;
use crate::directory::ProfileDirectory;
use crate::error::CallError;
use crate::presence::{self, Participant, RoomPresence};
use meshcall_protocol::{Join, MediaStatus, ParticipantId, RoomEvent, RoomTopic};
use meshcall_signaling::{RoomChannel, SignalingChannel};
use meshcall_webrtc::{
    LinkUpdate, LocalStream, MediaConstraints, MediaDevices, MediaKind, NegotiationRole,
    PeerConnectionFactory, PeerConnectionManager, PeerConnectionState, PeerError, PeerEvent,
    PeerLink, RemoteStream, SignalOutcome,
};
use std::sync::Arc;
use tokio::sync::{Mutex, mpsc, watch};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, instrument};

/// Room-level connection state of the local participant. `Connected` only means the room
/// subscription is active; a participant alone in a room is connected with zero peers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionState {
    #[default]
    Idle,
    Connecting,
    Connected,
    Failed,
}

/// One remote participant as presented to the application.
#[derive(Debug, Clone)]
pub struct ParticipantView {
    pub participant: Participant,
    /// `None` until a peer link to the participant exists.
    pub connection_state: Option<PeerConnectionState>,
    /// `None` until the first remote track arrived.
    pub stream: Option<RemoteStream>,
    pub muted: bool,
    pub camera_off: bool,
}

/// The collaborators a session talks to.
#[derive(Clone)]
pub struct SessionDeps {
    pub signaling: Arc<dyn SignalingChannel>,
    pub devices: Arc<dyn MediaDevices>,
    pub peers: Arc<dyn PeerConnectionFactory>,
    pub directory: Arc<dyn ProfileDirectory>,
}

/// A participant's membership in at most one room at a time.
///
/// Everything that happens in a joined room (room events, connection callbacks, profile lookups)
/// is processed under a single lock, so handlers for the same remote participant never overlap.
/// [`CallSession::leave`] releases every resource; dropping the session only stops its background
/// tasks.
pub struct CallSession {
    inner: Arc<SessionInner>,
}

struct SessionInner {
    local_id: ParticipantId,
    display_name: String,
    config: SessionConfig,
    deps: SessionDeps,
    shutdown_token: CancellationToken,
    /// Cancellation of the currently joined room, reachable without taking the room lock.
    active: parking_lot::Mutex<Option<CancellationToken>>,
    state_tx: watch::Sender<SessionState>,
    participants_tx: watch::Sender<Vec<ParticipantView>>,
    room: Mutex<Option<JoinedRoom>>,
}

struct JoinedRoom {
    topic: RoomTopic,
    channel: RoomChannel,
    manager: PeerConnectionManager,
    presence: RoomPresence,
    local_stream: LocalStream,
    muted: bool,
    camera_off: bool,
    cancel: CancellationToken,
    tasks: JoinSet<()>,
}

impl CallSession {
    pub fn new(
        local_id: ParticipantId,
        display_name: impl Into<String>,
        config: SessionConfig,
        deps: SessionDeps,
    ) -> Self {
        let (state_tx, _) = watch::channel(SessionState::Idle);
        let (participants_tx, _) = watch::channel(Vec::new());

        Self {
            inner: Arc::new(SessionInner {
                local_id,
                display_name: display_name.into(),
                config,
                deps,
                shutdown_token: CancellationToken::new(),
                active: parking_lot::Mutex::new(None),
                state_tx,
                participants_tx,
                room: Mutex::new(None),
            }),
        }
    }

    pub fn local_id(&self) -> &ParticipantId {
        &self.inner.local_id
    }

    /// Acquires local media, subscribes to the room and starts announcing our presence.
    ///
    /// Media is acquired before anything is subscribed, so a denied permission leaves no trace on
    /// the signaling channel. If the subscription fails, the acquired tracks are stopped again.
    #[instrument(level = "info", skip(self), fields(local_id = %self.inner.local_id), err)]
    pub async fn join(&self, topic: RoomTopic, want_video: bool) -> Result<(), CallError> {
        let mut guard = self.inner.room.lock().await;
        if let Some(room) = guard.as_ref() {
            return Err(CallError::AlreadyJoined(room.topic.clone()));
        }

        self.inner.set_state(SessionState::Connecting);

        let constraints = if want_video {
            MediaConstraints::audio_video()
        } else {
            MediaConstraints::audio_only()
        };
        let local_stream = match self.inner.deps.devices.acquire(constraints).await {
            Ok(stream) => stream,
            Err(err) => {
                tracing::warn!(?err, "Failed to acquire local media");
                self.inner.set_state(SessionState::Failed);
                return Err(CallError::MediaAcquisitionDenied(err));
            }
        };

        let subscription = match self.inner.deps.signaling.subscribe(&topic).await {
            Ok(subscription) => subscription,
            Err(err) => {
                tracing::warn!(?err, "Failed to subscribe to room");
                local_stream.stop();
                self.inner.set_state(SessionState::Failed);
                return Err(CallError::SignalingUnavailable(err));
            }
        };

        let channel = RoomChannel::new(self.inner.deps.signaling.clone(), subscription.handle);
        let cancel = self.inner.shutdown_token.child_token();
        let (peer_events_tx, peer_events_rx) = mpsc::channel(self.inner.config.peer_events_capacity);

        let presence = RoomPresence::new(self.inner.local_id.clone(), &self.inner.display_name);
        let manager = PeerConnectionManager::new(
            self.inner.local_id.clone(),
            &self.inner.display_name,
            local_stream.clone(),
            self.inner.deps.peers.clone(),
            channel.clone(),
            peer_events_tx,
        );

        let mut tasks = JoinSet::new();
        tasks.spawn(
            run_dispatcher(
                self.inner.clone(),
                cancel.clone(),
                subscription.events,
                peer_events_rx,
            )
            .instrument(tracing::Span::current()),
        );
        tasks.spawn(
            presence::announce(
                channel.clone(),
                presence.local_join(),
                self.inner.config.announce_repeats,
                self.inner.config.announce_interval(),
                cancel.clone(),
            )
            .instrument(tracing::Span::current()),
        );

        *self.inner.active.lock() = Some(cancel.clone());
        let room = guard.insert(JoinedRoom {
            topic,
            channel,
            manager,
            presence,
            local_stream,
            muted: false,
            camera_off: false,
            cancel,
            tasks,
        });

        self.inner.set_state(SessionState::Connected);
        self.inner.publish_participants(room);
        tracing::info!(topic = %room.topic, "Joined room");
        Ok(())
    }

    /// Leaves the current room. Safe to call any number of times.
    ///
    /// The `leave` broadcast runs alongside local teardown and is bounded by
    /// [`SessionConfig::leave_publish_timeout`]; local resources are released regardless of its
    /// outcome.
    #[instrument(level = "info", skip(self), fields(local_id = %self.inner.local_id))]
    pub async fn leave(&self) {
        // Stops handlers waiting for the room lock from touching the room after teardown.
        if let Some(cancel) = self.inner.active.lock().take() {
            cancel.cancel();
        }

        let Some(room) = self.inner.room.lock().await.take() else {
            tracing::debug!("Not in a room, nothing to leave");
            return;
        };
        let JoinedRoom {
            topic,
            channel,
            mut manager,
            presence,
            local_stream,
            mut tasks,
            ..
        } = room;
        tasks.abort_all();
        tracing::info!(%topic, "Leaving room");

        let publish = async {
            match tokio::time::timeout(
                self.inner.config.leave_publish_timeout(),
                channel.publish(presence.local_leave()),
            )
            .await
            {
                Ok(Ok(())) => tracing::trace!("Leave broadcast"),
                Ok(Err(err)) => tracing::debug!(?err, "Failed to broadcast leave"),
                Err(_) => tracing::debug!("Leave broadcast timed out"),
            }
        };
        let teardown = async {
            local_stream.stop();
            manager.close_all().await;
        };
        tokio::join!(publish, teardown);

        channel.unsubscribe().await;
        self.inner.set_state(SessionState::Idle);
        self.inner.participants_tx.send_replace(Vec::new());
        tracing::info!("Left room");
    }

    /// Flips the microphone. Returns whether it is muted now.
    #[instrument(level = "debug", skip(self), fields(local_id = %self.inner.local_id), err)]
    pub async fn toggle_mute(&self) -> Result<bool, CallError> {
        let mut guard = self.inner.room.lock().await;
        let room = guard.as_mut().ok_or(CallError::NotInRoom)?;

        room.muted = !room.muted;
        room.local_stream.set_enabled(MediaKind::Audio, !room.muted);
        room.broadcast_media_status().await;
        Ok(room.muted)
    }

    /// Flips the camera. Returns whether it is off now.
    #[instrument(level = "debug", skip(self), fields(local_id = %self.inner.local_id), err)]
    pub async fn toggle_camera(&self) -> Result<bool, CallError> {
        let mut guard = self.inner.room.lock().await;
        let room = guard.as_mut().ok_or(CallError::NotInRoom)?;

        room.camera_off = !room.camera_off;
        if !room
            .local_stream
            .set_enabled(MediaKind::Video, !room.camera_off)
        {
            tracing::debug!("No camera track attached, only updating status");
        }
        room.broadcast_media_status().await;
        Ok(room.camera_off)
    }

    pub fn connection_state(&self) -> SessionState {
        *self.inner.state_tx.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<SessionState> {
        self.inner.state_tx.subscribe()
    }

    /// Remote participants sorted by id.
    pub fn participants(&self) -> Vec<ParticipantView> {
        self.inner.participants_tx.borrow().clone()
    }

    pub fn subscribe_participants(&self) -> watch::Receiver<Vec<ParticipantView>> {
        self.inner.participants_tx.subscribe()
    }

    pub async fn room_topic(&self) -> Option<RoomTopic> {
        let guard = self.inner.room.lock().await;
        guard.as_ref().map(|room| room.topic.clone())
    }

    pub async fn is_muted(&self) -> Option<bool> {
        let guard = self.inner.room.lock().await;
        guard.as_ref().map(|room| room.muted)
    }

    pub async fn is_camera_off(&self) -> Option<bool> {
        let guard = self.inner.room.lock().await;
        guard.as_ref().map(|room| room.camera_off)
    }

    /// The local stream while in a room, for feeding encoded samples into its tracks.
    pub async fn local_stream(&self) -> Option<LocalStream> {
        let guard = self.inner.room.lock().await;
        guard.as_ref().map(|room| room.local_stream.clone())
    }
}

impl Drop for CallSession {
    fn drop(&mut self) {
        self.inner.shutdown_token.cancel();
    }
}

impl std::fmt::Debug for CallSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallSession")
            .field("local_id", &self.inner.local_id)
            .field("state", &self.connection_state())
            .finish_non_exhaustive()
    }
}

/// Multiplexes room events and connection callbacks of one joined room until it is left.
async fn run_dispatcher(
    inner: Arc<SessionInner>,
    cancel: CancellationToken,
    mut events: mpsc::Receiver<RoomEvent>,
    mut peer_events: mpsc::Receiver<PeerEvent>,
) {
    tracing::debug!("Starting room dispatcher");

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                tracing::trace!("Room dispatcher cancelled");
                break;
            }
            event = events.recv() => {
                let Some(event) = event else {
                    inner.subscription_ended(&cancel);
                    break;
                };
                let span = tracing::trace_span!(
                    "room_event",
                    variant = event.variant(),
                    remote_id = %event.sender()
                );
                inner.dispatch_room_event(&cancel, event).instrument(span).await;
            }
            Some(event) = peer_events.recv() => {
                inner.dispatch_peer_event(&cancel, event).await;
            }
        }
    }

    tracing::debug!("Room dispatcher finished");
}

impl SessionInner {
    fn set_state(&self, state: SessionState) {
        let previous = self.state_tx.send_replace(state);
        if previous != state {
            tracing::debug!(?previous, ?state, "Session state changed");
        }
    }

    fn publish_participants(&self, room: &JoinedRoom) {
        self.participants_tx.send_replace(room.views());
    }

    fn subscription_ended(&self, cancel: &CancellationToken) {
        if cancel.is_cancelled() {
            return;
        }
        tracing::warn!("Room subscription ended unexpectedly");
        self.set_state(SessionState::Failed);
    }

    async fn dispatch_room_event(self: &Arc<Self>, cancel: &CancellationToken, event: RoomEvent) {
        if !event.is_relevant_to(&self.local_id) {
            tracing::trace!("Event not addressed to us, skipping");
            return;
        }

        let mut guard = self.room.lock().await;
        if cancel.is_cancelled() {
            tracing::trace!("Session no longer active, dropping event");
            return;
        }
        let Some(room) = guard.as_mut() else {
            return;
        };

        match self.handle_room_event(room, event).await {
            Ok(()) => {}
            Err(err @ CallError::StaleSignal { .. }) => {
                tracing::debug!(%err, "Dropping stale signal");
            }
            Err(err) => {
                tracing::warn!(?err, "Failed to handle room event");
            }
        }
        self.publish_participants(room);
    }

    async fn handle_room_event(
        self: &Arc<Self>,
        room: &mut JoinedRoom,
        event: RoomEvent,
    ) -> Result<(), CallError> {
        let variant = event.variant();

        match event {
            RoomEvent::Join(join) => self.handle_join(room, join).await,
            RoomEvent::Leave(leave) => {
                let closed = room.manager.close(&leave.user_id).await;
                let removed = room.presence.remove(&leave.user_id).is_some();
                if !closed && !removed {
                    return Err(CallError::stale(&leave.user_id, variant));
                }
                tracing::info!(remote_id = %leave.user_id, "Participant left the room");
                Ok(())
            }
            RoomEvent::Offer(offer) => {
                let remote_id = offer.from.clone();
                if room.presence.observe(&remote_id, &offer.from_name) {
                    self.lookup_profile(room, remote_id.clone());
                }
                match room.manager.handle_offer(offer).await {
                    Ok(SignalOutcome::Ignored) => Err(CallError::stale(&remote_id, variant)),
                    Ok(_) => Ok(()),
                    Err(source) => Err(Self::negotiation_failed(room, &remote_id, source)),
                }
            }
            RoomEvent::Answer(answer) => {
                let remote_id = answer.from.clone();
                match room.manager.handle_answer(answer).await {
                    Ok(SignalOutcome::Ignored) => Err(CallError::stale(&remote_id, variant)),
                    Ok(_) => Ok(()),
                    Err(source) => Err(Self::negotiation_failed(room, &remote_id, source)),
                }
            }
            RoomEvent::Candidate(candidate) => {
                let remote_id = candidate.from.clone();
                match room.manager.handle_candidate(candidate).await {
                    Ok(SignalOutcome::Ignored) => Err(CallError::stale(&remote_id, variant)),
                    Ok(_) => Ok(()),
                    Err(source) => Err(CallError::negotiation(&remote_id, source)),
                }
            }
            RoomEvent::MediaStatus(status) => {
                if !room.presence.apply_media_status(&status) {
                    return Err(CallError::stale(&status.user_id, variant));
                }
                Ok(())
            }
        }
    }

    /// The manager already tore the link down. Nothing re-offers until the remote joins again.
    fn negotiation_failed(
        room: &mut JoinedRoom,
        remote_id: &ParticipantId,
        source: PeerError,
    ) -> CallError {
        room.presence.remove(remote_id);
        CallError::negotiation(remote_id, source)
    }

    /// The higher id of a pair offers. The lower id announces itself back instead, so a remote that
    /// joined after our own announcements ended still learns about us and offers.
    async fn handle_join(
        self: &Arc<Self>,
        room: &mut JoinedRoom,
        join: Join,
    ) -> Result<(), CallError> {
        let remote_id = join.user_id;
        if room.presence.observe(&remote_id, &join.display_name) {
            self.lookup_profile(room, remote_id.clone());
        }
        room.manager.readmit(&remote_id);

        if room.manager.contains(&remote_id) {
            return Err(CallError::stale(&remote_id, "Join"));
        }

        match NegotiationRole::for_pair(&self.local_id, &remote_id) {
            NegotiationRole::Offerer => {
                tracing::debug!(%remote_id, "Offering to participant");
                if let Err(source) = room.manager.connect_to(&remote_id).await {
                    return Err(Self::negotiation_failed(room, &remote_id, source));
                }
            }
            NegotiationRole::Answerer => {
                tracing::debug!(%remote_id, "Announcing back to participant");
                room.channel
                    .publish(room.presence.local_join())
                    .await
                    .map_err(CallError::SignalingUnavailable)?;
            }
        }
        Ok(())
    }

    #[instrument(level = "trace", skip(self, cancel, event), fields(remote_id = %event.remote_id, link_id = event.link_id))]
    async fn dispatch_peer_event(&self, cancel: &CancellationToken, event: PeerEvent) {
        let mut guard = self.room.lock().await;
        if cancel.is_cancelled() {
            tracing::trace!("Session no longer active, dropping peer event");
            return;
        }
        let Some(room) = guard.as_mut() else {
            return;
        };

        match room.manager.handle_peer_event(event).await {
            Ok(None) => return,
            Ok(Some(LinkUpdate::Closed { remote_id, state })) => {
                tracing::info!(%remote_id, ?state, "Peer link ended, removing participant");
                room.presence.remove(&remote_id);
            }
            Ok(Some(LinkUpdate::StateChanged { remote_id, state })) => {
                tracing::debug!(%remote_id, ?state, "Peer link state changed");
            }
            Ok(Some(LinkUpdate::TrackAdded { remote_id, kind })) => {
                tracing::debug!(%remote_id, %kind, "Remote track added");
            }
            Err(err) => {
                tracing::warn!(?err, "Failed to handle peer event");
            }
        }
        self.publish_participants(room);
    }

    /// Resolves the participant's profile in the background. A failed lookup keeps the announced
    /// name.
    fn lookup_profile(self: &Arc<Self>, room: &mut JoinedRoom, remote_id: ParticipantId) {
        while room.tasks.try_join_next().is_some() {}

        let inner = Arc::clone(self);
        let cancel = room.cancel.clone();
        let span = tracing::debug_span!("profile_lookup", %remote_id);

        room.tasks.spawn(
            async move {
                let result = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return,
                    result = inner.deps.directory.lookup_profile(&remote_id) => result,
                };
                let profile = match result {
                    Ok(profile) => profile,
                    Err(err) => {
                        tracing::debug!(?err, "Profile lookup failed, keeping announced name");
                        return;
                    }
                };

                let mut guard = inner.room.lock().await;
                if cancel.is_cancelled() {
                    return;
                }
                if let Some(room) = guard.as_mut()
                    && room.presence.apply_profile(&remote_id, profile)
                {
                    tracing::trace!("Applied profile");
                    inner.publish_participants(room);
                }
            }
            .instrument(span),
        );
    }
}

impl JoinedRoom {
    fn views(&self) -> Vec<ParticipantView> {
        self.presence
            .members()
            .map(|member| {
                let link = self.manager.link(&member.participant.id);
                ParticipantView {
                    participant: member.participant.clone(),
                    connection_state: link.map(PeerLink::connection_state),
                    stream: link
                        .map(PeerLink::remote_stream)
                        .filter(|stream| !stream.is_empty())
                        .cloned(),
                    muted: member.muted,
                    camera_off: member.camera_off,
                }
            })
            .collect()
    }

    async fn broadcast_media_status(&self) {
        let status = MediaStatus {
            user_id: self.presence.local_id().clone(),
            muted: self.muted,
            camera_off: self.camera_off,
        };
        if let Err(err) = self.channel.publish(status).await {
            tracing::debug!(?err, "Failed to broadcast media status");
        }
    }
}
