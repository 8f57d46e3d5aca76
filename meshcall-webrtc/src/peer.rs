use crate::connection::{LinkId, PeerConnection, PeerConnectionState, SignalingState};
use crate::media::RemoteStream;
use meshcall_protocol::ParticipantId;
use std::sync::Arc;

/// Which side of a pair initiates negotiation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationRole {
    Offerer,
    Answerer,
}

impl NegotiationRole {
    /// The higher-sorting participant of a pair always offers, so both sides agree on the role
    /// without any coordination.
    pub fn for_pair(local_id: &ParticipantId, remote_id: &ParticipantId) -> Self {
        if local_id > remote_id {
            NegotiationRole::Offerer
        } else {
            NegotiationRole::Answerer
        }
    }
}

/// The connection to one remote participant.
pub struct PeerLink {
    pub(crate) remote_id: ParticipantId,
    pub(crate) link_id: LinkId,
    pub(crate) role: NegotiationRole,
    pub(crate) connection: Arc<dyn PeerConnection>,
    pub(crate) connection_state: PeerConnectionState,
    pub(crate) remote_description_applied: bool,
    pub(crate) remote_stream: RemoteStream,
}

impl PeerLink {
    pub(crate) fn new(
        remote_id: ParticipantId,
        link_id: LinkId,
        role: NegotiationRole,
        connection: Arc<dyn PeerConnection>,
    ) -> Self {
        Self {
            remote_id,
            link_id,
            role,
            connection,
            connection_state: PeerConnectionState::New,
            remote_description_applied: false,
            remote_stream: RemoteStream::default(),
        }
    }

    pub fn remote_id(&self) -> &ParticipantId {
        &self.remote_id
    }

    pub fn link_id(&self) -> LinkId {
        self.link_id
    }

    pub fn role(&self) -> NegotiationRole {
        self.role
    }

    pub fn signaling_state(&self) -> SignalingState {
        self.connection.signaling_state()
    }

    pub fn connection_state(&self) -> PeerConnectionState {
        self.connection_state
    }

    pub fn remote_description_applied(&self) -> bool {
        self.remote_description_applied
    }

    pub fn remote_stream(&self) -> &RemoteStream {
        &self.remote_stream
    }
}

impl std::fmt::Debug for PeerLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerLink")
            .field("remote_id", &self.remote_id)
            .field("link_id", &self.link_id)
            .field("role", &self.role)
            .field("signaling_state", &self.signaling_state())
            .field("connection_state", &self.connection_state)
            .field("remote_description_applied", &self.remote_description_applied)
            .finish_non_exhaustive()
    }
}
