use crate::error::PeerError;
use crate::media::{LocalStream, RemoteTrack};
use async_trait::async_trait;
use meshcall_protocol::ParticipantId;
use meshcall_protocol::event::IceCandidate;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Generation counter distinguishing successive links to the same remote participant.
pub type LinkId = u64;

/// The offer/answer state of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalingState {
    Stable,
    HaveLocalOffer,
    HaveRemoteOffer,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl PeerConnectionState {
    /// Terminal states never recover; the link has to be torn down.
    pub fn is_terminal(&self) -> bool {
        matches!(self, PeerConnectionState::Failed | PeerConnectionState::Closed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SdpType {
    Offer,
    Answer,
}

#[derive(Clone, PartialEq, Eq)]
pub struct SessionDescription {
    pub sdp_type: SdpType,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Answer,
            sdp: sdp.into(),
        }
    }
}

impl std::fmt::Debug for SessionDescription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionDescription")
            .field("sdp_type", &self.sdp_type)
            .field("sdp_len", &self.sdp.len())
            .finish()
    }
}

/// A callback raised by a connection, tagged with the link that raised it.
#[derive(Debug, Clone)]
pub struct PeerEvent {
    pub remote_id: ParticipantId,
    pub link_id: LinkId,
    pub kind: PeerEventKind,
}

#[derive(Debug, Clone)]
pub enum PeerEventKind {
    /// A local ICE candidate was gathered and should be trickled to the remote.
    LocalCandidate(IceCandidate),
    StateChanged(PeerConnectionState),
    /// A remote track started arriving.
    Track(RemoteTrack),
}

/// One side of a peer-to-peer connection.
#[async_trait]
pub trait PeerConnection: Send + Sync {
    /// Creates an offer and applies it as the local description.
    async fn create_offer(&self) -> Result<SessionDescription, PeerError>;

    /// Creates an answer to the applied remote offer and applies it as the local description.
    async fn create_answer(&self) -> Result<SessionDescription, PeerError>;

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), PeerError>;

    /// Applies a remote candidate. Fails if no remote description has been applied yet.
    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), PeerError>;

    fn signaling_state(&self) -> SignalingState;

    async fn close(&self) -> Result<(), PeerError>;
}

/// Creates connections with all local tracks attached and callbacks wired to `events`.
#[async_trait]
pub trait PeerConnectionFactory: Send + Sync {
    async fn create(
        &self,
        remote_id: &ParticipantId,
        link_id: LinkId,
        local_stream: &LocalStream,
        events: mpsc::Sender<PeerEvent>,
    ) -> Result<Arc<dyn PeerConnection>, PeerError>;
}
