use meshcall_protocol::{ParticipantId, RoomTopic};
use meshcall_signaling::SignalingError;
use meshcall_webrtc::{MediaError, PeerError};

#[derive(Debug, thiserror::Error)]
pub enum CallError {
    #[error("local media acquisition denied: {0}")]
    MediaAcquisitionDenied(#[source] MediaError),
    #[error("signaling unavailable: {0}")]
    SignalingUnavailable(#[source] SignalingError),
    #[error("negotiation with {remote_id} failed: {source}")]
    NegotiationFailed {
        remote_id: ParticipantId,
        #[source]
        source: PeerError,
    },
    /// A signal that does not fit the current state of its link. Never surfaced to callers.
    #[error("stale {variant} signal from {remote_id}")]
    StaleSignal {
        remote_id: ParticipantId,
        variant: &'static str,
    },
    #[error("already joined room {0}")]
    AlreadyJoined(RoomTopic),
    #[error("not in a room")]
    NotInRoom,
}

impl CallError {
    pub(crate) fn negotiation(remote_id: &ParticipantId, source: PeerError) -> Self {
        CallError::NegotiationFailed {
            remote_id: remote_id.clone(),
            source,
        }
    }

    pub(crate) fn stale(remote_id: &ParticipantId, variant: &'static str) -> Self {
        CallError::StaleSignal {
            remote_id: remote_id.clone(),
            variant,
        }
    }
}
