use crate::media::MediaKind;
use meshcall_signaling::SignalingError;

#[derive(Debug, thiserror::Error)]
pub enum PeerError {
    #[error("SDP error: {0}")]
    Sdp(String),
    #[error("ICE error: {0}")]
    Ice(String),
    #[error("media error: {0}")]
    Media(String),
    #[error("invalid signaling state: {0}")]
    InvalidState(String),
    #[error("transport error: {0}")]
    Transport(String),
    #[error(transparent)]
    Signaling(#[from] SignalingError),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MediaError {
    #[error("permission denied for {0} input")]
    PermissionDenied(MediaKind),
    #[error("media device unavailable: {0}")]
    Unavailable(String),
    #[error("track {0} already stopped")]
    TrackStopped(String),
    #[error("failed to write sample: {0}")]
    Write(String),
}
