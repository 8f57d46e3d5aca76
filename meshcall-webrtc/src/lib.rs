pub mod config;
pub mod connection;
pub mod error;
pub mod ice;
pub mod manager;
pub mod media;
pub mod peer;
pub mod rtc;
#[cfg(feature = "test-utils")]
pub mod test_utils;

pub use config::WebrtcConfig;
pub use connection::{
    LinkId, PeerConnection, PeerConnectionFactory, PeerConnectionState, PeerEvent, PeerEventKind,
    SessionDescription, SignalingState,
};
pub use error::{MediaError, PeerError};
pub use manager::{LinkUpdate, PeerConnectionManager, SignalOutcome};
pub use media::{
    LocalStream, LocalTrack, MediaConstraints, MediaDevices, MediaKind, RemoteStream, RemoteTrack,
    SampleTrackDevices,
};
pub use peer::{NegotiationRole, PeerLink};
pub use rtc::RtcPeerFactory;
