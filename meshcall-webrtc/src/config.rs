use serde::{Deserialize, Serialize};

pub(crate) const AUDIO_TRACK_ID: &str = "audio";
pub(crate) const VIDEO_TRACK_ID: &str = "video";
pub(crate) const OPUS_CLOCK_RATE: u32 = 48_000;
pub(crate) const OPUS_CHANNELS: u16 = 2;
pub(crate) const VP8_CLOCK_RATE: u32 = 90_000;
pub const PEER_EVENTS_CAPACITY: usize = 128;

/// WebRTC configuration for low-level call setup.
///
/// This controls how peer-to-peer connections discover candidates and establish connectivity. At
/// minimum, a list of ICE servers must be provided. These are typically STUN servers, but TURN
/// servers may be added as well for NAT traversal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WebrtcConfig {
    /// List of ICE servers passed to the WebRTC stack.
    ///
    /// Each entry is a URL string for either a STUN or TURN server, following the
    /// [RFC 7064](https://www.rfc-editor.org/rfc/rfc7064) and [RFC 7065](https://www.rfc-editor.org/rfc/rfc7065)
    /// formats, respectively.
    ///
    /// Example:
    /// - `stun:stun.l.google.com:19302`
    /// - `turn:turn.example.com:3478?transport=udp`
    pub ice_servers: Vec<String>,
    /// Username used for all `turn:` servers.
    pub turn_username: Option<String>,
    /// Credential used for all `turn:` servers.
    pub turn_credential: Option<String>,
}

impl Default for WebrtcConfig {
    fn default() -> Self {
        Self {
            // Standard public STUN server from Google
            ice_servers: vec!["stun:stun.l.google.com:19302".to_string()],
            turn_username: None,
            turn_credential: None,
        }
    }
}
