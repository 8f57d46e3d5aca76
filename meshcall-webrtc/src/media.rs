//! Local capture tracks and received remote streams.

use crate::config::{
    AUDIO_TRACK_ID, OPUS_CHANNELS, OPUS_CLOCK_RATE, VIDEO_TRACK_ID, VP8_CLOCK_RATE,
};
use crate::error::MediaError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use webrtc::api::media_engine::{MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::media::Sample;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_remote::TrackRemote;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Audio,
    Video,
}

impl std::fmt::Display for MediaKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MediaKind::Audio => f.write_str("audio"),
            MediaKind::Video => f.write_str("video"),
        }
    }
}

impl From<RTPCodecType> for MediaKind {
    fn from(value: RTPCodecType) -> Self {
        match value {
            RTPCodecType::Video => MediaKind::Video,
            _ => MediaKind::Audio,
        }
    }
}

/// Which inputs to capture.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MediaConstraints {
    pub audio: bool,
    pub video: bool,
}

impl MediaConstraints {
    pub fn audio_only() -> Self {
        Self {
            audio: true,
            video: false,
        }
    }

    pub fn audio_video() -> Self {
        Self {
            audio: true,
            video: true,
        }
    }
}

/// Access to local capture devices.
#[async_trait]
pub trait MediaDevices: Send + Sync {
    async fn acquire(&self, constraints: MediaConstraints) -> Result<LocalStream, MediaError>;
}

/// A local capture track, shared by every peer connection it is attached to.
///
/// Disabling a track keeps it attached and negotiated but stops forwarding samples, so muting never
/// requires renegotiation.
pub struct LocalTrack {
    id: String,
    kind: MediaKind,
    enabled: AtomicBool,
    stopped: AtomicBool,
    rtp: Arc<TrackLocalStaticSample>,
}

impl LocalTrack {
    pub fn new(kind: MediaKind, stream_id: &str) -> Self {
        let (id, codec) = match kind {
            MediaKind::Audio => (
                AUDIO_TRACK_ID,
                RTCRtpCodecCapability {
                    mime_type: MIME_TYPE_OPUS.to_owned(),
                    clock_rate: OPUS_CLOCK_RATE,
                    channels: OPUS_CHANNELS,
                    sdp_fmtp_line: "minptime=10;useinbandfec=1".to_owned(),
                    ..Default::default()
                },
            ),
            MediaKind::Video => (
                VIDEO_TRACK_ID,
                RTCRtpCodecCapability {
                    mime_type: MIME_TYPE_VP8.to_owned(),
                    clock_rate: VP8_CLOCK_RATE,
                    ..Default::default()
                },
            ),
        };

        Self {
            id: id.to_string(),
            kind,
            enabled: AtomicBool::new(true),
            stopped: AtomicBool::new(false),
            rtp: Arc::new(TrackLocalStaticSample::new(
                codec,
                id.to_string(),
                stream_id.to_string(),
            )),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kind(&self) -> MediaKind {
        self.kind
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Release);
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    /// Releases the track. Stopping is final and idempotent.
    pub fn stop(&self) {
        if !self.stopped.swap(true, Ordering::AcqRel) {
            tracing::debug!(track_id = %self.id, kind = %self.kind, "Local track stopped");
        }
    }

    /// The RTP track handed to peer connections.
    pub fn rtp(&self) -> Arc<dyn TrackLocal + Send + Sync> {
        self.rtp.clone()
    }

    /// Feeds an encoded sample to all connections the track is attached to. Samples written while
    /// the track is disabled are dropped.
    pub async fn write_sample(&self, sample: &Sample) -> Result<(), MediaError> {
        if self.is_stopped() {
            return Err(MediaError::TrackStopped(self.id.clone()));
        }
        if !self.is_enabled() {
            return Ok(());
        }
        self.rtp
            .write_sample(sample)
            .await
            .map_err(|err| MediaError::Write(err.to_string()))
    }
}

impl std::fmt::Debug for LocalTrack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalTrack")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("enabled", &self.is_enabled())
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

/// The tracks acquired for a session. Clones share the same tracks.
#[derive(Debug, Clone)]
pub struct LocalStream {
    id: String,
    tracks: Vec<Arc<LocalTrack>>,
}

impl LocalStream {
    pub fn new(id: impl Into<String>, tracks: Vec<Arc<LocalTrack>>) -> Self {
        Self {
            id: id.into(),
            tracks,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn tracks(&self) -> &[Arc<LocalTrack>] {
        &self.tracks
    }

    pub fn track(&self, kind: MediaKind) -> Option<&Arc<LocalTrack>> {
        self.tracks.iter().find(|track| track.kind() == kind)
    }

    pub fn has_video(&self) -> bool {
        self.track(MediaKind::Video).is_some()
    }

    /// Enables or disables all tracks of a kind. Returns whether any track was affected.
    pub fn set_enabled(&self, kind: MediaKind, enabled: bool) -> bool {
        let mut affected = false;
        for track in self.tracks.iter().filter(|track| track.kind() == kind) {
            track.set_enabled(enabled);
            affected = true;
        }
        affected
    }

    pub fn stop(&self) {
        for track in &self.tracks {
            track.stop();
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.tracks.iter().all(|track| track.is_stopped())
    }
}

/// A track received from a remote participant.
#[derive(Clone)]
pub struct RemoteTrack {
    pub id: String,
    pub kind: MediaKind,
    rtp: Option<Arc<TrackRemote>>,
}

impl RemoteTrack {
    pub fn new(id: impl Into<String>, kind: MediaKind) -> Self {
        Self {
            id: id.into(),
            kind,
            rtp: None,
        }
    }

    pub fn from_rtp(track: Arc<TrackRemote>) -> Self {
        Self {
            id: track.id(),
            kind: MediaKind::from(track.kind()),
            rtp: Some(track),
        }
    }

    /// The underlying RTP track, for reading received packets.
    pub fn rtp(&self) -> Option<&Arc<TrackRemote>> {
        self.rtp.as_ref()
    }
}

impl std::fmt::Debug for RemoteTrack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteTrack")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .finish_non_exhaustive()
    }
}

/// All tracks received over one peer link.
#[derive(Debug, Clone, Default)]
pub struct RemoteStream {
    tracks: Vec<RemoteTrack>,
}

impl RemoteStream {
    pub fn add_track(&mut self, track: RemoteTrack) {
        self.tracks.retain(|t| t.id != track.id);
        self.tracks.push(track);
    }

    pub fn tracks(&self) -> &[RemoteTrack] {
        &self.tracks
    }

    pub fn has_kind(&self, kind: MediaKind) -> bool {
        self.tracks.iter().any(|t| t.kind == kind)
    }

    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }
}

/// [`MediaDevices`] handing out sample-fed tracks.
///
/// Capture itself is left to the application, which encodes frames and writes them through
/// [`LocalTrack::write_sample`]. Permissions are configured up front, mirroring what an OS prompt
/// would answer.
#[derive(Debug, Clone)]
pub struct SampleTrackDevices {
    stream_id: String,
    audio_allowed: bool,
    video_allowed: bool,
    camera_present: bool,
}

impl SampleTrackDevices {
    pub fn new(stream_id: impl Into<String>) -> Self {
        Self {
            stream_id: stream_id.into(),
            audio_allowed: true,
            video_allowed: true,
            camera_present: true,
        }
    }

    pub fn deny(mut self, kind: MediaKind) -> Self {
        match kind {
            MediaKind::Audio => self.audio_allowed = false,
            MediaKind::Video => self.video_allowed = false,
        }
        self
    }

    pub fn without_camera(mut self) -> Self {
        self.camera_present = false;
        self
    }
}

#[async_trait]
impl MediaDevices for SampleTrackDevices {
    #[tracing::instrument(level = "debug", skip(self), err)]
    async fn acquire(&self, constraints: MediaConstraints) -> Result<LocalStream, MediaError> {
        let mut tracks = Vec::with_capacity(2);

        if constraints.audio {
            if !self.audio_allowed {
                return Err(MediaError::PermissionDenied(MediaKind::Audio));
            }
            tracks.push(Arc::new(LocalTrack::new(MediaKind::Audio, &self.stream_id)));
        }

        if constraints.video {
            if !self.camera_present {
                return Err(MediaError::Unavailable("no camera found".to_string()));
            }
            if !self.video_allowed {
                return Err(MediaError::PermissionDenied(MediaKind::Video));
            }
            tracks.push(Arc::new(LocalTrack::new(MediaKind::Video, &self.stream_id)));
        }

        tracing::debug!(num_tracks = tracks.len(), "Acquired local media");
        Ok(LocalStream::new(self.stream_id.clone(), tracks))
    }
}
