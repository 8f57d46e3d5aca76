//! [`PeerConnectionFactory`] backed by webrtc-rs.

use crate::config::WebrtcConfig;
use crate::connection::{
    LinkId, PeerConnection, PeerConnectionFactory, PeerConnectionState, PeerEvent, PeerEventKind,
    SdpType, SessionDescription, SignalingState,
};
use crate::error::PeerError;
use crate::media::{LocalStream, RemoteTrack};
use async_trait::async_trait;
use meshcall_protocol::ParticipantId;
use meshcall_protocol::event::IceCandidate;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::instrument;
use webrtc::api::APIBuilder;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::signaling_state::RTCSignalingState;

#[derive(Debug, Clone)]
pub struct RtcPeerFactory {
    ice_servers: Vec<RTCIceServer>,
}

impl RtcPeerFactory {
    pub fn new(config: &WebrtcConfig) -> Self {
        let ice_servers = config
            .ice_servers
            .iter()
            .map(|url| {
                if url.starts_with("turn:") || url.starts_with("turns:") {
                    RTCIceServer {
                        urls: vec![url.clone()],
                        username: config.turn_username.clone().unwrap_or_default(),
                        credential: config.turn_credential.clone().unwrap_or_default(),
                        ..Default::default()
                    }
                } else {
                    RTCIceServer {
                        urls: vec![url.clone()],
                        ..Default::default()
                    }
                }
            })
            .collect();

        Self { ice_servers }
    }

    async fn new_peer_connection(&self) -> Result<RTCPeerConnection, PeerError> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|err| PeerError::Media(format!("failed to register codecs: {err}")))?;

        let registry = register_default_interceptors(Registry::new(), &mut media_engine)
            .map_err(|err| PeerError::Media(format!("failed to register interceptors: {err}")))?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        api.new_peer_connection(RTCConfiguration {
            ice_servers: self.ice_servers.clone(),
            ..Default::default()
        })
        .await
        .map_err(|err| PeerError::Transport(err.to_string()))
    }
}

#[async_trait]
impl PeerConnectionFactory for RtcPeerFactory {
    #[instrument(level = "debug", skip(self, local_stream, events), err)]
    async fn create(
        &self,
        remote_id: &ParticipantId,
        link_id: LinkId,
        local_stream: &LocalStream,
        events: mpsc::Sender<PeerEvent>,
    ) -> Result<Arc<dyn PeerConnection>, PeerError> {
        let pc = Arc::new(self.new_peer_connection().await?);

        for track in local_stream.tracks() {
            let sender = pc
                .add_track(track.rtp())
                .await
                .map_err(|err| PeerError::Media(format!("failed to add track: {err}")))?;

            // RTCP has to be read for interceptors like NACK to work.
            tokio::spawn(async move {
                let mut rtcp_buf = vec![0u8; 1500];
                while sender.read(&mut rtcp_buf).await.is_ok() {}
            });
        }

        let candidate_events = events.clone();
        let candidate_remote = remote_id.clone();
        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let events = candidate_events.clone();
            let remote_id = candidate_remote.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else {
                    tracing::trace!(%remote_id, "ICE gathering complete");
                    return;
                };
                match candidate.to_json() {
                    Ok(init) => {
                        let event = PeerEvent {
                            remote_id,
                            link_id,
                            kind: PeerEventKind::LocalCandidate(IceCandidate {
                                candidate: init.candidate,
                                sdp_mid: init.sdp_mid,
                                sdp_mline_index: init.sdp_mline_index,
                                username_fragment: init.username_fragment,
                            }),
                        };
                        if events.send(event).await.is_err() {
                            tracing::trace!("Peer event receiver dropped, discarding candidate");
                        }
                    }
                    Err(err) => {
                        tracing::warn!(?err, "Failed to serialize local ICE candidate");
                    }
                }
            })
        }));

        let state_events = events.clone();
        let state_remote = remote_id.clone();
        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            let events = state_events.clone();
            let remote_id = state_remote.clone();
            Box::pin(async move {
                let state = map_connection_state(state);
                tracing::debug!(%remote_id, ?state, "Peer connection state changed");
                let event = PeerEvent {
                    remote_id,
                    link_id,
                    kind: PeerEventKind::StateChanged(state),
                };
                if events.send(event).await.is_err() {
                    tracing::trace!("Peer event receiver dropped, discarding state change");
                }
            })
        }));

        let track_events = events;
        let track_remote = remote_id.clone();
        pc.on_track(Box::new(move |track, _receiver, _transceiver| {
            let events = track_events.clone();
            let remote_id = track_remote.clone();
            Box::pin(async move {
                let track = RemoteTrack::from_rtp(track);
                tracing::debug!(%remote_id, track_id = %track.id, kind = %track.kind, "Received remote track");
                let event = PeerEvent {
                    remote_id,
                    link_id,
                    kind: PeerEventKind::Track(track),
                };
                if events.send(event).await.is_err() {
                    tracing::trace!("Peer event receiver dropped, discarding track");
                }
            })
        }));

        tracing::debug!(num_tracks = local_stream.tracks().len(), "Created peer connection");
        Ok(Arc::new(RtcPeer { pc }))
    }
}

pub struct RtcPeer {
    pc: Arc<RTCPeerConnection>,
}

impl RtcPeer {
    async fn local_description(&self, sdp_type: SdpType) -> Result<SessionDescription, PeerError> {
        let local = self
            .pc
            .local_description()
            .await
            .ok_or_else(|| PeerError::Sdp("local description missing".to_string()))?;
        Ok(SessionDescription {
            sdp_type,
            sdp: local.sdp,
        })
    }
}

#[async_trait]
impl PeerConnection for RtcPeer {
    #[instrument(level = "debug", skip(self), err)]
    async fn create_offer(&self) -> Result<SessionDescription, PeerError> {
        let offer = self
            .pc
            .create_offer(None)
            .await
            .map_err(|err| PeerError::Sdp(format!("failed to create offer: {err}")))?;
        self.pc
            .set_local_description(offer)
            .await
            .map_err(|err| PeerError::Sdp(format!("failed to set local offer: {err}")))?;
        self.local_description(SdpType::Offer).await
    }

    #[instrument(level = "debug", skip(self), err)]
    async fn create_answer(&self) -> Result<SessionDescription, PeerError> {
        let answer = self
            .pc
            .create_answer(None)
            .await
            .map_err(|err| PeerError::Sdp(format!("failed to create answer: {err}")))?;
        self.pc
            .set_local_description(answer)
            .await
            .map_err(|err| PeerError::Sdp(format!("failed to set local answer: {err}")))?;
        self.local_description(SdpType::Answer).await
    }

    #[instrument(level = "debug", skip(self), err)]
    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), PeerError> {
        let remote = match desc.sdp_type {
            SdpType::Offer => RTCSessionDescription::offer(desc.sdp),
            SdpType::Answer => RTCSessionDescription::answer(desc.sdp),
        }
        .map_err(|err| PeerError::Sdp(format!("invalid remote description: {err}")))?;

        self.pc
            .set_remote_description(remote)
            .await
            .map_err(|err| PeerError::Sdp(format!("failed to set remote description: {err}")))
    }

    #[instrument(level = "trace", skip(self), err)]
    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), PeerError> {
        self.pc
            .add_ice_candidate(RTCIceCandidateInit {
                candidate: candidate.candidate,
                sdp_mid: candidate.sdp_mid,
                sdp_mline_index: candidate.sdp_mline_index,
                username_fragment: candidate.username_fragment,
            })
            .await
            .map_err(|err| PeerError::Ice(err.to_string()))
    }

    fn signaling_state(&self) -> SignalingState {
        match self.pc.signaling_state() {
            RTCSignalingState::HaveLocalOffer | RTCSignalingState::HaveRemotePranswer => {
                SignalingState::HaveLocalOffer
            }
            RTCSignalingState::HaveRemoteOffer | RTCSignalingState::HaveLocalPranswer => {
                SignalingState::HaveRemoteOffer
            }
            RTCSignalingState::Closed => SignalingState::Closed,
            RTCSignalingState::Stable | RTCSignalingState::Unspecified => SignalingState::Stable,
        }
    }

    #[instrument(level = "debug", skip(self), err)]
    async fn close(&self) -> Result<(), PeerError> {
        self.pc
            .close()
            .await
            .map_err(|err| PeerError::Transport(err.to_string()))
    }
}

fn map_connection_state(state: RTCPeerConnectionState) -> PeerConnectionState {
    match state {
        RTCPeerConnectionState::Unspecified | RTCPeerConnectionState::New => {
            PeerConnectionState::New
        }
        RTCPeerConnectionState::Connecting => PeerConnectionState::Connecting,
        RTCPeerConnectionState::Connected => PeerConnectionState::Connected,
        RTCPeerConnectionState::Disconnected => PeerConnectionState::Disconnected,
        RTCPeerConnectionState::Failed => PeerConnectionState::Failed,
        RTCPeerConnectionState::Closed => PeerConnectionState::Closed,
    }
}
