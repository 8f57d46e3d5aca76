use crate::ParticipantId;
use serde::{Deserialize, Serialize};

/// Events broadcast over a room topic.
///
/// The underlying pub/sub channel has no notion of addressing, so every event names its sender and
/// directed events ([`RoomEvent::Offer`], [`RoomEvent::Answer`], [`RoomEvent::Candidate`]) also name
/// their intended recipient. Receivers must drop directed events addressed to somebody else.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "type")]
pub enum RoomEvent {
    Join(Join),
    Leave(Leave),
    Offer(Offer),
    Answer(Answer),
    Candidate(Candidate),
    MediaStatus(MediaStatus),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Join {
    pub user_id: ParticipantId,
    pub display_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Leave {
    pub user_id: ParticipantId,
}

#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Offer {
    pub from: ParticipantId,
    pub to: ParticipantId,
    pub from_name: String,
    pub sdp: String,
}

#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Answer {
    pub from: ParticipantId,
    pub to: ParticipantId,
    pub from_name: String,
    pub sdp: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Candidate {
    pub from: ParticipantId,
    pub to: ParticipantId,
    pub candidate: IceCandidate,
}

/// A trickled ICE candidate in the same shape browsers use for `RTCIceCandidateInit`.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(
        default,
        rename = "sdpMLineIndex",
        skip_serializing_if = "Option::is_none"
    )]
    pub sdp_mline_index: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username_fragment: Option<String>,
}

/// Cosmetic mute/camera status. Media delivery never depends on it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaStatus {
    pub user_id: ParticipantId,
    pub muted: bool,
    pub camera_off: bool,
}

impl RoomEvent {
    pub fn serialize(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    pub fn deserialize(s: &str) -> serde_json::Result<Self> {
        serde_json::from_str(s)
    }

    /// The participant that published this event.
    pub fn sender(&self) -> &ParticipantId {
        match self {
            RoomEvent::Join(join) => &join.user_id,
            RoomEvent::Leave(leave) => &leave.user_id,
            RoomEvent::Offer(offer) => &offer.from,
            RoomEvent::Answer(answer) => &answer.from,
            RoomEvent::Candidate(candidate) => &candidate.from,
            RoomEvent::MediaStatus(status) => &status.user_id,
        }
    }

    /// The addressed participant, if this is a directed event.
    pub fn recipient(&self) -> Option<&ParticipantId> {
        match self {
            RoomEvent::Offer(offer) => Some(&offer.to),
            RoomEvent::Answer(answer) => Some(&answer.to),
            RoomEvent::Candidate(candidate) => Some(&candidate.to),
            RoomEvent::Join(_) | RoomEvent::Leave(_) | RoomEvent::MediaStatus(_) => None,
        }
    }

    /// Whether the local participant should process this event at all.
    ///
    /// Echoes of our own broadcasts and directed events for other participants are filtered. This is
    /// cheap filtering, not an access control boundary.
    pub fn is_relevant_to(&self, local_id: &ParticipantId) -> bool {
        if self.sender() == local_id {
            return false;
        }
        self.recipient().is_none_or(|to| to == local_id)
    }

    pub const fn variant(&self) -> &'static str {
        match self {
            RoomEvent::Join(_) => "Join",
            RoomEvent::Leave(_) => "Leave",
            RoomEvent::Offer(_) => "Offer",
            RoomEvent::Answer(_) => "Answer",
            RoomEvent::Candidate(_) => "Candidate",
            RoomEvent::MediaStatus(_) => "MediaStatus",
        }
    }
}

impl std::fmt::Debug for Offer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Offer")
            .field("from", &self.from)
            .field("to", &self.to)
            .field("from_name", &self.from_name)
            .field("sdp_len", &self.sdp.len())
            .finish()
    }
}

impl std::fmt::Debug for Answer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Answer")
            .field("from", &self.from)
            .field("to", &self.to)
            .field("from_name", &self.from_name)
            .field("sdp_len", &self.sdp.len())
            .finish()
    }
}

impl From<Join> for RoomEvent {
    fn from(value: Join) -> Self {
        Self::Join(value)
    }
}

impl From<Leave> for RoomEvent {
    fn from(value: Leave) -> Self {
        Self::Leave(value)
    }
}

impl From<Offer> for RoomEvent {
    fn from(value: Offer) -> Self {
        Self::Offer(value)
    }
}

impl From<Answer> for RoomEvent {
    fn from(value: Answer) -> Self {
        Self::Answer(value)
    }
}

impl From<Candidate> for RoomEvent {
    fn from(value: Candidate) -> Self {
        Self::Candidate(value)
    }
}

impl From<MediaStatus> for RoomEvent {
    fn from(value: MediaStatus) -> Self {
        Self::MediaStatus(value)
    }
}
