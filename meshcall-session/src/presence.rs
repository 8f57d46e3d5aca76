//! Room membership as observed through `join`/`leave` broadcasts.

use crate::directory::Profile;
use meshcall_protocol::{Join, Leave, MediaStatus, ParticipantId};
use meshcall_signaling::RoomChannel;
use std::collections::BTreeMap;
use std::time::{Duration, SystemTime};
use tokio_util::sync::CancellationToken;
use tracing::instrument;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Participant {
    pub id: ParticipantId,
    pub display_name: String,
    pub avatar_url: Option<String>,
    pub joined_at: SystemTime,
}

/// A remote participant together with the media status it last broadcast.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Member {
    pub participant: Participant,
    pub muted: bool,
    pub camera_off: bool,
}

/// The local participant's view of who else is in the room.
///
/// Membership is purely observational: nothing here creates or closes peer links.
#[derive(Debug)]
pub struct RoomPresence {
    local_id: ParticipantId,
    display_name: String,
    members: BTreeMap<ParticipantId, Member>,
}

impl RoomPresence {
    pub fn new(local_id: ParticipantId, display_name: impl Into<String>) -> Self {
        Self {
            local_id,
            display_name: display_name.into(),
            members: BTreeMap::new(),
        }
    }

    pub fn local_id(&self) -> &ParticipantId {
        &self.local_id
    }

    pub fn local_join(&self) -> Join {
        Join {
            user_id: self.local_id.clone(),
            display_name: self.display_name.clone(),
        }
    }

    pub fn local_leave(&self) -> Leave {
        Leave {
            user_id: self.local_id.clone(),
        }
    }

    /// Records a remote participant. Returns `false` if it was already known or is the local
    /// participant itself.
    pub fn observe(&mut self, id: &ParticipantId, display_name: &str) -> bool {
        if *id == self.local_id || self.members.contains_key(id) {
            return false;
        }

        let display_name = if display_name.is_empty() {
            id.to_string()
        } else {
            display_name.to_string()
        };
        tracing::debug!(%id, %display_name, "Participant joined");
        self.members.insert(
            id.clone(),
            Member {
                participant: Participant {
                    id: id.clone(),
                    display_name,
                    avatar_url: None,
                    joined_at: SystemTime::now(),
                },
                muted: false,
                camera_off: false,
            },
        );
        true
    }

    pub fn remove(&mut self, id: &ParticipantId) -> Option<Member> {
        let member = self.members.remove(id);
        if member.is_some() {
            tracing::debug!(%id, "Participant left");
        }
        member
    }

    /// Labels a known participant with its directory profile. An empty directory name keeps the
    /// announced one.
    pub fn apply_profile(&mut self, id: &ParticipantId, profile: Profile) -> bool {
        let Some(member) = self.members.get_mut(id) else {
            return false;
        };
        if !profile.display_name.is_empty() {
            member.participant.display_name = profile.display_name;
        }
        member.participant.avatar_url = profile.avatar_url;
        true
    }

    pub fn apply_media_status(&mut self, status: &MediaStatus) -> bool {
        let Some(member) = self.members.get_mut(&status.user_id) else {
            return false;
        };
        member.muted = status.muted;
        member.camera_off = status.camera_off;
        true
    }

    pub fn get(&self, id: &ParticipantId) -> Option<&Member> {
        self.members.get(id)
    }

    /// Members sorted by id.
    pub fn members(&self) -> impl Iterator<Item = &Member> {
        self.members.values()
    }
}

/// Publishes `join` once right away, then `repeats` more times every `interval`.
///
/// Participants that subscribed shortly after us would otherwise never see our announcement.
#[instrument(level = "debug", skip_all, fields(topic = %room.topic(), user_id = %join.user_id))]
pub async fn announce(
    room: RoomChannel,
    join: Join,
    repeats: u32,
    interval: Duration,
    cancel: CancellationToken,
) {
    for round in 0..=repeats {
        if round > 0 {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    tracing::trace!(round, "Presence announcements cancelled");
                    return;
                }
                _ = tokio::time::sleep(interval) => {}
            }
        }

        tracing::trace!(round, "Announcing presence");
        if let Err(err) = room.publish(join.clone()).await {
            tracing::warn!(?err, round, "Failed to announce presence");
        }
    }

    tracing::debug!("Presence announcements finished");
}
