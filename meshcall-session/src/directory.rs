//! Read-only lookup of participant profiles, used only to label participants.

use async_trait::async_trait;
use meshcall_protocol::ParticipantId;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Profile {
    pub display_name: String,
    pub avatar_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DirectoryError {
    #[error("no profile for {0}")]
    NotFound(ParticipantId),
    #[error("directory unavailable: {0}")]
    Unavailable(String),
}

#[async_trait]
pub trait ProfileDirectory: Send + Sync {
    async fn lookup_profile(&self, id: &ParticipantId) -> Result<Profile, DirectoryError>;
}

/// A directory without any profiles. Participants keep the name they announced.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoDirectory;

#[async_trait]
impl ProfileDirectory for NoDirectory {
    async fn lookup_profile(&self, id: &ParticipantId) -> Result<Profile, DirectoryError> {
        Err(DirectoryError::NotFound(id.clone()))
    }
}

#[derive(Debug, Default)]
pub struct StaticDirectory {
    state: Mutex<State>,
}

#[derive(Debug, Default)]
struct State {
    unavailable: bool,
    profiles: HashMap<ParticipantId, Profile>,
}

impl StaticDirectory {
    pub fn new(profiles: impl IntoIterator<Item = (ParticipantId, Profile)>) -> Self {
        Self {
            state: Mutex::new(State {
                unavailable: false,
                profiles: profiles.into_iter().collect(),
            }),
        }
    }

    pub fn insert(&self, id: ParticipantId, profile: Profile) {
        self.state.lock().profiles.insert(id, profile);
    }

    pub fn remove(&self, id: &ParticipantId) {
        self.state.lock().profiles.remove(id);
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.state.lock().unavailable = unavailable;
    }
}

#[async_trait]
impl ProfileDirectory for StaticDirectory {
    async fn lookup_profile(&self, id: &ParticipantId) -> Result<Profile, DirectoryError> {
        let state = self.state.lock();
        if state.unavailable {
            return Err(DirectoryError::Unavailable("directory offline".to_string()));
        }
        state
            .profiles
            .get(id)
            .cloned()
            .ok_or_else(|| DirectoryError::NotFound(id.clone()))
    }
}
