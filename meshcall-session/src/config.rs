use meshcall_webrtc::config::PEER_EVENTS_CAPACITY;
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Number of times the `join` announcement is repeated after the initial one.
    pub announce_repeats: u32,
    pub announce_interval_millis: u64,
    /// Upper bound for the best-effort `leave` broadcast. Local teardown never waits longer.
    pub leave_publish_timeout_millis: u64,
    pub peer_events_capacity: usize,
}

impl SessionConfig {
    pub fn announce_interval(&self) -> Duration {
        Duration::from_millis(self.announce_interval_millis)
    }

    pub fn leave_publish_timeout(&self) -> Duration {
        Duration::from_millis(self.leave_publish_timeout_millis)
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            announce_repeats: 3,
            announce_interval_millis: 3000,
            leave_publish_timeout_millis: 1000,
            peer_events_capacity: PEER_EVENTS_CAPACITY,
        }
    }
}
