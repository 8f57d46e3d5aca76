use serde::{Deserialize, Serialize};
use std::time::Duration;

pub(crate) const SEND_CHANNEL_SIZE: usize = 100;

/// Connection settings for the websocket pub/sub relay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Websocket URL of the relay, e.g. `wss://relay.example.com/socket`.
    pub url: String,
    /// How long to wait for the relay to confirm a subscription before giving up.
    pub subscribe_timeout_millis: u64,
}

impl RelayConfig {
    pub fn subscribe_timeout(&self) -> Duration {
        Duration::from_millis(self.subscribe_timeout_millis)
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            url: "ws://127.0.0.1:4000/relay".to_string(),
            subscribe_timeout_millis: 5000,
        }
    }
}
