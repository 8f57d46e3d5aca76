//! Frames exchanged with the pub/sub relay.
//!
//! The relay knows nothing about calls: it keeps one set of subscriptions per connection and fans
//! every `publish` out as an `event` to all other subscriptions of the same topic.

use crate::{RoomEvent, RoomTopic};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
#[repr(transparent)]
#[serde(transparent)]
pub struct SubscriptionId(Uuid);

impl SubscriptionId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    pub const fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl std::fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

impl From<Uuid> for SubscriptionId {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "type")]
pub enum RelayFrame {
    /// Client -> relay: start receiving events for a topic.
    #[serde(rename_all = "camelCase")]
    Subscribe {
        subscription_id: SubscriptionId,
        topic: RoomTopic,
    },
    /// Relay -> client: the subscription is active and events will be delivered.
    #[serde(rename_all = "camelCase")]
    Subscribed { subscription_id: SubscriptionId },
    /// Client -> relay: stop receiving events for a subscription.
    #[serde(rename_all = "camelCase")]
    Unsubscribe { subscription_id: SubscriptionId },
    /// Client -> relay: broadcast an event to all other subscribers of the subscription's topic.
    #[serde(rename_all = "camelCase")]
    Publish {
        subscription_id: SubscriptionId,
        event: RoomEvent,
    },
    /// Relay -> client: an event published by somebody else.
    #[serde(rename_all = "camelCase")]
    Event {
        subscription_id: SubscriptionId,
        event: RoomEvent,
    },
    /// Relay -> client: a request failed.
    #[serde(rename_all = "camelCase")]
    Error {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        subscription_id: Option<SubscriptionId>,
        reason: String,
    },
}

impl RelayFrame {
    pub fn serialize(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    pub fn deserialize(s: &str) -> serde_json::Result<Self> {
        serde_json::from_str(s)
    }

    pub fn subscription_id(&self) -> Option<&SubscriptionId> {
        match self {
            RelayFrame::Subscribe {
                subscription_id, ..
            }
            | RelayFrame::Subscribed { subscription_id }
            | RelayFrame::Unsubscribe { subscription_id }
            | RelayFrame::Publish {
                subscription_id, ..
            }
            | RelayFrame::Event {
                subscription_id, ..
            } => Some(subscription_id),
            RelayFrame::Error {
                subscription_id, ..
            } => subscription_id.as_ref(),
        }
    }
}
