use crate::error::SignalingError;
use async_trait::async_trait;
use meshcall_protocol::relay::SubscriptionId;
use meshcall_protocol::{RoomEvent, RoomTopic};
use std::sync::Arc;
use tokio::sync::mpsc;

/// A publish/subscribe channel addressed by room topic.
///
/// Delivery is broadcast-only and at most once: an event published on a topic eventually reaches
/// the subscribers that are active at that time, except the publishing subscription itself. There is
/// no ordering guarantee across events, so consumers must tolerate e.g. a candidate arriving before
/// the offer it belongs to.
#[async_trait]
pub trait SignalingChannel: Send + Sync {
    /// Subscribes to a topic.
    ///
    /// Only returns once the underlying transport confirmed the subscription as active. Events
    /// published by others after that point are delivered through [`Subscription::events`].
    async fn subscribe(&self, topic: &RoomTopic) -> Result<Subscription, SignalingError>;

    /// Broadcasts an event to all other subscribers of the handle's topic.
    ///
    /// Only enqueues the event for delivery and never waits for remote acknowledgement.
    async fn publish(
        &self,
        handle: &SubscriptionHandle,
        event: RoomEvent,
    ) -> Result<(), SignalingError>;

    /// Ends a subscription. Unsubscribing an unknown or already closed handle is a no-op.
    async fn unsubscribe(&self, handle: &SubscriptionHandle);
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle {
    pub id: SubscriptionId,
    pub topic: RoomTopic,
}

impl SubscriptionHandle {
    pub fn new(topic: RoomTopic) -> Self {
        Self {
            id: SubscriptionId::new(),
            topic,
        }
    }
}

#[derive(Debug)]
pub struct Subscription {
    pub handle: SubscriptionHandle,
    /// Events published by other subscribers. The receiver ends once the subscription is closed.
    pub events: mpsc::Receiver<RoomEvent>,
}

/// An active subscription bound to the channel it was created on.
///
/// Cheap to clone; presence announcements and peer negotiation publish through the same handle.
#[derive(Clone)]
pub struct RoomChannel {
    channel: Arc<dyn SignalingChannel>,
    handle: SubscriptionHandle,
}

impl RoomChannel {
    pub fn new(channel: Arc<dyn SignalingChannel>, handle: SubscriptionHandle) -> Self {
        Self { channel, handle }
    }

    pub fn handle(&self) -> &SubscriptionHandle {
        &self.handle
    }

    pub fn topic(&self) -> &RoomTopic {
        &self.handle.topic
    }

    #[tracing::instrument(level = "trace", skip_all, fields(topic = %self.handle.topic), err)]
    pub async fn publish(&self, event: impl Into<RoomEvent> + Send) -> Result<(), SignalingError> {
        let event = event.into();
        tracing::trace!(variant = event.variant(), "Publishing room event");
        self.channel.publish(&self.handle, event).await
    }

    pub async fn unsubscribe(&self) {
        self.channel.unsubscribe(&self.handle).await;
    }
}

impl std::fmt::Debug for RoomChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RoomChannel")
            .field("handle", &self.handle)
            .finish_non_exhaustive()
    }
}
