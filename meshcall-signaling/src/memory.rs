//! In-process pub/sub broker.
//!
//! Used to run several sessions inside one process (tests, demos) with the same delivery semantics
//! as the relay: broadcast to all other subscribers, at most once, dropped when a subscriber lags.

use crate::SUBSCRIPTION_CHANNEL_SIZE;
use crate::channel::{SignalingChannel, Subscription, SubscriptionHandle};
use crate::error::SignalingError;
use async_trait::async_trait;
use meshcall_protocol::relay::SubscriptionId;
use meshcall_protocol::{RoomEvent, RoomTopic};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

#[derive(Clone)]
pub struct MemoryBroker {
    inner: Arc<Mutex<BrokerState>>,
}

struct BrokerState {
    available: bool,
    record_history: bool,
    topics: HashMap<RoomTopic, HashMap<SubscriptionId, mpsc::Sender<RoomEvent>>>,
    history: Vec<(RoomTopic, RoomEvent)>,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        MemoryBroker::new()
    }
}

impl std::fmt::Debug for MemoryBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.lock();
        f.debug_struct("MemoryBroker")
            .field("available", &state.available)
            .field("topics", &state.topics.len())
            .finish()
    }
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(BrokerState {
                available: true,
                record_history: false,
                topics: HashMap::new(),
                history: Vec::new(),
            })),
        }
    }

    /// Creates a broker that keeps every published event for later inspection.
    pub fn with_history() -> Self {
        let broker = Self::new();
        broker.inner.lock().record_history = true;
        broker
    }

    /// Toggles whether new subscriptions succeed. Existing subscriptions keep working.
    pub fn set_available(&self, available: bool) {
        self.inner.lock().available = available;
    }

    pub fn subscriber_count(&self, topic: &RoomTopic) -> usize {
        self.inner
            .lock()
            .topics
            .get(topic)
            .map(|subscribers| subscribers.len())
            .unwrap_or(0)
    }

    /// All events published on a topic so far, in publish order. Empty unless created through
    /// [`MemoryBroker::with_history`].
    pub fn history(&self, topic: &RoomTopic) -> Vec<RoomEvent> {
        self.inner
            .lock()
            .history
            .iter()
            .filter(|(t, _)| t == topic)
            .map(|(_, event)| event.clone())
            .collect()
    }
}

#[async_trait]
impl SignalingChannel for MemoryBroker {
    #[tracing::instrument(level = "debug", skip(self), err)]
    async fn subscribe(&self, topic: &RoomTopic) -> Result<Subscription, SignalingError> {
        let mut state = self.inner.lock();
        if !state.available {
            tracing::warn!("Broker unavailable, rejecting subscription");
            return Err(SignalingError::Unavailable("broker offline".to_string()));
        }

        let handle = SubscriptionHandle::new(topic.clone());
        let (tx, rx) = mpsc::channel(SUBSCRIPTION_CHANNEL_SIZE);
        state
            .topics
            .entry(topic.clone())
            .or_default()
            .insert(handle.id, tx);

        tracing::debug!(subscription_id = %handle.id, "Subscription active");
        Ok(Subscription { handle, events: rx })
    }

    #[tracing::instrument(level = "trace", skip(self, event), fields(topic = %handle.topic, variant = event.variant()), err)]
    async fn publish(
        &self,
        handle: &SubscriptionHandle,
        event: RoomEvent,
    ) -> Result<(), SignalingError> {
        let mut state = self.inner.lock();
        let state = &mut *state;

        let Some(subscribers) = state.topics.get_mut(&handle.topic) else {
            return Err(SignalingError::NotSubscribed(handle.topic.to_string()));
        };
        if !subscribers.contains_key(&handle.id) {
            return Err(SignalingError::NotSubscribed(handle.topic.to_string()));
        }

        if state.record_history {
            state.history.push((handle.topic.clone(), event.clone()));
        }

        subscribers.retain(|id, tx| {
            if *id == handle.id {
                return true;
            }
            match tx.try_send(event.clone()) {
                Ok(()) => true,
                Err(TrySendError::Full(_)) => {
                    tracing::warn!(subscription_id = %id, "Subscriber lagging, dropping event");
                    true
                }
                Err(TrySendError::Closed(_)) => {
                    tracing::debug!(subscription_id = %id, "Subscriber gone, removing");
                    false
                }
            }
        });

        Ok(())
    }

    #[tracing::instrument(level = "debug", skip(self))]
    async fn unsubscribe(&self, handle: &SubscriptionHandle) {
        let mut state = self.inner.lock();
        if let Some(subscribers) = state.topics.get_mut(&handle.topic) {
            if subscribers.remove(&handle.id).is_some() {
                tracing::debug!(subscription_id = %handle.id, "Subscription removed");
            }
            if subscribers.is_empty() {
                state.topics.remove(&handle.topic);
            }
        }
    }
}
