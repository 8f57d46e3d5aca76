pub mod channel;
pub mod config;
pub mod error;
pub mod matcher;
pub mod memory;
pub mod relay;
pub mod transport;

pub use channel::{RoomChannel, SignalingChannel, Subscription, SubscriptionHandle};
pub use error::SignalingError;
pub use meshcall_protocol as protocol;

/// Capacity of the per-subscription event queue. Events arriving while the queue is full are dropped,
/// matching the at-most-once delivery the call engine is built for.
pub const SUBSCRIPTION_CHANNEL_SIZE: usize = 128;
