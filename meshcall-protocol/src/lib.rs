pub mod event;
pub mod participant;
#[cfg(feature = "relay")]
pub mod relay;
pub mod room;

pub use event::*;
pub use participant::ParticipantId;
pub use room::RoomTopic;

pub const MESHCALL_PROTOCOL_VERSION: &str = env!("CARGO_PKG_VERSION");
