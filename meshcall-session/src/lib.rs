pub mod config;
pub mod directory;
pub mod error;
pub mod presence;
pub mod session;

pub use config::SessionConfig;
pub use directory::{DirectoryError, NoDirectory, Profile, ProfileDirectory, StaticDirectory};
pub use error::CallError;
pub use presence::{Member, Participant, RoomPresence};
pub use session::{CallSession, ParticipantView, SessionDeps, SessionState};

pub use meshcall_protocol as protocol;
pub use meshcall_signaling as signaling;
pub use meshcall_webrtc as webrtc;
