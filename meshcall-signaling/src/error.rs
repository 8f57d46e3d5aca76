#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SignalingError {
    #[error("signaling unavailable: {0}")]
    Unavailable(String),
    #[error("timeout: {0}")]
    Timeout(String),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("subscription rejected: {0}")]
    Rejected(String),
    #[error("not subscribed: {0}")]
    NotSubscribed(String),
    #[error("disconnected")]
    Disconnected,
}
