pub mod mock;
pub mod tokio;

use crate::error::SignalingError;
use ::tokio::sync::mpsc;
use async_trait::async_trait;
use meshcall_protocol::relay::RelayFrame;
use tokio_tungstenite::tungstenite;

/// Opens websocket connections to the relay.
#[async_trait]
pub trait RelayTransport: Send + Sync {
    type Sender: RelaySender;
    type Receiver: RelayReceiver;

    async fn connect(&self) -> Result<(Self::Sender, Self::Receiver), SignalingError>;
}

#[async_trait]
pub trait RelaySender: Send + Sync + 'static {
    async fn send(&mut self, msg: tungstenite::Message) -> Result<(), SignalingError>;
    async fn close(&mut self) -> Result<(), SignalingError>;
}

#[async_trait]
pub trait RelayReceiver: Send + Sync + 'static {
    /// Waits for the next relay frame. Pings are answered through `send_tx` and other control frames
    /// are skipped.
    async fn recv(
        &mut self,
        send_tx: &mpsc::Sender<tungstenite::Message>,
    ) -> Result<RelayFrame, SignalingError>;
}

/// Shared frame handling of all receivers: `Some` for a frame to hand out, `None` for a control frame
/// that was dealt with.
pub(crate) async fn handle_message(
    msg: tungstenite::Message,
    send_tx: &mpsc::Sender<tungstenite::Message>,
) -> Option<Result<RelayFrame, SignalingError>> {
    match msg {
        tungstenite::Message::Text(text) => Some(RelayFrame::deserialize(&text).map_err(|err| {
            tracing::warn!(?err, "Failed to deserialize relay frame");
            SignalingError::Serialization(err.to_string())
        })),
        tungstenite::Message::Close(reason) => {
            tracing::warn!(?reason, "Received Close WebSocket frame");
            Some(Err(SignalingError::Disconnected))
        }
        tungstenite::Message::Ping(data) => {
            if let Err(err) = send_tx.send(tungstenite::Message::Pong(data)).await {
                tracing::warn!(?err, "Failed to send Pong");
                return Some(Err(SignalingError::Disconnected));
            }
            None
        }
        other => {
            tracing::trace!(?other, "Skipping non-text WebSocket frame");
            None
        }
    }
}
