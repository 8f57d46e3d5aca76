use crate::error::SignalingError;
use crate::transport::{RelayReceiver, RelaySender, RelayTransport, handle_message};
use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use meshcall_protocol::relay::RelayFrame;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, Clone)]
pub struct TokioTransport {
    url: String,
}

impl TokioTransport {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

#[async_trait]
impl RelayTransport for TokioTransport {
    type Sender = TokioSender;
    type Receiver = TokioReceiver;

    #[tracing::instrument(level = "info", skip(self), fields(url = %self.url), err)]
    async fn connect(&self) -> Result<(Self::Sender, Self::Receiver), SignalingError> {
        tracing::debug!("Connecting to relay");
        let (ws, response) = tokio_tungstenite::connect_async(self.url.as_str())
            .await
            .map_err(|err| {
                tracing::warn!(?err, "Failed to connect to relay");
                SignalingError::Unavailable(err.to_string())
            })?;
        tracing::debug!(status = ?response.status(), "Connected to relay");

        let (sink, stream) = ws.split();
        Ok((TokioSender { sink }, TokioReceiver { stream }))
    }
}

pub struct TokioSender {
    sink: SplitSink<Ws, tungstenite::Message>,
}

pub struct TokioReceiver {
    stream: SplitStream<Ws>,
}

#[async_trait]
impl RelaySender for TokioSender {
    #[tracing::instrument(level = "trace", skip_all, err)]
    async fn send(&mut self, msg: tungstenite::Message) -> Result<(), SignalingError> {
        self.sink.send(msg).await.map_err(|err| {
            tracing::warn!(?err, "Failed to send websocket message");
            SignalingError::Transport(err.to_string())
        })
    }

    #[tracing::instrument(level = "debug", skip(self), err)]
    async fn close(&mut self) -> Result<(), SignalingError> {
        self.sink.close().await.map_err(|err| {
            tracing::warn!(?err, "Failed to close websocket");
            SignalingError::Transport(err.to_string())
        })
    }
}

#[async_trait]
impl RelayReceiver for TokioReceiver {
    #[tracing::instrument(level = "trace", skip_all, err)]
    async fn recv(
        &mut self,
        send_tx: &mpsc::Sender<tungstenite::Message>,
    ) -> Result<RelayFrame, SignalingError> {
        while let Some(msg) = self.stream.next().await {
            let msg = msg.map_err(|err| {
                tracing::warn!(?err, "Failed to read from websocket");
                SignalingError::Transport(err.to_string())
            })?;
            if let Some(result) = handle_message(msg, send_tx).await {
                return result;
            }
        }
        tracing::warn!("Websocket stream ended");
        Err(SignalingError::Disconnected)
    }
}
