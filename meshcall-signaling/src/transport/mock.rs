use crate::error::SignalingError;
use crate::transport::{RelayReceiver, RelaySender, RelayTransport, handle_message};
use async_trait::async_trait;
use meshcall_protocol::relay::RelayFrame;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite;

/// The relay side of a mock connection: frames sent by the client arrive on `outgoing_rx`, frames
/// pushed into `incoming_tx` are received by the client.
pub struct MockHandle {
    pub outgoing_rx: mpsc::Receiver<tungstenite::Message>,
    pub incoming_tx: mpsc::Sender<tungstenite::Message>,
}

impl MockHandle {
    /// Receives and decodes the next text frame sent by the client.
    pub async fn next_frame(&mut self) -> Option<RelayFrame> {
        while let Some(msg) = self.outgoing_rx.recv().await {
            if let tungstenite::Message::Text(text) = msg {
                return RelayFrame::deserialize(&text).ok();
            }
        }
        None
    }

    pub async fn send_frame(&self, frame: &RelayFrame) -> bool {
        let Ok(text) = frame.serialize() else {
            return false;
        };
        self.incoming_tx
            .send(tungstenite::Message::from(text))
            .await
            .is_ok()
    }
}

pub struct MockSender {
    tx: Option<mpsc::Sender<tungstenite::Message>>,
}

pub struct MockReceiver {
    rx: mpsc::Receiver<tungstenite::Message>,
}

#[tracing::instrument(level = "info")]
pub fn create() -> ((MockSender, MockReceiver), MockHandle) {
    let (outgoing_tx, outgoing_rx) = mpsc::channel(32);
    let (incoming_tx, incoming_rx) = mpsc::channel(32);

    let handle = MockHandle {
        outgoing_rx,
        incoming_tx,
    };

    (
        (
            MockSender {
                tx: Some(outgoing_tx),
            },
            MockReceiver { rx: incoming_rx },
        ),
        handle,
    )
}

/// A transport handing out one pre-created mock connection per `connect` call.
#[derive(Clone, Default)]
pub struct MockTransport {
    connections: Arc<Mutex<Vec<(MockSender, MockReceiver)>>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues a new connection for the next `connect` call and returns its relay side.
    pub fn push_connection(&self) -> MockHandle {
        let (conn, handle) = create();
        self.connections.lock().insert(0, conn);
        handle
    }
}

#[async_trait]
impl RelayTransport for MockTransport {
    type Sender = MockSender;
    type Receiver = MockReceiver;

    async fn connect(&self) -> Result<(Self::Sender, Self::Receiver), SignalingError> {
        self.connections
            .lock()
            .pop()
            .ok_or_else(|| SignalingError::Unavailable("no mock connection queued".to_string()))
    }
}

#[async_trait]
impl RelaySender for MockSender {
    #[tracing::instrument(level = "debug", skip(self))]
    async fn send(&mut self, msg: tungstenite::Message) -> Result<(), SignalingError> {
        tracing::trace!("Sending relay message");
        if let Some(ref tx) = self.tx {
            tx.send(msg).await.map_err(|err| {
                tracing::warn!(?err, "Failed to send relay message");
                SignalingError::Transport(err.to_string())
            })
        } else {
            Err(SignalingError::Transport("Sender closed".to_string()))
        }
    }

    #[tracing::instrument(level = "debug", skip(self))]
    async fn close(&mut self) -> Result<(), SignalingError> {
        tracing::debug!("Closing MockSender");
        self.tx = None;
        Ok(())
    }
}

#[async_trait]
impl RelayReceiver for MockReceiver {
    #[tracing::instrument(level = "debug", skip_all)]
    async fn recv(
        &mut self,
        send_tx: &mpsc::Sender<tungstenite::Message>,
    ) -> Result<RelayFrame, SignalingError> {
        while let Some(msg) = self.rx.recv().await {
            if let Some(result) = handle_message(msg, send_tx).await {
                return result;
            }
        }
        tracing::warn!("Channel closed");
        Err(SignalingError::Disconnected)
    }
}
