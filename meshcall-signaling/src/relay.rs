//! Client for a websocket pub/sub relay.

use crate::SUBSCRIPTION_CHANNEL_SIZE;
use crate::channel::{SignalingChannel, Subscription, SubscriptionHandle};
use crate::config::{RelayConfig, SEND_CHANNEL_SIZE};
use crate::error::SignalingError;
use crate::matcher::ResponseMatcher;
use crate::transport::{RelayReceiver, RelaySender, RelayTransport};
use async_trait::async_trait;
use meshcall_protocol::relay::{RelayFrame, SubscriptionId};
use meshcall_protocol::{RoomEvent, RoomTopic};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinSet;
use tokio_tungstenite::tungstenite;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, instrument};

type Subscriptions = Arc<Mutex<HashMap<SubscriptionId, mpsc::Sender<RoomEvent>>>>;

/// [`SignalingChannel`] backed by a websocket relay.
///
/// The connection is opened lazily by the first `subscribe` and re-opened by the next `subscribe`
/// after it dropped. Losing the connection ends every active subscription, which consumers observe
/// as their event receiver closing.
#[derive(Clone)]
pub struct RelayChannel<T: RelayTransport> {
    inner: Arc<RelayChannelInner<T>>,
}

struct RelayChannelInner<T: RelayTransport> {
    transport: T,
    config: RelayConfig,
    matcher: ResponseMatcher,
    subscriptions: Subscriptions,
    connection: tokio::sync::Mutex<Option<Connection>>,
    shutdown_token: CancellationToken,
}

struct Connection {
    send_tx: mpsc::Sender<tungstenite::Message>,
    disconnect_token: CancellationToken,
    worker_tasks: JoinSet<()>,
}

impl<T: RelayTransport + 'static> RelayChannel<T> {
    pub fn new(transport: T, config: RelayConfig, shutdown_token: CancellationToken) -> Self {
        Self {
            inner: Arc::new(RelayChannelInner {
                transport,
                config,
                matcher: ResponseMatcher::new(),
                subscriptions: Arc::new(Mutex::new(HashMap::new())),
                connection: tokio::sync::Mutex::new(None),
                shutdown_token,
            }),
        }
    }

    pub async fn is_connected(&self) -> bool {
        self.inner
            .connection
            .lock()
            .await
            .as_ref()
            .is_some_and(|conn| !conn.disconnect_token.is_cancelled())
    }

    pub fn subscription_count(&self) -> usize {
        self.inner.subscriptions.lock().len()
    }

    /// Closes the websocket connection, ending all subscriptions.
    #[instrument(level = "debug", skip(self))]
    pub async fn close(&self) {
        let conn = self.inner.connection.lock().await.take();
        if let Some(conn) = conn {
            self.inner.cleanup(conn).await;
        }
    }
}

impl<T: RelayTransport + 'static> RelayChannelInner<T> {
    /// Returns the send queue of the live connection, connecting first if necessary.
    #[instrument(level = "debug", skip(self), err)]
    async fn ensure_connected(&self) -> Result<mpsc::Sender<tungstenite::Message>, SignalingError> {
        if self.shutdown_token.is_cancelled() {
            return Err(SignalingError::Unavailable("relay channel shut down".to_string()));
        }

        let mut connection = self.connection.lock().await;
        if let Some(conn) = connection.as_ref()
            && !conn.disconnect_token.is_cancelled()
        {
            return Ok(conn.send_tx.clone());
        }

        if let Some(stale) = connection.take() {
            tracing::debug!("Previous relay connection dropped, cleaning up before reconnecting");
            self.cleanup(stale).await;
        }

        tracing::trace!("Connecting to relay");
        let (sender, receiver) = self.transport.connect().await?;

        let (send_tx, send_rx) = mpsc::channel::<tungstenite::Message>(SEND_CHANNEL_SIZE);
        let disconnect_token = self.shutdown_token.child_token();

        let mut worker_tasks = JoinSet::new();
        worker_tasks.spawn(reader_task(
            receiver,
            send_tx.clone(),
            self.matcher.clone(),
            self.subscriptions.clone(),
            disconnect_token.clone(),
        ));
        worker_tasks.spawn(writer_task(sender, send_rx, disconnect_token.clone()));

        tracing::debug!("Relay connection established, worker tasks started");
        *connection = Some(Connection {
            send_tx: send_tx.clone(),
            disconnect_token,
            worker_tasks,
        });

        Ok(send_tx)
    }

    async fn send_frame(
        send_tx: &mpsc::Sender<tungstenite::Message>,
        frame: &RelayFrame,
    ) -> Result<(), SignalingError> {
        let serialized = frame.serialize().map_err(|err| {
            tracing::warn!(?err, "Failed to serialize relay frame");
            SignalingError::Serialization(err.to_string())
        })?;
        send_tx
            .send(tungstenite::Message::from(serialized))
            .await
            .map_err(|_| SignalingError::Disconnected)
    }

    #[instrument(level = "debug", skip_all)]
    async fn cleanup(&self, mut conn: Connection) {
        tracing::debug!("Cleaning up relay connection");
        conn.disconnect_token.cancel();

        while let Some(res) = conn.worker_tasks.join_next().await {
            if let Err(err) = res
                && !err.is_cancelled()
            {
                tracing::warn!(?err, "Failed to join worker task");
            }
        }

        self.matcher.clear();
        self.subscriptions.lock().clear();
        tracing::debug!("Finished cleaning up relay connection");
    }
}

impl<T: RelayTransport> Drop for RelayChannelInner<T> {
    fn drop(&mut self) {
        self.shutdown_token.cancel();
    }
}

#[async_trait]
impl<T: RelayTransport + 'static> SignalingChannel for RelayChannel<T> {
    #[instrument(level = "debug", skip(self), err)]
    async fn subscribe(&self, topic: &RoomTopic) -> Result<Subscription, SignalingError> {
        let send_tx = self.inner.ensure_connected().await?;

        let handle = SubscriptionHandle::new(topic.clone());
        let (events_tx, events_rx) = mpsc::channel(SUBSCRIPTION_CHANNEL_SIZE);
        self.inner.subscriptions.lock().insert(handle.id, events_tx);

        let subscription_id = handle.id;
        let pending = self.inner.matcher.expect(move |frame| {
            matches!(
                frame,
                RelayFrame::Subscribed { .. } | RelayFrame::Error { .. }
            ) && frame.subscription_id() == Some(&subscription_id)
        });

        let frame = RelayFrame::Subscribe {
            subscription_id: handle.id,
            topic: topic.clone(),
        };
        let result = match RelayChannelInner::<T>::send_frame(&send_tx, &frame).await {
            Ok(()) => pending.wait(self.inner.config.subscribe_timeout()).await,
            Err(err) => Err(err),
        };

        match result {
            Ok(RelayFrame::Subscribed { .. }) => {
                tracing::debug!(%subscription_id, "Subscription confirmed by relay");
                Ok(Subscription {
                    handle,
                    events: events_rx,
                })
            }
            Ok(RelayFrame::Error { reason, .. }) => {
                tracing::warn!(?reason, "Relay rejected subscription");
                self.inner.subscriptions.lock().remove(&handle.id);
                Err(SignalingError::Rejected(reason))
            }
            Ok(other) => {
                tracing::warn!(?other, "Unexpected relay frame while subscribing");
                self.inner.subscriptions.lock().remove(&handle.id);
                Err(SignalingError::Rejected(
                    "unexpected response to subscribe".to_string(),
                ))
            }
            Err(err) => {
                tracing::warn!(?err, "Failed to subscribe");
                self.inner.subscriptions.lock().remove(&handle.id);
                if matches!(err, SignalingError::Timeout(_)) {
                    let _ = RelayChannelInner::<T>::send_frame(
                        &send_tx,
                        &RelayFrame::Unsubscribe { subscription_id },
                    )
                    .await;
                }
                Err(err)
            }
        }
    }

    #[instrument(level = "trace", skip(self, event), fields(topic = %handle.topic, variant = event.variant()), err)]
    async fn publish(
        &self,
        handle: &SubscriptionHandle,
        event: RoomEvent,
    ) -> Result<(), SignalingError> {
        if !self.inner.subscriptions.lock().contains_key(&handle.id) {
            return Err(SignalingError::NotSubscribed(handle.topic.to_string()));
        }

        let send_tx = self
            .inner
            .connection
            .lock()
            .await
            .as_ref()
            .filter(|conn| !conn.disconnect_token.is_cancelled())
            .map(|conn| conn.send_tx.clone())
            .ok_or(SignalingError::Disconnected)?;

        RelayChannelInner::<T>::send_frame(
            &send_tx,
            &RelayFrame::Publish {
                subscription_id: handle.id,
                event,
            },
        )
        .await
    }

    #[instrument(level = "debug", skip(self))]
    async fn unsubscribe(&self, handle: &SubscriptionHandle) {
        if self.inner.subscriptions.lock().remove(&handle.id).is_none() {
            tracing::trace!("Subscription already closed");
            return;
        }

        let send_tx = self
            .inner
            .connection
            .lock()
            .await
            .as_ref()
            .map(|conn| conn.send_tx.clone());
        if let Some(send_tx) = send_tx {
            let frame = RelayFrame::Unsubscribe {
                subscription_id: handle.id,
            };
            if let Err(err) = RelayChannelInner::<T>::send_frame(&send_tx, &frame).await {
                tracing::debug!(?err, "Failed to send unsubscribe, connection already gone");
            }
        }
    }
}

#[instrument(level = "debug", skip_all)]
fn reader_task<R: RelayReceiver>(
    mut receiver: R,
    send_tx: mpsc::Sender<tungstenite::Message>,
    matcher: ResponseMatcher,
    subscriptions: Subscriptions,
    disconnect_token: CancellationToken,
) -> impl Future<Output = ()> + Send {
    async move {
        tracing::debug!("Starting relay reader task");
        let _guard = TaskDropLogger::new("reader");

        loop {
            tokio::select! {
                biased;

                _ = disconnect_token.cancelled() => {
                    tracing::debug!("Disconnect signal received, exiting relay reader task");
                    break;
                }

                frame = receiver.recv(&send_tx) => {
                    match frame {
                        Ok(RelayFrame::Event { subscription_id, event }) => {
                            route_event(&subscriptions, subscription_id, event);
                        }
                        Ok(frame) => {
                            if !matcher.try_match(&frame) {
                                tracing::debug!(?frame, "Received unsolicited relay frame");
                            }
                        }
                        Err(SignalingError::Serialization(err)) => {
                            tracing::warn!(?err, "Skipping malformed relay frame");
                        }
                        Err(err) => {
                            tracing::warn!(?err, "Relay connection lost");
                            disconnect_token.cancel();
                            break;
                        }
                    }
                }
            }
        }

        // Subscriptions never outlive the connection they were confirmed on.
        subscriptions.lock().clear();
        matcher.clear();
    }
    .instrument(tracing::Span::current())
}

fn route_event(subscriptions: &Subscriptions, subscription_id: SubscriptionId, event: RoomEvent) {
    let mut subscriptions = subscriptions.lock();
    let Some(tx) = subscriptions.get(&subscription_id) else {
        tracing::trace!(%subscription_id, "Dropping event for unknown subscription");
        return;
    };

    match tx.try_send(event) {
        Ok(()) => {}
        Err(TrySendError::Full(event)) => {
            tracing::warn!(%subscription_id, variant = event.variant(), "Subscriber lagging, dropping event");
        }
        Err(TrySendError::Closed(_)) => {
            tracing::debug!(%subscription_id, "Subscriber gone, removing");
            subscriptions.remove(&subscription_id);
        }
    }
}

#[instrument(level = "debug", skip_all)]
fn writer_task<S: RelaySender>(
    mut sender: S,
    mut send_rx: mpsc::Receiver<tungstenite::Message>,
    disconnect_token: CancellationToken,
) -> impl Future<Output = ()> + Send {
    async move {
        tracing::debug!("Starting relay writer task");
        let _guard = TaskDropLogger::new("writer");

        loop {
            tokio::select! {
                biased;

                _ = disconnect_token.cancelled() => {
                    tracing::debug!("Disconnect signal received, closing sender");
                    if let Err(err) = sender.close().await {
                        tracing::warn!(?err, "Failed to close transport");
                    }
                    break;
                }

                msg = send_rx.recv() => {
                    match msg {
                        Some(msg) => {
                            if let Err(err) = sender.send(msg).await {
                                tracing::warn!(?err, "Failed to write to relay, disconnecting");
                                disconnect_token.cancel();
                                break;
                            }
                        }
                        None => {
                            tracing::debug!("Send channel closed, exiting relay writer task");
                            break;
                        }
                    }
                }
            }
        }
    }
    .instrument(tracing::Span::current())
}

struct TaskDropLogger {
    name: &'static str,
}

impl TaskDropLogger {
    fn new(name: &'static str) -> Self {
        Self { name }
    }
}

impl Drop for TaskDropLogger {
    fn drop(&mut self) {
        tracing::trace!(task_name = ?self.name, "Task dropped");
    }
}
