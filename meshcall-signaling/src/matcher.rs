use crate::error::SignalingError;
use meshcall_protocol::relay::RelayFrame;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::instrument;

type Predicate = Box<dyn Fn(&RelayFrame) -> bool + Send + Sync + 'static>;

/// A registered request for a frame matching a predicate.
struct MatcherEntry {
    id: u64,
    predicate: Predicate,
    responder: oneshot::Sender<RelayFrame>,
}

#[derive(Default)]
struct MatcherState {
    next_id: u64,
    entries: VecDeque<MatcherEntry>,
}

/// ResponseMatcher holds a queue of waiters that want to match an incoming relay frame.
///
/// Waiters are registered with [`ResponseMatcher::expect`] *before* the request is sent, so a reply
/// arriving faster than the caller starts awaiting it is never lost.
#[derive(Clone, Default)]
pub struct ResponseMatcher {
    inner: Arc<Mutex<MatcherState>>,
}

/// A registered, not yet resolved expectation. Dropping it unregisters the waiter.
pub struct PendingMatch {
    id: u64,
    rx: oneshot::Receiver<RelayFrame>,
    matcher: ResponseMatcher,
}

impl ResponseMatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a waiter for the first frame matching `predicate`.
    pub fn expect<F>(&self, predicate: F) -> PendingMatch
    where
        F: Fn(&RelayFrame) -> bool + Send + Sync + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let mut state = self.inner.lock();
        let id = state.next_id;
        state.next_id = state.next_id.wrapping_add(1);
        state.entries.push_back(MatcherEntry {
            id,
            predicate: Box::new(predicate),
            responder: tx,
        });

        PendingMatch {
            id,
            rx,
            matcher: self.clone(),
        }
    }

    /// Called by the reader task for every incoming frame. Entries are evaluated in order of
    /// registration and only the first matching one receives the frame.
    ///
    /// Returns whether a waiter consumed the frame.
    #[instrument(level = "trace", skip_all)]
    pub fn try_match(&self, frame: &RelayFrame) -> bool {
        let entry = {
            let mut state = self.inner.lock();
            state
                .entries
                .iter()
                .position(|entry| (entry.predicate)(frame))
                .and_then(|pos| state.entries.remove(pos))
        };

        match entry {
            Some(entry) => entry.responder.send(frame.clone()).is_ok(),
            None => false,
        }
    }

    /// Drops all waiters. They resolve with [`SignalingError::Disconnected`].
    pub fn clear(&self) {
        self.inner.lock().entries.clear();
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn remove(&self, id: u64) {
        self.inner.lock().entries.retain(|entry| entry.id != id);
    }
}

impl PendingMatch {
    /// Waits for the matching frame.
    ///
    /// # Returns
    ///
    /// - `Ok(RelayFrame)` if a matching frame was received within the timeout.
    /// - `Err(SignalingError::Timeout)` if the timeout elapsed first.
    /// - `Err(SignalingError::Disconnected)` if the matcher was cleared in the meantime.
    #[instrument(level = "debug", skip(self), err)]
    pub async fn wait(mut self, timeout: Duration) -> Result<RelayFrame, SignalingError> {
        match tokio::time::timeout(timeout, &mut self.rx).await {
            Ok(Ok(frame)) => Ok(frame),
            Ok(Err(_)) => Err(SignalingError::Disconnected),
            Err(_) => Err(SignalingError::Timeout(
                "no matching relay frame received".to_string(),
            )),
        }
    }
}

impl Drop for PendingMatch {
    fn drop(&mut self) {
        self.matcher.remove(self.id);
    }
}
