use meshcall_protocol::ParticipantId;
use meshcall_protocol::event::IceCandidate;
use std::collections::{HashMap, VecDeque};

/// Remote ICE candidates that arrived before their connection could accept them.
///
/// Candidates are kept per remote participant in arrival order. The buffer never checks whether a
/// link exists: trickled candidates regularly overtake the offer they belong to.
#[derive(Debug, Default)]
pub struct IceCandidateBuffer {
    queues: HashMap<ParticipantId, VecDeque<IceCandidate>>,
}

impl IceCandidateBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enqueue(&mut self, remote_id: &ParticipantId, candidate: IceCandidate) {
        self.queues
            .entry(remote_id.clone())
            .or_default()
            .push_back(candidate);
    }

    /// Removes and returns all candidates buffered for `remote_id`, oldest first.
    pub fn drain(&mut self, remote_id: &ParticipantId) -> Vec<IceCandidate> {
        self.queues
            .remove(remote_id)
            .map(Vec::from)
            .unwrap_or_default()
    }

    pub fn discard(&mut self, remote_id: &ParticipantId) {
        self.queues.remove(remote_id);
    }

    pub fn len(&self, remote_id: &ParticipantId) -> usize {
        self.queues.get(remote_id).map_or(0, VecDeque::len)
    }

    pub fn is_empty(&self) -> bool {
        self.queues.is_empty()
    }

    pub fn clear(&mut self) {
        self.queues.clear();
    }
}
