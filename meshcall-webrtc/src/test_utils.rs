mod loopback;

pub use loopback::{AppliedCandidate, LoopbackFactory, LoopbackNetwork, LoopbackPeer};
