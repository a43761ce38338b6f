//! Coordination Service Client
//!
//! Session-oriented access to the external strongly-consistent coordination
//! service: ephemeral-sequential candidate nodes, node watches and session
//! lifecycle events. The [`Coordinator`] trait is the fault-injection seam;
//! [`MemoryEnsemble`] is the deterministic implementation the harness and
//! the tests run against.

mod client;
mod memory;

pub use client::{
    candidate_path, election_path, CandidateNode, CandidatePayload, Coordinator, NodeEvent,
    RateLimitedCoordinator, SessionEvent, SessionId, ELECTION_ROOT,
};
pub use memory::{MemoryCoordinator, MemoryEnsemble};
