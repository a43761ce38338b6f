//! Election Records
//!
//! Per-base bookkeeping for the leader election state machine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::coordination::SessionId;

/// Leadership epoch for a base. Strictly increases on every successful
/// leadership reassignment; never decreases, including across resets.
pub type Generation = u64;

/// Identifier of a logical shard ("base") of the replicated database.
///
/// Opaque key (e.g. hash of account/container/type); immutable once created.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BaseId(String);

impl BaseId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for BaseId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for BaseId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Identity of a storage peer eligible to hold replicas
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(String);

impl PeerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for PeerId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Internal election state machine states
///
/// `None -> Requesting -> Watching -> {Leader | Follower} ->
/// (Expired | Resigned) -> None`; `Failed` is reachable from any state on
/// unrecoverable coordination error and exits only via administrative reset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ElectionState {
    /// No election in progress for this base
    None,
    /// Candidate node creation in flight
    Requesting,
    /// Candidate created, rank not yet resolved
    Watching,
    /// This peer holds leadership
    Leader,
    /// Another peer holds leadership; we watch our predecessor
    Follower,
    /// Session expiry invalidated the record; transient, drains to None
    Expired,
    /// Local resignation in progress; transient, drains to None
    Resigned,
    /// Unrecoverable coordination error; requires administrative reset
    Failed,
}

impl std::fmt::Display for ElectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ElectionState::None => write!(f, "NONE"),
            ElectionState::Requesting => write!(f, "REQUESTING"),
            ElectionState::Watching => write!(f, "WATCHING"),
            ElectionState::Leader => write!(f, "LEADER"),
            ElectionState::Follower => write!(f, "FOLLOWER"),
            ElectionState::Expired => write!(f, "EXPIRED"),
            ElectionState::Resigned => write!(f, "RESIGNED"),
            ElectionState::Failed => write!(f, "FAILED"),
        }
    }
}

/// Public, non-blocking view of a base's election state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ElectionStatus {
    None,
    Pending,
    Leader,
    Follower,
    Failed,
}

impl std::fmt::Display for ElectionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ElectionStatus::None => write!(f, "NONE"),
            ElectionStatus::Pending => write!(f, "PENDING"),
            ElectionStatus::Leader => write!(f, "LEADER"),
            ElectionStatus::Follower => write!(f, "FOLLOWER"),
            ElectionStatus::Failed => write!(f, "FAILED"),
        }
    }
}

impl From<ElectionState> for ElectionStatus {
    fn from(state: ElectionState) -> Self {
        match state {
            ElectionState::None
            | ElectionState::Expired
            | ElectionState::Resigned => ElectionStatus::None,
            ElectionState::Requesting | ElectionState::Watching => ElectionStatus::Pending,
            ElectionState::Leader => ElectionStatus::Leader,
            ElectionState::Follower => ElectionStatus::Follower,
            ElectionState::Failed => ElectionStatus::Failed,
        }
    }
}

/// Per-base election record
///
/// Exclusively owned and mutated by the ElectionManager under the base's
/// mutex; snapshots are handed out by value.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ElectionRecord {
    /// Base this record belongs to
    pub base: BaseId,
    /// Current state machine state
    pub state: ElectionState,
    /// Peer currently believed to hold leadership (if resolved)
    pub leader: Option<PeerId>,
    /// Leadership epoch last observed for this base
    pub generation: Generation,
    /// Our candidate sequence number, while a candidate node is held
    pub candidate_sequence: Option<u64>,
    /// Path of our candidate node, while held
    pub candidate_path: Option<String>,
    /// Session our candidacy was created under
    pub session: Option<SessionId>,
    /// Lease expiry for the current leadership claim
    pub lease_expiry: Option<DateTime<Utc>>,
    /// Peers observed in the last candidate-set read
    pub peers: Vec<PeerId>,
}

impl ElectionRecord {
    /// Create a fresh record for a base never elected before
    pub fn new(base: BaseId) -> Self {
        Self {
            base,
            state: ElectionState::None,
            leader: None,
            generation: 0,
            candidate_sequence: None,
            candidate_path: None,
            session: None,
            lease_expiry: None,
            peers: Vec::new(),
        }
    }

    /// Public status derived from the internal state
    pub fn status(&self) -> ElectionStatus {
        self.state.into()
    }

    /// Whether this record currently holds a candidate node server-side
    pub fn holds_candidate(&self) -> bool {
        self.candidate_path.is_some()
    }

    /// Clear candidacy bookkeeping (node deleted or session gone)
    pub fn clear_candidacy(&mut self) {
        self.candidate_sequence = None;
        self.candidate_path = None;
        self.session = None;
        self.lease_expiry = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_projection() {
        assert_eq!(ElectionStatus::from(ElectionState::None), ElectionStatus::None);
        assert_eq!(ElectionStatus::from(ElectionState::Requesting), ElectionStatus::Pending);
        assert_eq!(ElectionStatus::from(ElectionState::Watching), ElectionStatus::Pending);
        assert_eq!(ElectionStatus::from(ElectionState::Leader), ElectionStatus::Leader);
        assert_eq!(ElectionStatus::from(ElectionState::Expired), ElectionStatus::None);
        assert_eq!(ElectionStatus::from(ElectionState::Failed), ElectionStatus::Failed);
    }

    #[test]
    fn test_fresh_record() {
        let record = ElectionRecord::new(BaseId::from("base-1"));
        assert_eq!(record.state, ElectionState::None);
        assert_eq!(record.generation, 0);
        assert!(!record.holds_candidate());
    }
}
