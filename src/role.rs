//! Replica Role Tracking
//!
//! Gates local read/write eligibility per base from the election manager's
//! published role, and carries the fencing generation used to reject stale
//! operations. Roles are derived, never set independently of an election
//! record observation, and a transition away from LEADER voids write
//! eligibility with no stale-authorization window: the manager publishes
//! inside the per-base critical section and reads here always see the
//! latest published value.
//!
//! Across peers, expiry demotion and successor election travel on
//! independent event paths; the commit-time fence re-checks the ensemble's
//! authoritative generation so a revoked epoch can never commit.

use std::collections::HashMap;

use tokio::sync::{watch, RwLock};

use crate::election::{BaseId, ElectionManager, ElectionStatus, Generation, RoleSnapshot};

/// Role of the local peer for one base
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplicaRole {
    Leader,
    Follower,
    None,
}

impl std::fmt::Display for ReplicaRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReplicaRole::Leader => write!(f, "LEADER"),
            ReplicaRole::Follower => write!(f, "FOLLOWER"),
            ReplicaRole::None => write!(f, "NONE"),
        }
    }
}

impl From<ElectionStatus> for ReplicaRole {
    fn from(status: ElectionStatus) -> Self {
        match status {
            ElectionStatus::Leader => ReplicaRole::Leader,
            ElectionStatus::Follower => ReplicaRole::Follower,
            _ => ReplicaRole::None,
        }
    }
}

/// Observer of election output; producer of the fencing token consumed by
/// the storage/synchronization layer
pub struct ReplicaRoleTracker {
    manager: ElectionManager,
    receivers: RwLock<HashMap<BaseId, watch::Receiver<RoleSnapshot>>>,
}

impl ReplicaRoleTracker {
    pub fn new(manager: ElectionManager) -> Self {
        Self {
            manager,
            receivers: RwLock::new(HashMap::new()),
        }
    }

    async fn snapshot(&self, base: &BaseId) -> RoleSnapshot {
        if let Some(rx) = self.receivers.read().await.get(base) {
            return rx.borrow().clone();
        }
        let rx = self.manager.subscribe(base).await;
        let snapshot = rx.borrow().clone();
        self.receivers.write().await.insert(base.clone(), rx);
        snapshot
    }

    /// Current role and the generation it was granted under
    pub async fn role(&self, base: &BaseId) -> (ReplicaRole, Generation) {
        let snapshot = self.snapshot(base).await;
        (snapshot.status.into(), snapshot.generation)
    }

    /// Write eligibility plus the fencing generation
    ///
    /// A write path must capture the generation at authorization time and
    /// present it back at commit time; see [`validate_fence`].
    ///
    /// [`validate_fence`]: ReplicaRoleTracker::validate_fence
    pub async fn can_write(&self, base: &BaseId) -> (bool, Generation) {
        let snapshot = self.snapshot(base).await;
        (snapshot.status == ElectionStatus::Leader, snapshot.generation)
    }

    /// Whether this peer may serve reads for the base (leader or follower)
    pub async fn can_read(&self, base: &BaseId) -> bool {
        matches!(
            self.snapshot(base).await.status,
            ElectionStatus::Leader | ElectionStatus::Follower
        )
    }

    /// Fencing check against the locally published generation: the
    /// presented generation must match the currently authorized one and
    /// the peer must still be leader
    pub async fn validate_fence(&self, base: &BaseId, generation: Generation) -> bool {
        let (eligible, current) = self.can_write(base).await;
        eligible && generation == current
    }

    /// Commit-time fencing check against the ensemble's authoritative
    /// generation
    ///
    /// Expiry demotion and successor election travel on independent event
    /// paths, so a stale leader that has not yet observed its own demotion
    /// still passes [`validate_fence`]. A successor claim advances the
    /// ensemble generation first, so the stale peer fails here and its
    /// write never commits.
    ///
    /// [`validate_fence`]: ReplicaRoleTracker::validate_fence
    pub async fn commit_fence(&self, base: &BaseId, generation: Generation) -> bool {
        if !self.validate_fence(base, generation).await {
            return false;
        }
        matches!(
            self.manager.ensemble_generation(base).await,
            Ok(published) if published == generation
        )
    }

    /// Wait until the base's role changes from the given snapshot; used by
    /// the synchronizer to react to transitions
    pub async fn changed(&self, base: &BaseId) -> RoleSnapshot {
        let mut rx = self.manager.subscribe(base).await;
        // First change after the currently-marked value
        let _ = rx.changed().await;
        let snapshot = rx.borrow().clone();
        snapshot
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordination::{Coordinator, MemoryEnsemble};
    use crate::election::{ElectionStatus, PeerId};
    use std::sync::Arc;
    use std::time::Duration;

    async fn setup() -> (MemoryEnsemble, ElectionManager, ReplicaRoleTracker) {
        let ensemble = MemoryEnsemble::new();
        let client = Arc::new(ensemble.client());
        client.connect().await.unwrap();
        let manager = ElectionManager::new(PeerId::from("peer-1"), client, 30_000);
        let tracker = ReplicaRoleTracker::new(manager.clone());
        (ensemble, manager, tracker)
    }

    #[tokio::test]
    async fn test_leader_can_write() {
        let (_ensemble, manager, tracker) = setup().await;
        let base = BaseId::from("base-1");

        let (eligible, generation) = tracker.can_write(&base).await;
        assert!(!eligible);
        assert_eq!(generation, 0);

        manager.request_leadership(&base).await.unwrap();
        let (eligible, generation) = tracker.can_write(&base).await;
        assert!(eligible);
        assert_eq!(generation, 1);
        assert!(tracker.validate_fence(&base, generation).await);
        assert!(tracker.commit_fence(&base, generation).await);
    }

    #[tokio::test]
    async fn test_resignation_voids_write_eligibility() {
        let (_ensemble, manager, tracker) = setup().await;
        let base = BaseId::from("base-1");

        manager.request_leadership(&base).await.unwrap();
        let (_, granted) = tracker.can_write(&base).await;

        manager.resign(&base).await.unwrap();
        let (eligible, _) = tracker.can_write(&base).await;
        assert!(!eligible);
        assert!(!tracker.validate_fence(&base, granted).await);
    }

    #[tokio::test]
    async fn test_stale_generation_is_fenced() {
        let (_ensemble, manager, tracker) = setup().await;
        let base = BaseId::from("base-1");

        manager.request_leadership(&base).await.unwrap();
        let (_, granted) = tracker.can_write(&base).await;

        // Reset fences the old epoch even if leadership is re-acquired
        manager.force_reset(&base).await.unwrap();
        manager.request_leadership(&base).await.unwrap();

        assert!(!tracker.validate_fence(&base, granted).await);
        let (eligible, current) = tracker.can_write(&base).await;
        assert!(eligible);
        assert!(current > granted);
        assert!(tracker.validate_fence(&base, current).await);
    }

    #[tokio::test]
    async fn test_stale_leader_fails_commit_fence() {
        let ensemble = MemoryEnsemble::new();
        let client_a = Arc::new(ensemble.client());
        let session_a = client_a.connect().await.unwrap();
        let a = ElectionManager::new(PeerId::from("peer-a"), client_a, 30_000);
        let tracker = ReplicaRoleTracker::new(a.clone());
        let base = BaseId::from("base-1");

        a.request_leadership(&base).await.unwrap();
        let (_, granted) = tracker.can_write(&base).await;

        // Freeze peer A's background processing so its demotion is never
        // observed locally, then expire its session and elect a successor
        a.shutdown();
        ensemble.expire_session(session_a).await;

        let client_b = Arc::new(ensemble.client());
        client_b.connect().await.unwrap();
        let b = ElectionManager::new(PeerId::from("peer-b"), client_b, 30_000);
        assert_eq!(
            b.request_leadership(&base).await.unwrap(),
            ElectionStatus::Leader
        );

        // A's local view is stale: it still believes it may write, and the
        // local fence alone cannot tell
        let (eligible, _) = tracker.can_write(&base).await;
        assert!(eligible);
        assert!(tracker.validate_fence(&base, granted).await);
        // The ensemble-checked fence rejects the revoked epoch
        assert!(!tracker.commit_fence(&base, granted).await);
    }

    #[tokio::test]
    async fn test_expiry_revokes_role() {
        let ensemble = MemoryEnsemble::new();
        let client = Arc::new(ensemble.client());
        let session = client.connect().await.unwrap();
        let manager = ElectionManager::new(PeerId::from("peer-1"), client, 30_000);
        let tracker = ReplicaRoleTracker::new(manager.clone());
        let base = BaseId::from("base-1");

        manager.request_leadership(&base).await.unwrap();
        assert_eq!(tracker.role(&base).await.0, ReplicaRole::Leader);

        ensemble.expire_session(session).await;
        for _ in 0..200 {
            if tracker.role(&base).await.0 == ReplicaRole::None {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(tracker.role(&base).await.0, ReplicaRole::None);
        assert!(!tracker.can_read(&base).await);
    }
}
