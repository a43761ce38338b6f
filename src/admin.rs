//! Administrative Introspection and Repair
//!
//! Operator-facing operations layered on the election manager: record
//! inspection, forced resets, chaos smudging and the bulk unlock/flush
//! sweeps. Bulk operations have partial-failure semantics: they continue
//! past per-base failures and report them aggregated, never aborting early.

use serde::Serialize;

use crate::election::{
    BaseId, ElectionManager, ElectionRecord, ElectionStatus, Generation, SmudgeMode,
};
use crate::error::{Error, Result};

/// One failed base inside a bulk operation
#[derive(Debug, Clone, Serialize)]
pub struct BatchFailure {
    pub base: BaseId,
    pub reason: String,
}

/// Aggregated result of a bulk operation
#[derive(Debug, Clone, Default, Serialize)]
pub struct BatchOutcome {
    /// Number of bases the operation succeeded on
    pub succeeded: usize,
    /// Per-base failures, in base order
    pub failures: Vec<BatchFailure>,
}

impl BatchOutcome {
    pub fn all_ok(&self) -> bool {
        self.failures.is_empty()
    }

    fn record(&mut self, base: &BaseId, result: Result<()>) {
        match result {
            Ok(()) => self.succeeded += 1,
            Err(e) => {
                let failure = Error::AdminOpFailed {
                    base: base.clone(),
                    reason: e.to_string(),
                };
                tracing::warn!("{}", failure);
                self.failures.push(BatchFailure {
                    base: base.clone(),
                    reason: e.to_string(),
                });
            }
        }
    }
}

/// Admin surface over one election manager
pub struct AdminInterface {
    manager: ElectionManager,
}

impl AdminInterface {
    pub fn new(manager: ElectionManager) -> Self {
        Self { manager }
    }

    /// Read-only record snapshot; `BaseNotFound` if the base was never
    /// requested on this manager
    pub async fn stat(&self, base: &BaseId) -> Result<ElectionRecord> {
        self.manager.stat(base).await
    }

    /// Ordered snapshot of all known bases, each appearing exactly once
    pub async fn dump(&self) -> Vec<ElectionRecord> {
        self.manager.dump().await
    }

    /// Force a base back to NONE, fencing the prior epoch
    pub async fn reset(&self, base: &BaseId) -> Result<Generation> {
        self.manager.force_reset(base).await
    }

    /// Chaos injection passthrough (test/chaos use only)
    pub async fn smudge(&self, base: &BaseId, mode: SmudgeMode) -> Result<()> {
        self.manager.smudge(base, mode).await
    }

    /// Resign every locally-held leadership or candidacy
    pub async fn unlock_all(&self) -> BatchOutcome {
        let mut outcome = BatchOutcome::default();
        for record in self.manager.dump().await {
            let held = matches!(
                record.status(),
                ElectionStatus::Leader | ElectionStatus::Follower | ElectionStatus::Pending
            ) || record.holds_candidate();
            if !held {
                continue;
            }
            let result = self.manager.resign(&record.base).await;
            outcome.record(&record.base, result);
        }
        tracing::info!(
            "unlock-all released {} bases ({} failures)",
            outcome.succeeded,
            outcome.failures.len()
        );
        outcome
    }

    /// Force-reset every locally known base
    pub async fn flush_all(&self) -> BatchOutcome {
        let mut outcome = BatchOutcome::default();
        for base in self.manager.known_bases().await {
            let result = self.manager.force_reset(&base).await.map(|_| ());
            outcome.record(&base, result);
        }
        tracing::info!(
            "flush-all reset {} bases ({} failures)",
            outcome.succeeded,
            outcome.failures.len()
        );
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordination::{Coordinator, MemoryEnsemble};
    use crate::election::{ElectionState, PeerId};
    use std::sync::Arc;

    async fn setup() -> (MemoryEnsemble, ElectionManager, AdminInterface) {
        let ensemble = MemoryEnsemble::new();
        let client = Arc::new(ensemble.client());
        client.connect().await.unwrap();
        let manager = ElectionManager::new(PeerId::from("peer-1"), client, 30_000);
        let admin = AdminInterface::new(manager.clone());
        (ensemble, manager, admin)
    }

    #[tokio::test]
    async fn test_stat_unknown_base() {
        let (_ensemble, _manager, admin) = setup().await;
        assert!(matches!(
            admin.stat(&BaseId::from("missing")).await,
            Err(Error::BaseNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_reset_then_stat_reports_none() {
        let (_ensemble, manager, admin) = setup().await;
        let base = BaseId::from("base-1");

        manager.request_leadership(&base).await.unwrap();
        let before = admin.stat(&base).await.unwrap().generation;

        admin.reset(&base).await.unwrap();
        let record = admin.stat(&base).await.unwrap();
        assert_eq!(record.state, ElectionState::None);
        assert!(record.generation >= before);
    }

    #[tokio::test]
    async fn test_adopted_bases_are_inspectable() {
        let (_ensemble, manager, admin) = setup().await;
        for i in 0..3 {
            manager
                .adopt(&BaseId::new(format!("base-{}", i)))
                .await
                .unwrap();
        }

        // No election ever ran, yet the bases are visible and repairable
        let record = admin.stat(&BaseId::from("base-0")).await.unwrap();
        assert_eq!(record.state, ElectionState::None);
        assert_eq!(admin.dump().await.len(), 3);

        let outcome = admin.flush_all().await;
        assert!(outcome.all_ok());
        assert_eq!(outcome.succeeded, 3);
    }

    #[tokio::test]
    async fn test_unlock_all_releases_held_bases() {
        let (_ensemble, manager, admin) = setup().await;
        for i in 0..4 {
            manager
                .request_leadership(&BaseId::new(format!("base-{}", i)))
                .await
                .unwrap();
        }

        let outcome = admin.unlock_all().await;
        assert!(outcome.all_ok());
        assert_eq!(outcome.succeeded, 4);

        for record in admin.dump().await {
            assert_eq!(record.state, ElectionState::None);
        }
    }

    #[tokio::test]
    async fn test_flush_all_continues_past_failures() {
        let (ensemble, manager, admin) = setup().await;
        for i in 0..3 {
            manager
                .request_leadership(&BaseId::new(format!("base-{}", i)))
                .await
                .unwrap();
        }

        // Make the ensemble unreachable so every reset fails; the batch
        // must still visit every base
        ensemble.set_unavailable(true).await;
        let outcome = admin.flush_all().await;
        assert_eq!(outcome.succeeded, 0);
        assert_eq!(outcome.failures.len(), 3);

        ensemble.set_unavailable(false).await;
        let outcome = admin.flush_all().await;
        assert!(outcome.all_ok());
        assert_eq!(outcome.succeeded, 3);
    }
}
