//! Shardlock - Per-Base Leader Election Manager
//!
//! Single-writer guarantees for many independent logical shards ("bases")
//! of a replicated database service, coordinated through an external
//! strongly-consistent coordination service (a ZooKeeper-style ensemble).
//! Multiple storage peers hold replicas of the same base; exactly one peer
//! is allowed to accept writes for a base at any coordination-observed
//! instant, and that right is safely transferable on failure, timeout or
//! administrative action.
//!
//! # Architecture
//!
//! Each base is elected independently with the ephemeral-sequential recipe:
//! candidates create sequence nodes under `/election/<base-id>/`, the
//! lowest live sequence leads, and every other candidate watches only its
//! immediate predecessor to avoid herd effects. Leadership epochs are
//! fenced by a per-base generation counter owned by the ensemble, so stale
//! leaders can never commit writes from a revoked epoch.
//!
//! # Features
//!
//! - Per-base election state machine with predecessor watching
//! - Session expiry handling with orderly role demotion
//! - Generation-based fencing for the write path
//! - Administrative stat/dump/reset/smudge/unlock-all/flush-all operations
//! - Chaos ("harassment") harness asserting election invariants under
//!   concurrent load and injected failure

pub mod admin;
pub mod config;
pub mod coordination;
pub mod election;
pub mod error;
pub mod harass;
pub mod role;

pub use config::ShardlockConfig;
pub use error::{Error, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::admin::{AdminInterface, BatchOutcome};
    pub use crate::config::ShardlockConfig;
    pub use crate::coordination::{Coordinator, MemoryEnsemble, SessionEvent};
    pub use crate::election::{
        BaseId, ElectionManager, ElectionRecord, ElectionStatus, Generation, PeerId, SmudgeMode,
    };
    pub use crate::error::{Error, Result};
    pub use crate::harass::{HarassConfig, HarassReport};
    pub use crate::role::{ReplicaRole, ReplicaRoleTracker};
}
