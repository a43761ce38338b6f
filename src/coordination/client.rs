//! Coordination Client
//!
//! Session-oriented abstraction over the external coordination service
//! (ZooKeeper-style ensemble). The `Coordinator` trait is the seam between
//! the election core and the real ensemble; the chaos harness plugs a
//! fault-injecting in-memory implementation into the same seam.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc, Semaphore};
use tokio::time::Duration;
use uuid::Uuid;

use crate::election::{BaseId, Generation, PeerId};
use crate::error::{Error, Result};

/// Root path under which per-base election nodes live
pub const ELECTION_ROOT: &str = "/election";

/// Identity of a coordination-service session
///
/// One session serves all bases handled by a peer process. Reconnection
/// allocates a new id; candidate nodes of the old session are permanently
/// invalid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(Uuid);

impl SessionId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Payload stored in a candidate node: `{peer-identity, lease-info}`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandidatePayload {
    /// Peer that created the candidate node
    pub peer: PeerId,
    /// Lease duration the peer intends to honor, in milliseconds
    pub lease_ms: u64,
}

/// An ephemeral-sequential candidate node as seen on the ensemble
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandidateNode {
    /// Full node path, `/election/<base-id>/<sequence>`
    pub path: String,
    /// Sequence number allocated by the ensemble; never reused per base
    pub sequence: u64,
    /// Node payload
    pub payload: CandidatePayload,
}

/// Change notification for a watched node
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeEvent {
    Created(String),
    Deleted(String),
    Changed(String),
}

impl NodeEvent {
    pub fn path(&self) -> &str {
        match self {
            NodeEvent::Created(p) | NodeEvent::Deleted(p) | NodeEvent::Changed(p) => p,
        }
    }
}

/// Session lifecycle events
///
/// `Suspended` means existing leadership is provisional and no new
/// leadership may be asserted until `Connected` re-validates it.
/// `Expired` means every ephemeral node of the session is gone server-side;
/// dependents must revoke roles rather than assume continuity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    Connected(SessionId),
    Suspended(SessionId),
    Expired(SessionId),
}

/// Path of the election directory for a base
pub fn election_path(base: &BaseId) -> String {
    format!("{}/{}", ELECTION_ROOT, base)
}

/// Path of a candidate node for a base
pub fn candidate_path(base: &BaseId, sequence: u64) -> String {
    format!("{}/{}/{:010}", ELECTION_ROOT, base, sequence)
}

/// Asynchronous client contract against the coordination service
///
/// All operations are non-blocking with respect to event delivery: watch and
/// session callbacks enqueue into channels and return immediately.
#[async_trait]
pub trait Coordinator: Send + Sync {
    /// Establish (or re-establish) a session. Reconnection allocates a new
    /// session id.
    async fn connect(&self) -> Result<SessionId>;

    /// Current session id
    fn session_id(&self) -> SessionId;

    /// Create an ephemeral-sequential candidate node under the base's
    /// election path and return it
    async fn create_candidate(
        &self,
        base: &BaseId,
        payload: CandidatePayload,
    ) -> Result<CandidateNode>;

    /// Delete a node by path
    async fn delete_node(&self, path: &str) -> Result<()>;

    /// List live candidates for a base, ordered by ascending sequence
    async fn list_candidates(&self, base: &BaseId) -> Result<Vec<CandidateNode>>;

    /// Watch a single node for create/delete/change events
    async fn watch_node(&self, path: &str) -> Result<mpsc::UnboundedReceiver<NodeEvent>>;

    /// Subscribe to session lifecycle events
    fn subscribe_session(&self) -> broadcast::Receiver<SessionEvent>;

    /// Atomically verify that `sequence` is the lowest live candidate for
    /// `base` and bump the base's generation, returning the new value.
    ///
    /// The ensemble owns the per-base generation counter, which is what
    /// makes the single-leader-per-generation invariant enforceable across
    /// peers. A claim by a non-lowest candidate fails with
    /// [`Error::ElectionConflict`].
    async fn claim_leadership(&self, base: &BaseId, sequence: u64) -> Result<Generation>;

    /// Bump the base's generation without a leadership claim, fencing any
    /// in-flight tokens from the prior epoch (administrative reset)
    async fn advance_generation(&self, base: &BaseId) -> Result<Generation>;

    /// Read the base's current generation
    async fn current_generation(&self, base: &BaseId) -> Result<Generation>;

    /// Chaos hook: corrupt the sequence ordering semantics for one node of
    /// the base. Real backends do not implement this.
    async fn corrupt_sequence(&self, base: &BaseId) -> Result<()> {
        let _ = base;
        Err(Error::Unsupported("corrupt_sequence".into()))
    }
}

/// Rate-limited, retrying wrapper around a [`Coordinator`]
///
/// Bounds outstanding ensemble requests with a semaphore (the session is
/// shared by all bases in a process) and retries transient
/// `CoordinationUnavailable` failures with backoff inside a bounded window.
/// Once the window is exhausted the error propagates and the affected base
/// moves toward FAILED.
pub struct RateLimitedCoordinator {
    inner: Arc<dyn Coordinator>,
    limiter: Arc<Semaphore>,
    retry_backoff: Duration,
    retry_window: Duration,
}

impl RateLimitedCoordinator {
    pub fn new(
        inner: Arc<dyn Coordinator>,
        max_outstanding: usize,
        retry_backoff: Duration,
        retry_window: Duration,
    ) -> Self {
        Self {
            inner,
            limiter: Arc::new(Semaphore::new(max_outstanding.max(1))),
            retry_backoff,
            retry_window,
        }
    }

    /// Run `op` under the request limiter, retrying transient failures
    /// until the retry window closes
    async fn governed<T, F, Fut>(&self, op: F) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        let _permit = self
            .limiter
            .acquire()
            .await
            .map_err(|_| Error::ShuttingDown)?;

        let started = Instant::now();
        let mut backoff = self.retry_backoff;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() && started.elapsed() < self.retry_window => {
                    tracing::debug!("retrying coordination op after {}: {}", backoff.as_millis(), e);
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(self.retry_window);
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[async_trait]
impl Coordinator for RateLimitedCoordinator {
    async fn connect(&self) -> Result<SessionId> {
        self.governed(|| self.inner.connect()).await
    }

    fn session_id(&self) -> SessionId {
        self.inner.session_id()
    }

    async fn create_candidate(
        &self,
        base: &BaseId,
        payload: CandidatePayload,
    ) -> Result<CandidateNode> {
        self.governed(|| self.inner.create_candidate(base, payload.clone()))
            .await
    }

    async fn delete_node(&self, path: &str) -> Result<()> {
        self.governed(|| self.inner.delete_node(path)).await
    }

    async fn list_candidates(&self, base: &BaseId) -> Result<Vec<CandidateNode>> {
        self.governed(|| self.inner.list_candidates(base)).await
    }

    async fn watch_node(&self, path: &str) -> Result<mpsc::UnboundedReceiver<NodeEvent>> {
        // Watch registration is part of the event path, never rate limited
        self.inner.watch_node(path).await
    }

    fn subscribe_session(&self) -> broadcast::Receiver<SessionEvent> {
        self.inner.subscribe_session()
    }

    async fn claim_leadership(&self, base: &BaseId, sequence: u64) -> Result<Generation> {
        self.governed(|| self.inner.claim_leadership(base, sequence))
            .await
    }

    async fn advance_generation(&self, base: &BaseId) -> Result<Generation> {
        self.governed(|| self.inner.advance_generation(base)).await
    }

    async fn current_generation(&self, base: &BaseId) -> Result<Generation> {
        self.governed(|| self.inner.current_generation(base)).await
    }

    async fn corrupt_sequence(&self, base: &BaseId) -> Result<()> {
        self.inner.corrupt_sequence(base).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordination::MemoryEnsemble;

    #[test]
    fn test_path_convention() {
        let base = BaseId::from("acct-7f3a");
        assert_eq!(election_path(&base), "/election/acct-7f3a");
        assert_eq!(candidate_path(&base, 42), "/election/acct-7f3a/0000000042");
    }

    #[test]
    fn test_payload_roundtrip() {
        let payload = CandidatePayload {
            peer: PeerId::from("peer-1"),
            lease_ms: 30_000,
        };
        let json = serde_json::to_string(&payload).unwrap();
        let back: CandidatePayload = serde_json::from_str(&json).unwrap();
        assert_eq!(back, payload);
    }

    #[tokio::test]
    async fn test_governed_retries_transient_unavailability() {
        let ensemble = MemoryEnsemble::new();
        let client = Arc::new(ensemble.client());
        client.connect().await.unwrap();
        let governed = RateLimitedCoordinator::new(
            client,
            4,
            Duration::from_millis(10),
            Duration::from_secs(2),
        );

        ensemble.set_unavailable(true).await;
        let restore = ensemble.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            restore.set_unavailable(false).await;
        });

        // The outage ends inside the retry window; the call succeeds
        // instead of surfacing CoordinationUnavailable
        let candidates = governed
            .list_candidates(&BaseId::from("base-1"))
            .await
            .unwrap();
        assert!(candidates.is_empty());
    }
}
