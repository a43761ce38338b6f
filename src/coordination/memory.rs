//! In-Memory Coordination Ensemble
//!
//! Deterministic implementation of the [`Coordinator`] seam backed by shared
//! process memory. One `MemoryEnsemble` plays the role of the external
//! coordination service; each client handle owns one session, exactly like a
//! peer process holding one ZooKeeper session for all of its bases.
//!
//! This is the implementation the chaos harness and the tests run against:
//! it exposes session expiry, connectivity loss and sequence corruption as
//! explicit injection hooks while keeping the ephemeral-sequential and watch
//! semantics of the real service.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc, Mutex};

use crate::coordination::client::{
    candidate_path, CandidateNode, CandidatePayload, Coordinator, NodeEvent, SessionEvent,
    SessionId,
};
use crate::election::{BaseId, Generation};
use crate::error::{Error, Result};

/// Capacity of per-session event channels; session events are rare
const SESSION_EVENT_CAPACITY: usize = 64;

/// A candidate node as stored on the ensemble
#[derive(Debug, Clone)]
struct StoredCandidate {
    path: String,
    session: SessionId,
    payload: CandidatePayload,
}

/// Election state for one base
#[derive(Debug, Default)]
struct BaseNodes {
    /// Next sequence number to allocate; never reused for this base
    next_sequence: u64,
    /// Authoritative generation counter for this base
    generation: Generation,
    /// Live candidates keyed by effective sequence number
    candidates: BTreeMap<u64, StoredCandidate>,
}

struct SessionEntry {
    events: broadcast::Sender<SessionEvent>,
    alive: bool,
}

#[derive(Default)]
struct EnsembleState {
    bases: HashMap<BaseId, BaseNodes>,
    sessions: HashMap<SessionId, SessionEntry>,
    watchers: HashMap<String, Vec<mpsc::UnboundedSender<NodeEvent>>>,
    unavailable: bool,
}

impl EnsembleState {
    /// Deliver an event to every live watcher of `path`, dropping watchers
    /// whose receiver is gone
    fn fire(&mut self, path: &str, event: NodeEvent) {
        if let Some(senders) = self.watchers.get_mut(path) {
            senders.retain(|tx| tx.send(event.clone()).is_ok());
            if senders.is_empty() {
                self.watchers.remove(path);
            }
        }
    }

    fn check_available(&self) -> Result<()> {
        if self.unavailable {
            Err(Error::CoordinationUnavailable(
                "ensemble unreachable (injected)".into(),
            ))
        } else {
            Ok(())
        }
    }

    /// Remove every ephemeral node owned by `session` and notify watchers.
    /// The session's `Expired` event, when requested, is delivered before
    /// any `Deleted` watch fires, so dependents observe the expiry boundary
    /// first.
    fn drop_session_nodes(&mut self, session: SessionId, expired: bool) {
        if expired {
            if let Some(entry) = self.sessions.get(&session) {
                let _ = entry.events.send(SessionEvent::Expired(session));
            }
        }
        let mut removed = Vec::new();
        for nodes in self.bases.values_mut() {
            let doomed: Vec<u64> = nodes
                .candidates
                .iter()
                .filter(|(_, c)| c.session == session)
                .map(|(seq, _)| *seq)
                .collect();
            for seq in doomed {
                if let Some(candidate) = nodes.candidates.remove(&seq) {
                    removed.push(candidate.path);
                }
            }
        }
        for path in removed {
            self.fire(&path, NodeEvent::Deleted(path.clone()));
        }
    }
}

/// Shared in-memory coordination service
#[derive(Clone)]
pub struct MemoryEnsemble {
    state: Arc<Mutex<EnsembleState>>,
}

impl Default for MemoryEnsemble {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryEnsemble {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(EnsembleState::default())),
        }
    }

    /// Create a client handle holding its own (not yet connected) session
    pub fn client(&self) -> MemoryCoordinator {
        let (events, _) = broadcast::channel(SESSION_EVENT_CAPACITY);
        MemoryCoordinator {
            state: Arc::clone(&self.state),
            session: std::sync::RwLock::new(SessionId::generate()),
            events,
        }
    }

    /// Injection hook: expire a session server-side, deleting all of its
    /// ephemeral nodes
    pub async fn expire_session(&self, session: SessionId) {
        let mut state = self.state.lock().await;
        if let Some(entry) = state.sessions.get_mut(&session) {
            if !entry.alive {
                return;
            }
            entry.alive = false;
        } else {
            return;
        }
        tracing::debug!("expiring session {}", session);
        state.drop_session_nodes(session, true);
    }

    /// Injection hook: flip ensemble reachability. Turning connectivity off
    /// suspends every live session; turning it back on reconnects them.
    pub async fn set_unavailable(&self, unavailable: bool) {
        let mut state = self.state.lock().await;
        if state.unavailable == unavailable {
            return;
        }
        state.unavailable = unavailable;
        for (id, entry) in state.sessions.iter() {
            if entry.alive {
                let event = if unavailable {
                    SessionEvent::Suspended(*id)
                } else {
                    SessionEvent::Connected(*id)
                };
                let _ = entry.events.send(event);
            }
        }
    }

    /// Bases that currently have live candidates (introspection helper)
    pub async fn bases(&self) -> Vec<BaseId> {
        let state = self.state.lock().await;
        let mut bases: Vec<BaseId> = state
            .bases
            .iter()
            .filter(|(_, nodes)| !nodes.candidates.is_empty())
            .map(|(base, _)| base.clone())
            .collect();
        bases.sort();
        bases
    }
}

/// One session against a [`MemoryEnsemble`]
pub struct MemoryCoordinator {
    state: Arc<Mutex<EnsembleState>>,
    session: std::sync::RwLock<SessionId>,
    events: broadcast::Sender<SessionEvent>,
}

impl MemoryCoordinator {
    fn current_session(&self) -> SessionId {
        *self.session.read().expect("session lock poisoned")
    }

    /// Fail the operation unless our session is still alive
    fn check_session(&self, state: &EnsembleState) -> Result<SessionId> {
        let session = self.current_session();
        match state.sessions.get(&session) {
            Some(entry) if entry.alive => Ok(session),
            Some(_) => Err(Error::SessionExpired),
            None => Err(Error::CoordinationUnavailable("session never connected".into())),
        }
    }
}

#[async_trait]
impl Coordinator for MemoryCoordinator {
    async fn connect(&self) -> Result<SessionId> {
        let mut state = self.state.lock().await;
        state.check_available()?;

        // Reconnecting closes the previous session; its ephemeral nodes and
        // sequence numbers are permanently invalid.
        let old = self.current_session();
        if let Some(entry) = state.sessions.get_mut(&old) {
            if entry.alive {
                entry.alive = false;
                state.drop_session_nodes(old, false);
            }
        }

        let session = SessionId::generate();
        state.sessions.insert(
            session,
            SessionEntry {
                events: self.events.clone(),
                alive: true,
            },
        );
        *self.session.write().expect("session lock poisoned") = session;
        let _ = self.events.send(SessionEvent::Connected(session));
        tracing::debug!("coordination session {} established", session);
        Ok(session)
    }

    fn session_id(&self) -> SessionId {
        self.current_session()
    }

    async fn create_candidate(
        &self,
        base: &BaseId,
        payload: CandidatePayload,
    ) -> Result<CandidateNode> {
        let mut state = self.state.lock().await;
        state.check_available()?;
        let session = self.check_session(&state)?;

        let nodes = state.bases.entry(base.clone()).or_default();
        let sequence = nodes.next_sequence;
        nodes.next_sequence += 1;
        let path = candidate_path(base, sequence);
        nodes.candidates.insert(
            sequence,
            StoredCandidate {
                path: path.clone(),
                session,
                payload: payload.clone(),
            },
        );
        state.fire(&path, NodeEvent::Created(path.clone()));
        Ok(CandidateNode {
            path,
            sequence,
            payload,
        })
    }

    async fn delete_node(&self, path: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        state.check_available()?;

        let mut found = None;
        for nodes in state.bases.values_mut() {
            if let Some(seq) = nodes
                .candidates
                .iter()
                .find(|(_, c)| c.path == path)
                .map(|(seq, _)| *seq)
            {
                nodes.candidates.remove(&seq);
                found = Some(path.to_string());
                break;
            }
        }
        match found {
            Some(path) => {
                state.fire(&path, NodeEvent::Deleted(path.clone()));
                Ok(())
            }
            None => Err(Error::NodeNotFound(path.to_string())),
        }
    }

    async fn list_candidates(&self, base: &BaseId) -> Result<Vec<CandidateNode>> {
        let state = self.state.lock().await;
        state.check_available()?;
        let candidates = match state.bases.get(base) {
            Some(nodes) => nodes
                .candidates
                .iter()
                .map(|(seq, c)| CandidateNode {
                    path: c.path.clone(),
                    sequence: *seq,
                    payload: c.payload.clone(),
                })
                .collect(),
            None => Vec::new(),
        };
        Ok(candidates)
    }

    async fn watch_node(&self, path: &str) -> Result<mpsc::UnboundedReceiver<NodeEvent>> {
        let mut state = self.state.lock().await;
        let (tx, rx) = mpsc::unbounded_channel();
        let exists = state
            .bases
            .values()
            .any(|nodes| nodes.candidates.values().any(|c| c.path == path));
        if exists {
            state.watchers.entry(path.to_string()).or_default().push(tx);
        } else {
            // Registration raced a deletion; deliver the deletion so the
            // watcher never waits on a node that is already gone
            let _ = tx.send(NodeEvent::Deleted(path.to_string()));
        }
        Ok(rx)
    }

    fn subscribe_session(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    async fn claim_leadership(&self, base: &BaseId, sequence: u64) -> Result<Generation> {
        let mut state = self.state.lock().await;
        state.check_available()?;
        self.check_session(&state)?;

        let nodes = state
            .bases
            .get_mut(base)
            .ok_or_else(|| Error::BaseNotFound(base.clone()))?;
        let lowest = match nodes.candidates.keys().next() {
            Some(seq) => *seq,
            None => return Err(Error::NodeNotFound(candidate_path(base, sequence))),
        };
        if !nodes.candidates.contains_key(&sequence) {
            return Err(Error::NodeNotFound(candidate_path(base, sequence)));
        }
        if sequence != lowest {
            let peers = nodes
                .candidates
                .values()
                .map(|c| c.payload.peer.to_string())
                .collect();
            return Err(Error::ElectionConflict {
                base: base.clone(),
                generation: nodes.generation,
                peers,
            });
        }
        nodes.generation += 1;
        Ok(nodes.generation)
    }

    async fn advance_generation(&self, base: &BaseId) -> Result<Generation> {
        let mut state = self.state.lock().await;
        state.check_available()?;
        let nodes = state.bases.entry(base.clone()).or_default();
        nodes.generation += 1;
        Ok(nodes.generation)
    }

    async fn current_generation(&self, base: &BaseId) -> Result<Generation> {
        let state = self.state.lock().await;
        state.check_available()?;
        Ok(state.bases.get(base).map(|n| n.generation).unwrap_or(0))
    }

    /// Swap the lowest and highest effective sequence numbers of the base,
    /// leaving node paths untouched, and notify watchers of both nodes
    async fn corrupt_sequence(&self, base: &BaseId) -> Result<()> {
        let mut state = self.state.lock().await;
        state.check_available()?;

        let nodes = state
            .bases
            .get_mut(base)
            .ok_or_else(|| Error::BaseNotFound(base.clone()))?;
        if nodes.candidates.len() < 2 {
            tracing::debug!("corrupt_sequence on {}: fewer than two candidates, no-op", base);
            return Ok(());
        }
        let low = *nodes.candidates.keys().next().expect("nonempty");
        let high = *nodes.candidates.keys().next_back().expect("nonempty");
        let low_node = nodes.candidates.remove(&low).expect("present");
        let high_node = nodes.candidates.remove(&high).expect("present");
        nodes.candidates.insert(low, high_node);
        nodes.candidates.insert(high, low_node);
        let paths: Vec<String> = nodes.candidates.values().map(|c| c.path.clone()).collect();
        tracing::warn!(
            "corrupted sequence ordering on {}: swapped {} and {}",
            base,
            low,
            high
        );
        for path in paths {
            state.fire(&path, NodeEvent::Changed(path.clone()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::election::PeerId;

    fn payload(peer: &str) -> CandidatePayload {
        CandidatePayload {
            peer: PeerId::from(peer),
            lease_ms: 30_000,
        }
    }

    #[tokio::test]
    async fn test_sequences_are_never_reused() {
        let ensemble = MemoryEnsemble::new();
        let client = ensemble.client();
        client.connect().await.unwrap();

        let base = BaseId::from("base-1");
        let first = client.create_candidate(&base, payload("p1")).await.unwrap();
        client.delete_node(&first.path).await.unwrap();
        let second = client.create_candidate(&base, payload("p1")).await.unwrap();
        assert!(second.sequence > first.sequence);
    }

    #[tokio::test]
    async fn test_claim_requires_lowest_sequence() {
        let ensemble = MemoryEnsemble::new();
        let a = ensemble.client();
        let b = ensemble.client();
        a.connect().await.unwrap();
        b.connect().await.unwrap();

        let base = BaseId::from("base-1");
        let first = a.create_candidate(&base, payload("a")).await.unwrap();
        let second = b.create_candidate(&base, payload("b")).await.unwrap();

        let err = b.claim_leadership(&base, second.sequence).await.unwrap_err();
        assert!(matches!(err, Error::ElectionConflict { .. }));

        let generation = a.claim_leadership(&base, first.sequence).await.unwrap();
        assert_eq!(generation, 1);
    }

    #[tokio::test]
    async fn test_expiry_deletes_nodes_and_notifies() {
        let ensemble = MemoryEnsemble::new();
        let a = ensemble.client();
        let b = ensemble.client();
        let session = a.connect().await.unwrap();
        b.connect().await.unwrap();

        let base = BaseId::from("base-1");
        let node = a.create_candidate(&base, payload("a")).await.unwrap();
        let mut watch = b.watch_node(&node.path).await.unwrap();
        let mut events = a.subscribe_session();

        ensemble.expire_session(session).await;

        assert_eq!(events.recv().await.unwrap(), SessionEvent::Expired(session));
        assert_eq!(watch.recv().await.unwrap(), NodeEvent::Deleted(node.path));
        assert!(b.list_candidates(&base).await.unwrap().is_empty());
        assert!(matches!(
            a.create_candidate(&base, payload("a")).await,
            Err(Error::SessionExpired)
        ));
    }

    #[tokio::test]
    async fn test_watch_on_deleted_path_fires_immediately() {
        let ensemble = MemoryEnsemble::new();
        let client = ensemble.client();
        client.connect().await.unwrap();

        let base = BaseId::from("base-1");
        let node = client.create_candidate(&base, payload("a")).await.unwrap();
        client.delete_node(&node.path).await.unwrap();

        // The node is gone before the watch lands; the deletion must still
        // be observed, not silently missed
        let mut watch = client.watch_node(&node.path).await.unwrap();
        assert_eq!(watch.recv().await.unwrap(), NodeEvent::Deleted(node.path));
    }

    #[tokio::test]
    async fn test_reconnect_allocates_new_session() {
        let ensemble = MemoryEnsemble::new();
        let client = ensemble.client();
        let first = client.connect().await.unwrap();
        let second = client.connect().await.unwrap();
        assert_ne!(first, second);
        assert_eq!(client.session_id(), second);
    }

    #[tokio::test]
    async fn test_unavailability_is_retryable() {
        let ensemble = MemoryEnsemble::new();
        let client = ensemble.client();
        client.connect().await.unwrap();
        ensemble.set_unavailable(true).await;

        let err = client
            .list_candidates(&BaseId::from("base-1"))
            .await
            .unwrap_err();
        assert!(err.is_retryable());

        ensemble.set_unavailable(false).await;
        assert!(client.list_candidates(&BaseId::from("base-1")).await.is_ok());
    }

    #[tokio::test]
    async fn test_corrupt_swaps_ordering() {
        let ensemble = MemoryEnsemble::new();
        let a = ensemble.client();
        let b = ensemble.client();
        a.connect().await.unwrap();
        b.connect().await.unwrap();

        let base = BaseId::from("base-1");
        let first = a.create_candidate(&base, payload("a")).await.unwrap();
        let second = b.create_candidate(&base, payload("b")).await.unwrap();

        a.corrupt_sequence(&base).await.unwrap();

        let listed = a.list_candidates(&base).await.unwrap();
        assert_eq!(listed[0].sequence, first.sequence);
        assert_eq!(listed[0].payload.peer, PeerId::from("b"));
        assert_eq!(listed[1].sequence, second.sequence);
        assert_eq!(listed[1].payload.peer, PeerId::from("a"));
    }
}
