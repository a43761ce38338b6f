//! Election Manager
//!
//! Per-base leader election over the coordination service, using the
//! ephemeral-sequential recipe: the peer holding the lowest live sequence
//! number for a base is LEADER, every other candidate is FOLLOWER and
//! watches only its immediate predecessor to avoid herd effects.
//!
//! The manager is the sole owner of per-base election records. Each base has
//! one exclusive section (a `tokio::sync::Mutex` around its record);
//! operations on different bases never contend. Role changes are published
//! through a `watch` channel inside the critical section, so dependents
//! observe revocation synchronously with the transition.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{watch, Mutex, MutexGuard, RwLock};
use tokio_util::sync::CancellationToken;

use crate::coordination::{
    election_path, CandidatePayload, Coordinator, NodeEvent, SessionEvent, SessionId,
};
use crate::election::record::{
    BaseId, ElectionRecord, ElectionState, ElectionStatus, Generation, PeerId,
};
use crate::error::{Error, Result};

/// How many consecutive conflicting claim attempts are tolerated before the
/// base is parked in FAILED
const MAX_EVALUATE_ATTEMPTS: usize = 3;

/// Smudge modes for chaos testing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SmudgeMode {
    /// Delete the current leader's candidate node server-side
    DeleteLeader,
    /// Corrupt the sequence ordering semantics for one node
    Corrupt,
}

impl std::fmt::Display for SmudgeMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SmudgeMode::DeleteLeader => write!(f, "delete-leader"),
            SmudgeMode::Corrupt => write!(f, "corrupt"),
        }
    }
}

/// Role view published per base; consumed by the replica role tracker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoleSnapshot {
    pub status: ElectionStatus,
    pub generation: Generation,
    pub leader: Option<PeerId>,
}

impl Default for RoleSnapshot {
    fn default() -> Self {
        Self {
            status: ElectionStatus::None,
            generation: 0,
            leader: None,
        }
    }
}

/// Per-base slot in the record arena
struct BaseSlot {
    base: BaseId,
    record: Mutex<ElectionRecord>,
    publish: watch::Sender<RoleSnapshot>,
    /// Cancellation token of the current one-shot node watcher task
    watcher: std::sync::Mutex<Option<CancellationToken>>,
    /// Cancellation token of the in-flight leadership request, if any
    request: std::sync::Mutex<Option<CancellationToken>>,
}

impl BaseSlot {
    fn new(base: BaseId) -> Self {
        let record = ElectionRecord::new(base.clone());
        let (publish, _) = watch::channel(RoleSnapshot::default());
        Self {
            base,
            record: Mutex::new(record),
            publish,
            watcher: std::sync::Mutex::new(None),
            request: std::sync::Mutex::new(None),
        }
    }

    /// Publish the record's current role; must be called while holding the
    /// record mutex so dependents never observe a stale LEADER
    fn publish(&self, record: &ElectionRecord) {
        self.publish.send_replace(RoleSnapshot {
            status: record.status(),
            generation: record.generation,
            leader: record.leader.clone(),
        });
    }

    /// Cancel the current node watcher task, if any
    fn cancel_watcher(&self) {
        if let Some(token) = self.watcher.lock().expect("watcher lock poisoned").take() {
            token.cancel();
        }
    }

    fn set_watcher(&self, token: CancellationToken) {
        let mut slot = self.watcher.lock().expect("watcher lock poisoned");
        if let Some(old) = slot.replace(token) {
            old.cancel();
        }
    }
}

struct ManagerInner {
    peer: PeerId,
    coordinator: Arc<dyn Coordinator>,
    lease_ms: u64,
    bases: RwLock<HashMap<BaseId, Arc<BaseSlot>>>,
    /// Set while the session is suspended; no new leadership may be asserted
    suspended: AtomicBool,
    shutdown: CancellationToken,
}

/// Per-base election state machine
///
/// Cheap to clone; all clones share the same state.
#[derive(Clone)]
pub struct ElectionManager {
    inner: Arc<ManagerInner>,
}

impl ElectionManager {
    /// Create a manager for `peer` on top of an established coordination
    /// client and start its session event loop
    pub fn new(peer: PeerId, coordinator: Arc<dyn Coordinator>, lease_ms: u64) -> Self {
        let inner = Arc::new(ManagerInner {
            peer,
            coordinator,
            lease_ms,
            bases: RwLock::new(HashMap::new()),
            suspended: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
        });
        tokio::spawn(ManagerInner::run_session_loop(Arc::clone(&inner)));
        Self { inner }
    }

    /// Peer identity this manager elects on behalf of
    pub fn peer(&self) -> &PeerId {
        &self.inner.peer
    }

    /// Stop background tasks; held records are left as-is
    pub fn shutdown(&self) {
        self.inner.shutdown.cancel();
    }

    /// Request leadership for a base
    ///
    /// Only acts when the base is in NONE; otherwise the current status is
    /// returned unchanged. Resolves once our rank is known: either we
    /// claimed leadership or we are a follower watching our predecessor.
    pub async fn request_leadership(&self, base: &BaseId) -> Result<ElectionStatus> {
        let slot = self.inner.ensure_slot(base).await;

        let token = self.inner.shutdown.child_token();
        {
            let mut request = slot.request.lock().expect("request lock poisoned");
            if request.is_some() {
                // A request is already in flight; its outcome will show up
                // in the published status.
                return Ok(slot.publish.borrow().status);
            }
            *request = Some(token.clone());
        }

        let result = tokio::select! {
            _ = token.cancelled() => {
                self.inner.cleanup_cancelled(&slot).await;
                Err(Error::Cancelled)
            }
            r = ManagerInner::do_request(&self.inner, &slot) => r,
        };

        slot.request.lock().expect("request lock poisoned").take();
        result
    }

    /// Cancel an in-flight leadership request for a base
    ///
    /// Any partially-created candidate node is cleaned up before this
    /// returns. A no-op when nothing is in flight.
    pub async fn cancel_request(&self, base: &BaseId) -> Result<()> {
        let Some(slot) = self.inner.slot(base).await else {
            return Ok(());
        };
        let token = slot.request.lock().expect("request lock poisoned").clone();
        if let Some(token) = token {
            token.cancel();
            self.inner.cleanup_cancelled(&slot).await;
        }
        Ok(())
    }

    /// Non-blocking read of a base's published status
    pub async fn status(&self, base: &BaseId) -> ElectionStatus {
        match self.inner.slot(base).await {
            Some(slot) => slot.publish.borrow().status,
            None => ElectionStatus::None,
        }
    }

    /// Snapshot of a base's election record
    pub async fn stat(&self, base: &BaseId) -> Result<ElectionRecord> {
        let slot = self
            .inner
            .slot(base)
            .await
            .ok_or_else(|| Error::BaseNotFound(base.clone()))?;
        let record = slot.record.lock().await.clone();
        Ok(record)
    }

    /// Snapshot of every known base's record, ordered by base id
    ///
    /// A read-lock sweep of the arena followed by brief per-record locks;
    /// no lock is held across output emission and each base appears exactly
    /// once.
    pub async fn dump(&self) -> Vec<ElectionRecord> {
        let slots: Vec<Arc<BaseSlot>> = {
            let bases = self.inner.bases.read().await;
            let mut slots: Vec<_> = bases.values().cloned().collect();
            slots.sort_by(|a, b| a.base.cmp(&b.base));
            slots
        };
        let mut records = Vec::with_capacity(slots.len());
        for slot in slots {
            records.push(slot.record.lock().await.clone());
        }
        records
    }

    /// All bases this manager has a record for, ordered
    pub async fn known_bases(&self) -> Vec<BaseId> {
        let bases = self.inner.bases.read().await;
        let mut ids: Vec<_> = bases.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Register a base without requesting leadership
    ///
    /// Creates the base's record in NONE with its generation synced from
    /// the ensemble, so admin tooling can inspect and repair bases this
    /// peer hosts before any election ran locally.
    pub async fn adopt(&self, base: &BaseId) -> Result<()> {
        let slot = self.inner.ensure_slot(base).await;
        let mut record = slot.record.lock().await;
        if record.state != ElectionState::None {
            return Ok(());
        }
        let generation = self.inner.coordinator.current_generation(base).await?;
        record.generation = record.generation.max(generation);
        slot.publish(&record);
        Ok(())
    }

    /// Authoritative generation for a base, read from the ensemble
    pub async fn ensemble_generation(&self, base: &BaseId) -> Result<Generation> {
        self.inner.coordinator.current_generation(base).await
    }

    /// Subscribe to role changes for a base
    pub async fn subscribe(&self, base: &BaseId) -> watch::Receiver<RoleSnapshot> {
        self.inner.ensure_slot(base).await.publish.subscribe()
    }

    /// Give up leadership or candidacy for a base; idempotent
    pub async fn resign(&self, base: &BaseId) -> Result<()> {
        let Some(slot) = self.inner.slot(base).await else {
            return Ok(());
        };
        let mut record = slot.record.lock().await;
        if record.state == ElectionState::None && !record.holds_candidate() {
            return Ok(());
        }
        slot.cancel_watcher();
        if let Some(path) = record.candidate_path.clone() {
            match self.inner.coordinator.delete_node(&path).await {
                Ok(()) => {}
                // Already gone server-side; nothing left to release
                Err(Error::NodeNotFound(_)) | Err(Error::SessionExpired) => {}
                Err(e) => return Err(e),
            }
        }
        record.state = ElectionState::Resigned;
        slot.publish(&record);
        record.state = ElectionState::None;
        record.leader = None;
        record.clear_candidacy();
        slot.publish(&record);
        tracing::info!("resigned candidacy for base {}", base);
        Ok(())
    }

    /// Administrative reset: force the base to NONE and advance the
    /// generation to fence any in-flight tokens from the prior epoch
    pub async fn force_reset(&self, base: &BaseId) -> Result<Generation> {
        let slot = self
            .inner
            .slot(base)
            .await
            .ok_or_else(|| Error::BaseNotFound(base.clone()))?;
        let mut record = slot.record.lock().await;
        slot.cancel_watcher();
        if let Some(path) = record.candidate_path.clone() {
            match self.inner.coordinator.delete_node(&path).await {
                Ok(()) | Err(Error::NodeNotFound(_)) | Err(Error::SessionExpired) => {}
                Err(e) => return Err(e),
            }
        }
        let generation = self.inner.coordinator.advance_generation(base).await?;
        record.generation = generation.max(record.generation);
        record.state = ElectionState::None;
        record.leader = None;
        record.clear_candidacy();
        slot.publish(&record);
        tracing::warn!("force-reset base {} to generation {}", base, generation);
        Ok(generation)
    }

    /// Chaos injection: disturb the base's election server-side without
    /// touching local bookkeeping
    pub async fn smudge(&self, base: &BaseId, mode: SmudgeMode) -> Result<()> {
        let slot = self
            .inner
            .slot(base)
            .await
            .ok_or_else(|| Error::BaseNotFound(base.clone()))?;
        // Same exclusive section as election operations; local record is
        // read but deliberately not modified.
        let _record = slot.record.lock().await;
        tracing::warn!("smudging base {} ({})", base, mode);
        match mode {
            SmudgeMode::DeleteLeader => {
                let candidates = self.inner.coordinator.list_candidates(base).await?;
                match candidates.first() {
                    Some(leader) => self.inner.coordinator.delete_node(&leader.path).await,
                    None => Err(Error::NodeNotFound(election_path(base))),
                }
            }
            SmudgeMode::Corrupt => self.inner.coordinator.corrupt_sequence(base).await,
        }
    }
}

impl ManagerInner {
    async fn slot(&self, base: &BaseId) -> Option<Arc<BaseSlot>> {
        self.bases.read().await.get(base).cloned()
    }

    async fn ensure_slot(&self, base: &BaseId) -> Arc<BaseSlot> {
        if let Some(slot) = self.slot(base).await {
            return slot;
        }
        let mut bases = self.bases.write().await;
        bases
            .entry(base.clone())
            .or_insert_with(|| Arc::new(BaseSlot::new(base.clone())))
            .clone()
    }

    /// The guts of a leadership request; runs with the base's record locked
    /// for the whole critical path
    async fn do_request(inner: &Arc<Self>, slot: &Arc<BaseSlot>) -> Result<ElectionStatus> {
        let mut record = slot.record.lock().await;
        match record.state {
            ElectionState::Failed => {
                return Err(Error::BaseFailed {
                    base: slot.base.clone(),
                })
            }
            ElectionState::None | ElectionState::Expired | ElectionState::Resigned => {}
            // Already a candidate, follower or leader; nothing to do
            _ => return Ok(record.status()),
        }
        if inner.suspended.load(Ordering::SeqCst) {
            return Err(Error::SessionSuspended);
        }

        record.state = ElectionState::Requesting;
        slot.publish(&record);

        let payload = CandidatePayload {
            peer: inner.peer.clone(),
            lease_ms: inner.lease_ms,
        };
        let node = match inner.coordinator.create_candidate(&slot.base, payload).await {
            Ok(node) => node,
            Err(Error::SessionExpired) => {
                record.state = ElectionState::None;
                slot.publish(&record);
                return Err(Error::SessionExpired);
            }
            Err(e) => {
                inner.mark_failed(slot, &mut record, &e);
                return Err(e);
            }
        };

        record.candidate_sequence = Some(node.sequence);
        record.candidate_path = Some(node.path);
        record.session = Some(inner.coordinator.session_id());
        record.lease_expiry =
            Some(Utc::now() + chrono::Duration::milliseconds(inner.lease_ms as i64));
        record.state = ElectionState::Watching;
        slot.publish(&record);

        ManagerInner::evaluate(inner, slot, &mut record).await?;
        Ok(record.status())
    }

    /// Re-read the candidate set and resolve our rank
    ///
    /// Transitions the record to LEADER (after a successful generation
    /// claim), FOLLOWER (watching the immediate predecessor) or NONE (our
    /// candidate node is gone server-side).
    async fn evaluate(
        inner: &Arc<Self>,
        slot: &Arc<BaseSlot>,
        record: &mut MutexGuard<'_, ElectionRecord>,
    ) -> Result<()> {
        let base = slot.base.clone();
        for attempt in 1..=MAX_EVALUATE_ATTEMPTS {
            let candidates = match inner.coordinator.list_candidates(&base).await {
                Ok(candidates) => candidates,
                Err(e) => {
                    inner.mark_failed(slot, record, &e);
                    return Err(e);
                }
            };
            record.peers = candidates.iter().map(|c| c.payload.peer.clone()).collect();

            // Post-corrupt the path is the stable identity, not the sequence
            let position = candidates
                .iter()
                .position(|c| Some(&c.path) == record.candidate_path.as_ref());
            let Some(position) = position else {
                // Our node vanished (expiry race or smudge); candidacy is over
                slot.cancel_watcher();
                let was = record.state;
                record.state = ElectionState::None;
                record.leader = None;
                record.clear_candidacy();
                slot.publish(record);
                tracing::warn!(
                    "candidate node for base {} disappeared while {}",
                    base,
                    was
                );
                return Ok(());
            };

            let sequence = candidates[position].sequence;
            record.candidate_sequence = Some(sequence);

            if position == 0 {
                if record.state == ElectionState::Leader {
                    // Revalidation while already leading; nothing to claim
                    return Ok(());
                }
                match inner.coordinator.claim_leadership(&base, sequence).await {
                    Ok(generation) => {
                        if generation <= record.generation {
                            // A leader transition must carry a generation
                            // increase over the last seen value
                            let e = Error::ElectionConflict {
                                base: base.clone(),
                                generation,
                                peers: record.peers.iter().map(|p| p.to_string()).collect(),
                            };
                            inner.mark_failed(slot, record, &e);
                            return Err(e);
                        }
                        record.generation = generation;
                        record.leader = Some(inner.peer.clone());
                        record.state = ElectionState::Leader;
                        record.lease_expiry = Some(
                            Utc::now() + chrono::Duration::milliseconds(inner.lease_ms as i64),
                        );
                        slot.publish(record);
                        tracing::info!(
                            "peer {} is LEADER for base {} at generation {}",
                            inner.peer,
                            base,
                            generation
                        );
                        // Watch our own node so a server-side deletion
                        // (smudge, expiry) revokes leadership locally
                        let own = candidates[position].path.clone();
                        ManagerInner::spawn_watcher(inner, slot, own, record.session);
                        return Ok(());
                    }
                    Err(conflict @ Error::ElectionConflict { .. }) => {
                        // Stale candidate set; re-read rather than trusting it
                        tracing::error!(
                            "election conflict on base {} (attempt {}): {}; record: {:?}",
                            base,
                            attempt,
                            conflict,
                            **record
                        );
                        if attempt == MAX_EVALUATE_ATTEMPTS {
                            inner.mark_failed(slot, record, &conflict);
                            return Err(conflict);
                        }
                        continue;
                    }
                    Err(e) => {
                        inner.mark_failed(slot, record, &e);
                        return Err(e);
                    }
                }
            }

            // Follower: lowest live sequence leads, we watch only our
            // immediate predecessor
            let leader = &candidates[0];
            let predecessor = &candidates[position - 1];
            if record.state == ElectionState::Leader {
                tracing::warn!(
                    "base {}: no longer the lowest candidate, demoting to follower",
                    base
                );
            }
            record.leader = Some(leader.payload.peer.clone());
            if let Ok(generation) = inner.coordinator.current_generation(&base).await {
                record.generation = record.generation.max(generation);
            }
            record.state = ElectionState::Follower;
            slot.publish(record);
            tracing::debug!(
                "peer {} is FOLLOWER for base {} behind {} (watching {})",
                inner.peer,
                base,
                leader.payload.peer,
                predecessor.path
            );
            ManagerInner::spawn_watcher(inner, slot, predecessor.path.clone(), record.session);
            return Ok(());
        }
        Ok(())
    }

    /// Spawn a one-shot watcher on `path`; on deletion or change the base's
    /// rank is re-evaluated. Replaces any previous watcher for the slot.
    fn spawn_watcher(
        inner: &Arc<Self>,
        slot: &Arc<BaseSlot>,
        path: String,
        session: Option<SessionId>,
    ) {
        let token = inner.shutdown.child_token();
        slot.set_watcher(token.clone());
        let inner = Arc::clone(inner);
        let slot = Arc::clone(slot);
        tokio::spawn(async move {
            let mut events = match inner.coordinator.watch_node(&path).await {
                Ok(events) => events,
                Err(e) => {
                    tracing::warn!("failed to watch {}: {}", path, e);
                    return;
                }
            };
            loop {
                let event = tokio::select! {
                    _ = token.cancelled() => return,
                    event = events.recv() => event,
                };
                match event {
                    None => return,
                    Some(NodeEvent::Created(_)) => continue,
                    Some(NodeEvent::Deleted(_)) | Some(NodeEvent::Changed(_)) => {
                        let mut record = slot.record.lock().await;
                        // Stale watcher: the record moved on (expiry, resign,
                        // reset) since this watch was registered
                        if record.session != session
                            || !matches!(
                                record.state,
                                ElectionState::Leader
                                    | ElectionState::Follower
                                    | ElectionState::Watching
                            )
                        {
                            return;
                        }
                        if let Err(e) = ManagerInner::evaluate(&inner, &slot, &mut record).await {
                            tracing::warn!(
                                "re-evaluation of base {} failed: {}",
                                slot.base,
                                e
                            );
                        }
                        return;
                    }
                }
            }
        });
    }

    /// Clean up after a cancelled leadership request
    ///
    /// Deletes any partially-created candidate node and drains the record
    /// back to NONE; idempotent so both the cancelling and the cancelled
    /// side may run it.
    async fn cleanup_cancelled(&self, slot: &Arc<BaseSlot>) {
        let mut record = slot.record.lock().await;
        if !matches!(
            record.state,
            ElectionState::Requesting | ElectionState::Watching
        ) {
            return;
        }
        if let Some(path) = record.candidate_path.clone() {
            if let Err(e) = self.coordinator.delete_node(&path).await {
                if !matches!(e, Error::NodeNotFound(_) | Error::SessionExpired) {
                    tracing::warn!("failed to delete cancelled candidate {}: {}", path, e);
                }
            }
        } else {
            // The create round-trip may have landed server-side without us
            // recording it; sweep by peer identity
            if let Ok(candidates) = self.coordinator.list_candidates(&slot.base).await {
                for candidate in candidates {
                    if candidate.payload.peer == self.peer {
                        let _ = self.coordinator.delete_node(&candidate.path).await;
                    }
                }
            }
        }
        slot.cancel_watcher();
        record.state = ElectionState::None;
        record.leader = None;
        record.clear_candidacy();
        slot.publish(&record);
        tracing::info!("cancelled leadership request for base {}", slot.base);
    }

    fn mark_failed(&self, slot: &BaseSlot, record: &mut ElectionRecord, cause: &Error) {
        record.state = ElectionState::Failed;
        slot.publish(record);
        tracing::error!(
            "base {} moved to FAILED, administrative reset required: {}",
            slot.base,
            cause
        );
    }

    /// Session event loop: expiry invalidation, suspension gating and
    /// post-reconnect revalidation
    async fn run_session_loop(inner: Arc<Self>) {
        let mut events = inner.coordinator.subscribe_session();
        loop {
            let event = tokio::select! {
                _ = inner.shutdown.cancelled() => return,
                event = events.recv() => event,
            };
            match event {
                Ok(SessionEvent::Expired(session)) => {
                    inner.handle_session_expired(session).await;
                }
                Ok(SessionEvent::Suspended(_)) => {
                    tracing::warn!(
                        "coordination session suspended; leadership is provisional"
                    );
                    inner.suspended.store(true, Ordering::SeqCst);
                }
                Ok(SessionEvent::Connected(_)) => {
                    let was_suspended = inner.suspended.swap(false, Ordering::SeqCst);
                    if was_suspended {
                        tracing::info!("coordination session reconnected; revalidating roles");
                        ManagerInner::revalidate_all(&inner).await;
                    }
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                    tracing::warn!("session event loop lagged, missed {} events", missed);
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
            }
        }
    }

    /// Demote every base whose record is tied to the expired session.
    /// Generation is preserved: no successor has been elected yet.
    async fn handle_session_expired(&self, session: SessionId) {
        tracing::warn!("coordination session {} expired; demoting held bases", session);
        let slots: Vec<Arc<BaseSlot>> = self.bases.read().await.values().cloned().collect();
        for slot in slots {
            let mut record = slot.record.lock().await;
            if record.session != Some(session) {
                continue;
            }
            slot.cancel_watcher();
            record.state = ElectionState::Expired;
            slot.publish(&record);
            record.state = ElectionState::None;
            record.leader = None;
            record.clear_candidacy();
            slot.publish(&record);
            tracing::info!(
                "base {} demoted to NONE after session expiry (generation {})",
                slot.base,
                record.generation
            );
        }
    }

    /// After a suspension ends, re-validate every provisional role against
    /// the ensemble before trusting it again
    async fn revalidate_all(inner: &Arc<Self>) {
        let slots: Vec<Arc<BaseSlot>> = inner.bases.read().await.values().cloned().collect();
        for slot in slots {
            let mut record = slot.record.lock().await;
            if !matches!(
                record.state,
                ElectionState::Leader | ElectionState::Follower | ElectionState::Watching
            ) {
                continue;
            }
            if let Err(e) = ManagerInner::evaluate(inner, &slot, &mut record).await {
                tracing::warn!("revalidation of base {} failed: {}", slot.base, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordination::MemoryEnsemble;
    use std::time::Duration;

    async fn manager(ensemble: &MemoryEnsemble, peer: &str) -> (ElectionManager, SessionId) {
        let client = Arc::new(ensemble.client());
        let session = client.connect().await.unwrap();
        (
            ElectionManager::new(PeerId::from(peer), client, 30_000),
            session,
        )
    }

    async fn wait_for_status(
        manager: &ElectionManager,
        base: &BaseId,
        expected: ElectionStatus,
    ) {
        for _ in 0..200 {
            if manager.status(base).await == expected {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!(
            "base {} never reached {:?} (currently {:?})",
            base,
            expected,
            manager.status(base).await
        );
    }

    #[tokio::test]
    async fn test_single_candidate_becomes_leader() {
        let ensemble = MemoryEnsemble::new();
        let (m, _) = manager(&ensemble, "peer-1").await;
        let base = BaseId::from("base-1");

        let status = m.request_leadership(&base).await.unwrap();
        assert_eq!(status, ElectionStatus::Leader);

        let record = m.stat(&base).await.unwrap();
        assert_eq!(record.state, ElectionState::Leader);
        assert_eq!(record.generation, 1);
        assert_eq!(record.leader, Some(PeerId::from("peer-1")));
    }

    #[tokio::test]
    async fn test_two_peers_one_leader_one_follower() {
        let ensemble = MemoryEnsemble::new();
        let (a, _) = manager(&ensemble, "peer-a").await;
        let (b, _) = manager(&ensemble, "peer-b").await;
        let base = BaseId::from("base-1");

        // Concurrent requests: exactly one leader, the other a follower
        let (ra, rb) = tokio::join!(a.request_leadership(&base), b.request_leadership(&base));
        let statuses = [ra.unwrap(), rb.unwrap()];
        assert!(statuses.contains(&ElectionStatus::Leader));
        assert!(statuses.contains(&ElectionStatus::Follower));

        let leaders = [a.stat(&base).await.unwrap(), b.stat(&base).await.unwrap()]
            .iter()
            .filter(|r| r.state == ElectionState::Leader)
            .count();
        assert_eq!(leaders, 1);
    }

    #[tokio::test]
    async fn test_resign_is_idempotent() {
        let ensemble = MemoryEnsemble::new();
        let (m, _) = manager(&ensemble, "peer-1").await;
        let base = BaseId::from("base-1");

        m.request_leadership(&base).await.unwrap();
        m.resign(&base).await.unwrap();
        assert_eq!(m.status(&base).await, ElectionStatus::None);
        // Second resign is a successful no-op
        m.resign(&base).await.unwrap();
        assert_eq!(m.status(&base).await, ElectionStatus::None);
        // Resigning a base never requested is also a no-op
        m.resign(&BaseId::from("never-seen")).await.unwrap();
    }

    #[tokio::test]
    async fn test_resign_hands_leadership_to_follower() {
        let ensemble = MemoryEnsemble::new();
        let (a, _) = manager(&ensemble, "peer-a").await;
        let (b, _) = manager(&ensemble, "peer-b").await;
        let base = BaseId::from("base-1");

        a.request_leadership(&base).await.unwrap();
        let status = b.request_leadership(&base).await.unwrap();
        assert_eq!(status, ElectionStatus::Follower);

        a.resign(&base).await.unwrap();
        wait_for_status(&b, &base, ElectionStatus::Leader).await;
        let record = b.stat(&base).await.unwrap();
        assert_eq!(record.generation, 2);
    }

    #[tokio::test]
    async fn test_session_expiry_demotes_before_successor() {
        let ensemble = MemoryEnsemble::new();
        let (a, session_a) = manager(&ensemble, "peer-a").await;
        let (b, _) = manager(&ensemble, "peer-b").await;
        let base = BaseId::from("base-1");

        a.request_leadership(&base).await.unwrap();
        b.request_leadership(&base).await.unwrap();
        let before = a.stat(&base).await.unwrap().generation;

        ensemble.expire_session(session_a).await;

        // The expired leader drains to NONE with its generation preserved
        wait_for_status(&a, &base, ElectionStatus::None).await;
        assert_eq!(a.stat(&base).await.unwrap().generation, before);

        // Exactly one remaining peer takes over at generation + 1
        wait_for_status(&b, &base, ElectionStatus::Leader).await;
        assert_eq!(b.stat(&base).await.unwrap().generation, before + 1);
    }

    #[tokio::test]
    async fn test_force_reset_advances_generation() {
        let ensemble = MemoryEnsemble::new();
        let (m, _) = manager(&ensemble, "peer-1").await;
        let base = BaseId::from("base-1");

        m.request_leadership(&base).await.unwrap();
        let before = m.stat(&base).await.unwrap().generation;

        let after = m.force_reset(&base).await.unwrap();
        assert!(after > before);

        let record = m.stat(&base).await.unwrap();
        assert_eq!(record.state, ElectionState::None);
        assert!(record.generation >= before);
    }

    #[tokio::test]
    async fn test_force_reset_unknown_base() {
        let ensemble = MemoryEnsemble::new();
        let (m, _) = manager(&ensemble, "peer-1").await;
        assert!(matches!(
            m.force_reset(&BaseId::from("nope")).await,
            Err(Error::BaseNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_smudge_delete_leader_reconverges() {
        let ensemble = MemoryEnsemble::new();
        let (a, _) = manager(&ensemble, "peer-a").await;
        let (b, _) = manager(&ensemble, "peer-b").await;
        let (c, _) = manager(&ensemble, "peer-c").await;
        let base = BaseId::from("base-1");

        a.request_leadership(&base).await.unwrap();
        b.request_leadership(&base).await.unwrap();
        c.request_leadership(&base).await.unwrap();
        let before = a.stat(&base).await.unwrap().generation;

        a.smudge(&base, SmudgeMode::DeleteLeader).await.unwrap();

        // The old leader loses its node and demotes; the next candidate
        // takes over with generation incremented by exactly one
        wait_for_status(&a, &base, ElectionStatus::None).await;
        wait_for_status(&b, &base, ElectionStatus::Leader).await;
        assert_eq!(b.stat(&base).await.unwrap().generation, before + 1);
        assert_eq!(c.status(&base).await, ElectionStatus::Follower);
    }

    #[tokio::test]
    async fn test_smudge_corrupt_reconverges() {
        let ensemble = MemoryEnsemble::new();
        let (a, _) = manager(&ensemble, "peer-a").await;
        let (b, _) = manager(&ensemble, "peer-b").await;
        let base = BaseId::from("base-1");

        a.request_leadership(&base).await.unwrap();
        b.request_leadership(&base).await.unwrap();

        a.smudge(&base, SmudgeMode::Corrupt).await.unwrap();

        // Ordering was swapped: the former follower now holds the lowest
        // effective sequence and claims leadership
        wait_for_status(&b, &base, ElectionStatus::Leader).await;
        wait_for_status(&a, &base, ElectionStatus::Follower).await;
    }

    #[tokio::test]
    async fn test_request_on_held_base_returns_status() {
        let ensemble = MemoryEnsemble::new();
        let (m, _) = manager(&ensemble, "peer-1").await;
        let base = BaseId::from("base-1");

        assert_eq!(
            m.request_leadership(&base).await.unwrap(),
            ElectionStatus::Leader
        );
        // Second request does not create a second candidate node
        assert_eq!(
            m.request_leadership(&base).await.unwrap(),
            ElectionStatus::Leader
        );
        let record = m.stat(&base).await.unwrap();
        assert_eq!(record.peers.len(), 1);
    }

    #[tokio::test]
    async fn test_suspension_blocks_new_leadership() {
        let ensemble = MemoryEnsemble::new();
        let (m, _) = manager(&ensemble, "peer-1").await;
        let base = BaseId::from("base-1");

        ensemble.set_unavailable(true).await;
        // Let the suspension event reach the session loop
        tokio::time::sleep(Duration::from_millis(20)).await;

        let err = m.request_leadership(&base).await.unwrap_err();
        assert!(err.is_retryable());

        ensemble.set_unavailable(false).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(
            m.request_leadership(&base).await.unwrap(),
            ElectionStatus::Leader
        );
    }

    #[tokio::test]
    async fn test_dump_lists_each_base_once() {
        let ensemble = MemoryEnsemble::new();
        let (m, _) = manager(&ensemble, "peer-1").await;

        for i in 0..5 {
            m.request_leadership(&BaseId::new(format!("base-{}", i)))
                .await
                .unwrap();
        }
        let dump = m.dump().await;
        assert_eq!(dump.len(), 5);
        let mut ids: Vec<_> = dump.iter().map(|r| r.base.clone()).collect();
        ids.dedup();
        assert_eq!(ids.len(), 5);
        // Ordered by base id
        let mut sorted = ids.clone();
        sorted.sort();
        assert_eq!(ids, sorted);
    }
}
