//! Harassment Driver
//!
//! Concurrent chaos workload against the election manager: many workers
//! acquire, hold and release leadership across a pool of bases on several
//! simulated peers, injecting session expiry and smudges at a configured
//! churn rate. A central observer continuously samples record dumps and
//! asserts the split-brain and generation-monotonicity invariants; every
//! violation is recorded with the base, generation and implicated peers.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use rand::Rng;
use tokio_util::sync::CancellationToken;

use crate::config::HarassSettings;
use crate::coordination::{
    Coordinator, MemoryCoordinator, MemoryEnsemble, RateLimitedCoordinator,
};
use crate::election::{
    BaseId, ElectionManager, ElectionState, ElectionStatus, Generation, PeerId, SmudgeMode,
};
use crate::error::{Error, Result};

/// Harassment run parameters
#[derive(Debug, Clone)]
pub struct HarassConfig {
    /// Size of the base pool workers pick from
    pub bases: usize,
    /// Number of concurrent workers
    pub workers: usize,
    /// Number of simulated peers sharing the ensemble
    pub peers: usize,
    /// Total run duration
    pub duration: Duration,
    /// Probability in [0,1] that a successful acquisition ends in a fault
    pub churn_rate: f64,
    /// Upper bound on acceptable post-churn convergence time
    pub convergence_bound: Duration,
}

impl HarassConfig {
    pub fn from_settings(settings: &HarassSettings) -> Self {
        Self {
            bases: settings.bases,
            workers: settings.workers,
            peers: settings.peers,
            duration: Duration::from_secs(settings.duration_secs),
            churn_rate: settings.churn_rate,
            convergence_bound: Duration::from_millis(settings.convergence_bound_ms),
        }
    }
}

/// A recorded invariant violation
#[derive(Debug, Clone)]
pub struct Violation {
    pub base: BaseId,
    pub generation: Generation,
    pub leaders: Vec<PeerId>,
    pub detail: String,
}

/// Distribution of post-churn convergence times
#[derive(Debug, Clone, Default)]
pub struct ConvergenceStats {
    pub samples: usize,
    pub min_ms: u64,
    pub mean_ms: u64,
    pub max_ms: u64,
    /// Churn events whose convergence exceeded the configured bound
    pub exceeded: usize,
}

impl ConvergenceStats {
    fn from_samples(samples: &[u64], exceeded: usize) -> Self {
        if samples.is_empty() {
            return Self {
                exceeded,
                ..Self::default()
            };
        }
        let sum: u64 = samples.iter().sum();
        Self {
            samples: samples.len(),
            min_ms: *samples.iter().min().expect("nonempty"),
            mean_ms: sum / samples.len() as u64,
            max_ms: *samples.iter().max().expect("nonempty"),
            exceeded,
        }
    }
}

/// Summary of a harassment run
#[derive(Debug, Clone)]
pub struct HarassReport {
    pub elections_attempted: u64,
    pub elections_per_sec: f64,
    pub churn_events: u64,
    pub convergence: ConvergenceStats,
    pub violations: Vec<Violation>,
}

impl HarassReport {
    /// A run passes iff no invariant was violated and every churn event
    /// converged within the bound
    pub fn passed(&self) -> bool {
        self.violations.is_empty() && self.convergence.exceeded == 0
    }
}

impl std::fmt::Display for HarassReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "elections attempted:  {}", self.elections_attempted)?;
        writeln!(f, "elections/sec:        {:.1}", self.elections_per_sec)?;
        writeln!(f, "churn events:         {}", self.churn_events)?;
        if self.convergence.samples > 0 {
            writeln!(
                f,
                "convergence ms:       min {} / mean {} / max {} ({} samples)",
                self.convergence.min_ms,
                self.convergence.mean_ms,
                self.convergence.max_ms,
                self.convergence.samples
            )?;
        } else {
            writeln!(f, "convergence ms:       no churn events sampled")?;
        }
        writeln!(f, "bound exceeded:       {}", self.convergence.exceeded)?;
        writeln!(f, "invariant violations: {}", self.violations.len())?;
        for violation in &self.violations {
            writeln!(
                f,
                "  base {} generation {} leaders {:?}: {}",
                violation.base, violation.generation, violation.leaders, violation.detail
            )?;
        }
        Ok(())
    }
}

struct PeerHandle {
    peer: PeerId,
    manager: ElectionManager,
    client: Arc<MemoryCoordinator>,
}

struct RunState {
    ensemble: MemoryEnsemble,
    peers: Vec<PeerHandle>,
    bases: Vec<BaseId>,
    config: HarassConfig,
    attempts: AtomicU64,
    churns: AtomicU64,
    convergence_ms: Mutex<Vec<u64>>,
    exceeded: AtomicUsize,
    violations: Mutex<Vec<Violation>>,
}

/// Run a harassment workload and report on it
pub async fn run(config: HarassConfig) -> Result<HarassReport> {
    let ensemble = MemoryEnsemble::new();
    let mut peers = Vec::with_capacity(config.peers);
    for i in 0..config.peers {
        let peer = PeerId::new(format!("peer-{}", i));
        let client = Arc::new(ensemble.client());
        client.connect().await?;
        // Managers run behind the same rate-limited, retrying wrapper the
        // control binaries use; the raw client stays around for injection
        let governed: Arc<dyn Coordinator> = Arc::new(RateLimitedCoordinator::new(
            client.clone(),
            64,
            Duration::from_millis(50),
            Duration::from_secs(5),
        ));
        let manager = ElectionManager::new(peer.clone(), governed, 30_000);
        peers.push(PeerHandle {
            peer,
            manager,
            client,
        });
    }
    let bases = (0..config.bases)
        .map(|i| BaseId::new(format!("base-{:04}", i)))
        .collect();

    let state = Arc::new(RunState {
        ensemble,
        peers,
        bases,
        config: config.clone(),
        attempts: AtomicU64::new(0),
        churns: AtomicU64::new(0),
        convergence_ms: Mutex::new(Vec::new()),
        exceeded: AtomicUsize::new(0),
        violations: Mutex::new(Vec::new()),
    });

    tracing::info!(
        "harassment run: {} bases, {} workers, {} peers, {:?}, churn {}",
        config.bases,
        config.workers,
        config.peers,
        config.duration,
        config.churn_rate
    );

    let deadline = Instant::now() + config.duration;
    let stop = CancellationToken::new();

    let observer = tokio::spawn(observe(Arc::clone(&state), stop.clone()));
    let mut workers = Vec::with_capacity(config.workers);
    for worker_id in 0..config.workers {
        workers.push(tokio::spawn(work(Arc::clone(&state), worker_id, deadline)));
    }

    for worker in workers {
        let _ = worker.await;
    }
    stop.cancel();
    let _ = observer.await;

    for handle in &state.peers {
        handle.manager.shutdown();
    }

    let attempts = state.attempts.load(Ordering::Relaxed);
    let samples = state.convergence_ms.lock().expect("poisoned").clone();
    let report = HarassReport {
        elections_attempted: attempts,
        elections_per_sec: attempts as f64 / config.duration.as_secs_f64(),
        churn_events: state.churns.load(Ordering::Relaxed),
        convergence: ConvergenceStats::from_samples(
            &samples,
            state.exceeded.load(Ordering::Relaxed),
        ),
        violations: state.violations.lock().expect("poisoned").clone(),
    };
    tracing::info!(
        "harassment run complete: {} attempts, {} churn events, {} violations",
        report.elections_attempted,
        report.churn_events,
        report.violations.len()
    );
    Ok(report)
}

#[derive(Debug, Clone, Copy)]
enum Fault {
    ExpireSession,
    SmudgeDeleteLeader,
    SmudgeCorrupt,
}

/// One worker loop: acquire, hold, then release or harass
async fn work(state: Arc<RunState>, worker_id: usize, deadline: Instant) {
    while Instant::now() < deadline {
        let (base_idx, peer_idx, hold_ms, churn, fault) = {
            let mut rng = rand::thread_rng();
            let fault = match rng.gen_range(0..3u8) {
                0 => Fault::ExpireSession,
                1 => Fault::SmudgeDeleteLeader,
                _ => Fault::SmudgeCorrupt,
            };
            (
                rng.gen_range(0..state.bases.len()),
                rng.gen_range(0..state.peers.len()),
                rng.gen_range(5..25u64),
                rng.gen::<f64>() < state.config.churn_rate,
                fault,
            )
        };
        let base = state.bases[base_idx].clone();
        let handle = &state.peers[peer_idx];

        state.attempts.fetch_add(1, Ordering::Relaxed);
        let status = match handle.manager.request_leadership(&base).await {
            Ok(status) => status,
            Err(e) => {
                tracing::debug!("worker {}: request on {} failed: {}", worker_id, base, e);
                continue;
            }
        };

        tokio::time::sleep(Duration::from_millis(hold_ms)).await;

        match status {
            ElectionStatus::Leader if churn => {
                state.churns.fetch_add(1, Ordering::Relaxed);
                inject_and_time(&state, peer_idx, &base, fault).await;
            }
            ElectionStatus::Leader | ElectionStatus::Follower => {
                let _ = handle.manager.resign(&base).await;
            }
            _ => {}
        }
    }
}

/// Inject one fault against a base we lead and measure re-convergence
async fn inject_and_time(state: &Arc<RunState>, peer_idx: usize, base: &BaseId, fault: Fault) {
    let handle = &state.peers[peer_idx];
    let before = handle
        .client
        .current_generation(base)
        .await
        .unwrap_or_default();

    match fault {
        Fault::ExpireSession => {
            let session = handle.client.session_id();
            state.ensemble.expire_session(session).await;
            // The peer rejoins with a fresh session; old sequence numbers
            // stay permanently invalid
            let _ = handle.client.connect().await;
        }
        Fault::SmudgeDeleteLeader => {
            let _ = handle.manager.smudge(base, SmudgeMode::DeleteLeader).await;
        }
        Fault::SmudgeCorrupt => {
            // Corrupting ordering needs at least two candidates to disorder;
            // otherwise fall back to deleting the leader node
            let candidates = handle
                .client
                .list_candidates(base)
                .await
                .unwrap_or_default();
            let mode = if candidates.len() >= 2 {
                SmudgeMode::Corrupt
            } else {
                SmudgeMode::DeleteLeader
            };
            let _ = handle.manager.smudge(base, mode).await;
        }
    }

    // Guarantee a successor candidacy exists, then wait for any peer to
    // lead the base at a later generation
    let started = Instant::now();
    let successor_idx = (peer_idx + 1) % state.peers.len();
    let _ = state.peers[successor_idx]
        .manager
        .request_leadership(base)
        .await;

    let give_up = state.config.convergence_bound * 4;
    loop {
        for peer in &state.peers {
            if let Ok(record) = peer.manager.stat(base).await {
                if record.state == ElectionState::Leader && record.generation > before {
                    let elapsed = started.elapsed();
                    if elapsed > state.config.convergence_bound {
                        state.exceeded.fetch_add(1, Ordering::Relaxed);
                    }
                    state
                        .convergence_ms
                        .lock()
                        .expect("poisoned")
                        .push(elapsed.as_millis() as u64);
                    return;
                }
            }
        }
        if started.elapsed() > give_up {
            tracing::warn!("base {} never reconverged after injected fault", base);
            state.exceeded.fetch_add(1, Ordering::Relaxed);
            return;
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
}

/// Central observer: samples dumps across all peers and asserts the
/// no-split-brain and generation-monotonicity invariants
async fn observe(state: Arc<RunState>, stop: CancellationToken) {
    let mut reported: HashSet<(BaseId, Generation)> = HashSet::new();
    let mut last_seen: HashMap<(usize, BaseId), Generation> = HashMap::new();

    loop {
        if stop.is_cancelled() {
            return;
        }

        let dumps =
            futures::future::join_all(state.peers.iter().map(|h| h.manager.dump())).await;

        // Invariant 1: at most one peer LEADER per (base, generation)
        let mut leaders: HashMap<(BaseId, Generation), Vec<PeerId>> = HashMap::new();
        for (peer_idx, dump) in dumps.iter().enumerate() {
            for record in dump {
                if record.state == ElectionState::Leader {
                    leaders
                        .entry((record.base.clone(), record.generation))
                        .or_default()
                        .push(state.peers[peer_idx].peer.clone());
                }
                // Invariant 2: a peer's generation for a base never decreases
                let key = (peer_idx, record.base.clone());
                if let Some(previous) = last_seen.get(&key) {
                    if record.generation < *previous {
                        record_violation(
                            &state,
                            &mut reported,
                            record.base.clone(),
                            record.generation,
                            vec![state.peers[peer_idx].peer.clone()],
                            format!(
                                "generation regressed from {} to {}",
                                previous, record.generation
                            ),
                        );
                    }
                }
                last_seen.insert(key, record.generation);
            }
        }
        for ((base, generation), peers) in leaders {
            if peers.len() > 1 {
                record_violation(
                    &state,
                    &mut reported,
                    base,
                    generation,
                    peers,
                    "multiple leaders at one generation (split-brain)".to_string(),
                );
            }
        }

        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

fn record_violation(
    state: &Arc<RunState>,
    reported: &mut HashSet<(BaseId, Generation)>,
    base: BaseId,
    generation: Generation,
    leaders: Vec<PeerId>,
    detail: String,
) {
    if !reported.insert((base.clone(), generation)) {
        return;
    }
    let violation = Error::InvariantViolation {
        base: base.clone(),
        generation,
        leaders: leaders.iter().map(|p| p.to_string()).collect(),
    };
    tracing::error!("{}: {}", violation, detail);
    state.violations.lock().expect("poisoned").push(Violation {
        base,
        generation,
        leaders,
        detail,
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_quiet_run_has_no_violations() {
        let report = run(HarassConfig {
            bases: 5,
            workers: 3,
            peers: 2,
            duration: Duration::from_millis(500),
            churn_rate: 0.0,
            convergence_bound: Duration::from_secs(2),
        })
        .await
        .unwrap();

        assert!(report.violations.is_empty());
        assert!(report.elections_attempted > 0);
        assert_eq!(report.churn_events, 0);
        assert!(report.passed());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_churny_run_converges_without_violations() {
        let report = run(HarassConfig {
            bases: 10,
            workers: 5,
            peers: 3,
            duration: Duration::from_secs(2),
            churn_rate: 0.2,
            convergence_bound: Duration::from_secs(2),
        })
        .await
        .unwrap();

        assert!(
            report.violations.is_empty(),
            "violations: {:?}",
            report.violations
        );
        assert!(report.elections_attempted > 0);
    }
}
