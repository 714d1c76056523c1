//! Decay Engine.
//!
//! Periodically lowers every episode's accessibility score as time passes
//! without a read, more slowly for emotionally salient episodes.
//!
//! ## Model
//!
//! For each eligible record:
//!
//! ```text
//! anchor    = max(last_accessed_at, decayed_at)
//! Δt        = max(now − anchor, 0)                       (seconds)
//! score'    = score × exp(−k × (1 − w × |polarity|) × Δt)
//! ```
//!
//! `k` is the base decay rate and `w ∈ [0, 1]` the valence weight.  Writing
//! `decayed_at = now` with every update moves the anchor forward, so a second
//! cycle at the same instant sees `Δt = 0` and leaves the score untouched.
//!
//! ## Lifecycle
//!
//! [`DecayEngine::start`] spawns one background task bound to a
//! [`CancellationToken`] and returns a [`DecayHandle`].  Calling `start` again
//! while that task is alive returns the same handle.  [`DecayHandle::stop`]
//! cancels the token and waits, up to the caller's deadline, for the
//! in-flight cycle to finish.  The cycle checks the token between records, so
//! shutdown never leaves one record half-written.
//!
//! Reads that touch `last_accessed_at` are not isolated from a running cycle;
//! a cycle may use a slightly stale access time and decay that record a little
//! more than necessary.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use cogmem_types::PartitionContext;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::context::CallContext;
use crate::episodic::{DecayCandidate, EpisodicStore, StoreError};

// ─────────────────────────────────────────────────────────────────────────────
// Error type
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Error, Debug)]
pub enum DecayError {
    #[error("Invalid decay configuration: {0}")]
    InvalidConfig(String),
    #[error("Decay store error: {0}")]
    Store(#[from] StoreError),
    #[error("Decay task did not stop within {0:?}")]
    StopTimeout(Duration),
}

// ─────────────────────────────────────────────────────────────────────────────
// Configuration
// ─────────────────────────────────────────────────────────────────────────────

/// Numerical and scheduling parameters of the decay engine.
#[derive(Debug, Clone)]
pub struct DecayConfig {
    /// Base decay rate `k` (per second).
    pub base_rate: f64,
    /// Valence weight `w` in `[0, 1]`.
    pub valence_weight: f64,
    /// Time between two cycles.
    pub interval: Duration,
    /// Restrict sweeps to one partition; `None` sweeps every record.
    pub scope: Option<PartitionContext>,
    /// Deadline for each store call a cycle makes.
    pub op_timeout: Duration,
}

impl Default for DecayConfig {
    fn default() -> Self {
        Self {
            base_rate: 1e-6,
            valence_weight: 0.5,
            interval: Duration::from_secs(3600),
            scope: None,
            op_timeout: Duration::from_secs(5),
        }
    }
}

impl DecayConfig {
    pub fn validate(&self) -> Result<(), DecayError> {
        if !self.base_rate.is_finite() || self.base_rate < 0.0 {
            return Err(DecayError::InvalidConfig(format!(
                "base rate must be finite and ≥ 0, got {}",
                self.base_rate
            )));
        }
        if !(0.0..=1.0).contains(&self.valence_weight) {
            return Err(DecayError::InvalidConfig(format!(
                "valence weight must be in [0, 1], got {}",
                self.valence_weight
            )));
        }
        if self.interval.is_zero() {
            return Err(DecayError::InvalidConfig("interval must be positive".into()));
        }
        Ok(())
    }
}

/// Apply the decay model to one score.
///
/// The result is never negative and never above `score`.
pub fn decayed_score(
    score: f64,
    polarity: f64,
    elapsed_secs: f64,
    base_rate: f64,
    valence_weight: f64,
) -> f64 {
    let elapsed = elapsed_secs.max(0.0);
    let salience = polarity.abs().min(1.0);
    let rate = base_rate * (1.0 - valence_weight * salience);
    let next = score * (-rate * elapsed).exp();
    next.clamp(0.0, score.max(0.0))
}

fn elapsed_secs(from: DateTime<Utc>, to: DateTime<Utc>) -> f64 {
    let delta = to - from;
    match delta.num_microseconds() {
        Some(us) => us as f64 / 1e6,
        None => delta.num_seconds() as f64,
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Cycle
// ─────────────────────────────────────────────────────────────────────────────

/// Outcome of one decay cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    /// Records read from the store.
    pub examined: usize,
    /// Records whose score was rewritten.
    pub updated: usize,
    /// Records with nothing to decay (no time elapsed since the anchor).
    pub unchanged: usize,
    /// Records whose update failed and were skipped.
    pub failed: usize,
    /// `true` when cancellation stopped the cycle before the last record.
    pub interrupted: bool,
}

/// The part of the engine the background task owns.
#[derive(Clone)]
struct Sweeper {
    store: Arc<dyn EpisodicStore>,
    config: DecayConfig,
}

impl Sweeper {
    async fn cycle(
        &self,
        now: DateTime<Utc>,
        cancel: Option<&CancellationToken>,
    ) -> Result<CycleReport, DecayError> {
        let ctx = CallContext::with_timeout(self.config.op_timeout);
        let candidates = self
            .store
            .decay_candidates(&ctx, self.config.scope.as_ref())
            .await?;

        let mut report = CycleReport {
            examined: candidates.len(),
            ..CycleReport::default()
        };
        for candidate in candidates {
            if cancel.is_some_and(CancellationToken::is_cancelled) {
                report.interrupted = true;
                break;
            }
            match self.decay_one(&candidate, now).await {
                Ok(true) => report.updated += 1,
                Ok(false) => report.unchanged += 1,
                Err(e) => {
                    report.failed += 1;
                    warn!(episode_id = %candidate.id, error = %e, "decay update failed; skipping record");
                }
            }
        }
        debug!(
            examined = report.examined,
            updated = report.updated,
            unchanged = report.unchanged,
            failed = report.failed,
            interrupted = report.interrupted,
            "decay cycle finished"
        );
        Ok(report)
    }

    async fn decay_one(&self, c: &DecayCandidate, now: DateTime<Utc>) -> Result<bool, StoreError> {
        let anchor = c.decayed_at.map_or(c.last_accessed_at, |d| d.max(c.last_accessed_at));
        let elapsed = elapsed_secs(anchor, now);
        if elapsed <= 0.0 {
            return Ok(false);
        }
        let next = decayed_score(
            c.accessibility_score,
            c.polarity,
            elapsed,
            self.config.base_rate,
            self.config.valence_weight,
        );
        let ctx = CallContext::with_timeout(self.config.op_timeout);
        self.store.set_accessibility(&ctx, c.id, next, now).await?;
        Ok(true)
    }

    async fn run(self, cancel: CancellationToken, done: watch::Sender<bool>) {
        let start = tokio::time::Instant::now() + self.config.interval;
        let mut ticker = tokio::time::interval_at(start, self.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.cycle(Utc::now(), Some(&cancel)).await {
                        warn!(error = %e, "decay cycle failed; retrying next interval");
                    }
                }
            }
        }
        info!("decay engine stopped");
        let _ = done.send(true);
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Handle
// ─────────────────────────────────────────────────────────────────────────────

/// Observable lifecycle state of a [`DecayEngine`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Idle,
    Running,
}

/// Stop handle for a running decay task.  Cloning shares the same task.
#[derive(Debug, Clone)]
pub struct DecayHandle {
    generation: u64,
    cancel: CancellationToken,
    done: watch::Receiver<bool>,
}

impl DecayHandle {
    /// Identifies the task this handle controls; a restarted engine hands out
    /// a new generation.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// `true` once the task has exited.
    pub fn is_finished(&self) -> bool {
        // A dropped sender means the task is gone, even without a final send.
        *self.done.borrow() || self.done.has_changed().is_err()
    }

    /// Signal cancellation and wait up to `deadline` for the in-flight cycle
    /// to complete.
    pub async fn stop(&self, deadline: Duration) -> Result<(), DecayError> {
        self.cancel.cancel();
        let mut done = self.done.clone();
        match tokio::time::timeout(deadline, done.wait_for(|finished| *finished)).await {
            // A closed channel means the task is gone as well.
            Ok(_) => Ok(()),
            Err(_) => Err(DecayError::StopTimeout(deadline)),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// DecayEngine
// ─────────────────────────────────────────────────────────────────────────────

struct Running {
    handle: DecayHandle,
    _task: JoinHandle<()>,
}

/// Owns the decay schedule for one store.
///
/// There is no process-wide engine; whoever builds a `DecayEngine` owns its
/// lifecycle.
pub struct DecayEngine {
    sweeper: Sweeper,
    running: Mutex<Option<Running>>,
    generation: AtomicU64,
}

impl DecayEngine {
    pub fn new(store: Arc<dyn EpisodicStore>, config: DecayConfig) -> Result<Self, DecayError> {
        config.validate()?;
        Ok(Self {
            sweeper: Sweeper { store, config },
            running: Mutex::new(None),
            generation: AtomicU64::new(0),
        })
    }

    pub fn config(&self) -> &DecayConfig {
        &self.sweeper.config
    }

    /// Start the periodic cycle, or return the handle of the one already
    /// running.  Must be called from within a tokio runtime.
    pub fn start(&self) -> DecayHandle {
        let mut running = self.running.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(current) = running.as_ref()
            && !current.handle.cancel.is_cancelled()
            && !current.handle.is_finished()
        {
            return current.handle.clone();
        }

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let cancel = CancellationToken::new();
        let (done_tx, done_rx) = watch::channel(false);
        let handle = DecayHandle {
            generation,
            cancel: cancel.clone(),
            done: done_rx,
        };
        info!(
            generation,
            interval_secs = self.sweeper.config.interval.as_secs_f64(),
            base_rate = self.sweeper.config.base_rate,
            valence_weight = self.sweeper.config.valence_weight,
            "decay engine started"
        );
        let task = tokio::spawn(self.sweeper.clone().run(cancel, done_tx));
        *running = Some(Running {
            handle: handle.clone(),
            _task: task,
        });
        handle
    }

    /// Stop the running task, if any.  Idle engines return immediately.
    pub async fn stop(&self, deadline: Duration) -> Result<(), DecayError> {
        let current = self
            .running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(current) = current else {
            return Ok(());
        };
        let result = current.handle.stop(deadline).await;
        if result.is_err() {
            // Still draining; keep it visible as running.
            let mut running = self.running.lock().unwrap_or_else(PoisonError::into_inner);
            if running.is_none() {
                *running = Some(current);
            }
        }
        result
    }

    pub fn state(&self) -> EngineState {
        let running = self.running.lock().unwrap_or_else(PoisonError::into_inner);
        match running.as_ref() {
            Some(current) if !current.handle.is_finished() => EngineState::Running,
            _ => EngineState::Idle,
        }
    }

    /// Run one cycle now, outside the schedule.
    pub async fn run_cycle(&self) -> Result<CycleReport, DecayError> {
        self.sweeper.cycle(Utc::now(), None).await
    }

    /// Run one cycle as if the clock read `now`.
    pub async fn run_cycle_at(&self, now: DateTime<Utc>) -> Result<CycleReport, DecayError> {
        self.sweeper.cycle(now, None).await
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::episodic::{RecentWindow, SqliteEpisodicStore, StoreOptions};
    use async_trait::async_trait;
    use chrono::TimeDelta;
    use cogmem_types::{Episode, ShareScope, ValenceScore};
    use std::sync::atomic::AtomicUsize;
    use uuid::Uuid;

    fn memory_store() -> Arc<SqliteEpisodicStore> {
        Arc::new(SqliteEpisodicStore::open_in_memory(StoreOptions::with_dim(2)).unwrap())
    }

    async fn put(
        store: &dyn EpisodicStore,
        owner: Uuid,
        polarity: f64,
        at: DateTime<Utc>,
    ) -> Uuid {
        let ep = Episode::new(owner, None, "remember this", vec![1.0, 0.0], at, ShareScope::Owner)
            .with_valence(ValenceScore::new(polarity, 0.0, 0.0));
        store
            .save(&CallContext::background(), &PartitionContext::owner(owner), &ep)
            .await
            .unwrap();
        ep.id
    }

    async fn score_of(store: &dyn EpisodicStore, owner: Uuid, id: Uuid) -> f64 {
        store
            .find_by_id(&CallContext::background(), id, &PartitionContext::owner(owner))
            .await
            .unwrap()
            .accessibility_score
    }

    fn config(k: f64, w: f64) -> DecayConfig {
        DecayConfig {
            base_rate: k,
            valence_weight: w,
            ..DecayConfig::default()
        }
    }

    // ── decayed_score ────────────────────────────────────────────────────────

    #[test]
    fn zero_elapsed_keeps_score() {
        assert_eq!(decayed_score(0.7, 0.3, 0.0, 1e-3, 0.5), 0.7);
        assert_eq!(decayed_score(0.7, 0.3, -50.0, 1e-3, 0.5), 0.7);
    }

    #[test]
    fn full_salience_with_full_weight_does_not_decay() {
        assert_eq!(decayed_score(1.0, -1.0, 1e9, 1e-3, 1.0), 1.0);
    }

    #[test]
    fn salient_episodes_decay_slower() {
        let salient = decayed_score(1.0, 0.9, 1_000_000.0, 1e-7, 0.8);
        let flat = decayed_score(1.0, 0.0, 1_000_000.0, 1e-7, 0.8);
        assert!(salient > flat);
        assert!((flat - (-0.1f64).exp()).abs() < 1e-12);
    }

    #[test]
    fn score_never_goes_negative() {
        let s = decayed_score(1.0, 0.0, f64::MAX, 1.0, 0.0);
        assert!(s >= 0.0);
    }

    #[test]
    fn config_validation() {
        assert!(config(1e-6, 0.5).validate().is_ok());
        assert!(config(-1.0, 0.5).validate().is_err());
        assert!(config(f64::NAN, 0.5).validate().is_err());
        assert!(config(1e-6, 1.5).validate().is_err());
        let zero_interval = DecayConfig {
            interval: Duration::ZERO,
            ..DecayConfig::default()
        };
        assert!(matches!(
            zero_interval.validate(),
            Err(DecayError::InvalidConfig(_))
        ));
    }

    // ── cycles ───────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn high_polarity_retains_more_accessibility() {
        let store = memory_store();
        let owner = Uuid::new_v4();
        let t0 = Utc::now();
        let a = put(store.as_ref(), owner, 0.9, t0).await;
        let b = put(store.as_ref(), owner, 0.0, t0).await;

        let engine = DecayEngine::new(store.clone(), config(1e-7, 0.8)).unwrap();
        let report = engine
            .run_cycle_at(t0 + TimeDelta::seconds(1_000_000))
            .await
            .unwrap();
        assert_eq!(report.updated, 2);

        let sa = score_of(store.as_ref(), owner, a).await;
        let sb = score_of(store.as_ref(), owner, b).await;
        assert!(sa > sb, "{sa} should exceed {sb}");
        assert!(sa < 1.0);
    }

    #[tokio::test]
    async fn repeated_cycle_at_same_instant_is_idempotent() {
        let store = memory_store();
        let owner = Uuid::new_v4();
        let t0 = Utc::now() - TimeDelta::hours(2);
        let id = put(store.as_ref(), owner, 0.2, t0).await;
        let engine = DecayEngine::new(store.clone(), config(1e-4, 0.5)).unwrap();

        let now = t0 + TimeDelta::hours(1);
        engine.run_cycle_at(now).await.unwrap();
        let once = score_of(store.as_ref(), owner, id).await;
        let report = engine.run_cycle_at(now).await.unwrap();
        let twice = score_of(store.as_ref(), owner, id).await;

        assert_eq!(once, twice);
        assert_eq!(report.unchanged, 1);
        assert_eq!(report.updated, 0);
    }

    #[tokio::test]
    async fn cycles_never_raise_scores() {
        let store = memory_store();
        let owner = Uuid::new_v4();
        let t0 = Utc::now() - TimeDelta::days(3);
        let ids = [
            put(store.as_ref(), owner, -0.8, t0).await,
            put(store.as_ref(), owner, 0.1, t0).await,
            put(store.as_ref(), owner, 0.5, t0).await,
        ];
        let engine = DecayEngine::new(store.clone(), config(1e-5, 0.6)).unwrap();

        let mut previous = vec![1.0; ids.len()];
        for step in 1..=4 {
            engine
                .run_cycle_at(t0 + TimeDelta::hours(6 * step))
                .await
                .unwrap();
            for (i, id) in ids.iter().enumerate() {
                let now = score_of(store.as_ref(), owner, *id).await;
                assert!(now <= previous[i]);
                assert!(now >= 0.0);
                previous[i] = now;
            }
        }
    }

    #[tokio::test]
    async fn scoped_engine_leaves_other_partitions_alone() {
        let store = memory_store();
        let (alice, bob) = (Uuid::new_v4(), Uuid::new_v4());
        let t0 = Utc::now() - TimeDelta::days(1);
        let a = put(store.as_ref(), alice, 0.0, t0).await;
        let b = put(store.as_ref(), bob, 0.0, t0).await;
        let engine = DecayEngine::new(
            store.clone(),
            DecayConfig {
                scope: Some(PartitionContext::owner(alice)),
                ..config(1e-4, 0.5)
            },
        )
        .unwrap();
        engine.run_cycle().await.unwrap();
        assert!(score_of(store.as_ref(), alice, a).await < 1.0);
        assert_eq!(score_of(store.as_ref(), bob, b).await, 1.0);
    }

    /// Delegates to SQLite, optionally refusing to update one record and
    /// holding every score write for `write_delay`.
    struct FlakyStore {
        inner: Arc<SqliteEpisodicStore>,
        poisoned: Option<Uuid>,
        write_delay: Duration,
        writes_started: AtomicUsize,
    }

    impl FlakyStore {
        fn new(inner: Arc<SqliteEpisodicStore>) -> Self {
            Self {
                inner,
                poisoned: None,
                write_delay: Duration::ZERO,
                writes_started: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl EpisodicStore for FlakyStore {
        fn embedding_dim(&self) -> usize {
            self.inner.embedding_dim()
        }
        async fn save(&self, ctx: &CallContext, p: &PartitionContext, e: &Episode) -> Result<(), StoreError> {
            self.inner.save(ctx, p, e).await
        }
        async fn find_by_id(&self, ctx: &CallContext, id: Uuid, p: &PartitionContext) -> Result<Episode, StoreError> {
            self.inner.find_by_id(ctx, id, p).await
        }
        async fn find_recent_in(
            &self,
            ctx: &CallContext,
            w: &RecentWindow,
            limit: usize,
            p: &PartitionContext,
        ) -> Result<Vec<Episode>, StoreError> {
            self.inner.find_recent_in(ctx, w, limit, p).await
        }
        async fn find_by_vector(
            &self,
            ctx: &CallContext,
            q: &[f32],
            limit: usize,
            p: &PartitionContext,
        ) -> Result<Vec<(Episode, f32)>, StoreError> {
            self.inner.find_by_vector(ctx, q, limit, p).await
        }
        async fn touch(&self, ctx: &CallContext, ids: &[Uuid], at: DateTime<Utc>, p: &PartitionContext) -> Result<usize, StoreError> {
            self.inner.touch(ctx, ids, at, p).await
        }
        async fn delete(&self, ctx: &CallContext, id: Uuid, p: &PartitionContext) -> Result<(), StoreError> {
            self.inner.delete(ctx, id, p).await
        }
        async fn decay_candidates(
            &self,
            ctx: &CallContext,
            scope: Option<&PartitionContext>,
        ) -> Result<Vec<DecayCandidate>, StoreError> {
            self.inner.decay_candidates(ctx, scope).await
        }
        async fn set_accessibility(
            &self,
            ctx: &CallContext,
            id: Uuid,
            score: f64,
            at: DateTime<Utc>,
        ) -> Result<(), StoreError> {
            self.writes_started.fetch_add(1, Ordering::SeqCst);
            if self.poisoned == Some(id) {
                return Err(StoreError::Join("connection reset".into()));
            }
            tokio::time::sleep(self.write_delay).await;
            self.inner.set_accessibility(ctx, id, score, at).await
        }
    }

    #[tokio::test]
    async fn failed_record_does_not_abort_the_sweep() {
        let inner = memory_store();
        let owner = Uuid::new_v4();
        let t0 = Utc::now() - TimeDelta::days(1);
        let bad = put(inner.as_ref(), owner, 0.0, t0).await;
        let good = put(inner.as_ref(), owner, 0.0, t0).await;
        let store = Arc::new(FlakyStore {
            poisoned: Some(bad),
            ..FlakyStore::new(inner.clone())
        });

        let engine = DecayEngine::new(store, config(1e-4, 0.5)).unwrap();
        let report = engine.run_cycle().await.unwrap();
        assert_eq!(report.examined, 2);
        assert_eq!(report.failed, 1);
        assert_eq!(report.updated, 1);
        assert_eq!(score_of(inner.as_ref(), owner, bad).await, 1.0);
        assert!(score_of(inner.as_ref(), owner, good).await < 1.0);
    }

    // ── lifecycle ────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn start_twice_returns_the_same_handle() {
        let engine = DecayEngine::new(memory_store(), config(1e-6, 0.5)).unwrap();
        assert_eq!(engine.state(), EngineState::Idle);

        let first = engine.start();
        let second = engine.start();
        assert_eq!(first.generation(), second.generation());
        assert_eq!(engine.state(), EngineState::Running);

        engine.stop(Duration::from_secs(2)).await.unwrap();
        assert_eq!(engine.state(), EngineState::Idle);
        assert!(first.is_finished());

        let third = engine.start();
        assert_ne!(third.generation(), first.generation());
        third.stop(Duration::from_secs(2)).await.unwrap();
        assert_eq!(engine.state(), EngineState::Idle);
    }

    #[tokio::test]
    async fn stopping_an_idle_engine_is_a_no_op() {
        let engine = DecayEngine::new(memory_store(), config(1e-6, 0.5)).unwrap();
        engine.stop(Duration::from_millis(10)).await.unwrap();
        assert_eq!(engine.state(), EngineState::Idle);
    }

    #[tokio::test]
    async fn background_task_decays_on_schedule() {
        let store = memory_store();
        let owner = Uuid::new_v4();
        let id = put(store.as_ref(), owner, 0.0, Utc::now() - TimeDelta::hours(1)).await;
        let engine = DecayEngine::new(
            store.clone(),
            DecayConfig {
                interval: Duration::from_millis(20),
                ..config(1e-3, 0.5)
            },
        )
        .unwrap();

        let handle = engine.start();
        tokio::time::sleep(Duration::from_millis(150)).await;
        handle.stop(Duration::from_secs(2)).await.unwrap();

        assert!(score_of(store.as_ref(), owner, id).await < 1.0);
    }

    #[tokio::test]
    async fn stop_waits_for_the_in_flight_write() {
        let inner = memory_store();
        let owner = Uuid::new_v4();
        let t0 = Utc::now() - TimeDelta::hours(1);
        for _ in 0..3 {
            put(inner.as_ref(), owner, 0.0, t0).await;
        }
        let store = Arc::new(FlakyStore {
            write_delay: Duration::from_millis(200),
            ..FlakyStore::new(inner.clone())
        });
        let engine = DecayEngine::new(
            store.clone(),
            DecayConfig {
                interval: Duration::from_millis(10),
                ..config(1e-3, 0.5)
            },
        )
        .unwrap();

        let handle = engine.start();
        tokio::time::timeout(Duration::from_secs(2), async {
            while store.writes_started.load(Ordering::SeqCst) == 0 {
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
        })
        .await
        .expect("first write never started");

        // The write is still sleeping, so a short deadline expires.
        let err = handle.stop(Duration::from_millis(1)).await.unwrap_err();
        assert!(matches!(err, DecayError::StopTimeout(_)));
        assert_eq!(engine.state(), EngineState::Running);

        engine.stop(Duration::from_secs(2)).await.unwrap();
        assert_eq!(engine.state(), EngineState::Idle);
        assert!(handle.is_finished());

        // Cancellation is honoured between records: the in-flight write
        // landed whole and nothing after it started.
        assert_eq!(store.writes_started.load(Ordering::SeqCst), 1);
        let rows = inner
            .decay_candidates(&CallContext::background(), Some(&PartitionContext::owner(owner)))
            .await
            .unwrap();
        assert_eq!(rows.len(), 3);
        for row in &rows {
            assert_eq!(row.decayed_at.is_some(), row.accessibility_score < 1.0);
        }
        assert_eq!(rows.iter().filter(|r| r.decayed_at.is_some()).count(), 1);
    }
}
