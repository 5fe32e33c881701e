//! Engine facade.
//!
//! Wires the store, dependency graph, queue, policy, producers, scheduler,
//! and warmer together behind one handle, and owns the background tasks
//! that drive them.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use time::OffsetDateTime;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::config::EngineConfig;
use crate::entry::Freshness;
use crate::error::EngineError;
use crate::graph::{DependencyGraph, RefreshMode, Target};
use crate::invalidate::{FanoutPlan, Invalidator};
use crate::job::{DeadLetterRecord, JobKind, RevalidationJob};
use crate::lock::recover;
use crate::policy::{AccessPolicy, Heat};
use crate::producer::{Producer, ProducerRegistry};
use crate::queue::{DeadLetterSink, RevalidationQueue};
use crate::scheduler::{ScheduleSnapshot, Scheduler};
use crate::store::{CacheStore, Hit};
use crate::warmer::{WarmSummary, Warmer};
use crate::worker::{Shutdown, WorkerPool};

const SOURCE: &str = "engine";

/// Staleness-aware cache with tag fan-out, background revalidation, and
/// scheduled refresh.
///
/// Reads and writes are synchronous; producers only run on the worker pool
/// and in warm passes. Background tasks start with [`Engine::start`] and
/// stop cooperatively through [`Engine::shutdown`].
///
/// # Usage
///
/// ```ignore
/// let engine = Engine::new(EngineConfig::default());
/// engine.register_producer("post:", Arc::new(PostProducer::new(db)));
/// engine.start();
///
/// engine.put("post:42", body, ["tag:post:42"], None, None)?;
/// engine.invalidate(Target::tag("tag:post:42"), "post edited");
///
/// engine.shutdown().await;
/// ```
pub struct Engine {
    config: EngineConfig,
    clock: Clock,
    store: Arc<CacheStore>,
    graph: Arc<DependencyGraph>,
    queue: Arc<RevalidationQueue>,
    policy: Arc<AccessPolicy>,
    registry: Arc<ProducerRegistry>,
    invalidator: Arc<Invalidator>,
    workers: Arc<WorkerPool>,
    scheduler: Arc<Scheduler>,
    warmer: Warmer,
    shutdown: Shutdown,
    started: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Engine {
    /// Create an engine on the system clock. Background tasks do not run
    /// until [`Engine::start`].
    pub fn new(config: EngineConfig) -> Arc<Self> {
        Self::with_dead_letter_sink(config, Clock::default(), None)
    }

    /// Create an engine on an explicit clock.
    pub fn with_clock(config: EngineConfig, clock: Clock) -> Arc<Self> {
        Self::with_dead_letter_sink(config, clock, None)
    }

    /// Create an engine with a callback for jobs that exhaust their retry
    /// budget.
    pub fn with_dead_letter_sink(
        config: EngineConfig,
        clock: Clock,
        sink: Option<Arc<dyn DeadLetterSink>>,
    ) -> Arc<Self> {
        let shutdown = Shutdown::default();
        let store = Arc::new(CacheStore::new(&config.store, clock.clone()));
        let graph = Arc::new(DependencyGraph::new());
        let queue = Arc::new(RevalidationQueue::with_sink(
            config.queue.dead_letter_capacity,
            sink,
        ));
        let policy = Arc::new(AccessPolicy::new(&config.policy));
        let registry = Arc::new(ProducerRegistry::new());
        let invalidator = Arc::new(Invalidator::new(
            Arc::clone(&store),
            Arc::clone(&graph),
            Arc::clone(&queue),
            Arc::clone(&policy),
            clock.clone(),
            &config,
        ));
        let workers = Arc::new(WorkerPool::new(
            Arc::clone(&store),
            Arc::clone(&queue),
            Arc::clone(&registry),
            Arc::clone(&invalidator),
            clock.clone(),
            &config,
            shutdown.clone(),
        ));
        let scheduler = Arc::new(Scheduler::new(
            Arc::clone(&invalidator),
            clock.clone(),
            shutdown.clone(),
        ));
        let warmer = Warmer::new(
            Arc::clone(&store),
            Arc::clone(&registry),
            &config.warmer,
            shutdown.clone(),
        );

        Arc::new(Self {
            config,
            clock,
            store,
            graph,
            queue,
            policy,
            registry,
            invalidator,
            workers,
            scheduler,
            warmer,
            shutdown,
            started: AtomicBool::new(false),
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Spawn the worker pool, scheduler, sweeper, and policy prune loops.
    /// Calling it twice is a no-op.
    pub fn start(self: &Arc<Self>) {
        if self.started.swap(true, Ordering::SeqCst) {
            warn!("Engine already started");
            return;
        }
        info!(
            workers = self.config.queue.worker_concurrency_non_zero().get(),
            sweep_interval_ms = self.config.store.sweep_interval().as_millis() as u64,
            "Starting engine"
        );
        let mut tasks = recover(self.tasks.lock(), SOURCE, "start");
        tasks.extend(self.workers.spawn());
        tasks.push(self.scheduler.spawn());
        tasks.push(self.spawn_sweeper());
        tasks.push(self.spawn_policy_prune());
    }

    /// Signal every background task and wait for them to finish. In-flight
    /// jobs complete; pending ones stay in the queue.
    pub async fn shutdown(&self) {
        info!("Engine shutting down");
        self.shutdown.signal();
        let tasks: Vec<JoinHandle<()>> = {
            let mut guard = recover(self.tasks.lock(), SOURCE, "shutdown");
            guard.drain(..).collect()
        };
        for task in tasks {
            if let Err(err) = task.await {
                warn!(error = %err, "Background task ended abnormally");
            }
        }
        info!("Engine stopped");
    }

    /// Read a key. Serves stale values as-is; a stale hit schedules a
    /// background refresh when a producer covers the key.
    pub fn get(&self, key: &str) -> Option<Hit> {
        let hit = self.store.get(key)?;
        let now = self.clock.now();
        self.policy.record(key, now);

        if hit.freshness == Freshness::Stale && self.registry.resolve(key).is_some() {
            let job = RevalidationJob::new(
                JobKind::Refresh {
                    key: key.to_string(),
                    observed_version: hit.version,
                },
                self.config.invalidation.refresh_priority,
                now,
                self.config.queue.max_attempts_non_zero().get(),
                "stale-read",
            );
            if self.queue.enqueue(job) {
                debug!(key = %key, "Scheduled refresh behind stale read");
            }
        }
        Some(hit)
    }

    /// Write a key. The freshness window starts from the base `stale_in`
    /// (or the configured default) and is widened or narrowed by the key's
    /// observed access heat.
    pub fn put<I, T>(
        &self,
        key: &str,
        value: impl Into<Bytes>,
        tags: I,
        stale_in: Option<Duration>,
        expire_in: Option<Duration>,
    ) -> Result<u64, EngineError>
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        let now = self.clock.now();
        let base = stale_in.unwrap_or_else(|| self.config.store.default_stale_in());
        let effective = self.policy.effective_stale_in(key, base, now);
        let tags: HashSet<String> = tags.into_iter().map(Into::into).collect();
        self.store
            .put(key, value.into(), tags, Some(effective), expire_in)
    }

    pub fn evict(&self, key: &str) -> bool {
        self.store.evict(key)
    }

    pub fn freshness(&self, key: &str) -> Option<Freshness> {
        self.store.freshness(key)
    }

    pub fn version(&self, key: &str) -> Option<u64> {
        self.store.version(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.store.contains(key)
    }

    pub fn len(&self) -> usize {
        self.store.len()
    }

    pub fn is_empty(&self) -> bool {
        self.store.is_empty()
    }

    /// Run an invalidation pass from `source` with the configured default
    /// refresh mode.
    pub fn invalidate(&self, source: Target, reason: &str) -> FanoutPlan {
        self.invalidator.invalidate(source, reason)
    }

    pub fn invalidate_with_mode(
        &self,
        source: Target,
        reason: &str,
        mode: RefreshMode,
    ) -> FanoutPlan {
        self.invalidator.invalidate_with_mode(source, reason, mode)
    }

    /// Declare that invalidating `source` also invalidates `dependent`,
    /// after `delay` and with the given refresh mode.
    pub fn register_dependency(
        &self,
        source: Target,
        dependent: Target,
        delay: Duration,
        mode: RefreshMode,
    ) {
        self.graph.register(source, dependent, delay, mode);
    }

    pub fn remove_dependency(&self, source: &Target, dependent: &Target) -> bool {
        self.graph.remove(source, dependent)
    }

    /// Route keys starting with `prefix` to `producer`. The longest
    /// registered prefix wins; an empty prefix catches everything.
    pub fn register_producer(&self, prefix: impl Into<String>, producer: Arc<dyn Producer>) {
        self.registry.register(prefix, producer);
    }

    pub fn unregister_producer(&self, prefix: &str) -> bool {
        self.registry.unregister(prefix)
    }

    /// Register or replace a periodic invalidation trigger. `spec` is
    /// either `every <n><unit>` or a cron expression with seconds.
    pub fn register_schedule(
        &self,
        id: impl Into<String>,
        spec: &str,
        targets: Vec<Target>,
        enabled: bool,
    ) -> Result<(), EngineError> {
        self.scheduler.register(id, spec, targets, enabled)
    }

    pub fn remove_schedule(&self, id: &str) -> bool {
        self.scheduler.remove(id)
    }

    pub fn set_schedule_enabled(&self, id: &str, enabled: bool) -> bool {
        self.scheduler.set_enabled(id, enabled)
    }

    pub fn next_scheduled_run(&self, id: &str) -> Option<OffsetDateTime> {
        self.scheduler.next_run_at(id)
    }

    /// Fire due schedules immediately instead of waiting for the scheduler
    /// loop. Returns the number fired.
    pub fn fire_due_schedules(&self) -> usize {
        self.scheduler.fire_due()
    }

    pub fn snapshot_schedules(&self) -> Vec<ScheduleSnapshot> {
        self.scheduler.snapshot()
    }

    pub fn restore_schedules(&self, snapshots: Vec<ScheduleSnapshot>) -> Result<usize, EngineError> {
        self.scheduler.restore(snapshots)
    }

    /// Warm the given keys through their producers, skipping fresh entries.
    pub async fn warm(&self, keys: Vec<String>) -> WarmSummary {
        self.warmer.warm(keys).await
    }

    /// Warm the hottest tracked keys.
    pub async fn warm_hot(&self, limit: usize) -> WarmSummary {
        let keys = self.policy.hot_keys(limit, self.clock.now());
        self.warmer.warm(keys).await
    }

    /// The most-accessed keys by decayed hit count, hottest first.
    pub fn hot_keys(&self, limit: usize) -> Vec<String> {
        self.policy.hot_keys(limit, self.clock.now())
    }

    pub fn heat(&self, key: &str) -> Heat {
        self.policy.classify(key, self.clock.now())
    }

    pub fn queue_depth(&self) -> usize {
        self.queue.depth()
    }

    /// Jobs that exhausted their retry budget, oldest first.
    pub fn dead_letters(&self) -> Vec<DeadLetterRecord> {
        self.queue.dead_letters()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    fn spawn_sweeper(self: &Arc<Self>) -> JoinHandle<()> {
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(engine.config.store.sweep_interval());
            tick.tick().await; // Skip the first immediate tick
            loop {
                tokio::select! {
                    _ = tick.tick() => {
                        let swept = engine.store.sweep(
                            engine.config.store.sweep_batch_limit,
                            |key| engine.queue.has_pending_refresh(key),
                        );
                        if swept > 0 {
                            debug!(swept, "Swept expired entries");
                        }
                    }
                    _ = engine.shutdown.signaled() => break,
                }
            }
            debug!("Sweeper loop stopped");
        })
    }

    fn spawn_policy_prune(self: &Arc<Self>) -> JoinHandle<()> {
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(engine.config.policy.retune_interval());
            tick.tick().await; // Skip the first immediate tick
            loop {
                tokio::select! {
                    _ = tick.tick() => {
                        engine.policy.prune(engine.clock.now());
                    }
                    _ = engine.shutdown.signaled() => break,
                }
            }
            debug!("Policy prune loop stopped");
        })
    }
}
