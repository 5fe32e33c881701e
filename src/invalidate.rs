//! Invalidation fan-out.
//!
//! One entry point for every trigger (manual call, cascade job, schedule
//! firing). Walks the dependency graph breadth-first, applies all direct
//! store effects, then schedules delayed cascades and refresh jobs.

use std::collections::{HashSet, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use metrics::{counter, histogram};
use time::OffsetDateTime;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::clock::Clock;
use crate::config::EngineConfig;
use crate::graph::{DependencyEdge, DependencyGraph, RefreshMode, Target};
use crate::job::{JobKind, RevalidationJob};
use crate::policy::{AccessPolicy, Heat};
use crate::queue::RevalidationQueue;
use crate::store::CacheStore;

const METRIC_PASS_TOTAL: &str = "rinfresco_invalidate_pass_total";
const METRIC_STALED_TOTAL: &str = "rinfresco_invalidate_staled_total";
const METRIC_EVICTED_TOTAL: &str = "rinfresco_invalidate_evicted_total";
const METRIC_UNKNOWN_TARGET_TOTAL: &str = "rinfresco_invalidate_unknown_target_total";
const METRIC_PASS_DURATION: &str = "rinfresco_invalidate_duration_seconds";

/// What one invalidation pass did.
///
/// Reported back to the caller so admin surfaces can show the blast radius
/// of a trigger.
#[derive(Debug)]
pub struct FanoutPlan {
    pub pass_id: Uuid,
    /// Target the pass started from.
    pub source: Target,
    pub reason: String,
    /// Keys marked stale but left servable.
    pub staled: Vec<String>,
    /// Keys hard-evicted.
    pub evicted: Vec<String>,
    /// Dependents handed to the queue as delayed cascades.
    pub delayed: Vec<Target>,
    /// Keys given a refresh job in this pass.
    pub refreshes: Vec<String>,
    /// Targets that resolved nothing and lead nowhere.
    pub unknown: Vec<Target>,
    /// Graph nodes walked, cycle guard included.
    pub visited: usize,
}

impl FanoutPlan {
    fn new(source: Target, reason: &str) -> Self {
        Self {
            pass_id: Uuid::new_v4(),
            source,
            reason: reason.to_string(),
            staled: Vec::new(),
            evicted: Vec::new(),
            delayed: Vec::new(),
            refreshes: Vec::new(),
            unknown: Vec::new(),
            visited: 0,
        }
    }

    /// True when the pass changed nothing and scheduled nothing.
    pub fn is_empty(&self) -> bool {
        self.staled.is_empty()
            && self.evicted.is_empty()
            && self.delayed.is_empty()
            && self.refreshes.is_empty()
    }
}

impl fmt::Display for FanoutPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "FanoutPlan {{ source: {}, staled: {}, evicted: {}, delayed: {}, \
             refreshes: {}, unknown: {}, visited: {} }}",
            self.source,
            self.staled.len(),
            self.evicted.len(),
            self.delayed.len(),
            self.refreshes.len(),
            self.unknown.len(),
            self.visited,
        )
    }
}

/// Executes invalidation passes against one store/graph/queue set.
pub struct Invalidator {
    store: Arc<CacheStore>,
    graph: Arc<DependencyGraph>,
    queue: Arc<RevalidationQueue>,
    policy: Arc<AccessPolicy>,
    clock: Clock,
    default_mode: RefreshMode,
    refresh_priority: i32,
    cascade_priority: i32,
    max_attempts: u32,
}

impl Invalidator {
    pub fn new(
        store: Arc<CacheStore>,
        graph: Arc<DependencyGraph>,
        queue: Arc<RevalidationQueue>,
        policy: Arc<AccessPolicy>,
        clock: Clock,
        config: &EngineConfig,
    ) -> Self {
        Self {
            store,
            graph,
            queue,
            policy,
            clock,
            default_mode: config.invalidation.default_mode,
            refresh_priority: config.invalidation.refresh_priority,
            cascade_priority: config.invalidation.cascade_priority,
            max_attempts: config.queue.max_attempts_non_zero().get(),
        }
    }

    /// Run a pass with the configured default mode.
    pub fn invalidate(&self, source: Target, reason: &str) -> FanoutPlan {
        self.invalidate_with_mode(source, reason, self.default_mode)
    }

    /// Run a pass. Safe to call concurrently with other passes; overlapping
    /// key sets commute because soft-invalidation is idempotent.
    #[instrument(skip(self), fields(source = %source, reason))]
    pub fn invalidate_with_mode(
        &self,
        source: Target,
        reason: &str,
        mode: RefreshMode,
    ) -> FanoutPlan {
        let started = Instant::now();
        let now = self.clock.now();
        let mut plan = FanoutPlan::new(source.clone(), reason);

        let mut visited: HashSet<Target> = HashSet::new();
        let mut frontier: VecDeque<(Target, RefreshMode)> = VecDeque::new();
        frontier.push_back((source, mode));

        let mut delayed_edges: Vec<DependencyEdge> = Vec::new();
        let mut refresh_now: Vec<String> = Vec::new();
        let mut refresh_if_hot: Vec<String> = Vec::new();

        // Phase one: every direct store effect lands before anything is
        // handed to the queue, so no reader can observe a dependent
        // invalidated ahead of its trigger.
        while let Some((node, node_mode)) = frontier.pop_front() {
            if !visited.insert(node.clone()) {
                continue;
            }
            plan.visited += 1;

            let mut touched = 0usize;
            match (&node, node_mode) {
                (Target::Tag(tag), RefreshMode::Aggressive) => {
                    let keys = self.store.evict_tag(tag);
                    touched = keys.len();
                    refresh_now.extend(keys.iter().cloned());
                    plan.evicted.extend(keys);
                }
                (Target::Tag(tag), _) => {
                    let keys = self.store.soft_invalidate_tag(tag);
                    touched = keys.len();
                    if node_mode == RefreshMode::Smart {
                        refresh_if_hot.extend(keys.iter().cloned());
                    }
                    plan.staled.extend(keys);
                }
                (Target::Key(key), RefreshMode::Aggressive) => {
                    if self.store.evict(key) {
                        touched = 1;
                        refresh_now.push(key.clone());
                        plan.evicted.push(key.clone());
                    }
                }
                (Target::Key(key), _) => {
                    if self.store.soft_invalidate_key(key) {
                        touched = 1;
                        if node_mode == RefreshMode::Smart {
                            refresh_if_hot.push(key.clone());
                        }
                        plan.staled.push(key.clone());
                    }
                }
                (Target::Locator(_), _) => {}
            }

            let edges = self.graph.edges_from(&node);
            if touched == 0 && edges.is_empty() {
                warn!(target_node = %node, "Invalidation target resolved nothing");
                counter!(METRIC_UNKNOWN_TARGET_TOTAL).increment(1);
                plan.unknown.push(node.clone());
            }
            for edge in edges {
                if edge.delay.is_zero() {
                    frontier.push_back((edge.dependent, edge.mode));
                } else {
                    delayed_edges.push(edge);
                }
            }
        }

        // Phase two: queue work. Delayed dependents become cascade jobs,
        // evicted keys refresh immediately, smart-staled keys refresh only
        // when the policy ranks them hot.
        for edge in delayed_edges {
            let dependent = edge.dependent.clone();
            let job = RevalidationJob::new(
                JobKind::Cascade {
                    target: edge.dependent,
                    mode: edge.mode,
                },
                self.cascade_priority,
                now + edge.delay,
                self.max_attempts,
                reason,
            );
            if self.queue.enqueue(job) {
                plan.delayed.push(dependent);
            }
        }
        for key in refresh_now {
            self.enqueue_refresh(&mut plan, key, now);
        }
        for key in refresh_if_hot {
            if self.policy.classify(&key, now) == Heat::Hot {
                self.enqueue_refresh(&mut plan, key, now);
            }
        }

        counter!(METRIC_PASS_TOTAL, "mode" => mode.as_str()).increment(1);
        counter!(METRIC_STALED_TOTAL).increment(plan.staled.len() as u64);
        counter!(METRIC_EVICTED_TOTAL).increment(plan.evicted.len() as u64);
        histogram!(METRIC_PASS_DURATION).record(started.elapsed().as_secs_f64());

        info!(
            pass_id = %plan.pass_id,
            source = %plan.source,
            mode = mode.as_str(),
            staled = plan.staled.len(),
            evicted = plan.evicted.len(),
            delayed = plan.delayed.len(),
            refreshes = plan.refreshes.len(),
            unknown = plan.unknown.len(),
            visited = plan.visited,
            "Invalidation pass complete"
        );

        plan
    }

    fn enqueue_refresh(&self, plan: &mut FanoutPlan, key: String, now: OffsetDateTime) {
        let observed_version = self.store.version(&key).unwrap_or(0);
        let job = RevalidationJob::new(
            JobKind::Refresh {
                key: key.clone(),
                observed_version,
            },
            self.refresh_priority,
            now,
            self.max_attempts,
            plan.reason.clone(),
        );
        if self.queue.enqueue(job) {
            plan.refreshes.push(key);
        }
    }
}
