//! Revalidation worker pool.
//!
//! A fixed number of tokio tasks drain the queue. Refresh jobs call the
//! resolved producer under a per-job timeout and write back through the
//! store's version check; cascade jobs re-enter the invalidation pass.
//! Workers hold no cross-job lock, so racing refreshes for one key are
//! settled at write time, not here.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use metrics::{counter, histogram};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use crate::clock::Clock;
use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::invalidate::Invalidator;
use crate::job::{DeadLetterRecord, JobKind, JobStatus, RevalidationJob, backoff_delay};
use crate::producer::ProducerRegistry;
use crate::queue::{PopOutcome, RevalidationQueue};
use crate::store::CacheStore;

const METRIC_JOBS_TOTAL: &str = "rinfresco_jobs_total";
const METRIC_JOB_DURATION: &str = "rinfresco_job_duration_seconds";

/// Cooperative shutdown token shared by every background task.
///
/// Signaling lets in-flight work finish; loops check the flag before
/// picking up anything new.
#[derive(Clone, Default)]
pub(crate) struct Shutdown {
    inner: Arc<ShutdownInner>,
}

#[derive(Default)]
struct ShutdownInner {
    flag: AtomicBool,
    notify: Notify,
}

impl Shutdown {
    pub(crate) fn signal(&self) {
        self.inner.flag.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    pub(crate) fn is_signaled(&self) -> bool {
        self.inner.flag.load(Ordering::SeqCst)
    }

    pub(crate) async fn signaled(&self) {
        loop {
            let notified = self.inner.notify.notified();
            if self.is_signaled() {
                return;
            }
            notified.await;
        }
    }
}

enum RefreshOutcome {
    /// Producer result written as the key's next version.
    Written,
    /// A newer write advanced the key first; the result was dropped.
    Discarded,
    /// Cascade pass executed.
    Cascaded,
}

impl RefreshOutcome {
    fn as_str(&self) -> &'static str {
        match self {
            RefreshOutcome::Written => "written",
            RefreshOutcome::Discarded => "discarded",
            RefreshOutcome::Cascaded => "cascaded",
        }
    }
}

/// Drains the revalidation queue with bounded concurrency.
pub struct WorkerPool {
    store: Arc<CacheStore>,
    queue: Arc<RevalidationQueue>,
    registry: Arc<ProducerRegistry>,
    invalidator: Arc<Invalidator>,
    clock: Clock,
    concurrency: usize,
    poll_interval: Duration,
    producer_timeout: Duration,
    backoff_base: Duration,
    backoff_max: Duration,
    backoff_jitter: Duration,
    shutdown: Shutdown,
}

impl WorkerPool {
    pub(crate) fn new(
        store: Arc<CacheStore>,
        queue: Arc<RevalidationQueue>,
        registry: Arc<ProducerRegistry>,
        invalidator: Arc<Invalidator>,
        clock: Clock,
        config: &EngineConfig,
        shutdown: Shutdown,
    ) -> Self {
        Self {
            store,
            queue,
            registry,
            invalidator,
            clock,
            concurrency: config.queue.worker_concurrency_non_zero().get(),
            poll_interval: config.queue.poll_interval(),
            producer_timeout: config.queue.producer_timeout(),
            backoff_base: config.queue.backoff_base(),
            backoff_max: config.queue.backoff_max(),
            backoff_jitter: config.queue.backoff_jitter(),
            shutdown,
        }
    }

    /// Spawn the worker tasks. Handles resolve once shutdown is signaled
    /// and each worker drains its in-flight job.
    pub(crate) fn spawn(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        (0..self.concurrency)
            .map(|worker_id| {
                let pool = Arc::clone(self);
                tokio::spawn(async move { pool.run(worker_id).await })
            })
            .collect()
    }

    async fn run(&self, worker_id: usize) {
        debug!(worker_id, "Revalidation worker started");
        while !self.shutdown.is_signaled() {
            match self.queue.pop_due(self.clock.now()) {
                PopOutcome::Job(job) => self.execute(job).await,
                PopOutcome::NotDue(due_at) => {
                    let until_due: Duration =
                        (due_at - self.clock.now()).try_into().unwrap_or(Duration::ZERO);
                    self.park(until_due.min(self.poll_interval)).await;
                }
                PopOutcome::Empty => self.park(self.poll_interval).await,
            }
        }
        debug!(worker_id, "Revalidation worker stopped");
    }

    async fn park(&self, wait: Duration) {
        tokio::select! {
            _ = self.queue.wait_for_change(wait) => {}
            _ = self.shutdown.signaled() => {}
        }
    }

    #[instrument(
        skip(self, job),
        fields(
            job_id = %job.id,
            job_kind = job.kind.as_str(),
            target = %job.kind.describe_target(),
            attempt = job.attempt + 1,
        )
    )]
    async fn execute(&self, mut job: RevalidationJob) {
        let started = Instant::now();
        job.attempt += 1;

        let result = match &job.kind {
            JobKind::Refresh {
                key,
                observed_version,
            } => self.refresh(key, *observed_version).await,
            JobKind::Cascade { target, mode } => {
                self.invalidator
                    .invalidate_with_mode(target.clone(), &job.reason, *mode);
                Ok(RefreshOutcome::Cascaded)
            }
        };

        match result {
            Ok(outcome) => {
                job.status = JobStatus::Succeeded;
                self.queue.finish(&job);
                counter!(METRIC_JOBS_TOTAL, "outcome" => outcome.as_str()).increment(1);
                histogram!(METRIC_JOB_DURATION, "kind" => job.kind.as_str())
                    .record(started.elapsed().as_secs_f64());
                info!(
                    outcome = outcome.as_str(),
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Revalidation job finished"
                );
            }
            Err(err) => self.handle_failure(job, err),
        }
    }

    async fn refresh(&self, key: &str, observed_version: u64) -> Result<RefreshOutcome, EngineError> {
        let Some(producer) = self.registry.resolve(key) else {
            return Err(EngineError::no_producer(key));
        };

        let produced = match tokio::time::timeout(self.producer_timeout, producer.produce(key)).await
        {
            Ok(Ok(produced)) => produced,
            Ok(Err(source)) => return Err(EngineError::producer(key, source)),
            Err(_) => {
                return Err(EngineError::producer_timeout(
                    key,
                    self.producer_timeout.as_millis() as u64,
                ));
            }
        };

        match self.store.put_versioned(
            key,
            produced.value,
            produced.tags,
            produced.stale_in,
            produced.expire_in,
            observed_version,
        )? {
            Some(version) => {
                debug!(key = %key, version, "Refresh wrote a new version");
                Ok(RefreshOutcome::Written)
            }
            None => Ok(RefreshOutcome::Discarded),
        }
    }

    fn handle_failure(&self, mut job: RevalidationJob, err: EngineError) {
        if err.is_retryable() && job.attempts_remaining() {
            let delay = backoff_delay(
                job.attempt,
                self.backoff_base,
                self.backoff_max,
                self.backoff_jitter,
            );
            job.status = JobStatus::Pending;
            job.scheduled_for = self.clock.now() + delay;
            warn!(
                error = %err,
                attempt = job.attempt,
                max_attempts = job.max_attempts,
                retry_in_ms = delay.as_millis() as u64,
                "Revalidation attempt failed, retrying"
            );
            counter!(METRIC_JOBS_TOTAL, "outcome" => "retried").increment(1);
            self.queue.requeue(job);
        } else {
            job.status = JobStatus::DeadLettered;
            let record = DeadLetterRecord::from_job(&job, err.to_string(), self.clock.now());
            self.queue.finish(&job);
            self.queue.dead_letter(record);
            counter!(METRIC_JOBS_TOTAL, "outcome" => "dead_lettered").increment(1);
        }
    }
}
