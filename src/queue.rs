//! Revalidation queue.
//!
//! Jobs wait in a due-time heap and move to a priority heap as they come
//! due, so the worker pool always receives the highest-priority job that is
//! actually dispatchable. Redundant pending jobs for the same target
//! coalesce, and exhausted jobs land in a bounded dead-letter buffer.

use std::cmp::Ordering as CmpOrdering;
use std::collections::{BinaryHeap, HashMap, VecDeque};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use metrics::{counter, gauge};
use time::OffsetDateTime;
use tokio::sync::Notify;
use tracing::{debug, error, info};

use crate::job::{DeadLetterRecord, JobStatus, RevalidationJob};
use crate::lock::recover;

const SOURCE: &str = "queue";

const METRIC_ENQUEUED_TOTAL: &str = "rinfresco_queue_enqueued_total";
const METRIC_COALESCED_TOTAL: &str = "rinfresco_queue_coalesced_total";
const METRIC_DEPTH: &str = "rinfresco_queue_depth";
const METRIC_DEAD_LETTER_TOTAL: &str = "rinfresco_queue_dead_letter_total";

/// Receives jobs that exhausted their retry budget.
///
/// Implementations hand the record to an external error-reporting system;
/// the engine itself only logs and retains a bounded tail.
pub trait DeadLetterSink: Send + Sync {
    fn dead_lettered(&self, record: &DeadLetterRecord);
}

/// Result of asking the queue for work.
#[derive(Debug)]
pub enum PopOutcome {
    /// A due job, already marked running.
    Job(RevalidationJob),
    /// Nothing due yet; the earliest pending job is due at this instant.
    NotDue(OffsetDateTime),
    /// No pending jobs at all.
    Empty,
}

struct WaitingJob {
    job: RevalidationJob,
    seq: u64,
}

impl PartialEq for WaitingJob {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == CmpOrdering::Equal
    }
}

impl Eq for WaitingJob {}

impl PartialOrd for WaitingJob {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for WaitingJob {
    // Reversed so the binary heap surfaces the earliest due job.
    fn cmp(&self, other: &Self) -> CmpOrdering {
        other
            .job
            .scheduled_for
            .cmp(&self.job.scheduled_for)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

struct ReadyJob {
    job: RevalidationJob,
    seq: u64,
}

impl PartialEq for ReadyJob {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == CmpOrdering::Equal
    }
}

impl Eq for ReadyJob {}

impl PartialOrd for ReadyJob {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for ReadyJob {
    // Max-heap: higher priority first, then earlier due time, then FIFO.
    fn cmp(&self, other: &Self) -> CmpOrdering {
        self.job
            .priority
            .cmp(&other.job.priority)
            .then_with(|| other.job.scheduled_for.cmp(&self.job.scheduled_for))
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

#[derive(Debug, Clone, Copy)]
struct PendingEntry {
    id: uuid::Uuid,
    priority: i32,
    scheduled_for: OffsetDateTime,
}

struct QueueInner {
    /// Every accepted job enters here, ordered by due time; `pop_due`
    /// promotes due entries into `ready`.
    waiting: BinaryHeap<WaitingJob>,
    /// Due jobs ordered by priority, drained by the workers.
    ready: BinaryHeap<ReadyJob>,
    /// Canonical pending job per coalesce key. Heap entries whose id no
    /// longer matches were superseded and are dropped when they surface.
    pending: HashMap<String, PendingEntry>,
    /// In-flight jobs per coalesce key, kept so the sweeper guard covers
    /// work between pop and completion.
    running: HashMap<String, usize>,
    dead: VecDeque<DeadLetterRecord>,
}

impl QueueInner {
    /// Whether this job is still the one `pending` points at for its target.
    fn is_canonical(&self, job: &RevalidationJob) -> bool {
        self.pending
            .get(&job.kind.coalesce_key())
            .is_some_and(|entry| entry.id == job.id)
    }

    /// Move every due waiting entry into the ready heap, dropping superseded
    /// ones along the way.
    fn promote_due(&mut self, now: OffsetDateTime) {
        while self
            .waiting
            .peek()
            .is_some_and(|top| top.job.scheduled_for <= now)
        {
            let Some(waiting) = self.waiting.pop() else {
                break;
            };
            if self.is_canonical(&waiting.job) {
                self.ready.push(ReadyJob {
                    job: waiting.job,
                    seq: waiting.seq,
                });
            }
        }
    }

    /// Earliest due time among jobs still waiting, ignoring superseded
    /// entries.
    fn next_waiting_due(&mut self) -> Option<OffsetDateTime> {
        while let Some(top) = self.waiting.peek() {
            if self.is_canonical(&top.job) {
                return Some(top.job.scheduled_for);
            }
            self.waiting.pop();
        }
        None
    }
}

/// Priority work queue feeding the revalidation workers.
pub struct RevalidationQueue {
    inner: Mutex<QueueInner>,
    seq: AtomicU64,
    notify: Notify,
    dead_letter_capacity: usize,
    sink: Option<std::sync::Arc<dyn DeadLetterSink>>,
}

impl RevalidationQueue {
    pub fn new(dead_letter_capacity: usize) -> Self {
        Self::with_sink(dead_letter_capacity, None)
    }

    pub fn with_sink(
        dead_letter_capacity: usize,
        sink: Option<std::sync::Arc<dyn DeadLetterSink>>,
    ) -> Self {
        Self {
            inner: Mutex::new(QueueInner {
                waiting: BinaryHeap::new(),
                ready: BinaryHeap::new(),
                pending: HashMap::new(),
                running: HashMap::new(),
                dead: VecDeque::new(),
            }),
            seq: AtomicU64::new(0),
            notify: Notify::new(),
            dead_letter_capacity,
            sink,
        }
    }

    /// Add a job. Returns false when an equal-or-better pending job for the
    /// same target already exists and the new one was coalesced away.
    pub fn enqueue(&self, job: RevalidationJob) -> bool {
        let mut guard = recover(self.inner.lock(), SOURCE, "enqueue");
        let accepted = self.enqueue_locked(&mut guard, job);
        drop(guard);
        if accepted {
            self.notify.notify_one();
        }
        accepted
    }

    fn enqueue_locked(&self, inner: &mut QueueInner, job: RevalidationJob) -> bool {
        let coalesce_key = job.kind.coalesce_key();

        if let Some(existing) = inner.pending.get(&coalesce_key) {
            let supersedes = job.priority > existing.priority
                || (job.priority == existing.priority
                    && job.scheduled_for < existing.scheduled_for);
            counter!(METRIC_COALESCED_TOTAL).increment(1);
            if !supersedes {
                debug!(
                    job_id = %job.id,
                    coalesce_key = %coalesce_key,
                    "Coalesced into existing pending job"
                );
                return false;
            }
            debug!(
                job_id = %job.id,
                superseded_id = %existing.id,
                coalesce_key = %coalesce_key,
                "Superseded pending job"
            );
        }

        info!(
            job_id = %job.id,
            job_kind = job.kind.as_str(),
            target = %job.kind.describe_target(),
            priority = job.priority,
            attempt = job.attempt,
            scheduled_for = %job.scheduled_for,
            "Revalidation job enqueued"
        );

        inner.pending.insert(
            coalesce_key,
            PendingEntry {
                id: job.id,
                priority: job.priority,
                scheduled_for: job.scheduled_for,
            },
        );
        let seq = self.seq.fetch_add(1, Ordering::SeqCst);
        inner.waiting.push(WaitingJob { job, seq });

        counter!(METRIC_ENQUEUED_TOTAL).increment(1);
        gauge!(METRIC_DEPTH).set(inner.pending.len() as f64);
        true
    }

    /// Pop the highest-priority due job, skipping superseded heap entries.
    /// A not-yet-due job never blocks a due one, whatever its priority.
    pub fn pop_due(&self, now: OffsetDateTime) -> PopOutcome {
        let mut guard = recover(self.inner.lock(), SOURCE, "pop_due");
        let inner = &mut *guard;

        inner.promote_due(now);

        while let Some(ready) = inner.ready.pop() {
            if !inner.is_canonical(&ready.job) {
                continue;
            }
            let mut job = ready.job;
            let coalesce_key = job.kind.coalesce_key();
            inner.pending.remove(&coalesce_key);
            *inner.running.entry(coalesce_key).or_insert(0) += 1;
            job.status = JobStatus::Running;

            gauge!(METRIC_DEPTH).set(inner.pending.len() as f64);
            return PopOutcome::Job(job);
        }

        match inner.next_waiting_due() {
            Some(at) => PopOutcome::NotDue(at),
            None => PopOutcome::Empty,
        }
    }

    /// Mark a popped job as no longer in flight. Called on success and on
    /// dead-letter; retries go through [`requeue`](Self::requeue) instead.
    pub fn finish(&self, job: &RevalidationJob) {
        let mut guard = recover(self.inner.lock(), SOURCE, "finish");
        release_running(&mut guard, &job.kind.coalesce_key());
    }

    /// Atomically release a job's in-flight guard and re-enqueue it for a
    /// retry, coalescing against anything enqueued while it ran.
    pub fn requeue(&self, job: RevalidationJob) -> bool {
        let mut guard = recover(self.inner.lock(), SOURCE, "requeue");
        release_running(&mut guard, &job.kind.coalesce_key());
        let accepted = self.enqueue_locked(&mut guard, job);
        drop(guard);
        if accepted {
            self.notify.notify_one();
        }
        accepted
    }

    /// Record a terminal failure and hand it to the sink, if any.
    pub fn dead_letter(&self, record: DeadLetterRecord) {
        let payload = serde_json::to_string(&record).unwrap_or_default();
        error!(
            job_id = %record.job_id,
            target = %record.target,
            attempts = record.attempts,
            error = %record.error,
            payload = %payload,
            "Revalidation job dead-lettered"
        );

        let mut guard = recover(self.inner.lock(), SOURCE, "dead_letter");
        if guard.dead.len() >= self.dead_letter_capacity && self.dead_letter_capacity > 0 {
            guard.dead.pop_front();
        }
        if self.dead_letter_capacity > 0 {
            guard.dead.push_back(record.clone());
        }
        drop(guard);

        counter!(METRIC_DEAD_LETTER_TOTAL).increment(1);
        if let Some(sink) = &self.sink {
            sink.dead_lettered(&record);
        }
    }

    /// Dead-lettered records, oldest first.
    pub fn dead_letters(&self) -> Vec<DeadLetterRecord> {
        recover(self.inner.lock(), SOURCE, "dead_letters")
            .dead
            .iter()
            .cloned()
            .collect()
    }

    /// Whether a refresh for this key is pending or in flight. The sweeper
    /// keeps expired entries alive while this holds.
    pub fn has_pending_refresh(&self, key: &str) -> bool {
        let coalesce_key = format!("refresh:key:{key}");
        let guard = recover(self.inner.lock(), SOURCE, "has_pending_refresh");
        guard.pending.contains_key(&coalesce_key) || guard.running.contains_key(&coalesce_key)
    }

    /// Number of pending (not in-flight) jobs.
    pub fn depth(&self) -> usize {
        recover(self.inner.lock(), SOURCE, "depth").pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.depth() == 0
    }

    /// Park until new work arrives or `max_wait` elapses.
    pub async fn wait_for_change(&self, max_wait: Duration) {
        let _ = tokio::time::timeout(max_wait, self.notify.notified()).await;
    }

    /// Drop all pending work. Dead letters are kept.
    pub fn clear(&self) {
        let mut guard = recover(self.inner.lock(), SOURCE, "clear");
        guard.waiting.clear();
        guard.ready.clear();
        guard.pending.clear();
        gauge!(METRIC_DEPTH).set(0.0);
    }
}

fn release_running(inner: &mut QueueInner, coalesce_key: &str) {
    if let Some(count) = inner.running.get_mut(coalesce_key) {
        *count -= 1;
        if *count == 0 {
            inner.running.remove(coalesce_key);
        }
    }
}
