//! Revalidation job model.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::Serialize;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::graph::{RefreshMode, Target};

/// Lifecycle state of a revalidation job.
///
/// `Succeeded` and `DeadLettered` are terminal; `Failed` marks an attempt
/// that will be retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    DeadLettered,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Succeeded => "succeeded",
            JobStatus::Failed => "failed",
            JobStatus::DeadLettered => "dead_lettered",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Succeeded | JobStatus::DeadLettered)
    }
}

impl TryFrom<&str> for JobStatus {
    type Error = String;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        match value {
            "pending" => Ok(JobStatus::Pending),
            "running" => Ok(JobStatus::Running),
            "succeeded" => Ok(JobStatus::Succeeded),
            "failed" => Ok(JobStatus::Failed),
            "dead_lettered" => Ok(JobStatus::DeadLettered),
            _ => Err(format!("unknown job status `{value}`")),
        }
    }
}

/// What a job does when a worker picks it up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobKind {
    /// Call the producer for one key and write the result back, unless the
    /// key's version advanced past `observed_version` in the meantime.
    Refresh { key: String, observed_version: u64 },
    /// Re-enter invalidation at a target; carries the mode of the delayed
    /// edge that spawned it.
    Cascade { target: Target, mode: RefreshMode },
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::Refresh { .. } => "refresh",
            JobKind::Cascade { .. } => "cascade",
        }
    }

    /// Human-readable target for logs and dead-letter records.
    pub fn describe_target(&self) -> String {
        match self {
            JobKind::Refresh { key, .. } => format!("key:{key}"),
            JobKind::Cascade { target, .. } => target.to_string(),
        }
    }

    /// The cache key this job refreshes, if it is a refresh job.
    pub fn refresh_key(&self) -> Option<&str> {
        match self {
            JobKind::Refresh { key, .. } => Some(key),
            JobKind::Cascade { .. } => None,
        }
    }

    /// Identity used to coalesce redundant pending jobs.
    pub fn coalesce_key(&self) -> String {
        format!("{}:{}", self.as_str(), self.describe_target())
    }
}

/// One unit of revalidation work.
#[derive(Debug, Clone)]
pub struct RevalidationJob {
    pub id: Uuid,
    pub kind: JobKind,
    /// Higher runs sooner among due jobs.
    pub priority: i32,
    /// Jobs are not dispatched before this instant.
    pub scheduled_for: OffsetDateTime,
    pub attempt: u32,
    pub max_attempts: u32,
    pub status: JobStatus,
    /// Why this job exists, threaded from the invalidation reason.
    pub reason: String,
}

impl RevalidationJob {
    pub fn new(
        kind: JobKind,
        priority: i32,
        scheduled_for: OffsetDateTime,
        max_attempts: u32,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            priority,
            scheduled_for,
            attempt: 0,
            max_attempts: max_attempts.max(1),
            status: JobStatus::Pending,
            reason: reason.into(),
        }
    }

    pub fn attempts_remaining(&self) -> bool {
        self.attempt < self.max_attempts
    }
}

/// Terminal failure record handed to dead-letter sinks.
#[derive(Debug, Clone, Serialize)]
pub struct DeadLetterRecord {
    pub job_id: Uuid,
    pub kind: &'static str,
    pub target: String,
    pub attempts: u32,
    pub reason: String,
    pub error: String,
    #[serde(with = "time::serde::rfc3339")]
    pub failed_at: OffsetDateTime,
}

impl DeadLetterRecord {
    pub fn from_job(job: &RevalidationJob, error: impl Into<String>, now: OffsetDateTime) -> Self {
        Self {
            job_id: job.id,
            kind: job.kind.as_str(),
            target: job.kind.describe_target(),
            attempts: job.attempt,
            reason: job.reason.clone(),
            error: error.into(),
            failed_at: now,
        }
    }
}

/// Exponential backoff with jitter for retry scheduling.
///
/// Doubles from `base` per prior attempt, clamps at `max`, then adds up to
/// `jitter` taken from the subsecond nanos of the wall clock so colliding
/// retries spread out without a dedicated RNG.
pub(crate) fn backoff_delay(attempt: u32, base: Duration, max: Duration, jitter: Duration) -> Duration {
    let exponent = attempt.saturating_sub(1).min(16);
    let scaled = base.saturating_mul(1u32 << exponent).min(max);

    let jitter_ms = jitter.as_millis() as u64;
    if jitter_ms == 0 {
        return scaled;
    }
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|since_epoch| u64::from(since_epoch.subsec_nanos()))
        .unwrap_or(0);
    scaled + Duration::from_millis(nanos % jitter_ms)
}
