//! Scheduled revalidation.
//!
//! Cron-like triggers that run invalidation passes at computed instants.
//! `next_run_at` always advances from the previously scheduled instant
//! rather than the actual fire time, so slow firings never drift the
//! cadence. Firings missed while the process was down collapse into one
//! catch-up pass that realigns to the original cadence.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use metrics::{counter, gauge};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::error::EngineError;
use crate::graph::Target;
use crate::invalidate::Invalidator;
use crate::lock::recover;
use crate::worker::Shutdown;

const SOURCE: &str = "scheduler";
const SCHEDULER_TICK: Duration = Duration::from_millis(250);

const METRIC_FIRED_TOTAL: &str = "rinfresco_schedule_fired_total";
const METRIC_SCHEDULES: &str = "rinfresco_schedules";

/// Parsed interval specification.
///
/// Two grammars are accepted: `every <n><unit>` for plain periods (for
/// example `every 60s`, `every 5m`, `every 1h`) and six/seven-field cron
/// expressions with seconds (for example `0 0 3 * * *`).
#[derive(Debug, Clone)]
pub enum ScheduleSpec {
    Every(Duration),
    Cron(Box<cron::Schedule>),
}

impl ScheduleSpec {
    pub fn parse(spec: &str) -> Result<Self, EngineError> {
        let trimmed = spec.trim();
        if let Some(rest) = trimmed
            .strip_prefix("every ")
            .or_else(|| trimmed.strip_prefix("@every "))
        {
            let period = parse_period(rest).ok_or_else(|| {
                EngineError::invalid_schedule(spec, "expected a period like `30s`, `5m`, or `1h`")
            })?;
            if period.is_zero() {
                return Err(EngineError::invalid_schedule(spec, "period must be positive"));
            }
            return Ok(Self::Every(period));
        }
        match cron::Schedule::from_str(trimmed) {
            Ok(schedule) => Ok(Self::Cron(Box::new(schedule))),
            Err(err) => Err(EngineError::invalid_schedule(spec, err.to_string())),
        }
    }

    /// First instant strictly after `after` at which this spec fires.
    pub fn next_fire_after(&self, after: OffsetDateTime) -> Option<OffsetDateTime> {
        match self {
            Self::Every(period) => Some(after + *period),
            Self::Cron(schedule) => {
                let after_utc = DateTime::<Utc>::from_timestamp(
                    after.unix_timestamp(),
                    after.nanosecond(),
                )?;
                let next = schedule.after(&after_utc).next()?;
                OffsetDateTime::from_unix_timestamp(next.timestamp()).ok()
            }
        }
    }
}

fn parse_period(raw: &str) -> Option<Duration> {
    let raw = raw.trim();
    let unit = raw.chars().last()?;
    let quantity: u64 = raw[..raw.len() - unit.len_utf8()].trim().parse().ok()?;
    match unit {
        's' => Some(Duration::from_secs(quantity)),
        'm' => Some(Duration::from_secs(quantity * 60)),
        'h' => Some(Duration::from_secs(quantity * 3600)),
        _ => None,
    }
}

/// Persistable form of one registered schedule. Restoring a snapshot whose
/// `next_run_at` already passed yields exactly one catch-up firing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleSnapshot {
    pub id: String,
    pub spec: String,
    pub targets: Vec<Target>,
    pub enabled: bool,
    #[serde(with = "time::serde::rfc3339")]
    pub next_run_at: OffsetDateTime,
}

struct ScheduledRevalidation {
    id: String,
    spec: ScheduleSpec,
    spec_source: String,
    targets: Vec<Target>,
    enabled: bool,
    next_run_at: OffsetDateTime,
}

/// Registry of periodic invalidation triggers.
pub struct Scheduler {
    invalidator: Arc<Invalidator>,
    clock: Clock,
    schedules: Mutex<HashMap<String, ScheduledRevalidation>>,
    shutdown: Shutdown,
}

impl Scheduler {
    pub(crate) fn new(invalidator: Arc<Invalidator>, clock: Clock, shutdown: Shutdown) -> Self {
        Self {
            invalidator,
            clock,
            schedules: Mutex::new(HashMap::new()),
            shutdown,
        }
    }

    /// Register or replace a schedule. The first firing lands at the next
    /// instant the spec yields from now.
    pub fn register(
        &self,
        id: impl Into<String>,
        spec: &str,
        targets: Vec<Target>,
        enabled: bool,
    ) -> Result<(), EngineError> {
        let id = id.into();
        let parsed = ScheduleSpec::parse(spec)?;
        let now = self.clock.now();
        let next_run_at = parsed
            .next_fire_after(now)
            .ok_or_else(|| EngineError::invalid_schedule(spec, "spec yields no future firing"))?;

        let mut schedules = recover(self.schedules.lock(), SOURCE, "register");
        info!(
            schedule_id = %id,
            spec,
            targets = targets.len(),
            enabled,
            next_run_at = %next_run_at,
            "Schedule registered"
        );
        schedules.insert(
            id.clone(),
            ScheduledRevalidation {
                id,
                spec: parsed,
                spec_source: spec.to_string(),
                targets,
                enabled,
                next_run_at,
            },
        );
        gauge!(METRIC_SCHEDULES).set(schedules.len() as f64);
        Ok(())
    }

    pub fn remove(&self, id: &str) -> bool {
        let mut schedules = recover(self.schedules.lock(), SOURCE, "remove");
        let removed = schedules.remove(id).is_some();
        gauge!(METRIC_SCHEDULES).set(schedules.len() as f64);
        removed
    }

    pub fn set_enabled(&self, id: &str, enabled: bool) -> bool {
        let mut schedules = recover(self.schedules.lock(), SOURCE, "set_enabled");
        match schedules.get_mut(id) {
            Some(entry) => {
                entry.enabled = enabled;
                true
            }
            None => false,
        }
    }

    pub fn next_run_at(&self, id: &str) -> Option<OffsetDateTime> {
        recover(self.schedules.lock(), SOURCE, "next_run_at")
            .get(id)
            .map(|entry| entry.next_run_at)
    }

    /// Fire every enabled schedule whose instant has arrived. Returns the
    /// number of schedules fired. Invalidation runs outside the registry
    /// lock so a slow pass never blocks registration.
    pub fn fire_due(&self) -> usize {
        let now = self.clock.now();
        let mut due: Vec<(String, Vec<Target>)> = Vec::new();
        {
            let mut schedules = recover(self.schedules.lock(), SOURCE, "fire_due");
            for entry in schedules.values_mut() {
                if !entry.enabled || entry.next_run_at > now {
                    continue;
                }
                match advance_past(&entry.spec, entry.next_run_at, now) {
                    Some(next) => entry.next_run_at = next,
                    None => {
                        warn!(schedule_id = %entry.id, "Schedule yields no future firing, disabling");
                        entry.enabled = false;
                    }
                }
                due.push((entry.id.clone(), entry.targets.clone()));
            }
        }

        let fired = due.len();
        for (id, targets) in due {
            let reason = format!("schedule:{id}");
            debug!(schedule_id = %id, targets = targets.len(), "Schedule fired");
            for target in targets {
                self.invalidator.invalidate(target, &reason);
            }
            counter!(METRIC_FIRED_TOTAL).increment(1);
        }
        fired
    }

    /// Serializable view of every registered schedule, ordered by id.
    pub fn snapshot(&self) -> Vec<ScheduleSnapshot> {
        let schedules = recover(self.schedules.lock(), SOURCE, "snapshot");
        let mut out: Vec<ScheduleSnapshot> = schedules
            .values()
            .map(|entry| ScheduleSnapshot {
                id: entry.id.clone(),
                spec: entry.spec_source.clone(),
                targets: entry.targets.clone(),
                enabled: entry.enabled,
                next_run_at: entry.next_run_at,
            })
            .collect();
        out.sort_by(|a, b| a.id.cmp(&b.id));
        out
    }

    /// Load schedules from a snapshot, keeping their stored `next_run_at`.
    pub fn restore(&self, snapshots: Vec<ScheduleSnapshot>) -> Result<usize, EngineError> {
        let mut parsed = Vec::with_capacity(snapshots.len());
        for snapshot in snapshots {
            let spec = ScheduleSpec::parse(&snapshot.spec)?;
            parsed.push((snapshot, spec));
        }

        let mut schedules = recover(self.schedules.lock(), SOURCE, "restore");
        let restored = parsed.len();
        for (snapshot, spec) in parsed {
            schedules.insert(
                snapshot.id.clone(),
                ScheduledRevalidation {
                    id: snapshot.id,
                    spec,
                    spec_source: snapshot.spec,
                    targets: snapshot.targets,
                    enabled: snapshot.enabled,
                    next_run_at: snapshot.next_run_at,
                },
            );
        }
        gauge!(METRIC_SCHEDULES).set(schedules.len() as f64);
        info!(restored, "Schedules restored from snapshot");
        Ok(restored)
    }

    pub(crate) fn spawn(self: &Arc<Self>) -> JoinHandle<()> {
        let scheduler = Arc::clone(self);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(SCHEDULER_TICK);
            tick.tick().await; // Skip the first immediate tick
            loop {
                tokio::select! {
                    _ = tick.tick() => {
                        scheduler.fire_due();
                    }
                    _ = scheduler.shutdown.signaled() => break,
                }
            }
            debug!("Scheduler loop stopped");
        })
    }
}

/// Next instant on the spec's cadence that lies strictly in the future.
/// Skipped instants are the firings that collapse into the current one.
/// Fixed periods cross the whole gap at once; cron specs step.
fn advance_past(
    spec: &ScheduleSpec,
    from: OffsetDateTime,
    now: OffsetDateTime,
) -> Option<OffsetDateTime> {
    if let ScheduleSpec::Every(period) = spec {
        let next = from + *period;
        if next > now {
            return Some(next);
        }
        // The parser rejects zero periods, so the modulo is well defined.
        let period_ns = period.as_nanos();
        let into_period = ((now - from).whole_nanoseconds() as u128) % period_ns;
        return Some(now + Duration::from_nanos((period_ns - into_period) as u64));
    }
    let mut next = spec.next_fire_after(from)?;
    while next <= now {
        next = spec.next_fire_after(next)?;
    }
    Some(next)
}
