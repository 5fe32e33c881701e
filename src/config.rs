//! Engine configuration.
//!
//! All fields have serde defaults so a config document only names what it
//! overrides. Durations are carried as integer `*_ms`/`*_secs` fields with
//! typed accessors.

use std::num::{NonZeroU32, NonZeroUsize};
use std::time::Duration;

use serde::Deserialize;

use crate::graph::RefreshMode;

// Default values for engine configuration
const DEFAULT_STORE_CAPACITY: usize = 4096;
const DEFAULT_STALE_IN_SECS: u64 = 60;
const DEFAULT_EXPIRE_IN_SECS: u64 = 3600;
const DEFAULT_SWEEP_INTERVAL_MS: u64 = 30_000;
const DEFAULT_SWEEP_BATCH_LIMIT: usize = 256;
const DEFAULT_WORKER_CONCURRENCY: usize = 4;
const DEFAULT_POLL_INTERVAL_MS: u64 = 50;
const DEFAULT_PRODUCER_TIMEOUT_MS: u64 = 10_000;
const DEFAULT_MAX_ATTEMPTS: u32 = 5;
const DEFAULT_BACKOFF_BASE_MS: u64 = 250;
const DEFAULT_BACKOFF_MAX_MS: u64 = 30_000;
const DEFAULT_BACKOFF_JITTER_MS: u64 = 100;
const DEFAULT_DEAD_LETTER_CAPACITY: usize = 128;
const DEFAULT_REFRESH_PRIORITY: i32 = 0;
const DEFAULT_CASCADE_PRIORITY: i32 = 10;
const DEFAULT_HALF_LIFE_SECS: u64 = 300;
const DEFAULT_HOT_THRESHOLD: f64 = 8.0;
const DEFAULT_COLD_THRESHOLD: f64 = 0.5;
const DEFAULT_HOT_STALE_FACTOR: f64 = 2.0;
const DEFAULT_COLD_STALE_FACTOR: f64 = 0.5;
const DEFAULT_RETUNE_INTERVAL_MS: u64 = 60_000;
const DEFAULT_WARM_CONCURRENCY: usize = 4;
const DEFAULT_WARM_DELAY_MS: u64 = 0;

/// Top-level engine configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub store: StoreConfig,
    pub invalidation: InvalidationConfig,
    pub queue: QueueConfig,
    pub policy: PolicyConfig,
    pub warmer: WarmerConfig,
    pub logging: LoggingConfig,
}

/// Cache store limits and freshness defaults.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Maximum number of entries held at once.
    pub capacity: usize,
    /// What `put` does when the store is at capacity.
    pub full_policy: FullPolicy,
    /// Freshness window applied when a put does not name one.
    pub default_stale_in_secs: u64,
    /// Hard expiry applied when a put does not name one.
    pub default_expire_in_secs: u64,
    /// Interval between expiry sweeps.
    pub sweep_interval_ms: u64,
    /// Maximum entries examined per sweep pass.
    pub sweep_batch_limit: usize,
}

/// Behavior when the store is at capacity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FullPolicy {
    /// Displace the least recently used entry.
    EvictLru,
    /// Refuse the write with a typed error.
    Reject,
}

/// Invalidation fan-out behavior.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct InvalidationConfig {
    /// Refresh mode applied when a dependency edge does not name one.
    pub default_mode: RefreshMode,
    /// Priority of refresh jobs created by invalidation.
    pub refresh_priority: i32,
    /// Priority of delayed cascade jobs created by invalidation.
    pub cascade_priority: i32,
}

/// Revalidation queue and worker pool tuning.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Number of concurrent revalidation workers.
    pub worker_concurrency: usize,
    /// Fallback poll interval while waiting for due jobs.
    pub poll_interval_ms: u64,
    /// Per-job producer timeout.
    pub producer_timeout_ms: u64,
    /// Attempts before a job is dead-lettered.
    pub max_attempts: u32,
    /// Base delay for exponential retry backoff.
    pub backoff_base_ms: u64,
    /// Upper bound for retry backoff.
    pub backoff_max_ms: u64,
    /// Jitter added on top of each backoff delay.
    pub backoff_jitter_ms: u64,
    /// Dead-lettered jobs retained for inspection.
    pub dead_letter_capacity: usize,
}

/// Adaptive access-policy tuning.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PolicyConfig {
    /// Half-life of the decayed access counter.
    pub half_life_secs: u64,
    /// Decayed count at or above which a key is hot.
    pub hot_threshold: f64,
    /// Decayed count at or below which a key is cold.
    pub cold_threshold: f64,
    /// Multiplier applied to `stale_in` for hot keys.
    pub hot_stale_factor: f64,
    /// Multiplier applied to `stale_in` for cold keys.
    pub cold_stale_factor: f64,
    /// Interval between background retune passes.
    pub retune_interval_ms: u64,
}

/// Cache warmer tuning.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WarmerConfig {
    /// Concurrent producer calls during a warm pass.
    pub concurrency: usize,
    /// Pause between launching successive warm fetches.
    pub inter_request_delay_ms: u64,
}

/// Logging subscriber settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default level directive, overridable via `RUST_LOG`.
    pub level: String,
    pub format: LogFormat,
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    Json,
    Compact,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_STORE_CAPACITY,
            full_policy: FullPolicy::EvictLru,
            default_stale_in_secs: DEFAULT_STALE_IN_SECS,
            default_expire_in_secs: DEFAULT_EXPIRE_IN_SECS,
            sweep_interval_ms: DEFAULT_SWEEP_INTERVAL_MS,
            sweep_batch_limit: DEFAULT_SWEEP_BATCH_LIMIT,
        }
    }
}

impl Default for InvalidationConfig {
    fn default() -> Self {
        Self {
            default_mode: RefreshMode::Smart,
            refresh_priority: DEFAULT_REFRESH_PRIORITY,
            cascade_priority: DEFAULT_CASCADE_PRIORITY,
        }
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            worker_concurrency: DEFAULT_WORKER_CONCURRENCY,
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            producer_timeout_ms: DEFAULT_PRODUCER_TIMEOUT_MS,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            backoff_base_ms: DEFAULT_BACKOFF_BASE_MS,
            backoff_max_ms: DEFAULT_BACKOFF_MAX_MS,
            backoff_jitter_ms: DEFAULT_BACKOFF_JITTER_MS,
            dead_letter_capacity: DEFAULT_DEAD_LETTER_CAPACITY,
        }
    }
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            half_life_secs: DEFAULT_HALF_LIFE_SECS,
            hot_threshold: DEFAULT_HOT_THRESHOLD,
            cold_threshold: DEFAULT_COLD_THRESHOLD,
            hot_stale_factor: DEFAULT_HOT_STALE_FACTOR,
            cold_stale_factor: DEFAULT_COLD_STALE_FACTOR,
            retune_interval_ms: DEFAULT_RETUNE_INTERVAL_MS,
        }
    }
}

impl Default for WarmerConfig {
    fn default() -> Self {
        Self {
            concurrency: DEFAULT_WARM_CONCURRENCY,
            inter_request_delay_ms: DEFAULT_WARM_DELAY_MS,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Compact,
        }
    }
}

impl StoreConfig {
    /// Returns the store capacity as NonZeroUsize, clamping to 1 if zero.
    pub fn capacity_non_zero(&self) -> NonZeroUsize {
        NonZeroUsize::new(self.capacity).unwrap_or(NonZeroUsize::MIN)
    }

    pub fn default_stale_in(&self) -> Duration {
        Duration::from_secs(self.default_stale_in_secs)
    }

    pub fn default_expire_in(&self) -> Duration {
        Duration::from_secs(self.default_expire_in_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }
}

impl QueueConfig {
    /// Returns the worker concurrency as NonZeroUsize, clamping to 1 if zero.
    pub fn worker_concurrency_non_zero(&self) -> NonZeroUsize {
        NonZeroUsize::new(self.worker_concurrency).unwrap_or(NonZeroUsize::MIN)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn producer_timeout(&self) -> Duration {
        Duration::from_millis(self.producer_timeout_ms)
    }

    /// Returns max attempts clamped to at least one try.
    pub fn max_attempts_non_zero(&self) -> NonZeroU32 {
        NonZeroU32::new(self.max_attempts).unwrap_or(NonZeroU32::MIN)
    }

    pub fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.backoff_base_ms)
    }

    pub fn backoff_max(&self) -> Duration {
        Duration::from_millis(self.backoff_max_ms)
    }

    pub fn backoff_jitter(&self) -> Duration {
        Duration::from_millis(self.backoff_jitter_ms)
    }
}

impl PolicyConfig {
    pub fn half_life(&self) -> Duration {
        Duration::from_secs(self.half_life_secs.max(1))
    }

    pub fn retune_interval(&self) -> Duration {
        Duration::from_millis(self.retune_interval_ms)
    }
}

impl WarmerConfig {
    /// Returns the warm concurrency as NonZeroUsize, clamping to 1 if zero.
    pub fn concurrency_non_zero(&self) -> NonZeroUsize {
        NonZeroUsize::new(self.concurrency).unwrap_or(NonZeroUsize::MIN)
    }

    pub fn inter_request_delay(&self) -> Option<Duration> {
        if self.inter_request_delay_ms == 0 {
            None
        } else {
            Some(Duration::from_millis(self.inter_request_delay_ms))
        }
    }
}
