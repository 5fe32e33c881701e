//! Rinfresco Cache Engine
//!
//! Staleness-aware caching with tag fan-out and background revalidation:
//!
//! - **Store**: versioned entries with fresh/stale/expired windows, served
//!   stale-while-revalidate
//! - **Invalidation**: tag index plus a dependency graph, walked with cycle
//!   protection and optional per-edge delays
//! - **Revalidation**: a priority queue drained by a bounded worker pool,
//!   with retry backoff and a dead-letter ring
//! - **Scheduling**: drift-free cron and fixed-period triggers
//! - **Policy**: decayed access counting that widens or narrows freshness
//!   windows per key
//!
//! ## Configuration
//!
//! Engine behavior is controlled via [`EngineConfig`], deserializable from
//! TOML:
//!
//! ```toml
//! [store]
//! capacity = 4096
//! default_stale_in_secs = 60
//! default_expire_in_secs = 3600
//!
//! [queue]
//! worker_concurrency = 4
//! max_attempts = 5
//! # ... see config.rs for all options
//! ```

mod clock;
mod config;
mod engine;
mod entry;
mod error;
mod graph;
mod invalidate;
mod job;
mod lock;
mod policy;
mod producer;
mod queue;
mod scheduler;
mod store;
mod tags;
pub mod telemetry;
mod warmer;
mod worker;

pub use clock::Clock;
pub use config::{
    EngineConfig, FullPolicy, InvalidationConfig, LogFormat, LoggingConfig, PolicyConfig,
    QueueConfig, StoreConfig, WarmerConfig,
};
pub use engine::Engine;
pub use entry::Freshness;
pub use error::{EngineError, ProduceError};
pub use graph::{DependencyEdge, DependencyGraph, RefreshMode, Target};
pub use invalidate::{FanoutPlan, Invalidator};
pub use job::{DeadLetterRecord, JobKind, JobStatus, RevalidationJob};
pub use policy::{AccessPolicy, Heat};
pub use producer::{Produced, Producer, ProducerRegistry};
pub use queue::{DeadLetterSink, PopOutcome, RevalidationQueue};
pub use scheduler::{ScheduleSnapshot, ScheduleSpec};
pub use store::{CacheStore, Hit};
pub use warmer::WarmSummary;
