use std::sync::Once;

use metrics::{Unit, describe_counter, describe_gauge, describe_histogram};
use tracing_error::ErrorLayer;
use tracing_subscriber::{
    EnvFilter, fmt,
    layer::{Layer, SubscriberExt},
    util::SubscriberInitExt,
};

use crate::config::{LogFormat, LoggingConfig};
use crate::error::EngineError;

static METRIC_DESCRIPTIONS: Once = Once::new();

/// Install a global tracing subscriber using the provided logging settings.
pub fn init(logging: &LoggingConfig) -> Result<(), EngineError> {
    describe_metrics();

    let default_directive = logging.level.parse().map_err(|err| {
        EngineError::telemetry(format!(
            "invalid logging level `{}`: {err}",
            logging.level
        ))
    })?;
    let env_filter = EnvFilter::builder()
        .with_default_directive(default_directive)
        .from_env_lossy();

    let fmt_layer = match logging.format {
        LogFormat::Json => fmt::layer()
            .json()
            .with_current_span(true)
            .with_span_list(true)
            .with_target(true)
            .boxed(),
        LogFormat::Compact => fmt::layer().compact().with_target(true).boxed(),
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(ErrorLayer::default())
        .with(fmt_layer)
        .try_init()
        .map_err(|err| {
            EngineError::telemetry(format!("failed to install tracing subscriber: {err}"))
        })
}

fn describe_metrics() {
    METRIC_DESCRIPTIONS.call_once(|| {
        describe_counter!(
            "rinfresco_store_hit_total",
            Unit::Count,
            "Total number of cache reads that returned a value."
        );
        describe_counter!(
            "rinfresco_store_miss_total",
            Unit::Count,
            "Total number of cache reads that found nothing servable."
        );
        describe_counter!(
            "rinfresco_store_put_total",
            Unit::Count,
            "Total number of cache writes."
        );
        describe_counter!(
            "rinfresco_store_evict_total",
            Unit::Count,
            "Total number of entries removed from the store."
        );
        describe_counter!(
            "rinfresco_store_stale_write_rejected_total",
            Unit::Count,
            "Total number of versioned writes dropped for observing an old version."
        );
        describe_gauge!(
            "rinfresco_store_entries",
            Unit::Count,
            "Current number of entries held by the store."
        );
        describe_counter!(
            "rinfresco_queue_enqueued_total",
            Unit::Count,
            "Total number of jobs accepted by the revalidation queue."
        );
        describe_counter!(
            "rinfresco_queue_coalesced_total",
            Unit::Count,
            "Total number of jobs merged into an already-pending job."
        );
        describe_gauge!(
            "rinfresco_queue_depth",
            Unit::Count,
            "Current number of pending revalidation jobs."
        );
        describe_counter!(
            "rinfresco_queue_dead_letter_total",
            Unit::Count,
            "Total number of jobs that exhausted their retry budget."
        );
        describe_counter!(
            "rinfresco_jobs_total",
            Unit::Count,
            "Total number of executed jobs by outcome."
        );
        describe_histogram!(
            "rinfresco_job_duration_seconds",
            Unit::Seconds,
            "Job execution latency by kind."
        );
        describe_counter!(
            "rinfresco_invalidate_pass_total",
            Unit::Count,
            "Total number of invalidation passes by refresh mode."
        );
        describe_counter!(
            "rinfresco_invalidate_staled_total",
            Unit::Count,
            "Total number of entries marked stale by invalidation passes."
        );
        describe_counter!(
            "rinfresco_invalidate_evicted_total",
            Unit::Count,
            "Total number of entries evicted by invalidation passes."
        );
        describe_counter!(
            "rinfresco_invalidate_unknown_target_total",
            Unit::Count,
            "Total number of invalidated targets that resolved to nothing."
        );
        describe_histogram!(
            "rinfresco_invalidate_duration_seconds",
            Unit::Seconds,
            "Invalidation pass latency."
        );
        describe_gauge!(
            "rinfresco_policy_tracked_keys",
            Unit::Count,
            "Current number of keys with access statistics."
        );
        describe_counter!(
            "rinfresco_schedule_fired_total",
            Unit::Count,
            "Total number of scheduled revalidation firings."
        );
        describe_gauge!(
            "rinfresco_schedules",
            Unit::Count,
            "Current number of registered schedules."
        );
        describe_counter!(
            "rinfresco_warm_warmed_total",
            Unit::Count,
            "Total number of entries populated by warm passes."
        );
        describe_counter!(
            "rinfresco_warm_skipped_total",
            Unit::Count,
            "Total number of warm keys skipped as already fresh."
        );
        describe_counter!(
            "rinfresco_warm_failed_total",
            Unit::Count,
            "Total number of warm keys whose producer failed."
        );
        describe_histogram!(
            "rinfresco_warm_duration_seconds",
            Unit::Seconds,
            "Warm pass latency."
        );
    });
}
