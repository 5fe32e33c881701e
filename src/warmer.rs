//! Best-effort cache warming.
//!
//! Runs registered producers for a set of keys ahead of demand, bounded by
//! a concurrency limit. Keys that are already fresh are left alone and
//! individual producer failures skip the key rather than aborting the pass.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use futures::{StreamExt, stream};
use metrics::{counter, histogram};
use tracing::{debug, info, instrument, warn};

use crate::config::WarmerConfig;
use crate::entry::Freshness;
use crate::producer::ProducerRegistry;
use crate::store::CacheStore;
use crate::worker::Shutdown;

const METRIC_WARMED_TOTAL: &str = "rinfresco_warm_warmed_total";
const METRIC_SKIPPED_TOTAL: &str = "rinfresco_warm_skipped_total";
const METRIC_FAILED_TOTAL: &str = "rinfresco_warm_failed_total";
const METRIC_WARM_DURATION: &str = "rinfresco_warm_duration_seconds";

/// Counts from one warm pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WarmSummary {
    pub requested: usize,
    pub warmed: usize,
    pub skipped: usize,
    pub failed: usize,
}

impl fmt::Display for WarmSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "WarmSummary {{ requested: {}, warmed: {}, skipped: {}, failed: {} }}",
            self.requested, self.warmed, self.skipped, self.failed
        )
    }
}

/// Populates cache entries ahead of demand through the producer registry.
pub struct Warmer {
    store: Arc<CacheStore>,
    registry: Arc<ProducerRegistry>,
    concurrency: usize,
    inter_request_delay: Option<Duration>,
    shutdown: Shutdown,
}

impl Warmer {
    pub(crate) fn new(
        store: Arc<CacheStore>,
        registry: Arc<ProducerRegistry>,
        config: &WarmerConfig,
        shutdown: Shutdown,
    ) -> Self {
        Self {
            store,
            registry,
            concurrency: config.concurrency_non_zero().get(),
            inter_request_delay: config.inter_request_delay(),
            shutdown,
        }
    }

    /// Warm every key in `keys` that is not already fresh. Producer
    /// failures and missing producers skip the key; the pass always runs
    /// to completion unless shutdown is signaled.
    #[instrument(skip(self, keys), fields(requested = keys.len()))]
    pub async fn warm(&self, keys: Vec<String>) -> WarmSummary {
        let started = Instant::now();
        let requested = keys.len();
        info!(requested, concurrency = self.concurrency, "Warming cache");

        let warmed = Arc::new(AtomicUsize::new(0));
        let skipped = Arc::new(AtomicUsize::new(0));
        let failed = Arc::new(AtomicUsize::new(0));

        stream::iter(keys)
            .for_each_concurrent(Some(self.concurrency), |key| {
                let warmed = Arc::clone(&warmed);
                let skipped = Arc::clone(&skipped);
                let failed = Arc::clone(&failed);
                async move {
                    if self.shutdown.is_signaled() {
                        skipped.fetch_add(1, Ordering::Relaxed);
                        return;
                    }
                    match self.warm_one(&key).await {
                        WarmOutcome::Warmed => warmed.fetch_add(1, Ordering::Relaxed),
                        WarmOutcome::Skipped => skipped.fetch_add(1, Ordering::Relaxed),
                        WarmOutcome::Failed => failed.fetch_add(1, Ordering::Relaxed),
                    };
                    if let Some(delay) = self.inter_request_delay {
                        tokio::time::sleep(delay).await;
                    }
                }
            })
            .await;

        let summary = WarmSummary {
            requested,
            warmed: warmed.load(Ordering::Relaxed),
            skipped: skipped.load(Ordering::Relaxed),
            failed: failed.load(Ordering::Relaxed),
        };
        counter!(METRIC_WARMED_TOTAL).increment(summary.warmed as u64);
        counter!(METRIC_SKIPPED_TOTAL).increment(summary.skipped as u64);
        counter!(METRIC_FAILED_TOTAL).increment(summary.failed as u64);
        histogram!(METRIC_WARM_DURATION).record(started.elapsed().as_secs_f64());
        info!(
            warmed = summary.warmed,
            skipped = summary.skipped,
            failed = summary.failed,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Cache warm complete"
        );
        summary
    }

    async fn warm_one(&self, key: &str) -> WarmOutcome {
        if self.store.freshness(key) == Some(Freshness::Fresh) {
            debug!(key = %key, "Skipping warm, entry already fresh");
            return WarmOutcome::Skipped;
        }

        let Some(producer) = self.registry.resolve(key) else {
            warn!(key = %key, "No producer registered for key, skipping warm");
            return WarmOutcome::Failed;
        };

        let produced = match producer.produce(key).await {
            Ok(produced) => produced,
            Err(err) => {
                warn!(key = %key, error = %err, "Warm producer failed, skipping key");
                return WarmOutcome::Failed;
            }
        };

        match self.store.put(
            key,
            produced.value,
            produced.tags,
            produced.stale_in,
            produced.expire_in,
        ) {
            Ok(version) => {
                info!(key = %key, version, "Cache entry warmed");
                WarmOutcome::Warmed
            }
            Err(err) => {
                warn!(key = %key, error = %err, "Failed to store warmed entry");
                WarmOutcome::Failed
            }
        }
    }
}

enum WarmOutcome {
    Warmed,
    Skipped,
    Failed,
}
