//! End-to-end engine flows: a manual clock drives freshness while real
//! background workers drain the queue under paused tokio time.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use rinfresco::{
    Clock, Engine, EngineConfig, Freshness, ProduceError, Produced, Producer, RefreshMode, Target,
};
use time::OffsetDateTime;
use time::macros::datetime;

const T0: OffsetDateTime = datetime!(2026-01-01 00:00:00 UTC);

struct CountingProducer {
    calls: AtomicUsize,
    body: &'static str,
}

impl CountingProducer {
    fn new(body: &'static str) -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            body,
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Producer for CountingProducer {
    async fn produce(&self, key: &str) -> Result<Produced, ProduceError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(Produced::new(self.body).with_tags([format!("tag:{key}")]))
    }
}

struct FailingProducer;

#[async_trait]
impl Producer for FailingProducer {
    async fn produce(&self, _key: &str) -> Result<Produced, ProduceError> {
        Err(ProduceError::new("backend down"))
    }
}

fn test_config() -> EngineConfig {
    let mut config = EngineConfig::default();
    config.queue.poll_interval_ms = 5;
    config.queue.backoff_base_ms = 0;
    config.queue.backoff_jitter_ms = 0;
    config.queue.max_attempts = 3;
    config
}

fn test_engine() -> (Clock, Arc<Engine>) {
    let clock = Clock::manual(T0);
    let engine = Engine::with_clock(test_config(), clock.clone());
    (clock, engine)
}

async fn eventually(what: &str, check: impl Fn() -> bool) {
    for _ in 0..500 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("timed out waiting for {what}");
}

#[tokio::test(start_paused = true)]
async fn stale_read_serves_old_value_and_refreshes_in_background() {
    let (clock, engine) = test_engine();
    let producer = CountingProducer::new("regenerated");
    engine.register_producer("post:", Arc::clone(&producer) as Arc<dyn Producer>);
    engine.start();

    engine
        .put("post:42", "original", ["tag:post:42"], None, None)
        .expect("put should succeed");
    clock.advance(Duration::from_secs(61));

    let hit = engine.get("post:42").expect("stale entry should serve");
    assert_eq!(hit.value, Bytes::from_static(b"original"));
    assert_eq!(hit.freshness, Freshness::Stale);

    eventually("background refresh to land", || {
        engine.version("post:42") == Some(2)
    })
    .await;

    let hit = engine.get("post:42").expect("refreshed entry should serve");
    assert_eq!(hit.value, Bytes::from_static(b"regenerated"));
    assert_eq!(hit.freshness, Freshness::Fresh);
    assert_eq!(producer.calls(), 1);

    engine.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn dependency_fanout_applies_delays_through_the_queue() {
    let (clock, engine) = test_engine();
    engine.start();

    engine
        .put("post:42", "post", ["tag:post:42"], None, None)
        .expect("put should succeed");
    engine
        .put("feed:home", "feed", ["tag:feed"], None, None)
        .expect("put should succeed");
    engine
        .put("sitemap", "xml", ["tag:sitemap"], None, None)
        .expect("put should succeed");
    engine.register_dependency(
        Target::tag("tag:post:42"),
        Target::tag("tag:feed"),
        Duration::ZERO,
        RefreshMode::Lazy,
    );
    engine.register_dependency(
        Target::tag("tag:feed"),
        Target::tag("tag:sitemap"),
        Duration::from_secs(5),
        RefreshMode::Lazy,
    );

    let plan =
        engine.invalidate_with_mode(Target::tag("tag:post:42"), "post edited", RefreshMode::Lazy);
    assert_eq!(plan.staled.len(), 2);
    assert_eq!(plan.delayed, vec![Target::tag("tag:sitemap")]);

    // The zero-delay edge lands in the same pass, the delayed one does not.
    assert_eq!(engine.freshness("post:42"), Some(Freshness::Stale));
    assert_eq!(engine.freshness("feed:home"), Some(Freshness::Stale));
    assert_eq!(engine.freshness("sitemap"), Some(Freshness::Fresh));

    clock.advance(Duration::from_secs(6));
    eventually("delayed cascade to stale the sitemap", || {
        engine.freshness("sitemap") == Some(Freshness::Stale)
    })
    .await;

    engine.shutdown().await;
}

#[test]
fn cyclic_dependencies_terminate_in_one_pass() {
    let (_clock, engine) = test_engine();
    engine
        .put("a", "a", ["tag:a"], None, None)
        .expect("put should succeed");
    engine
        .put("b", "b", ["tag:b"], None, None)
        .expect("put should succeed");
    engine.register_dependency(
        Target::tag("tag:a"),
        Target::tag("tag:b"),
        Duration::ZERO,
        RefreshMode::Lazy,
    );
    engine.register_dependency(
        Target::tag("tag:b"),
        Target::tag("tag:a"),
        Duration::ZERO,
        RefreshMode::Lazy,
    );

    let plan = engine.invalidate_with_mode(Target::tag("tag:a"), "loop", RefreshMode::Lazy);

    assert_eq!(plan.staled.len(), 2);
    assert_eq!(plan.visited, 2);
    assert_eq!(engine.freshness("a"), Some(Freshness::Stale));
    assert_eq!(engine.freshness("b"), Some(Freshness::Stale));
    assert_eq!(engine.queue_depth(), 0);
}

#[tokio::test(start_paused = true)]
async fn late_refresh_results_never_overwrite_newer_data() {
    let (clock, engine) = test_engine();
    let producer = CountingProducer::new("late result");
    engine.register_producer("post:", Arc::clone(&producer) as Arc<dyn Producer>);

    engine
        .put("post:42", "v1", ["tag:post:42"], None, None)
        .expect("put should succeed");
    clock.advance(Duration::from_secs(61));

    // The stale read queues a refresh that observed version 1.
    engine.get("post:42");
    assert_eq!(engine.queue_depth(), 1);

    // A direct write lands before any worker runs.
    engine
        .put("post:42", "manual edit", ["tag:post:42"], None, None)
        .expect("put should succeed");

    engine.start();
    eventually("the queued refresh to run", || producer.calls() == 1).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(engine.version("post:42"), Some(2));
    let hit = engine.get("post:42").expect("entry should serve");
    assert_eq!(hit.value, Bytes::from_static(b"manual edit"));
    assert!(engine.dead_letters().is_empty());

    engine.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn failing_producer_retries_then_dead_letters() {
    let (clock, engine) = test_engine();
    engine.register_producer("post:", Arc::new(FailingProducer));
    engine
        .put("post:42", "original", ["tag:post:42"], None, None)
        .expect("put should succeed");
    clock.advance(Duration::from_secs(61));
    engine.get("post:42");
    engine.start();

    eventually("the job to dead-letter", || engine.dead_letters().len() == 1).await;

    let record = engine.dead_letters().remove(0);
    assert_eq!(record.target, "key:post:42");
    assert_eq!(record.attempts, 3);
    assert!(record.error.contains("backend down"));

    // The stale value keeps serving after the refresh gave up.
    assert_eq!(engine.freshness("post:42"), Some(Freshness::Stale));

    engine.shutdown().await;
}

#[tokio::test]
async fn warm_populates_entries_before_demand() {
    let (_clock, engine) = test_engine();
    let producer = CountingProducer::new("warmed");
    engine.register_producer("", Arc::clone(&producer) as Arc<dyn Producer>);

    let summary = engine
        .warm(vec!["page:about".to_string(), "page:contact".to_string()])
        .await;

    assert_eq!(summary.warmed, 2);
    assert_eq!(producer.calls(), 2);
    let hit = engine.get("page:about").expect("warmed entry should serve");
    assert_eq!(hit.freshness, Freshness::Fresh);
}

#[tokio::test(start_paused = true)]
async fn scheduled_invalidation_fires_from_the_background_loop() {
    let (clock, engine) = test_engine();
    engine.start();
    engine
        .put("feed:home", "feed", ["tag:feed"], None, None)
        .expect("put should succeed");
    engine
        .register_schedule("feed", "every 60s", vec![Target::tag("tag:feed")], true)
        .expect("schedule should register");

    clock.advance(Duration::from_secs(61));
    eventually("the schedule to fire", || {
        engine.freshness("feed:home") == Some(Freshness::Stale)
    })
    .await;

    engine.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn aggressive_invalidation_evicts_then_repopulates() {
    let (_clock, engine) = test_engine();
    let producer = CountingProducer::new("rebuilt");
    engine.register_producer("post:", Arc::clone(&producer) as Arc<dyn Producer>);
    engine
        .put("post:42", "original", ["tag:post:42"], None, None)
        .expect("put should succeed");

    let plan =
        engine.invalidate_with_mode(Target::tag("tag:post:42"), "rebuild", RefreshMode::Aggressive);
    assert_eq!(plan.evicted, vec!["post:42".to_string()]);
    assert_eq!(plan.refreshes, vec!["post:42".to_string()]);
    assert!(engine.get("post:42").is_none());

    engine.start();
    eventually("the refresh to repopulate the entry", || {
        engine.contains("post:42")
    })
    .await;

    let hit = engine.get("post:42").expect("rebuilt entry should serve");
    assert_eq!(hit.value, Bytes::from_static(b"rebuilt"));
    assert_eq!(engine.version("post:42"), Some(2));

    engine.shutdown().await;
}
