//! Staleness-aware cache store.
//!
//! Entries carry freshness timestamps and a per-key monotonic version
//! counter. The tag index lives inside the store's lock and is updated in
//! the same critical section as the entry mutation it describes, so it is
//! always a pure function of store contents.

use std::collections::{HashMap, HashSet};
use std::sync::RwLock;
use std::time::Duration;

use bytes::Bytes;
use lru::LruCache;
use metrics::{counter, gauge};
use time::OffsetDateTime;
use tracing::debug;

use crate::clock::Clock;
use crate::config::{FullPolicy, StoreConfig};
use crate::entry::{CacheEntry, Freshness};
use crate::error::EngineError;
use crate::lock::recover;
use crate::tags::TagIndex;

const SOURCE: &str = "store";

const METRIC_HIT_TOTAL: &str = "rinfresco_store_hit_total";
const METRIC_MISS_TOTAL: &str = "rinfresco_store_miss_total";
const METRIC_PUT_TOTAL: &str = "rinfresco_store_put_total";
const METRIC_EVICT_TOTAL: &str = "rinfresco_store_evict_total";
const METRIC_STALE_WRITE_REJECTED_TOTAL: &str = "rinfresco_store_stale_write_rejected_total";
const METRIC_ENTRIES: &str = "rinfresco_store_entries";

/// A successful lookup.
#[derive(Debug, Clone)]
pub struct Hit {
    pub value: Bytes,
    pub freshness: Freshness,
    pub version: u64,
}

struct StoreInner {
    entries: LruCache<String, CacheEntry>,
    tags: TagIndex,
    /// Last written version per key. Survives eviction so a refresh started
    /// before an evict is still version-checked on write-back.
    versions: HashMap<String, u64>,
}

/// Key/value store of cached artifacts.
///
/// Reads take the write lock: an LRU hit bumps recency and access stats.
pub struct CacheStore {
    inner: RwLock<StoreInner>,
    capacity: usize,
    full_policy: FullPolicy,
    default_stale_in: Duration,
    default_expire_in: Duration,
    clock: Clock,
}

impl CacheStore {
    /// Create a store with the given configuration and time source.
    pub fn new(config: &StoreConfig, clock: Clock) -> Self {
        Self {
            inner: RwLock::new(StoreInner {
                entries: LruCache::new(config.capacity_non_zero()),
                tags: TagIndex::new(),
                versions: HashMap::new(),
            }),
            capacity: config.capacity_non_zero().get(),
            full_policy: config.full_policy,
            default_stale_in: config.default_stale_in(),
            default_expire_in: config.default_expire_in(),
            clock,
        }
    }

    /// Look up a key. Expired entries read as misses; they are removed by
    /// the sweeper, not here.
    pub fn get(&self, key: &str) -> Option<Hit> {
        let now = self.clock.now();
        let mut inner = recover(self.inner.write(), SOURCE, "get");

        let Some(entry) = inner.entries.get_mut(key) else {
            counter!(METRIC_MISS_TOTAL).increment(1);
            return None;
        };

        let freshness = entry.freshness(now);
        if freshness == Freshness::Expired {
            counter!(METRIC_MISS_TOTAL).increment(1);
            return None;
        }

        entry.record_access(now);
        counter!(METRIC_HIT_TOTAL, "freshness" => freshness.as_str()).increment(1);

        Some(Hit {
            value: entry.value.clone(),
            freshness,
            version: entry.version,
        })
    }

    /// Write a key unconditionally. Returns the new version.
    ///
    /// `stale_in`/`expire_in` default from configuration when absent.
    /// Timestamps are stamped from `now` inside the critical section, so the
    /// writer's own next `get` observes the entry fresh.
    pub fn put(
        &self,
        key: &str,
        value: Bytes,
        tags: HashSet<String>,
        stale_in: Option<Duration>,
        expire_in: Option<Duration>,
    ) -> Result<u64, EngineError> {
        let mut inner = recover(self.inner.write(), SOURCE, "put");
        self.put_locked(&mut inner, key, value, tags, stale_in, expire_in)
    }

    /// Write a key only if its version has not advanced past the one the
    /// caller observed when the refresh began. Returns `Ok(None)` when the
    /// write is discarded as stale.
    pub fn put_versioned(
        &self,
        key: &str,
        value: Bytes,
        tags: HashSet<String>,
        stale_in: Option<Duration>,
        expire_in: Option<Duration>,
        observed_version: u64,
    ) -> Result<Option<u64>, EngineError> {
        let mut inner = recover(self.inner.write(), SOURCE, "put_versioned");

        let current = inner.versions.get(key).copied().unwrap_or(0);
        if current > observed_version {
            counter!(METRIC_STALE_WRITE_REJECTED_TOTAL).increment(1);
            debug!(
                key,
                observed_version, current, "Discarded stale refresh result"
            );
            return Ok(None);
        }

        self.put_locked(&mut inner, key, value, tags, stale_in, expire_in)
            .map(Some)
    }

    fn put_locked(
        &self,
        inner: &mut StoreInner,
        key: &str,
        value: Bytes,
        tags: HashSet<String>,
        stale_in: Option<Duration>,
        expire_in: Option<Duration>,
    ) -> Result<u64, EngineError> {
        if self.full_policy == FullPolicy::Reject
            && inner.entries.len() >= self.capacity
            && !inner.entries.contains(key)
        {
            return Err(EngineError::store_full(self.capacity));
        }

        let now = self.clock.now();
        let expire_in = expire_in.unwrap_or(self.default_expire_in);
        let stale_in = stale_in.unwrap_or(self.default_stale_in).min(expire_in);
        let version = inner.versions.get(key).copied().unwrap_or(0) + 1;

        let entry = CacheEntry {
            value,
            tags: tags.clone(),
            version,
            created_at: now,
            stale_at: now + stale_in,
            expire_at: now + expire_in,
            access_count: 0,
            last_access_at: now,
        };

        if let Some((displaced, _)) = inner.entries.push(key.to_string(), entry) {
            if displaced != key {
                inner.tags.deindex(&displaced);
                counter!(METRIC_EVICT_TOTAL, "reason" => "capacity").increment(1);
                debug!(key = %displaced, "Displaced least recently used entry");
            }
        }
        inner.tags.index(key, &tags);
        inner.versions.insert(key.to_string(), version);

        counter!(METRIC_PUT_TOTAL).increment(1);
        gauge!(METRIC_ENTRIES).set(inner.entries.len() as f64);

        Ok(version)
    }

    /// Hard-evict a key, removing value and tag memberships together.
    /// The version counter is kept so later versioned writes stay ordered.
    pub fn evict(&self, key: &str) -> bool {
        let mut inner = recover(self.inner.write(), SOURCE, "evict");
        let existed = inner.entries.pop(key).is_some();
        if existed {
            inner.tags.deindex(key);
            counter!(METRIC_EVICT_TOTAL, "reason" => "explicit").increment(1);
            gauge!(METRIC_ENTRIES).set(inner.entries.len() as f64);
        }
        existed
    }

    /// Soft-invalidate one key. Returns true when the entry existed.
    pub fn soft_invalidate_key(&self, key: &str) -> bool {
        let now = self.clock.now();
        let mut inner = recover(self.inner.write(), SOURCE, "soft_invalidate_key");
        match inner.entries.peek_mut(key) {
            Some(entry) => {
                entry.mark_stale(now);
                true
            }
            None => false,
        }
    }

    /// Soft-invalidate every key carrying a tag, resolving and marking in
    /// one critical section. Returns the matched keys.
    pub fn soft_invalidate_tag(&self, tag: &str) -> Vec<String> {
        let now = self.clock.now();
        let mut inner = recover(self.inner.write(), SOURCE, "soft_invalidate_tag");
        let keys: Vec<String> = inner.tags.keys_for_tag(tag).into_iter().collect();
        for key in &keys {
            if let Some(entry) = inner.entries.peek_mut(key) {
                entry.mark_stale(now);
            }
        }
        keys
    }

    /// Hard-evict every key carrying a tag. Returns the evicted keys.
    pub fn evict_tag(&self, tag: &str) -> Vec<String> {
        let mut inner = recover(self.inner.write(), SOURCE, "evict_tag");
        let keys: Vec<String> = inner.tags.keys_for_tag(tag).into_iter().collect();
        for key in &keys {
            inner.entries.pop(key);
            inner.tags.deindex(key);
            counter!(METRIC_EVICT_TOTAL, "reason" => "explicit").increment(1);
        }
        gauge!(METRIC_ENTRIES).set(inner.entries.len() as f64);
        keys
    }

    /// Remove entries past hard expiry, at most `limit` per pass.
    ///
    /// `has_pending_job` lets the caller protect keys with an in-flight
    /// refresh: their entry stays until the job resolves.
    pub fn sweep<F>(&self, limit: usize, has_pending_job: F) -> usize
    where
        F: Fn(&str) -> bool,
    {
        let now = self.clock.now();
        let mut inner = recover(self.inner.write(), SOURCE, "sweep");

        let expired: Vec<String> = inner
            .entries
            .iter()
            .filter(|(key, entry)| {
                entry.freshness(now) == Freshness::Expired && !has_pending_job(key)
            })
            .map(|(key, _)| key.clone())
            .take(limit)
            .collect();

        for key in &expired {
            inner.entries.pop(key);
            inner.tags.deindex(key);
            counter!(METRIC_EVICT_TOTAL, "reason" => "expired").increment(1);
        }
        if !expired.is_empty() {
            gauge!(METRIC_ENTRIES).set(inner.entries.len() as f64);
        }

        expired.len()
    }

    /// Current freshness of a key without touching recency or access stats.
    pub fn freshness(&self, key: &str) -> Option<Freshness> {
        let now = self.clock.now();
        recover(self.inner.read(), SOURCE, "freshness")
            .entries
            .peek(key)
            .map(|entry| entry.freshness(now))
    }

    /// Last written version for a key, if it was ever written.
    pub fn version(&self, key: &str) -> Option<u64> {
        recover(self.inner.read(), SOURCE, "version")
            .versions
            .get(key)
            .copied()
    }

    /// Keys currently carrying a tag.
    pub fn keys_for_tag(&self, tag: &str) -> HashSet<String> {
        recover(self.inner.read(), SOURCE, "keys_for_tag")
            .tags
            .keys_for_tag(tag)
    }

    /// Tags a cached key currently carries.
    pub fn tags_for_key(&self, key: &str) -> HashSet<String> {
        recover(self.inner.read(), SOURCE, "tags_for_key")
            .tags
            .tags_for_key(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        recover(self.inner.read(), SOURCE, "contains")
            .entries
            .contains(key)
    }

    pub fn len(&self) -> usize {
        recover(self.inner.read(), SOURCE, "len").entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop all entries, memberships, and version counters.
    pub fn clear(&self) {
        let mut inner = recover(self.inner.write(), SOURCE, "clear");
        inner.entries.clear();
        inner.tags.clear();
        inner.versions.clear();
        gauge!(METRIC_ENTRIES).set(0.0);
    }
}

#[cfg(test)]
mod tests {
    use std::panic::{AssertUnwindSafe, catch_unwind};

    use time::macros::datetime;

    use super::*;

    fn sample_store(clock: Clock) -> CacheStore {
        CacheStore::new(&StoreConfig::default(), clock)
    }

    fn sample_tags(names: &[&str]) -> HashSet<String> {
        names.iter().map(|name| name.to_string()).collect()
    }

    fn put_simple(store: &CacheStore, key: &str, body: &str, tags: &[&str]) -> u64 {
        store
            .put(
                key,
                Bytes::copy_from_slice(body.as_bytes()),
                sample_tags(tags),
                None,
                None,
            )
            .expect("put should succeed")
    }

    #[test]
    fn put_get_roundtrip() {
        let store = sample_store(Clock::default());

        assert!(store.get("post:42").is_none());

        let version = put_simple(&store, "post:42", "v1", &["posts"]);
        assert_eq!(version, 1);

        let hit = store.get("post:42").expect("cached entry");
        assert_eq!(hit.value, Bytes::from_static(b"v1"));
        assert_eq!(hit.freshness, Freshness::Fresh);
        assert_eq!(hit.version, 1);
    }

    #[test]
    fn freshness_follows_the_clock() {
        let clock = Clock::manual(datetime!(2026-01-01 00:00:00 UTC));
        let store = sample_store(clock.clone());

        store
            .put(
                "post:42",
                Bytes::from_static(b"v1"),
                sample_tags(&["posts"]),
                Some(Duration::from_secs(60)),
                Some(Duration::from_secs(3600)),
            )
            .expect("put should succeed");

        assert_eq!(store.get("post:42").map(|hit| hit.freshness), Some(Freshness::Fresh));

        clock.advance(Duration::from_secs(61));
        assert_eq!(store.get("post:42").map(|hit| hit.freshness), Some(Freshness::Stale));

        clock.advance(Duration::from_secs(3600));
        assert!(store.get("post:42").is_none());
    }

    #[test]
    fn timestamps_stay_ordered_even_when_stale_exceeds_expire() {
        let clock = Clock::manual(datetime!(2026-01-01 00:00:00 UTC));
        let store = sample_store(clock.clone());

        store
            .put(
                "post:42",
                Bytes::from_static(b"v1"),
                HashSet::new(),
                Some(Duration::from_secs(7200)),
                Some(Duration::from_secs(3600)),
            )
            .expect("put should succeed");

        // stale_in is clamped to expire_in, so the entry goes straight from
        // fresh to expired rather than claiming freshness past expiry.
        clock.advance(Duration::from_secs(3599));
        assert_eq!(store.get("post:42").map(|hit| hit.freshness), Some(Freshness::Fresh));
        clock.advance(Duration::from_secs(1));
        assert!(store.get("post:42").is_none());
    }

    #[test]
    fn versions_stay_monotonic_under_concurrent_puts() {
        let store = std::sync::Arc::new(sample_store(Clock::default()));

        let mut writers = Vec::new();
        for _ in 0..4 {
            let store = std::sync::Arc::clone(&store);
            writers.push(std::thread::spawn(move || {
                (0..25)
                    .map(|_| {
                        store
                            .put("post:42", Bytes::from_static(b"v"), HashSet::new(), None, None)
                            .expect("put should succeed")
                    })
                    .collect::<Vec<u64>>()
            }));
        }

        let mut versions: Vec<u64> = writers
            .into_iter()
            .flat_map(|writer| writer.join().expect("writer thread should not panic"))
            .collect();
        versions.sort_unstable();

        // Every writer got a distinct, gapless version.
        assert_eq!(versions, (1..=100).collect::<Vec<u64>>());
        assert_eq!(store.version("post:42"), Some(100));
    }

    #[test]
    fn version_increments_across_puts_and_evictions() {
        let store = sample_store(Clock::default());

        assert_eq!(put_simple(&store, "post:42", "v1", &["posts"]), 1);
        assert_eq!(put_simple(&store, "post:42", "v2", &["posts"]), 2);

        store.evict("post:42");
        assert!(store.get("post:42").is_none());

        // Eviction does not reset the counter.
        assert_eq!(put_simple(&store, "post:42", "v3", &["posts"]), 3);
        assert_eq!(store.version("post:42"), Some(3));
    }

    #[test]
    fn versioned_put_discards_stale_write() {
        let store = sample_store(Clock::default());

        put_simple(&store, "post:42", "v1", &["posts"]);

        // A refresh observes version 1, then a direct write lands version 2.
        let observed = store.version("post:42").expect("version");
        put_simple(&store, "post:42", "v2", &["posts"]);

        let result = store
            .put_versioned(
                "post:42",
                Bytes::from_static(b"slow-refresh"),
                sample_tags(&["posts"]),
                None,
                None,
                observed,
            )
            .expect("versioned put should not error");

        assert_eq!(result, None);
        let hit = store.get("post:42").expect("entry");
        assert_eq!(hit.value, Bytes::from_static(b"v2"));
        assert_eq!(hit.version, 2);
    }

    #[test]
    fn versioned_put_applies_when_version_unchanged() {
        let store = sample_store(Clock::default());

        put_simple(&store, "post:42", "v1", &["posts"]);
        let observed = store.version("post:42").expect("version");

        let result = store
            .put_versioned(
                "post:42",
                Bytes::from_static(b"v2"),
                sample_tags(&["posts"]),
                None,
                None,
                observed,
            )
            .expect("versioned put should not error");

        assert_eq!(result, Some(2));
        assert_eq!(
            store.get("post:42").map(|hit| hit.value),
            Some(Bytes::from_static(b"v2"))
        );
    }

    #[test]
    fn reput_replaces_tag_memberships() {
        let store = sample_store(Clock::default());

        put_simple(&store, "post:42", "v1", &["posts", "featured"]);
        put_simple(&store, "post:42", "v2", &["posts"]);

        assert!(store.keys_for_tag("posts").contains("post:42"));
        assert!(store.keys_for_tag("featured").is_empty());
        assert_eq!(store.tags_for_key("post:42"), sample_tags(&["posts"]));
    }

    #[test]
    fn evict_removes_value_and_memberships() {
        let store = sample_store(Clock::default());

        put_simple(&store, "post:42", "v1", &["posts"]);
        assert!(store.evict("post:42"));

        assert!(store.get("post:42").is_none());
        assert!(store.keys_for_tag("posts").is_empty());
        assert!(!store.evict("post:42"));
    }

    #[test]
    fn capacity_displacement_deindexes_lru_key() {
        let config = StoreConfig {
            capacity: 2,
            ..Default::default()
        };
        let store = CacheStore::new(&config, Clock::default());

        put_simple(&store, "post:1", "a", &["posts"]);
        put_simple(&store, "post:2", "b", &["posts"]);
        put_simple(&store, "post:3", "c", &["posts"]);

        assert!(store.get("post:1").is_none());
        assert!(!store.keys_for_tag("posts").contains("post:1"));
        assert!(store.keys_for_tag("posts").contains("post:2"));
        assert!(store.keys_for_tag("posts").contains("post:3"));
    }

    #[test]
    fn reject_policy_surfaces_store_full() {
        let config = StoreConfig {
            capacity: 1,
            full_policy: FullPolicy::Reject,
            ..Default::default()
        };
        let store = CacheStore::new(&config, Clock::default());

        put_simple(&store, "post:1", "a", &[]);

        let err = store
            .put("post:2", Bytes::from_static(b"b"), HashSet::new(), None, None)
            .expect_err("second key should be rejected");
        assert!(matches!(err, EngineError::StoreFull { capacity: 1 }));

        // Rewriting the resident key is still allowed.
        assert_eq!(put_simple(&store, "post:1", "a2", &[]), 2);
    }

    #[test]
    fn soft_invalidate_tag_marks_matched_keys() {
        let clock = Clock::manual(datetime!(2026-01-01 00:00:00 UTC));
        let store = sample_store(clock.clone());

        put_simple(&store, "post:1", "a", &["posts"]);
        put_simple(&store, "post:2", "b", &["posts"]);
        put_simple(&store, "page:about", "c", &["pages"]);

        let mut matched = store.soft_invalidate_tag("posts");
        matched.sort();
        assert_eq!(matched, vec!["post:1".to_string(), "post:2".to_string()]);

        assert_eq!(store.get("post:1").map(|hit| hit.freshness), Some(Freshness::Stale));
        assert_eq!(store.get("post:2").map(|hit| hit.freshness), Some(Freshness::Stale));
        assert_eq!(
            store.get("page:about").map(|hit| hit.freshness),
            Some(Freshness::Fresh)
        );

        // Idempotent: a second pass leaves the same state behind.
        store.soft_invalidate_tag("posts");
        assert_eq!(store.get("post:1").map(|hit| hit.freshness), Some(Freshness::Stale));
    }

    #[test]
    fn soft_invalidated_entry_stays_servable_until_expiry() {
        let clock = Clock::manual(datetime!(2026-01-01 00:00:00 UTC));
        let store = sample_store(clock.clone());

        put_simple(&store, "post:42", "v1", &["posts"]);
        store.soft_invalidate_key("post:42");

        let hit = store.get("post:42").expect("still servable");
        assert_eq!(hit.freshness, Freshness::Stale);
        assert_eq!(hit.value, Bytes::from_static(b"v1"));
    }

    #[test]
    fn evict_tag_removes_all_matched_keys() {
        let store = sample_store(Clock::default());

        put_simple(&store, "post:1", "a", &["posts"]);
        put_simple(&store, "post:2", "b", &["posts"]);

        let mut evicted = store.evict_tag("posts");
        evicted.sort();
        assert_eq!(evicted, vec!["post:1".to_string(), "post:2".to_string()]);
        assert!(store.is_empty());
        assert!(store.keys_for_tag("posts").is_empty());
    }

    #[test]
    fn sweep_removes_expired_entries_only() {
        let clock = Clock::manual(datetime!(2026-01-01 00:00:00 UTC));
        let store = sample_store(clock.clone());

        store
            .put(
                "short",
                Bytes::from_static(b"a"),
                HashSet::new(),
                Some(Duration::from_secs(1)),
                Some(Duration::from_secs(10)),
            )
            .expect("put");
        store
            .put(
                "long",
                Bytes::from_static(b"b"),
                HashSet::new(),
                Some(Duration::from_secs(1)),
                Some(Duration::from_secs(7200)),
            )
            .expect("put");

        clock.advance(Duration::from_secs(11));

        let removed = store.sweep(16, |_| false);
        assert_eq!(removed, 1);
        assert!(!store.contains("short"));
        assert!(store.contains("long"));
    }

    #[test]
    fn sweep_skips_keys_with_pending_jobs_and_honors_batch_limit() {
        let clock = Clock::manual(datetime!(2026-01-01 00:00:00 UTC));
        let store = sample_store(clock.clone());

        for i in 0..4 {
            store
                .put(
                    &format!("key:{i}"),
                    Bytes::from_static(b"x"),
                    HashSet::new(),
                    Some(Duration::from_secs(1)),
                    Some(Duration::from_secs(5)),
                )
                .expect("put");
        }
        clock.advance(Duration::from_secs(6));

        let removed = store.sweep(2, |key| key == "key:0");
        assert_eq!(removed, 2);
        assert_eq!(store.len(), 2);
        assert!(store.contains("key:0"));

        let removed = store.sweep(16, |key| key == "key:0");
        assert_eq!(removed, 1);
        assert!(store.contains("key:0"));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn store_recovers_from_poisoned_lock() {
        let store = sample_store(Clock::default());

        let _ = catch_unwind(AssertUnwindSafe(|| {
            let _guard = store.inner.write().expect("inner lock should be acquired");
            panic!("poison inner lock");
        }));

        put_simple(&store, "post:42", "v1", &["posts"]);
        assert!(store.get("post:42").is_some());
    }
}
