//! Adaptive access policy.
//!
//! Tracks a per-key access counter that decays exponentially, so recent
//! reads dominate. Hot keys earn longer freshness windows and feed the
//! warmer; cold keys get shorter windows and are pruned from tracking.

use std::time::Duration;

use dashmap::DashMap;
use metrics::gauge;
use time::OffsetDateTime;
use tracing::debug;

use crate::config::PolicyConfig;

const METRIC_TRACKED_KEYS: &str = "rinfresco_policy_tracked_keys";

/// Temperature classification for one key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Heat {
    Hot,
    Warm,
    Cold,
}

impl Heat {
    pub fn as_str(&self) -> &'static str {
        match self {
            Heat::Hot => "hot",
            Heat::Warm => "warm",
            Heat::Cold => "cold",
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct AccessStat {
    score: f64,
    last_seen: OffsetDateTime,
}

/// Decayed access-frequency tracker.
///
/// Keys with no recorded accesses classify as [`Heat::Warm`], so the policy
/// only bends freshness windows once it has actual observations.
pub struct AccessPolicy {
    half_life: Duration,
    hot_threshold: f64,
    cold_threshold: f64,
    hot_stale_factor: f64,
    cold_stale_factor: f64,
    stats: DashMap<String, AccessStat>,
}

impl AccessPolicy {
    pub fn new(config: &PolicyConfig) -> Self {
        Self {
            half_life: config.half_life(),
            hot_threshold: config.hot_threshold,
            cold_threshold: config.cold_threshold,
            hot_stale_factor: config.hot_stale_factor.max(0.0),
            cold_stale_factor: config.cold_stale_factor.max(0.0),
            stats: DashMap::new(),
        }
    }

    /// Record one read hit for `key`.
    pub fn record(&self, key: &str, now: OffsetDateTime) {
        let mut entry = self.stats.entry(key.to_string()).or_insert(AccessStat {
            score: 0.0,
            last_seen: now,
        });
        entry.score = decayed(entry.score, entry.last_seen, now, self.half_life) + 1.0;
        entry.last_seen = now;
        drop(entry);

        gauge!(METRIC_TRACKED_KEYS).set(self.stats.len() as f64);
    }

    /// Current decayed score for `key`, zero when untracked.
    pub fn score(&self, key: &str, now: OffsetDateTime) -> f64 {
        self.stats
            .get(key)
            .map(|stat| decayed(stat.score, stat.last_seen, now, self.half_life))
            .unwrap_or(0.0)
    }

    pub fn classify(&self, key: &str, now: OffsetDateTime) -> Heat {
        let Some(stat) = self.stats.get(key) else {
            return Heat::Warm;
        };
        let score = decayed(stat.score, stat.last_seen, now, self.half_life);
        if score >= self.hot_threshold {
            Heat::Hot
        } else if score <= self.cold_threshold {
            Heat::Cold
        } else {
            Heat::Warm
        }
    }

    /// The freshness window to use for `key`'s next write: hot keys stay
    /// fresh longer, cold keys shorter, warm keys keep the base window.
    pub fn effective_stale_in(&self, key: &str, base: Duration, now: OffsetDateTime) -> Duration {
        match self.classify(key, now) {
            Heat::Hot => base.mul_f64(self.hot_stale_factor),
            Heat::Warm => base,
            Heat::Cold => base.mul_f64(self.cold_stale_factor),
        }
    }

    /// Top `limit` keys by decayed score, hottest first.
    pub fn hot_keys(&self, limit: usize, now: OffsetDateTime) -> Vec<String> {
        let mut ranked: Vec<(String, f64)> = self
            .stats
            .iter()
            .map(|entry| {
                let score = decayed(entry.score, entry.last_seen, now, self.half_life);
                (entry.key().clone(), score)
            })
            .collect();
        ranked.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        ranked.truncate(limit);
        ranked.into_iter().map(|(key, _)| key).collect()
    }

    /// Drop stats that decayed to cold, returning the number removed.
    /// Untracked keys classify as warm again, so pruning resets a key's
    /// policy influence rather than pinning it cold forever.
    pub fn prune(&self, now: OffsetDateTime) -> usize {
        let before = self.stats.len();
        self.stats.retain(|_, stat| {
            decayed(stat.score, stat.last_seen, now, self.half_life) > self.cold_threshold
        });
        let removed = before - self.stats.len();
        if removed > 0 {
            debug!(removed, remaining = self.stats.len(), "Pruned cold access stats");
        }
        gauge!(METRIC_TRACKED_KEYS).set(self.stats.len() as f64);
        removed
    }

    pub fn tracked_keys(&self) -> usize {
        self.stats.len()
    }
}

fn decayed(score: f64, last_seen: OffsetDateTime, now: OffsetDateTime, half_life: Duration) -> f64 {
    let elapsed = (now - last_seen).as_seconds_f64().max(0.0);
    let half_life = half_life.as_secs_f64().max(1.0);
    score * 0.5_f64.powf(elapsed / half_life)
}

#[cfg(test)]
mod tests {
    use time::macros::datetime;

    use super::*;

    const NOW: OffsetDateTime = datetime!(2026-01-01 00:00:00 UTC);

    fn sample_policy() -> AccessPolicy {
        AccessPolicy::new(&PolicyConfig {
            half_life_secs: 100,
            hot_threshold: 4.0,
            cold_threshold: 0.5,
            hot_stale_factor: 2.0,
            cold_stale_factor: 0.5,
            retune_interval_ms: 60_000,
        })
    }

    #[test]
    fn repeated_access_classifies_hot() {
        let policy = sample_policy();
        for _ in 0..5 {
            policy.record("post:42", NOW);
        }

        assert_eq!(policy.classify("post:42", NOW), Heat::Hot);
    }

    #[test]
    fn score_halves_per_half_life() {
        let policy = sample_policy();
        policy.record("post:42", NOW);

        let after_one = policy.score("post:42", NOW + Duration::from_secs(100));
        let after_two = policy.score("post:42", NOW + Duration::from_secs(200));

        assert!((after_one - 0.5).abs() < 1e-9);
        assert!((after_two - 0.25).abs() < 1e-9);
    }

    #[test]
    fn idle_key_cools_down() {
        let policy = sample_policy();
        policy.record("post:42", NOW);

        // One half-life later the score sits at 0.5, the cold threshold.
        let later = NOW + Duration::from_secs(100);
        assert_eq!(policy.classify("post:42", later), Heat::Cold);
    }

    #[test]
    fn untracked_key_is_warm() {
        let policy = sample_policy();
        assert_eq!(policy.classify("post:42", NOW), Heat::Warm);
        assert_eq!(
            policy.effective_stale_in("post:42", Duration::from_secs(60), NOW),
            Duration::from_secs(60)
        );
    }

    #[test]
    fn stale_window_bends_with_heat() {
        let policy = sample_policy();
        let base = Duration::from_secs(60);

        for _ in 0..5 {
            policy.record("hot", NOW);
        }
        policy.record("cold", NOW - Duration::from_secs(300));

        assert_eq!(policy.effective_stale_in("hot", base, NOW), Duration::from_secs(120));
        assert_eq!(policy.effective_stale_in("cold", base, NOW), Duration::from_secs(30));
    }

    #[test]
    fn hot_keys_rank_by_decayed_score() {
        let policy = sample_policy();
        for _ in 0..5 {
            policy.record("c", NOW);
        }
        for _ in 0..3 {
            policy.record("a", NOW);
        }
        policy.record("b", NOW);

        assert_eq!(policy.hot_keys(2, NOW), vec!["c".to_string(), "a".to_string()]);
    }

    #[test]
    fn prune_drops_cold_stats() {
        let policy = sample_policy();
        policy.record("old", NOW - Duration::from_secs(1000));
        policy.record("recent", NOW);

        let removed = policy.prune(NOW);

        assert_eq!(removed, 1);
        assert_eq!(policy.tracked_keys(), 1);
        assert_eq!(policy.classify("old", NOW), Heat::Warm);
    }
}
