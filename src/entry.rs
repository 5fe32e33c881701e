//! Cache entries and freshness states.

use std::collections::HashSet;

use bytes::Bytes;
use time::OffsetDateTime;

/// Freshness of an entry relative to an observation instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Freshness {
    /// Servable without triggering a refresh.
    Fresh,
    /// Past its freshness window but still served while a refresh is pending.
    Stale,
    /// Past hard expiry; must not be served.
    Expired,
}

impl Freshness {
    pub fn as_str(&self) -> &'static str {
        match self {
            Freshness::Fresh => "fresh",
            Freshness::Stale => "stale",
            Freshness::Expired => "expired",
        }
    }

    pub fn is_servable(&self) -> bool {
        !matches!(self, Freshness::Expired)
    }
}

/// A cached artifact with freshness metadata.
///
/// The engine never inspects `value`; it is whatever the producer returned.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub value: Bytes,
    pub tags: HashSet<String>,
    /// Monotonically increasing per key, bumped on every successful write.
    pub version: u64,
    pub created_at: OffsetDateTime,
    pub stale_at: OffsetDateTime,
    pub expire_at: OffsetDateTime,
    pub access_count: u64,
    pub last_access_at: OffsetDateTime,
}

impl CacheEntry {
    pub fn freshness(&self, now: OffsetDateTime) -> Freshness {
        if now >= self.expire_at {
            Freshness::Expired
        } else if now >= self.stale_at {
            Freshness::Stale
        } else {
            Freshness::Fresh
        }
    }

    /// Soft-invalidate: pull `stale_at` back to `now`, keeping the value
    /// servable until `expire_at`. Returns false when the entry was already
    /// stale, so repeated passes are no-ops.
    pub fn mark_stale(&mut self, now: OffsetDateTime) -> bool {
        if self.stale_at > now {
            self.stale_at = now;
            true
        } else {
            false
        }
    }

    pub fn record_access(&mut self, now: OffsetDateTime) {
        self.access_count += 1;
        self.last_access_at = now;
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use time::macros::datetime;

    use super::*;

    fn sample_entry(created_at: OffsetDateTime) -> CacheEntry {
        CacheEntry {
            value: Bytes::from_static(b"payload"),
            tags: HashSet::from(["posts".to_string()]),
            version: 1,
            created_at,
            stale_at: created_at + Duration::from_secs(60),
            expire_at: created_at + Duration::from_secs(3600),
            access_count: 0,
            last_access_at: created_at,
        }
    }

    #[test]
    fn freshness_transitions() {
        let created = datetime!(2026-01-01 00:00:00 UTC);
        let entry = sample_entry(created);

        assert_eq!(entry.freshness(created), Freshness::Fresh);
        assert_eq!(
            entry.freshness(created + Duration::from_secs(59)),
            Freshness::Fresh
        );
        assert_eq!(
            entry.freshness(created + Duration::from_secs(60)),
            Freshness::Stale
        );
        assert_eq!(
            entry.freshness(created + Duration::from_secs(3599)),
            Freshness::Stale
        );
        assert_eq!(
            entry.freshness(created + Duration::from_secs(3600)),
            Freshness::Expired
        );
    }

    #[test]
    fn mark_stale_is_idempotent() {
        let created = datetime!(2026-01-01 00:00:00 UTC);
        let mut entry = sample_entry(created);
        let now = created + Duration::from_secs(10);

        assert!(entry.mark_stale(now));
        assert_eq!(entry.stale_at, now);
        assert_eq!(entry.freshness(now), Freshness::Stale);

        // Second pass over an already-stale entry changes nothing.
        assert!(!entry.mark_stale(now + Duration::from_secs(1)));
        assert_eq!(entry.stale_at, now);
    }

    #[test]
    fn mark_stale_keeps_value_servable() {
        let created = datetime!(2026-01-01 00:00:00 UTC);
        let mut entry = sample_entry(created);
        let now = created + Duration::from_secs(5);

        entry.mark_stale(now);

        assert!(entry.freshness(now).is_servable());
        assert_eq!(entry.value, Bytes::from_static(b"payload"));
    }

    #[test]
    fn record_access_bumps_counters() {
        let created = datetime!(2026-01-01 00:00:00 UTC);
        let mut entry = sample_entry(created);
        let now = created + Duration::from_secs(2);

        entry.record_access(now);
        entry.record_access(now + Duration::from_secs(1));

        assert_eq!(entry.access_count, 2);
        assert_eq!(entry.last_access_at, now + Duration::from_secs(1));
    }

    #[test]
    fn freshness_labels() {
        assert_eq!(Freshness::Fresh.as_str(), "fresh");
        assert_eq!(Freshness::Stale.as_str(), "stale");
        assert_eq!(Freshness::Expired.as_str(), "expired");
        assert!(Freshness::Stale.is_servable());
        assert!(!Freshness::Expired.is_servable());
    }
}
