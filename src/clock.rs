//! Time source abstraction.
//!
//! Freshness checks and schedule math run against a [`Clock`] rather than
//! `OffsetDateTime::now_utc()` directly, so tests can move time by hand.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use time::OffsetDateTime;
use tracing::warn;

use crate::lock::recover;

const SOURCE: &str = "clock";

/// Engine time source.
///
/// `System` reads the wall clock; `Manual` holds an instant that only moves
/// when told to. Cloning shares the underlying instant.
#[derive(Clone, Debug)]
pub enum Clock {
    System,
    Manual(Arc<Mutex<OffsetDateTime>>),
}

impl Clock {
    /// Create a manual clock starting at the given instant.
    pub fn manual(start: OffsetDateTime) -> Self {
        Self::Manual(Arc::new(Mutex::new(start)))
    }

    /// Current instant according to this clock.
    pub fn now(&self) -> OffsetDateTime {
        match self {
            Self::System => OffsetDateTime::now_utc(),
            Self::Manual(instant) => *recover(instant.lock(), SOURCE, "now"),
        }
    }

    /// Move a manual clock forward. No effect on the system clock.
    pub fn advance(&self, by: Duration) {
        match self {
            Self::System => {
                warn!(advance_ms = by.as_millis() as u64, "Ignored advance on system clock");
            }
            Self::Manual(instant) => {
                let mut guard = recover(instant.lock(), SOURCE, "advance");
                *guard += by;
            }
        }
    }

    /// Pin a manual clock to an exact instant. No effect on the system clock.
    pub fn set(&self, to: OffsetDateTime) {
        match self {
            Self::System => {
                warn!("Ignored set on system clock");
            }
            Self::Manual(instant) => {
                *recover(instant.lock(), SOURCE, "set") = to;
            }
        }
    }
}

impl Default for Clock {
    fn default() -> Self {
        Self::System
    }
}

#[cfg(test)]
mod tests {
    use time::macros::datetime;

    use super::*;

    #[test]
    fn manual_clock_advances() {
        let clock = Clock::manual(datetime!(2026-01-01 00:00:00 UTC));

        assert_eq!(clock.now(), datetime!(2026-01-01 00:00:00 UTC));

        clock.advance(Duration::from_secs(61));
        assert_eq!(clock.now(), datetime!(2026-01-01 00:01:01 UTC));
    }

    #[test]
    fn manual_clock_shared_between_clones() {
        let clock = Clock::manual(datetime!(2026-01-01 00:00:00 UTC));
        let other = clock.clone();

        clock.advance(Duration::from_secs(5));
        assert_eq!(other.now(), datetime!(2026-01-01 00:00:05 UTC));
    }

    #[test]
    fn manual_clock_set_pins_instant() {
        let clock = Clock::manual(datetime!(2026-01-01 00:00:00 UTC));
        clock.set(datetime!(2026-06-15 12:00:00 UTC));
        assert_eq!(clock.now(), datetime!(2026-06-15 12:00:00 UTC));
    }

    #[test]
    fn system_clock_tracks_wall_time() {
        let clock = Clock::default();
        let before = OffsetDateTime::now_utc();
        let observed = clock.now();
        let after = OffsetDateTime::now_utc();
        assert!(before <= observed && observed <= after);
    }
}
