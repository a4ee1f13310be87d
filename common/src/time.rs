//! Clock abstraction and timing constants.
//!
//! Business code never calls `Utc::now()` directly; it asks an injected
//! [`Clock`]. Day boundaries are computed in an explicit UTC offset taken
//! from configuration.

use std::sync::Arc;

use chrono::{DateTime, Duration, FixedOffset, NaiveTime, Offset, TimeZone, Utc};
use parking_lot::Mutex;

/// Timing defaults.
pub mod constants {
    use super::Duration;

    /// Idempotency replay window (60 seconds).
    pub fn idempotency_ttl() -> Duration {
        Duration::seconds(60)
    }

    /// Idempotency cache sweep interval (5 seconds).
    pub fn idempotency_cleanup_interval() -> Duration {
        Duration::seconds(5)
    }

    /// Maximum attempts when generating a unique account number.
    pub const MAX_GENERATION_ATTEMPTS: u32 = 1000;

    /// Attempts to re-run account opening after losing a uniqueness race.
    pub const MAX_OPEN_ACCOUNT_RETRIES: u32 = 3;
}

/// A timestamp (always stored in UTC).
pub type Timestamp = DateTime<Utc>;

/// Source of "now".
pub trait Clock: Send + Sync {
    fn now(&self) -> Timestamp;
}

/// Shared clock handle.
pub type SharedClock = Arc<dyn Clock>;

/// Wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Timestamp {
        Utc::now()
    }
}

/// Clock driven by the caller. Optionally advances by `step` on every read,
/// which gives strictly increasing timestamps.
#[derive(Debug)]
pub struct ManualClock {
    current: Mutex<Timestamp>,
    step: Duration,
}

impl ManualClock {
    pub fn new(start: Timestamp) -> Self {
        Self {
            current: Mutex::new(start),
            step: Duration::zero(),
        }
    }

    pub fn stepping(start: Timestamp, step: Duration) -> Self {
        Self {
            current: Mutex::new(start),
            step,
        }
    }

    pub fn advance(&self, by: Duration) {
        *self.current.lock() += by;
    }

    pub fn set(&self, to: Timestamp) {
        *self.current.lock() = to;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Timestamp {
        let mut current = self.current.lock();
        let now = *current;
        *current += self.step;
        now
    }
}

/// Build a fixed offset from minutes east of UTC, clamped to the valid range.
pub fn offset_from_minutes(minutes: i32) -> FixedOffset {
    let seconds = minutes.clamp(-23 * 60 - 59, 23 * 60 + 59) * 60;
    FixedOffset::east_opt(seconds).unwrap_or_else(|| Utc.fix())
}

/// Start of the business day containing `at`, as a UTC instant.
pub fn start_of_day(at: Timestamp, offset: FixedOffset) -> Timestamp {
    let local = at.with_timezone(&offset);
    let midnight = local.date_naive().and_time(NaiveTime::MIN);
    offset
        .from_local_datetime(&midnight)
        .single()
        .map(|d| d.with_timezone(&Utc))
        .unwrap_or(at)
}

/// Check if `expiry` is at or before `now`.
pub fn is_expired(expiry: Timestamp, now: Timestamp) -> bool {
    now >= expiry
}

/// Conversion to `std::time::Duration` for tokio timers.
pub trait DurationExt {
    fn as_std(&self) -> std::time::Duration;
}

impl DurationExt for Duration {
    fn as_std(&self) -> std::time::Duration {
        self.to_std().unwrap_or(std::time::Duration::ZERO)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(s: &str) -> Timestamp {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    #[test]
    fn test_manual_clock_stepping() {
        let clock = ManualClock::stepping(at("2024-05-01T10:00:00Z"), Duration::milliseconds(1));
        let a = clock.now();
        let b = clock.now();
        assert!(b > a);
    }

    #[test]
    fn test_start_of_day_respects_offset() {
        let offset = offset_from_minutes(60);
        // 23:30 UTC is already 00:30 the next day at +01:00.
        let start = start_of_day(at("2024-05-01T23:30:00Z"), offset);
        assert_eq!(start, at("2024-05-01T23:00:00Z"));

        let start = start_of_day(at("2024-05-01T12:00:00Z"), offset);
        assert_eq!(start, at("2024-04-30T23:00:00Z"));
    }

    #[test]
    fn test_is_expired() {
        let now = at("2024-05-01T10:00:00Z");
        assert!(is_expired(now - Duration::seconds(1), now));
        assert!(!is_expired(now + Duration::seconds(1), now));
    }
}
