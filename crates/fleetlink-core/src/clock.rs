// ── Injected wall clock ──
//
// Every component that stamps or compares timestamps reads time through
// `Clock`, so tests can drive circuit cool-downs, heartbeat expiry and
// retention windows without sleeping.

use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};

/// Source of "now" for timestamp logic.
pub trait Clock: Send + Sync + 'static {
    fn now(&self) -> DateTime<Utc>;
}

/// Shared clock handle passed to components at construction.
pub type SharedClock = Arc<dyn Clock>;

/// The real wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Convenience constructor for the default shared clock.
pub fn system_clock() -> SharedClock {
    Arc::new(SystemClock)
}

/// A clock that only moves when told to. Millisecond resolution.
#[derive(Debug)]
pub struct ManualClock {
    millis: AtomicI64,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            millis: AtomicI64::new(start.timestamp_millis()),
        }
    }

    /// A manual clock starting at the current wall time.
    pub fn starting_now() -> Arc<Self> {
        Arc::new(Self::new(Utc::now()))
    }

    pub fn advance(&self, by: Duration) {
        let delta = i64::try_from(by.as_millis()).unwrap_or(i64::MAX);
        self.millis.fetch_add(delta, Ordering::SeqCst);
    }

    pub fn set(&self, to: DateTime<Utc>) {
        self.millis.store(to.timestamp_millis(), Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        let millis = self.millis.load(Ordering::SeqCst);
        Utc.timestamp_millis_opt(millis)
            .single()
            .unwrap_or_else(Utc::now)
    }
}

/// Convert a std duration to a chrono one, saturating on overflow.
pub(crate) fn chrono_duration(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or(chrono::Duration::MAX)
}

/// `at + d`, pinned to the latest representable instant on overflow.
pub(crate) fn saturating_after(at: DateTime<Utc>, d: Duration) -> DateTime<Utc> {
    at.checked_add_signed(chrono_duration(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// `at - d`, pinned to the earliest representable instant on overflow.
pub(crate) fn saturating_before(at: DateTime<Utc>, d: Duration) -> DateTime<Utc> {
    at.checked_sub_signed(chrono_duration(d))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// Positive remainder of `until - now`, or zero if already past.
pub(crate) fn remaining(now: DateTime<Utc>, until: DateTime<Utc>) -> Duration {
    (until - now).to_std().unwrap_or(Duration::ZERO)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manual_clock_advances() {
        let clock = ManualClock::starting_now();
        let t0 = clock.now();
        clock.advance(Duration::from_millis(1500));
        assert_eq!((clock.now() - t0).num_milliseconds(), 1500);
    }

    #[test]
    fn remaining_is_zero_when_past() {
        let now = Utc::now();
        assert_eq!(remaining(now, now - chrono::Duration::seconds(1)), Duration::ZERO);
        assert_eq!(
            remaining(now, now + chrono::Duration::seconds(2)),
            Duration::from_secs(2)
        );
    }

    #[test]
    fn huge_offsets_saturate() {
        let now = Utc::now();
        assert_eq!(saturating_after(now, Duration::MAX), DateTime::<Utc>::MAX_UTC);
        assert_eq!(saturating_before(now, Duration::MAX), DateTime::<Utc>::MIN_UTC);
        assert_eq!(
            saturating_after(now, Duration::from_secs(3)) - now,
            chrono::Duration::seconds(3)
        );
    }
}
