//! Time types for OpenMesh.
//!
//! All components read time through a [`Clock`] so heartbeat ageing,
//! backoff and attempt timeouts can be driven deterministically in tests.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Wall clock timestamp in milliseconds since the Unix epoch
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Timestamp(u64);

impl Timestamp {
    /// The epoch
    pub const ZERO: Self = Self(0);

    /// Create from milliseconds
    #[must_use]
    pub const fn from_millis(millis: u64) -> Self {
        Self(millis)
    }

    /// Milliseconds since the epoch
    #[must_use]
    pub const fn as_millis(&self) -> u64 {
        self.0
    }

    /// Time elapsed since `earlier`, zero if `earlier` is in the future
    #[must_use]
    pub fn saturating_since(&self, earlier: Timestamp) -> Duration {
        Duration::from_millis(self.0.saturating_sub(earlier.0))
    }

    /// Add a duration
    #[must_use]
    pub fn saturating_add(&self, duration: Duration) -> Self {
        let millis = u64::try_from(duration.as_millis()).unwrap_or(u64::MAX);
        Self(self.0.saturating_add(millis))
    }
}

impl std::fmt::Display for Timestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}ms", self.0)
    }
}

/// Source of the current time
pub trait Clock: Send + Sync + std::fmt::Debug {
    /// Current time
    fn now(&self) -> Timestamp;
}

/// Clock backed by the system wall clock
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Timestamp {
        use std::time::{SystemTime, UNIX_EPOCH};
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
            .unwrap_or(0);
        Timestamp(millis)
    }
}

/// Manually advanced clock, shared between clones
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    millis: Arc<AtomicU64>,
}

impl ManualClock {
    /// Create a clock stopped at `start`
    #[must_use]
    pub fn new(start: Timestamp) -> Self {
        Self {
            millis: Arc::new(AtomicU64::new(start.0)),
        }
    }

    /// Move the clock forward
    pub fn advance(&self, by: Duration) {
        let millis = u64::try_from(by.as_millis()).unwrap_or(u64::MAX);
        self.millis.fetch_add(millis, Ordering::SeqCst);
    }

    /// Jump to an absolute time; never moves backwards
    pub fn set(&self, to: Timestamp) {
        self.millis.fetch_max(to.0, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Timestamp {
        Timestamp(self.millis.load(Ordering::SeqCst))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_saturating_since() {
        let a = Timestamp::from_millis(1_000);
        let b = Timestamp::from_millis(2_500);
        assert_eq!(b.saturating_since(a), Duration::from_millis(1_500));
        assert_eq!(a.saturating_since(b), Duration::ZERO);
    }

    #[test]
    fn test_saturating_add() {
        let t = Timestamp::from_millis(u64::MAX - 1);
        assert_eq!(t.saturating_add(Duration::from_secs(5)).as_millis(), u64::MAX);
    }

    #[test]
    fn test_manual_clock_shared() {
        let clock = ManualClock::new(Timestamp::from_millis(10));
        let other = clock.clone();
        clock.advance(Duration::from_millis(5));
        assert_eq!(other.now().as_millis(), 15);
    }

    #[test]
    fn test_manual_clock_never_rewinds() {
        let clock = ManualClock::new(Timestamp::from_millis(100));
        clock.set(Timestamp::from_millis(50));
        assert_eq!(clock.now().as_millis(), 100);
        clock.set(Timestamp::from_millis(150));
        assert_eq!(clock.now().as_millis(), 150);
    }

    #[test]
    fn test_system_clock_moves() {
        assert!(SystemClock.now() > Timestamp::ZERO);
    }
}
