//! Wall-clock abstraction so decays, expiry and flush intervals are
//! deterministic in tests

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

pub trait Clock: Send + Sync {
    /// Seconds since the Unix epoch
    fn now(&self) -> i64;

    /// Microseconds since the Unix epoch
    fn now_micros(&self) -> i64 {
        self.now().saturating_mul(1_000_000)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> i64 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs() as i64
    }

    fn now_micros(&self) -> i64 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_micros() as i64
    }
}

/// Settable clock; clones share the same time
#[derive(Debug, Clone, Default)]
pub struct MockClock {
    micros: Arc<AtomicI64>,
}

impl MockClock {
    pub fn new(now: i64) -> Self {
        Self { micros: Arc::new(AtomicI64::new(now.saturating_mul(1_000_000))) }
    }

    pub fn set(&self, now: i64) {
        self.micros.store(now.saturating_mul(1_000_000), Ordering::SeqCst);
    }

    pub fn advance(&self, seconds: i64) {
        self.micros.fetch_add(seconds.saturating_mul(1_000_000), Ordering::SeqCst);
    }
}

impl Clock for MockClock {
    fn now(&self) -> i64 {
        self.micros.load(Ordering::SeqCst) / 1_000_000
    }

    fn now_micros(&self) -> i64 {
        self.micros.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mock_clock_shared_between_clones() {
        let clock = MockClock::new(1_000);
        let other = clock.clone();
        clock.advance(60);
        assert_eq!(other.now(), 1_060);
        assert_eq!(other.now_micros(), 1_060_000_000);
        other.set(5);
        assert_eq!(clock.now(), 5);
    }

    #[test]
    fn test_system_clock_is_past_2020() {
        assert!(SystemClock.now() > 1_577_836_800);
    }
}
