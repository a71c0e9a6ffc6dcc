//! When to write the block index and flush the coin cache
//!
//! The decision is kept apart from the I/O so the trigger rules can be
//! exercised with a mock clock. All times are microseconds.

use crate::constants::{DATABASE_FLUSH_INTERVAL, DATABASE_WRITE_INTERVAL};

/// How hard a caller wants state pushed to disk
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushMode {
    None,
    /// Only when the coin cache is over its budget
    IfNeeded,
    /// Also on the hourly and daily timers, and when the cache is nearly full
    Periodic,
    Always,
}

/// What one flush call has to do
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushDecision {
    /// Sync block files and write dirty index entries
    pub write: bool,
    /// Also flush the coin cache
    pub full: bool,
    /// Tell subscribers about the new best chain
    pub announce: bool,
}

/// Timestamps of the last write, full flush and best-chain announcement
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushTimer {
    pub last_write: i64,
    pub last_flush: i64,
    pub last_set_chain: i64,
}

const MICROS: i64 = 1_000_000;

impl FlushTimer {
    /// Decide what to do for `mode` at `now`
    ///
    /// 1. Unset timers start at `now`, so a fresh node does not flush
    ///    immediately
    /// 2. cache large: periodic mode and usage · 10/9 > limit
    /// 3. cache critical: if-needed mode and usage > limit
    /// 4. periodic write after an hour, periodic flush after a day
    /// 5. full = always ∨ large ∨ critical ∨ periodic flush;
    ///    write = full ∨ periodic write
    /// 6. announce on a full flush, or hourly in periodic/always mode
    pub fn decide(&mut self, mode: FlushMode, now: i64, cache_usage: usize, cache_limit: usize) -> FlushDecision {
        if self.last_write == 0 {
            self.last_write = now;
        }
        if self.last_flush == 0 {
            self.last_flush = now;
        }
        if self.last_set_chain == 0 {
            self.last_set_chain = now;
        }

        let periodic = mode == FlushMode::Periodic;
        let cache_large = periodic && (cache_usage as f64) * (10.0 / 9.0) > cache_limit as f64;
        let cache_critical = mode == FlushMode::IfNeeded && cache_usage > cache_limit;
        let periodic_write = periodic && now > self.last_write + DATABASE_WRITE_INTERVAL * MICROS;
        let periodic_flush = periodic && now > self.last_flush + DATABASE_FLUSH_INTERVAL * MICROS;

        let full = mode == FlushMode::Always || cache_large || cache_critical || periodic_flush;
        let write = full || periodic_write;
        let announce = full
            || (matches!(mode, FlushMode::Always | FlushMode::Periodic)
                && now > self.last_set_chain + DATABASE_WRITE_INTERVAL * MICROS);

        FlushDecision { write, full, announce }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const T0: i64 = 1_700_000_000 * MICROS;

    fn timer() -> FlushTimer {
        let mut timer = FlushTimer::default();
        timer.decide(FlushMode::None, T0, 0, 100);
        timer
    }

    #[test]
    fn test_first_call_starts_timers() {
        let timer = timer();
        assert_eq!(timer.last_write, T0);
        assert_eq!(timer.last_flush, T0);
        assert_eq!(timer.last_set_chain, T0);
    }

    #[test]
    fn test_none_never_flushes() {
        let mut timer = timer();
        let decision = timer.decide(FlushMode::None, T0 + 10 * DATABASE_FLUSH_INTERVAL * MICROS, 1000, 100);
        assert_eq!(decision, FlushDecision::default());
    }

    #[test]
    fn test_always_is_full_and_announces() {
        let mut timer = timer();
        let decision = timer.decide(FlushMode::Always, T0, 0, 100);
        assert_eq!(decision, FlushDecision { write: true, full: true, announce: true });
    }

    #[test]
    fn test_cache_thresholds() {
        let mut timer = timer();
        // 95 of 100 is large for periodic mode but not critical
        assert!(timer.decide(FlushMode::Periodic, T0, 95, 100).full);
        assert!(!timer.decide(FlushMode::IfNeeded, T0, 95, 100).full);
        assert!(timer.decide(FlushMode::IfNeeded, T0, 101, 100).full);
        assert!(!timer.decide(FlushMode::Periodic, T0, 80, 100).full);
    }

    #[test]
    fn test_periodic_timers() {
        let mut timer = timer();
        let hour_later = T0 + DATABASE_WRITE_INTERVAL * MICROS + 1;
        let decision = timer.decide(FlushMode::Periodic, hour_later, 0, 100);
        assert!(decision.write);
        assert!(!decision.full);
        assert!(decision.announce);

        let day_later = T0 + DATABASE_FLUSH_INTERVAL * MICROS + 1;
        assert!(timer.decide(FlushMode::Periodic, day_later, 0, 100).full);
        // If-needed mode ignores the timers
        assert_eq!(timer.decide(FlushMode::IfNeeded, day_later, 0, 100), FlushDecision::default());
    }
}
