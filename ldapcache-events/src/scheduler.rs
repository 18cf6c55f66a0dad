//! Message-count maintenance cadence.

use ldapcache_core::DEFAULT_CLEANUP_INTERVAL;

/// Decides when cleanup is due: once every `interval` processed messages.
///
/// Kept separate from the write path so cleanup never runs mid-transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MaintenanceScheduler {
    interval: u64,
    processed: u64,
    runs: u64,
}

impl Default for MaintenanceScheduler {
    fn default() -> Self {
        Self::new(DEFAULT_CLEANUP_INTERVAL)
    }
}

impl MaintenanceScheduler {
    /// An interval of 0 is treated as 1.
    pub fn new(interval: u64) -> Self {
        Self {
            interval: interval.max(1),
            processed: 0,
            runs: 0,
        }
    }

    /// Count one processed message. Returns `true` when cleanup is due.
    pub fn record_processed(&mut self) -> bool {
        self.processed += 1;
        let due = self.processed % self.interval == 0;
        if due {
            self.runs += 1;
        }
        due
    }

    pub fn interval(&self) -> u64 {
        self.interval
    }

    pub fn processed(&self) -> u64 {
        self.processed
    }

    /// Cleanups triggered so far.
    pub fn runs(&self) -> u64 {
        self.runs
    }

    /// Messages left until the next cleanup.
    pub fn remaining(&self) -> u64 {
        self.interval - self.processed % self.interval
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn feed(scheduler: &mut MaintenanceScheduler, messages: u64) -> u64 {
        (0..messages).filter(|_| scheduler.record_processed()).count() as u64
    }

    #[test]
    fn test_default_interval_fires_once_per_thousand() {
        let mut scheduler = MaintenanceScheduler::default();
        assert_eq!(feed(&mut scheduler, 999), 0);
        assert_eq!(scheduler.remaining(), 1);
        assert!(scheduler.record_processed());
        assert_eq!(scheduler.runs(), 1);
        assert_eq!(scheduler.processed(), 1000);
    }

    #[test]
    fn test_zero_interval_fires_every_message() {
        let mut scheduler = MaintenanceScheduler::new(0);
        assert_eq!(scheduler.interval(), 1);
        assert_eq!(feed(&mut scheduler, 3), 3);
    }

    proptest! {
        /// Property: n messages trigger exactly floor(n / interval) cleanups.
        #[test]
        fn prop_runs_match_quotient(interval in 1u64..50, messages in 0u64..500) {
            let mut scheduler = MaintenanceScheduler::new(interval);
            let fired = feed(&mut scheduler, messages);
            prop_assert_eq!(fired, messages / interval);
            prop_assert_eq!(scheduler.runs(), fired);
        }
    }
}
