//! Time sources. The engine itself never reads the time: `tick(now)` gets it passed in, and
//!  the embedder picks where it comes from.

use std::sync::Mutex;
use std::time::{Duration, Instant};

#[cfg(test)] use mockall::automock;

#[cfg_attr(test, automock)]
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
}

/// The system's monotonic clock
#[derive(Debug, Default)]
pub struct MonotonicClock;

impl Clock for MonotonicClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// Tokio's clock, which follows paused / advanced time in tests
#[derive(Debug, Default)]
pub struct TokioClock;

impl Clock for TokioClock {
    fn now(&self) -> Instant {
        tokio::time::Instant::now().into_std()
    }
}

/// A clock that only moves when told to
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<Instant>,
}

impl ManualClock {
    pub fn new(start: Instant) -> ManualClock {
        ManualClock { now: Mutex::new(start) }
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *now += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        *self.now.lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Deadline arithmetic for idle deliveries
#[derive(Debug, Copy, Clone)]
pub struct IdleTimer {
    timeout: Duration,
}

impl IdleTimer {
    pub fn new(timeout: Duration) -> IdleTimer {
        IdleTimer { timeout }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn deadline(&self, last_activity: Instant) -> Instant {
        last_activity + self.timeout
    }

    pub fn is_expired(&self, last_activity: Instant, now: Instant) -> bool {
        now >= self.deadline(last_activity)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn test_manual_clock() {
        let start = Instant::now();
        let clock = ManualClock::new(start);
        assert_eq!(clock.now(), start);

        clock.advance(Duration::from_millis(250));
        clock.advance(Duration::from_millis(250));
        assert_eq!(clock.now(), start + Duration::from_millis(500));
    }

    #[test]
    fn test_tokio_clock_follows_paused_time() {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .start_paused(true)
            .build()
            .unwrap();

        rt.block_on(async {
            let clock = TokioClock;
            let before = clock.now();
            tokio::time::advance(Duration::from_secs(5)).await;
            assert!(clock.now() - before >= Duration::from_secs(5));
        });
    }

    #[rstest]
    #[case::fresh(0, false)]
    #[case::almost(999, false)]
    #[case::exact(1000, true)]
    #[case::late(5000, true)]
    fn test_idle_timer(#[case] elapsed_millis: u64, #[case] expected: bool) {
        let timer = IdleTimer::new(Duration::from_secs(1));
        let last_activity = Instant::now();
        let now = last_activity + Duration::from_millis(elapsed_millis);

        assert_eq!(timer.is_expired(last_activity, now), expected);
        assert_eq!(timer.deadline(last_activity), last_activity + Duration::from_secs(1));
    }
}
