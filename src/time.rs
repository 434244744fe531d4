//! Countdown abstraction used for the check limit and positive ACK timers.
use core::fmt::Debug;
use core::time::Duration;

use crate::{TimerContext, TimerCreator};

/// Generic abstraction for a check/countdown timer. Should also be cheap to copy and clone.
pub trait Countdown: Debug {
    fn has_expired(&self) -> bool;
    fn reset(&mut self);
}

/// Simple implementation of the [Countdown] trait assuming a standard runtime.
#[derive(Debug)]
pub struct StdCountdown {
    expiry_time: Duration,
    start_time: std::time::Instant,
}

impl StdCountdown {
    pub fn new(expiry_time: Duration) -> Self {
        Self {
            expiry_time,
            start_time: std::time::Instant::now(),
        }
    }

    pub fn expiry_time_seconds(&self) -> u64 {
        self.expiry_time.as_secs()
    }
}

impl Countdown for StdCountdown {
    fn has_expired(&self) -> bool {
        self.start_time.elapsed() > self.expiry_time
    }

    fn reset(&mut self) {
        self.start_time = std::time::Instant::now();
    }
}

/// Creates [StdCountdown]s with the expiry time supplied by the [TimerContext], which is
/// derived from the remote entity configuration.
#[derive(Debug, Default, Copy, Clone)]
pub struct StdTimerCreator {}

impl TimerCreator for StdTimerCreator {
    type Countdown = StdCountdown;

    fn create_countdown(&self, timer_context: TimerContext) -> Self::Countdown {
        StdCountdown::new(timer_context.expiry_time())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_std_countdown() {
        let mut std_countdown = StdCountdown::new(Duration::from_millis(20));
        assert_eq!(std_countdown.expiry_time_seconds(), 0);
        assert!(!std_countdown.has_expired());
        std::thread::sleep(Duration::from_millis(30));
        assert!(std_countdown.has_expired());
        std_countdown.reset();
        assert!(!std_countdown.has_expired());
    }
}
