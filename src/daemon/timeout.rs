//! Timeout Supervisor
//!
//! Wall-clock budget for one session. A session that overruns its budget
//! gets its client terminated and the budget doubles. Every 100 to 200
//! sessions a window of sessions is timed, and if even the slowest of them
//! used under a quarter of the budget, the budget is halved.

use std::time::Duration;

use rand::Rng;
use tracing::{debug, info};

const COUNTDOWN_MIN: u32 = 100;
const COUNTDOWN_MAX: u32 = 200;

#[derive(Debug, Clone)]
pub struct TimeoutPolicy {
    budget: Duration,
    min: Duration,
    max: Duration,
    window: usize,
    /// Sessions until the next sample starts
    countdown: u32,
    sample: Option<Sample>,
}

#[derive(Debug, Clone, Copy)]
struct Sample {
    remaining: usize,
    slowest: Duration,
}

fn next_countdown() -> u32 {
    rand::thread_rng().gen_range(COUNTDOWN_MIN..=COUNTDOWN_MAX)
}

impl TimeoutPolicy {
    pub fn new(budget: Duration, min: Duration, max: Duration, window: usize) -> Self {
        Self {
            budget: budget.clamp(min, max),
            min,
            max,
            window: window.max(1),
            countdown: next_countdown(),
            sample: None,
        }
    }

    pub fn budget(&self) -> Duration {
        self.budget
    }

    /// Set the budget, clamped to the configured bounds
    pub fn set_budget(&mut self, budget: Duration) -> Duration {
        self.budget = budget.clamp(self.min, self.max);
        self.budget
    }

    pub fn is_sampling(&self) -> bool {
        self.sample.is_some()
    }

    /// A session overran the budget. Back off for later sessions.
    pub fn on_timeout(&mut self) -> Duration {
        self.budget = (self.budget * 2).min(self.max);
        self.sample = None;
        info!("Session timeout raised to {:?}", self.budget);
        self.budget
    }

    /// Account for a completed session that took `elapsed`
    pub fn record(&mut self, elapsed: Duration) {
        match self.sample.as_mut() {
            Some(sample) => {
                sample.slowest = sample.slowest.max(elapsed);
                sample.remaining -= 1;
                if sample.remaining == 0 {
                    let slowest = sample.slowest;
                    self.sample = None;
                    self.countdown = next_countdown();
                    if slowest * 4 < self.budget {
                        self.budget = (self.budget / 2).max(self.min);
                        info!(
                            "Sessions fast (slowest {:?}), timeout lowered to {:?}",
                            slowest, self.budget
                        );
                    }
                }
            }
            None => {
                self.countdown = self.countdown.saturating_sub(1);
                if self.countdown == 0 {
                    debug!("Timing next {} sessions", self.window);
                    self.sample = Some(Sample {
                        remaining: self.window,
                        slowest: Duration::ZERO,
                    });
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> TimeoutPolicy {
        TimeoutPolicy::new(
            Duration::from_secs(8),
            Duration::from_secs(1),
            Duration::from_secs(30),
            3,
        )
    }

    #[test]
    fn timeouts_double_up_to_max() {
        let mut p = policy();
        assert_eq!(p.on_timeout(), Duration::from_secs(16));
        assert_eq!(p.on_timeout(), Duration::from_secs(30));
        assert_eq!(p.on_timeout(), Duration::from_secs(30));
    }

    #[test]
    fn countdown_is_randomized_within_bounds() {
        for _ in 0..50 {
            let p = policy();
            assert!((COUNTDOWN_MIN..=COUNTDOWN_MAX).contains(&p.countdown));
        }
    }

    #[test]
    fn fast_sample_halves_budget() {
        let mut p = policy();
        p.countdown = 1;
        p.record(Duration::from_millis(5));
        assert!(p.is_sampling());
        for _ in 0..3 {
            p.record(Duration::from_millis(10));
        }
        assert!(!p.is_sampling());
        assert_eq!(p.budget(), Duration::from_secs(4));
    }

    #[test]
    fn slow_sample_keeps_budget() {
        let mut p = policy();
        p.countdown = 1;
        p.record(Duration::ZERO);
        p.record(Duration::from_millis(10));
        p.record(Duration::from_secs(3));
        p.record(Duration::from_millis(10));
        assert_eq!(p.budget(), Duration::from_secs(8));
    }

    #[test]
    fn budget_never_below_min() {
        let mut p = TimeoutPolicy::new(
            Duration::from_secs(1),
            Duration::from_secs(1),
            Duration::from_secs(30),
            1,
        );
        p.countdown = 1;
        p.record(Duration::ZERO);
        p.record(Duration::ZERO);
        assert_eq!(p.budget(), Duration::from_secs(1));
        assert_eq!(p.set_budget(Duration::from_secs(100)), Duration::from_secs(30));
    }
}
