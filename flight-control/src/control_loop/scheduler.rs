//! Fixed-period tick pacing.

use std::thread;
use std::time::{Duration, Instant};

/// Outcome of pacing one tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pacing {
    /// The tick finished early and the remainder of the period was slept.
    Slept(Duration),
    /// The tick used the whole period; the next one starts immediately.
    DeadlineMissed {
        /// Time spent beyond the period
        overrun: Duration,
    },
}

/// Sleeps away whatever remains of a fixed period after each tick.
#[derive(Debug, Clone)]
pub struct Scheduler {
    period: Duration,
    deadline_misses: u64,
}

impl Scheduler {
    pub fn new(period: Duration) -> Self {
        Self {
            period,
            deadline_misses: 0,
        }
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    /// Number of ticks that ran over their period.
    pub fn deadline_misses(&self) -> u64 {
        self.deadline_misses
    }

    /// Decide how long to sleep given how long the tick has taken so far.
    pub fn plan(&self, elapsed: Duration) -> Pacing {
        if elapsed >= self.period {
            Pacing::DeadlineMissed {
                overrun: elapsed - self.period,
            }
        } else {
            Pacing::Slept(self.period - elapsed)
        }
    }

    /// Finish a tick that began at `tick_start`.
    pub fn pace(&mut self, tick_start: Instant) -> Pacing {
        let pacing = self.plan(tick_start.elapsed());
        match pacing {
            Pacing::Slept(remaining) => thread::sleep(remaining),
            Pacing::DeadlineMissed { .. } => self.deadline_misses += 1,
        }
        pacing
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plan_sleeps_remainder() {
        let scheduler = Scheduler::new(Duration::from_millis(20));
        assert_eq!(
            scheduler.plan(Duration::from_millis(5)),
            Pacing::Slept(Duration::from_millis(15))
        );
    }

    #[test]
    fn test_plan_exact_period_is_a_miss() {
        let scheduler = Scheduler::new(Duration::from_millis(20));
        assert_eq!(
            scheduler.plan(Duration::from_millis(20)),
            Pacing::DeadlineMissed {
                overrun: Duration::ZERO
            }
        );
    }

    #[test]
    fn test_slow_tick_reports_miss_without_sleeping() {
        let mut scheduler = Scheduler::new(Duration::from_millis(10));
        let tick_start = Instant::now();
        thread::sleep(Duration::from_millis(25));

        let before_pace = Instant::now();
        let pacing = scheduler.pace(tick_start);

        match pacing {
            Pacing::DeadlineMissed { overrun } => {
                assert!(overrun >= Duration::from_millis(15))
            }
            other => panic!("expected a deadline miss, got {other:?}"),
        }
        assert!(before_pace.elapsed() < Duration::from_millis(5));
        assert_eq!(scheduler.deadline_misses(), 1);
    }

    #[test]
    fn test_fast_tick_fills_period() {
        let mut scheduler = Scheduler::new(Duration::from_millis(15));
        let tick_start = Instant::now();
        let pacing = scheduler.pace(tick_start);

        assert!(matches!(pacing, Pacing::Slept(_)));
        assert!(tick_start.elapsed() >= Duration::from_millis(15));
        assert_eq!(scheduler.deadline_misses(), 0);
    }
}
