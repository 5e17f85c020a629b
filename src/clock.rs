//! Abstract time source and retry backoff policy.
//!
//! Schedules and the orchestrator never call `Utc::now()` directly; they go
//! through a [`Clock`] so tests can drive virtual time.

use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};

/// Abstract wall-clock time source.
pub trait Clock: Send + Sync {
    fn now_utc(&self) -> DateTime<Utc>;
}

/// The real system clock.
#[derive(Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_utc(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Manually advanced clock for tests.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    /// Advance the clock by the given duration.
    pub fn advance(&self, by: chrono::Duration) {
        let mut now = self.now.lock().unwrap();
        *now += by;
    }
}

impl Clock for ManualClock {
    fn now_utc(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap()
    }
}

/// Exponential backoff policy with a cap.
///
/// Delay for attempt `n` (0-based) is `initial * multiplier^n`, saturating
/// at `max`.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub initial: Duration,
    pub multiplier: f64,
    pub max: Duration,
    pub max_attempts: u32,
}

impl RetryPolicy {
    /// Policy used by hook notifiers: quick first retry, capped so the
    /// overall 30 s hook deadline still dominates.
    pub fn notifier() -> Self {
        Self {
            initial: Duration::from_millis(500),
            multiplier: 2.0,
            max: Duration::from_secs(8),
            max_attempts: 4,
        }
    }

    /// Policy used when a task loses the per-repo lock race and needs to be
    /// requeued shortly.
    pub fn lock_contention() -> Self {
        Self {
            initial: Duration::from_millis(250),
            multiplier: 2.0,
            max: Duration::from_secs(5),
            max_attempts: u32::MAX,
        }
    }

    /// Delay before the given 0-based attempt.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = self.multiplier.powi(attempt.min(63) as i32);
        let delay = self.initial.as_secs_f64() * factor;
        Duration::from_secs_f64(delay.min(self.max.as_secs_f64()))
    }
}
