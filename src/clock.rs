// =============================================================================
// Clock — injectable wall + monotonic time
// =============================================================================
//
// The engine never calls `Utc::now()` directly: everything time-dependent
// (session limits, tick pacing, trade timestamps) goes through a `Clock` so
// tests and backtest drivers can run with a controlled timeline.
// =============================================================================

use std::time::Instant;

use chrono::{DateTime, Utc};

pub trait Clock: Send + Sync {
    /// Wall time, UTC. Used for every persisted timestamp.
    fn now_utc(&self) -> DateTime<Utc>;

    /// Monotonic seconds since the clock was created. Used for pacing and
    /// session time limits, immune to wall-clock adjustments.
    fn monotonic_secs(&self) -> f64;
}

/// Production clock backed by the system.
pub struct SystemClock {
    started: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now_utc(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn monotonic_secs(&self) -> f64 {
        self.started.elapsed().as_secs_f64()
    }
}

/// Test clock advanced by hand.
pub struct ManualClock {
    inner: parking_lot::Mutex<ManualState>,
}

struct ManualState {
    now: DateTime<Utc>,
    elapsed: f64,
}

impl ManualClock {
    pub fn starting_at(now: DateTime<Utc>) -> Self {
        Self {
            inner: parking_lot::Mutex::new(ManualState { now, elapsed: 0.0 }),
        }
    }

    /// Advance both wall and monotonic time by `secs`.
    pub fn advance(&self, secs: f64) {
        let mut state = self.inner.lock();
        state.elapsed += secs;
        state.now += chrono::Duration::milliseconds((secs * 1_000.0) as i64);
    }
}

impl Clock for ManualClock {
    fn now_utc(&self) -> DateTime<Utc> {
        self.inner.lock().now
    }

    fn monotonic_secs(&self) -> f64 {
        self.inner.lock().elapsed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manual_clock_advances() {
        let start = "2025-01-01T00:00:00Z".parse::<DateTime<Utc>>().unwrap();
        let clock = ManualClock::starting_at(start);
        assert_eq!(clock.monotonic_secs(), 0.0);

        clock.advance(90.0);
        assert_eq!(clock.monotonic_secs(), 90.0);
        assert_eq!(
            clock.now_utc(),
            "2025-01-01T00:01:30Z".parse::<DateTime<Utc>>().unwrap()
        );
    }

    #[test]
    fn system_clock_is_monotonic() {
        let clock = SystemClock::new();
        let a = clock.monotonic_secs();
        let b = clock.monotonic_secs();
        assert!(b >= a);
    }
}
