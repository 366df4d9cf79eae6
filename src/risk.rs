// =============================================================================
// Risk Guard — session-level gates evaluated before every tick
// =============================================================================
//
// Gates, in order:
//   1. Time limit      — elapsed >= limit           -> stop (time_limit)
//   2. Max loss        — total_pnl <= -|max_loss|   -> stop (max_loss)
//   3. Max drawdown    — drawdown >= threshold      -> pause new entries
//   4. Cooldown        — recent adverse close       -> pause new entries
//
// A stop latches for the remainder of the session: no further entries are
// possible, while in-flight exits still run.
// =============================================================================

use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{info, warn};

use crate::clock::Clock;
use crate::time_parser::format_duration;
use crate::types::EndReason;

#[derive(Debug, Clone, Default)]
pub struct RiskLimits {
    pub time_limit_seconds: Option<u64>,
    /// Compared against the absolute session loss in USD.
    pub max_loss_limit: Option<f64>,
    /// Pause new entries at or above this drawdown percentage.
    pub max_drawdown_percent: Option<f64>,
    /// Entry cooldown after a losing close; zero disables.
    pub cooldown_seconds: u64,
}

/// Verdict for the upcoming tick.
#[derive(Debug, Clone, PartialEq)]
pub enum Gate {
    Proceed,
    /// New entries blocked, exits continue.
    PauseEntries(String),
    /// Session over; the latch stays set.
    Stop(EndReason, String),
}

struct Inner {
    stop: Option<(EndReason, String)>,
    cooldown_until: Option<f64>,
}

pub struct RiskGuard {
    limits: RiskLimits,
    clock: Arc<dyn Clock>,
    started_at: f64,
    state: RwLock<Inner>,
}

impl RiskGuard {
    pub fn new(limits: RiskLimits, clock: Arc<dyn Clock>) -> Self {
        let started_at = clock.monotonic_secs();
        info!(
            time_limit = limits
                .time_limit_seconds
                .map(format_duration)
                .unwrap_or_else(|| "none".into()),
            max_loss = ?limits.max_loss_limit,
            max_drawdown_percent = ?limits.max_drawdown_percent,
            cooldown_seconds = limits.cooldown_seconds,
            "risk guard armed"
        );
        Self {
            limits,
            clock,
            started_at,
            state: RwLock::new(Inner {
                stop: None,
                cooldown_until: None,
            }),
        }
    }

    pub fn elapsed_seconds(&self) -> u64 {
        (self.clock.monotonic_secs() - self.started_at).max(0.0) as u64
    }

    /// Evaluate all gates against the current account totals.
    pub fn pre_tick(&self, total_pnl: f64, max_drawdown_percent: f64) -> Gate {
        let mut state = self.state.write();

        if let Some((reason, detail)) = &state.stop {
            return Gate::Stop(*reason, detail.clone());
        }

        // 1. Time limit.
        if let Some(limit) = self.limits.time_limit_seconds {
            let elapsed = (self.clock.monotonic_secs() - self.started_at) as u64;
            if elapsed >= limit {
                let detail = format!("time limit reached after {}", format_duration(elapsed));
                warn!(%detail, "risk guard latched");
                state.stop = Some((EndReason::TimeLimit, detail.clone()));
                return Gate::Stop(EndReason::TimeLimit, detail);
            }
        }

        // 2. Max loss.
        if let Some(max_loss) = self.limits.max_loss_limit {
            if total_pnl <= -max_loss.abs() {
                let detail = format!("session loss ${:.2} breached limit ${:.2}", -total_pnl, max_loss.abs());
                warn!(%detail, "risk guard latched");
                state.stop = Some((EndReason::MaxLoss, detail.clone()));
                return Gate::Stop(EndReason::MaxLoss, detail);
            }
        }

        // 3. Drawdown pause.
        if let Some(threshold) = self.limits.max_drawdown_percent {
            if max_drawdown_percent >= threshold {
                return Gate::PauseEntries(format!(
                    "drawdown {max_drawdown_percent:.2}% at or above {threshold:.2}%"
                ));
            }
        }

        // 4. Cooldown.
        if let Some(until) = state.cooldown_until {
            let now = self.clock.monotonic_secs();
            if now < until {
                return Gate::PauseEntries(format!(
                    "cooldown for another {:.0}s after losing trade",
                    until - now
                ));
            }
            state.cooldown_until = None;
        }

        Gate::Proceed
    }

    /// Feed every closed trade back in; adverse closes start the cooldown.
    pub fn record_trade_result(&self, net_pnl: f64) {
        if net_pnl < 0.0 && self.limits.cooldown_seconds > 0 {
            let until = self.clock.monotonic_secs() + self.limits.cooldown_seconds as f64;
            self.state.write().cooldown_until = Some(until);
            info!(
                net_pnl = format!("{net_pnl:+.2}"),
                cooldown_seconds = self.limits.cooldown_seconds,
                "entry cooldown started"
            );
        }
    }

    /// The latched stop, if any.
    pub fn stopped(&self) -> Option<(EndReason, String)> {
        self.state.read().stop.clone()
    }
}

impl std::fmt::Debug for RiskGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RiskGuard")
            .field("limits", &self.limits)
            .field("stopped", &self.state.read().stop)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn clock() -> Arc<ManualClock> {
        Arc::new(ManualClock::starting_at(
            "2025-03-01T12:00:00Z".parse().unwrap(),
        ))
    }

    #[test]
    fn proceeds_with_no_limits() {
        let guard = RiskGuard::new(RiskLimits::default(), clock());
        assert_eq!(guard.pre_tick(-1_000_000.0, 99.0), Gate::Proceed);
    }

    #[test]
    fn time_limit_latches() {
        let c = clock();
        let guard = RiskGuard::new(
            RiskLimits {
                time_limit_seconds: Some(2),
                ..Default::default()
            },
            c.clone(),
        );

        assert_eq!(guard.pre_tick(0.0, 0.0), Gate::Proceed);
        c.advance(2.0);
        assert!(matches!(
            guard.pre_tick(0.0, 0.0),
            Gate::Stop(EndReason::TimeLimit, _)
        ));
        // Latched: every later tick reports the same stop.
        assert!(matches!(
            guard.pre_tick(0.0, 0.0),
            Gate::Stop(EndReason::TimeLimit, _)
        ));
        assert!(guard.stopped().is_some());
    }

    #[test]
    fn max_loss_latches_at_threshold() {
        let guard = RiskGuard::new(
            RiskLimits {
                max_loss_limit: Some(500.0),
                ..Default::default()
            },
            clock(),
        );

        assert_eq!(guard.pre_tick(-499.99, 0.0), Gate::Proceed);
        assert!(matches!(
            guard.pre_tick(-501.0, 0.0),
            Gate::Stop(EndReason::MaxLoss, _)
        ));
    }

    #[test]
    fn negative_max_loss_config_uses_absolute_value() {
        let guard = RiskGuard::new(
            RiskLimits {
                max_loss_limit: Some(-500.0),
                ..Default::default()
            },
            clock(),
        );
        assert!(matches!(
            guard.pre_tick(-500.0, 0.0),
            Gate::Stop(EndReason::MaxLoss, _)
        ));
    }

    #[test]
    fn drawdown_pauses_without_latching() {
        let guard = RiskGuard::new(
            RiskLimits {
                max_drawdown_percent: Some(10.0),
                ..Default::default()
            },
            clock(),
        );

        assert!(matches!(
            guard.pre_tick(0.0, 12.0),
            Gate::PauseEntries(_)
        ));
        // Not a stop: nothing latched.
        assert!(guard.stopped().is_none());
        assert_eq!(guard.pre_tick(0.0, 5.0), Gate::Proceed);
    }

    #[test]
    fn cooldown_after_adverse_close_expires() {
        let c = clock();
        let guard = RiskGuard::new(
            RiskLimits {
                cooldown_seconds: 120,
                ..Default::default()
            },
            c.clone(),
        );

        guard.record_trade_result(-50.0);
        assert!(matches!(guard.pre_tick(0.0, 0.0), Gate::PauseEntries(_)));

        c.advance(121.0);
        assert_eq!(guard.pre_tick(0.0, 0.0), Gate::Proceed);
    }

    #[test]
    fn winning_close_does_not_start_cooldown() {
        let guard = RiskGuard::new(
            RiskLimits {
                cooldown_seconds: 120,
                ..Default::default()
            },
            clock(),
        );
        guard.record_trade_result(75.0);
        assert_eq!(guard.pre_tick(0.0, 0.0), Gate::Proceed);
    }

    #[test]
    fn gate_order_time_before_loss() {
        let c = clock();
        let guard = RiskGuard::new(
            RiskLimits {
                time_limit_seconds: Some(1),
                max_loss_limit: Some(100.0),
                ..Default::default()
            },
            c.clone(),
        );
        c.advance(5.0);
        // Both tripped; the time gate is evaluated first.
        assert!(matches!(
            guard.pre_tick(-1_000.0, 0.0),
            Gate::Stop(EndReason::TimeLimit, _)
        ));
    }
}
