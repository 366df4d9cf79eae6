// =============================================================================
// Trading Bot — the orchestrator loop
// =============================================================================
//
// Tick phases, in order:
//   1. Risk pre-check            (may latch a session stop)
//   2. SL/TP/liquidation sweep   (liquidation > SL > TP, fresh tickers)
//   3. Strategy-owned exit sweep (should_close_position per owned position)
//   4. Per-symbol entry scan     (configured symbol order, validated, sized)
//   5. Periodic live summary
//   6. Sleep until the next tick
//
// Pacing: ticks never overlap. An overrun tick is followed immediately; there
// is no catch-up burst. Ctrl-C (via the shutdown watch) lets the in-progress
// tick finish its transaction, closes the session row with `manual`, prints
// the final summary, and returns.
// =============================================================================

use std::sync::Arc;

use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::clock::Clock;
use crate::config::ResolvedConfig;
use crate::error::EngineError;
use crate::harness::{Evaluation, StrategyHarness};
use crate::models::Trade;
use crate::paper_engine::{PaperEngine, SessionInfo};
use crate::risk::{Gate, RiskGuard, RiskLimits};
use crate::store::{SessionClose, SessionRow};
use crate::strategy::{SessionContext, SignalKind};
use crate::time_parser::format_duration;
use crate::types::{EndReason, ExitReason, Side, TradeMode};

/// Seconds between live summaries.
const SUMMARY_INTERVAL_SECS: f64 = 60.0;

pub struct TradingBot {
    engine: Arc<PaperEngine>,
    harness: StrategyHarness,
    risk: RiskGuard,
    clock: Arc<dyn Clock>,
    cfg: ResolvedConfig,

    session_row_id: i64,
    session_id: String,
    session_started: f64,
    last_summary: f64,

    shutdown: watch::Receiver<bool>,
}

impl TradingBot {
    /// Wire up a session: close stale session rows, register the strategy,
    /// create the session row, and hand the session context to the engine
    /// and the strategy.
    pub async fn new(
        engine: Arc<PaperEngine>,
        mut harness: StrategyHarness,
        cfg: ResolvedConfig,
        clock: Arc<dyn Clock>,
        shutdown: watch::Receiver<bool>,
    ) -> Result<Self, EngineError> {
        let now = clock.now_utc();
        let store = engine.store().clone();
        let account = engine.account()?;

        store.close_stale_sessions(account.id, now)?;

        let info = harness.info().clone();
        let strategy_id = store.upsert_strategy(
            &info.name,
            &info.display_name,
            env!("CARGO_PKG_VERSION"),
            Some(&harness.parameters()),
            info.min_confidence,
            now,
        )?;

        let session_id = format!("{}_{}", account.name, now.format("%Y%m%d_%H%M%S"));
        let session_row_id = store.insert_session(&SessionRow {
            id: 0,
            session_id: session_id.clone(),
            account_id: account.id,
            strategy_id: Some(strategy_id),
            mode: TradeMode::Paper,
            symbols: cfg.symbols.clone(),
            started_at: now,
            ended_at: None,
            duration_seconds: None,
            time_limit_seconds: cfg.time_limit_seconds.map(|s| s as i64),
            max_loss_limit: cfg.max_loss,
            max_positions: Some(cfg.max_positions as i64),
            total_trades: 0,
            winning_trades: 0,
            losing_trades: 0,
            total_pnl: 0.0,
            starting_balance: account.current_balance,
            ending_balance: None,
            peak_balance: Some(account.current_balance),
            max_drawdown: 0.0,
            end_reason: None,
            notes: None,
        })?;

        engine.set_session_info(SessionInfo {
            session_id: Some(session_id.clone()),
            strategy_id: Some(strategy_id),
            max_loss_limit: cfg.max_loss,
            time_limit_seconds: cfg.time_limit_seconds.map(|s| s as i64),
        });

        harness.set_session_context(&SessionContext {
            balance: account.current_balance,
            time_limit_seconds: cfg.time_limit_seconds.map(|s| s as i64),
            max_loss: cfg.max_loss,
            mode: TradeMode::Paper,
        });

        let risk = RiskGuard::new(
            RiskLimits {
                time_limit_seconds: cfg.time_limit_seconds,
                max_loss_limit: cfg.max_loss,
                max_drawdown_percent: cfg.max_drawdown_percent,
                cooldown_seconds: cfg.cooldown_seconds,
            },
            clock.clone(),
        );

        info!(
            session_id = %session_id,
            strategy = %info.name,
            symbols = ?cfg.symbols,
            check_interval = format_duration(cfg.check_interval_seconds),
            "trading session created"
        );

        let session_started = clock.monotonic_secs();
        Ok(Self {
            engine,
            harness,
            risk,
            clock,
            cfg,
            session_row_id,
            session_id,
            session_started,
            last_summary: f64::MIN,
            shutdown,
        })
    }

    // -------------------------------------------------------------------------
    // Main loop
    // -------------------------------------------------------------------------

    pub async fn run(mut self) -> EndReason {
        info!(session_id = %self.session_id, "bot running");
        self.live_summary(true).await;

        let end_reason = self.run_loop().await;
        self.finish(end_reason).await;
        end_reason
    }

    async fn run_loop(&mut self) -> EndReason {
        let interval_secs = self.cfg.check_interval_seconds as f64;

        loop {
            let tick_started = self.clock.monotonic_secs();

            if *self.shutdown.borrow() {
                info!("shutdown requested, ending session");
                return EndReason::Manual;
            }

            // ── 1. Risk gates ────────────────────────────────────────────
            let account = match self.engine.account() {
                Ok(account) => account,
                Err(e) => {
                    error!(error = %e, "account read failed, ending session");
                    return EndReason::Error;
                }
            };

            let mut entries_paused = false;
            match self.risk.pre_tick(account.total_pnl, account.max_drawdown) {
                Gate::Stop(reason, detail) => {
                    warn!(%detail, "session stop latched");
                    // In-flight exits still run under a latched stop.
                    match self.engine.check_exits().await {
                        Ok(trades) => self.feed_risk(&trades),
                        Err(e) => warn!(error = %e, "final exit sweep failed"),
                    }
                    return reason;
                }
                Gate::PauseEntries(detail) => {
                    info!(%detail, "new entries paused this tick");
                    entries_paused = true;
                }
                Gate::Proceed => {}
            }

            // ── 2. SL/TP/liquidation sweep ───────────────────────────────
            match self.engine.check_exits().await {
                Ok(trades) => self.feed_risk(&trades),
                Err(e) => {
                    error!(error = %e, "exit sweep failed, ending session");
                    return EndReason::Error;
                }
            }

            // ── 3. Strategy-owned exits ──────────────────────────────────
            let open = match self.engine.open_positions(None) {
                Ok(open) => open,
                Err(e) => {
                    error!(error = %e, "open-positions read failed, ending session");
                    return EndReason::Error;
                }
            };
            for (position, signal) in self.harness.check_position_exits(&open).await {
                let reason = signal.exit_reason.unwrap_or(ExitReason::StrategyClose);
                match self
                    .engine
                    .close_position(position.id, reason, Some(signal.reason.clone()))
                    .await
                {
                    Ok(trade) => self.risk.record_trade_result(trade.net_pnl),
                    // Already taken out by the protective sweep this tick.
                    Err(EngineError::NotOpen(_)) => {}
                    Err(e @ EngineError::NoPrice { .. }) => {
                        warn!(symbol = %position.symbol, error = %e, "strategy close skipped")
                    }
                    Err(e) => {
                        error!(error = %e, "strategy close failed, ending session");
                        return EndReason::Error;
                    }
                }
            }

            // ── 4. Entry scan, configured symbol order ───────────────────
            if !entries_paused {
                let symbols = self.cfg.symbols.clone();
                for symbol in &symbols {
                    let Some(evaluation) = self.harness.evaluate(symbol).await else {
                        continue;
                    };
                    if let Err(e) = self.apply_entry(evaluation).await {
                        match e {
                            EngineError::InsufficientFunds { .. } => {
                                info!(symbol = %symbol, error = %e, "entry refused")
                            }
                            EngineError::NoPrice { .. } => {
                                warn!(symbol = %symbol, error = %e, "entry skipped this tick")
                            }
                            other => {
                                error!(symbol = %symbol, error = %other, "entry failed, ending session");
                                return EndReason::Error;
                            }
                        }
                    }
                }
            }

            // ── 5. Periodic summary ──────────────────────────────────────
            self.live_summary(false).await;

            // ── 6. Sleep until the next tick ─────────────────────────────
            let now = self.clock.monotonic_secs();
            let remaining = tick_started + interval_secs - now;
            if remaining > 0.0 {
                let sleep = tokio::time::sleep(std::time::Duration::from_secs_f64(remaining));
                tokio::select! {
                    _ = sleep => {}
                    changed = self.shutdown.changed() => {
                        // A dropped sender means no shutdown can ever arrive;
                        // finish the pause instead of spinning.
                        if changed.is_err() {
                            let left = tick_started + interval_secs - self.clock.monotonic_secs();
                            if left > 0.0 {
                                tokio::time::sleep(std::time::Duration::from_secs_f64(left)).await;
                            }
                        }
                    }
                }
            }
            // Overrun: fall through immediately, no catch-up burst.
        }
    }

    fn feed_risk(&self, trades: &[Trade]) {
        for trade in trades {
            self.risk.record_trade_result(trade.net_pnl);
        }
    }

    // -------------------------------------------------------------------------
    // Signal application
    // -------------------------------------------------------------------------

    async fn apply_entry(&mut self, evaluation: Evaluation) -> Result<(), EngineError> {
        let signal = &evaluation.signal;

        // A strategy may decide to flatten from `analyze` as well.
        if signal.kind == SignalKind::Close {
            let owned = self.engine.open_positions(Some(&signal.symbol))?;
            for position in owned {
                let trade = self
                    .engine
                    .close_position(
                        position.id,
                        signal.exit_reason.unwrap_or(ExitReason::StrategyClose),
                        Some(signal.reason.clone()),
                    )
                    .await?;
                self.risk.record_trade_result(trade.net_pnl);
            }
            return Ok(());
        }

        let side = match signal.kind {
            SignalKind::Buy => Side::Long,
            SignalKind::Sell => Side::Short,
            SignalKind::Hold | SignalKind::Close => return Ok(()),
        };

        let open = self.engine.open_positions(None)?;
        if open.len() >= self.cfg.max_positions as usize {
            warn!(
                symbol = %signal.symbol,
                open = open.len(),
                cap = self.cfg.max_positions,
                "max positions reached, signal dropped"
            );
            return Ok(());
        }
        if !self.harness.info().allow_hedging
            && open.iter().any(|p| p.symbol == signal.symbol)
        {
            warn!(symbol = %signal.symbol, "position already open on symbol, signal dropped");
            return Ok(());
        }

        let balance = self.engine.account()?.current_balance;
        let size = compute_size(
            &self.cfg,
            &signal.symbol,
            signal.price,
            signal.size_percent,
            balance,
        );
        if size <= 0.0 {
            warn!(symbol = %signal.symbol, "computed size is zero, signal dropped");
            return Ok(());
        }

        let position = self
            .engine
            .open_position(crate::paper_engine::OpenRequest {
                symbol: signal.symbol.clone(),
                side,
                size,
                leverage: self.cfg.leverage,
                stop_loss: signal.stop_loss,
                take_profit: signal.take_profit,
                strategy: Some(signal.strategy.clone()),
                notes: Some(signal.reason.clone()),
                context: evaluation.context.clone(),
            })
            .await?;

        info!(
            symbol = %position.symbol,
            side = %position.side,
            size = position.size,
            confidence = signal.confidence,
            "signal applied"
        );
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Summaries & session close
    // -------------------------------------------------------------------------

    async fn live_summary(&mut self, force: bool) {
        let now = self.clock.monotonic_secs();
        if !force && now - self.last_summary < SUMMARY_INTERVAL_SECS {
            return;
        }
        self.last_summary = now;

        let elapsed = (now - self.session_started) as u64;
        match self.engine.account_summary().await {
            Ok(summary) => {
                info!(
                    elapsed = format_duration(elapsed),
                    balance = format!("{:.2}", summary.current_balance),
                    unrealized = format!("{:+.2}", summary.unrealized_pnl),
                    equity = format!("{:.2}", summary.equity),
                    total_pnl = format!("{:+.2}", summary.total_pnl),
                    roi = format!("{:+.2}%", summary.roi),
                    trades = summary.total_trades,
                    win_rate = format!("{:.1}%", summary.win_rate),
                    open_positions = summary.open_positions,
                    "session summary"
                );
            }
            Err(e) => warn!(error = %e, "summary unavailable"),
        }

        match self.engine.open_positions(None) {
            Ok(positions) => {
                for p in positions {
                    info!(
                        symbol = %p.symbol,
                        side = %p.side,
                        size = p.size,
                        entry = format!("{:.2}", p.entry_price),
                        mark = format!("{:.2}", p.current_price),
                        pnl = format!("{:+.2}", p.unrealized_pnl),
                        pnl_percent = format!("{:+.2}%", p.unrealized_pnl_percent),
                        "open position"
                    );
                }
            }
            Err(e) => warn!(error = %e, "open positions unavailable"),
        }
    }

    async fn finish(&mut self, end_reason: EndReason) {
        let now = self.clock.now_utc();
        let duration = (self.clock.monotonic_secs() - self.session_started) as i64;

        let (account, summary) = match (self.engine.account(), self.engine.account_summary().await)
        {
            (Ok(a), Ok(s)) => (a, s),
            (Ok(a), Err(e)) => {
                warn!(error = %e, "final summary degraded to stored balances");
                let s = crate::paper_engine::AccountSummary {
                    account_name: a.name.clone(),
                    initial_balance: a.initial_balance,
                    current_balance: a.current_balance,
                    unrealized_pnl: 0.0,
                    equity: a.current_balance,
                    total_pnl: a.total_pnl,
                    roi: a.roi(),
                    total_trades: a.total_trades,
                    win_rate: a.win_rate(),
                    max_drawdown: a.max_drawdown,
                    peak_balance: a.peak_balance,
                    open_positions: 0,
                };
                (a, s)
            }
            (Err(e), _) => {
                error!(error = %e, "cannot read account while closing session");
                return;
            }
        };

        let close = SessionClose {
            ended_at: now,
            duration_seconds: duration,
            ending_balance: summary.equity,
            peak_balance: account.peak_balance,
            max_drawdown: account.max_drawdown,
            total_trades: account.total_trades,
            winning_trades: account.winning_trades,
            losing_trades: account.losing_trades,
            total_pnl: account.total_pnl,
            end_reason,
        };
        if let Err(e) = self.engine.store().close_session(self.session_row_id, &close) {
            error!(error = %e, "failed to close session row");
        }

        info!(
            session_id = %self.session_id,
            end_reason = %end_reason,
            duration = format_duration(duration.max(0) as u64),
            ending_equity = format!("{:.2}", summary.equity),
            total_pnl = format!("{:+.2}", account.total_pnl),
            trades = account.total_trades,
            win_rate = format!("{:.1}%", account.win_rate()),
            max_drawdown = format!("{:.2}%", account.max_drawdown),
            "trading session closed"
        );
    }
}

/// Position sizing: a fixed override for the matching base asset wins;
/// otherwise a percentage of the current balance at the signal price. The
/// signal's own percentage is used when it names one.
fn compute_size(
    cfg: &ResolvedConfig,
    symbol: &str,
    price: f64,
    signal_size_percent: f64,
    balance: f64,
) -> f64 {
    if price <= 0.0 {
        return 0.0;
    }

    if let Some(override_) = &cfg.position_size_override {
        let base = symbol.split('-').next().unwrap_or(symbol);
        if base.eq_ignore_ascii_case(&override_.base) {
            return override_.amount;
        }
    }

    let percent = if signal_size_percent > 0.0 {
        signal_size_percent
    } else {
        cfg.size_percent
    };
    balance * (percent / 100.0) / price
}

impl std::fmt::Debug for TradingBot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TradingBot")
            .field("session_id", &self.session_id)
            .field("symbols", &self.cfg.symbols)
            .finish_non_exhaustive()
    }
}
