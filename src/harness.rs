// =============================================================================
// Strategy Harness — consistent world views in, vetted signals out
// =============================================================================
//
// Per tick, per symbol the harness:
//   1. polls a bounded candle window for the strategy's timeframe and merges
//      it into the local history cache (closed rows are immutable);
//   2. skips the symbol when fewer than `min_bars` closed candles exist;
//   3. snapshots indicators off the last fully-closed candle (the register's
//      entry context — an in-progress bar never leaks in);
//   4. invokes the strategy behind a panic guard: a failing strategy skips
//      one tick, it never takes the session down;
//   5. drops signals under the strategy's confidence floor.
//
// The strategy never sees the engine or the store — only `MarketSnapshot`.
// =============================================================================

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::clock::Clock;
use crate::error::EngineError;
use crate::indicators::{
    atr::volatility_percent, bollinger_bands, macd, relative_strength_index,
};
use crate::market_data::history::{HistoryCache, HistoryKey};
use crate::market_data::MarketDataSource;
use crate::models::Position;
use crate::register::EntryContext;
use crate::store::Store;
use crate::strategy::{MarketSnapshot, SessionContext, Signal, SignalKind, Strategy, StrategyInfo};

/// Candles requested from the source per poll.
const CANDLE_WINDOW: usize = 100;
/// Funding samples requested for funding-aware strategies.
const FUNDING_WINDOW: usize = 24;
/// Closed candles retained per series.
const HISTORY_DEPTH: usize = 500;

/// A signal that passed all harness gates, with the audit context captured
/// at decision time.
#[derive(Debug, Clone)]
pub struct Evaluation {
    pub signal: Signal,
    pub context: EntryContext,
}

pub struct StrategyHarness {
    strategy: Box<dyn Strategy>,
    info: StrategyInfo,
    market: Arc<dyn MarketDataSource>,
    clock: Arc<dyn Clock>,
    store: Arc<Store>,
    history: HistoryCache,
}

impl StrategyHarness {
    pub fn new(
        strategy: Box<dyn Strategy>,
        market: Arc<dyn MarketDataSource>,
        clock: Arc<dyn Clock>,
        store: Arc<Store>,
    ) -> Self {
        let info = strategy.info();
        Self {
            strategy,
            info,
            market,
            clock,
            store,
            history: HistoryCache::new(HISTORY_DEPTH),
        }
    }

    pub fn info(&self) -> &StrategyInfo {
        &self.info
    }

    pub fn parameters(&self) -> serde_json::Value {
        self.strategy.parameters()
    }

    pub fn set_session_context(&mut self, ctx: &SessionContext) {
        self.strategy.set_session_context(ctx);
    }

    // -------------------------------------------------------------------------
    // Snapshot assembly
    // -------------------------------------------------------------------------

    /// Build the strategy's view for `symbol`, or `None` when the symbol
    /// must be skipped this tick (fetch failure, not enough history).
    async fn snapshot_for(&mut self, symbol: &str) -> Option<MarketSnapshot> {
        let key = HistoryKey {
            symbol: symbol.to_string(),
            timeframe: self.info.timeframe,
        };

        match self
            .market
            .fetch_candles(symbol, self.info.timeframe, CANDLE_WINDOW)
            .await
        {
            Ok(candles) => {
                if let Err(e) = self.store.record_candles(symbol, self.info.timeframe, &candles) {
                    debug!(symbol, error = %e, "candles not recorded");
                }
                self.history.merge(key.clone(), &candles);
            }
            Err(e) => {
                warn!(symbol, error = %e, "candle fetch failed, skipping symbol this tick");
                return None;
            }
        }

        let now = self.clock.now_utc();
        let candles = self.history.closed_window(&key, CANDLE_WINDOW, now);
        if candles.len() < self.info.min_bars {
            debug!(
                symbol,
                have = candles.len(),
                need = self.info.min_bars,
                "not enough closed candles yet"
            );
            return None;
        }

        let funding_rates = if self.info.wants_funding {
            match self.market.get_funding_rates(symbol, FUNDING_WINDOW).await {
                Ok(rates) => {
                    if let Err(e) = self.store.record_funding(symbol, &rates) {
                        debug!(symbol, error = %e, "funding not recorded");
                    }
                    rates
                }
                Err(e) => {
                    warn!(symbol, error = %e, "funding fetch failed, continuing without");
                    Vec::new()
                }
            }
        } else {
            Vec::new()
        };

        let last_price = candles.last().map(|c| c.close)?;
        Some(MarketSnapshot {
            candles,
            last_price,
            funding_rates,
        })
    }

    /// Indicator snapshot over the closed candles, for the register entry.
    fn entry_context(snapshot: &MarketSnapshot, signal: &Signal) -> EntryContext {
        let closes = snapshot.closes();
        let bb_position = bollinger_bands(&closes, 20, 2.0)
            .map(|bands| bands.position_of(snapshot.last_price));

        EntryContext {
            confidence: Some(signal.confidence),
            reason: Some(signal.reason.clone()),
            strategy_parameters: None, // filled by the caller with harness.parameters()
            market_volume_24h: None,
            market_volatility: volatility_percent(&snapshot.candles),
            rsi: relative_strength_index(&closes, 14),
            macd: macd(&closes, 12, 26, 9).map(|m| m.macd),
            bb_position,
            expected_entry_price: Some(signal.price),
            tags: vec![signal.strategy.clone()],
        }
    }

    // -------------------------------------------------------------------------
    // Entry evaluation
    // -------------------------------------------------------------------------

    /// Evaluate one symbol for a new entry. Returns a vetted signal with its
    /// audit context, or `None`.
    pub async fn evaluate(&mut self, symbol: &str) -> Option<Evaluation> {
        let snapshot = self.snapshot_for(symbol).await?;

        let result = std::panic::catch_unwind(AssertUnwindSafe(|| {
            self.strategy.analyze(&snapshot, symbol)
        }));
        let signal = match result {
            Ok(signal) => signal?,
            Err(panic) => {
                let err = EngineError::StrategyFailed {
                    strategy: self.info.name.clone(),
                    detail: panic_message(&panic),
                };
                warn!(symbol, error = %err, "strategy skipped for this tick");
                return None;
            }
        };

        if matches!(signal.kind, SignalKind::Hold) {
            return None;
        }
        if signal.confidence < self.info.min_confidence {
            debug!(
                symbol,
                confidence = signal.confidence,
                floor = self.info.min_confidence,
                "signal under confidence floor, dropped"
            );
            return None;
        }

        let mut context = Self::entry_context(&snapshot, &signal);
        context.strategy_parameters = Some(self.strategy.parameters());

        debug!(symbol, signal = %signal, "signal accepted by harness");
        Some(Evaluation { signal, context })
    }

    // -------------------------------------------------------------------------
    // Exit evaluation
    // -------------------------------------------------------------------------

    /// Ask the strategy about every open position it owns (matched by
    /// attribution). Returns positions paired with their close signals.
    pub async fn check_position_exits(&mut self, positions: &[Position]) -> Vec<(Position, Signal)> {
        let mut closes = Vec::new();

        for position in positions {
            if position.strategy.as_deref() != Some(self.info.name.as_str()) {
                continue;
            }

            let Some(snapshot) = self.snapshot_for(&position.symbol).await else {
                continue;
            };
            let (_, pnl_percent) = position.pnl_at(snapshot.last_price);

            let result = std::panic::catch_unwind(AssertUnwindSafe(|| {
                self.strategy.should_close_position(
                    &snapshot,
                    position.entry_price,
                    position.side,
                    pnl_percent,
                )
            }));

            match result {
                Ok(Some(mut signal)) if signal.kind == SignalKind::Close => {
                    signal.symbol = position.symbol.clone();
                    debug!(symbol = %position.symbol, reason = %signal.reason, "strategy close");
                    closes.push((position.clone(), signal));
                }
                Ok(_) => {}
                Err(panic) => {
                    let err = EngineError::StrategyFailed {
                        strategy: self.info.name.clone(),
                        detail: panic_message(&panic),
                    };
                    warn!(symbol = %position.symbol, error = %err, "close check skipped");
                }
            }
        }

        closes
    }
}

fn panic_message(panic: &Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

impl std::fmt::Debug for StrategyHarness {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StrategyHarness")
            .field("strategy", &self.info.name)
            .field("timeframe", &self.info.timeframe)
            .finish_non_exhaustive()
    }
}
