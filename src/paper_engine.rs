// =============================================================================
// Paper Engine — the sole authority over account, position, and trade state
// =============================================================================
//
// Every monetary change flows through here and is persisted in a single
// transaction: balance delta + position row + order row + trade row +
// register entry/patch + account counters commit or roll back together.
//
// Accounting rule (pinned by tests): slippage enters the balance exactly once
// through the effective exit price inside gross PnL. The balance credit on
// close is `margin_used + gross_pnl - exit_fee`. The separate slippage cost
// is subtracted again only in the reported net PnL, which also drives the
// win/loss counters and `total_pnl`.
//
// Exit sweep ordering: liquidation before stop-loss before take-profit, all
// thresholds inclusive, at most one exit per position per sweep.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::clock::Clock;
use crate::error::{EngineError, EngineResult};
use crate::market_data::MarketDataSource;
use crate::models::{Account, Order, Position, Trade};
use crate::notifier::Notifier;
use crate::register::{EntryContext, RegisterExit, RegisterRow};
use crate::store::{self, Store};
use crate::types::{ExitReason, OrderStatus, OrderType, PositionStatus, Side, TradeMode};

/// Hard ceiling on per-position leverage, matching the venue's limit.
const MAX_LEVERAGE: f64 = 20.0;

// ---------------------------------------------------------------------------
// Requests and read models
// ---------------------------------------------------------------------------

/// Everything needed to open a position. `context` carries the audit snapshot
/// for the register entry row; a manual open passes `EntryContext::default()`.
#[derive(Debug, Clone)]
pub struct OpenRequest {
    pub symbol: String,
    pub side: Side,
    pub size: f64,
    pub leverage: f64,
    pub stop_loss: Option<f64>,
    pub take_profit: Option<f64>,
    pub strategy: Option<String>,
    pub notes: Option<String>,
    pub context: EntryContext,
}

/// Session attribution stamped onto register rows while a session is active.
#[derive(Debug, Clone, Default)]
pub struct SessionInfo {
    pub session_id: Option<String>,
    pub strategy_id: Option<i64>,
    pub max_loss_limit: Option<f64>,
    pub time_limit_seconds: Option<i64>,
}

/// Point-in-time account rollup.
#[derive(Debug, Clone, Serialize)]
pub struct AccountSummary {
    pub account_name: String,
    pub initial_balance: f64,
    pub current_balance: f64,
    pub unrealized_pnl: f64,
    pub equity: f64,
    pub total_pnl: f64,
    pub roi: f64,
    pub total_trades: i64,
    pub win_rate: f64,
    pub max_drawdown: f64,
    pub peak_balance: f64,
    pub open_positions: usize,
}

/// Aggregate statistics over closed trades.
#[derive(Debug, Clone, Serialize)]
pub struct PerformanceStats {
    pub total_trades: usize,
    pub winning_trades: usize,
    pub losing_trades: usize,
    pub win_rate: f64,
    pub avg_win: f64,
    pub avg_loss: f64,
    pub profit_factor: f64,
    pub avg_duration_minutes: f64,
    pub best_trade: f64,
    pub worst_trade: f64,
    pub total_pnl: f64,
    pub total_fees: f64,
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

pub struct PaperEngine {
    store: Arc<Store>,
    market: Arc<dyn MarketDataSource>,
    clock: Arc<dyn Clock>,
    notifier: Arc<Notifier>,

    account_id: i64,
    account_name: String,
    /// Fractional haircut applied to every exit, in percent (0.75 = 0.75%).
    slippage_percent: f64,

    session: RwLock<SessionInfo>,
}

impl PaperEngine {
    /// Load or create the named account, verify register/position pairing
    /// left over from a previous run, and return the engine.
    pub fn new(
        store: Arc<Store>,
        market: Arc<dyn MarketDataSource>,
        clock: Arc<dyn Clock>,
        notifier: Arc<Notifier>,
        account_name: &str,
        initial_balance: f64,
        default_leverage: f64,
        slippage_percent: f64,
    ) -> EngineResult<Self> {
        let account = store.get_or_create_account(
            account_name,
            initial_balance,
            default_leverage,
            clock.now_utc(),
        )?;

        let engine = Self {
            store,
            market,
            clock,
            notifier,
            account_id: account.id,
            account_name: account.name.clone(),
            slippage_percent,
            session: RwLock::new(SessionInfo::default()),
        };
        engine.verify_register_pairing()?;

        info!(
            account = %engine.account_name,
            balance = account.current_balance,
            slippage_percent,
            "paper engine ready"
        );
        Ok(engine)
    }

    /// Stamp session attribution onto subsequent register rows.
    pub fn set_session_info(&self, info: SessionInfo) {
        *self.session.write() = info;
    }

    pub fn account(&self) -> EngineResult<Account> {
        self.store.account(self.account_id)
    }

    pub fn account_id(&self) -> i64 {
        self.account_id
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    // -------------------------------------------------------------------------
    // Market reads
    // -------------------------------------------------------------------------

    /// Fresh mark price for `symbol`. Records the ticker into the time-series
    /// table best-effort.
    pub async fn get_current_price(&self, symbol: &str) -> EngineResult<f64> {
        let ticker = self
            .market
            .get_ticker(symbol)
            .await
            .map_err(|e| EngineError::NoPrice {
                symbol: symbol.to_string(),
                detail: e.to_string(),
            })?;

        if !ticker.mark_price.is_finite() || ticker.mark_price <= 0.0 {
            return Err(EngineError::NoPrice {
                symbol: symbol.to_string(),
                detail: format!("mark price {}", ticker.mark_price),
            });
        }

        if let Err(e) = self
            .store
            .record_ticker(symbol, self.clock.now_utc(), &ticker)
        {
            debug!(symbol, error = %e, "ticker not recorded");
        }

        Ok(ticker.mark_price)
    }

    pub fn open_positions(&self, symbol: Option<&str>) -> EngineResult<Vec<Position>> {
        self.store.open_positions(self.account_id, symbol)
    }

    // -------------------------------------------------------------------------
    // Open
    // -------------------------------------------------------------------------

    pub async fn open_position(&self, req: OpenRequest) -> EngineResult<Position> {
        if !req.size.is_finite() || req.size <= 0.0 {
            return Err(EngineError::InvalidSize(req.size));
        }
        if !req.leverage.is_finite() || req.leverage < 1.0 || req.leverage > MAX_LEVERAGE {
            return Err(EngineError::InvalidLeverage {
                requested: req.leverage,
                cap: MAX_LEVERAGE,
            });
        }

        let mark_price = self.get_current_price(&req.symbol).await?;
        let now = self.clock.now_utc();

        let position_value = req.size * mark_price;
        let margin_required = position_value / req.leverage;
        let session = self.session.read().clone();

        let position = self.store.with_tx(|tx| {
            let mut account = store::load_account(tx, self.account_id)?;

            let entry_fee = position_value * account.taker_fee;
            let total_required = margin_required + entry_fee;
            if total_required > account.current_balance {
                return Err(EngineError::InsufficientFunds {
                    required: total_required,
                    available: account.current_balance,
                });
            }

            // One open register row per (account, symbol) is the pairing
            // invariant; a duplicate here means the caller lost track of an
            // open position.
            if store::open_register_exists(tx, self.account_id, &req.symbol)? {
                return Err(EngineError::DatabaseFatal(format!(
                    "open trade-register row already exists for {}",
                    req.symbol
                )));
            }

            let mut position = Position {
                id: 0,
                account_id: self.account_id,
                symbol: req.symbol.clone(),
                side: req.side,
                size: req.size,
                entry_price: mark_price,
                current_price: mark_price,
                leverage: req.leverage,
                margin_used: margin_required,
                stop_loss: req.stop_loss,
                take_profit: req.take_profit,
                unrealized_pnl: 0.0,
                unrealized_pnl_percent: 0.0,
                status: PositionStatus::Open,
                opened_at: now,
                closed_at: None,
                strategy: req.strategy.clone(),
                notes: req.notes.clone(),
            };
            position.id = store::insert_position(tx, &position)?;

            store::insert_order(
                tx,
                &Order {
                    id: 0,
                    account_id: self.account_id,
                    client_order_id: Uuid::new_v4().to_string(),
                    symbol: req.symbol.clone(),
                    side: req.side,
                    order_type: OrderType::Market,
                    size: req.size,
                    price: None,
                    leverage: req.leverage,
                    status: OrderStatus::Filled,
                    filled_size: req.size,
                    filled_price: Some(mark_price),
                    created_at: now,
                    filled_at: Some(now),
                    cancelled_at: None,
                    strategy: req.strategy.clone(),
                    notes: Some("simulated entry fill".to_string()),
                },
            )?;

            let margin_available_before = account.current_balance;
            account.current_balance -= total_required;
            store::update_account(tx, &account, now)?;

            let expected_entry = req.context.expected_entry_price.unwrap_or(mark_price);
            let entry_slippage_percent = if expected_entry > 0.0 {
                (mark_price - expected_entry).abs() / expected_entry * 100.0
            } else {
                0.0
            };

            store::insert_register(
                tx,
                &RegisterRow {
                    id: 0,
                    account_id: self.account_id,
                    strategy_id: session.strategy_id,
                    paper_trade_id: None,
                    symbol: req.symbol.clone(),
                    side: req.side,
                    mode: TradeMode::Paper,
                    entry_timestamp: now,
                    entry_price: mark_price,
                    entry_size: req.size,
                    entry_value_usd: position_value,
                    leverage: req.leverage,
                    margin_required,
                    margin_available_before,
                    fee_entry: entry_fee,
                    expected_entry_price: Some(expected_entry),
                    actual_entry_price: Some(mark_price),
                    entry_slippage_percent: Some(entry_slippage_percent),
                    exit_timestamp: None,
                    exit_price: None,
                    exit_reason: None,
                    fee_exit: 0.0,
                    fee_total: entry_fee,
                    pnl_gross: None,
                    pnl_net: None,
                    pnl_percent: None,
                    duration_seconds: None,
                    duration_human: None,
                    expected_exit_price: None,
                    actual_exit_price: None,
                    exit_slippage_percent: None,
                    stop_loss_price: req.stop_loss,
                    take_profit_price: req.take_profit,
                    stop_loss_triggered: false,
                    take_profit_triggered: false,
                    market_price_at_entry: Some(mark_price),
                    market_volume_24h: req.context.market_volume_24h,
                    market_volatility: req.context.market_volatility,
                    rsi_at_entry: req.context.rsi,
                    macd_at_entry: req.context.macd,
                    bb_position_at_entry: req.context.bb_position,
                    signal_confidence: req.context.confidence,
                    signal_reason: req.context.reason.clone().or_else(|| req.notes.clone()),
                    strategy_parameters: req.context.strategy_parameters.clone(),
                    session_id: session.session_id.clone(),
                    bot_version: Some(env!("CARGO_PKG_VERSION").to_string()),
                    max_loss_limit: session.max_loss_limit,
                    time_limit_seconds: session.time_limit_seconds,
                    notes: req.notes.clone(),
                    tags: req.context.tags.clone(),
                },
                now,
            )?;

            Ok(position)
        })?;

        info!(
            symbol = %position.symbol,
            side = %position.side,
            size = position.size,
            entry_price = position.entry_price,
            leverage = position.leverage,
            margin_used = format!("{:.2}", position.margin_used),
            strategy = position.strategy.as_deref().unwrap_or("-"),
            "position opened"
        );
        self.notifier
            .position_opened(&position.symbol, position.side.as_str());

        Ok(position)
    }

    // -------------------------------------------------------------------------
    // Close
    // -------------------------------------------------------------------------

    pub async fn close_position(
        &self,
        position_id: i64,
        exit_reason: ExitReason,
        notes: Option<String>,
    ) -> EngineResult<Trade> {
        let position = self
            .store
            .position(position_id)?
            .filter(|p| p.status == PositionStatus::Open)
            .ok_or(EngineError::NotOpen(position_id))?;

        let mark_price = self.get_current_price(&position.symbol).await?;
        self.close_position_at(&position, mark_price, exit_reason, notes)
    }

    /// Close at a known mark price. The exits sweep calls this directly so
    /// every decision within one sweep uses the same ticker.
    fn close_position_at(
        &self,
        position: &Position,
        mark_price: f64,
        exit_reason: ExitReason,
        notes: Option<String>,
    ) -> EngineResult<Trade> {
        let now = self.clock.now_utc();
        let slip = self.slippage_percent / 100.0;

        let position_value = position.size * mark_price;
        let slippage_cost = position_value * slip;
        let effective_exit = match position.side {
            Side::Long => mark_price * (1.0 - slip),
            Side::Short => mark_price * (1.0 + slip),
        };

        let (pnl_gross, pnl_percent) = position.pnl_at(effective_exit);

        let trade = self.store.with_tx(|tx| {
            let mut account = store::load_account(tx, self.account_id)?;

            let exit_fee = position_value * account.taker_fee;
            let entry_fee = position.size * position.entry_price * account.taker_fee;
            let total_fees = entry_fee + exit_fee;
            let net_pnl = pnl_gross - total_fees - slippage_cost;

            let final_status = if exit_reason == ExitReason::Liquidation {
                PositionStatus::Liquidated
            } else {
                PositionStatus::Closed
            };
            if !store::finalize_position(
                tx,
                position.id,
                final_status,
                now,
                mark_price,
                pnl_gross,
                pnl_percent,
            )? {
                return Err(EngineError::NotOpen(position.id));
            }

            let mut trade = Trade {
                id: 0,
                account_id: self.account_id,
                symbol: position.symbol.clone(),
                side: position.side,
                entry_price: position.entry_price,
                entry_time: position.opened_at,
                size: position.size,
                leverage: position.leverage,
                exit_price: effective_exit,
                exit_time: now,
                entry_fee,
                exit_fee,
                total_fees,
                pnl: pnl_gross,
                pnl_percent,
                net_pnl,
                strategy: position.strategy.clone(),
                exit_reason,
                notes: Some(match &notes {
                    Some(n) => format!("{n} | slippage: {slippage_cost:.2} USD"),
                    None => format!("slippage: {slippage_cost:.2} USD"),
                }),
            };
            trade.id = store::insert_trade(tx, &trade, now)?;

            store::insert_order(
                tx,
                &Order {
                    id: 0,
                    account_id: self.account_id,
                    client_order_id: Uuid::new_v4().to_string(),
                    symbol: position.symbol.clone(),
                    // The closing order is the opposite side of the exposure.
                    side: match position.side {
                        Side::Long => Side::Short,
                        Side::Short => Side::Long,
                    },
                    order_type: OrderType::Market,
                    size: position.size,
                    price: None,
                    leverage: position.leverage,
                    status: OrderStatus::Filled,
                    filled_size: position.size,
                    filled_price: Some(effective_exit),
                    created_at: now,
                    filled_at: Some(now),
                    cancelled_at: None,
                    strategy: position.strategy.clone(),
                    notes: Some("simulated exit fill".to_string()),
                },
            )?;

            // Balance: margin comes back plus gross PnL, minus the exit fee.
            // Slippage is already inside gross via the effective exit price.
            account.current_balance += position.margin_used + pnl_gross - exit_fee;

            account.total_trades += 1;
            account.total_pnl += net_pnl;
            if net_pnl > 0.0 {
                account.winning_trades += 1;
            } else {
                account.losing_trades += 1;
            }

            if account.current_balance > account.peak_balance {
                account.peak_balance = account.current_balance;
            } else if account.peak_balance > 0.0 {
                let drawdown = (account.peak_balance - account.current_balance)
                    / account.peak_balance
                    * 100.0;
                if drawdown > account.max_drawdown {
                    account.max_drawdown = drawdown;
                }
            }
            store::update_account(tx, &account, now)?;

            match store::find_open_register(
                tx,
                self.account_id,
                &position.symbol,
                position.opened_at,
            )? {
                Some(register) => {
                    store::patch_register_exit(
                        tx,
                        register.id,
                        &RegisterExit {
                            paper_trade_id: trade.id,
                            exit_timestamp: now,
                            exit_price: effective_exit,
                            exit_reason: exit_reason.as_str().to_string(),
                            fee_exit: exit_fee,
                            pnl_gross,
                            pnl_net: net_pnl,
                            pnl_percent,
                            duration_seconds: (now - position.opened_at).num_seconds(),
                            expected_exit_price: Some(mark_price),
                            actual_exit_price: effective_exit,
                            exit_slippage_percent: self.slippage_percent,
                            notes: notes.clone(),
                        },
                        now,
                    )?;
                }
                None => {
                    // The open row should exist 1:1 with the position; its
                    // absence is a data-integrity event, not a reason to lose
                    // the close.
                    warn!(
                        symbol = %position.symbol,
                        position_id = position.id,
                        "no open trade-register row found for closing position"
                    );
                }
            }

            Ok(trade)
        })?;

        info!(
            symbol = %trade.symbol,
            side = %trade.side,
            exit_reason = %trade.exit_reason,
            exit_price = format!("{:.2}", trade.exit_price),
            net_pnl = format!("{:+.2}", trade.net_pnl),
            pnl_percent = format!("{:+.2}", trade.pnl_percent),
            "position closed"
        );
        if trade.net_pnl > 0.0 {
            self.notifier
                .position_closed_profit(&trade.symbol, trade.net_pnl);
        } else {
            self.notifier
                .position_closed_loss(&trade.symbol, trade.net_pnl);
        }

        Ok(trade)
    }

    // -------------------------------------------------------------------------
    // Exit sweep
    // -------------------------------------------------------------------------

    /// One pass over all open positions with fresh tickers:
    /// liquidation, then stop-loss, then take-profit, else mark-to-market.
    ///
    /// A symbol whose ticker fails is skipped for this sweep; other symbols
    /// are unaffected. Returned trades preserve position insertion order.
    pub async fn check_exits(&self) -> EngineResult<Vec<Trade>> {
        let positions = self.open_positions(None)?;
        if positions.is_empty() {
            return Ok(Vec::new());
        }

        // One concurrent ticker fetch per distinct symbol.
        let mut symbols: Vec<String> = positions.iter().map(|p| p.symbol.clone()).collect();
        symbols.sort();
        symbols.dedup();

        let fetches = symbols.iter().map(|s| self.get_current_price(s));
        let results = futures_util::future::join_all(fetches).await;

        let mut prices: HashMap<String, f64> = HashMap::new();
        for (symbol, result) in symbols.iter().zip(results) {
            match result {
                Ok(price) => {
                    prices.insert(symbol.clone(), price);
                }
                Err(e) => warn!(symbol = %symbol, error = %e, "ticker unavailable, skipping symbol this sweep"),
            }
        }

        let mut closed = Vec::new();
        for position in &positions {
            let Some(&price) = prices.get(&position.symbol) else {
                continue;
            };

            if position.is_liquidated_at(price) {
                let trade = self.close_position_at(
                    position,
                    price,
                    ExitReason::Liquidation,
                    Some(format!("liquidated at {price:.2}")),
                )?;
                closed.push(trade);
                continue;
            }

            if position.stop_loss_hit(price) {
                let trade = self.close_position_at(
                    position,
                    price,
                    ExitReason::StopLoss,
                    Some(format!("stop-loss touched at {price:.2}")),
                )?;
                closed.push(trade);
                continue;
            }

            if position.take_profit_hit(price) {
                let trade = self.close_position_at(
                    position,
                    price,
                    ExitReason::TakeProfit,
                    Some(format!("take-profit touched at {price:.2}")),
                )?;
                closed.push(trade);
                continue;
            }

            let (pnl, pnl_percent) = position.pnl_at(price);
            self.store
                .update_position_mark(position.id, price, pnl, pnl_percent)?;
        }

        if !closed.is_empty() {
            debug!(count = closed.len(), "exit sweep closed positions");
        }
        Ok(closed)
    }

    // -------------------------------------------------------------------------
    // Reads
    // -------------------------------------------------------------------------

    /// Account rollup with live unrealized PnL. Falls back to the last stored
    /// mark when a ticker is unavailable (read paths degrade, never fail the
    /// tick).
    pub async fn account_summary(&self) -> EngineResult<AccountSummary> {
        let account = self.account()?;
        let positions = self.open_positions(None)?;

        let mut unrealized = 0.0;
        for position in &positions {
            let price = match self.get_current_price(&position.symbol).await {
                Ok(p) => p,
                Err(e) => {
                    warn!(symbol = %position.symbol, error = %e, "summary using stored mark");
                    position.current_price
                }
            };
            unrealized += position.pnl_at(price).0;
        }

        Ok(AccountSummary {
            account_name: account.name.clone(),
            initial_balance: account.initial_balance,
            current_balance: account.current_balance,
            unrealized_pnl: unrealized,
            equity: account.current_balance + unrealized,
            total_pnl: account.total_pnl,
            roi: account.roi(),
            total_trades: account.total_trades,
            win_rate: account.win_rate(),
            max_drawdown: account.max_drawdown,
            peak_balance: account.peak_balance,
            open_positions: positions.len(),
        })
    }

    pub fn trade_history(&self, limit: usize, symbol: Option<&str>) -> EngineResult<Vec<Trade>> {
        self.store.trades(self.account_id, limit, symbol)
    }

    pub fn performance_stats(&self) -> EngineResult<PerformanceStats> {
        let trades = self.trade_history(1_000, None)?;
        if trades.is_empty() {
            return Ok(PerformanceStats {
                total_trades: 0,
                winning_trades: 0,
                losing_trades: 0,
                win_rate: 0.0,
                avg_win: 0.0,
                avg_loss: 0.0,
                profit_factor: 0.0,
                avg_duration_minutes: 0.0,
                best_trade: 0.0,
                worst_trade: 0.0,
                total_pnl: 0.0,
                total_fees: 0.0,
            });
        }

        let wins: Vec<&Trade> = trades.iter().filter(|t| t.net_pnl > 0.0).collect();
        let losses: Vec<&Trade> = trades.iter().filter(|t| t.net_pnl <= 0.0).collect();

        let total_wins: f64 = wins.iter().map(|t| t.net_pnl).sum();
        let total_losses: f64 = losses.iter().map(|t| t.net_pnl).sum::<f64>().abs();

        Ok(PerformanceStats {
            total_trades: trades.len(),
            winning_trades: wins.len(),
            losing_trades: losses.len(),
            win_rate: wins.len() as f64 / trades.len() as f64 * 100.0,
            avg_win: if wins.is_empty() {
                0.0
            } else {
                total_wins / wins.len() as f64
            },
            avg_loss: if losses.is_empty() {
                0.0
            } else {
                -total_losses / losses.len() as f64
            },
            profit_factor: if total_losses > 0.0 {
                total_wins / total_losses
            } else {
                f64::INFINITY
            },
            avg_duration_minutes: trades.iter().map(Trade::duration_minutes).sum::<f64>()
                / trades.len() as f64,
            best_trade: trades.iter().map(|t| t.net_pnl).fold(f64::MIN, f64::max),
            worst_trade: trades.iter().map(|t| t.net_pnl).fold(f64::MAX, f64::min),
            total_pnl: trades.iter().map(|t| t.net_pnl).sum(),
            total_fees: trades.iter().map(|t| t.total_fees).sum(),
        })
    }

    // -------------------------------------------------------------------------
    // Maintenance
    // -------------------------------------------------------------------------

    /// Force-close all open positions without generating trades and restore
    /// the account to a pristine balance. Dev/test only.
    pub fn reset(&self, initial_balance: f64) -> EngineResult<()> {
        let now = self.clock.now_utc();
        self.store.with_tx(|tx| {
            let positions = store::query_open_positions(tx, self.account_id, None)?;
            for position in &positions {
                store::finalize_position(
                    tx,
                    position.id,
                    PositionStatus::Closed,
                    now,
                    position.current_price,
                    0.0,
                    0.0,
                )?;
            }

            let mut account = store::load_account(tx, self.account_id)?;
            account.initial_balance = initial_balance;
            account.current_balance = initial_balance;
            account.peak_balance = initial_balance;
            account.total_trades = 0;
            account.winning_trades = 0;
            account.losing_trades = 0;
            account.total_pnl = 0.0;
            account.max_drawdown = 0.0;
            store::update_account(tx, &account, now)?;
            Ok(())
        })?;

        info!(account = %self.account_name, initial_balance, "account reset");
        Ok(())
    }

    /// Startup pairing check: every open position must have exactly one open
    /// register row; an open register row with no position is an orphan.
    fn verify_register_pairing(&self) -> EngineResult<()> {
        let positions = self.open_positions(None)?;
        let registers = self.store.open_registers(self.account_id)?;

        for position in &positions {
            let matching = registers
                .iter()
                .filter(|r| r.symbol == position.symbol && r.entry_timestamp == position.opened_at)
                .count();
            match matching {
                1 => {}
                0 => warn!(
                    symbol = %position.symbol,
                    position_id = position.id,
                    "data-integrity alert: open position without register row"
                ),
                n => warn!(
                    symbol = %position.symbol,
                    position_id = position.id,
                    rows = n,
                    "data-integrity alert: duplicate open register rows"
                ),
            }
        }

        for register in &registers {
            let has_position = positions
                .iter()
                .any(|p| p.symbol == register.symbol && p.opened_at == register.entry_timestamp);
            if !has_position {
                warn!(
                    symbol = %register.symbol,
                    register_id = register.id,
                    "data-integrity alert: orphan open register row without position"
                );
            }
        }

        if !positions.is_empty() {
            info!(
                count = positions.len(),
                "resumed open positions from previous run"
            );
        }
        Ok(())
    }
}

impl std::fmt::Debug for PaperEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PaperEngine")
            .field("account", &self.account_name)
            .field("slippage_percent", &self.slippage_percent)
            .finish_non_exhaustive()
    }
}
