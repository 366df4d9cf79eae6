// =============================================================================
// Core persisted models: account, position, order, trade
// =============================================================================

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{ExitReason, OrderStatus, OrderType, PositionStatus, Side};

// ---------------------------------------------------------------------------
// Account
// ---------------------------------------------------------------------------

/// Named virtual balance. `current_balance` is free margin; collateral of
/// open positions is held in their `margin_used`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    pub id: i64,
    pub name: String,
    pub description: Option<String>,

    pub initial_balance: f64,
    pub current_balance: f64,
    pub peak_balance: f64,

    /// Default leverage, also the per-position cap.
    pub leverage: f64,
    pub maker_fee: f64,
    pub taker_fee: f64,

    pub total_trades: i64,
    pub winning_trades: i64,
    pub losing_trades: i64,
    pub total_pnl: f64,
    /// Largest peak-to-balance drop seen, percent. Non-decreasing.
    pub max_drawdown: f64,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Account {
    pub fn win_rate(&self) -> f64 {
        if self.total_trades == 0 {
            0.0
        } else {
            self.winning_trades as f64 / self.total_trades as f64 * 100.0
        }
    }

    pub fn roi(&self) -> f64 {
        if self.initial_balance == 0.0 {
            0.0
        } else {
            (self.current_balance - self.initial_balance) / self.initial_balance * 100.0
        }
    }
}

// ---------------------------------------------------------------------------
// Position
// ---------------------------------------------------------------------------

/// An open exposure. Exists from the open acknowledgment until superseded by
/// the trade row that closes it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub id: i64,
    pub account_id: i64,
    pub symbol: String,
    pub side: Side,

    /// Base units, e.g. 0.1 BTC.
    pub size: f64,
    pub entry_price: f64,
    pub current_price: f64,
    pub leverage: f64,
    /// Collateral reserved while open: size * entry_price / leverage.
    pub margin_used: f64,

    pub stop_loss: Option<f64>,
    pub take_profit: Option<f64>,

    pub unrealized_pnl: f64,
    pub unrealized_pnl_percent: f64,

    pub status: PositionStatus,
    pub opened_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,

    pub strategy: Option<String>,
    pub notes: Option<String>,
}

impl Position {
    /// `(pnl_usd, pnl_percent)` at `price`. Percent is the price ratio times
    /// leverage, so -100 means the loss equals the margin.
    pub fn pnl_at(&self, price: f64) -> (f64, f64) {
        let dir = self.side.direction();
        let pnl = dir * (price - self.entry_price) * self.size * self.leverage;
        let pnl_percent = if self.entry_price > 0.0 {
            dir * (price - self.entry_price) / self.entry_price * 100.0 * self.leverage
        } else {
            0.0
        };
        (pnl, pnl_percent)
    }

    /// Liquidation triggers when the unrealized loss reaches the full margin,
    /// inclusive at the boundary.
    pub fn is_liquidated_at(&self, price: f64) -> bool {
        self.pnl_at(price).1 <= -100.0
    }

    /// Stop-loss touch, inclusive.
    pub fn stop_loss_hit(&self, price: f64) -> bool {
        match (self.stop_loss, self.side) {
            (Some(sl), Side::Long) => price <= sl,
            (Some(sl), Side::Short) => price >= sl,
            (None, _) => false,
        }
    }

    /// Take-profit touch, inclusive.
    pub fn take_profit_hit(&self, price: f64) -> bool {
        match (self.take_profit, self.side) {
            (Some(tp), Side::Long) => price >= tp,
            (Some(tp), Side::Short) => price <= tp,
            (None, _) => false,
        }
    }
}

// ---------------------------------------------------------------------------
// Order
// ---------------------------------------------------------------------------

/// Pending or historical order request. The simulator records a filled
/// market order for each entry and exit it executes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub id: i64,
    pub account_id: i64,
    pub client_order_id: String,
    pub symbol: String,
    pub side: Side,
    pub order_type: OrderType,

    pub size: f64,
    pub price: Option<f64>,
    pub leverage: f64,

    pub status: OrderStatus,
    pub filled_size: f64,
    pub filled_price: Option<f64>,

    pub created_at: DateTime<Utc>,
    pub filled_at: Option<DateTime<Utc>>,
    pub cancelled_at: Option<DateTime<Utc>>,

    pub strategy: Option<String>,
    pub notes: Option<String>,
}

// ---------------------------------------------------------------------------
// Trade
// ---------------------------------------------------------------------------

/// A closed round-trip. Immutable once written.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trade {
    pub id: i64,
    pub account_id: i64,
    pub symbol: String,
    pub side: Side,

    pub entry_price: f64,
    pub entry_time: DateTime<Utc>,
    pub size: f64,
    pub leverage: f64,

    /// Effective exit price: mark adjusted for slippage.
    pub exit_price: f64,
    pub exit_time: DateTime<Utc>,

    pub entry_fee: f64,
    pub exit_fee: f64,
    pub total_fees: f64,

    /// Gross PnL at the effective exit price.
    pub pnl: f64,
    pub pnl_percent: f64,
    /// Gross minus fees minus slippage cost.
    pub net_pnl: f64,

    pub strategy: Option<String>,
    pub exit_reason: ExitReason,
    pub notes: Option<String>,
}

impl Trade {
    pub fn duration_minutes(&self) -> f64 {
        (self.exit_time - self.entry_time).num_seconds() as f64 / 60.0
    }

    pub fn duration_seconds(&self) -> i64 {
        (self.exit_time - self.entry_time).num_seconds()
    }
}
