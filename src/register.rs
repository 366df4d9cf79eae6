// =============================================================================
// Trade register — full audit record of every entry and exit
// =============================================================================
//
// Two-phase journal, distinct from the compact trade row:
//   * the entry row is written in the same transaction that inserts the
//     position, with the full market / indicator / strategy context;
//   * the exit patch updates that row in place, in the same transaction that
//     inserts the trade, and links it via `paper_trade_id`.
//
// Pairing key: (account_id, symbol, entry_timestamp) with NULL exit. At most
// one such row may exist per (account, symbol) at any time.
// =============================================================================

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::time_parser::format_trade_duration;
use crate::types::{Side, TradeMode};

/// One register row as persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterRow {
    pub id: i64,
    pub account_id: i64,
    pub strategy_id: Option<i64>,
    pub paper_trade_id: Option<i64>,

    pub symbol: String,
    pub side: Side,
    pub mode: TradeMode,

    // Entry block.
    pub entry_timestamp: DateTime<Utc>,
    pub entry_price: f64,
    pub entry_size: f64,
    pub entry_value_usd: f64,
    pub leverage: f64,
    pub margin_required: f64,
    pub margin_available_before: f64,
    pub fee_entry: f64,
    pub expected_entry_price: Option<f64>,
    pub actual_entry_price: Option<f64>,
    pub entry_slippage_percent: Option<f64>,

    // Exit block (NULL until the position closes).
    pub exit_timestamp: Option<DateTime<Utc>>,
    pub exit_price: Option<f64>,
    pub exit_reason: Option<String>,
    pub fee_exit: f64,
    pub fee_total: f64,
    pub pnl_gross: Option<f64>,
    pub pnl_net: Option<f64>,
    pub pnl_percent: Option<f64>,
    pub duration_seconds: Option<i64>,
    pub duration_human: Option<String>,
    pub expected_exit_price: Option<f64>,
    pub actual_exit_price: Option<f64>,
    pub exit_slippage_percent: Option<f64>,

    // Protective levels and trigger flags.
    pub stop_loss_price: Option<f64>,
    pub take_profit_price: Option<f64>,
    pub stop_loss_triggered: bool,
    pub take_profit_triggered: bool,

    // Market context at entry.
    pub market_price_at_entry: Option<f64>,
    pub market_volume_24h: Option<f64>,
    pub market_volatility: Option<f64>,

    // Indicator snapshot at entry (last fully-closed candle only).
    pub rsi_at_entry: Option<f64>,
    pub macd_at_entry: Option<f64>,
    pub bb_position_at_entry: Option<f64>,

    // Strategy context.
    pub signal_confidence: Option<f64>,
    pub signal_reason: Option<String>,
    pub strategy_parameters: Option<serde_json::Value>,

    // Session context.
    pub session_id: Option<String>,
    pub bot_version: Option<String>,
    pub max_loss_limit: Option<f64>,
    pub time_limit_seconds: Option<i64>,

    // Freeform.
    pub notes: Option<String>,
    pub tags: Vec<String>,
}

impl RegisterRow {
    pub fn is_open(&self) -> bool {
        self.exit_timestamp.is_none()
    }

    /// Flat JSON export with the human-formatted duration.
    pub fn to_export(&self) -> serde_json::Value {
        serde_json::json!({
            "id": self.id,
            "symbol": self.symbol,
            "side": self.side.as_str(),
            "mode": self.mode.as_str(),
            "entry_timestamp": self.entry_timestamp.to_rfc3339(),
            "exit_timestamp": self.exit_timestamp.map(|t| t.to_rfc3339()),
            "entry_price": self.entry_price,
            "exit_price": self.exit_price,
            "size": self.entry_size,
            "value_usd": self.entry_value_usd,
            "leverage": self.leverage,
            "margin_required": self.margin_required,
            "fee_entry": self.fee_entry,
            "fee_exit": self.fee_exit,
            "fee_total": self.fee_total,
            "pnl_gross": self.pnl_gross,
            "pnl_net": self.pnl_net,
            "pnl_percent": self.pnl_percent,
            "exit_reason": self.exit_reason,
            "duration": self.duration_seconds.map(format_trade_duration),
            "signal_confidence": self.signal_confidence,
            "signal_reason": self.signal_reason,
            "stop_loss_price": self.stop_loss_price,
            "take_profit_price": self.take_profit_price,
            "stop_loss_triggered": self.stop_loss_triggered,
            "take_profit_triggered": self.take_profit_triggered,
            "rsi_at_entry": self.rsi_at_entry,
            "macd_at_entry": self.macd_at_entry,
            "bb_position_at_entry": self.bb_position_at_entry,
            "session_id": self.session_id,
            "bot_version": self.bot_version,
            "notes": self.notes,
            "tags": self.tags,
        })
    }
}

/// Context captured by the harness at signal time and carried into the entry
/// row. Everything is optional: a manual open produces a sparse row.
#[derive(Debug, Clone, Default)]
pub struct EntryContext {
    pub confidence: Option<f64>,
    pub reason: Option<String>,
    pub strategy_parameters: Option<serde_json::Value>,
    pub market_volume_24h: Option<f64>,
    pub market_volatility: Option<f64>,
    pub rsi: Option<f64>,
    pub macd: Option<f64>,
    pub bb_position: Option<f64>,
    pub expected_entry_price: Option<f64>,
    pub tags: Vec<String>,
}

/// Exit patch applied to the open row when the matching trade is created.
#[derive(Debug, Clone)]
pub struct RegisterExit {
    pub paper_trade_id: i64,
    pub exit_timestamp: DateTime<Utc>,
    pub exit_price: f64,
    pub exit_reason: String,
    pub fee_exit: f64,
    pub pnl_gross: f64,
    pub pnl_net: f64,
    pub pnl_percent: f64,
    pub duration_seconds: i64,
    pub expected_exit_price: Option<f64>,
    pub actual_exit_price: f64,
    pub exit_slippage_percent: f64,
    pub notes: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_row() -> RegisterRow {
        RegisterRow {
            id: 1,
            account_id: 1,
            strategy_id: None,
            paper_trade_id: None,
            symbol: "BTC-USD".into(),
            side: Side::Long,
            mode: TradeMode::Paper,
            entry_timestamp: "2025-01-01T00:00:00Z".parse().unwrap(),
            entry_price: 50_000.0,
            entry_size: 0.1,
            entry_value_usd: 5_000.0,
            leverage: 2.0,
            margin_required: 2_500.0,
            margin_available_before: 10_000.0,
            fee_entry: 2.5,
            expected_entry_price: Some(50_000.0),
            actual_entry_price: Some(50_000.0),
            entry_slippage_percent: Some(0.0),
            exit_timestamp: None,
            exit_price: None,
            exit_reason: None,
            fee_exit: 0.0,
            fee_total: 2.5,
            pnl_gross: None,
            pnl_net: None,
            pnl_percent: None,
            duration_seconds: None,
            duration_human: None,
            expected_exit_price: None,
            actual_exit_price: None,
            exit_slippage_percent: None,
            stop_loss_price: Some(49_000.0),
            take_profit_price: Some(52_000.0),
            stop_loss_triggered: false,
            take_profit_triggered: false,
            market_price_at_entry: Some(50_000.0),
            market_volume_24h: Some(1.0e9),
            market_volatility: Some(0.4),
            rsi_at_entry: Some(55.0),
            macd_at_entry: Some(12.0),
            bb_position_at_entry: Some(0.7),
            signal_confidence: Some(7.5),
            signal_reason: Some("breakout above resistance".into()),
            strategy_parameters: None,
            session_id: Some("default_20250101_000000".into()),
            bot_version: Some("1.0.0".into()),
            max_loss_limit: Some(500.0),
            time_limit_seconds: Some(3_600),
            notes: None,
            tags: vec!["breakout".into()],
        }
    }

    #[test]
    fn open_row_has_null_exit() {
        let row = sample_row();
        assert!(row.is_open());
    }

    #[test]
    fn export_is_flat_and_formats_duration() {
        let mut row = sample_row();
        row.exit_timestamp = Some("2025-01-01T02:15:30Z".parse().unwrap());
        row.duration_seconds = Some(8_130);

        let export = row.to_export();
        assert_eq!(export["symbol"], "BTC-USD");
        assert_eq!(export["side"], "long");
        assert_eq!(export["duration"], "2h 15m 30s");
        assert_eq!(export["tags"][0], "breakout");
    }
}
