// =============================================================================
// Scalping strategy — short-timeframe impulse entries with ATR stops
// =============================================================================
//
// Entry: the last bar moves between `min_price_change` and `max_price_change`
// percent (enough impulse to matter, not a blow-off), RSI sits at an extreme,
// and MACD momentum agrees. Mean-reversion flavour: oversold impulse down is
// bought, overbought impulse up is sold.
//
// Exit: protective levels are ATR multiples; `should_close_position` bails
// out early when MACD momentum flips against the position.
// =============================================================================

use serde_json::Value;

use crate::indicators::{average_true_range, macd, relative_strength_index};
use crate::types::Side;

use super::{
    param_f64, param_timeframe, param_usize, MarketSnapshot, ParamSpec, Signal, SignalKind,
    Strategy, StrategyInfo,
};

pub fn param_specs() -> Vec<ParamSpec> {
    vec![
        ParamSpec::text("timeframe", "1min"),
        ParamSpec::float("min_price_change", 0.1, 0.01, 5.0),
        ParamSpec::float("max_price_change", 0.5, 0.05, 10.0),
        ParamSpec::float("min_confidence", 4.0, 0.0, 10.0),
        ParamSpec::int("rsi_period", 7, 2, 50),
        ParamSpec::float("rsi_oversold", 25.0, 0.0, 50.0),
        ParamSpec::float("rsi_overbought", 75.0, 50.0, 100.0),
        ParamSpec::int("macd_fast", 8, 2, 50),
        ParamSpec::int("macd_slow", 21, 3, 100),
        ParamSpec::int("macd_signal", 5, 2, 50),
        ParamSpec::int("atr_period", 7, 2, 50),
        ParamSpec::float("atr_multiplier", 1.5, 0.1, 10.0),
        ParamSpec::float("atr_take_profit", 2.0, 0.1, 10.0),
        ParamSpec::float("size_percent", 10.0, 0.1, 100.0),
    ]
}

pub struct ScalpingStrategy {
    params: serde_json::Map<String, Value>,
}

impl ScalpingStrategy {
    pub fn from_params(params: serde_json::Map<String, Value>) -> Self {
        Self { params }
    }

    fn macd_histogram(&self, closes: &[f64]) -> Option<f64> {
        macd(
            closes,
            param_usize(&self.params, "macd_fast"),
            param_usize(&self.params, "macd_slow"),
            param_usize(&self.params, "macd_signal"),
        )
        .map(|m| m.histogram)
    }
}

impl Strategy for ScalpingStrategy {
    fn info(&self) -> StrategyInfo {
        let slow = param_usize(&self.params, "macd_slow");
        let signal = param_usize(&self.params, "macd_signal");
        StrategyInfo {
            name: "scalping".into(),
            display_name: "Impulse Scalper".into(),
            timeframe: param_timeframe(&self.params, "timeframe"),
            min_bars: (slow + signal).max(param_usize(&self.params, "atr_period") + 1) + 2,
            min_confidence: param_f64(&self.params, "min_confidence"),
            wants_funding: false,
            allow_hedging: false,
        }
    }

    fn parameters(&self) -> Value {
        Value::Object(self.params.clone())
    }

    fn analyze(&mut self, snapshot: &MarketSnapshot, symbol: &str) -> Option<Signal> {
        let closes = snapshot.closes();
        if closes.len() < 2 {
            return None;
        }
        let price = snapshot.last_price;
        let prev_close = closes[closes.len() - 2];
        if prev_close <= 0.0 || price <= 0.0 {
            return None;
        }

        let change_percent = (price - prev_close) / prev_close * 100.0;
        let magnitude = change_percent.abs();
        if magnitude < param_f64(&self.params, "min_price_change")
            || magnitude > param_f64(&self.params, "max_price_change")
        {
            return None;
        }

        let rsi = relative_strength_index(&closes, param_usize(&self.params, "rsi_period"))?;
        let histogram = self.macd_histogram(&closes)?;
        let atr = average_true_range(&snapshot.candles, param_usize(&self.params, "atr_period"))?;

        let oversold = param_f64(&self.params, "rsi_oversold");
        let overbought = param_f64(&self.params, "rsi_overbought");

        // Fade the impulse at the extremes: down-impulse into oversold is a
        // long, up-impulse into overbought is a short. Momentum must not be
        // accelerating against the fade.
        let side = if change_percent < 0.0 && rsi <= oversold && histogram >= 0.0 {
            Side::Long
        } else if change_percent > 0.0 && rsi >= overbought && histogram <= 0.0 {
            Side::Short
        } else {
            return None;
        };

        let rsi_distance = match side {
            Side::Long => oversold - rsi,
            Side::Short => rsi - overbought,
        };
        let confidence = (4.0 + rsi_distance / 5.0 + magnitude).min(10.0);

        let sl_distance = atr * param_f64(&self.params, "atr_multiplier");
        let tp_distance = atr * param_f64(&self.params, "atr_take_profit");
        let (stop_loss, take_profit) = match side {
            Side::Long => (price - sl_distance, price + tp_distance),
            Side::Short => (price + sl_distance, price - tp_distance),
        };

        Some(Signal {
            kind: match side {
                Side::Long => SignalKind::Buy,
                Side::Short => SignalKind::Sell,
            },
            symbol: symbol.to_string(),
            confidence,
            price,
            stop_loss: Some(stop_loss),
            take_profit: Some(take_profit),
            size_percent: param_f64(&self.params, "size_percent"),
            reason: format!(
                "impulse {change_percent:+.2}% with rsi {rsi:.0} and macd hist {histogram:+.3}"
            ),
            strategy: "scalping".into(),
            exit_reason: None,
        })
    }

    fn should_close_position(
        &mut self,
        snapshot: &MarketSnapshot,
        _entry_price: f64,
        side: Side,
        current_pnl_percent: f64,
    ) -> Option<Signal> {
        let closes = snapshot.closes();
        let histogram = self.macd_histogram(&closes)?;

        // Momentum flipped against the position: scalps do not sit through
        // reversals.
        let reversed = match side {
            Side::Long => histogram < 0.0,
            Side::Short => histogram > 0.0,
        };
        if !reversed {
            return None;
        }

        Some(Signal {
            kind: SignalKind::Close,
            symbol: String::new(),
            confidence: 10.0,
            price: snapshot.last_price,
            stop_loss: None,
            take_profit: None,
            size_percent: 0.0,
            reason: format!(
                "momentum reversal (macd hist {histogram:+.3}) at {current_pnl_percent:+.2}% PnL"
            ),
            strategy: "scalping".into(),
            exit_reason: None,
        })
    }
}
