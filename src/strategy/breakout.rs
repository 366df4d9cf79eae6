// =============================================================================
// Breakout strategy — enter on a level break, exit when the move flattens
// =============================================================================
//
// Entry: the last close clears a clustered resistance (long) or support
// (short) level by `breakout_threshold` percent, with an RSI sanity filter
// so exhausted moves are not chased.
//
// Exit: once in a position, a tight consolidation (recent range below
// `consolidation_threshold` percent) says the impulse is spent — take what
// the move gave rather than waiting for a perfect top.
// =============================================================================

use serde_json::Value;

use crate::indicators::{relative_strength_index, simple_moving_average};
use crate::market_data::Candle;
use crate::types::Side;

use super::{
    param_bool, param_f64, param_timeframe, param_usize, MarketSnapshot, ParamSpec, Signal,
    SignalKind, Strategy, StrategyInfo,
};

pub fn param_specs() -> Vec<ParamSpec> {
    vec![
        ParamSpec::text("timeframe", "1h"),
        ParamSpec::float("breakout_threshold", 0.8, 0.05, 10.0),
        ParamSpec::float("consolidation_threshold", 0.4, 0.05, 5.0),
        ParamSpec::int("consolidation_candles", 3, 2, 20),
        ParamSpec::int("lookback_period", 20, 5, 200),
        ParamSpec::float("min_confidence", 5.0, 0.0, 10.0),
        ParamSpec::float("risk_reward_ratio", 2.0, 0.5, 10.0),
        ParamSpec::boolean("use_rsi", true),
        ParamSpec::int("rsi_period", 14, 2, 50),
        ParamSpec::float("rsi_oversold", 30.0, 0.0, 50.0),
        ParamSpec::float("rsi_overbought", 70.0, 50.0, 100.0),
        ParamSpec::float("size_percent", 10.0, 0.1, 100.0),
        ParamSpec::float("min_volume_ratio", 1.2, 0.0, 10.0),
    ]
}

pub struct BreakoutStrategy {
    params: serde_json::Map<String, Value>,
}

impl BreakoutStrategy {
    pub fn from_params(params: serde_json::Map<String, Value>) -> Self {
        Self { params }
    }

    /// Local extrema over the lookback window, clustered so near-equal
    /// levels collapse into one.
    fn levels(&self, candles: &[Candle]) -> (Vec<f64>, Vec<f64>) {
        let lookback = param_usize(&self.params, "lookback_period");
        let window = &candles[candles.len().saturating_sub(lookback)..];
        if window.len() < 5 {
            return (Vec::new(), Vec::new());
        }

        let mut resistance = Vec::new();
        let mut support = Vec::new();
        for i in 2..window.len() - 2 {
            let h = window[i].high;
            if h > window[i - 1].high
                && h > window[i - 2].high
                && h > window[i + 1].high
                && h > window[i + 2].high
            {
                resistance.push(h);
            }
            let l = window[i].low;
            if l < window[i - 1].low
                && l < window[i - 2].low
                && l < window[i + 1].low
                && l < window[i + 2].low
            {
                support.push(l);
            }
        }

        (cluster(support), cluster(resistance))
    }

    /// Volume of the breakout bar relative to the recent average.
    fn volume_ratio(candles: &[Candle]) -> f64 {
        let Some(last) = candles.last() else {
            return 0.0;
        };
        let volumes: Vec<f64> = candles.iter().map(|c| c.volume).collect();
        match simple_moving_average(&volumes[..volumes.len() - 1], 20.min(volumes.len() - 1)) {
            Some(avg) if avg > 0.0 => last.volume / avg,
            _ => 1.0,
        }
    }

    fn is_consolidating(&self, candles: &[Candle]) -> Option<f64> {
        let n = param_usize(&self.params, "consolidation_candles");
        if candles.len() < n {
            return None;
        }
        let window = &candles[candles.len() - n..];
        let high = window.iter().map(|c| c.high).fold(f64::MIN, f64::max);
        let low = window.iter().map(|c| c.low).fold(f64::MAX, f64::min);
        if low <= 0.0 {
            return None;
        }
        let range_percent = (high - low) / low * 100.0;
        (range_percent <= param_f64(&self.params, "consolidation_threshold")).then_some(range_percent)
    }
}

impl Strategy for BreakoutStrategy {
    fn info(&self) -> StrategyInfo {
        StrategyInfo {
            name: "breakout".into(),
            display_name: "Level Breakout".into(),
            timeframe: param_timeframe(&self.params, "timeframe"),
            min_bars: param_usize(&self.params, "lookback_period").max(
                param_usize(&self.params, "rsi_period") + 1,
            ),
            min_confidence: param_f64(&self.params, "min_confidence"),
            wants_funding: false,
            allow_hedging: false,
        }
    }

    fn parameters(&self) -> Value {
        Value::Object(self.params.clone())
    }

    fn analyze(&mut self, snapshot: &MarketSnapshot, symbol: &str) -> Option<Signal> {
        let candles = &snapshot.candles;
        let price = snapshot.last_price;
        if price <= 0.0 {
            return None;
        }

        let (support, resistance) = self.levels(candles);
        let threshold = param_f64(&self.params, "breakout_threshold");
        let closes = snapshot.closes();

        let rsi = if param_bool(&self.params, "use_rsi") {
            relative_strength_index(&closes, param_usize(&self.params, "rsi_period"))
        } else {
            None
        };

        // Long: close above the highest resistance below the price by the
        // threshold. Short is the mirror through support.
        let broken_resistance = resistance
            .iter()
            .copied()
            .filter(|level| price > *level)
            .max_by(|a, b| a.total_cmp(b))
            .filter(|level| (price - level) / level * 100.0 >= threshold);

        let broken_support = support
            .iter()
            .copied()
            .filter(|level| price < *level)
            .min_by(|a, b| a.total_cmp(b))
            .filter(|level| (level - price) / level * 100.0 >= threshold);

        let (side, level) = match (broken_resistance, broken_support) {
            (Some(level), _) => (Side::Long, level),
            (None, Some(level)) => (Side::Short, level),
            (None, None) => return None,
        };

        // RSI filter: do not buy an overbought break or sell an oversold one.
        if let Some(rsi) = rsi {
            match side {
                Side::Long if rsi >= param_f64(&self.params, "rsi_overbought") => return None,
                Side::Short if rsi <= param_f64(&self.params, "rsi_oversold") => return None,
                _ => {}
            }
        }

        let magnitude = (price - level).abs() / level * 100.0;
        let volume_ratio = Self::volume_ratio(candles);
        let volume_ok = volume_ratio >= param_f64(&self.params, "min_volume_ratio");

        // Confidence: breakout size past the threshold, nudged by volume.
        let mut confidence = 4.0 + (magnitude / threshold).min(2.0) * 2.0;
        if volume_ok {
            confidence += 1.0;
        }
        let confidence = confidence.min(10.0);

        let rr = param_f64(&self.params, "risk_reward_ratio");
        let (stop_loss, take_profit) = match side {
            Side::Long => {
                let sl = level.min(price * 0.995);
                (sl, price + (price - sl) * rr)
            }
            Side::Short => {
                let sl = level.max(price * 1.005);
                (sl, price - (sl - price) * rr)
            }
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
                "{} break of {:.2} by {:.2}% (volume x{:.2}, rsi {})",
                side,
                level,
                magnitude,
                volume_ratio,
                rsi.map(|r| format!("{r:.0}")).unwrap_or_else(|| "-".into()),
            ),
            strategy: "breakout".into(),
            exit_reason: None,
        })
    }

    fn should_close_position(
        &mut self,
        snapshot: &MarketSnapshot,
        _entry_price: f64,
        _side: Side,
        current_pnl_percent: f64,
    ) -> Option<Signal> {
        // Only give back a winner: flat chop around entry is not the same as
        // a spent impulse.
        if current_pnl_percent <= 0.0 {
            return None;
        }

        let range = self.is_consolidating(&snapshot.candles)?;
        Some(Signal {
            kind: SignalKind::Close,
            symbol: String::new(),
            confidence: 10.0,
            price: snapshot.last_price,
            stop_loss: None,
            take_profit: None,
            size_percent: 0.0,
            reason: format!(
                "consolidation: {:.2}% range over recent bars with {:+.2}% open PnL",
                range, current_pnl_percent
            ),
            strategy: "breakout".into(),
            exit_reason: None,
        })
    }
}

fn cluster(mut levels: Vec<f64>) -> Vec<f64> {
    const TOLERANCE: f64 = 0.005;
    if levels.is_empty() {
        return levels;
    }
    levels.sort_by(|a, b| a.total_cmp(b));

    let mut clustered: Vec<f64> = vec![levels[0]];
    for level in levels.into_iter().skip(1) {
        let last = clustered.last_mut().unwrap();
        if (level - *last) / *last <= TOLERANCE {
            *last = (*last + level) / 2.0;
        } else {
            clustered.push(level);
        }
    }
    clustered
}
