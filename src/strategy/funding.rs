// =============================================================================
// Funding-rate strategy — collect rich funding, step aside when it normalizes
// =============================================================================
//
// Perpetual funding flows from the crowded side to the other. When the
// recent average rate is rich, the strategy takes the collecting side: short
// when longs pay (positive rate), long when shorts pay (negative rate).
//
// The exit is structural, not price-driven: once the average rate falls back
// under half the entry threshold the edge is gone and the position closes
// with `structure_normalized`.
// =============================================================================

use serde_json::Value;

use crate::types::{ExitReason, Side};

use super::{
    param_f64, param_timeframe, param_usize, MarketSnapshot, ParamSpec, Signal, SignalKind,
    Strategy, StrategyInfo,
};

pub fn param_specs() -> Vec<ParamSpec> {
    vec![
        ParamSpec::text("timeframe", "1h"),
        // Rates are per funding interval, in percent (0.01 = 1 bp).
        ParamSpec::float("min_funding_rate", 0.005, 0.0001, 1.0),
        ParamSpec::float("target_funding_rate", 0.06, 0.001, 5.0),
        ParamSpec::int("funding_samples", 3, 1, 24),
        ParamSpec::float("min_confidence", 5.0, 0.0, 10.0),
        ParamSpec::float("stop_loss_percent", 3.0, 0.1, 20.0),
        ParamSpec::float("size_percent", 30.0, 0.1, 100.0),
    ]
}

pub struct FundingRateStrategy {
    params: serde_json::Map<String, Value>,
}

impl FundingRateStrategy {
    pub fn from_params(params: serde_json::Map<String, Value>) -> Self {
        Self { params }
    }

    /// Average of the most recent funding samples, in percent.
    fn average_rate(&self, snapshot: &MarketSnapshot) -> Option<f64> {
        let samples = param_usize(&self.params, "funding_samples");
        if snapshot.funding_rates.is_empty() {
            return None;
        }
        let taken: Vec<f64> = snapshot
            .funding_rates
            .iter()
            .take(samples)
            .map(|r| r.rate * 100.0)
            .collect();
        Some(taken.iter().sum::<f64>() / taken.len() as f64)
    }
}

impl Strategy for FundingRateStrategy {
    fn info(&self) -> StrategyInfo {
        StrategyInfo {
            name: "funding_rate".into(),
            display_name: "Funding Collector".into(),
            timeframe: param_timeframe(&self.params, "timeframe"),
            // Price history is context only; funding drives the decision.
            min_bars: 2,
            min_confidence: param_f64(&self.params, "min_confidence"),
            wants_funding: true,
            allow_hedging: false,
        }
    }

    fn parameters(&self) -> Value {
        Value::Object(self.params.clone())
    }

    fn analyze(&mut self, snapshot: &MarketSnapshot, symbol: &str) -> Option<Signal> {
        let price = snapshot.last_price;
        if price <= 0.0 {
            return None;
        }
        let avg_rate = self.average_rate(snapshot)?;

        let min_rate = param_f64(&self.params, "min_funding_rate");
        if avg_rate.abs() < min_rate {
            return None;
        }

        // Positive funding: longs pay shorts, so collect on the short side.
        let side = if avg_rate > 0.0 { Side::Short } else { Side::Long };

        let target = param_f64(&self.params, "target_funding_rate");
        let confidence = (5.0 + (avg_rate.abs() / target) * 5.0).min(10.0);

        let sl_percent = param_f64(&self.params, "stop_loss_percent") / 100.0;
        let stop_loss = match side {
            Side::Long => price * (1.0 - sl_percent),
            Side::Short => price * (1.0 + sl_percent),
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
            // No price target: the exit is the funding structure going away.
            take_profit: None,
            size_percent: param_f64(&self.params, "size_percent"),
            reason: format!(
                "avg funding {avg_rate:+.4}%/interval over recent samples, collecting {side}"
            ),
            strategy: "funding_rate".into(),
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
        let avg_rate = self.average_rate(snapshot)?;
        let min_rate = param_f64(&self.params, "min_funding_rate");

        // Either the rate collapsed, or it crossed to the other sign and the
        // position now pays instead of collects.
        let normalized = avg_rate.abs() < min_rate / 2.0;
        let flipped = match side {
            Side::Short => avg_rate < 0.0,
            Side::Long => avg_rate > 0.0,
        };
        if !normalized && !flipped {
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
                "funding normalized to {avg_rate:+.4}%/interval at {current_pnl_percent:+.2}% PnL"
            ),
            strategy: "funding_rate".into(),
            exit_reason: Some(ExitReason::StructureNormalized),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::market_data::{Candle, FundingRate};
    use crate::strategy::validate_params;
    use chrono::{DateTime, Utc};

    fn build() -> FundingRateStrategy {
        let params = validate_params(&param_specs(), &serde_json::Map::new()).unwrap();
        FundingRateStrategy::from_params(params)
    }

    fn snapshot(rates_percent: &[f64]) -> MarketSnapshot {
        let t0 = "2025-01-01T00:00:00Z".parse::<DateTime<Utc>>().unwrap();
        let candles = vec![
            Candle {
                timestamp: t0,
                open: 50_000.0,
                high: 50_100.0,
                low: 49_900.0,
                close: 50_000.0,
                volume: 10.0,
            },
            Candle {
                timestamp: t0 + chrono::Duration::hours(1),
                open: 50_000.0,
                high: 50_100.0,
                low: 49_900.0,
                close: 50_000.0,
                volume: 10.0,
            },
        ];
        MarketSnapshot {
            candles,
            last_price: 50_000.0,
            funding_rates: rates_percent
                .iter()
                .enumerate()
                .map(|(i, r)| FundingRate {
                    timestamp: t0 - chrono::Duration::hours(i as i64),
                    rate: r / 100.0,
                })
                .collect(),
        }
    }

    #[test]
    fn rich_positive_funding_shorts() {
        let mut strategy = build();
        let signal = strategy
            .analyze(&snapshot(&[0.02, 0.018, 0.022]), "BTC-USD")
            .expect("signal");
        assert_eq!(signal.kind, SignalKind::Sell);
        assert!(signal.stop_loss.unwrap() > signal.price);
        assert!(signal.take_profit.is_none());
        assert!(signal.confidence >= 5.0);
    }

    #[test]
    fn rich_negative_funding_longs() {
        let mut strategy = build();
        let signal = strategy
            .analyze(&snapshot(&[-0.03, -0.025, -0.028]), "BTC-USD")
            .expect("signal");
        assert_eq!(signal.kind, SignalKind::Buy);
        assert!(signal.stop_loss.unwrap() < signal.price);
    }

    #[test]
    fn thin_funding_is_ignored() {
        let mut strategy = build();
        assert!(strategy
            .analyze(&snapshot(&[0.001, -0.002, 0.0015]), "BTC-USD")
            .is_none());
        // No funding data at all: nothing to act on.
        assert!(strategy.analyze(&snapshot(&[]), "BTC-USD").is_none());
    }

    #[test]
    fn closes_with_structure_normalized_when_rate_collapses() {
        let mut strategy = build();
        let signal = strategy
            .should_close_position(&snapshot(&[0.001, 0.0005, 0.0008]), 50_000.0, Side::Short, 0.4)
            .expect("close");
        assert_eq!(signal.kind, SignalKind::Close);
        assert_eq!(signal.exit_reason, Some(ExitReason::StructureNormalized));
    }

    #[test]
    fn closes_when_funding_flips_sign() {
        let mut strategy = build();
        // Short collecting positive funding; the rate flips negative and the
        // position would start paying.
        let signal = strategy
            .should_close_position(&snapshot(&[-0.02, -0.018, -0.022]), 50_000.0, Side::Short, 1.0)
            .expect("close");
        assert_eq!(signal.exit_reason, Some(ExitReason::StructureNormalized));
    }

    #[test]
    fn holds_while_funding_stays_rich() {
        let mut strategy = build();
        assert!(strategy
            .should_close_position(&snapshot(&[0.02, 0.019, 0.021]), 50_000.0, Side::Short, 0.8)
            .is_none());
    }
}
