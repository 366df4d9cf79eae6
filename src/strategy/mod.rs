// =============================================================================
// Strategy contract, signal model, parameter schema, and registry
// =============================================================================
//
// Strategies are pure decision makers: they see a market snapshot and emit
// signals. They never touch the engine or the store — the orchestrator sizes
// and applies what they produce.
//
// Each strategy declares its parameter schema (name, type, default, bounds).
// `build_strategy` validates the operator-supplied map at session start:
// unknown keys and out-of-bounds values refuse startup.
// =============================================================================

pub mod breakout;
pub mod funding;
pub mod scalping;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::market_data::{Candle, FundingRate, Timeframe};
use crate::types::{ExitReason, Side, TradeMode};

// ---------------------------------------------------------------------------
// Signal
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignalKind {
    Buy,
    Sell,
    Hold,
    Close,
}

impl std::fmt::Display for SignalKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Buy => "buy",
            Self::Sell => "sell",
            Self::Hold => "hold",
            Self::Close => "close",
        };
        f.write_str(s)
    }
}

/// A strategy decision. `None` from `analyze`, or a `Hold`, both mean
/// "no action".
#[derive(Debug, Clone)]
pub struct Signal {
    pub kind: SignalKind,
    pub symbol: String,
    /// 0..=10; gated against the strategy's `min_confidence` by the harness.
    pub confidence: f64,
    pub price: f64,
    pub stop_loss: Option<f64>,
    pub take_profit: Option<f64>,
    /// Percent of current balance to deploy; the orchestrator may override.
    pub size_percent: f64,
    pub reason: String,
    pub strategy: String,
    /// Close signals may name a specific exit reason (e.g. a funding
    /// structure normalizing); default is `strategy_close`.
    pub exit_reason: Option<ExitReason>,
}

impl std::fmt::Display for Signal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} {} @ {:.2} (conf {:.1}/10)",
            self.kind, self.symbol, self.price, self.confidence
        )
    }
}

// ---------------------------------------------------------------------------
// Strategy contract
// ---------------------------------------------------------------------------

/// Read-only world view handed to a strategy each tick: closed candles
/// (oldest first), the latest price, and funding history when requested.
#[derive(Debug, Clone, Default)]
pub struct MarketSnapshot {
    pub candles: Vec<Candle>,
    pub last_price: f64,
    pub funding_rates: Vec<FundingRate>,
}

impl MarketSnapshot {
    pub fn closes(&self) -> Vec<f64> {
        self.candles.iter().map(|c| c.close).collect()
    }
}

/// Static facts the harness needs before calling into a strategy.
#[derive(Debug, Clone)]
pub struct StrategyInfo {
    pub name: String,
    pub display_name: String,
    pub timeframe: Timeframe,
    /// Fewer closed bars than this skips the symbol for the tick.
    pub min_bars: usize,
    pub min_confidence: f64,
    pub wants_funding: bool,
    /// Opt-in to multiple concurrent positions per symbol. All shipped
    /// strategies leave this off.
    pub allow_hedging: bool,
}

/// Session parameters surfaced to strategies that want them.
#[derive(Debug, Clone, Default)]
pub struct SessionContext {
    pub balance: f64,
    pub time_limit_seconds: Option<i64>,
    pub max_loss: Option<f64>,
    pub mode: TradeMode,
}

pub trait Strategy: Send {
    fn info(&self) -> StrategyInfo;

    /// Effective parameters, persisted into every register row this strategy
    /// produces.
    fn parameters(&self) -> Value;

    /// Inspect the snapshot and optionally emit an entry signal.
    fn analyze(&mut self, snapshot: &MarketSnapshot, symbol: &str) -> Option<Signal>;

    /// Ask whether an open position owned by this strategy should close.
    fn should_close_position(
        &mut self,
        _snapshot: &MarketSnapshot,
        _entry_price: f64,
        _side: Side,
        _current_pnl_percent: f64,
    ) -> Option<Signal> {
        None
    }

    fn set_session_context(&mut self, _ctx: &SessionContext) {}
}

// ---------------------------------------------------------------------------
// Parameter schema
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamKind {
    Float,
    Int,
    Bool,
    Text,
}

/// One declared strategy parameter.
#[derive(Debug, Clone)]
pub struct ParamSpec {
    pub name: &'static str,
    pub kind: ParamKind,
    pub default: Value,
    pub min: Option<f64>,
    pub max: Option<f64>,
}

impl ParamSpec {
    pub fn float(name: &'static str, default: f64, min: f64, max: f64) -> Self {
        Self {
            name,
            kind: ParamKind::Float,
            default: default.into(),
            min: Some(min),
            max: Some(max),
        }
    }

    pub fn int(name: &'static str, default: i64, min: i64, max: i64) -> Self {
        Self {
            name,
            kind: ParamKind::Int,
            default: default.into(),
            min: Some(min as f64),
            max: Some(max as f64),
        }
    }

    pub fn boolean(name: &'static str, default: bool) -> Self {
        Self {
            name,
            kind: ParamKind::Bool,
            default: default.into(),
            min: None,
            max: None,
        }
    }

    pub fn text(name: &'static str, default: &str) -> Self {
        Self {
            name,
            kind: ParamKind::Text,
            default: default.into(),
            min: None,
            max: None,
        }
    }
}

/// Validate operator params against a schema and merge in defaults.
///
/// Unknown keys, type mismatches, and out-of-bounds values are all errors —
/// a session never starts on a misspelled parameter.
pub fn validate_params(
    specs: &[ParamSpec],
    supplied: &serde_json::Map<String, Value>,
) -> Result<serde_json::Map<String, Value>> {
    for key in supplied.keys() {
        if !specs.iter().any(|s| s.name == key) {
            bail!("unknown strategy parameter: {key}");
        }
    }

    let mut merged = serde_json::Map::new();
    for spec in specs {
        let value = supplied.get(spec.name).unwrap_or(&spec.default).clone();

        match spec.kind {
            ParamKind::Float | ParamKind::Int => {
                let number = value
                    .as_f64()
                    .with_context(|| format!("parameter {} must be numeric", spec.name))?;
                if spec.kind == ParamKind::Int && number.fract() != 0.0 {
                    bail!("parameter {} must be an integer", spec.name);
                }
                if let Some(min) = spec.min {
                    if number < min {
                        bail!("parameter {} = {number} below minimum {min}", spec.name);
                    }
                }
                if let Some(max) = spec.max {
                    if number > max {
                        bail!("parameter {} = {number} above maximum {max}", spec.name);
                    }
                }
            }
            ParamKind::Bool => {
                if !value.is_boolean() {
                    bail!("parameter {} must be a boolean", spec.name);
                }
            }
            ParamKind::Text => {
                if !value.is_string() {
                    bail!("parameter {} must be a string", spec.name);
                }
            }
        }

        merged.insert(spec.name.to_string(), value);
    }

    Ok(merged)
}

// Typed accessors over a validated map. Only called on keys the schema
// guarantees are present and well-typed.

pub(crate) fn param_f64(params: &serde_json::Map<String, Value>, name: &str) -> f64 {
    params.get(name).and_then(Value::as_f64).unwrap_or_default()
}

pub(crate) fn param_usize(params: &serde_json::Map<String, Value>, name: &str) -> usize {
    params
        .get(name)
        .and_then(Value::as_f64)
        .unwrap_or_default() as usize
}

pub(crate) fn param_bool(params: &serde_json::Map<String, Value>, name: &str) -> bool {
    params.get(name).and_then(Value::as_bool).unwrap_or(false)
}

pub(crate) fn param_timeframe(params: &serde_json::Map<String, Value>, name: &str) -> Timeframe {
    params
        .get(name)
        .and_then(Value::as_str)
        .and_then(Timeframe::parse)
        .unwrap_or(Timeframe::Hour1)
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

pub const AVAILABLE_STRATEGIES: &[&str] = &["breakout", "scalping", "funding_rate"];

/// Build a registered strategy by identifier, validating its parameters.
pub fn build_strategy(
    name: &str,
    supplied: &serde_json::Map<String, Value>,
) -> Result<Box<dyn Strategy>> {
    match name {
        "breakout" => {
            let params = validate_params(&breakout::param_specs(), supplied)
                .context("invalid breakout parameters")?;
            Ok(Box::new(breakout::BreakoutStrategy::from_params(params)))
        }
        "scalping" => {
            let params = validate_params(&scalping::param_specs(), supplied)
                .context("invalid scalping parameters")?;
            Ok(Box::new(scalping::ScalpingStrategy::from_params(params)))
        }
        "funding_rate" => {
            let params = validate_params(&funding::param_specs(), supplied)
                .context("invalid funding_rate parameters")?;
            Ok(Box::new(funding::FundingRateStrategy::from_params(params)))
        }
        other => bail!(
            "unknown strategy {other:?}; registered: {}",
            AVAILABLE_STRATEGIES.join(", ")
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn specs() -> Vec<ParamSpec> {
        vec![
            ParamSpec::float("threshold", 0.8, 0.0, 10.0),
            ParamSpec::int("period", 14, 2, 100),
            ParamSpec::boolean("use_rsi", true),
            ParamSpec::text("timeframe", "1h"),
        ]
    }

    #[test]
    fn defaults_fill_missing_keys() {
        let merged = validate_params(&specs(), &serde_json::Map::new()).unwrap();
        assert_eq!(merged["threshold"], 0.8);
        assert_eq!(merged["period"], 14);
        assert_eq!(merged["use_rsi"], true);
        assert_eq!(merged["timeframe"], "1h");
    }

    #[test]
    fn unknown_key_is_an_error() {
        let mut supplied = serde_json::Map::new();
        supplied.insert("treshold".into(), 0.5.into());
        let err = validate_params(&specs(), &supplied).unwrap_err();
        assert!(err.to_string().contains("unknown strategy parameter"));
    }

    #[test]
    fn bounds_are_enforced() {
        let mut supplied = serde_json::Map::new();
        supplied.insert("threshold".into(), 99.0.into());
        assert!(validate_params(&specs(), &supplied).is_err());

        let mut supplied = serde_json::Map::new();
        supplied.insert("period".into(), 1.into());
        assert!(validate_params(&specs(), &supplied).is_err());
    }

    #[test]
    fn type_mismatches_are_errors() {
        let mut supplied = serde_json::Map::new();
        supplied.insert("use_rsi".into(), "yes".into());
        assert!(validate_params(&specs(), &supplied).is_err());

        let mut supplied = serde_json::Map::new();
        supplied.insert("period".into(), 14.5.into());
        assert!(validate_params(&specs(), &supplied).is_err());
    }

    #[test]
    fn registry_builds_all_registered_strategies() {
        for name in AVAILABLE_STRATEGIES {
            let strategy = build_strategy(name, &serde_json::Map::new())
                .unwrap_or_else(|e| panic!("{name} failed to build: {e}"));
            assert_eq!(&strategy.info().name, name);
        }
    }

    #[test]
    fn registry_rejects_unknown_names() {
        assert!(build_strategy("prompt_strategy_v99", &serde_json::Map::new()).is_err());
    }

    #[test]
    fn registry_rejects_bad_params() {
        let mut supplied = serde_json::Map::new();
        supplied.insert("no_such_knob".into(), 1.into());
        assert!(build_strategy("breakout", &supplied).is_err());
    }
}
