// =============================================================================
// Session configuration — JSON file + environment overrides, serde defaults
// =============================================================================
//
// Every field carries a serde default so older config files keep loading as
// options are added. Saving uses the atomic tmp + rename pattern so a crash
// mid-write never corrupts the file.
//
// `resolve()` turns the raw operator input into validated, typed values;
// any violation there is an invalid-arguments failure (exit code 2).
// =============================================================================

use std::path::Path;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::time_parser::{format_duration, parse_bounded};

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_account() -> String {
    "default".to_string()
}

fn default_balance() -> f64 {
    10_000.0
}

fn default_symbols() -> Vec<String> {
    vec!["BTC-USD".to_string(), "ETH-USD".to_string()]
}

fn default_leverage() -> f64 {
    2.0
}

fn default_strategy() -> String {
    "breakout".to_string()
}

fn default_check_interval() -> String {
    "5min".to_string()
}

fn default_max_positions() -> u32 {
    3
}

fn default_size_percent() -> f64 {
    10.0
}

fn default_slippage_percent() -> f64 {
    0.75
}

fn default_db_path() -> String {
    "data/paper_trading.db".to_string()
}

// =============================================================================
// SessionConfig
// =============================================================================

/// Raw operator-supplied session options.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Account name; created on first use.
    #[serde(default = "default_account")]
    pub account: String,

    /// Initial balance in USD for a newly created account.
    #[serde(default = "default_balance")]
    pub balance: f64,

    /// Markets to trade, evaluated in this order every tick.
    #[serde(default = "default_symbols")]
    pub symbols: Vec<String>,

    /// Default leverage multiplier.
    #[serde(default = "default_leverage")]
    pub leverage: f64,

    /// Registered strategy identifier.
    #[serde(default = "default_strategy")]
    pub strategy: String,

    /// Strategy parameter overrides, validated against the strategy schema.
    #[serde(default)]
    pub strategy_params: serde_json::Map<String, serde_json::Value>,

    /// Session time limit, human duration ("10h", "2h 15min").
    #[serde(default)]
    pub time_limit: Option<String>,

    /// Tick period, human duration.
    #[serde(default = "default_check_interval")]
    pub check_interval: String,

    /// Stop-session loss threshold in USD (absolute).
    #[serde(default)]
    pub max_loss: Option<f64>,

    /// Fixed position size override, `BASE:AMOUNT` (e.g. "BTC:1").
    #[serde(default)]
    pub position_size: Option<String>,

    /// Cap on concurrent open positions.
    #[serde(default = "default_max_positions")]
    pub max_positions: u32,

    /// Percent of balance per position when no fixed size applies.
    #[serde(default = "default_size_percent")]
    pub size_percent: f64,

    /// Exit slippage haircut in percent.
    #[serde(default = "default_slippage_percent")]
    pub slippage_percent: f64,

    /// Entry cooldown after a losing close, human duration.
    #[serde(default)]
    pub cooldown: Option<String>,

    /// Pause new entries at or above this drawdown percent.
    #[serde(default)]
    pub max_drawdown_percent: Option<f64>,

    /// SQLite database path.
    #[serde(default = "default_db_path")]
    pub db_path: String,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            account: default_account(),
            balance: default_balance(),
            symbols: default_symbols(),
            leverage: default_leverage(),
            strategy: default_strategy(),
            strategy_params: serde_json::Map::new(),
            time_limit: None,
            check_interval: default_check_interval(),
            max_loss: None,
            position_size: None,
            max_positions: default_max_positions(),
            size_percent: default_size_percent(),
            slippage_percent: default_slippage_percent(),
            cooldown: None,
            max_drawdown_percent: None,
            db_path: default_db_path(),
        }
    }
}

impl SessionConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read session config from {}", path.display()))?;
        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse session config from {}", path.display()))?;

        info!(
            path = %path.display(),
            account = %config.account,
            strategy = %config.strategy,
            symbols = ?config.symbols,
            "session config loaded"
        );
        Ok(config)
    }

    /// Atomic write: tmp sibling file, then rename.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let content =
            serde_json::to_string_pretty(self).context("failed to serialise session config")?;

        let tmp_path = path.with_extension("json.tmp");
        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp config to {}", tmp_path.display()))?;
        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename tmp config to {}", path.display()))?;

        info!(path = %path.display(), "session config saved");
        Ok(())
    }

    /// Apply `PAPERBOT_*` environment overrides on top of the file values.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("PAPERBOT_ACCOUNT") {
            self.account = v;
        }
        if let Ok(v) = std::env::var("PAPERBOT_BALANCE") {
            if let Ok(parsed) = v.parse() {
                self.balance = parsed;
            }
        }
        if let Ok(v) = std::env::var("PAPERBOT_SYMBOLS") {
            let symbols: Vec<String> = v
                .split(',')
                .map(|s| s.trim().to_uppercase())
                .filter(|s| !s.is_empty())
                .collect();
            if !symbols.is_empty() {
                self.symbols = symbols;
            }
        }
        if let Ok(v) = std::env::var("PAPERBOT_LEVERAGE") {
            if let Ok(parsed) = v.parse() {
                self.leverage = parsed;
            }
        }
        if let Ok(v) = std::env::var("PAPERBOT_STRATEGY") {
            self.strategy = v;
        }
        if let Ok(v) = std::env::var("PAPERBOT_TIME_LIMIT") {
            self.time_limit = Some(v);
        }
        if let Ok(v) = std::env::var("PAPERBOT_CHECK_INTERVAL") {
            self.check_interval = v;
        }
        if let Ok(v) = std::env::var("PAPERBOT_MAX_LOSS") {
            if let Ok(parsed) = v.parse() {
                self.max_loss = Some(parsed);
            }
        }
        if let Ok(v) = std::env::var("PAPERBOT_POSITION_SIZE") {
            self.position_size = Some(v);
        }
        if let Ok(v) = std::env::var("PAPERBOT_MAX_POSITIONS") {
            if let Ok(parsed) = v.parse() {
                self.max_positions = parsed;
            }
        }
        if let Ok(v) = std::env::var("PAPERBOT_DB") {
            self.db_path = v;
        }
    }

    /// Validate and convert into typed runtime values.
    pub fn resolve(&self) -> Result<ResolvedConfig> {
        if self.account.trim().is_empty() {
            bail!("account name must not be empty");
        }
        if !self.balance.is_finite() || self.balance <= 0.0 {
            bail!("balance must be positive, got {}", self.balance);
        }
        if self.symbols.is_empty() {
            bail!("at least one symbol is required");
        }
        if !(1.0..=20.0).contains(&self.leverage) {
            bail!("leverage must be within 1..=20, got {}", self.leverage);
        }
        if !(0.0..=100.0).contains(&self.size_percent) || self.size_percent == 0.0 {
            bail!("size_percent must be in (0, 100], got {}", self.size_percent);
        }
        if self.max_positions == 0 {
            bail!("max_positions must be at least 1");
        }
        if !self.slippage_percent.is_finite() || self.slippage_percent < 0.0 {
            bail!("slippage_percent must be non-negative, got {}", self.slippage_percent);
        }

        let check_interval_seconds = parse_bounded(&self.check_interval, Some(1), None)
            .with_context(|| format!("invalid check_interval {:?}", self.check_interval))?;

        let time_limit_seconds = self
            .time_limit
            .as_deref()
            .map(|s| {
                parse_bounded(s, Some(1), None)
                    .with_context(|| format!("invalid time_limit {s:?}"))
            })
            .transpose()?;

        let cooldown_seconds = self
            .cooldown
            .as_deref()
            .map(|s| parse_bounded(s, Some(1), None).with_context(|| format!("invalid cooldown {s:?}")))
            .transpose()?
            .unwrap_or(0);

        let max_loss = match self.max_loss {
            Some(v) if !v.is_finite() || v == 0.0 => {
                bail!("max_loss must be a non-zero amount in USD, got {v}")
            }
            Some(v) => Some(v.abs()),
            None => None,
        };

        let position_size_override = self
            .position_size
            .as_deref()
            .map(parse_position_size)
            .transpose()?;

        info!(
            account = %self.account,
            strategy = %self.strategy,
            check_interval = format_duration(check_interval_seconds),
            time_limit = time_limit_seconds.map(format_duration).unwrap_or_else(|| "none".into()),
            "session config resolved"
        );

        Ok(ResolvedConfig {
            account: self.account.clone(),
            balance: self.balance,
            symbols: self.symbols.clone(),
            leverage: self.leverage,
            strategy: self.strategy.clone(),
            strategy_params: self.strategy_params.clone(),
            time_limit_seconds,
            check_interval_seconds,
            max_loss,
            position_size_override,
            max_positions: self.max_positions,
            size_percent: self.size_percent,
            slippage_percent: self.slippage_percent,
            cooldown_seconds,
            max_drawdown_percent: self.max_drawdown_percent,
            db_path: self.db_path.clone(),
        })
    }
}

/// Fixed `BASE:AMOUNT` sizing, e.g. 1 BTC for every BTC-* market.
#[derive(Debug, Clone, PartialEq)]
pub struct PositionSizeOverride {
    pub base: String,
    pub amount: f64,
}

fn parse_position_size(input: &str) -> Result<PositionSizeOverride> {
    let (base, amount) = input
        .split_once(':')
        .with_context(|| format!("position_size must be BASE:AMOUNT, got {input:?}"))?;
    let amount: f64 = amount
        .trim()
        .parse()
        .with_context(|| format!("position_size amount is not a number in {input:?}"))?;
    if !amount.is_finite() || amount <= 0.0 {
        bail!("position_size amount must be positive, got {amount}");
    }
    Ok(PositionSizeOverride {
        base: base.trim().to_uppercase(),
        amount,
    })
}

/// Validated runtime configuration.
#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub account: String,
    pub balance: f64,
    pub symbols: Vec<String>,
    pub leverage: f64,
    pub strategy: String,
    pub strategy_params: serde_json::Map<String, serde_json::Value>,
    pub time_limit_seconds: Option<u64>,
    pub check_interval_seconds: u64,
    pub max_loss: Option<f64>,
    pub position_size_override: Option<PositionSizeOverride>,
    pub max_positions: u32,
    pub size_percent: f64,
    pub slippage_percent: f64,
    pub cooldown_seconds: u64,
    pub max_drawdown_percent: Option<f64>,
    pub db_path: String,
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_resolves() {
        let resolved = SessionConfig::default().resolve().unwrap();
        assert_eq!(resolved.account, "default");
        assert_eq!(resolved.balance, 10_000.0);
        assert_eq!(resolved.symbols, vec!["BTC-USD", "ETH-USD"]);
        assert_eq!(resolved.check_interval_seconds, 300);
        assert_eq!(resolved.max_positions, 3);
        assert!(resolved.time_limit_seconds.is_none());
        assert!(resolved.position_size_override.is_none());
    }

    #[test]
    fn empty_json_uses_defaults() {
        let config: SessionConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config.strategy, "breakout");
        assert_eq!(config.slippage_percent, 0.75);
    }

    #[test]
    fn partial_json_fills_defaults() {
        let json = r#"{ "account": "piotrek_bot", "symbols": ["SOL-USD"], "time_limit": "12h" }"#;
        let config: SessionConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.account, "piotrek_bot");
        assert_eq!(config.symbols, vec!["SOL-USD"]);
        assert_eq!(config.max_positions, 3);

        let resolved = config.resolve().unwrap();
        assert_eq!(resolved.time_limit_seconds, Some(43_200));
    }

    #[test]
    fn combined_durations_resolve() {
        let config = SessionConfig {
            time_limit: Some("2h 15min 30sek".into()),
            check_interval: "45sek".into(),
            ..Default::default()
        };
        let resolved = config.resolve().unwrap();
        assert_eq!(resolved.time_limit_seconds, Some(8_130));
        assert_eq!(resolved.check_interval_seconds, 45);
    }

    #[test]
    fn invalid_values_are_rejected() {
        let mut config = SessionConfig {
            balance: -5.0,
            ..Default::default()
        };
        assert!(config.resolve().is_err());

        config = SessionConfig {
            leverage: 50.0,
            ..Default::default()
        };
        assert!(config.resolve().is_err());

        config = SessionConfig {
            check_interval: "0s".into(),
            ..Default::default()
        };
        assert!(config.resolve().is_err());

        config = SessionConfig {
            symbols: Vec::new(),
            ..Default::default()
        };
        assert!(config.resolve().is_err());

        config = SessionConfig {
            time_limit: Some("soon".into()),
            ..Default::default()
        };
        assert!(config.resolve().is_err());
    }

    #[test]
    fn max_loss_uses_absolute_value() {
        let config = SessionConfig {
            max_loss: Some(-500.0),
            ..Default::default()
        };
        assert_eq!(config.resolve().unwrap().max_loss, Some(500.0));
    }

    #[test]
    fn position_size_parses_and_validates() {
        assert_eq!(
            parse_position_size("BTC:1").unwrap(),
            PositionSizeOverride {
                base: "BTC".into(),
                amount: 1.0
            }
        );
        assert_eq!(
            parse_position_size("eth: 2.5").unwrap(),
            PositionSizeOverride {
                base: "ETH".into(),
                amount: 2.5
            }
        );
        assert!(parse_position_size("BTC").is_err());
        assert!(parse_position_size("BTC:zero").is_err());
        assert!(parse_position_size("BTC:-1").is_err());
    }

    #[test]
    fn save_and_load_roundtrip() {
        let dir = std::env::temp_dir().join("paperbot-config-test");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("session_config.json");

        let config = SessionConfig {
            account: "roundtrip".into(),
            max_loss: Some(750.0),
            ..Default::default()
        };
        config.save(&path).unwrap();

        let loaded = SessionConfig::load(&path).unwrap();
        assert_eq!(loaded.account, "roundtrip");
        assert_eq!(loaded.max_loss, Some(750.0));

        std::fs::remove_file(&path).ok();
    }
}
