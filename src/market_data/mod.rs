// =============================================================================
// Market data — source trait and wire-neutral types
// =============================================================================
//
// Everything behind `MarketDataSource` is plain `f64` / `DateTime<Utc>`:
// exchange SDK types never leak past the adapter boundary.
// =============================================================================

pub mod dydx;
pub mod history;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// One OHLCV candle. `timestamp` is the candle open time, UTC.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Candle {
    pub timestamp: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

/// Point-in-time market snapshot for a symbol.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ticker {
    /// Oracle / index price used for PnL and exit checks.
    pub mark_price: f64,
    pub bid: f64,
    pub ask: f64,
    pub volume_24h: f64,
    #[serde(default)]
    pub funding_rate: Option<f64>,
    #[serde(default)]
    pub open_interest: Option<f64>,
}

/// Historical funding-rate sample for a perpetual market.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FundingRate {
    pub timestamp: DateTime<Utc>,
    pub rate: f64,
}

/// Aggregated order-book snapshot: `(price, size)` levels, best first.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OrderBook {
    pub bids: Vec<(f64, f64)>,
    pub asks: Vec<(f64, f64)>,
}

impl OrderBook {
    /// Bid/ask volume imbalance in [-1, 1]; positive means bid-heavy.
    pub fn imbalance(&self, levels: usize) -> Option<f64> {
        let bid: f64 = self.bids.iter().take(levels).map(|(_, s)| s).sum();
        let ask: f64 = self.asks.iter().take(levels).map(|(_, s)| s).sum();
        let total = bid + ask;
        if total > 0.0 {
            Some((bid - ask) / total)
        } else {
            None
        }
    }
}

// ---------------------------------------------------------------------------
// Timeframe
// ---------------------------------------------------------------------------

/// Candle resolutions supported by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Timeframe {
    Min1,
    Min5,
    Min15,
    Min30,
    Hour1,
    Hour4,
    Day1,
}

impl Timeframe {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Min1 => "1min",
            Self::Min5 => "5min",
            Self::Min15 => "15min",
            Self::Min30 => "30min",
            Self::Hour1 => "1h",
            Self::Hour4 => "4h",
            Self::Day1 => "1d",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "1min" | "1m" => Some(Self::Min1),
            "5min" | "5m" => Some(Self::Min5),
            "15min" | "15m" => Some(Self::Min15),
            "30min" | "30m" => Some(Self::Min30),
            "1h" | "1hour" => Some(Self::Hour1),
            "4h" | "4hours" => Some(Self::Hour4),
            "1d" | "1day" => Some(Self::Day1),
            _ => None,
        }
    }

    pub fn seconds(self) -> i64 {
        match self {
            Self::Min1 => 60,
            Self::Min5 => 300,
            Self::Min15 => 900,
            Self::Min30 => 1_800,
            Self::Hour1 => 3_600,
            Self::Hour4 => 14_400,
            Self::Day1 => 86_400,
        }
    }
}

impl std::fmt::Display for Timeframe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Source trait
// ---------------------------------------------------------------------------

/// Abstract market-data backend. One REST adapter ships (`dydx`); tests and
/// backtest drivers provide scripted implementations.
#[async_trait]
pub trait MarketDataSource: Send + Sync {
    /// Fetch up to `limit` candles, oldest first, monotonic by timestamp.
    async fn fetch_candles(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        limit: usize,
    ) -> anyhow::Result<Vec<Candle>>;

    /// Current ticker. Implementations must return a positive finite
    /// `mark_price` or an error — never a silent zero.
    async fn get_ticker(&self, symbol: &str) -> anyhow::Result<Ticker>;

    /// Recent funding-rate history, newest first.
    async fn get_funding_rates(
        &self,
        symbol: &str,
        limit: usize,
    ) -> anyhow::Result<Vec<FundingRate>>;

    /// Order-book snapshot.
    async fn get_orderbook(&self, symbol: &str) -> anyhow::Result<OrderBook>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeframe_parse_aliases() {
        assert_eq!(Timeframe::parse("5min"), Some(Timeframe::Min5));
        assert_eq!(Timeframe::parse("5m"), Some(Timeframe::Min5));
        assert_eq!(Timeframe::parse("1H"), Some(Timeframe::Hour1));
        assert_eq!(Timeframe::parse("2h"), None);
    }

    #[test]
    fn orderbook_imbalance() {
        let book = OrderBook {
            bids: vec![(100.0, 3.0), (99.0, 3.0)],
            asks: vec![(101.0, 1.0), (102.0, 1.0)],
        };
        let imb = book.imbalance(10).unwrap();
        assert!((imb - 0.5).abs() < 1e-12);

        let empty = OrderBook::default();
        assert!(empty.imbalance(10).is_none());
    }
}
