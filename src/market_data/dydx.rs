// =============================================================================
// dYdX v4 indexer REST adapter
// =============================================================================
//
// Read-only market data from the public indexer API. The indexer serializes
// most numerics as JSON strings; everything is parsed to `f64` here so no
// exchange representation crosses the adapter boundary.
// =============================================================================

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{debug, instrument, warn};

use super::{Candle, FundingRate, MarketDataSource, OrderBook, Ticker, Timeframe};

/// Per-call request timeout. A symbol whose fetch exceeds this is skipped for
/// the tick by the caller, never retried within it.
const REQUEST_TIMEOUT_SECS: u64 = 10;

pub struct DydxClient {
    base_url: String,
    client: reqwest::Client,
}

impl DydxClient {
    /// Create a client against the production indexer.
    pub fn new() -> Self {
        Self::with_base_url("https://indexer.dydx.trade/v4")
    }

    /// Create a client against an arbitrary indexer root (testnet, mock).
    pub fn with_base_url(base_url: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()
            .expect("failed to build reqwest client");

        Self {
            base_url: base_url.into(),
            client,
        }
    }

    fn resolution(timeframe: Timeframe) -> &'static str {
        match timeframe {
            Timeframe::Min1 => "1MIN",
            Timeframe::Min5 => "5MINS",
            Timeframe::Min15 => "15MINS",
            Timeframe::Min30 => "30MINS",
            Timeframe::Hour1 => "1HOUR",
            Timeframe::Hour4 => "4HOURS",
            Timeframe::Day1 => "1DAY",
        }
    }

    async fn get_json(&self, url: &str) -> Result<serde_json::Value> {
        let resp = self
            .client
            .get(url)
            .send()
            .await
            .with_context(|| format!("GET {url} failed"))?;

        let status = resp.status();
        let body: serde_json::Value = resp
            .json()
            .await
            .with_context(|| format!("failed to parse response from {url}"))?;

        if !status.is_success() {
            anyhow::bail!("indexer returned {status} for {url}: {body}");
        }

        Ok(body)
    }
}

impl Default for DydxClient {
    fn default() -> Self {
        Self::new()
    }
}

/// The indexer serializes numerics as JSON strings; accept both.
fn field_f64(val: &serde_json::Value, name: &str) -> Result<f64> {
    match val {
        serde_json::Value::String(s) => s
            .parse::<f64>()
            .with_context(|| format!("failed to parse {name} as f64: {s}")),
        serde_json::Value::Number(n) => n
            .as_f64()
            .with_context(|| format!("field {name} is not a valid f64")),
        _ => anyhow::bail!("field {name} has unexpected JSON type"),
    }
}

fn field_timestamp(val: &serde_json::Value, name: &str) -> Result<DateTime<Utc>> {
    let s = val
        .as_str()
        .with_context(|| format!("missing timestamp field {name}"))?;
    s.parse::<DateTime<Utc>>()
        .with_context(|| format!("failed to parse {name} as timestamp: {s}"))
}

#[async_trait]
impl MarketDataSource for DydxClient {
    #[instrument(skip(self), name = "dydx::fetch_candles")]
    async fn fetch_candles(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        limit: usize,
    ) -> Result<Vec<Candle>> {
        let url = format!(
            "{}/candles/perpetualMarkets/{}?resolution={}&limit={}",
            self.base_url,
            symbol,
            Self::resolution(timeframe),
            limit
        );

        let body = self.get_json(&url).await?;
        let raw = body["candles"]
            .as_array()
            .context("candles response missing 'candles' array")?;

        // The indexer returns newest-first; the engine contract is oldest-first.
        let mut candles = Vec::with_capacity(raw.len());
        for c in raw.iter().rev() {
            candles.push(Candle {
                timestamp: field_timestamp(&c["startedAt"], "startedAt")?,
                open: field_f64(&c["open"], "open")?,
                high: field_f64(&c["high"], "high")?,
                low: field_f64(&c["low"], "low")?,
                close: field_f64(&c["close"], "close")?,
                volume: field_f64(&c["baseTokenVolume"], "baseTokenVolume")?,
            });
        }

        debug!(symbol, timeframe = %timeframe, count = candles.len(), "candles fetched");
        Ok(candles)
    }

    #[instrument(skip(self), name = "dydx::get_ticker")]
    async fn get_ticker(&self, symbol: &str) -> Result<Ticker> {
        let url = format!("{}/perpetualMarkets?ticker={}", self.base_url, symbol);
        let body = self.get_json(&url).await?;

        let market = body["markets"]
            .get(symbol)
            .with_context(|| format!("no market entry for {symbol}"))?;

        let mark_price = field_f64(&market["oraclePrice"], "oraclePrice")?;
        if !mark_price.is_finite() || mark_price <= 0.0 {
            anyhow::bail!("indexer returned non-positive mark price {mark_price} for {symbol}");
        }

        // Best bid/ask are only exposed on the orderbook endpoint; a shallow
        // snapshot keeps the ticker self-contained.
        let book = self.get_orderbook(symbol).await.unwrap_or_else(|e| {
            warn!(symbol, error = %e, "orderbook unavailable for ticker, using mark only");
            OrderBook::default()
        });

        Ok(Ticker {
            mark_price,
            bid: book.bids.first().map(|(p, _)| *p).unwrap_or(mark_price),
            ask: book.asks.first().map(|(p, _)| *p).unwrap_or(mark_price),
            volume_24h: field_f64(&market["volume24H"], "volume24H").unwrap_or(0.0),
            funding_rate: field_f64(&market["nextFundingRate"], "nextFundingRate").ok(),
            open_interest: field_f64(&market["openInterest"], "openInterest").ok(),
        })
    }

    #[instrument(skip(self), name = "dydx::get_funding_rates")]
    async fn get_funding_rates(&self, symbol: &str, limit: usize) -> Result<Vec<FundingRate>> {
        let url = format!(
            "{}/historicalFunding/{}?limit={}",
            self.base_url, symbol, limit
        );
        let body = self.get_json(&url).await?;

        let raw = body["historicalFunding"]
            .as_array()
            .context("funding response missing 'historicalFunding' array")?;

        let mut rates = Vec::with_capacity(raw.len());
        for r in raw {
            rates.push(FundingRate {
                timestamp: field_timestamp(&r["effectiveAt"], "effectiveAt")?,
                rate: field_f64(&r["rate"], "rate")?,
            });
        }

        Ok(rates)
    }

    #[instrument(skip(self), name = "dydx::get_orderbook")]
    async fn get_orderbook(&self, symbol: &str) -> Result<OrderBook> {
        let url = format!("{}/orderbooks/perpetualMarket/{}", self.base_url, symbol);
        let body = self.get_json(&url).await?;

        let parse_side = |name: &str| -> Result<Vec<(f64, f64)>> {
            let levels = body[name]
                .as_array()
                .with_context(|| format!("orderbook response missing '{name}' array"))?;
            levels
                .iter()
                .map(|lvl| {
                    Ok((
                        field_f64(&lvl["price"], "price")?,
                        field_f64(&lvl["size"], "size")?,
                    ))
                })
                .collect()
        };

        Ok(OrderBook {
            bids: parse_side("bids")?,
            asks: parse_side("asks")?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn field_f64_accepts_strings_and_numbers() {
        assert_eq!(
            field_f64(&serde_json::json!("50000.5"), "x").unwrap(),
            50_000.5
        );
        assert_eq!(field_f64(&serde_json::json!(42.0), "x").unwrap(), 42.0);
        assert!(field_f64(&serde_json::json!(true), "x").is_err());
        assert!(field_f64(&serde_json::json!("abc"), "x").is_err());
    }

    #[test]
    fn field_timestamp_parses_rfc3339() {
        let val = serde_json::json!("2025-06-01T12:00:00.000Z");
        let ts = field_timestamp(&val, "startedAt").unwrap();
        assert_eq!(ts.timestamp(), 1_748_779_200);
        assert!(field_timestamp(&serde_json::json!(5), "startedAt").is_err());
    }

    #[test]
    fn resolution_mapping() {
        assert_eq!(DydxClient::resolution(Timeframe::Min1), "1MIN");
        assert_eq!(DydxClient::resolution(Timeframe::Min5), "5MINS");
        assert_eq!(DydxClient::resolution(Timeframe::Hour1), "1HOUR");
        assert_eq!(DydxClient::resolution(Timeframe::Day1), "1DAY");
    }
}
