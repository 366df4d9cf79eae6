// =============================================================================
// Average True Range — Wilder's smoothing
// =============================================================================
//
//   TR  = max(high - low, |high - prev_close|, |low - prev_close|)
//   ATR = (prev_ATR * (period - 1) + TR) / period, seeded with SMA of TR.
// =============================================================================

use crate::market_data::Candle;

/// Latest ATR over `candles`, or `None` with fewer than `period + 1` bars.
pub fn average_true_range(candles: &[Candle], period: usize) -> Option<f64> {
    if period == 0 || candles.len() < period + 1 {
        return None;
    }

    let true_ranges: Vec<f64> = candles
        .windows(2)
        .map(|w| {
            let prev_close = w[0].close;
            let c = &w[1];
            (c.high - c.low)
                .max((c.high - prev_close).abs())
                .max((c.low - prev_close).abs())
        })
        .collect();

    let period_f = period as f64;
    let mut atr = true_ranges[..period].iter().sum::<f64>() / period_f;

    for &tr in &true_ranges[period..] {
        atr = (atr * (period_f - 1.0) + tr) / period_f;
    }

    atr.is_finite().then_some(atr)
}

/// Close-to-close volatility over the window, as a percentage of the last
/// close. The register stores this as the market-volatility snapshot.
pub fn volatility_percent(candles: &[Candle]) -> Option<f64> {
    if candles.len() < 2 {
        return None;
    }

    let closes: Vec<f64> = candles.iter().map(|c| c.close).collect();
    let returns: Vec<f64> = closes
        .windows(2)
        .filter(|w| w[0] != 0.0)
        .map(|w| (w[1] - w[0]) / w[0])
        .collect();
    if returns.is_empty() {
        return None;
    }

    let mean = returns.iter().sum::<f64>() / returns.len() as f64;
    let variance =
        returns.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / returns.len() as f64;

    Some(variance.sqrt() * 100.0)
}
