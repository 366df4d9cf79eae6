// =============================================================================
// Moving Average Convergence Divergence
// =============================================================================
//
//   macd_line = EMA(fast) - EMA(slow)
//   signal    = EMA(macd_line, signal_period)
//   histogram = macd_line - signal
// =============================================================================

use super::ema::ema_series;

#[derive(Debug, Clone, Copy)]
pub struct MacdResult {
    pub macd: f64,
    pub signal: f64,
    pub histogram: f64,
}

/// Latest MACD snapshot for `closes` with the given periods.
///
/// Requires `slow + signal_period - 1` closes; returns `None` below that.
pub fn macd(closes: &[f64], fast: usize, slow: usize, signal_period: usize) -> Option<MacdResult> {
    if fast == 0 || slow == 0 || signal_period == 0 || fast >= slow {
        return None;
    }

    let fast_series = ema_series(closes, fast);
    let slow_series = ema_series(closes, slow);
    if slow_series.is_empty() {
        return None;
    }

    // Align the two series on their tails: both end at the last close.
    let len = slow_series.len();
    let fast_tail = &fast_series[fast_series.len() - len..];

    let macd_line: Vec<f64> = fast_tail
        .iter()
        .zip(slow_series.iter())
        .map(|(f, s)| f - s)
        .collect();

    let signal_series = ema_series(&macd_line, signal_period);
    let signal = *signal_series.last()?;
    let macd_value = *macd_line.last()?;

    Some(MacdResult {
        macd: macd_value,
        signal,
        histogram: macd_value - signal,
    })
}
