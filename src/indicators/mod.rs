// =============================================================================
// Technical indicators used by the shipped strategies and the trade register
// =============================================================================

pub mod atr;
pub mod bollinger;
pub mod ema;
pub mod macd;
pub mod rsi;

pub use atr::average_true_range;
pub use bollinger::{bollinger_bands, BollingerBands};
pub use ema::exponential_moving_average;
pub use macd::{macd, MacdResult};
pub use rsi::relative_strength_index;

/// Simple moving average of the trailing `period` values.
pub fn simple_moving_average(values: &[f64], period: usize) -> Option<f64> {
    if period == 0 || values.len() < period {
        return None;
    }
    let window = &values[values.len() - period..];
    Some(window.iter().sum::<f64>() / period as f64)
}
