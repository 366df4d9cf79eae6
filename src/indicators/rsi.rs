// =============================================================================
// Relative Strength Index — Wilder's smoothing
// =============================================================================
//
//   avg_gain = (prev_avg_gain * (period - 1) + gain) / period
//   avg_loss = (prev_avg_loss * (period - 1) + loss) / period
//   RSI      = 100 - 100 / (1 + avg_gain / avg_loss)
//
// The first value is seeded with the SMA of the first `period` deltas.
// =============================================================================

/// Full RSI series over `closes`. The output starts at index `period` of the
/// input; fewer than `period + 1` closes yield an empty vec.
pub fn rsi_series(closes: &[f64], period: usize) -> Vec<f64> {
    if period == 0 || closes.len() < period + 1 {
        return Vec::new();
    }

    let deltas: Vec<f64> = closes.windows(2).map(|w| w[1] - w[0]).collect();
    let period_f = period as f64;

    let mut avg_gain = deltas[..period].iter().filter(|d| **d > 0.0).sum::<f64>() / period_f;
    let mut avg_loss = deltas[..period]
        .iter()
        .filter(|d| **d < 0.0)
        .map(|d| d.abs())
        .sum::<f64>()
        / period_f;

    let mut out = Vec::with_capacity(deltas.len() - period + 1);
    match rsi_value(avg_gain, avg_loss) {
        Some(v) => out.push(v),
        None => return Vec::new(),
    }

    for &delta in &deltas[period..] {
        let gain = delta.max(0.0);
        let loss = (-delta).max(0.0);
        avg_gain = (avg_gain * (period_f - 1.0) + gain) / period_f;
        avg_loss = (avg_loss * (period_f - 1.0) + loss) / period_f;

        match rsi_value(avg_gain, avg_loss) {
            Some(v) => out.push(v),
            None => break,
        }
    }

    out
}

/// Latest RSI value, or `None` with insufficient data.
pub fn relative_strength_index(closes: &[f64], period: usize) -> Option<f64> {
    rsi_series(closes, period).last().copied()
}

/// A flat market (no gains, no losses) reads as neutral 50; an all-gain
/// market clamps to 100.
fn rsi_value(avg_gain: f64, avg_loss: f64) -> Option<f64> {
    let rsi = if avg_loss == 0.0 && avg_gain == 0.0 {
        50.0
    } else if avg_loss == 0.0 {
        100.0
    } else {
        100.0 - 100.0 / (1.0 + avg_gain / avg_loss)
    };

    rsi.is_finite().then_some(rsi)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_and_short_inputs() {
        assert!(rsi_series(&[], 14).is_empty());
        assert!(rsi_series(&[1.0, 2.0, 3.0], 0).is_empty());
        // 14 closes = 13 deltas, one short of the requirement.
        let closes: Vec<f64> = (1..=14).map(f64::from).collect();
        assert!(rsi_series(&closes, 14).is_empty());
    }

    #[test]
    fn monotonic_up_is_100() {
        let closes: Vec<f64> = (1..=30).map(f64::from).collect();
        for v in rsi_series(&closes, 14) {
            assert!((v - 100.0).abs() < 1e-10);
        }
    }

    #[test]
    fn monotonic_down_is_0() {
        let closes: Vec<f64> = (1..=30).rev().map(f64::from).collect();
        for v in rsi_series(&closes, 14) {
            assert!(v.abs() < 1e-10);
        }
    }

    #[test]
    fn flat_is_neutral() {
        let closes = vec![250.0; 30];
        for v in rsi_series(&closes, 14) {
            assert!((v - 50.0).abs() < 1e-10);
        }
    }

    #[test]
    fn always_within_bounds() {
        let closes = vec![
            44.34, 44.09, 44.15, 43.61, 44.33, 44.83, 45.10, 45.42, 45.84, 46.08, 45.89, 46.03,
            44.18, 44.22, 44.57, 43.42, 42.66, 43.13,
        ];
        for v in rsi_series(&closes, 14) {
            assert!((0.0..=100.0).contains(&v));
        }
    }

    #[test]
    fn latest_value_matches_series_tail() {
        let closes: Vec<f64> = (0..40).map(|i| 100.0 + ((i * 7) % 13) as f64).collect();
        let series = rsi_series(&closes, 14);
        assert_eq!(
            relative_strength_index(&closes, 14),
            series.last().copied()
        );
    }
}
