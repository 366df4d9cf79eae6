// =============================================================================
// Bollinger Bands
// =============================================================================
//
// middle = SMA(period), upper/lower = middle +- num_std * sigma.
// `position_of` maps a price into [0, 1] across the band span; the trade
// register stores that value as the bb-position snapshot at entry.
// =============================================================================

#[derive(Debug, Clone, Copy)]
pub struct BollingerBands {
    pub upper: f64,
    pub middle: f64,
    pub lower: f64,
}

impl BollingerBands {
    /// Width as a percentage of the middle band.
    pub fn width_percent(&self) -> f64 {
        if self.middle != 0.0 {
            (self.upper - self.lower) / self.middle * 100.0
        } else {
            0.0
        }
    }

    /// Where `price` sits between the bands, clamped to [0, 1].
    /// 0 = at/below lower band, 1 = at/above upper band, 0.5 = middle.
    pub fn position_of(&self, price: f64) -> f64 {
        let span = self.upper - self.lower;
        if span <= 0.0 {
            return 0.5;
        }
        ((price - self.lower) / span).clamp(0.0, 1.0)
    }
}

/// Bands over the trailing `period` closes, or `None` when degenerate.
pub fn bollinger_bands(closes: &[f64], period: usize, num_std: f64) -> Option<BollingerBands> {
    if period == 0 || closes.len() < period {
        return None;
    }

    let window = &closes[closes.len() - period..];
    let middle = window.iter().sum::<f64>() / period as f64;
    if middle == 0.0 {
        return None;
    }

    let variance = window.iter().map(|x| (x - middle).powi(2)).sum::<f64>() / period as f64;
    let std_dev = variance.sqrt();

    let bands = BollingerBands {
        upper: middle + num_std * std_dev,
        middle,
        lower: middle - num_std * std_dev,
    };

    bands.upper.is_finite().then_some(bands)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn basic_shape() {
        let closes: Vec<f64> = (1..=20).map(f64::from).collect();
        let bands = bollinger_bands(&closes, 20, 2.0).unwrap();
        assert!(bands.upper > bands.middle);
        assert!(bands.lower < bands.middle);
        assert!(bands.width_percent() > 0.0);
    }

    #[test]
    fn insufficient_data() {
        assert!(bollinger_bands(&[1.0, 2.0], 20, 2.0).is_none());
    }

    #[test]
    fn flat_market_has_zero_width() {
        let bands = bollinger_bands(&[100.0; 20], 20, 2.0).unwrap();
        assert!(bands.width_percent().abs() < 1e-10);
        // Degenerate span reads as the middle of the band.
        assert_eq!(bands.position_of(100.0), 0.5);
    }

    #[test]
    fn position_clamps() {
        let bands = BollingerBands {
            upper: 110.0,
            middle: 100.0,
            lower: 90.0,
        };
        assert_eq!(bands.position_of(90.0), 0.0);
        assert_eq!(bands.position_of(110.0), 1.0);
        assert_eq!(bands.position_of(100.0), 0.5);
        assert_eq!(bands.position_of(80.0), 0.0);
        assert_eq!(bands.position_of(120.0), 1.0);
    }
}
