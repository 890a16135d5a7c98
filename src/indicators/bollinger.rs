// =============================================================================
// Bollinger Bands
// =============================================================================
//
// middle = SMA(period), upper/lower = middle ± k * population std-dev.
// =============================================================================

use serde::{Deserialize, Serialize};

/// Latest Bollinger band levels.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BollingerBands {
    pub upper: f64,
    pub middle: f64,
    pub lower: f64,
    /// Band width as a percentage of the middle band.
    pub width_pct: f64,
}

/// Latest Bollinger(period, k) over `closes`.
///
/// Returns `None` for `period == 0`, fewer than `period` closes, or a
/// non-positive middle band (width would be meaningless).
pub fn bollinger(closes: &[f64], period: usize, k: f64) -> Option<BollingerBands> {
    if period == 0 || closes.len() < period {
        return None;
    }

    let window = &closes[closes.len() - period..];
    let mean = window.iter().sum::<f64>() / period as f64;
    let variance = window.iter().map(|c| (c - mean).powi(2)).sum::<f64>() / period as f64;
    let sd = variance.sqrt();

    if !(mean.is_finite() && sd.is_finite()) || mean <= 0.0 {
        return None;
    }

    let upper = mean + k * sd;
    let lower = mean - k * sd;
    Some(BollingerBands {
        upper,
        middle: mean,
        lower,
        width_pct: (upper - lower) / mean * 100.0,
    })
}
