// =============================================================================
// Simple moving averages and volume participation
// =============================================================================

use crate::types::Bar;

/// Simple moving average of the trailing `period` values.
pub fn sma(values: &[f64], period: usize) -> Option<f64> {
    if period == 0 || values.len() < period {
        return None;
    }
    let window = &values[values.len() - period..];
    let mean = window.iter().sum::<f64>() / period as f64;
    mean.is_finite().then_some(mean)
}

/// Latest bar's volume relative to the SMA of the `period` bars before it.
///
/// A reading above 1.0 means the latest bar traded heavier than its recent
/// average. `None` when there are fewer than `period + 1` bars or the
/// baseline volume is zero.
pub fn volume_ratio(bars: &[Bar], period: usize) -> Option<f64> {
    if period == 0 || bars.len() < period + 1 {
        return None;
    }
    let last = bars.last()?;
    let baseline: Vec<f64> = bars[bars.len() - 1 - period..bars.len() - 1]
        .iter()
        .map(|b| b.volume)
        .collect();
    let avg = sma(&baseline, period)?;
    if avg <= 0.0 {
        return None;
    }
    Some(last.volume / avg)
}
