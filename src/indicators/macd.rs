// =============================================================================
// Moving Average Convergence/Divergence
// =============================================================================
//
// macd      = EMA(fast) - EMA(slow)
// signal    = EMA(signal_period) of the macd line
// histogram = macd - signal
//
// EMAs are seeded at the first sample and smoothed with
// alpha = 2 / (period + 1).
// =============================================================================

use serde::{Deserialize, Serialize};

/// Latest MACD reading.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MacdPoint {
    pub macd: f64,
    pub signal: f64,
    pub histogram: f64,
}

/// Exponential moving average series, same length as `values`.
fn ema_series(values: &[f64], period: usize) -> Vec<f64> {
    if values.is_empty() || period == 0 {
        return Vec::new();
    }
    let alpha = 2.0 / (period as f64 + 1.0);
    let mut out = Vec::with_capacity(values.len());
    let mut ema = values[0];
    out.push(ema);
    for &v in &values[1..] {
        ema = alpha * v + (1.0 - alpha) * ema;
        out.push(ema);
    }
    out
}

/// Latest MACD(fast, slow, signal_period) over `closes`.
///
/// Requires at least `slow + signal_period` closes so both the slow EMA and
/// the signal line have burned in.
pub fn macd(closes: &[f64], fast: usize, slow: usize, signal_period: usize) -> Option<MacdPoint> {
    if fast == 0 || slow == 0 || signal_period == 0 || fast >= slow {
        return None;
    }
    if closes.len() < slow + signal_period {
        return None;
    }

    let ema_fast = ema_series(closes, fast);
    let ema_slow = ema_series(closes, slow);
    let line: Vec<f64> = ema_fast
        .iter()
        .zip(&ema_slow)
        .map(|(f, s)| f - s)
        .collect();
    let signal_line = ema_series(&line, signal_period);

    let macd_v = *line.last()?;
    let signal_v = *signal_line.last()?;
    let point = MacdPoint {
        macd: macd_v,
        signal: signal_v,
        histogram: macd_v - signal_v,
    };

    (point.macd.is_finite() && point.signal.is_finite()).then_some(point)
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn none_on_short_or_degenerate_input() {
        assert!(macd(&[], 12, 26, 9).is_none());
        let closes: Vec<f64> = (0..30).map(|x| x as f64).collect();
        assert!(macd(&closes, 12, 26, 9).is_none(), "needs slow+signal bars");
        let closes: Vec<f64> = (0..60).map(|x| x as f64).collect();
        assert!(macd(&closes, 26, 12, 9).is_none(), "fast must be < slow");
        assert!(macd(&closes, 0, 26, 9).is_none());
    }

    #[test]
    fn flat_series_is_zero() {
        let closes = vec![50_000.0; 60];
        let p = macd(&closes, 12, 26, 9).unwrap();
        assert!(p.macd.abs() < 1e-9);
        assert!(p.signal.abs() < 1e-9);
        assert!(p.histogram.abs() < 1e-9);
    }

    #[test]
    fn uptrend_is_positive() {
        let closes: Vec<f64> = (0..80).map(|x| 100.0 + x as f64).collect();
        let p = macd(&closes, 12, 26, 9).unwrap();
        assert!(p.macd > 0.0);
        assert!(p.signal > 0.0);
    }

    #[test]
    fn downtrend_is_negative() {
        let closes: Vec<f64> = (0..80).map(|x| 500.0 - x as f64).collect();
        let p = macd(&closes, 12, 26, 9).unwrap();
        assert!(p.macd < 0.0);
    }

    #[test]
    fn ema_seeds_at_first_value() {
        let series = ema_series(&[10.0, 10.0, 10.0], 5);
        assert_eq!(series, vec![10.0, 10.0, 10.0]);
    }
}
