// =============================================================================
// Volume-Weighted Average Price over the pulled window
// =============================================================================

use crate::types::Bar;

/// VWAP across `bars`, weighting the typical price (H+L+C)/3 by volume.
///
/// Returns `None` for an empty window or zero total volume.
pub fn vwap(bars: &[Bar]) -> Option<f64> {
    let mut pv = 0.0_f64;
    let mut total_volume = 0.0_f64;
    for b in bars {
        let typical = (b.high + b.low + b.close) / 3.0;
        pv += typical * b.volume;
        total_volume += b.volume;
    }
    if total_volume <= 0.0 {
        return None;
    }
    let value = pv / total_volume;
    value.is_finite().then_some(value)
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn bar(high: f64, low: f64, close: f64, volume: f64) -> Bar {
        Bar {
            open_ts: 0,
            open: close,
            high,
            low,
            close,
            volume,
        }
    }

    #[test]
    fn none_on_empty_or_zero_volume() {
        assert!(vwap(&[]).is_none());
        assert!(vwap(&[bar(10.0, 9.0, 9.5, 0.0)]).is_none());
    }

    #[test]
    fn single_bar_is_typical_price() {
        let v = vwap(&[bar(30.0, 20.0, 25.0, 3.0)]).unwrap();
        assert_eq!(v, 25.0);
    }

    #[test]
    fn weights_by_volume() {
        // Typical prices 10 and 40, volumes 1 and 3 => (10 + 120) / 4 = 32.5.
        let bars = [bar(10.0, 10.0, 10.0, 1.0), bar(40.0, 40.0, 40.0, 3.0)];
        let v = vwap(&bars).unwrap();
        assert!((v - 32.5).abs() < 1e-12);
    }
}
