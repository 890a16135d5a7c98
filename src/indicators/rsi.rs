// =============================================================================
// Relative Strength Index — latest value, Wilder smoothing
// =============================================================================
//
// Seeded with the simple average of the first `period` gains/losses, then
// smoothed: avg = (avg * (period - 1) + current) / period.
// =============================================================================

/// Latest RSI over `closes` with the given `period`.
///
/// Returns `None` for `period == 0` or fewer than `period + 1` closes.
/// A window with no down moves yields 100, no up moves 0, no movement 50.
pub fn rsi(closes: &[f64], period: usize) -> Option<f64> {
    if period == 0 || closes.len() < period + 1 {
        return None;
    }

    let period_f = period as f64;
    let (mut avg_gain, mut avg_loss) = (0.0_f64, 0.0_f64);

    // Seed from the first `period` deltas.
    for w in closes[..=period].windows(2) {
        let delta = w[1] - w[0];
        if delta > 0.0 {
            avg_gain += delta;
        } else {
            avg_loss -= delta;
        }
    }
    avg_gain /= period_f;
    avg_loss /= period_f;

    // Wilder smoothing over the remainder.
    for w in closes[period..].windows(2) {
        let delta = w[1] - w[0];
        let gain = delta.max(0.0);
        let loss = (-delta).max(0.0);
        avg_gain = (avg_gain * (period_f - 1.0) + gain) / period_f;
        avg_loss = (avg_loss * (period_f - 1.0) + loss) / period_f;
    }

    let value = if avg_gain == 0.0 && avg_loss == 0.0 {
        50.0
    } else if avg_loss == 0.0 {
        100.0
    } else {
        100.0 - 100.0 / (1.0 + avg_gain / avg_loss)
    };

    value.is_finite().then_some(value)
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn none_on_short_input() {
        assert!(rsi(&[], 14).is_none());
        let closes: Vec<f64> = (0..14).map(|x| x as f64).collect();
        assert!(rsi(&closes, 14).is_none());
        assert!(rsi(&[1.0, 2.0], 0).is_none());
    }

    #[test]
    fn monotonic_up_is_100() {
        let closes: Vec<f64> = (1..=40).map(|x| x as f64 * 10.0).collect();
        let v = rsi(&closes, 14).unwrap();
        assert!((v - 100.0).abs() < 1e-9);
    }

    #[test]
    fn monotonic_down_is_0() {
        let closes: Vec<f64> = (1..=40).rev().map(|x| x as f64 * 10.0).collect();
        let v = rsi(&closes, 14).unwrap();
        assert!(v.abs() < 1e-9);
    }

    #[test]
    fn flat_is_50() {
        let closes = vec![27_500.0; 40];
        let v = rsi(&closes, 14).unwrap();
        assert!((v - 50.0).abs() < 1e-9);
    }

    #[test]
    fn bounded_on_mixed_input() {
        let closes = vec![
            101.0, 103.5, 102.2, 104.8, 104.1, 106.0, 105.2, 107.7, 106.9, 108.3, 107.5, 109.1,
            108.2, 110.6, 109.8, 111.4, 110.5, 112.9,
        ];
        let v = rsi(&closes, 14).unwrap();
        assert!((0.0..=100.0).contains(&v));
        // Mostly rising series should read overbought-ish.
        assert!(v > 60.0);
    }
}
