// =============================================================================
// Average Directional Index — Wilder's trend-strength gauge
// =============================================================================
//
// TR, +DM and -DM are Wilder-smoothed over `period`, giving +DI / -DI; the
// DX series is then Wilder-smoothed again into ADX. Needs 2 * period bars of
// burn-in on top of the first delta.
// =============================================================================

use crate::types::Bar;

/// Latest ADX over `bars` with the given `period`.
///
/// Returns `None` for `period == 0` or fewer than `2 * period + 1` bars.
/// Values are in [0, 100]; > 25 conventionally reads as a trending market.
pub fn adx(bars: &[Bar], period: usize) -> Option<f64> {
    if period == 0 || bars.len() < 2 * period + 1 {
        return None;
    }

    let period_f = period as f64;
    let mut smooth_tr = 0.0_f64;
    let mut smooth_plus = 0.0_f64;
    let mut smooth_minus = 0.0_f64;
    let mut adx_value: Option<f64> = None;
    let mut dx_sum = 0.0_f64;
    let mut dx_count = 0usize;

    for (i, pair) in bars.windows(2).enumerate() {
        let (prev, cur) = (&pair[0], &pair[1]);

        let tr = (cur.high - cur.low)
            .max((cur.high - prev.close).abs())
            .max((cur.low - prev.close).abs());
        let up_move = cur.high - prev.high;
        let down_move = prev.low - cur.low;
        let plus_dm = if up_move > down_move && up_move > 0.0 {
            up_move
        } else {
            0.0
        };
        let minus_dm = if down_move > up_move && down_move > 0.0 {
            down_move
        } else {
            0.0
        };

        if i < period {
            // Accumulate the seeding window.
            smooth_tr += tr;
            smooth_plus += plus_dm;
            smooth_minus += minus_dm;
            if i + 1 < period {
                continue;
            }
        } else {
            smooth_tr = smooth_tr - smooth_tr / period_f + tr;
            smooth_plus = smooth_plus - smooth_plus / period_f + plus_dm;
            smooth_minus = smooth_minus - smooth_minus / period_f + minus_dm;
        }

        if smooth_tr <= 0.0 {
            continue;
        }
        let plus_di = 100.0 * smooth_plus / smooth_tr;
        let minus_di = 100.0 * smooth_minus / smooth_tr;
        let di_sum = plus_di + minus_di;
        let dx = if di_sum > 0.0 {
            100.0 * (plus_di - minus_di).abs() / di_sum
        } else {
            0.0
        };

        // Second Wilder pass: seed ADX with the mean of the first `period`
        // DX values, then smooth.
        match adx_value {
            None => {
                dx_sum += dx;
                dx_count += 1;
                if dx_count == period {
                    adx_value = Some(dx_sum / period_f);
                }
            }
            Some(prev_adx) => {
                adx_value = Some((prev_adx * (period_f - 1.0) + dx) / period_f);
            }
        }
    }

    adx_value.filter(|v| v.is_finite())
}
