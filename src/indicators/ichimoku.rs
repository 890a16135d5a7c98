// =============================================================================
// Ichimoku Kinko Hyo — conversion/base lines and cloud boundaries
// =============================================================================
//
// tenkan   = midpoint of the highest high / lowest low over 9 bars
// kijun    = midpoint over 26 bars
// senkou_a = (tenkan + kijun) / 2
// senkou_b = midpoint over 52 bars
//
// Values are computed at the latest bar; the chart-time displacement of the
// cloud is presentation-only and not applied here.
// =============================================================================

use serde::{Deserialize, Serialize};

use crate::types::Bar;

const TENKAN_LEN: usize = 9;
const KIJUN_LEN: usize = 26;
const SENKOU_B_LEN: usize = 52;

/// Latest Ichimoku line values.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct IchimokuLines {
    pub tenkan: f64,
    pub kijun: f64,
    pub senkou_a: f64,
    pub senkou_b: f64,
}

/// Midpoint of the high/low range over the trailing `len` bars.
fn range_midpoint(bars: &[Bar], len: usize) -> Option<f64> {
    if bars.len() < len {
        return None;
    }
    let window = &bars[bars.len() - len..];
    let highest = window.iter().map(|b| b.high).fold(f64::MIN, f64::max);
    let lowest = window.iter().map(|b| b.low).fold(f64::MAX, f64::min);
    let mid = (highest + lowest) / 2.0;
    mid.is_finite().then_some(mid)
}

/// Latest Ichimoku(9, 26, 52) over `bars`; `None` below 52 bars.
pub fn ichimoku(bars: &[Bar]) -> Option<IchimokuLines> {
    let tenkan = range_midpoint(bars, TENKAN_LEN)?;
    let kijun = range_midpoint(bars, KIJUN_LEN)?;
    let senkou_b = range_midpoint(bars, SENKOU_B_LEN)?;
    Some(IchimokuLines {
        tenkan,
        kijun,
        senkou_a: (tenkan + kijun) / 2.0,
        senkou_b,
    })
}
