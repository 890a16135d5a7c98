// =============================================================================
// Market Data Adapter — windowed OHLCV pulls plus the indicator table
// =============================================================================
//
// Windows are re-pulled on every trigger and never cached across triggers.
// An empty or short window is MarketDataUnavailable (not retried — the next
// trigger re-pulls); network-level failures are transient and retried here
// with 1 s / 2 s / 4 s backoff.
// =============================================================================

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::RetryIf;
use tracing::{debug, warn};

use crate::error::{BotError, BotResult};
use crate::exchange::Exchange;
use crate::indicators::{
    adx, bollinger, ichimoku, macd, rsi, sma, volume_ratio, vwap, BollingerBands, IchimokuLines,
    MacdPoint,
};
use crate::types::{Bar, Timeframe};

/// Deadline for one OHLCV pull.
const MARKET_DATA_DEADLINE: Duration = Duration::from_secs(10);

/// Transient-retry schedule: 1 s, 2 s, 4 s.
fn backoff() -> impl Iterator<Item = Duration> {
    ExponentialBackoff::from_millis(2)
        .factor(500)
        .map(jitter)
        .take(3)
}

/// One timeframe's OHLCV window with its derived indicator table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketSnapshot {
    pub timeframe: Timeframe,
    pub bars: Vec<Bar>,
    pub last_price: f64,
    pub rsi_14: Option<f64>,
    pub macd: Option<MacdPoint>,
    pub vwap: Option<f64>,
    pub bollinger: Option<BollingerBands>,
    pub ichimoku: Option<IchimokuLines>,
    pub adx_14: Option<f64>,
    pub sma_20: Option<f64>,
    pub sma_50: Option<f64>,
    pub sma_200: Option<f64>,
    /// Latest bar volume vs its trailing 20-bar average.
    pub volume_ratio_20: Option<f64>,
}

impl MarketSnapshot {
    /// Compute the indicator table over a validated window.
    fn from_window(timeframe: Timeframe, bars: Vec<Bar>) -> Self {
        let closes: Vec<f64> = bars.iter().map(|b| b.close).collect();
        let last_price = closes.last().copied().unwrap_or(0.0);

        Self {
            timeframe,
            last_price,
            rsi_14: rsi(&closes, 14),
            macd: macd(&closes, 12, 26, 9),
            vwap: vwap(&bars),
            bollinger: bollinger(&closes, 20, 2.0),
            ichimoku: ichimoku(&bars),
            adx_14: adx(&bars, 14),
            sma_20: sma(&closes, 20),
            sma_50: sma(&closes, 50),
            sma_200: sma(&closes, 200),
            volume_ratio_20: volume_ratio(&bars, 20),
            bars,
        }
    }

    /// Human-readable trend flags for chat read-outs.
    pub fn trend_flags(&self) -> Vec<String> {
        let mut flags = Vec::new();
        if let Some(s20) = self.sma_20 {
            flags.push(if self.last_price >= s20 {
                "above SMA20".to_string()
            } else {
                "below SMA20".to_string()
            });
        }
        if let Some(m) = self.macd {
            flags.push(if m.histogram >= 0.0 {
                "MACD bullish".to_string()
            } else {
                "MACD bearish".to_string()
            });
        }
        if let Some(a) = self.adx_14 {
            if a >= 25.0 {
                flags.push(format!("trending (ADX {a:.0})"));
            } else {
                flags.push(format!("ranging (ADX {a:.0})"));
            }
        }
        flags
    }
}

/// Validate the pulled window: full length, strictly monotonic open times.
fn validate_window(timeframe: Timeframe, bars: &[Bar]) -> BotResult<()> {
    let want = timeframe.window_len();
    if bars.len() < want {
        return Err(BotError::MarketDataUnavailable(format!(
            "{timeframe}: got {} bars, need {want}",
            bars.len()
        )));
    }
    for pair in bars.windows(2) {
        if pair[1].open_ts <= pair[0].open_ts {
            return Err(BotError::MarketDataUnavailable(format!(
                "{timeframe}: bar open times not strictly increasing at ts {}",
                pair[1].open_ts
            )));
        }
    }
    Ok(())
}

/// Pull one window and build the snapshot, without retry.
async fn pull_once(
    exchange: &dyn Exchange,
    symbol: &str,
    timeframe: Timeframe,
) -> BotResult<MarketSnapshot> {
    if timeframe == Timeframe::Final {
        return Err(BotError::MarketDataUnavailable(
            "final timeframe is synthetic, not sampled".into(),
        ));
    }

    let limit = timeframe.window_len();
    let bars = tokio::time::timeout(
        MARKET_DATA_DEADLINE,
        exchange.get_ohlcv(symbol, timeframe, limit),
    )
    .await
    .map_err(|_| {
        BotError::TransientExchange(format!("{timeframe}: market data pull timed out"))
    })??;

    // Keep exactly the contracted window if the venue returned extra.
    let bars = if bars.len() > limit {
        bars[bars.len() - limit..].to_vec()
    } else {
        bars
    };

    validate_window(timeframe, &bars)?;
    debug!(symbol, %timeframe, bars = bars.len(), "window pulled");
    Ok(MarketSnapshot::from_window(timeframe, bars))
}

/// Pull a snapshot, retrying transient failures (1 s / 2 s / 4 s with jitter).
pub async fn pull_snapshot(
    exchange: &dyn Exchange,
    symbol: &str,
    timeframe: Timeframe,
) -> BotResult<MarketSnapshot> {
    RetryIf::spawn(
        backoff(),
        || pull_once(exchange, symbol, timeframe),
        |e: &BotError| {
            let retry = e.is_transient();
            if retry {
                warn!(%timeframe, error = %e, "market data pull failed, retrying");
            }
            retry
        },
    )
    .await
}
