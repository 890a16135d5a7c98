// =============================================================================
// Advisor Gateway — prompt assembly, reply validation, re-prompt-once
// =============================================================================
//
// The advisor reply is untyped text and is never trusted past this module:
// a strict pass (serde enums + range checks + cross-field ordering) either
// yields a typed Analysis or rejects the trigger. One corrective re-prompt is
// allowed, with the validation error appended; a second failure is
// AdvisorRejected. Transport timeouts are transient and retried once.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, warn};

use crate::error::{BotError, BotResult};
use crate::llm::AdvisorTransport;
use crate::market_data::MarketSnapshot;
use crate::types::{Analysis, Suggestion, Timeframe};

/// Deadline for one advisor call.
const ADVISOR_DEADLINE: Duration = Duration::from_secs(60);

/// How many trailing bars are spelled out in the prompt.
const PROMPT_BARS: usize = 10;

/// The reply contract appended to every prompt.
const SCHEMA_CONTRACT: &str = r#"Respond with ONLY a single JSON object (no markdown, no prose) of exactly this shape:
{
  "market_phase": "up" | "down" | "accumulate" | "distribute",
  "overall_sentiment": "positive" | "negative" | "neutral",
  "risk_level": "high" | "medium" | "low",
  "confidence": <number 0-100>,
  "trend_strength": <number 0-100>,
  "trading_signals": {
    "position_suggestion": "BUY" | "SELL" | "HOLD",
    "entry_price": <number or null>,
    "stop_loss": <number or null>,
    "take_profit1": <number or null>,
    "take_profit2": <number or null>,
    "take_profit3": <number or null>,
    "leverage": <integer 1-10>,
    "position_size_pct": <number 0-100>,
    "auto_trading_enabled": <boolean>
  }
}
For BUY: stop_loss < entry_price < take_profit1. For SELL: take_profit1 < entry_price < stop_loss. For HOLD the price fields may be null."#;

/// Turns market snapshots (or analysis bundles) into validated analyses.
pub struct AdvisorGateway {
    transport: Arc<dyn AdvisorTransport>,
    symbol: String,
    /// Operator-configured profit ladder, suggested to the advisor in percent
    /// of entry.
    profit_targets: Vec<f64>,
}

impl AdvisorGateway {
    pub fn new(
        transport: Arc<dyn AdvisorTransport>,
        symbol: impl Into<String>,
        profit_targets: Vec<f64>,
    ) -> Self {
        Self {
            transport,
            symbol: symbol.into(),
            profit_targets,
        }
    }

    // -------------------------------------------------------------------------
    // Public entry points
    // -------------------------------------------------------------------------

    /// Analyse a single timeframe from its snapshot.
    pub async fn analyze_timeframe(&self, snapshot: &MarketSnapshot) -> BotResult<Analysis> {
        let prompt = self.timeframe_prompt(snapshot);
        self.advise(prompt, snapshot.timeframe).await
    }

    /// Produce the combined verdict from the four latest per-timeframe
    /// analyses. The bundle order is the sampled-timeframe order.
    pub async fn analyze_combined(&self, bundle: &[Analysis]) -> BotResult<Analysis> {
        let prompt = self.combined_prompt(bundle);
        self.advise(prompt, Timeframe::Final).await
    }

    // -------------------------------------------------------------------------
    // Core flow: call, validate, re-prompt once
    // -------------------------------------------------------------------------

    async fn advise(&self, prompt: String, timeframe: Timeframe) -> BotResult<Analysis> {
        let reply = self.complete_with_retry(&prompt).await?;

        match parse_and_validate(&reply, timeframe) {
            Ok(analysis) => Ok(analysis),
            Err(validation_error) => {
                warn!(
                    %timeframe,
                    error = %validation_error,
                    "advisor reply rejected, re-prompting once"
                );
                let corrective = format!(
                    "{prompt}\n\nYour previous reply was rejected: {validation_error}\n\
                     Reply again, fixing exactly this problem."
                );
                let second = self.complete_with_retry(&corrective).await?;
                parse_and_validate(&second, timeframe).map_err(|e| {
                    BotError::AdvisorRejected(format!("{timeframe}: {e}"))
                })
            }
        }
    }

    /// One transport call, with a single retry on transient failure.
    async fn complete_with_retry(&self, prompt: &str) -> BotResult<String> {
        match self.transport.complete(prompt, ADVISOR_DEADLINE).await {
            Ok(reply) => Ok(reply),
            Err(e) if e.is_transient() => {
                warn!(error = %e, "advisor call failed, retrying once");
                self.transport.complete(prompt, ADVISOR_DEADLINE).await
            }
            Err(e) => Err(e),
        }
    }

    // -------------------------------------------------------------------------
    // Prompt assembly
    // -------------------------------------------------------------------------

    fn timeframe_prompt(&self, snapshot: &MarketSnapshot) -> String {
        let mut prompt = format!(
            "You are a derivatives trading analyst. Analyse {} on the {} timeframe.\n\n",
            self.symbol, snapshot.timeframe
        );

        prompt.push_str(&format!("Last price: {}\n", snapshot.last_price));
        if let Some(v) = snapshot.rsi_14 {
            prompt.push_str(&format!("RSI(14): {v:.2}\n"));
        }
        if let Some(m) = snapshot.macd {
            prompt.push_str(&format!(
                "MACD(12,26,9): macd={:.2} signal={:.2} histogram={:.2}\n",
                m.macd, m.signal, m.histogram
            ));
        }
        if let Some(v) = snapshot.vwap {
            prompt.push_str(&format!("VWAP: {v:.2}\n"));
        }
        if let Some(b) = snapshot.bollinger {
            prompt.push_str(&format!(
                "Bollinger(20,2): upper={:.2} middle={:.2} lower={:.2} width={:.2}%\n",
                b.upper, b.middle, b.lower, b.width_pct
            ));
        }
        if let Some(i) = snapshot.ichimoku {
            prompt.push_str(&format!(
                "Ichimoku: tenkan={:.2} kijun={:.2} senkouA={:.2} senkouB={:.2}\n",
                i.tenkan, i.kijun, i.senkou_a, i.senkou_b
            ));
        }
        if let Some(v) = snapshot.adx_14 {
            prompt.push_str(&format!("ADX(14): {v:.2}\n"));
        }
        for (label, value) in [
            ("SMA20", snapshot.sma_20),
            ("SMA50", snapshot.sma_50),
            ("SMA200", snapshot.sma_200),
        ] {
            if let Some(v) = value {
                prompt.push_str(&format!("{label}: {v:.2}\n"));
            }
        }
        if let Some(v) = snapshot.volume_ratio_20 {
            prompt.push_str(&format!("Volume vs 20-bar average: {v:.2}x\n"));
        }

        prompt.push_str("\nRecent bars (open_ts, open, high, low, close, volume):\n");
        let tail = snapshot
            .bars
            .iter()
            .rev()
            .take(PROMPT_BARS)
            .collect::<Vec<_>>();
        for bar in tail.iter().rev() {
            prompt.push_str(&format!(
                "{}, {}, {}, {}, {}, {}\n",
                bar.open_ts, bar.open, bar.high, bar.low, bar.close, bar.volume
            ));
        }

        if !self.profit_targets.is_empty() {
            let ladder: Vec<String> = self
                .profit_targets
                .iter()
                .map(|t| format!("{t:.1}%"))
                .collect();
            prompt.push_str(&format!(
                "\nPrefer take-profit levels near {} from entry.\n",
                ladder.join(" / ")
            ));
        }

        prompt.push('\n');
        prompt.push_str(SCHEMA_CONTRACT);
        prompt
    }

    fn combined_prompt(&self, bundle: &[Analysis]) -> String {
        let mut prompt = format!(
            "You are a derivatives trading analyst. Synthesize one overall verdict \
             for {} from these per-timeframe analyses:\n\n",
            self.symbol
        );
        for analysis in bundle {
            prompt.push_str(&format!(
                "--- {} ---\n{}\n",
                analysis.source_timeframe,
                serde_json::to_string(analysis).unwrap_or_default()
            ));
        }
        prompt.push_str(
            "\nWeigh the higher timeframes more heavily and be conservative when \
             they disagree.\n\n",
        );
        prompt.push_str(SCHEMA_CONTRACT);
        prompt
    }
}

impl std::fmt::Debug for AdvisorGateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdvisorGateway")
            .field("symbol", &self.symbol)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Reply parsing and validation
// ---------------------------------------------------------------------------

/// Cut the reply down to its JSON object. Models wrap replies in code fences
/// or prose often enough that this is load-bearing.
fn extract_json_object(reply: &str) -> Option<&str> {
    let start = reply.find('{')?;
    let end = reply.rfind('}')?;
    (end > start).then(|| &reply[start..=end])
}

/// Parse and validate one advisor reply into a typed [`Analysis`].
///
/// On success the result carries a fresh `generated_at` and the requesting
/// timeframe; raw strings never survive past this point.
fn parse_and_validate(reply: &str, timeframe: Timeframe) -> Result<Analysis, String> {
    let json = extract_json_object(reply).ok_or("reply contains no JSON object")?;

    let mut analysis: Analysis = serde_json::from_str(json)
        .map_err(|e| format!("reply does not match the schema: {e}"))?;

    validate(&analysis)?;

    analysis.generated_at = Utc::now().timestamp_millis();
    analysis.source_timeframe = timeframe;
    debug!(%timeframe, confidence = analysis.confidence, "advisor reply validated");
    Ok(analysis)
}

/// Range and cross-field checks serde cannot express.
fn validate(analysis: &Analysis) -> Result<(), String> {
    if !(0.0..=100.0).contains(&analysis.confidence) {
        return Err(format!("confidence {} outside [0,100]", analysis.confidence));
    }
    if !(0.0..=100.0).contains(&analysis.trend_strength) {
        return Err(format!(
            "trend_strength {} outside [0,100]",
            analysis.trend_strength
        ));
    }

    let signal = &analysis.trading_signals;
    if !(1..=10).contains(&signal.leverage) {
        return Err(format!("leverage {} outside [1,10]", signal.leverage));
    }
    if !(0.0..=100.0).contains(&signal.position_size_pct) {
        return Err(format!(
            "position_size_pct {} outside [0,100]",
            signal.position_size_pct
        ));
    }

    match signal.position_suggestion {
        Suggestion::Hold => Ok(()),
        side @ (Suggestion::Buy | Suggestion::Sell) => {
            let (entry, sl, tp1) = match (signal.entry_price, signal.stop_loss, signal.take_profit1)
            {
                (Some(e), Some(s), Some(t)) => (e, s, t),
                _ => {
                    return Err(format!(
                        "{side} requires entry_price, stop_loss and take_profit1"
                    ))
                }
            };
            if entry <= 0.0 || sl <= 0.0 || tp1 <= 0.0 {
                return Err("prices must be positive".into());
            }
            let ordered = match side {
                Suggestion::Buy => sl < entry && entry < tp1,
                Suggestion::Sell => tp1 < entry && entry < sl,
                Suggestion::Hold => unreachable!(),
            };
            if !ordered {
                return Err(format!(
                    "{side} ordering violated: stop_loss={sl} entry={entry} take_profit1={tp1}"
                ));
            }
            Ok(())
        }
    }
}
