// =============================================================================
// Signal Policy — rule gates between the combined analysis and any order
// =============================================================================
//
// Applied only to the `final` analysis. Every gate failure is a
// SignalInadmissible with the first failing reason; nothing is retried. The
// daily counter rolls over at local midnight in the scheduler timezone, and
// `last_executed_at` is monotonic so a cooldown can never be shortened by a
// clock hiccup.
// =============================================================================

use chrono::{DateTime, Duration, NaiveDate, Utc};
use chrono_tz::Tz;
use parking_lot::RwLock;
use tracing::{debug, info};

use crate::config::{AppConfig, RiskCaps};
use crate::error::{BotError, BotResult};
use crate::types::{Analysis, Suggestion, TradingSignal};

/// A signal that passed all gates, with the risk clamps already applied.
#[derive(Debug, Clone, PartialEq)]
pub struct AdmittedSignal {
    pub signal: TradingSignal,
}

struct PolicyState {
    day: NaiveDate,
    trades_today: u32,
    last_executed_at: Option<DateTime<Utc>>,
}

/// Rule gates and execution bookkeeping.
pub struct SignalPolicy {
    min_confidence: f64,
    min_trend_strength: f64,
    max_daily_trades: u32,
    cooldown: Duration,
    max_loss_pct: f64,
    leverage_caps: RiskCaps<u32>,
    position_caps: RiskCaps<f64>,
    tz: Tz,
    state: RwLock<PolicyState>,
}

impl SignalPolicy {
    pub fn new(config: &AppConfig, tz: Tz) -> Self {
        Self {
            min_confidence: config.min_confidence,
            min_trend_strength: config.min_trend_strength,
            max_daily_trades: config.max_daily_trades,
            cooldown: Duration::minutes(config.cooldown_minutes as i64),
            max_loss_pct: config.max_loss_pct,
            leverage_caps: config.leverage_caps_by_risk,
            position_caps: config.position_caps_by_risk,
            tz,
            state: RwLock::new(PolicyState {
                day: Utc::now().with_timezone(&tz).date_naive(),
                trades_today: 0,
                last_executed_at: None,
            }),
        }
    }

    /// Seed counters from persisted history so a restart cannot bypass the
    /// cooldown or the daily cap. Only records with at least one successful
    /// action count as executions.
    pub fn seed_from_history(&self, records: &[crate::types::TradeRecord], now: DateTime<Utc>) {
        let today = now.with_timezone(&self.tz).date_naive();
        let mut state = self.state.write();
        state.day = today;

        for record in records {
            if !record.outcomes.iter().any(|o| o.ok) {
                continue;
            }
            let Some(executed_at) = DateTime::<Utc>::from_timestamp_millis(record.recorded_at)
            else {
                continue;
            };
            if executed_at.with_timezone(&self.tz).date_naive() == today {
                state.trades_today += 1;
            }
            if state.last_executed_at.is_none_or(|prev| executed_at > prev) {
                state.last_executed_at = Some(executed_at);
            }
        }

        info!(
            trades_today = state.trades_today,
            last_executed_at = ?state.last_executed_at,
            "policy counters seeded from trade history"
        );
    }

    // -------------------------------------------------------------------------
    // Admission
    // -------------------------------------------------------------------------

    /// Run all gates against the combined analysis. Returns the signal with
    /// leverage and size clamped by risk level, or the first failing reason.
    pub fn admit(&self, analysis: &Analysis, now: DateTime<Utc>) -> BotResult<AdmittedSignal> {
        self.maybe_reset_daily(now);

        let signal = &analysis.trading_signals;

        // 1. Auto-trading master switch.
        if !signal.auto_trading_enabled {
            return Err(inadmissible("auto trading disabled by advisor"));
        }

        // 2. Confidence floor.
        if analysis.confidence < self.min_confidence {
            return Err(inadmissible(format!(
                "confidence {:.1} below minimum {:.1}",
                analysis.confidence, self.min_confidence
            )));
        }

        // 3. Trend-strength floor.
        if analysis.trend_strength < self.min_trend_strength {
            return Err(inadmissible(format!(
                "trend strength {:.1} below minimum {:.1}",
                analysis.trend_strength, self.min_trend_strength
            )));
        }

        // 4. Daily trade cap (calendar day in the scheduler timezone).
        {
            let state = self.state.read();
            if state.trades_today >= self.max_daily_trades {
                return Err(inadmissible(format!(
                    "daily trade cap reached ({}/{})",
                    state.trades_today, self.max_daily_trades
                )));
            }

            // 5. Cooldown since the last executed plan.
            if let Some(last) = state.last_executed_at {
                let elapsed = now - last;
                if elapsed < self.cooldown {
                    return Err(inadmissible(format!(
                        "cooldown: {}m since last execution, need {}m",
                        elapsed.num_minutes(),
                        self.cooldown.num_minutes()
                    )));
                }
            }
        }

        // A HOLD has no levels to check or clamp; it is admissible as-is and
        // reconciles to an empty plan.
        if signal.position_suggestion == Suggestion::Hold {
            return Ok(AdmittedSignal {
                signal: signal.clone(),
            });
        }

        // 6. Stop distance cap.
        let (entry, stop) = match (signal.entry_price, signal.stop_loss) {
            (Some(e), Some(s)) if e > 0.0 => (e, s),
            _ => {
                return Err(inadmissible(
                    "tradable signal is missing entry_price or stop_loss",
                ))
            }
        };
        let loss_pct = (stop - entry).abs() / entry * 100.0;
        if loss_pct > self.max_loss_pct {
            return Err(inadmissible(format!(
                "stop distance {loss_pct:.2}% exceeds max {:.2}%",
                self.max_loss_pct
            )));
        }

        // 7. Risk-level clamps.
        let mut admitted = signal.clone();
        let leverage_cap = self.leverage_caps.for_level(analysis.risk_level);
        let size_cap = self.position_caps.for_level(analysis.risk_level);
        if admitted.leverage > leverage_cap {
            debug!(
                requested = admitted.leverage,
                cap = leverage_cap,
                "leverage clamped by risk level"
            );
            admitted.leverage = leverage_cap;
        }
        if admitted.position_size_pct > size_cap {
            debug!(
                requested = admitted.position_size_pct,
                cap = size_cap,
                "position size clamped by risk level"
            );
            admitted.position_size_pct = size_cap;
        }

        Ok(AdmittedSignal { signal: admitted })
    }

    // -------------------------------------------------------------------------
    // Execution bookkeeping
    // -------------------------------------------------------------------------

    /// Record an executed plan: bumps the daily counter and advances
    /// `last_executed_at` (never backwards).
    pub fn record_execution(&self, now: DateTime<Utc>) {
        self.maybe_reset_daily(now);
        let mut state = self.state.write();
        state.trades_today += 1;
        if state.last_executed_at.is_none_or(|prev| now > prev) {
            state.last_executed_at = Some(now);
        }
        debug!(trades_today = state.trades_today, "execution recorded");
    }

    /// Trades executed so far today (scheduler timezone).
    pub fn trades_today(&self, now: DateTime<Utc>) -> u32 {
        self.maybe_reset_daily(now);
        self.state.read().trades_today
    }

    pub fn last_executed_at(&self) -> Option<DateTime<Utc>> {
        self.state.read().last_executed_at
    }

    /// Reset the daily counter when the local calendar day changes.
    fn maybe_reset_daily(&self, now: DateTime<Utc>) {
        let today = now.with_timezone(&self.tz).date_naive();
        {
            let state = self.state.read();
            if state.day == today {
                return;
            }
        }
        let mut state = self.state.write();
        // Double-check after acquiring the write lock.
        if state.day != today {
            info!(old_day = %state.day, new_day = %today, "daily trade counter reset");
            state.day = today;
            state.trades_today = 0;
        }
    }
}

impl std::fmt::Debug for SignalPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignalPolicy")
            .field("min_confidence", &self.min_confidence)
            .field("min_trend_strength", &self.min_trend_strength)
            .field("max_daily_trades", &self.max_daily_trades)
            .field("cooldown_minutes", &self.cooldown.num_minutes())
            .finish()
    }
}

fn inadmissible(reason: impl Into<String>) -> BotError {
    BotError::SignalInadmissible(reason.into())
}
