// =============================================================================
// Error taxonomy for the Meridian trading engine
// =============================================================================
//
// Four kinds, each with a fixed policy:
//   Transient    — retried with backoff; on exhaustion the current trigger is
//                  aborted and a Failed event is emitted.
//   Validation   — never retried, never executed; a reason event is emitted.
//   Operational  — aborts the remainder of the current plan; the engine never
//                  issues corrective trades on its own.
//   Fatal        — stops the scheduler, flushes the notifier, exits code 2.
// =============================================================================

use std::time::Duration;

use thiserror::Error;

/// All failure modes the core distinguishes.
#[derive(Debug, Error)]
pub enum BotError {
    // ── Transient ───────────────────────────────────────────────────────
    #[error("transient exchange error: {0}")]
    TransientExchange(String),

    #[error("transient advisor error: {0}")]
    TransientAdvisor(String),

    // ── Data ────────────────────────────────────────────────────────────
    /// Empty or short OHLCV window. Not retried — the next trigger re-pulls.
    #[error("market data unavailable: {0}")]
    MarketDataUnavailable(String),

    // ── Validation ──────────────────────────────────────────────────────
    #[error("advisor rejected: {0}")]
    AdvisorRejected(String),

    #[error("signal inadmissible: {0}")]
    SignalInadmissible(String),

    #[error("invariant violation: {0}")]
    InvariantViolation(String),

    // ── Operational ─────────────────────────────────────────────────────
    #[error("insufficient margin: {0}")]
    InsufficientMargin(String),

    #[error("symbol filter rejected: {0}")]
    SymbolFilterRejected(String),

    #[error("position not flat {0:?} after close order")]
    CloseTimeout(Duration),

    #[error("position desync after open: {0}")]
    PositionDesyncAfterOpen(String),

    // ── Fatal ───────────────────────────────────────────────────────────
    #[error("exchange auth failure: {0}")]
    AuthFailure(String),

    #[error("corrupt config: {0}")]
    CorruptConfig(String),
}

impl BotError {
    /// Whether the retry policy applies (exponential backoff, bounded
    /// attempts). Everything else fails fast.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::TransientExchange(_) | Self::TransientAdvisor(_)
        )
    }

    /// Whether the process must shut down (exit code 2 for auth).
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::AuthFailure(_) | Self::CorruptConfig(_))
    }

    /// Whether the remainder of an in-flight plan must be aborted without
    /// any corrective action.
    pub fn is_operational(&self) -> bool {
        matches!(
            self,
            Self::InsufficientMargin(_)
                | Self::SymbolFilterRejected(_)
                | Self::CloseTimeout(_)
                | Self::PositionDesyncAfterOpen(_)
        )
    }
}

pub type BotResult<T> = Result<T, BotError>;
