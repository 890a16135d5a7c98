// =============================================================================
// Shared domain types for the Meridian trading engine
// =============================================================================

use chrono::Duration;
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Timeframes
// ---------------------------------------------------------------------------

/// Analysis timeframe. `Final` is synthetic — it is never sampled from the
/// exchange and is produced by re-prompting the advisor with the four latest
/// per-timeframe analyses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Timeframe {
    #[serde(rename = "15m")]
    M15,
    #[serde(rename = "1h")]
    H1,
    #[serde(rename = "4h")]
    H4,
    #[serde(rename = "1d")]
    D1,
    #[serde(rename = "final")]
    Final,
}

impl Timeframe {
    /// All timeframes, sampled ones first.
    pub const ALL: [Timeframe; 5] = [Self::M15, Self::H1, Self::H4, Self::D1, Self::Final];

    /// The four timeframes pulled from the exchange.
    pub const SAMPLED: [Timeframe; 4] = [Self::M15, Self::H1, Self::H4, Self::D1];

    /// Fixed OHLCV window length pulled per trigger.
    pub fn window_len(&self) -> usize {
        match self {
            Self::M15 => 64,
            Self::H1 => 48,
            Self::H4 => 90,
            Self::D1 => 45,
            Self::Final => 0,
        }
    }

    /// Wall-clock period between scheduled fires. `None` for `Final`, which
    /// is only ever enqueued after a successful 4h analysis.
    pub fn period(&self) -> Option<Duration> {
        match self {
            Self::M15 => Some(Duration::minutes(15)),
            Self::H1 => Some(Duration::hours(1)),
            Self::H4 => Some(Duration::hours(4)),
            Self::D1 => Some(Duration::days(1)),
            Self::Final => None,
        }
    }

    /// Canonical lowercase code used in file names and chat output.
    pub fn code(&self) -> &'static str {
        match self {
            Self::M15 => "15m",
            Self::H1 => "1h",
            Self::H4 => "4h",
            Self::D1 => "1d",
            Self::Final => "final",
        }
    }

    /// Parse the codes accepted from operator commands.
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "15m" => Some(Self::M15),
            "1h" => Some(Self::H1),
            "4h" => Some(Self::H4),
            "1d" => Some(Self::D1),
            "final" => Some(Self::Final),
            _ => None,
        }
    }
}

impl std::fmt::Display for Timeframe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.code())
    }
}

// ---------------------------------------------------------------------------
// OHLCV bars
// ---------------------------------------------------------------------------

/// A single OHLCV bar. `open_ts` is the bar's open time in epoch
/// milliseconds; windows are strictly monotonic in it.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bar {
    pub open_ts: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

// ---------------------------------------------------------------------------
// Advisor verdict enums
// ---------------------------------------------------------------------------

/// Market phase as judged by the advisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MarketPhase {
    Up,
    Down,
    Accumulate,
    Distribute,
}

/// Overall sentiment across the analysed window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Sentiment {
    Positive,
    Negative,
    Neutral,
}

/// Advisor risk classification; drives the leverage and size clamps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    High,
    Medium,
    Low,
}

/// The advisor's position suggestion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Suggestion {
    Buy,
    Sell,
    Hold,
}

impl std::fmt::Display for Suggestion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Buy => write!(f, "BUY"),
            Self::Sell => write!(f, "SELL"),
            Self::Hold => write!(f, "HOLD"),
        }
    }
}

// ---------------------------------------------------------------------------
// Analysis
// ---------------------------------------------------------------------------

/// The actionable subset of an [`Analysis`].
///
/// `position_size_pct` is a percentage of account equity, never an absolute
/// base quantity. `entry_price`, `stop_loss` and the take-profits may all be
/// null when the suggestion is HOLD.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradingSignal {
    pub position_suggestion: Suggestion,
    #[serde(default)]
    pub entry_price: Option<f64>,
    #[serde(default)]
    pub stop_loss: Option<f64>,
    #[serde(default)]
    pub take_profit1: Option<f64>,
    #[serde(default)]
    pub take_profit2: Option<f64>,
    #[serde(default)]
    pub take_profit3: Option<f64>,
    pub leverage: u32,
    pub position_size_pct: f64,
    pub auto_trading_enabled: bool,
}

/// The advisor's structured verdict for one timeframe.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Analysis {
    pub market_phase: MarketPhase,
    pub overall_sentiment: Sentiment,
    pub risk_level: RiskLevel,
    /// Advisor confidence in [0, 100].
    pub confidence: f64,
    /// Trend strength in [0, 100].
    pub trend_strength: f64,
    pub trading_signals: TradingSignal,
    /// Epoch milliseconds at which the verdict was produced.
    #[serde(default)]
    pub generated_at: i64,
    #[serde(default = "default_source_timeframe")]
    pub source_timeframe: Timeframe,
}

fn default_source_timeframe() -> Timeframe {
    Timeframe::Final
}

// ---------------------------------------------------------------------------
// Exchange position
// ---------------------------------------------------------------------------

/// Direction of a live position. `Flat` iff `size_base == 0`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PositionSide {
    Long,
    Short,
    Flat,
}

impl std::fmt::Display for PositionSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Long => write!(f, "LONG"),
            Self::Short => write!(f, "SHORT"),
            Self::Flat => write!(f, "FLAT"),
        }
    }
}

/// Normalized position snapshot read from the exchange.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub side: PositionSide,
    /// Absolute size in base-asset units, >= 0.
    pub size_base: f64,
    pub leverage: u32,
    pub entry_price: f64,
    pub mark_price: f64,
    pub unrealized_pnl: f64,
    #[serde(default)]
    pub liq_price: Option<f64>,
}

impl Position {
    /// An empty (no-position) snapshot.
    pub fn flat() -> Self {
        Self {
            side: PositionSide::Flat,
            size_base: 0.0,
            leverage: 0,
            entry_price: 0.0,
            mark_price: 0.0,
            unrealized_pnl: 0.0,
            liq_price: None,
        }
    }

    pub fn is_flat(&self) -> bool {
        self.side == PositionSide::Flat || self.size_base == 0.0
    }
}

// ---------------------------------------------------------------------------
// Orders and plans
// ---------------------------------------------------------------------------

/// Order direction as sent to the exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    /// The position side this order direction opens.
    pub fn opens(&self) -> PositionSide {
        match self {
            Self::Buy => PositionSide::Long,
            Self::Sell => PositionSide::Short,
        }
    }
}

impl std::fmt::Display for OrderSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Buy => write!(f, "Buy"),
            Self::Sell => write!(f, "Sell"),
        }
    }
}

/// A primitive exchange action emitted by the reconciler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum PlanAction {
    SetLeverage {
        leverage: u32,
    },
    ClosePosition,
    OpenPosition {
        side: OrderSide,
        qty_base: f64,
        entry_limit: f64,
        stop_loss: f64,
        take_profit: f64,
    },
    ResizePosition {
        /// Signed delta in base units; positive adds in the current direction.
        delta_base: f64,
    },
}

impl std::fmt::Display for PlanAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SetLeverage { leverage } => write!(f, "SetLeverage({leverage})"),
            Self::ClosePosition => write!(f, "ClosePosition"),
            Self::OpenPosition {
                side,
                qty_base,
                entry_limit,
                ..
            } => write!(f, "OpenPosition({side} {qty_base} @ {entry_limit})"),
            Self::ResizePosition { delta_base } => write!(f, "ResizePosition({delta_base:+})"),
        }
    }
}

/// An ordered list of primitive actions; at most one direction change.
pub type Plan = Vec<PlanAction>;

// ---------------------------------------------------------------------------
// Trade history
// ---------------------------------------------------------------------------

/// What caused a pipeline run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TriggerKind {
    Auto,
    Manual,
}

impl std::fmt::Display for TriggerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Auto => write!(f, "auto"),
            Self::Manual => write!(f, "manual"),
        }
    }
}

/// Per-action outcome within an executed plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionOutcome {
    pub action: PlanAction,
    pub ok: bool,
    /// Exchange round-trips made for this action (0 when skipped as a no-op).
    pub attempts: u32,
    #[serde(default)]
    pub detail: Option<String>,
}

/// One appended line in the trade history. Never mutated after writing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeRecord {
    /// Epoch milliseconds.
    pub recorded_at: i64,
    pub trigger: TriggerKind,
    pub signal: TradingSignal,
    pub plan: Plan,
    pub outcomes: Vec<ActionOutcome>,
}
