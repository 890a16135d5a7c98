// =============================================================================
// Typed events published on the in-process bus
// =============================================================================
//
// Producers: scheduler, advisor gateway, signal policy, reconciler, executor,
// command dispatcher. Consumers: chat channels (via the notifier). Events are
// values, never handles — the executor talks to the notifier only through
// publishes, never through a direct reference back.
// =============================================================================

use serde::Serialize;

use crate::types::{Analysis, Plan, PlanAction, Suggestion, Timeframe, TriggerKind};

/// Coarse event class used for channel-role filtering and coalescing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventClass {
    Analysis,
    Trade,
    Ack,
    System,
}

/// Everything the engine narrates to the outside world.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum Event {
    AnalysisStarted {
        timeframe: Timeframe,
        trigger: TriggerKind,
    },
    AnalysisCompleted {
        timeframe: Timeframe,
        analysis: Analysis,
    },
    AnalysisFailed {
        timeframe: Timeframe,
        reason: String,
    },
    SignalRejected {
        reason: String,
    },
    PlanProduced {
        suggestion: Suggestion,
        plan: Plan,
    },
    OrderSubmitted {
        action: PlanAction,
    },
    OrderFilled {
        action: PlanAction,
        order_id: Option<String>,
    },
    OrderFailed {
        action: PlanAction,
        reason: String,
    },
    /// Synthetic event injected into a channel's own queue when it overflowed.
    NotifierOverflow {
        channel: String,
        dropped: u64,
    },
    /// Reply to an operator command. Admin channel only.
    CommandAck {
        text: String,
    },
}

impl Event {
    pub fn class(&self) -> EventClass {
        match self {
            Self::AnalysisStarted { .. }
            | Self::AnalysisCompleted { .. }
            | Self::AnalysisFailed { .. } => EventClass::Analysis,
            Self::SignalRejected { .. }
            | Self::PlanProduced { .. }
            | Self::OrderSubmitted { .. }
            | Self::OrderFilled { .. }
            | Self::OrderFailed { .. } => EventClass::Trade,
            Self::CommandAck { .. } => EventClass::Ack,
            Self::NotifierOverflow { .. } => EventClass::System,
        }
    }

    /// Short label used in logs and coalesced chat messages.
    pub fn label(&self) -> &'static str {
        match self {
            Self::AnalysisStarted { .. } => "analysis_started",
            Self::AnalysisCompleted { .. } => "analysis_completed",
            Self::AnalysisFailed { .. } => "analysis_failed",
            Self::SignalRejected { .. } => "signal_rejected",
            Self::PlanProduced { .. } => "plan_produced",
            Self::OrderSubmitted { .. } => "order_submitted",
            Self::OrderFilled { .. } => "order_filled",
            Self::OrderFailed { .. } => "order_failed",
            Self::NotifierOverflow { .. } => "notifier_overflow",
            Self::CommandAck { .. } => "command_ack",
        }
    }
}
