// =============================================================================
// Pipeline — the analysis-to-execution flow
// =============================================================================
//
// Per sampled timeframe: pull window -> advise -> persist snapshot.
// For the combined (`final`) pass: gate on four fresh snapshots -> advise ->
// persist -> policy gates -> reconcile against the live position -> execute.
// Every stage narrates itself on the event bus; a rejected trigger always
// emits its reason.
// =============================================================================

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tracing::{info, warn};

use crate::advisor::AdvisorGateway;
use crate::app_state::AppState;
use crate::error::{BotError, BotResult};
use crate::events::Event;
use crate::exchange::Exchange;
use crate::executor::OrderExecutor;
use crate::market_data;
use crate::reconciler::{self, SizingContext};
use crate::types::{Timeframe, TriggerKind};

/// What the scheduler (and the command surface) drive. Split out as a trait
/// so scheduling can be exercised without live collaborators.
#[async_trait]
pub trait PipelineRunner: Send + Sync {
    /// Analyse one sampled timeframe and store its snapshot.
    async fn run_timeframe(&self, timeframe: Timeframe, trigger: TriggerKind) -> BotResult<()>;

    /// Run the combined pass and execute if the signal is admissible.
    async fn run_final(&self, trigger: TriggerKind) -> BotResult<()>;
}

pub struct Pipeline {
    state: Arc<AppState>,
    exchange: Arc<dyn Exchange>,
    advisor: AdvisorGateway,
    executor: OrderExecutor,
}

impl Pipeline {
    pub fn new(
        state: Arc<AppState>,
        exchange: Arc<dyn Exchange>,
        advisor: AdvisorGateway,
        executor: OrderExecutor,
    ) -> Self {
        Self {
            state,
            exchange,
            advisor,
            executor,
        }
    }
}

#[async_trait]
impl PipelineRunner for Pipeline {
    async fn run_timeframe(&self, timeframe: Timeframe, trigger: TriggerKind) -> BotResult<()> {
        let bus = &self.state.bus;
        bus.publish(Event::AnalysisStarted { timeframe, trigger });

        let snapshot = match market_data::pull_snapshot(
            self.exchange.as_ref(),
            &self.state.config.symbol,
            timeframe,
        )
        .await
        {
            Ok(snapshot) => snapshot,
            Err(e) => {
                bus.publish(Event::AnalysisFailed {
                    timeframe,
                    reason: e.to_string(),
                });
                return Err(e);
            }
        };
        self.state.remember_snapshot(snapshot.clone());

        let analysis = match self.advisor.analyze_timeframe(&snapshot).await {
            Ok(analysis) => analysis,
            Err(e) => {
                bus.publish(Event::AnalysisFailed {
                    timeframe,
                    reason: e.to_string(),
                });
                return Err(e);
            }
        };

        self.state.store.put(timeframe, analysis.clone())?;
        info!(%timeframe, confidence = analysis.confidence, "analysis stored");
        bus.publish(Event::AnalysisCompleted {
            timeframe,
            analysis,
        });
        Ok(())
    }

    async fn run_final(&self, trigger: TriggerKind) -> BotResult<()> {
        let bus = &self.state.bus;
        let timeframe = Timeframe::Final;

        // Gate before prompting: a missing or stale input skips the pass
        // without spending an advisor call.
        let bundle = match self.state.store.final_inputs() {
            Ok(bundle) => bundle,
            Err(e) => {
                warn!(reason = %e, "combined pass skipped");
                bus.publish(Event::AnalysisFailed {
                    timeframe,
                    reason: e.to_string(),
                });
                return Ok(());
            }
        };

        bus.publish(Event::AnalysisStarted { timeframe, trigger });

        let analysis = match self.advisor.analyze_combined(&bundle).await {
            Ok(analysis) => analysis,
            Err(e) => {
                bus.publish(Event::AnalysisFailed {
                    timeframe,
                    reason: e.to_string(),
                });
                return Err(e);
            }
        };
        self.state.store.put(timeframe, analysis.clone())?;
        bus.publish(Event::AnalysisCompleted {
            timeframe,
            analysis: analysis.clone(),
        });

        // Rule gates.
        let admitted = match self.state.policy.admit(&analysis, Utc::now()) {
            Ok(admitted) => admitted,
            Err(e) => {
                info!(reason = %e, "signal not admissible");
                bus.publish(Event::SignalRejected {
                    reason: e.to_string(),
                });
                return Ok(());
            }
        };

        // Fresh pre-trade state: equity and the live position.
        let (equity, position) = match self.read_trade_state().await {
            Ok(pair) => pair,
            Err(e) => {
                bus.publish(Event::AnalysisFailed {
                    timeframe,
                    reason: format!("pre-trade state read failed: {e}"),
                });
                return Err(e);
            }
        };

        let context = SizingContext {
            equity_quote: equity,
            step_size: self.state.config.step_size,
            min_notional: self.state.config.min_notional,
        };
        let plan = match reconciler::build_plan(&admitted, &position, &context) {
            Ok(plan) => plan,
            Err(e) => {
                bus.publish(Event::SignalRejected {
                    reason: e.to_string(),
                });
                return Err(e);
            }
        };

        bus.publish(Event::PlanProduced {
            suggestion: admitted.signal.position_suggestion,
            plan: plan.clone(),
        });
        if plan.is_empty() {
            return Ok(());
        }

        let record = self
            .executor
            .execute_plan(plan, admitted.signal, trigger, &position)
            .await;

        if let Err(e) = self.state.store.append_trade(&record) {
            warn!(error = %e, "failed to append trade record");
        }
        if record.outcomes.iter().any(|o| o.ok) {
            self.state.policy.record_execution(Utc::now());
        }
        Ok(())
    }
}

impl Pipeline {
    async fn read_trade_state(&self) -> BotResult<(f64, crate::types::Position)> {
        let equity = self.exchange.get_balance().await?;
        let position = self
            .exchange
            .get_position(&self.state.config.symbol)
            .await?;
        if equity <= 0.0 {
            return Err(BotError::InsufficientMargin(format!(
                "equity {equity} is not positive"
            )));
        }
        Ok((equity, position))
    }
}
