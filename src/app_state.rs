// =============================================================================
// Shared engine state
// =============================================================================
//
// Ties together what more than one task needs: config, the analysis store,
// the policy counters, the event bus, and the most recent market snapshots
// for chat read-outs. Everything mutable is behind its own fine-grained lock;
// subsystem engines manage their own interior state.
// =============================================================================

use std::collections::HashMap;

use chrono_tz::Tz;
use parking_lot::RwLock;

use crate::config::AppConfig;
use crate::market_data::MarketSnapshot;
use crate::notifier::EventBus;
use crate::policy::SignalPolicy;
use crate::store::AnalysisStore;
use crate::types::Timeframe;

/// Central state shared across tasks via `Arc<AppState>`.
pub struct AppState {
    pub config: AppConfig,
    pub tz: Tz,
    pub store: AnalysisStore,
    pub policy: SignalPolicy,
    pub bus: EventBus,
    /// Latest pulled snapshot per timeframe, for `/status` and `/price`.
    last_snapshots: RwLock<HashMap<Timeframe, MarketSnapshot>>,
    pub started_at: std::time::Instant,
}

impl AppState {
    pub fn new(
        config: AppConfig,
        tz: Tz,
        store: AnalysisStore,
        policy: SignalPolicy,
        bus: EventBus,
    ) -> Self {
        Self {
            config,
            tz,
            store,
            policy,
            bus,
            last_snapshots: RwLock::new(HashMap::new()),
            started_at: std::time::Instant::now(),
        }
    }

    /// Remember the freshest snapshot for its timeframe.
    pub fn remember_snapshot(&self, snapshot: MarketSnapshot) {
        self.last_snapshots
            .write()
            .insert(snapshot.timeframe, snapshot);
    }

    /// The snapshot to read prices and indicators from: the shortest
    /// timeframe that has one (it refreshes most often).
    pub fn status_snapshot(&self) -> Option<MarketSnapshot> {
        let snapshots = self.last_snapshots.read();
        Timeframe::SAMPLED
            .iter()
            .find_map(|tf| snapshots.get(tf).cloned())
    }
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("symbol", &self.config.symbol)
            .field("tz", &self.tz)
            .field("snapshots", &self.last_snapshots.read().len())
            .finish()
    }
}
