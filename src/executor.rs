// =============================================================================
// Order Executor — realizes a Plan against the exchange, strictly serialized
// =============================================================================
//
// One mutex (`exec_lock`) totally orders plans: no two plans ever run against
// the instrument concurrently. Within a plan, actions run in order and
// barrier on their own completion; the position is re-read only after
// ClosePosition. Transient failures retry with 1 s / 2 s / 4 s backoff plus
// jitter; permanent failures abort the remainder of the plan. The executor
// never issues a compensating trade to repair a partial plan.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Mutex;
use tokio_retry::strategy::jitter;
use tracing::{debug, info, warn};

use crate::error::{BotError, BotResult};
use crate::events::Event;
use crate::exchange::{Exchange, OrderRequest, OrderType};
use crate::notifier::EventBus;
use crate::types::{
    ActionOutcome, OrderSide, Plan, PlanAction, Position, PositionSide, TradeRecord, TradingSignal,
    TriggerKind,
};

/// How long a close is given to verify flat before CloseTimeout.
const CLOSE_VERIFY_DEADLINE: Duration = Duration::from_secs(5);
/// Position poll cadence during close verification.
const CLOSE_POLL_INTERVAL: Duration = Duration::from_millis(500);
/// Base transient-retry delays.
const RETRY_DELAYS_MS: [u64; 3] = [1000, 2000, 4000];

/// Executes plans serially and records per-action outcomes.
pub struct OrderExecutor {
    exchange: Arc<dyn Exchange>,
    bus: EventBus,
    symbol: String,
    step_size: f64,
    min_notional: f64,
    exec_lock: Mutex<()>,
}

/// Result of one action: exchange round-trips made and an optional order id.
struct ActionResult {
    attempts: u32,
    order_id: Option<String>,
    detail: Option<String>,
}

impl OrderExecutor {
    pub fn new(
        exchange: Arc<dyn Exchange>,
        bus: EventBus,
        symbol: impl Into<String>,
        step_size: f64,
        min_notional: f64,
    ) -> Self {
        Self {
            exchange,
            bus,
            symbol: symbol.into(),
            step_size,
            min_notional,
            exec_lock: Mutex::new(()),
        }
    }

    // -------------------------------------------------------------------------
    // Plan execution
    // -------------------------------------------------------------------------

    /// Execute `plan` against the position it was planned for. Returns the
    /// trade record; whether anything executed is visible in its outcomes.
    pub async fn execute_plan(
        &self,
        plan: Plan,
        signal: TradingSignal,
        trigger: TriggerKind,
        planned_against: &Position,
    ) -> TradeRecord {
        let _guard = self.exec_lock.lock().await;

        info!(actions = plan.len(), %trigger, "plan execution started");

        // Book state tracked across actions: leverage for the idempotent
        // SetLeverage skip, flatness for the open pre-check.
        let mut leverage_on_book = planned_against.leverage;
        let mut book_flat = planned_against.is_flat();

        let mut outcomes: Vec<ActionOutcome> = Vec::with_capacity(plan.len());

        for action in &plan {
            let result = match action {
                PlanAction::SetLeverage { leverage } => {
                    self.run_set_leverage(*leverage, &mut leverage_on_book).await
                }
                PlanAction::ClosePosition => {
                    let r = self.run_close(planned_against).await;
                    if r.is_ok() {
                        book_flat = true;
                    }
                    r
                }
                PlanAction::OpenPosition {
                    side,
                    qty_base,
                    entry_limit,
                    stop_loss,
                    take_profit,
                } => {
                    let r = self
                        .run_open(*side, *qty_base, *entry_limit, *stop_loss, *take_profit, book_flat)
                        .await;
                    if r.is_ok() {
                        book_flat = false;
                    }
                    r
                }
                PlanAction::ResizePosition { delta_base } => {
                    self.run_resize(*delta_base, planned_against).await
                }
            };

            match result {
                Ok(done) => {
                    self.bus.publish(Event::OrderFilled {
                        action: action.clone(),
                        order_id: done.order_id.clone(),
                    });
                    outcomes.push(ActionOutcome {
                        action: action.clone(),
                        ok: true,
                        attempts: done.attempts,
                        detail: done.detail,
                    });
                }
                Err((error, attempts)) => {
                    warn!(action = %action, %error, "action failed, aborting remainder of plan");
                    self.bus.publish(Event::OrderFailed {
                        action: action.clone(),
                        reason: error.to_string(),
                    });
                    outcomes.push(ActionOutcome {
                        action: action.clone(),
                        ok: false,
                        attempts,
                        detail: Some(error.to_string()),
                    });
                    break;
                }
            }
        }

        let executed = outcomes.iter().filter(|o| o.ok).count();
        info!(executed, total = plan.len(), "plan execution finished");

        TradeRecord {
            recorded_at: Utc::now().timestamp_millis(),
            trigger,
            signal,
            plan,
            outcomes,
        }
    }

    // -------------------------------------------------------------------------
    // Individual actions
    // -------------------------------------------------------------------------

    /// Idempotent: when the book already carries the target leverage, no
    /// exchange call is made.
    async fn run_set_leverage(
        &self,
        leverage: u32,
        leverage_on_book: &mut u32,
    ) -> Result<ActionResult, (BotError, u32)> {
        if *leverage_on_book == leverage {
            debug!(leverage, "leverage already set, skipping exchange call");
            return Ok(ActionResult {
                attempts: 0,
                order_id: None,
                detail: Some(format!("leverage already {leverage}")),
            });
        }

        self.bus.publish(Event::OrderSubmitted {
            action: PlanAction::SetLeverage { leverage },
        });
        let ((), attempts) = self
            .with_retries(|| self.exchange.set_leverage(&self.symbol, leverage))
            .await?;
        *leverage_on_book = leverage;
        Ok(ActionResult {
            attempts,
            order_id: None,
            detail: None,
        })
    }

    /// Reduce-only market order sized to the live position, then verify the
    /// book is flat by re-reading until flat or the deadline elapses.
    async fn run_close(&self, live: &Position) -> Result<ActionResult, (BotError, u32)> {
        if live.is_flat() {
            return Ok(ActionResult {
                attempts: 0,
                order_id: None,
                detail: Some("already flat".into()),
            });
        }

        let side = match live.side {
            PositionSide::Long => OrderSide::Sell,
            PositionSide::Short => OrderSide::Buy,
            PositionSide::Flat => unreachable!("guarded by is_flat"),
        };
        let request = OrderRequest::reduce_market(&self.symbol, side, live.size_base);

        self.bus.publish(Event::OrderSubmitted {
            action: PlanAction::ClosePosition,
        });
        let (order_id, attempts) = self
            .with_retries(|| self.exchange.create_order(&request))
            .await?;

        // Verification loop. Read errors during polling are tolerated; only
        // the deadline decides.
        let deadline = tokio::time::Instant::now() + CLOSE_VERIFY_DEADLINE;
        loop {
            match self.exchange.get_position(&self.symbol).await {
                Ok(position) if position.is_flat() => break,
                Ok(_) | Err(_) => {}
            }
            if tokio::time::Instant::now() >= deadline {
                return Err((BotError::CloseTimeout(CLOSE_VERIFY_DEADLINE), attempts));
            }
            tokio::time::sleep(CLOSE_POLL_INTERVAL).await;
        }

        Ok(ActionResult {
            attempts,
            order_id: Some(order_id),
            detail: None,
        })
    }

    /// Limit order with attached SL and the first TP. Pre-checks: flat book,
    /// step/notional gates, directional SL/TP ordering.
    async fn run_open(
        &self,
        side: OrderSide,
        qty: f64,
        entry: f64,
        stop_loss: f64,
        take_profit: f64,
        book_flat: bool,
    ) -> Result<ActionResult, (BotError, u32)> {
        if !book_flat {
            return Err((
                BotError::PositionDesyncAfterOpen(
                    "open pre-check failed: book is not flat".into(),
                ),
                0,
            ));
        }

        let steps = qty / self.step_size;
        if qty <= 0.0 || (steps - steps.round()).abs() > 1e-6 {
            return Err((
                BotError::SymbolFilterRejected(format!(
                    "qty {qty} is not a multiple of step {}",
                    self.step_size
                )),
                0,
            ));
        }
        if qty * entry < self.min_notional {
            return Err((
                BotError::SymbolFilterRejected(format!(
                    "notional {:.4} below minimum {}",
                    qty * entry,
                    self.min_notional
                )),
                0,
            ));
        }
        let ordered = match side {
            OrderSide::Buy => stop_loss < entry && entry < take_profit,
            OrderSide::Sell => take_profit < entry && entry < stop_loss,
        };
        if !ordered {
            return Err((
                BotError::InvariantViolation(format!(
                    "SL/TP ordering violated for {side}: sl={stop_loss} entry={entry} tp={take_profit}"
                )),
                0,
            ));
        }

        let action = PlanAction::OpenPosition {
            side,
            qty_base: qty,
            entry_limit: entry,
            stop_loss,
            take_profit,
        };
        let request = OrderRequest {
            symbol: self.symbol.clone(),
            side,
            order_type: OrderType::Limit,
            qty,
            price: Some(entry),
            reduce_only: false,
            stop_loss: Some(stop_loss),
            take_profit: Some(take_profit),
        };

        self.bus.publish(Event::OrderSubmitted { action });
        let (order_id, attempts) = self
            .with_retries(|| self.exchange.create_order(&request))
            .await?;

        Ok(ActionResult {
            attempts,
            order_id: Some(order_id),
            detail: None,
        })
    }

    /// Positive delta adds in the current direction; negative delta trims
    /// reduce-only.
    async fn run_resize(
        &self,
        delta: f64,
        live: &Position,
    ) -> Result<ActionResult, (BotError, u32)> {
        let direction = match live.side {
            PositionSide::Long => OrderSide::Buy,
            PositionSide::Short => OrderSide::Sell,
            PositionSide::Flat => {
                return Err((
                    BotError::InvariantViolation("resize against a flat book".into()),
                    0,
                ))
            }
        };

        let (side, reduce_only) = if delta >= 0.0 {
            (direction, false)
        } else {
            let opposite = match direction {
                OrderSide::Buy => OrderSide::Sell,
                OrderSide::Sell => OrderSide::Buy,
            };
            (opposite, true)
        };

        let request = OrderRequest {
            symbol: self.symbol.clone(),
            side,
            order_type: OrderType::Market,
            qty: delta.abs(),
            price: None,
            reduce_only,
            stop_loss: None,
            take_profit: None,
        };

        self.bus.publish(Event::OrderSubmitted {
            action: PlanAction::ResizePosition { delta_base: delta },
        });
        let (order_id, attempts) = self
            .with_retries(|| self.exchange.create_order(&request))
            .await?;

        Ok(ActionResult {
            attempts,
            order_id: Some(order_id),
            detail: None,
        })
    }

    // -------------------------------------------------------------------------
    // Retry helper
    // -------------------------------------------------------------------------

    /// Run `op`, retrying transient failures after 1 s / 2 s / 4 s (plus
    /// jitter). Returns the payload with the number of attempts made, or the
    /// final error with the same count.
    async fn with_retries<T, F, Fut>(&self, op: F) -> Result<(T, u32), (BotError, u32)>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = BotResult<T>>,
    {
        let mut attempts = 0u32;
        let mut delays = RETRY_DELAYS_MS.iter();
        loop {
            attempts += 1;
            match op().await {
                Ok(value) => return Ok((value, attempts)),
                Err(e) if e.is_transient() => match delays.next() {
                    Some(&base_ms) => {
                        warn!(error = %e, attempt = attempts, "transient failure, backing off");
                        let delay = Duration::from_millis(base_ms)
                            + jitter(Duration::from_millis(base_ms / 4));
                        tokio::time::sleep(delay).await;
                    }
                    None => return Err((e, attempts)),
                },
                Err(e) => return Err((e, attempts)),
            }
        }
    }
}

impl std::fmt::Debug for OrderExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OrderExecutor")
            .field("symbol", &self.symbol)
            .field("step_size", &self.step_size)
            .field("min_notional", &self.min_notional)
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::notifier::{ChannelConfig, ChannelRole, Notifier};
    use crate::telegram::ChatTransport;
    use crate::types::Suggestion;
    use async_trait::async_trait;
    use parking_lot::Mutex as PlMutex;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct NullTransport;

    #[async_trait]
    impl ChatTransport for NullTransport {
        async fn send(&self, _chat_id: i64, _text: String) -> anyhow::Result<()> {
            Ok(())
        }
    }

    fn bus() -> EventBus {
        // A real notifier with a null transport; dropped handles are fine for
        // tests since publish never blocks.
        Notifier::start(
            &[ChannelConfig {
                name: "admin".into(),
                chat_id: 1,
                role: ChannelRole::Admin,
            }],
            Arc::new(NullTransport),
            1000,
            256,
        )
        .bus()
    }

    /// Exchange double with scripted failures and a simulated book.
    struct MockExchange {
        orders: PlMutex<Vec<OrderRequest>>,
        leverage_calls: PlMutex<Vec<u32>>,
        leverage_failures_left: PlMutex<u32>,
        position: PlMutex<Position>,
        close_fills: bool,
        inflight: AtomicU32,
        max_inflight: AtomicU32,
    }

    impl MockExchange {
        fn flat() -> Self {
            Self::with_position(Position::flat())
        }

        fn with_position(position: Position) -> Self {
            Self {
                orders: PlMutex::new(Vec::new()),
                leverage_calls: PlMutex::new(Vec::new()),
                leverage_failures_left: PlMutex::new(0),
                position: PlMutex::new(position),
                close_fills: true,
                inflight: AtomicU32::new(0),
                max_inflight: AtomicU32::new(0),
            }
        }
    }

    #[async_trait]
    impl Exchange for MockExchange {
        async fn get_ohlcv(
            &self,
            _s: &str,
            _t: crate::types::Timeframe,
            _l: usize,
        ) -> BotResult<Vec<crate::types::Bar>> {
            Ok(Vec::new())
        }

        async fn get_balance(&self) -> BotResult<f64> {
            Ok(1000.0)
        }

        async fn get_position(&self, _symbol: &str) -> BotResult<Position> {
            Ok(self.position.lock().clone())
        }

        async fn set_leverage(&self, _symbol: &str, leverage: u32) -> BotResult<()> {
            let mut failures = self.leverage_failures_left.lock();
            self.leverage_calls.lock().push(leverage);
            if *failures > 0 {
                *failures -= 1;
                return Err(BotError::TransientExchange("scripted 503".into()));
            }
            Ok(())
        }

        async fn create_order(&self, request: &OrderRequest) -> BotResult<String> {
            let current = self.inflight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_inflight.fetch_max(current, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(10)).await;
            self.inflight.fetch_sub(1, Ordering::SeqCst);

            self.orders.lock().push(request.clone());
            if request.reduce_only && request.order_type == OrderType::Market && self.close_fills {
                *self.position.lock() = Position::flat();
            }
            Ok(format!("order-{}", self.orders.lock().len()))
        }

        async fn cancel_order(&self, _symbol: &str, _order_id: &str) -> BotResult<()> {
            Ok(())
        }
    }

    fn executor(exchange: Arc<MockExchange>) -> OrderExecutor {
        OrderExecutor::new(exchange, bus(), "BTCUSDT", 0.001, 1.0)
    }

    fn buy_signal() -> TradingSignal {
        TradingSignal {
            position_suggestion: Suggestion::Buy,
            entry_price: Some(60_000.0),
            stop_loss: Some(59_400.0),
            take_profit1: Some(61_200.0),
            take_profit2: None,
            take_profit3: None,
            leverage: 5,
            position_size_pct: 20.0,
            auto_trading_enabled: true,
        }
    }

    fn open_action() -> PlanAction {
        PlanAction::OpenPosition {
            side: OrderSide::Buy,
            qty_base: 0.016,
            entry_limit: 60_000.0,
            stop_loss: 59_400.0,
            take_profit: 61_200.0,
        }
    }

    fn long_position(size: f64, leverage: u32) -> Position {
        Position {
            side: PositionSide::Long,
            size_base: size,
            leverage,
            entry_price: 59_000.0,
            mark_price: 59_500.0,
            unrealized_pnl: 0.0,
            liq_price: None,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn cold_start_plan_executes_in_order() {
        let exchange = Arc::new(MockExchange::flat());
        let exec = executor(exchange.clone());

        let plan = vec![PlanAction::SetLeverage { leverage: 5 }, open_action()];
        let record = exec
            .execute_plan(plan, buy_signal(), TriggerKind::Auto, &Position::flat())
            .await;

        assert_eq!(record.outcomes.len(), 2);
        assert!(record.outcomes.iter().all(|o| o.ok));
        assert_eq!(*exchange.leverage_calls.lock(), vec![5]);

        let orders = exchange.orders.lock();
        assert_eq!(orders.len(), 1);
        assert_eq!(orders[0].order_type, OrderType::Limit);
        assert_eq!(orders[0].stop_loss, Some(59_400.0));
        assert_eq!(orders[0].take_profit, Some(61_200.0));
        assert!(!orders[0].reduce_only);
    }

    #[tokio::test(start_paused = true)]
    async fn set_leverage_is_idempotent() {
        let exchange = Arc::new(MockExchange::with_position(long_position(0.0, 5)));
        let exec = executor(exchange.clone());

        // Matching leverage on the book: zero exchange calls.
        let record = exec
            .execute_plan(
                vec![PlanAction::SetLeverage { leverage: 5 }],
                buy_signal(),
                TriggerKind::Manual,
                &long_position(0.016, 5),
            )
            .await;
        assert!(record.outcomes[0].ok);
        assert_eq!(record.outcomes[0].attempts, 0);
        assert!(exchange.leverage_calls.lock().is_empty());

        // Twice in a row: exactly one exchange call.
        let record = exec
            .execute_plan(
                vec![
                    PlanAction::SetLeverage { leverage: 7 },
                    PlanAction::SetLeverage { leverage: 7 },
                ],
                buy_signal(),
                TriggerKind::Manual,
                &long_position(0.016, 5),
            )
            .await;
        assert!(record.outcomes.iter().all(|o| o.ok));
        assert_eq!(exchange.leverage_calls.lock().len(), 1);
    }

    // S6: transient failure mid-plan, one record, no duplicate orders.
    #[tokio::test(start_paused = true)]
    async fn transient_mid_plan_failure_retries_and_completes() {
        let exchange = Arc::new(MockExchange::with_position(long_position(0.016, 3)));
        *exchange.leverage_failures_left.lock() = 2;
        let exec = executor(exchange.clone());

        let plan = vec![
            PlanAction::ClosePosition,
            PlanAction::SetLeverage { leverage: 5 },
            open_action(),
        ];
        let record = exec
            .execute_plan(plan, buy_signal(), TriggerKind::Auto, &long_position(0.016, 3))
            .await;

        assert_eq!(record.outcomes.len(), 3);
        assert!(record.outcomes.iter().all(|o| o.ok));
        assert_eq!(record.outcomes[0].attempts, 1);
        assert_eq!(record.outcomes[1].attempts, 3, "two 503s then success");
        assert_eq!(record.outcomes[2].attempts, 1);

        // One close order + one open order; the leverage retries created no
        // duplicate orders.
        assert_eq!(exchange.orders.lock().len(), 2);
        assert_eq!(exchange.leverage_calls.lock().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn close_timeout_aborts_plan() {
        let mut mock = MockExchange::with_position(long_position(0.016, 5));
        mock.close_fills = false; // position never goes flat
        let exchange = Arc::new(mock);
        let exec = executor(exchange.clone());

        let plan = vec![PlanAction::ClosePosition, open_action()];
        let record = exec
            .execute_plan(plan, buy_signal(), TriggerKind::Auto, &long_position(0.016, 5))
            .await;

        assert_eq!(record.outcomes.len(), 1, "open is never attempted");
        assert!(!record.outcomes[0].ok);
        assert!(record.outcomes[0]
            .detail
            .as_deref()
            .unwrap()
            .contains("not flat"));
        // Only the close order went out.
        assert_eq!(exchange.orders.lock().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn permanent_failure_fails_fast() {
        struct BrokeExchange(MockExchange);

        #[async_trait]
        impl Exchange for BrokeExchange {
            async fn get_ohlcv(
                &self,
                s: &str,
                t: crate::types::Timeframe,
                l: usize,
            ) -> BotResult<Vec<crate::types::Bar>> {
                self.0.get_ohlcv(s, t, l).await
            }
            async fn get_balance(&self) -> BotResult<f64> {
                self.0.get_balance().await
            }
            async fn get_position(&self, s: &str) -> BotResult<Position> {
                self.0.get_position(s).await
            }
            async fn set_leverage(&self, s: &str, l: u32) -> BotResult<()> {
                self.0.set_leverage(s, l).await
            }
            async fn create_order(&self, _r: &OrderRequest) -> BotResult<String> {
                Err(BotError::InsufficientMargin("scripted 110007".into()))
            }
            async fn cancel_order(&self, s: &str, o: &str) -> BotResult<()> {
                self.0.cancel_order(s, o).await
            }
        }

        let exchange = Arc::new(BrokeExchange(MockExchange::flat()));
        let exec = OrderExecutor::new(exchange, bus(), "BTCUSDT", 0.001, 1.0);

        let record = exec
            .execute_plan(
                vec![PlanAction::SetLeverage { leverage: 5 }, open_action()],
                buy_signal(),
                TriggerKind::Auto,
                &Position::flat(),
            )
            .await;

        assert_eq!(record.outcomes.len(), 2);
        assert!(record.outcomes[0].ok);
        assert!(!record.outcomes[1].ok);
        assert_eq!(record.outcomes[1].attempts, 1, "no retry on permanent error");
    }

    #[tokio::test(start_paused = true)]
    async fn open_prechecks_reject_bad_levels_without_submitting() {
        let exchange = Arc::new(MockExchange::flat());
        let exec = executor(exchange.clone());

        // SL above entry on a BUY.
        let bad = PlanAction::OpenPosition {
            side: OrderSide::Buy,
            qty_base: 0.016,
            entry_limit: 60_000.0,
            stop_loss: 60_600.0,
            take_profit: 61_200.0,
        };
        let record = exec
            .execute_plan(vec![bad], buy_signal(), TriggerKind::Auto, &Position::flat())
            .await;
        assert!(!record.outcomes[0].ok);
        assert!(exchange.orders.lock().is_empty());

        // Notional below the minimum.
        let tiny = PlanAction::OpenPosition {
            side: OrderSide::Buy,
            qty_base: 0.001,
            entry_limit: 500.0,
            stop_loss: 495.0,
            take_profit: 510.0,
        };
        let record = exec
            .execute_plan(vec![tiny], buy_signal(), TriggerKind::Auto, &Position::flat())
            .await;
        assert!(!record.outcomes[0].ok);
        assert!(exchange.orders.lock().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn resize_direction_and_reduce_only_flags() {
        let exchange = Arc::new(MockExchange::with_position(long_position(0.010, 5)));
        let exec = executor(exchange.clone());
        let live = long_position(0.010, 5);

        // Add-on: same direction, not reduce-only.
        exec.execute_plan(
            vec![PlanAction::ResizePosition { delta_base: 0.006 }],
            buy_signal(),
            TriggerKind::Auto,
            &live,
        )
        .await;
        // Trim: opposite direction, reduce-only.
        exec.execute_plan(
            vec![PlanAction::ResizePosition { delta_base: -0.004 }],
            buy_signal(),
            TriggerKind::Auto,
            &live,
        )
        .await;

        let orders = exchange.orders.lock();
        assert_eq!(orders.len(), 2);
        assert_eq!(orders[0].side, OrderSide::Buy);
        assert!(!orders[0].reduce_only);
        assert!((orders[0].qty - 0.006).abs() < 1e-12);
        assert_eq!(orders[1].side, OrderSide::Sell);
        assert!(orders[1].reduce_only);
        assert!((orders[1].qty - 0.004).abs() < 1e-12);
    }

    #[tokio::test(start_paused = true)]
    async fn exec_lock_serializes_concurrent_plans() {
        let exchange = Arc::new(MockExchange::flat());
        let exec = Arc::new(executor(exchange.clone()));

        let mut handles = Vec::new();
        for _ in 0..4 {
            let exec = exec.clone();
            handles.push(tokio::spawn(async move {
                exec.execute_plan(
                    vec![PlanAction::SetLeverage { leverage: 5 }, open_action()],
                    buy_signal(),
                    TriggerKind::Auto,
                    &Position::flat(),
                )
                .await
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(
            exchange.max_inflight.load(Ordering::SeqCst),
            1,
            "no two plans may touch the exchange concurrently"
        );
    }
}
