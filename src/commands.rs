// =============================================================================
// Operator command surface — admin chat in, acknowledgements out
// =============================================================================
//
// Commands arrive from the admin chat only; every reply goes back through the
// event bus as a CommandAck, which only the admin channel receives. Read-only
// commands never touch the pipeline; `/analyze` and `/trade` go through the
// scheduler so single-flight still holds.
// =============================================================================

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{watch, Notify};
use tracing::{info, warn};

use crate::app_state::AppState;
use crate::events::Event;
use crate::exchange::Exchange;
use crate::scheduler::Scheduler;
use crate::telegram::TelegramClient;
use crate::types::Timeframe;

const HELP: &str = "commands: /status /balance /position /price /analyze <tf> /last [tf] /trade /stop";

/// Everything a command can touch.
pub struct CommandContext {
    pub state: Arc<AppState>,
    pub scheduler: Arc<Scheduler>,
    pub exchange: Arc<dyn Exchange>,
    /// Signalled by `/stop`; main waits on it alongside ctrl-c.
    pub stop_requested: Arc<Notify>,
}

/// Dispatch one command line and produce the acknowledgement text.
pub async fn handle_command(ctx: &CommandContext, line: &str) -> String {
    let mut parts = line.split_whitespace();
    let command = parts.next().unwrap_or("");
    let argument = parts.next();

    match command {
        "/status" => status_text(ctx),
        "/balance" => match ctx.exchange.get_balance().await {
            Ok(equity) => format!("equity: {equity:.2} USDT"),
            Err(e) => format!("balance unavailable: {e}"),
        },
        "/position" => match ctx.exchange.get_position(&ctx.state.config.symbol).await {
            Ok(p) if p.is_flat() => "position: FLAT".to_string(),
            Ok(p) => format!(
                "position: {} {:.4} @ {:.2} ({}x)\nmark {:.2}, uPnL {:.2}{}",
                p.side,
                p.size_base,
                p.entry_price,
                p.leverage,
                p.mark_price,
                p.unrealized_pnl,
                p.liq_price
                    .map(|lp| format!(", liq {lp:.2}"))
                    .unwrap_or_default()
            ),
            Err(e) => format!("position unavailable: {e}"),
        },
        "/price" => match ctx.state.status_snapshot() {
            Some(snapshot) => format!(
                "{}: {:.2} ({} window)",
                ctx.state.config.symbol, snapshot.last_price, snapshot.timeframe
            ),
            None => "no market data pulled yet".to_string(),
        },
        "/analyze" => {
            let Some(tf) = argument.and_then(Timeframe::parse) else {
                return "usage: /analyze <15m|1h|4h|1d>".to_string();
            };
            match ctx.scheduler.trigger_analysis(tf) {
                Ok(()) => format!("{tf} analysis triggered"),
                Err(reason) => format!("not triggered: {reason}"),
            }
        }
        "/last" => {
            let tf = argument.and_then(Timeframe::parse).unwrap_or(Timeframe::Final);
            match ctx.state.store.get(tf) {
                Some(analysis) => {
                    let signal = &analysis.trading_signals;
                    format!(
                        "[{tf}] {} (confidence {:.0}, trend {:.0}), generated_at {}",
                        signal.position_suggestion,
                        analysis.confidence,
                        analysis.trend_strength,
                        analysis.generated_at
                    )
                }
                None => format!("no {tf} analysis stored yet"),
            }
        }
        "/trade" => match ctx.scheduler.trigger_trade() {
            Ok(()) => "combined pipeline triggered".to_string(),
            Err(reason) => format!("not triggered: {reason}"),
        },
        "/stop" => {
            ctx.stop_requested.notify_one();
            "shutting down".to_string()
        }
        _ => HELP.to_string(),
    }
}

fn status_text(ctx: &CommandContext) -> String {
    let lifecycle = ctx.scheduler.lifecycle();
    let trades_today = ctx.state.policy.trades_today(Utc::now());
    let uptime_mins = ctx.state.started_at.elapsed().as_secs() / 60;
    let last_4h = ctx
        .scheduler
        .last_fired(Timeframe::H4)
        .map(|t| t.format("%H:%M").to_string())
        .unwrap_or_else(|| "never".into());

    match ctx.state.status_snapshot() {
        Some(snapshot) => {
            let rsi = snapshot
                .rsi_14
                .map(|v| format!("{v:.1}"))
                .unwrap_or_else(|| "n/a".into());
            let macd = snapshot
                .macd
                .map(|m| format!("{:.2}/{:.2}", m.macd, m.signal))
                .unwrap_or_else(|| "n/a".into());
            format!(
                "{} {} | price {:.2} | RSI {} | MACD {} | {}\n\
                 trades today: {trades_today} | last 4h fire: {last_4h} | up {uptime_mins}m",
                ctx.state.config.symbol,
                lifecycle,
                snapshot.last_price,
                rsi,
                macd,
                snapshot.trend_flags().join(", "),
            )
        }
        None => format!(
            "{} {} | no market data yet\n\
             trades today: {trades_today} | last 4h fire: {last_4h} | up {uptime_mins}m",
            ctx.state.config.symbol, lifecycle
        ),
    }
}

/// Long-poll the admin chat and dispatch commands until shutdown.
pub async fn run_command_loop(
    ctx: CommandContext,
    telegram: TelegramClient,
    mut shutdown: watch::Receiver<bool>,
) {
    let admin_chat = ctx.state.config.telegram.admin_chat_id;
    let mut offset = 0i64;

    loop {
        if *shutdown.borrow() {
            break;
        }
        let updates = tokio::select! {
            updates = telegram.get_updates(offset, 30) => updates,
            result = shutdown.changed() => {
                if result.is_err() {
                    break;
                }
                continue;
            }
        };

        let updates = match updates {
            Ok(updates) => updates,
            Err(e) => {
                warn!(error = %e, "getUpdates failed, backing off");
                tokio::time::sleep(std::time::Duration::from_secs(5)).await;
                continue;
            }
        };

        for update in updates {
            offset = offset.max(update.update_id + 1);
            if update.chat_id != admin_chat {
                warn!(chat_id = update.chat_id, "command from non-admin chat ignored");
                continue;
            }
            info!(command = %update.text, "operator command received");
            let reply = handle_command(&ctx, &update.text).await;
            ctx.state.bus.publish(Event::CommandAck { text: reply });
        }
    }
    info!("command loop exited");
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::error::BotResult;
    use crate::exchange::OrderRequest;
    use crate::notifier::{ChannelConfig, ChannelRole, Notifier};
    use crate::pipeline::PipelineRunner;
    use crate::policy::SignalPolicy;
    use crate::store::AnalysisStore;
    use crate::telegram::ChatTransport;
    use crate::types::{Bar, Position, PositionSide, TriggerKind};
    use async_trait::async_trait;
    use uuid::Uuid;

    struct NullChat;

    #[async_trait]
    impl ChatTransport for NullChat {
        async fn send(&self, _chat_id: i64, _text: String) -> anyhow::Result<()> {
            Ok(())
        }
    }

    struct NoopRunner;

    #[async_trait]
    impl PipelineRunner for NoopRunner {
        async fn run_timeframe(
            &self,
            _tf: Timeframe,
            _trigger: TriggerKind,
        ) -> BotResult<()> {
            Ok(())
        }
        async fn run_final(&self, _trigger: TriggerKind) -> BotResult<()> {
            Ok(())
        }
    }

    struct StaticExchange;

    #[async_trait]
    impl Exchange for StaticExchange {
        async fn get_ohlcv(&self, _s: &str, _t: Timeframe, _l: usize) -> BotResult<Vec<Bar>> {
            Ok(Vec::new())
        }
        async fn get_balance(&self) -> BotResult<f64> {
            Ok(1234.5)
        }
        async fn get_position(&self, _symbol: &str) -> BotResult<Position> {
            Ok(Position {
                side: PositionSide::Long,
                size_base: 0.016,
                leverage: 5,
                entry_price: 60_000.0,
                mark_price: 60_500.0,
                unrealized_pnl: 8.0,
                liq_price: Some(49_000.0),
            })
        }
        async fn set_leverage(&self, _s: &str, _l: u32) -> BotResult<()> {
            Ok(())
        }
        async fn create_order(&self, _r: &OrderRequest) -> BotResult<String> {
            Ok("x".into())
        }
        async fn cancel_order(&self, _s: &str, _o: &str) -> BotResult<()> {
            Ok(())
        }
    }

    fn context() -> CommandContext {
        let config = AppConfig::default();
        let tz = config.tz().unwrap();
        let dir = std::env::temp_dir().join(format!("meridian-cmd-{}", Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let store = AnalysisStore::open(&dir).unwrap();
        let policy = SignalPolicy::new(&config, tz);
        let notifier = Notifier::start(
            &[ChannelConfig {
                name: "admin".into(),
                chat_id: 1,
                role: ChannelRole::Admin,
            }],
            Arc::new(NullChat),
            1000,
            256,
        );
        let state = Arc::new(AppState::new(config, tz, store, policy, notifier.bus()));
        let scheduler = Arc::new(Scheduler::new(Arc::new(NoopRunner), tz));
        scheduler.start(false);
        CommandContext {
            state,
            scheduler,
            exchange: Arc::new(StaticExchange),
            stop_requested: Arc::new(Notify::new()),
        }
    }

    #[tokio::test]
    async fn balance_and_position_read_out() {
        let ctx = context();
        assert_eq!(handle_command(&ctx, "/balance").await, "equity: 1234.50 USDT");
        let position = handle_command(&ctx, "/position").await;
        assert!(position.contains("LONG 0.0160 @ 60000.00 (5x)"));
        assert!(position.contains("liq 49000.00"));
    }

    #[tokio::test]
    async fn analyze_requires_valid_timeframe() {
        let ctx = context();
        assert!(handle_command(&ctx, "/analyze").await.starts_with("usage"));
        assert!(handle_command(&ctx, "/analyze 2h").await.starts_with("usage"));
        assert_eq!(
            handle_command(&ctx, "/analyze 1h").await,
            "1h analysis triggered"
        );
    }

    #[tokio::test]
    async fn last_defaults_to_final_and_reports_missing() {
        let ctx = context();
        assert_eq!(
            handle_command(&ctx, "/last").await,
            "no final analysis stored yet"
        );
        assert_eq!(
            handle_command(&ctx, "/last 4h").await,
            "no 4h analysis stored yet"
        );
    }

    #[tokio::test]
    async fn unknown_command_prints_help() {
        let ctx = context();
        assert_eq!(handle_command(&ctx, "/wat").await, HELP);
    }

    #[tokio::test]
    async fn stop_signals_shutdown() {
        let ctx = context();
        let notified = ctx.stop_requested.clone();
        let wait = tokio::spawn(async move { notified.notified().await });
        assert_eq!(handle_command(&ctx, "/stop").await, "shutting down");
        wait.await.unwrap();
    }

    #[tokio::test]
    async fn status_works_without_market_data() {
        let ctx = context();
        let status = handle_command(&ctx, "/status").await;
        assert!(status.contains("no market data yet"));
        assert!(status.contains("trades today: 0"));
    }
}
