// =============================================================================
// Meridian — autonomous BTC/USDT derivatives trading agent
// =============================================================================
//
// Startup order: config, exchange auth probe, notifier, pipeline, scheduler,
// command loop. The engine exits 0 on a clean stop, 1 on config/startup
// failure, and 2 on an unrecoverable exchange auth failure.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod advisor;
mod app_state;
mod commands;
mod config;
mod error;
mod events;
mod exchange;
mod executor;
mod indicators;
mod llm;
mod market_data;
mod notifier;
mod pipeline;
mod policy;
mod reconciler;
mod scheduler;
mod store;
mod telegram;
mod types;

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{watch, Notify};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::advisor::AdvisorGateway;
use crate::app_state::AppState;
use crate::commands::CommandContext;
use crate::config::AppConfig;
use crate::error::BotError;
use crate::exchange::{BybitClient, Exchange};
use crate::executor::OrderExecutor;
use crate::llm::LlmClient;
use crate::notifier::{ChannelConfig, ChannelRole, Notifier};
use crate::pipeline::Pipeline;
use crate::policy::SignalPolicy;
use crate::scheduler::Scheduler;
use crate::store::AnalysisStore;
use crate::telegram::TelegramClient;

/// Grace window for in-flight analyses and notifier flush on shutdown.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

const EXIT_OK: i32 = 0;
const EXIT_STARTUP_FAILURE: i32 = 1;
const EXIT_AUTH_FAILURE: i32 = 2;

#[tokio::main]
async fn main() {
    std::process::exit(run().await);
}

async fn run() -> i32 {
    // ── 1. Environment & logging ─────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("╔══════════════════════════════════════════════════════════╗");
    info!("║            Meridian Trading Engine — Starting             ║");
    info!("╚══════════════════════════════════════════════════════════╝");

    // ── 2. Configuration ─────────────────────────────────────────────────
    let config_path =
        std::env::var("MERIDIAN_CONFIG").unwrap_or_else(|_| "config.json".to_string());
    let config = match AppConfig::load(&config_path) {
        Ok(config) => config,
        Err(e) if e.downcast_ref::<BotError>().is_some_and(BotError::is_fatal) => {
            error!(error = %e, "config is corrupt");
            return EXIT_STARTUP_FAILURE;
        }
        Err(e) => {
            warn!(path = %config_path, error = %e, "config not loaded, using defaults");
            AppConfig::default()
        }
    };
    let tz = match config.tz() {
        Ok(tz) => tz,
        Err(e) => {
            error!(error = %e, "invalid timezone");
            return EXIT_STARTUP_FAILURE;
        }
    };

    let api_key = std::env::var("BYBIT_API_KEY").unwrap_or_default();
    let api_secret = std::env::var("BYBIT_API_SECRET").unwrap_or_default();
    let advisor_key = std::env::var("OPENAI_API_KEY").unwrap_or_default();
    let bot_token = std::env::var("TELEGRAM_BOT_TOKEN").unwrap_or_default();
    if api_key.is_empty() || api_secret.is_empty() {
        error!("BYBIT_API_KEY / BYBIT_API_SECRET are not set");
        return EXIT_STARTUP_FAILURE;
    }
    if advisor_key.is_empty() {
        error!("OPENAI_API_KEY is not set");
        return EXIT_STARTUP_FAILURE;
    }
    if bot_token.is_empty() {
        error!("TELEGRAM_BOT_TOKEN is not set");
        return EXIT_STARTUP_FAILURE;
    }

    info!(
        symbol = %config.symbol,
        timezone = %config.timezone,
        testnet = config.testnet,
        enable_15m = config.enable_15m,
        "engine configured"
    );

    // ── 3. Store ─────────────────────────────────────────────────────────
    let store = match AnalysisStore::open(&config.data_dir) {
        Ok(store) => store,
        Err(e) => {
            error!(error = %e, "failed to open analysis store");
            return EXIT_STARTUP_FAILURE;
        }
    };

    // ── 4. Exchange client + auth probe ──────────────────────────────────
    let exchange: Arc<dyn Exchange> =
        Arc::new(BybitClient::new(api_key, api_secret, config.testnet));
    match exchange.get_balance().await {
        Ok(equity) => info!(equity, "exchange reachable"),
        Err(e) if e.is_fatal() => {
            error!(error = %e, "exchange auth failure");
            return EXIT_AUTH_FAILURE;
        }
        Err(e) => warn!(error = %e, "exchange probe failed, continuing"),
    }

    // ── 5. Notifier channels ─────────────────────────────────────────────
    let telegram = TelegramClient::new(bot_token);
    let mut channels = vec![ChannelConfig {
        name: "admin".to_string(),
        chat_id: config.telegram.admin_chat_id,
        role: ChannelRole::Admin,
    }];
    for (i, chat_id) in config.telegram.notify_chat_ids.iter().enumerate() {
        channels.push(ChannelConfig {
            name: format!("notify-{i}"),
            chat_id: *chat_id,
            role: ChannelRole::NotifyOnly,
        });
    }
    let notifier = Notifier::start(
        &channels,
        Arc::new(telegram.clone()),
        config.rate_limit_per_channel,
        config.channel_queue_cap,
    );

    // ── 6. Policy, state, pipeline ───────────────────────────────────────
    let policy = SignalPolicy::new(&config, tz);
    policy.seed_from_history(&store.recent_trades(64), Utc::now());

    let state = Arc::new(AppState::new(
        config.clone(),
        tz,
        store,
        policy,
        notifier.bus(),
    ));

    let advisor_transport = Arc::new(LlmClient::new(&config.advisor, advisor_key));
    let advisor = AdvisorGateway::new(
        advisor_transport,
        config.symbol.clone(),
        config.profit_targets.clone(),
    );
    let executor = OrderExecutor::new(
        exchange.clone(),
        state.bus.clone(),
        config.symbol.clone(),
        config.step_size,
        config.min_notional,
    );
    let pipeline = Arc::new(Pipeline::new(
        state.clone(),
        exchange.clone(),
        advisor,
        executor,
    ));

    // ── 7. Scheduler ─────────────────────────────────────────────────────
    let scheduler = Arc::new(Scheduler::new(pipeline, tz));
    scheduler.start(config.enable_15m);

    // ── 8. Command loop ──────────────────────────────────────────────────
    let stop_requested = Arc::new(Notify::new());
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let command_ctx = CommandContext {
        state: state.clone(),
        scheduler: scheduler.clone(),
        exchange: exchange.clone(),
        stop_requested: stop_requested.clone(),
    };
    let command_loop = tokio::spawn(commands::run_command_loop(
        command_ctx,
        telegram,
        shutdown_rx,
    ));

    info!("all subsystems running");

    // ── 9. Wait for shutdown ─────────────────────────────────────────────
    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("ctrl-c received"),
        _ = stop_requested.notified() => info!("stop requested by operator"),
    }

    // ── 10. Graceful drain ───────────────────────────────────────────────
    warn!("shutting down: draining in-flight work");
    scheduler.stop();
    let _ = shutdown_tx.send(true);
    scheduler.drain(SHUTDOWN_GRACE).await;
    command_loop.abort();
    notifier.shutdown(SHUTDOWN_GRACE).await;

    info!("meridian shut down complete");
    EXIT_OK
}
