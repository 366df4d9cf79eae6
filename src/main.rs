// =============================================================================
// Paperbot — paper-trading engine for perpetual futures
// =============================================================================
//
// Wiring order: env + logging, session config (file + env overrides),
// strategy build (parameter validation), store, market data, engine, bot.
//
// Exit codes: 0 clean shutdown, 1 unrecoverable initialization error,
// 2 invalid configuration.
// =============================================================================

use std::sync::Arc;

use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use paperbot::bot::TradingBot;
use paperbot::clock::SystemClock;
use paperbot::config::SessionConfig;
use paperbot::harness::StrategyHarness;
use paperbot::market_data::dydx::DydxClient;
use paperbot::notifier::Notifier;
use paperbot::paper_engine::PaperEngine;
use paperbot::store::Store;
use paperbot::strategy;

const EXIT_INIT_ERROR: i32 = 1;
const EXIT_INVALID_ARGS: i32 = 2;

#[tokio::main]
async fn main() {
    // ── 1. Environment & logging ─────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("╔══════════════════════════════════════════════════════════╗");
    info!("║        Paperbot — Paper Trading Engine                   ║");
    info!("╚══════════════════════════════════════════════════════════╝");

    // ── 2. Session configuration ─────────────────────────────────────────
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "session_config.json".to_string());

    let mut config = if std::path::Path::new(&config_path).exists() {
        match SessionConfig::load(&config_path) {
            Ok(config) => config,
            Err(e) => {
                error!(path = %config_path, error = %e, "invalid session config");
                std::process::exit(EXIT_INVALID_ARGS);
            }
        }
    } else {
        warn!(path = %config_path, "no config file found, using defaults");
        SessionConfig::default()
    };
    config.apply_env_overrides();

    let resolved = match config.resolve() {
        Ok(resolved) => resolved,
        Err(e) => {
            error!(error = %e, "invalid session parameters");
            std::process::exit(EXIT_INVALID_ARGS);
        }
    };

    // ── 3. Strategy (parameter schema validated here) ────────────────────
    let strategy = match strategy::build_strategy(&resolved.strategy, &resolved.strategy_params) {
        Ok(strategy) => strategy,
        Err(e) => {
            error!(strategy = %resolved.strategy, error = %e, "strategy setup refused");
            std::process::exit(EXIT_INVALID_ARGS);
        }
    };

    // ── 4. Store ─────────────────────────────────────────────────────────
    if let Some(parent) = std::path::Path::new(&resolved.db_path).parent() {
        if !parent.as_os_str().is_empty() {
            if let Err(e) = std::fs::create_dir_all(parent) {
                error!(path = %parent.display(), error = %e, "cannot create data directory");
                std::process::exit(EXIT_INIT_ERROR);
            }
        }
    }
    let store = match Store::open(&resolved.db_path) {
        Ok(store) => Arc::new(store),
        Err(e) => {
            error!(path = %resolved.db_path, error = %e, "database unreachable");
            std::process::exit(EXIT_INIT_ERROR);
        }
    };

    // ── 5. Engine plumbing ───────────────────────────────────────────────
    let market = Arc::new(DydxClient::new());
    let clock = Arc::new(SystemClock::new());
    let notifier = Arc::new(Notifier::from_env());

    let engine = match PaperEngine::new(
        store.clone(),
        market.clone(),
        clock.clone(),
        notifier,
        &resolved.account,
        resolved.balance,
        resolved.leverage,
        resolved.slippage_percent,
    ) {
        Ok(engine) => Arc::new(engine),
        Err(e) => {
            error!(error = %e, "engine initialization failed");
            std::process::exit(EXIT_INIT_ERROR);
        }
    };

    let harness = StrategyHarness::new(strategy, market, clock.clone(), store);

    // ── 6. Shutdown wiring ───────────────────────────────────────────────
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, finishing current tick");
            let _ = shutdown_tx.send(true);
        }
    });

    // ── 7. Run the session ───────────────────────────────────────────────
    let bot = match TradingBot::new(engine, harness, resolved, clock, shutdown_rx).await {
        Ok(bot) => bot,
        Err(e) => {
            error!(error = %e, "session setup failed");
            std::process::exit(EXIT_INIT_ERROR);
        }
    };

    let end_reason = bot.run().await;
    info!(end_reason = %end_reason, "paperbot shut down");
}
