// =============================================================================
// Kestrel — Main Entry Point
// =============================================================================
//
// Listing sniper with autonomous position liquidation: every acquisition fill
// is handed to an exit strategy that sells it back out through take-profit,
// stop-loss, trailing-stop, and time-limit rules. Open strategies survive a
// restart through the position store.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod acquisition;
mod api;
mod app_state;
mod config;
mod exit;
mod liquidation;
mod monitor;
mod notifier;
mod registry;
mod store;
mod strategy;
mod types;
mod venue;

use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::app_state::AppState;
use crate::config::RuntimeConfig;
use crate::notifier::Notifier;
use crate::registry::StrategyRegistry;
use crate::store::PositionStore;
use crate::venue::MexcClient;

const CONFIG_FILE: &str = "kestrel_config.json";

/// Grace period for in-flight liquidations after Ctrl+C.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(3);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("╔══════════════════════════════════════════════════════════╗");
    info!("║              Kestrel — Starting Up                       ║");
    info!("╚══════════════════════════════════════════════════════════╝");

    let config = RuntimeConfig::load(CONFIG_FILE).unwrap_or_else(|e| {
        warn!(error = %e, "failed to load config, using defaults");
        RuntimeConfig::default()
    });

    info!(
        take_profit_pct = config.exit_defaults.take_profit_pct,
        stop_loss_pct = config.exit_defaults.stop_loss_pct,
        trailing_offset_pct = config.exit_defaults.trailing_offset_pct,
        time_based_sell_minutes = config.exit_defaults.time_based_sell_minutes,
        poll_interval_ms = config.poll_interval_ms,
        "exit defaults"
    );

    // ── 2. Venue client ──────────────────────────────────────────────────
    let api_key = std::env::var("MEXC_API_KEY").unwrap_or_default();
    let api_secret = std::env::var("MEXC_API_SECRET").unwrap_or_default();
    if api_key.is_empty() || api_secret.is_empty() {
        warn!("MEXC_API_KEY / MEXC_API_SECRET not set — signed requests will fail");
    }
    let gateway = Arc::new(MexcClient::new(api_key, api_secret));

    // ── 3. Durable store & shared state ──────────────────────────────────
    let store = PositionStore::open(&config.data_dir)?;
    let rate_limit = gateway.rate_limit();
    let state = Arc::new(
        AppState::new(
            config,
            StrategyRegistry::new(),
            store,
            gateway,
            Notifier::from_env(),
        )
        .with_rate_limit(rate_limit),
    );

    // ── 4. Rehydrate open strategies from the store ──────────────────────
    let restored = state.store.load_open();
    let restored_count = restored.len();
    for strategy in restored {
        let id = strategy.id.clone();
        state.registry.insert_restored(strategy);
        tokio::spawn(monitor::run_monitor(Arc::clone(&state), id));
    }
    if restored_count > 0 {
        info!(count = restored_count, "open strategies rehydrated, monitors resumed");
    }

    // ── 5. Start the API server ──────────────────────────────────────────
    let api_state = Arc::clone(&state);
    let bind_addr =
        std::env::var("KESTREL_BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:3001".into());
    let bind_addr_clone = bind_addr.clone();

    tokio::spawn(async move {
        let app = api::rest::router(api_state);
        let listener = tokio::net::TcpListener::bind(&bind_addr_clone)
            .await
            .expect("Failed to bind API server");
        info!(addr = %bind_addr_clone, "API server listening");
        axum::serve(listener, app)
            .await
            .expect("API server failed");
    });

    // ── 6. Optional snipe from environment (KESTREL_SNIPE=SYMBOL[:QUOTE]) ─
    if let Ok(target) = std::env::var("KESTREL_SNIPE") {
        let (symbol, quote_amount) = match target.split_once(':') {
            Some((sym, amount)) => (
                sym.trim().to_uppercase(),
                amount.trim().parse::<f64>().ok(),
            ),
            None => (target.trim().to_uppercase(), None),
        };
        let quote_amount =
            quote_amount.unwrap_or_else(|| state.config.read().default_quote_amount);

        if !symbol.is_empty() {
            info!(symbol, quote_amount, "env-configured snipe scheduled");
            let snipe_state = Arc::clone(&state);
            tokio::spawn(async move {
                if let Err(e) =
                    acquisition::run_snipe(Arc::clone(&snipe_state), symbol.clone(), quote_amount)
                        .await
                {
                    error!(symbol, error = %format!("{e:#}"), "env-configured snipe failed");
                    snipe_state.push_error("snipe", format!("{e:#}"));
                }
            });
        }
    }

    info!("All subsystems running. Press Ctrl+C to stop.");

    // ── 7. Graceful shutdown ─────────────────────────────────────────────
    tokio::signal::ctrl_c().await?;
    warn!("Shutdown signal received — stopping gracefully");

    state.begin_shutdown();
    // Let monitors observe the flag and in-flight liquidations settle.
    tokio::time::sleep(SHUTDOWN_GRACE).await;

    if let Err(e) = state.config.read().save(CONFIG_FILE) {
        error!(error = %format!("{e:#}"), "failed to save runtime config on shutdown");
    }

    let open = state.registry.list_active().len();
    if open > 0 {
        info!(open, "open strategies persisted — they resume on next start");
    }
    info!("Kestrel shut down complete.");
    Ok(())
}
