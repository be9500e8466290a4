// =============================================================================
// Acquisition — listing snipe loop and strategy creation on fill
// =============================================================================
//
// A snipe hammers market buys at a configured cadence until the listing
// becomes tradable or the attempt budget is exhausted. The venue rejects
// orders for symbols that are not trading yet, so "not tradable" and "buy
// attempt" are the same call.
//
// Every confirmed buy fill opens its own exit strategy; fills are never
// merged into an existing strategy for the same symbol.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use tracing::{info, warn};
use uuid::Uuid;

use crate::app_state::AppState;
use crate::strategy::StrategyConfig;
use crate::types::{EventType, LifecycleEvent};
use crate::venue::VenueError;

/// Attempt to buy `quote_amount` of `symbol` as soon as it starts trading.
///
/// Returns the id of the newly opened strategy on success.
pub async fn run_snipe(
    state: Arc<AppState>,
    symbol: String,
    quote_amount: f64,
) -> Result<String> {
    let (frequency_ms, max_attempts, min_order_quote) = {
        let cfg = state.config.read();
        (
            cfg.buy_frequency_ms,
            cfg.max_snipe_attempts,
            cfg.min_order_quote,
        )
    };

    if quote_amount < min_order_quote {
        bail!(
            "snipe amount {quote_amount} below venue minimum {min_order_quote} for {symbol}"
        );
    }

    info!(symbol, quote_amount, max_attempts, "snipe started");

    for attempt in 1..=max_attempts {
        if state.is_shutting_down() {
            bail!("snipe for {symbol} aborted by shutdown");
        }

        let client_order_id = format!("kestrel-{}", Uuid::new_v4().simple());
        match state
            .gateway
            .place_market_buy(&symbol, quote_amount, &client_order_id)
            .await
        {
            Ok(fill) if fill.filled_quantity > 0.0 => {
                info!(
                    symbol,
                    attempt,
                    filled = fill.filled_quantity,
                    avg_price = fill.average_price,
                    "snipe filled"
                );
                return on_acquisition_filled(
                    &state,
                    &symbol,
                    fill.average_price,
                    fill.filled_quantity,
                )
                .await;
            }
            Ok(_) => {
                warn!(symbol, attempt, "buy accepted but nothing filled, retrying");
            }
            Err(VenueError::Rejected(msg)) => {
                // Expected until the pair opens for trading.
                tracing::debug!(symbol, attempt, %msg, "listing not tradable yet");
            }
            Err(e) => {
                warn!(symbol, attempt, error = %e, "buy attempt failed");
                state.push_error("snipe", e.to_string());
            }
        }

        tokio::time::sleep(Duration::from_millis(frequency_ms)).await;
    }

    bail!("snipe for {symbol} gave up after {max_attempts} attempts")
}

/// Open an exit strategy for a confirmed acquisition fill and hand it to a
/// monitor task. Returns the new strategy id.
pub async fn on_acquisition_filled(
    state: &Arc<AppState>,
    symbol: &str,
    entry_price: f64,
    quantity: f64,
) -> Result<String> {
    let config = StrategyConfig::from(&state.config.read().exit_defaults);

    let strategy = state
        .registry
        .create(symbol, entry_price, quantity, &config)?;
    state.persist(&strategy);
    state.increment_version();

    info!(
        strategy_id = %strategy.id,
        symbol,
        entry_price,
        quantity,
        take_profit = strategy.take_profit_price,
        stop_loss = strategy.stop_loss_price,
        "strategy opened"
    );

    state
        .notifier
        .notify(&LifecycleEvent {
            strategy_id: strategy.id.clone(),
            symbol: symbol.to_string(),
            event: EventType::Opened,
            quantity,
            price: entry_price,
            reason: None,
        })
        .await;

    tokio::spawn(crate::monitor::run_monitor(
        Arc::clone(state),
        strategy.id.clone(),
    ));

    Ok(strategy.id)
}

// =============================================================================
// Tests
// =============================================================================
