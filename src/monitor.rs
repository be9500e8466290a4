// =============================================================================
// Monitor Scheduler — one tokio task per strategy
// =============================================================================
//
// Each active strategy is owned by exactly one monitor task: the task samples
// the price, runs the exit evaluator against the live entry, persists the
// updated snapshot, and drives liquidation when a signal fires. Because the
// task is the sole writer for its strategy, evaluation and state updates need
// no cross-task coordination beyond the registry lock.
//
// Price fetch failures skip the cycle (the strategy keeps its state and is
// re-evaluated next tick). Liquidation failures mark the strategy FAILED.
// =============================================================================

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tracing::{debug, info, warn};

use crate::app_state::AppState;
use crate::exit::{evaluate, ExitSignal};
use crate::liquidation::LiquidationError;
use crate::store::CompletionRecord;
use crate::strategy::Strategy;
use crate::types::{EventType, ExitReason, LifecycleEvent, StrategyStatus};

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// The fields a price sample can move that a restart must resume from.
/// Ticks that leave this tuple unchanged skip the store write.
fn decision_state(s: &Strategy) -> (bool, u64, Option<u64>, bool, StrategyStatus) {
    (
        s.trailing_activated,
        s.highest_price_seen.to_bits(),
        s.trailing_stop_price.map(f64::to_bits),
        s.take_profit_executed,
        s.status,
    )
}

/// Monitor a single strategy until it reaches a terminal status or shutdown.
pub async fn run_monitor(state: Arc<AppState>, strategy_id: String) {
    let poll_ms = state.config.read().poll_interval_ms;
    let mut ticker = tokio::time::interval(Duration::from_millis(poll_ms.max(1)));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    let Some(initial) = state.registry.get(&strategy_id) else {
        warn!(strategy_id, "monitor started for unknown strategy");
        return;
    };
    let symbol = initial.symbol.clone();

    info!(strategy_id, symbol, poll_ms, "monitor started");

    loop {
        ticker.tick().await;

        if state.is_shutting_down() {
            info!(strategy_id, "monitor stopping for shutdown");
            return;
        }

        let Some(snapshot) = state.registry.get(&strategy_id) else {
            debug!(strategy_id, "strategy no longer registered, monitor exiting");
            return;
        };
        if snapshot.is_terminal() {
            return;
        }

        // Operator close requests outrank automatic rules and sell the full
        // remainder regardless of price.
        if state.take_close_request(&strategy_id) {
            info!(strategy_id, "manual close requested");
            let signal = ExitSignal {
                reason: ExitReason::Manual,
                quantity: snapshot.remaining_quantity,
            };
            if execute_exit(&state, &strategy_id, &symbol, signal).await {
                return;
            }
            continue;
        }

        let price = match state.gateway.get_price(&symbol).await {
            Ok(p) => p,
            Err(e) => {
                warn!(strategy_id, symbol, error = %e, "price fetch failed, skipping cycle");
                state.push_error("price", e.to_string());
                continue;
            }
        };

        let Some((signal, dirty)) = state.registry.with_mut(&strategy_id, |s| {
            let before = decision_state(s);
            let signal = evaluate(s, price, now_secs());
            (signal, decision_state(s) != before)
        }) else {
            debug!(strategy_id, "strategy no longer registered, monitor exiting");
            return;
        };

        // Trailing state or the take-profit latch may have advanced even
        // without a signal; persist so a restart resumes from the same
        // decision point. Quiet samples leave the snapshot alone.
        if dirty {
            if let Some(updated) = state.registry.get(&strategy_id) {
                state.persist(&updated);
            }
        }

        if let Some(signal) = signal {
            if execute_exit(&state, &strategy_id, &symbol, signal).await {
                return;
            }
        }
    }
}

/// Run one liquidation sequence for `signal`. Returns `true` when the
/// strategy reached a terminal status and the monitor should exit.
async fn execute_exit(
    state: &Arc<AppState>,
    strategy_id: &str,
    symbol: &str,
    signal: ExitSignal,
) -> bool {
    info!(
        strategy_id,
        symbol,
        reason = %signal.reason,
        quantity = signal.quantity,
        "exit signal fired"
    );

    match state
        .executor
        .sell(strategy_id, symbol, signal.quantity, signal.reason)
        .await
    {
        Ok(fill) => {
            let Some(updated) = state.registry.update_after_liquidation(
                strategy_id,
                fill.filled_quantity,
                signal.reason,
            ) else {
                return true;
            };
            state.persist(&updated);
            state.increment_version();

            let record = CompletionRecord {
                strategy_id: strategy_id.to_string(),
                symbol: symbol.to_string(),
                quantity: fill.filled_quantity,
                price: fill.average_price,
                reason: signal.reason,
                pnl_pct: updated.pnl_pct(fill.average_price),
                at: chrono::Utc::now().to_rfc3339(),
            };
            if let Err(e) = state.store.append_completion(&record) {
                warn!(strategy_id, error = %format!("{e:#}"), "completion journal write failed");
                state.push_error("journal", format!("{e:#}"));
            }

            let terminal = updated.status == StrategyStatus::Executed;
            let event = LifecycleEvent {
                strategy_id: strategy_id.to_string(),
                symbol: symbol.to_string(),
                event: if terminal {
                    EventType::Closed
                } else {
                    EventType::Partial
                },
                quantity: fill.filled_quantity,
                price: fill.average_price,
                reason: Some(signal.reason),
            };
            state.notifier.notify(&event).await;

            if terminal {
                state.registry.archive(strategy_id);
                state.increment_version();
            }
            terminal
        }
        Err(e) => {
            let rejected = matches!(e, LiquidationError::Rejected(_));
            warn!(
                strategy_id,
                symbol,
                rejected,
                error = %e,
                "liquidation failed, marking strategy FAILED"
            );
            state.push_error("liquidation", e.to_string());

            let Some(failed) = state.registry.mark_failed(strategy_id) else {
                return true;
            };
            state.persist(&failed);
            state.increment_version();

            let event = LifecycleEvent {
                strategy_id: strategy_id.to_string(),
                symbol: symbol.to_string(),
                event: EventType::Failed,
                quantity: failed.remaining_quantity,
                price: 0.0,
                reason: Some(signal.reason),
            };
            state.notifier.notify(&event).await;

            state.registry.archive(strategy_id);
            state.increment_version();
            true
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use parking_lot::Mutex;

    use crate::config::RuntimeConfig;
    use crate::notifier::Notifier;
    use crate::registry::StrategyRegistry;
    use crate::store::PositionStore;
    use crate::strategy::StrategyConfig;
    use crate::venue::{FillResult, OrderBookSummary, VenueError, VenueGateway};

    /// Serves a scripted price path, then repeats the last price. Sells
    /// always fill in full unless `fail_sells` is set.
    struct ScriptedGateway {
        prices: Mutex<Vec<f64>>,
        last: Mutex<f64>,
        fail_sells: bool,
        /// Transient sell failures served before fills start succeeding.
        transient_fails: Mutex<u32>,
        /// Sells are accepted but report zero executed quantity.
        zero_fill_sells: bool,
        sells: Mutex<Vec<f64>>,
    }

    impl ScriptedGateway {
        fn new(prices: &[f64]) -> Self {
            let mut p: Vec<f64> = prices.to_vec();
            p.reverse();
            Self {
                prices: Mutex::new(p),
                last: Mutex::new(prices[0]),
                fail_sells: false,
                transient_fails: Mutex::new(0),
                zero_fill_sells: false,
                sells: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl VenueGateway for ScriptedGateway {
        async fn get_price(&self, _symbol: &str) -> Result<f64, VenueError> {
            let mut prices = self.prices.lock();
            match prices.pop() {
                Some(p) => {
                    *self.last.lock() = p;
                    Ok(p)
                }
                None => Ok(*self.last.lock()),
            }
        }

        async fn get_order_book_summary(
            &self,
            _symbol: &str,
        ) -> Result<OrderBookSummary, VenueError> {
            Ok(OrderBookSummary {
                best_bid: Some(*self.last.lock()),
                best_ask: Some(*self.last.lock()),
            })
        }

        async fn place_market_buy(
            &self,
            _symbol: &str,
            _quote_amount: f64,
            _client_order_id: &str,
        ) -> Result<FillResult, VenueError> {
            unimplemented!()
        }

        async fn place_market_sell(
            &self,
            _symbol: &str,
            quantity: f64,
            client_order_id: &str,
        ) -> Result<FillResult, VenueError> {
            if self.fail_sells {
                return Err(VenueError::Rejected("Oversold".into()));
            }
            if self.zero_fill_sells {
                return Ok(FillResult {
                    order_id: "V0".into(),
                    client_order_id: client_order_id.to_string(),
                    filled_quantity: 0.0,
                    average_price: 0.0,
                });
            }
            {
                let mut remaining = self.transient_fails.lock();
                if *remaining > 0 {
                    *remaining -= 1;
                    return Err(VenueError::Transient("request timed out".into()));
                }
            }
            let price = *self.last.lock();
            self.sells.lock().push(quantity);
            Ok(FillResult {
                order_id: "V1".into(),
                client_order_id: client_order_id.to_string(),
                filled_quantity: quantity,
                average_price: price,
            })
        }

        async fn query_order(
            &self,
            _symbol: &str,
            _client_order_id: &str,
        ) -> Result<Option<FillResult>, VenueError> {
            Ok(None)
        }
    }

    fn fast_config() -> RuntimeConfig {
        let mut cfg = RuntimeConfig::default();
        cfg.poll_interval_ms = 1;
        cfg.retry_delay_ms = 1;
        cfg
    }

    fn strategy_config() -> StrategyConfig {
        StrategyConfig {
            take_profit_pct: 20.0,
            stop_loss_pct: 10.0,
            trailing_offset_pct: 10.0,
            trailing_activation_pct: None,
            take_profit_sell_fraction: 0.5,
            time_limit_secs: None,
        }
    }

    fn build_state(gateway: Arc<ScriptedGateway>) -> Arc<AppState> {
        let dir = std::env::temp_dir().join(format!(
            "kestrel_monitor_test_{}_{}",
            std::process::id(),
            std::time::SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap()
                .subsec_nanos()
        ));
        Arc::new(AppState::new(
            fast_config(),
            StrategyRegistry::new(),
            PositionStore::open(dir).unwrap(),
            gateway,
            Notifier::disabled(),
        ))
    }

    #[tokio::test]
    async fn full_lifecycle_take_profit_then_trailing_stop() {
        // Entry 1.00, TP at 1.20 (sell 50%), trail 10% below peak 1.50.
        let gateway = Arc::new(ScriptedGateway::new(&[1.0, 1.05, 1.20, 1.50, 1.30]));
        let state = build_state(Arc::clone(&gateway));

        let s = state
            .registry
            .create("NEWUSDT", 1.0, 100.0, &strategy_config())
            .unwrap();

        run_monitor(Arc::clone(&state), s.id.clone()).await;

        // Both exits executed: 50 at take-profit, 50 at the trailing stop.
        let sells = gateway.sells.lock();
        assert_eq!(sells.len(), 2);
        assert!((sells[0] - 50.0).abs() < 1e-9);
        assert!((sells[1] - 50.0).abs() < 1e-9);

        // Terminal strategy was archived from the registry but kept in the
        // durable store as EXECUTED.
        assert!(state.registry.get(&s.id).is_none());
        assert!(state.store.load_open().is_empty());

        let completions = state.store.recent_completions(10);
        assert_eq!(completions.len(), 2);
        assert_eq!(completions[0].reason, ExitReason::TakeProfit);
        assert_eq!(completions[1].reason, ExitReason::TrailingStop);
    }

    #[tokio::test]
    async fn stop_loss_closes_entire_position() {
        let gateway = Arc::new(ScriptedGateway::new(&[1.0, 0.95, 0.89]));
        let state = build_state(Arc::clone(&gateway));

        let s = state
            .registry
            .create("NEWUSDT", 1.0, 100.0, &strategy_config())
            .unwrap();

        run_monitor(Arc::clone(&state), s.id.clone()).await;

        let sells = gateway.sells.lock();
        assert_eq!(sells.len(), 1);
        assert!((sells[0] - 100.0).abs() < 1e-9);

        let completions = state.store.recent_completions(10);
        assert_eq!(completions.len(), 1);
        assert_eq!(completions[0].reason, ExitReason::StopLoss);
        assert!(completions[0].pnl_pct < 0.0);
    }

    #[tokio::test]
    async fn manual_close_sells_remainder_at_market() {
        let gateway = Arc::new(ScriptedGateway::new(&[1.0, 1.01]));
        let state = build_state(Arc::clone(&gateway));

        let s = state
            .registry
            .create("NEWUSDT", 1.0, 100.0, &strategy_config())
            .unwrap();
        assert!(state.request_close(&s.id));

        run_monitor(Arc::clone(&state), s.id.clone()).await;

        let sells = gateway.sells.lock();
        assert_eq!(sells.len(), 1);
        assert!((sells[0] - 100.0).abs() < 1e-9);

        let completions = state.store.recent_completions(10);
        assert_eq!(completions[0].reason, ExitReason::Manual);
    }

    #[tokio::test]
    async fn transient_sell_failures_produce_one_completion() {
        let gateway = ScriptedGateway::new(&[1.0, 0.85]);
        *gateway.transient_fails.lock() = 2;
        let gateway = Arc::new(gateway);
        let state = build_state(Arc::clone(&gateway));

        let s = state
            .registry
            .create("NEWUSDT", 1.0, 100.0, &strategy_config())
            .unwrap();

        run_monitor(Arc::clone(&state), s.id.clone()).await;

        // Two failed attempts, then one fill — exactly one completion record.
        assert_eq!(gateway.sells.lock().len(), 1);
        let completions = state.store.recent_completions(10);
        assert_eq!(completions.len(), 1);
        assert_eq!(completions[0].reason, ExitReason::StopLoss);
    }

    #[tokio::test]
    async fn quiet_samples_leave_the_snapshot_untouched() {
        // Prices inside every threshold until the stop-loss tick: nothing
        // restart-relevant moves, so the snapshot is rewritten only for the
        // liquidation itself.
        let gateway = Arc::new(ScriptedGateway::new(&[1.0, 1.01, 1.02, 1.01, 0.89]));
        let state = build_state(Arc::clone(&gateway));

        let s = state
            .registry
            .create("NEWUSDT", 1.0, 100.0, &strategy_config())
            .unwrap();
        state.persist(&s);
        let baseline = state.store.write_count();

        run_monitor(Arc::clone(&state), s.id.clone()).await;

        assert_eq!(state.store.write_count(), baseline + 1);
        let completions = state.store.recent_completions(10);
        assert_eq!(completions.len(), 1);
        assert_eq!(completions[0].reason, ExitReason::StopLoss);
    }

    #[tokio::test]
    async fn trailing_progress_is_persisted_without_a_signal() {
        // 1.20 latches take-profit and arms trailing; 1.30 advances the peak
        // with no signal. Both samples must reach the store so a restart
        // resumes from the same decision point.
        let gateway = Arc::new(ScriptedGateway::new(&[1.0, 1.20, 1.30, 1.15]));
        let state = build_state(Arc::clone(&gateway));

        let s = state
            .registry
            .create("NEWUSDT", 1.0, 100.0, &strategy_config())
            .unwrap();
        state.persist(&s);
        let baseline = state.store.write_count();

        run_monitor(Arc::clone(&state), s.id.clone()).await;

        // Writes: TP latch/arm at 1.20, TP liquidation update, peak raise at
        // 1.30, trailing-stop liquidation update at 1.15. The quiet 1.0
        // sample writes nothing.
        assert_eq!(state.store.write_count(), baseline + 4);
    }

    #[tokio::test]
    async fn zero_filled_sells_never_record_completions() {
        let mut gateway = ScriptedGateway::new(&[1.0, 0.85]);
        gateway.zero_fill_sells = true;
        let gateway = Arc::new(gateway);
        let state = build_state(Arc::clone(&gateway));

        let s = state
            .registry
            .create("NEWUSDT", 1.0, 100.0, &strategy_config())
            .unwrap();

        run_monitor(Arc::clone(&state), s.id.clone()).await;

        // Every attempt reported zero executed quantity: the strategy ends
        // FAILED with an empty journal instead of a zero-quantity completion.
        assert!(state.store.recent_completions(10).is_empty());
        assert!(state.registry.get(&s.id).is_none());
        assert!(!state.recent_errors().is_empty());
    }

    #[tokio::test]
    async fn rejected_sell_marks_strategy_failed() {
        let mut gateway = ScriptedGateway::new(&[1.0, 0.85]);
        gateway.fail_sells = true;
        let gateway = Arc::new(gateway);
        let state = build_state(Arc::clone(&gateway));

        let s = state
            .registry
            .create("NEWUSDT", 1.0, 100.0, &strategy_config())
            .unwrap();

        run_monitor(Arc::clone(&state), s.id.clone()).await;

        // Archived from the registry; the durable record carries FAILED.
        assert!(state.registry.get(&s.id).is_none());
        assert!(state.store.load_open().is_empty());
        assert!(!state.recent_errors().is_empty());
    }
}
