// =============================================================================
// Exit Evaluator — decides when, how much, and why to liquidate
// =============================================================================
//
// Evaluation order is fixed and must not be reordered, because conditions can
// be simultaneously true and only one action fires per sample:
//
//   1. Stop-loss       -> full close (caps loss; overrides an armed trailing stop)
//   2. Trailing stop   -> full close (only once trailing has activated)
//   3. Take-profit     -> partial close, fires at most once per strategy
//   4. Time limit      -> full close
//
// Trailing-state ratcheting runs before the checks on every sample,
// independent of whether an action fires. `highest_price_seen` and the
// derived `trailing_stop_price` only ever move up.
//
// The evaluator performs no I/O and never blocks; the owning monitor task is
// the only caller for a given strategy.
// =============================================================================

use chrono::Utc;
use tracing::debug;

use crate::strategy::Strategy;
use crate::types::ExitReason;

/// The action returned by an evaluation: liquidate `quantity` for `reason`.
#[derive(Debug, Clone, PartialEq)]
pub struct ExitSignal {
    pub reason: ExitReason,
    pub quantity: f64,
}

/// Evaluate one price sample against a strategy's exit conditions.
///
/// Mutates the strategy's trailing state (and the one-shot
/// `take_profit_executed` latch) in place; returns `Some(ExitSignal)` when a
/// liquidation should be handed to the executor, `None` otherwise.
///
/// `take_profit_executed` is latched as soon as the take-profit condition
/// fires, regardless of whether the resulting sell later fills, so a
/// take-profit can never fire twice for the same strategy.
pub fn evaluate(strategy: &mut Strategy, current_price: f64, now_secs: u64) -> Option<ExitSignal> {
    strategy.last_evaluated_at = Some(Utc::now().to_rfc3339());

    update_trailing_state(strategy, current_price);

    // 1. Stop-loss: capping loss takes priority over protecting partial profit.
    if current_price <= strategy.stop_loss_price {
        return Some(ExitSignal {
            reason: ExitReason::StopLoss,
            quantity: strategy.remaining_quantity,
        });
    }

    // 2. Trailing stop, only once armed.
    if strategy.trailing_activated {
        if let Some(trail) = strategy.trailing_stop_price {
            if current_price <= trail {
                return Some(ExitSignal {
                    reason: ExitReason::TrailingStop,
                    quantity: strategy.remaining_quantity,
                });
            }
        }
    }

    // 3. Take-profit: sells a fraction of the remainder, at most once.
    if !strategy.take_profit_executed && current_price >= strategy.take_profit_price {
        strategy.take_profit_executed = true;
        let quantity = strategy.take_profit_sell_fraction * strategy.remaining_quantity;
        return Some(ExitSignal {
            reason: ExitReason::TakeProfit,
            quantity,
        });
    }

    // 4. Time-based exit.
    if let Some(limit) = strategy.time_limit_secs {
        let elapsed = now_secs.saturating_sub(strategy.created_at_secs);
        if elapsed > limit {
            return Some(ExitSignal {
                reason: ExitReason::TimeLimit,
                quantity: strategy.remaining_quantity,
            });
        }
    }

    None
}

/// Ratchet the trailing state for a new sample.
///
/// Activation is one-way; once active, `highest_price_seen` and the derived
/// stop only move up.
fn update_trailing_state(strategy: &mut Strategy, current_price: f64) {
    if !strategy.trailing_activated && current_price >= strategy.trailing_activation_price {
        strategy.trailing_activated = true;
        debug!(
            id = %strategy.id,
            activation = strategy.trailing_activation_price,
            price = current_price,
            "trailing stop activated"
        );
    }

    if strategy.trailing_activated && current_price > strategy.highest_price_seen {
        strategy.highest_price_seen = current_price;
        let trail = current_price * (1.0 - strategy.trailing_offset_pct / 100.0);
        strategy.trailing_stop_price = Some(trail);
        debug!(
            id = %strategy.id,
            highest_price = strategy.highest_price_seen,
            trailing_stop = trail,
            "trailing stop raised"
        );
    }
}

// =============================================================================
// Tests
// =============================================================================
