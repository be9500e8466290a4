// =============================================================================
// Strategy model — one independent exit-management unit per acquisition fill
// =============================================================================
//
// A `Strategy` is created synchronously when an acquisition order reports a
// fill and is mutated only by its owning monitor task thereafter. Exit prices
// are derived once at creation and immutable; trailing state is strategy-local
// and only ratchets upward.
//
// Strategies are never merged: three fills of the same symbol yield three
// independent strategies, each with its own id and monitor.
// =============================================================================

use chrono::Utc;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use crate::config::ExitDefaults;
use crate::types::{ExitReason, StrategyStatus};

/// Below this remainder a position is considered fully disposed. Venues round
/// fills, so an exact zero cannot be relied upon.
pub const QTY_EPSILON: f64 = 1e-9;

// =============================================================================
// Errors
// =============================================================================

/// Rejections raised at strategy creation. A strategy that fails validation
/// is never persisted.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("entry price must be positive, got {0}")]
    NonPositivePrice(f64),

    #[error("quantity must be positive, got {0}")]
    NonPositiveQuantity(f64),

    #[error("take-profit sell fraction must be in (0, 1], got {0}")]
    InvalidSellFraction(f64),

    #[error("trailing offset must be in (0, 100) percent, got {0}")]
    InvalidTrailingOffset(f64),

    #[error("inverted thresholds: stop-loss {stop_loss} / take-profit {take_profit} around entry {entry}")]
    InvertedThresholds {
        entry: f64,
        stop_loss: f64,
        take_profit: f64,
    },
}

// =============================================================================
// StrategyConfig
// =============================================================================

/// Per-strategy exit parameters, usually derived from the configured defaults
/// but overridable per acquisition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategyConfig {
    pub take_profit_pct: f64,
    pub stop_loss_pct: f64,
    pub trailing_offset_pct: f64,
    /// Percentage rise at which trailing tracking arms. `None` arms trailing
    /// at the take-profit level.
    pub trailing_activation_pct: Option<f64>,
    pub take_profit_sell_fraction: f64,
    /// Holding-time limit in seconds; `None` disables time-based selling.
    pub time_limit_secs: Option<u64>,
}

impl From<&ExitDefaults> for StrategyConfig {
    fn from(d: &ExitDefaults) -> Self {
        Self {
            take_profit_pct: d.take_profit_pct,
            stop_loss_pct: d.stop_loss_pct,
            trailing_offset_pct: d.trailing_offset_pct,
            trailing_activation_pct: d.trailing_activation_pct,
            take_profit_sell_fraction: d.take_profit_sell_fraction,
            time_limit_secs: if d.time_based_sell_minutes > 0 {
                Some(d.time_based_sell_minutes * 60)
            } else {
                None
            },
        }
    }
}

// =============================================================================
// Strategy
// =============================================================================

/// A single tracked exit strategy.
///
/// All fields that can be reconstructed carry serde defaults, so records
/// written by older versions still load.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Strategy {
    /// Unique, immutable id: monotonic counter + symbol.
    pub id: String,
    pub symbol: String,
    /// Average fill price of the originating buy.
    pub entry_price: f64,
    /// Quantity at creation, immutable.
    pub original_quantity: f64,
    /// Decreases on each partial/full liquidation.
    pub remaining_quantity: f64,

    /// Derived once at creation, immutable thereafter.
    pub take_profit_price: f64,
    pub stop_loss_price: f64,
    /// Fraction of `remaining_quantity` at trigger time sold when take-profit
    /// fires.
    pub take_profit_sell_fraction: f64,

    /// Price at which trailing-stop tracking begins.
    pub trailing_activation_price: f64,
    /// Distance below the running peak, in percent.
    pub trailing_offset_pct: f64,
    /// Monotonically non-decreasing once trailing activates.
    #[serde(default)]
    pub highest_price_seen: f64,
    /// `highest_price_seen * (1 - offset)`; never decreases.
    #[serde(default)]
    pub trailing_stop_price: Option<f64>,

    /// Set once, irreversible.
    #[serde(default)]
    pub take_profit_executed: bool,
    /// Set once price first reaches the activation price; never unset.
    #[serde(default)]
    pub trailing_activated: bool,

    /// Holding-time limit in seconds; `None` disables time-based selling.
    #[serde(default)]
    pub time_limit_secs: Option<u64>,

    pub status: StrategyStatus,
    /// RFC 3339 creation timestamp.
    pub created_at: String,
    /// Epoch seconds at creation, for elapsed-time checks.
    pub created_at_secs: u64,
    #[serde(default)]
    pub last_evaluated_at: Option<String>,
}

impl Strategy {
    /// Create a validated strategy for an acquisition fill.
    ///
    /// Rejects inverted thresholds and non-positive quantities rather than
    /// silently behaving incorrectly.
    pub fn open(
        id: String,
        symbol: &str,
        entry_price: f64,
        quantity: f64,
        config: &StrategyConfig,
    ) -> Result<Self, ConfigError> {
        if entry_price <= 0.0 {
            return Err(ConfigError::NonPositivePrice(entry_price));
        }
        if quantity <= 0.0 {
            return Err(ConfigError::NonPositiveQuantity(quantity));
        }
        let fraction = config.take_profit_sell_fraction;
        if fraction <= 0.0 || fraction > 1.0 {
            return Err(ConfigError::InvalidSellFraction(fraction));
        }
        if config.trailing_offset_pct <= 0.0 || config.trailing_offset_pct >= 100.0 {
            return Err(ConfigError::InvalidTrailingOffset(config.trailing_offset_pct));
        }

        let take_profit_price = entry_price * (1.0 + config.take_profit_pct / 100.0);
        let stop_loss_price = entry_price * (1.0 - config.stop_loss_pct / 100.0);

        if stop_loss_price >= entry_price || take_profit_price <= entry_price {
            return Err(ConfigError::InvertedThresholds {
                entry: entry_price,
                stop_loss: stop_loss_price,
                take_profit: take_profit_price,
            });
        }

        // Trailing arms at the take-profit level unless configured separately.
        let trailing_activation_price = match config.trailing_activation_pct {
            Some(pct) => entry_price * (1.0 + pct / 100.0),
            None => take_profit_price,
        };

        let now = Utc::now();

        let strategy = Self {
            id,
            symbol: symbol.to_string(),
            entry_price,
            original_quantity: quantity,
            remaining_quantity: quantity,
            take_profit_price,
            stop_loss_price,
            take_profit_sell_fraction: fraction,
            trailing_activation_price,
            trailing_offset_pct: config.trailing_offset_pct,
            highest_price_seen: entry_price,
            trailing_stop_price: None,
            take_profit_executed: false,
            trailing_activated: false,
            time_limit_secs: config.time_limit_secs,
            status: StrategyStatus::Active,
            created_at: now.to_rfc3339(),
            created_at_secs: now.timestamp() as u64,
            last_evaluated_at: None,
        };

        info!(
            id = %strategy.id,
            symbol,
            entry_price,
            quantity,
            take_profit_price,
            stop_loss_price,
            trailing_activation_price,
            "strategy opened"
        );

        Ok(strategy)
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Reduce the remaining quantity by a fill and advance the status.
    ///
    /// Returns the new status. The remainder never goes negative; a residual
    /// below [`QTY_EPSILON`] is flushed to exactly zero so that
    /// `status = EXECUTED` always implies `remaining_quantity = 0`.
    pub fn apply_fill(&mut self, filled_quantity: f64, reason: ExitReason) -> StrategyStatus {
        self.remaining_quantity = (self.remaining_quantity - filled_quantity).max(0.0);

        if self.remaining_quantity <= QTY_EPSILON {
            self.remaining_quantity = 0.0;
            self.status = StrategyStatus::Executed;
        } else {
            self.status = StrategyStatus::PartiallyExecuted;
        }

        info!(
            id = %self.id,
            symbol = %self.symbol,
            filled_quantity,
            remaining = self.remaining_quantity,
            reason = %reason,
            status = %self.status,
            "liquidation applied"
        );

        self.status
    }

    /// Terminal failure: the remaining quantity needs manual attention.
    pub fn mark_failed(&mut self) {
        self.status = StrategyStatus::Failed;
    }

    /// Signed percentage move of `price` from the entry price.
    pub fn pnl_pct(&self, price: f64) -> f64 {
        if self.entry_price > 0.0 {
            (price - self.entry_price) / self.entry_price * 100.0
        } else {
            0.0
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
