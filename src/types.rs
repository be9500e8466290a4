// =============================================================================
// Shared types used across the Kestrel sniper engine
// =============================================================================

use serde::{Deserialize, Serialize};

/// Why a liquidation fired. Variant order mirrors evaluation precedence:
/// stop-loss outranks everything else.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExitReason {
    StopLoss,
    TrailingStop,
    TakeProfit,
    TimeLimit,
    Manual,
}

impl std::fmt::Display for ExitReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::StopLoss => write!(f, "STOP_LOSS"),
            Self::TrailingStop => write!(f, "TRAILING_STOP"),
            Self::TakeProfit => write!(f, "TAKE_PROFIT"),
            Self::TimeLimit => write!(f, "TIME_LIMIT"),
            Self::Manual => write!(f, "MANUAL"),
        }
    }
}

/// Lifecycle status of a strategy.
///
/// `Executed` and `Failed` are terminal; a terminal strategy is never
/// scheduled again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StrategyStatus {
    Active,
    PartiallyExecuted,
    Executed,
    Failed,
}

impl StrategyStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Executed | Self::Failed)
    }
}

impl Default for StrategyStatus {
    fn default() -> Self {
        Self::Active
    }
}

impl std::fmt::Display for StrategyStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Active => write!(f, "ACTIVE"),
            Self::PartiallyExecuted => write!(f, "PARTIALLY_EXECUTED"),
            Self::Executed => write!(f, "EXECUTED"),
            Self::Failed => write!(f, "FAILED"),
        }
    }
}

/// Kind of lifecycle event delivered to the notifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventType {
    Opened,
    Partial,
    Closed,
    Failed,
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Opened => write!(f, "OPENED"),
            Self::Partial => write!(f, "PARTIAL"),
            Self::Closed => write!(f, "CLOSED"),
            Self::Failed => write!(f, "FAILED"),
        }
    }
}

/// A strategy lifecycle event for user-facing delivery.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LifecycleEvent {
    pub strategy_id: String,
    pub symbol: String,
    pub event: EventType,
    /// Quantity the event refers to: filled quantity for PARTIAL/CLOSED,
    /// the undisposed remainder for FAILED, original quantity for OPENED.
    pub quantity: f64,
    /// Fill price for liquidation events, entry price for OPENED.
    pub price: f64,
    pub reason: Option<ExitReason>,
}

impl LifecycleEvent {
    /// One-line human-readable form, shared by logs and notifications.
    pub fn render(&self) -> String {
        match (&self.event, self.reason) {
            (EventType::Opened, _) => format!(
                "[{}] OPENED {} qty {} @ {}",
                self.strategy_id, self.symbol, self.quantity, self.price
            ),
            (event, Some(reason)) => format!(
                "[{}] {event} {} qty {} @ {} ({reason})",
                self.strategy_id, self.symbol, self.quantity, self.price
            ),
            (event, None) => format!(
                "[{}] {event} {} qty {} @ {}",
                self.strategy_id, self.symbol, self.quantity, self.price
            ),
        }
    }
}
