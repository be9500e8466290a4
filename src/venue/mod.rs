// =============================================================================
// Venue abstraction — the seam between the engine and the exchange
// =============================================================================
//
// Everything upstream (liquidation, monitors, acquisition) talks to the venue
// through `VenueGateway`, so the engine can be driven by the real MEXC client
// in production and by scripted mocks in tests.
// =============================================================================

pub mod mexc;
pub mod rate_limit;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub use mexc::MexcClient;
pub use rate_limit::{RateLimitSnapshot, RateLimitTracker};

// =============================================================================
// Error taxonomy
// =============================================================================

/// Venue call failures, classified by how the caller should react.
#[derive(Debug, thiserror::Error)]
pub enum VenueError {
    /// Timeouts, connection resets, 5xx, 429 — worth retrying.
    #[error("transient venue error: {0}")]
    Transient(String),

    /// The venue refused the order as submitted (bad symbol, bad quantity,
    /// oversold). Retrying the identical request cannot succeed.
    #[error("order rejected by venue: {0}")]
    Rejected(String),

    /// Anything else (parse failures, unexpected payload shapes).
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl VenueError {
    pub fn is_transient(&self) -> bool {
        matches!(self, VenueError::Transient(_))
    }
}

// =============================================================================
// Wire-level result types
// =============================================================================

/// Outcome of a filled (or partially filled) order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FillResult {
    /// Venue-assigned order id.
    pub order_id: String,
    /// Client-assigned order id, echoed back by the venue.
    pub client_order_id: String,
    pub filled_quantity: f64,
    /// Volume-weighted average fill price.
    pub average_price: f64,
}

/// Top-of-book view used for listing detection and diagnostics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderBookSummary {
    pub best_bid: Option<f64>,
    pub best_ask: Option<f64>,
}

impl OrderBookSummary {
    /// A listing is tradable once at least one side of the book exists.
    pub fn has_liquidity(&self) -> bool {
        self.best_bid.is_some() || self.best_ask.is_some()
    }
}

// =============================================================================
// Gateway trait
// =============================================================================

/// Async interface to the exchange. Object-safe so it can live behind
/// `Arc<dyn VenueGateway>`.
#[async_trait]
pub trait VenueGateway: Send + Sync {
    /// Latest trade price for `symbol`.
    async fn get_price(&self, symbol: &str) -> Result<f64, VenueError>;

    /// Top-of-book snapshot for `symbol`.
    async fn get_order_book_summary(&self, symbol: &str) -> Result<OrderBookSummary, VenueError>;

    /// Market buy spending `quote_amount` of the quote asset.
    async fn place_market_buy(
        &self,
        symbol: &str,
        quote_amount: f64,
        client_order_id: &str,
    ) -> Result<FillResult, VenueError>;

    /// Market sell of `quantity` base asset.
    async fn place_market_sell(
        &self,
        symbol: &str,
        quantity: f64,
        client_order_id: &str,
    ) -> Result<FillResult, VenueError>;

    /// Look up an order by the client order id we assigned when placing it.
    /// Returns `Ok(None)` when the venue has no record of the id.
    async fn query_order(
        &self,
        symbol: &str,
        client_order_id: &str,
    ) -> Result<Option<FillResult>, VenueError>;
}
