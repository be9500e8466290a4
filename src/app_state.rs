// =============================================================================
// Application State — shared handles for monitors, acquisition, and the API
// =============================================================================

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tracing::error;

use crate::config::RuntimeConfig;
use crate::liquidation::LiquidationExecutor;
use crate::notifier::Notifier;
use crate::registry::StrategyRegistry;
use crate::store::PositionStore;
use crate::strategy::Strategy;
use crate::venue::{RateLimitSnapshot, RateLimitTracker, VenueGateway};

/// Maximum retained entries in the recent-error ring.
const ERROR_RING_CAPACITY: usize = 50;

/// One operational error surfaced on the dashboard.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorEntry {
    pub at: String,
    pub context: String,
    pub message: String,
}

/// Shared application state. Cheap to clone via `Arc<AppState>`.
pub struct AppState {
    pub config: RwLock<RuntimeConfig>,
    pub registry: StrategyRegistry,
    pub store: PositionStore,
    pub gateway: Arc<dyn VenueGateway>,
    pub executor: LiquidationExecutor,
    pub notifier: Notifier,

    /// Strategy ids with a pending operator close request. The owning
    /// monitor drains its own id; nothing else mutates the strategy.
    close_requests: RwLock<HashSet<String>>,

    /// Venue rate-limit counters, when the gateway exposes them.
    rate_limit: Option<Arc<RateLimitTracker>>,

    recent_errors: Mutex<VecDeque<ErrorEntry>>,
    state_version: AtomicU64,
    shutting_down: AtomicBool,
    /// Set when a store write fails; monitoring continues from memory.
    degraded_store: AtomicBool,
    pub start_time: Instant,
}

impl AppState {
    pub fn new(
        config: RuntimeConfig,
        registry: StrategyRegistry,
        store: PositionStore,
        gateway: Arc<dyn VenueGateway>,
        notifier: Notifier,
    ) -> Self {
        let executor = LiquidationExecutor::new(
            Arc::clone(&gateway),
            config.max_retry_attempts,
            config.retry_delay_ms,
        );

        Self {
            config: RwLock::new(config),
            registry,
            store,
            gateway,
            executor,
            notifier,
            close_requests: RwLock::new(HashSet::new()),
            rate_limit: None,
            recent_errors: Mutex::new(VecDeque::with_capacity(ERROR_RING_CAPACITY)),
            state_version: AtomicU64::new(0),
            shutting_down: AtomicBool::new(false),
            degraded_store: AtomicBool::new(false),
            start_time: Instant::now(),
        }
    }

    /// Attach the venue's rate-limit tracker for dashboard snapshots.
    pub fn with_rate_limit(mut self, tracker: Arc<RateLimitTracker>) -> Self {
        self.rate_limit = Some(tracker);
        self
    }

    pub fn rate_limit_snapshot(&self) -> Option<RateLimitSnapshot> {
        self.rate_limit.as_ref().map(|t| t.snapshot())
    }

    // -------------------------------------------------------------------------
    // Versioning / shutdown
    // -------------------------------------------------------------------------

    pub fn increment_version(&self) -> u64 {
        self.state_version.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn version(&self) -> u64 {
        self.state_version.load(Ordering::SeqCst)
    }

    pub fn begin_shutdown(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    // -------------------------------------------------------------------------
    // Manual close requests
    // -------------------------------------------------------------------------

    /// Record an operator close request for an active strategy.
    /// Returns `false` when the id is unknown or already terminal.
    pub fn request_close(&self, strategy_id: &str) -> bool {
        let Some(strategy) = self.registry.get(strategy_id) else {
            return false;
        };
        if strategy.is_terminal() {
            return false;
        }
        self.close_requests.write().insert(strategy_id.to_string());
        true
    }

    /// Consume a pending close request for `strategy_id`, if any. Called only
    /// by the owning monitor task.
    pub fn take_close_request(&self, strategy_id: &str) -> bool {
        self.close_requests.write().remove(strategy_id)
    }

    // -------------------------------------------------------------------------
    // Persistence with degraded-durability fallback
    // -------------------------------------------------------------------------

    /// Persist a strategy snapshot. A write failure flips the store into
    /// degraded mode and is logged loudly, but monitoring continues from the
    /// in-memory state.
    pub fn persist(&self, strategy: &Strategy) {
        match self.store.upsert(strategy) {
            Ok(()) => {
                self.degraded_store.store(false, Ordering::SeqCst);
            }
            Err(e) => {
                self.degraded_store.store(true, Ordering::SeqCst);
                error!(
                    strategy_id = %strategy.id,
                    error = %format!("{e:#}"),
                    "position store write failed — running with degraded durability"
                );
                self.push_error("store", format!("{e:#}"));
            }
        }
    }

    pub fn store_degraded(&self) -> bool {
        self.degraded_store.load(Ordering::SeqCst)
    }

    // -------------------------------------------------------------------------
    // Error ring
    // -------------------------------------------------------------------------

    pub fn push_error(&self, context: impl Into<String>, message: impl Into<String>) {
        let entry = ErrorEntry {
            at: chrono::Utc::now().to_rfc3339(),
            context: context.into(),
            message: message.into(),
        };
        let mut ring = self.recent_errors.lock();
        if ring.len() >= ERROR_RING_CAPACITY {
            ring.pop_front();
        }
        ring.push_back(entry);
    }

    pub fn recent_errors(&self) -> Vec<ErrorEntry> {
        self.recent_errors.lock().iter().cloned().collect()
    }

    pub fn uptime_secs(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("strategies", &self.registry.len())
            .field("version", &self.version())
            .field("shutting_down", &self.is_shutting_down())
            .field("degraded_store", &self.store_degraded())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    use crate::strategy::StrategyConfig;
    use crate::types::ExitReason;
    use crate::venue::{FillResult, OrderBookSummary, VenueError};

    struct NullGateway;

    #[async_trait]
    impl VenueGateway for NullGateway {
        async fn get_price(&self, _symbol: &str) -> Result<f64, VenueError> {
            Ok(1.0)
        }
        async fn get_order_book_summary(
            &self,
            _symbol: &str,
        ) -> Result<OrderBookSummary, VenueError> {
            Ok(OrderBookSummary {
                best_bid: Some(1.0),
                best_ask: Some(1.0),
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
            _quantity: f64,
            _client_order_id: &str,
        ) -> Result<FillResult, VenueError> {
            unimplemented!()
        }
        async fn query_order(
            &self,
            _symbol: &str,
            _client_order_id: &str,
        ) -> Result<Option<FillResult>, VenueError> {
            Ok(None)
        }
    }

    fn state() -> AppState {
        let dir = std::env::temp_dir().join(format!(
            "kestrel_state_test_{}_{}",
            std::process::id(),
            rand_tag()
        ));
        AppState::new(
            RuntimeConfig::default(),
            StrategyRegistry::new(),
            PositionStore::open(dir).unwrap(),
            Arc::new(NullGateway),
            Notifier::disabled(),
        )
    }

    fn rand_tag() -> u64 {
        use std::time::{SystemTime, UNIX_EPOCH};
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .subsec_nanos() as u64
    }

    fn config() -> StrategyConfig {
        StrategyConfig {
            take_profit_pct: 20.0,
            stop_loss_pct: 10.0,
            trailing_offset_pct: 5.0,
            trailing_activation_pct: None,
            take_profit_sell_fraction: 0.5,
            time_limit_secs: None,
        }
    }

    #[test]
    fn close_request_only_for_live_strategies() {
        let state = state();
        assert!(!state.request_close("missing"));

        let s = state.registry.create("NEWUSDT", 1.0, 100.0, &config()).unwrap();
        assert!(state.request_close(&s.id));
        assert!(state.take_close_request(&s.id));
        // Consumed exactly once.
        assert!(!state.take_close_request(&s.id));

        state.registry.update_after_liquidation(&s.id, 100.0, ExitReason::Manual);
        assert!(!state.request_close(&s.id), "terminal strategy cannot be closed");
    }

    #[test]
    fn error_ring_is_bounded() {
        let state = state();
        for i in 0..(ERROR_RING_CAPACITY + 10) {
            state.push_error("test", format!("error {i}"));
        }
        let errors = state.recent_errors();
        assert_eq!(errors.len(), ERROR_RING_CAPACITY);
        assert_eq!(errors[0].message, "error 10");
    }

    #[test]
    fn version_counter_is_monotonic() {
        let state = state();
        assert_eq!(state.version(), 0);
        assert_eq!(state.increment_version(), 1);
        assert_eq!(state.increment_version(), 2);
        assert_eq!(state.version(), 2);
    }
}
