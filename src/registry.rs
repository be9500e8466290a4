// =============================================================================
// Strategy Registry — in-memory authoritative index of active strategies
// =============================================================================
//
// An arena of strategies keyed by strategy id, with a non-unique multimap from
// symbol to the set of strategy ids. Creating a strategy never rejects because
// another strategy for the same symbol already exists; multiple concurrent
// strategies per symbol is first-class behavior.
//
// Thread-safety: all mutable state is behind `parking_lot::RwLock`. Each
// strategy is mutated only by its owning monitor task (single-writer); the
// lock exists so that read-only query snapshots and the rare cross-writer
// (a manual close applied through the owning task) never observe torn state.
// =============================================================================

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;
use tracing::{info, warn};

use crate::strategy::{ConfigError, Strategy, StrategyConfig};
use crate::types::ExitReason;

struct Inner {
    arena: HashMap<String, Strategy>,
    by_symbol: HashMap<String, BTreeSet<String>>,
}

/// Thread-safe registry owning the arena of strategies.
pub struct StrategyRegistry {
    inner: RwLock<Inner>,
    next_id: AtomicU64,
}

impl StrategyRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner {
                arena: HashMap::new(),
                by_symbol: HashMap::new(),
            }),
            next_id: AtomicU64::new(1),
        }
    }

    // -------------------------------------------------------------------------
    // Creation / rehydration
    // -------------------------------------------------------------------------

    /// Create a new strategy for an acquisition fill and return a snapshot.
    ///
    /// Always creates a fresh strategy — one per fill, never merged with an
    /// existing strategy for the same symbol.
    pub fn create(
        &self,
        symbol: &str,
        entry_price: f64,
        quantity: f64,
        config: &StrategyConfig,
    ) -> Result<Strategy, ConfigError> {
        let seq = self.next_id.fetch_add(1, Ordering::SeqCst);
        let id = format!("{symbol}-{seq}");

        let strategy = Strategy::open(id.clone(), symbol, entry_price, quantity, config)?;

        let mut inner = self.inner.write();
        inner
            .by_symbol
            .entry(symbol.to_string())
            .or_default()
            .insert(id.clone());
        inner.arena.insert(id, strategy.clone());

        Ok(strategy)
    }

    /// Insert a strategy restored from the position store at startup.
    ///
    /// Keeps the monotonic id counter ahead of every restored id so newly
    /// created strategies can never collide with persisted ones.
    pub fn insert_restored(&self, strategy: Strategy) {
        if let Some(seq) = strategy
            .id
            .rsplit('-')
            .next()
            .and_then(|s| s.parse::<u64>().ok())
        {
            self.next_id.fetch_max(seq + 1, Ordering::SeqCst);
        }

        info!(
            id = %strategy.id,
            symbol = %strategy.symbol,
            status = %strategy.status,
            trailing_activated = strategy.trailing_activated,
            highest_price_seen = strategy.highest_price_seen,
            take_profit_executed = strategy.take_profit_executed,
            "strategy restored"
        );

        let mut inner = self.inner.write();
        inner
            .by_symbol
            .entry(strategy.symbol.clone())
            .or_default()
            .insert(strategy.id.clone());
        inner.arena.insert(strategy.id.clone(), strategy);
    }

    // -------------------------------------------------------------------------
    // Queries
    // -------------------------------------------------------------------------

    /// Snapshot of a single strategy.
    pub fn get(&self, id: &str) -> Option<Strategy> {
        self.inner.read().arena.get(id).cloned()
    }

    /// Snapshots of every non-terminal strategy.
    pub fn list_active(&self) -> Vec<Strategy> {
        let inner = self.inner.read();
        let mut active: Vec<Strategy> = inner
            .arena
            .values()
            .filter(|s| !s.is_terminal())
            .cloned()
            .collect();
        active.sort_by(|a, b| a.id.cmp(&b.id));
        active
    }

    /// Snapshots of every strategy for `symbol`, terminal or not.
    pub fn list_by_symbol(&self, symbol: &str) -> Vec<Strategy> {
        let inner = self.inner.read();
        let Some(ids) = inner.by_symbol.get(symbol) else {
            return Vec::new();
        };
        ids.iter()
            .filter_map(|id| inner.arena.get(id).cloned())
            .collect()
    }

    /// Sum of `remaining_quantity` across all non-terminal strategies for
    /// `symbol`.
    pub fn total_position(&self, symbol: &str) -> f64 {
        let inner = self.inner.read();
        let Some(ids) = inner.by_symbol.get(symbol) else {
            return 0.0;
        };
        ids.iter()
            .filter_map(|id| inner.arena.get(id))
            .filter(|s| !s.is_terminal())
            .map(|s| s.remaining_quantity)
            .sum()
    }

    // -------------------------------------------------------------------------
    // Mutation (owning task only)
    // -------------------------------------------------------------------------

    /// Run `f` against the mutable strategy under the write lock.
    ///
    /// Only the owning monitor task may call this for a given id; the closure
    /// must not block.
    pub fn with_mut<R>(&self, id: &str, f: impl FnOnce(&mut Strategy) -> R) -> Option<R> {
        let mut inner = self.inner.write();
        inner.arena.get_mut(id).map(f)
    }

    /// Apply a liquidation fill: reduce the remainder and advance the status.
    ///
    /// Returns a snapshot of the updated strategy.
    pub fn update_after_liquidation(
        &self,
        id: &str,
        filled_quantity: f64,
        reason: ExitReason,
    ) -> Option<Strategy> {
        let mut inner = self.inner.write();
        let strategy = inner.arena.get_mut(id)?;
        strategy.apply_fill(filled_quantity, reason);
        Some(strategy.clone())
    }

    /// Transition a strategy to FAILED. Terminal; the strategy is excluded
    /// from further scheduling.
    pub fn mark_failed(&self, id: &str) -> Option<Strategy> {
        let mut inner = self.inner.write();
        let strategy = inner.arena.get_mut(id)?;
        strategy.mark_failed();
        warn!(
            id = %strategy.id,
            symbol = %strategy.symbol,
            remaining = strategy.remaining_quantity,
            "strategy marked FAILED — remaining quantity requires manual attention"
        );
        Some(strategy.clone())
    }

    /// Drop a terminal strategy from the in-memory index.
    ///
    /// Call only after the final notification has been delivered; the durable
    /// record in the position store remains as the archive.
    pub fn archive(&self, id: &str) -> bool {
        let mut inner = self.inner.write();
        let Some(strategy) = inner.arena.get(id) else {
            return false;
        };
        if !strategy.is_terminal() {
            warn!(id, status = %strategy.status, "refusing to archive non-terminal strategy");
            return false;
        }
        let symbol = strategy.symbol.clone();
        inner.arena.remove(id);
        if let Some(ids) = inner.by_symbol.get_mut(&symbol) {
            ids.remove(id);
            if ids.is_empty() {
                inner.by_symbol.remove(&symbol);
            }
        }
        true
    }

    /// Number of strategies currently held (terminal included until archived).
    pub fn len(&self) -> usize {
        self.inner.read().arena.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().arena.is_empty()
    }
}

impl Default for StrategyRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for StrategyRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.read();
        f.debug_struct("StrategyRegistry")
            .field("strategies", &inner.arena.len())
            .field("symbols", &inner.by_symbol.len())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
