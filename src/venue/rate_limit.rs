// =============================================================================
// Rate-Limit Tracker — monitors MEXC API usage to avoid 429s
// =============================================================================
//
// MEXC enforces per-endpoint request limits (500 per 10 s on spot endpoints)
// and an order-rate limit, but unlike some venues it does not echo usage
// counters in response headers. The tracker therefore counts locally inside a
// rolling 10-second window and honours Retry-After on a 429.
//
// All counters are atomics so any task may query them lock-free.
// =============================================================================

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Hard ceiling of requests per 10-second window (venue limit is 500; we
/// hold back a margin for the operator API's pass-through calls).
const REQUEST_10S_LIMIT: u32 = 400;
/// Soft warning threshold.
const REQUEST_WARN_THRESHOLD: u32 = 300;

/// Maximum orders per 10-second window.
const ORDER_10S_LIMIT: u32 = 80;

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Thread-safe rate-limit tracker backed by atomic counters.
pub struct RateLimitTracker {
    window_start_secs: AtomicU64,
    request_count_10s: AtomicU32,
    order_count_10s: AtomicU32,
    /// Epoch seconds until which all sends are blocked (set from Retry-After).
    blocked_until_secs: AtomicU64,
}

/// Immutable snapshot of the current rate-limit state (suitable for
/// serialisation into a dashboard payload).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitSnapshot {
    pub request_count_10s: u32,
    pub order_count_10s: u32,
    pub blocked: bool,
}

impl RateLimitTracker {
    /// Create a new tracker with all counters at zero.
    pub fn new() -> Self {
        Self {
            window_start_secs: AtomicU64::new(now_secs()),
            request_count_10s: AtomicU32::new(0),
            order_count_10s: AtomicU32::new(0),
            blocked_until_secs: AtomicU64::new(0),
        }
    }

    /// Roll the 10-second window forward if it has elapsed.
    fn roll_window(&self) {
        let now = now_secs();
        let start = self.window_start_secs.load(Ordering::Relaxed);
        if now.saturating_sub(start) >= 10
            && self
                .window_start_secs
                .compare_exchange(start, now, Ordering::Relaxed, Ordering::Relaxed)
                .is_ok()
        {
            self.request_count_10s.store(0, Ordering::Relaxed);
            self.order_count_10s.store(0, Ordering::Relaxed);
            debug!("rate-limit window rolled");
        }
    }

    // -------------------------------------------------------------------------
    // Header-based updates
    // -------------------------------------------------------------------------

    /// Honour a Retry-After header when the venue throttles us.
    pub fn update_from_headers(&self, headers: &reqwest::header::HeaderMap) {
        if let Some(val) = headers.get(reqwest::header::RETRY_AFTER) {
            if let Ok(s) = val.to_str() {
                if let Ok(secs) = s.parse::<u64>() {
                    let until = now_secs() + secs;
                    self.blocked_until_secs.store(until, Ordering::Relaxed);
                    warn!(retry_after_secs = secs, "venue requested backoff");
                }
            }
        }
    }

    // -------------------------------------------------------------------------
    // Pre-flight checks
    // -------------------------------------------------------------------------

    /// Return `true` if we can afford `weight` more requests in this window.
    pub fn can_send_request(&self, weight: u32) -> bool {
        if now_secs() < self.blocked_until_secs.load(Ordering::Relaxed) {
            warn!("request blocked — inside venue-mandated backoff");
            return false;
        }

        self.roll_window();
        let current = self.request_count_10s.fetch_add(weight, Ordering::Relaxed) + weight;
        if current > REQUEST_10S_LIMIT {
            warn!(
                current,
                limit = REQUEST_10S_LIMIT,
                "request blocked — would exceed rate-limit"
            );
            return false;
        }
        if current == REQUEST_WARN_THRESHOLD {
            warn!(
                current,
                limit = REQUEST_10S_LIMIT,
                "request rate crossed warning threshold"
            );
        }
        true
    }

    /// Return `true` if we can place another order in this window.
    pub fn can_place_order(&self) -> bool {
        if now_secs() < self.blocked_until_secs.load(Ordering::Relaxed) {
            warn!("order blocked — inside venue-mandated backoff");
            return false;
        }

        self.roll_window();
        let count = self.order_count_10s.load(Ordering::Relaxed);
        if count >= ORDER_10S_LIMIT {
            warn!(
                count,
                limit = ORDER_10S_LIMIT,
                "order blocked — 10 s order limit reached"
            );
            return false;
        }
        true
    }

    /// Increment the order counter after submitting an order.
    pub fn record_order_sent(&self) {
        self.order_count_10s.fetch_add(1, Ordering::Relaxed);
    }

    // -------------------------------------------------------------------------
    // Snapshot
    // -------------------------------------------------------------------------

    /// Produce a serialisable snapshot of the current counters.
    pub fn snapshot(&self) -> RateLimitSnapshot {
        RateLimitSnapshot {
            request_count_10s: self.request_count_10s.load(Ordering::Relaxed),
            order_count_10s: self.order_count_10s.load(Ordering::Relaxed),
            blocked: now_secs() < self.blocked_until_secs.load(Ordering::Relaxed),
        }
    }
}

impl Default for RateLimitTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for RateLimitTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimitTracker")
            .field(
                "request_count_10s",
                &self.request_count_10s.load(Ordering::Relaxed),
            )
            .field(
                "order_count_10s",
                &self.order_count_10s.load(Ordering::Relaxed),
            )
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn requests_allowed_under_limit() {
        let tracker = RateLimitTracker::new();
        assert!(tracker.can_send_request(1));
        assert!(tracker.can_send_request(10));
        assert_eq!(tracker.snapshot().request_count_10s, 11);
    }

    #[test]
    fn requests_blocked_over_limit() {
        let tracker = RateLimitTracker::new();
        assert!(!tracker.can_send_request(REQUEST_10S_LIMIT + 1));
    }

    #[test]
    fn orders_blocked_at_limit() {
        let tracker = RateLimitTracker::new();
        for _ in 0..ORDER_10S_LIMIT {
            assert!(tracker.can_place_order());
            tracker.record_order_sent();
        }
        assert!(!tracker.can_place_order());
    }

    #[test]
    fn retry_after_blocks_sends() {
        let tracker = RateLimitTracker::new();
        let mut headers = reqwest::header::HeaderMap::new();
        headers.insert(reqwest::header::RETRY_AFTER, "30".parse().unwrap());
        tracker.update_from_headers(&headers);

        assert!(!tracker.can_send_request(1));
        assert!(!tracker.can_place_order());
        assert!(tracker.snapshot().blocked);
    }
}
