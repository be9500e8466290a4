// =============================================================================
// Liquidation Executor — turns exit signals into venue sell orders
// =============================================================================
//
// One liquidation attempt sequence per exit signal. The client order id is
// minted once per sequence and reused across every retry, so a sell whose
// response was lost can be recovered by lookup instead of resubmitted —
// duplicate sells would oversell the remaining position.
//
// Retry policy: transient failures back off linearly (retry_delay_ms x
// attempt) up to max_retry_attempts; a rejection aborts the sequence at once
// because resubmitting the identical order cannot succeed.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::types::ExitReason;
use crate::venue::{FillResult, VenueError, VenueGateway};

/// Terminal outcome of a liquidation sequence.
#[derive(Debug, thiserror::Error)]
pub enum LiquidationError {
    #[error("sell rejected by venue: {0}")]
    Rejected(String),

    #[error("sell failed after {attempts} attempts: {last_error}")]
    Exhausted { attempts: u32, last_error: String },
}

/// Executes market sells with bounded retries against a venue gateway.
#[derive(Clone)]
pub struct LiquidationExecutor {
    gateway: Arc<dyn VenueGateway>,
    max_retry_attempts: u32,
    retry_delay_ms: u64,
}

impl LiquidationExecutor {
    pub fn new(gateway: Arc<dyn VenueGateway>, max_retry_attempts: u32, retry_delay_ms: u64) -> Self {
        Self {
            gateway,
            max_retry_attempts,
            retry_delay_ms,
        }
    }

    /// Sell `quantity` of `symbol` at market, retrying transient failures.
    ///
    /// Produces exactly one fill per call even when responses are lost:
    /// before every resubmission the executor asks the venue whether the
    /// stable client order id already landed. A returned `Ok` always carries
    /// a positive executed quantity; an accepted order that reports zero
    /// execution is reconciled by lookup and otherwise retried.
    pub async fn sell(
        &self,
        strategy_id: &str,
        symbol: &str,
        quantity: f64,
        reason: ExitReason,
    ) -> Result<FillResult, LiquidationError> {
        let client_order_id = format!("kestrel-{}", Uuid::new_v4().simple());

        info!(
            strategy_id,
            symbol,
            quantity,
            %reason,
            client_order_id,
            "starting liquidation sequence"
        );

        let mut submitted = false;
        let mut last_error = String::new();

        for attempt in 1..=self.max_retry_attempts {
            // A previous submit may have landed even though its response was
            // lost. Check before sending the order again.
            if submitted {
                match self.gateway.query_order(symbol, &client_order_id).await {
                    Ok(Some(fill)) if fill.filled_quantity > 0.0 => {
                        info!(
                            strategy_id,
                            order_id = %fill.order_id,
                            filled = fill.filled_quantity,
                            "recovered fill from earlier submit"
                        );
                        return Ok(fill);
                    }
                    Ok(_) => {
                        debug!(strategy_id, attempt, "no prior fill on venue, resubmitting");
                    }
                    Err(e) => {
                        // Lookup failure is itself transient; fall through to
                        // the resubmit which carries the same id.
                        warn!(strategy_id, attempt, error = %e, "order lookup failed");
                    }
                }
            }

            match self
                .gateway
                .place_market_sell(symbol, quantity, &client_order_id)
                .await
            {
                Ok(fill) if fill.filled_quantity > 0.0 => {
                    info!(
                        strategy_id,
                        symbol,
                        order_id = %fill.order_id,
                        filled = fill.filled_quantity,
                        avg_price = fill.average_price,
                        %reason,
                        attempt,
                        "liquidation filled"
                    );
                    return Ok(fill);
                }
                Ok(fill) => {
                    // Accepted but reports nothing executed. Market sells
                    // normally fill immediately, so the response may have
                    // raced the match engine: confirm by lookup before
                    // counting the attempt as failed.
                    submitted = true;
                    last_error = format!("order {} executed zero quantity", fill.order_id);
                    warn!(
                        strategy_id,
                        symbol,
                        order_id = %fill.order_id,
                        attempt,
                        "sell accepted without a fill, reconciling by lookup"
                    );
                    if let Ok(Some(found)) =
                        self.gateway.query_order(symbol, &client_order_id).await
                    {
                        if found.filled_quantity > 0.0 {
                            info!(
                                strategy_id,
                                order_id = %found.order_id,
                                filled = found.filled_quantity,
                                "fill confirmed by lookup"
                            );
                            return Ok(found);
                        }
                    }
                    if attempt < self.max_retry_attempts {
                        let delay = self.retry_delay_ms * u64::from(attempt);
                        tokio::time::sleep(Duration::from_millis(delay)).await;
                    }
                }
                Err(VenueError::Rejected(msg)) => {
                    warn!(strategy_id, symbol, %msg, "sell rejected, aborting sequence");
                    return Err(LiquidationError::Rejected(msg));
                }
                Err(e) => {
                    submitted = true;
                    last_error = e.to_string();
                    warn!(
                        strategy_id,
                        symbol,
                        attempt,
                        max_attempts = self.max_retry_attempts,
                        error = %last_error,
                        "sell attempt failed"
                    );
                    if attempt < self.max_retry_attempts {
                        let delay = self.retry_delay_ms * u64::from(attempt);
                        tokio::time::sleep(Duration::from_millis(delay)).await;
                    }
                }
            }
        }

        Err(LiquidationError::Exhausted {
            attempts: self.max_retry_attempts,
            last_error,
        })
    }
}

impl std::fmt::Debug for LiquidationExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LiquidationExecutor")
            .field("max_retry_attempts", &self.max_retry_attempts)
            .field("retry_delay_ms", &self.retry_delay_ms)
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
    use parking_lot::Mutex;
    use std::collections::HashMap;

    use crate::venue::OrderBookSummary;

    /// Scriptable gateway: fails the first `fail_sells` sells, records every
    /// order id it sees, and can pretend an earlier submit landed.
    struct MockGateway {
        fail_sells: Mutex<u32>,
        reject: bool,
        /// Sells answered with an accepted order carrying zero executed qty.
        zero_fills: Mutex<u32>,
        /// Whether a zero-fill response still lands a real fill on the venue.
        land_zero_fills: bool,
        /// Fill registered under a client order id, served by query_order.
        landed: Mutex<HashMap<String, FillResult>>,
        sell_ids: Mutex<Vec<String>>,
        fills: Mutex<u32>,
    }

    impl MockGateway {
        fn new(fail_sells: u32) -> Self {
            Self {
                fail_sells: Mutex::new(fail_sells),
                reject: false,
                zero_fills: Mutex::new(0),
                land_zero_fills: false,
                landed: Mutex::new(HashMap::new()),
                sell_ids: Mutex::new(Vec::new()),
                fills: Mutex::new(0),
            }
        }

        fn rejecting() -> Self {
            Self {
                reject: true,
                ..Self::new(0)
            }
        }

        fn zero_filling(zero_fills: u32, land_zero_fills: bool) -> Self {
            Self {
                zero_fills: Mutex::new(zero_fills),
                land_zero_fills,
                ..Self::new(0)
            }
        }
    }

    #[async_trait]
    impl VenueGateway for MockGateway {
        async fn get_price(&self, _symbol: &str) -> Result<f64, VenueError> {
            Ok(1.0)
        }

        async fn get_order_book_summary(
            &self,
            _symbol: &str,
        ) -> Result<OrderBookSummary, VenueError> {
            Ok(OrderBookSummary {
                best_bid: Some(1.0),
                best_ask: Some(1.01),
            })
        }

        async fn place_market_buy(
            &self,
            _symbol: &str,
            _quote_amount: f64,
            _client_order_id: &str,
        ) -> Result<FillResult, VenueError> {
            unimplemented!("not used in these tests")
        }

        async fn place_market_sell(
            &self,
            _symbol: &str,
            quantity: f64,
            client_order_id: &str,
        ) -> Result<FillResult, VenueError> {
            self.sell_ids.lock().push(client_order_id.to_string());

            if self.reject {
                return Err(VenueError::Rejected("Oversold".into()));
            }

            let mut remaining = self.fail_sells.lock();
            if *remaining > 0 {
                *remaining -= 1;
                return Err(VenueError::Transient("connection reset".into()));
            }
            drop(remaining);

            let mut zero = self.zero_fills.lock();
            if *zero > 0 {
                *zero -= 1;
                if self.land_zero_fills {
                    self.landed.lock().insert(
                        client_order_id.to_string(),
                        FillResult {
                            order_id: "V2".into(),
                            client_order_id: client_order_id.to_string(),
                            filled_quantity: quantity,
                            average_price: 1.0,
                        },
                    );
                }
                return Ok(FillResult {
                    order_id: "V2".into(),
                    client_order_id: client_order_id.to_string(),
                    filled_quantity: 0.0,
                    average_price: 0.0,
                });
            }

            *self.fills.lock() += 1;
            Ok(FillResult {
                order_id: "V1".into(),
                client_order_id: client_order_id.to_string(),
                filled_quantity: quantity,
                average_price: 1.0,
            })
        }

        async fn query_order(
            &self,
            _symbol: &str,
            client_order_id: &str,
        ) -> Result<Option<FillResult>, VenueError> {
            Ok(self.landed.lock().get(client_order_id).cloned())
        }
    }

    fn executor(gateway: Arc<MockGateway>) -> LiquidationExecutor {
        LiquidationExecutor::new(gateway, 5, 1)
    }

    #[tokio::test]
    async fn transient_failures_retry_then_fill_once() {
        let gateway = Arc::new(MockGateway::new(2));
        let exec = executor(Arc::clone(&gateway));

        let fill = exec
            .sell("NEWUSDT-1", "NEWUSDT", 50.0, ExitReason::TakeProfit)
            .await
            .unwrap();

        assert!((fill.filled_quantity - 50.0).abs() < 1e-12);
        assert_eq!(*gateway.fills.lock(), 1, "exactly one completed sell");
        // All attempts carried the same client order id.
        let ids = gateway.sell_ids.lock();
        assert_eq!(ids.len(), 3);
        assert!(ids.iter().all(|id| id == &ids[0]));
    }

    #[tokio::test]
    async fn rejection_aborts_without_retrying() {
        let gateway = Arc::new(MockGateway::rejecting());
        let exec = executor(Arc::clone(&gateway));

        let err = exec
            .sell("NEWUSDT-1", "NEWUSDT", 50.0, ExitReason::StopLoss)
            .await
            .unwrap_err();

        assert!(matches!(err, LiquidationError::Rejected(_)));
        assert_eq!(gateway.sell_ids.lock().len(), 1);
    }

    #[tokio::test]
    async fn lost_response_is_recovered_by_lookup_not_resubmitted() {
        let gateway = Arc::new(MockGateway::new(u32::MAX));
        let exec = executor(Arc::clone(&gateway));

        // Simulate: first submit reached the venue but the response was lost.
        // Register a landed fill after the first attempt runs.
        let gw = Arc::clone(&gateway);
        let handle = tokio::spawn(async move {
            exec.sell("NEWUSDT-1", "NEWUSDT", 50.0, ExitReason::TrailingStop)
                .await
        });

        // Wait for the first attempt, then mark its order id as landed.
        loop {
            tokio::time::sleep(Duration::from_millis(1)).await;
            let ids = gw.sell_ids.lock();
            if let Some(id) = ids.first() {
                gw.landed.lock().insert(
                    id.clone(),
                    FillResult {
                        order_id: "V9".into(),
                        client_order_id: id.clone(),
                        filled_quantity: 50.0,
                        average_price: 1.0,
                    },
                );
                break;
            }
        }

        let fill = handle.await.unwrap().unwrap();
        assert_eq!(fill.order_id, "V9");
        // The recovered fill came from lookup; no sell ever completed.
        assert_eq!(*gateway.fills.lock(), 0);
    }

    #[tokio::test]
    async fn zero_fill_response_is_reconciled_by_lookup() {
        // The venue accepts the sell but its response reports zero executed
        // quantity; the real fill is visible through order lookup.
        let gateway = Arc::new(MockGateway::zero_filling(1, true));
        let exec = executor(Arc::clone(&gateway));

        let fill = exec
            .sell("NEWUSDT-1", "NEWUSDT", 50.0, ExitReason::StopLoss)
            .await
            .unwrap();

        assert!((fill.filled_quantity - 50.0).abs() < 1e-12);
        assert!(fill.filled_quantity > 0.0);
        // Reconciled by lookup, never resubmitted.
        assert_eq!(gateway.sell_ids.lock().len(), 1);
    }

    #[tokio::test]
    async fn persistent_zero_fills_exhaust_instead_of_reporting_success() {
        let gateway = Arc::new(MockGateway::zero_filling(u32::MAX, false));
        let exec = executor(Arc::clone(&gateway));

        let err = exec
            .sell("NEWUSDT-1", "NEWUSDT", 50.0, ExitReason::TakeProfit)
            .await
            .unwrap_err();

        assert!(matches!(err, LiquidationError::Exhausted { .. }));
        assert_eq!(*gateway.fills.lock(), 0);
    }

    #[tokio::test]
    async fn exhausted_after_max_attempts() {
        let gateway = Arc::new(MockGateway::new(u32::MAX));
        let exec = executor(Arc::clone(&gateway));

        let err = exec
            .sell("NEWUSDT-1", "NEWUSDT", 50.0, ExitReason::TimeLimit)
            .await
            .unwrap_err();

        match err {
            LiquidationError::Exhausted { attempts, .. } => assert_eq!(attempts, 5),
            other => panic!("expected Exhausted, got {other:?}"),
        }
        assert_eq!(gateway.sell_ids.lock().len(), 5);
    }
}
