// =============================================================================
// MEXC REST API Client — HMAC-SHA256 signed requests
// =============================================================================
//
// SECURITY: The secret key is never logged or serialized. All signed requests
// include X-MEXC-APIKEY as a header and a recvWindow of 5 000 ms to tolerate
// minor clock drift between the bot and MEXC servers.
// =============================================================================

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::Context;
use async_trait::async_trait;
use hmac::{Hmac, Mac};
use reqwest::header::{HeaderMap, HeaderValue};
use reqwest::StatusCode;
use sha2::Sha256;
use tracing::{debug, instrument, warn};

use super::rate_limit::RateLimitTracker;
use super::{FillResult, OrderBookSummary, VenueError, VenueGateway};

type HmacSha256 = Hmac<Sha256>;

/// Default recv-window sent with every signed request (milliseconds).
const RECV_WINDOW: u64 = 5000;

/// MEXC error codes that mean the order as submitted can never succeed.
const REJECTION_CODES: &[i64] = &[
    -1013, // invalid quantity / filter failure
    -1121, // invalid symbol
    -2010, // new order rejected (insufficient balance, oversold)
    -2011, // cancel rejected
];

/// MEXC error code for "order does not exist".
const ORDER_NOT_FOUND_CODE: i64 = -2013;

/// MEXC REST API client with HMAC-SHA256 request signing.
#[derive(Clone)]
pub struct MexcClient {
    api_key: String,
    secret: String,
    base_url: String,
    client: reqwest::Client,
    rate_limit: Arc<RateLimitTracker>,
}

impl MexcClient {
    // -------------------------------------------------------------------------
    // Construction
    // -------------------------------------------------------------------------

    /// Create a new `MexcClient`.
    ///
    /// # Arguments
    /// * `api_key` — MEXC API key (sent as a header, never in query params).
    /// * `secret`  — MEXC secret key used exclusively for HMAC signing.
    pub fn new(api_key: impl Into<String>, secret: impl Into<String>) -> Self {
        Self::with_base_url(api_key, secret, "https://api.mexc.com")
    }

    /// Create a client against an alternate base URL (test servers).
    pub fn with_base_url(
        api_key: impl Into<String>,
        secret: impl Into<String>,
        base_url: impl Into<String>,
    ) -> Self {
        let api_key = api_key.into();
        let secret = secret.into();
        let base_url = base_url.into();

        let mut default_headers = HeaderMap::new();
        // The API key header is required for all signed endpoints.
        if let Ok(val) = HeaderValue::from_str(&api_key) {
            default_headers.insert("X-MEXC-APIKEY", val);
        }

        let client = reqwest::Client::builder()
            .default_headers(default_headers)
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .expect("failed to build reqwest client");

        debug!(%base_url, "MexcClient initialised");

        Self {
            api_key,
            secret,
            base_url,
            client,
            rate_limit: Arc::new(RateLimitTracker::new()),
        }
    }

    /// Shared handle to the rate-limit tracker for dashboard snapshots.
    pub fn rate_limit(&self) -> Arc<RateLimitTracker> {
        Arc::clone(&self.rate_limit)
    }

    // -------------------------------------------------------------------------
    // Signing helpers
    // -------------------------------------------------------------------------

    /// Produce an HMAC-SHA256 hex signature of `query`.
    fn sign(&self, query: &str) -> String {
        let mut mac =
            HmacSha256::new_from_slice(self.secret.as_bytes()).expect("HMAC accepts any key size");
        mac.update(query.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    /// Current UNIX timestamp in milliseconds.
    fn timestamp_ms() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system clock before UNIX epoch")
            .as_millis() as u64
    }

    /// Build the full query string for a signed request (appends timestamp,
    /// recvWindow, and signature).
    fn signed_query(&self, params: &str) -> String {
        let ts = Self::timestamp_ms();
        let base = if params.is_empty() {
            format!("timestamp={ts}&recvWindow={RECV_WINDOW}")
        } else {
            format!("{params}&timestamp={ts}&recvWindow={RECV_WINDOW}")
        };
        let sig = self.sign(&base);
        format!("{base}&signature={sig}")
    }

    // -------------------------------------------------------------------------
    // Request plumbing
    // -------------------------------------------------------------------------

    /// Send a request and classify the outcome into the venue error taxonomy.
    async fn send_classified(
        &self,
        req: reqwest::RequestBuilder,
        what: &str,
    ) -> Result<serde_json::Value, VenueError> {
        if !self.rate_limit.can_send_request(1) {
            return Err(VenueError::Transient(format!(
                "{what}: local rate-limit ceiling reached"
            )));
        }

        let resp = req.send().await.map_err(|e| {
            if e.is_timeout() || e.is_connect() {
                VenueError::Transient(format!("{what}: {e}"))
            } else {
                VenueError::Other(anyhow::Error::new(e).context(format!("{what} request failed")))
            }
        })?;

        self.rate_limit.update_from_headers(resp.headers());

        let status = resp.status();
        let body: serde_json::Value = resp
            .json()
            .await
            .with_context(|| format!("failed to parse {what} response"))
            .map_err(VenueError::Other)?;

        if status.is_success() {
            return Ok(body);
        }

        let code = body["code"].as_i64().unwrap_or(0);
        let msg = body["msg"].as_str().unwrap_or("").to_string();

        if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
            warn!(%status, code, %msg, "{what}: transient venue failure");
            return Err(VenueError::Transient(format!("{what}: {status} {msg}")));
        }
        if REJECTION_CODES.contains(&code) {
            return Err(VenueError::Rejected(format!("{what}: {code} {msg}")));
        }
        Err(VenueError::Other(anyhow::anyhow!(
            "{what} returned {status}: {body}"
        )))
    }

    /// Parse a JSON value that may be either a string or a number into `f64`.
    fn parse_str_f64(val: &serde_json::Value) -> Result<f64, VenueError> {
        if let Some(s) = val.as_str() {
            s.parse::<f64>()
                .with_context(|| format!("failed to parse '{s}' as f64"))
                .map_err(VenueError::Other)
        } else if let Some(n) = val.as_f64() {
            Ok(n)
        } else {
            Err(VenueError::Other(anyhow::anyhow!(
                "expected string or number, got: {val}"
            )))
        }
    }

    /// Build a `FillResult` from an order payload (POST /order or GET /order).
    fn fill_from_order_body(body: &serde_json::Value) -> Result<FillResult, VenueError> {
        let executed_qty = Self::parse_str_f64(&body["executedQty"]).unwrap_or(0.0);
        let quote_qty = Self::parse_str_f64(&body["cummulativeQuoteQty"]).unwrap_or(0.0);

        // MEXC market orders report fills through executedQty and the
        // cumulative quote amount; the average price is derived.
        let average_price = if executed_qty > 0.0 {
            quote_qty / executed_qty
        } else {
            0.0
        };

        Ok(FillResult {
            order_id: body["orderId"]
                .as_str()
                .map(str::to_string)
                .unwrap_or_else(|| body["orderId"].to_string()),
            client_order_id: body["clientOrderId"]
                .as_str()
                .unwrap_or_default()
                .to_string(),
            filled_quantity: executed_qty,
            average_price,
        })
    }
}

// =============================================================================
// VenueGateway implementation
// =============================================================================

#[async_trait]
impl VenueGateway for MexcClient {
    /// GET /api/v3/ticker/price (public).
    #[instrument(skip(self), name = "mexc::get_price")]
    async fn get_price(&self, symbol: &str) -> Result<f64, VenueError> {
        let url = format!("{}/api/v3/ticker/price?symbol={symbol}", self.base_url);
        let body = self
            .send_classified(self.client.get(&url), "GET /api/v3/ticker/price")
            .await?;
        let price = Self::parse_str_f64(&body["price"])?;
        debug!(symbol, price, "price fetched");
        Ok(price)
    }

    /// GET /api/v3/depth (public) — top of book only.
    #[instrument(skip(self), name = "mexc::get_depth")]
    async fn get_order_book_summary(&self, symbol: &str) -> Result<OrderBookSummary, VenueError> {
        let url = format!("{}/api/v3/depth?symbol={symbol}&limit=5", self.base_url);
        let body = self
            .send_classified(self.client.get(&url), "GET /api/v3/depth")
            .await?;

        let top_of = |side: &str| -> Option<f64> {
            body[side]
                .as_array()
                .and_then(|levels| levels.first())
                .and_then(|level| level.as_array())
                .and_then(|level| level.first())
                .and_then(|price| Self::parse_str_f64(price).ok())
        };

        Ok(OrderBookSummary {
            best_bid: top_of("bids"),
            best_ask: top_of("asks"),
        })
    }

    /// POST /api/v3/order (signed) — MARKET buy by quote amount.
    #[instrument(skip(self), name = "mexc::market_buy")]
    async fn place_market_buy(
        &self,
        symbol: &str,
        quote_amount: f64,
        client_order_id: &str,
    ) -> Result<FillResult, VenueError> {
        if !self.rate_limit.can_place_order() {
            return Err(VenueError::Transient(
                "local order-rate ceiling reached".into(),
            ));
        }

        let params = format!(
            "symbol={symbol}&side=BUY&type=MARKET&quoteOrderQty={quote_amount}\
             &newClientOrderId={client_order_id}"
        );
        let qs = self.signed_query(&params);
        let url = format!("{}/api/v3/order?{}", self.base_url, qs);

        debug!(symbol, quote_amount, client_order_id, "placing market buy");
        self.rate_limit.record_order_sent();

        let body = self
            .send_classified(self.client.post(&url), "POST /api/v3/order (buy)")
            .await?;
        Self::fill_from_order_body(&body)
    }

    /// POST /api/v3/order (signed) — MARKET sell by base quantity.
    #[instrument(skip(self), name = "mexc::market_sell")]
    async fn place_market_sell(
        &self,
        symbol: &str,
        quantity: f64,
        client_order_id: &str,
    ) -> Result<FillResult, VenueError> {
        if !self.rate_limit.can_place_order() {
            return Err(VenueError::Transient(
                "local order-rate ceiling reached".into(),
            ));
        }

        let params = format!(
            "symbol={symbol}&side=SELL&type=MARKET&quantity={quantity}\
             &newClientOrderId={client_order_id}"
        );
        let qs = self.signed_query(&params);
        let url = format!("{}/api/v3/order?{}", self.base_url, qs);

        debug!(symbol, quantity, client_order_id, "placing market sell");
        self.rate_limit.record_order_sent();

        let body = self
            .send_classified(self.client.post(&url), "POST /api/v3/order (sell)")
            .await?;
        Self::fill_from_order_body(&body)
    }

    /// GET /api/v3/order (signed) — look up an order by client order id.
    #[instrument(skip(self), name = "mexc::query_order")]
    async fn query_order(
        &self,
        symbol: &str,
        client_order_id: &str,
    ) -> Result<Option<FillResult>, VenueError> {
        let params = format!("symbol={symbol}&origClientOrderId={client_order_id}");
        let qs = self.signed_query(&params);
        let url = format!("{}/api/v3/order?{}", self.base_url, qs);

        match self
            .send_classified(self.client.get(&url), "GET /api/v3/order")
            .await
        {
            Ok(body) => Ok(Some(Self::fill_from_order_body(&body)?)),
            Err(VenueError::Other(e)) => {
                // "Order does not exist" means the previous submit never
                // reached the matching engine.
                let text = format!("{e:#}");
                if text.contains(&ORDER_NOT_FOUND_CODE.to_string()) {
                    debug!(symbol, client_order_id, "order not found on venue");
                    Ok(None)
                } else {
                    Err(VenueError::Other(e))
                }
            }
            Err(e) => Err(e),
        }
    }
}

impl std::fmt::Debug for MexcClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MexcClient")
            .field("api_key", &"<redacted>")
            .field("secret", &"<redacted>")
            .field("base_url", &self.base_url)
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
    fn debug_never_leaks_credentials() {
        let client = MexcClient::new("my-key", "my-secret");
        let dbg = format!("{client:?}");
        assert!(!dbg.contains("my-key"));
        assert!(!dbg.contains("my-secret"));
        assert!(dbg.contains("<redacted>"));
    }

    #[test]
    fn signature_is_deterministic_hex() {
        let client = MexcClient::new("key", "secret");
        let a = client.sign("symbol=NEWUSDT&timestamp=1");
        let b = client.sign("symbol=NEWUSDT&timestamp=1");
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn fill_parses_market_order_body() {
        let body = serde_json::json!({
            "orderId": "C02__443776428081",
            "clientOrderId": "kestrel-abc",
            "executedQty": "80.0",
            "cummulativeQuoteQty": "96.0",
            "status": "FILLED"
        });
        let fill = MexcClient::fill_from_order_body(&body).unwrap();
        assert_eq!(fill.order_id, "C02__443776428081");
        assert_eq!(fill.client_order_id, "kestrel-abc");
        assert!((fill.filled_quantity - 80.0).abs() < 1e-12);
        assert!((fill.average_price - 1.2).abs() < 1e-12);
    }

    #[test]
    fn fill_with_zero_executed_has_zero_price() {
        let body = serde_json::json!({
            "orderId": 123,
            "clientOrderId": "kestrel-x",
            "executedQty": "0",
            "cummulativeQuoteQty": "0"
        });
        let fill = MexcClient::fill_from_order_body(&body).unwrap();
        assert_eq!(fill.filled_quantity, 0.0);
        assert_eq!(fill.average_price, 0.0);
    }

    #[test]
    fn order_book_liquidity_check() {
        let empty = OrderBookSummary {
            best_bid: None,
            best_ask: None,
        };
        assert!(!empty.has_liquidity());

        let one_sided = OrderBookSummary {
            best_bid: None,
            best_ask: Some(1.0),
        };
        assert!(one_sided.has_liquidity());
    }
}
