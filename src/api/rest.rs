// =============================================================================
// REST API Endpoints — Axum 0.7
// =============================================================================
//
// All endpoints live under `/api/v1/`. Health is public; everything else
// requires a valid Bearer token checked via the `AuthBearer` extractor.
//
// Handlers only read snapshots or enqueue requests — they never mutate a
// strategy directly. A manual close is recorded in the close-request set and
// applied by the strategy's own monitor task on its next cycle.
//
// CORS is configured permissively for development; tighten `allowed_origins`
// in production.
// =============================================================================

use std::sync::Arc;

use axum::{
    extract::{Json, Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};

use crate::api::auth::AuthBearer;
use crate::app_state::AppState;

// =============================================================================
// Router construction
// =============================================================================

/// Build the full REST API router with CORS middleware and shared state.
pub fn router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        // ── Public ──────────────────────────────────────────────────
        .route("/api/v1/health", get(health))
        // ── Authenticated ───────────────────────────────────────────
        .route("/api/v1/strategies", get(list_strategies))
        .route("/api/v1/strategies/:id", get(get_strategy))
        .route("/api/v1/strategies/:id/close", post(close_strategy))
        .route("/api/v1/position/:symbol", get(symbol_position))
        .route("/api/v1/completions", get(completions))
        .route("/api/v1/errors", get(recent_errors))
        .route("/api/v1/snipe", post(start_snipe))
        // ── Middleware & State ──────────────────────────────────────
        .layer(cors)
        .with_state(state)
}

// =============================================================================
// Health (public)
// =============================================================================

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    state_version: u64,
    uptime_secs: u64,
    active_strategies: usize,
    degraded_store: bool,
    rate_limit: Option<crate::venue::RateLimitSnapshot>,
    server_time: i64,
}

async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let resp = HealthResponse {
        status: if state.store_degraded() {
            "degraded"
        } else {
            "ok"
        },
        state_version: state.version(),
        uptime_secs: state.uptime_secs(),
        active_strategies: state.registry.list_active().len(),
        degraded_store: state.store_degraded(),
        rate_limit: state.rate_limit_snapshot(),
        server_time: chrono::Utc::now().timestamp_millis(),
    };
    Json(resp)
}

// =============================================================================
// Strategies (authenticated)
// =============================================================================

async fn list_strategies(
    _auth: AuthBearer,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    Json(state.registry.list_active())
}

async fn get_strategy(
    _auth: AuthBearer,
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    match state.registry.get(&id) {
        Some(strategy) => Json(strategy).into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({ "error": "unknown strategy id" })),
        )
            .into_response(),
    }
}

async fn close_strategy(
    _auth: AuthBearer,
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    if state.request_close(&id) {
        info!(strategy_id = %id, "manual close accepted");
        (
            StatusCode::ACCEPTED,
            Json(serde_json::json!({ "status": "close_requested", "strategy_id": id })),
        )
            .into_response()
    } else {
        (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({ "error": "unknown or already terminal strategy" })),
        )
            .into_response()
    }
}

// =============================================================================
// Aggregate position (authenticated)
// =============================================================================

#[derive(Serialize)]
struct PositionResponse {
    symbol: String,
    total_remaining: f64,
    strategies: Vec<crate::strategy::Strategy>,
}

async fn symbol_position(
    _auth: AuthBearer,
    State(state): State<Arc<AppState>>,
    Path(symbol): Path<String>,
) -> impl IntoResponse {
    Json(PositionResponse {
        total_remaining: state.registry.total_position(&symbol),
        strategies: state.registry.list_by_symbol(&symbol),
        symbol,
    })
}

// =============================================================================
// Completions journal (authenticated)
// =============================================================================

#[derive(Deserialize)]
struct CompletionsQuery {
    #[serde(default = "default_completions_limit")]
    limit: usize,
}

fn default_completions_limit() -> usize {
    50
}

async fn completions(
    _auth: AuthBearer,
    State(state): State<Arc<AppState>>,
    Query(query): Query<CompletionsQuery>,
) -> impl IntoResponse {
    Json(state.store.recent_completions(query.limit.min(500)))
}

// =============================================================================
// Recent errors (authenticated)
// =============================================================================

async fn recent_errors(
    _auth: AuthBearer,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    Json(state.recent_errors())
}

// =============================================================================
// Snipe (authenticated)
// =============================================================================

#[derive(Deserialize)]
struct SnipeRequest {
    symbol: String,
    quote_amount: Option<f64>,
}

async fn start_snipe(
    _auth: AuthBearer,
    State(state): State<Arc<AppState>>,
    Json(req): Json<SnipeRequest>,
) -> impl IntoResponse {
    let symbol = req.symbol.trim().to_uppercase();
    if symbol.is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({ "error": "symbol is required" })),
        )
            .into_response();
    }

    let (quote_amount, min_order_quote) = {
        let cfg = state.config.read();
        (
            req.quote_amount.unwrap_or(cfg.default_quote_amount),
            cfg.min_order_quote,
        )
    };
    if quote_amount < min_order_quote {
        return (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({
                "error": format!("quote_amount below venue minimum {min_order_quote}")
            })),
        )
            .into_response();
    }

    info!(symbol, quote_amount, "snipe requested");

    let task_state = Arc::clone(&state);
    let task_symbol = symbol.clone();
    tokio::spawn(async move {
        let outcome =
            crate::acquisition::run_snipe(Arc::clone(&task_state), task_symbol.clone(), quote_amount)
                .await;
        if let Err(e) = outcome {
            warn!(symbol = %task_symbol, error = %format!("{e:#}"), "snipe failed");
            task_state.push_error("snipe", format!("{e:#}"));
        }
    });

    (
        StatusCode::ACCEPTED,
        Json(serde_json::json!({
            "status": "snipe_started",
            "symbol": symbol,
            "quote_amount": quote_amount,
        })),
    )
        .into_response()
}
