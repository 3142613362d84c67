// =============================================================================
// REST API Endpoints — Axum 0.7
// =============================================================================
//
// Public: /healthz and /metrics. Everything mutating or operator-facing
// under /api/v1/ requires the owner key (see auth module). Status mapping:
// 200 on success, 403 on a bad key, 400 on an invalid body, 502 when an
// upstream dependency (scout, exchange) is unreachable, 500 otherwise.
//
// CORS is configured permissively for dashboard development.
// =============================================================================

use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, Json, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Router,
};
use serde::Deserialize;
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};

use crate::api::auth::OwnerKey;
use crate::app_state::EngineState;
use crate::types::normalize_address;

// =============================================================================
// Router construction
// =============================================================================

/// Build the full router: health, metrics, admin endpoints, and the fan-out
/// WebSocket.
pub fn router(state: Arc<EngineState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        // ── Public ──────────────────────────────────────────────────
        .route("/healthz", get(healthz))
        .route("/metrics", get(metrics))
        // ── Fan-out WebSocket ───────────────────────────────────────
        .route("/ws", get(crate::api::ws::ws_handler))
        // ── Admin (owner key) ───────────────────────────────────────
        .route("/api/v1/watchlist/refresh", post(watchlist_refresh))
        .route("/api/v1/fills/fetch-history", post(fills_fetch_history))
        .route("/api/v1/fills/validate", post(fills_validate))
        .route("/api/v1/fills/repair", post(fills_repair))
        .route("/api/v1/fills/repair-all", post(fills_repair_all))
        .route("/api/v1/positions/status", get(positions_status))
        // ── Middleware & State ──────────────────────────────────────
        .layer(cors)
        .with_state(state)
}

/// 502 when the failure chain bottoms out in an HTTP transport error (the
/// upstream dependency is unreachable), 500 otherwise.
fn dependency_status(error: &anyhow::Error) -> StatusCode {
    let transport = error
        .chain()
        .any(|cause| cause.downcast_ref::<reqwest::Error>().is_some());
    if transport {
        StatusCode::BAD_GATEWAY
    } else {
        StatusCode::INTERNAL_SERVER_ERROR
    }
}

fn error_body(error: &anyhow::Error) -> Json<serde_json::Value> {
    Json(serde_json::json!({ "error": format!("{error:#}") }))
}

// =============================================================================
// Health & metrics (public)
// =============================================================================

async fn healthz(State(state): State<Arc<EngineState>>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "watchlist": state.watchlist.len(),
        "clients": state.client_count(),
        "positions_ready": state.tracker.positions_ready(),
        "uptime_secs": state.uptime_secs(),
        "server_time": chrono::Utc::now().timestamp_millis(),
    }))
}

async fn metrics(State(state): State<Arc<EngineState>>) -> impl IntoResponse {
    state.metrics.render()
}

// =============================================================================
// Watchlist
// =============================================================================

async fn watchlist_refresh(
    _auth: OwnerKey,
    State(state): State<Arc<EngineState>>,
) -> impl IntoResponse {
    let addresses = match state.watchlist.recompute().await {
        Ok(addresses) => addresses,
        Err(e) => {
            warn!(error = %e, "manual watchlist refresh failed");
            return (dependency_status(&e), error_body(&e)).into_response();
        }
    };

    let outcome = match state.tracker.refresh(&addresses, false).await {
        Ok(outcome) => outcome,
        Err(e) => {
            warn!(error = %e, "tracker reconcile failed");
            return (dependency_status(&e), error_body(&e)).into_response();
        }
    };
    state.price_feed.refresh().await;

    info!(
        total = addresses.len(),
        added = outcome.added.len(),
        removed = outcome.removed.len(),
        "watchlist refreshed via admin API"
    );
    Json(serde_json::json!({
        "watchlist": addresses,
        "added": outcome.added,
        "removed": outcome.removed,
    }))
    .into_response()
}

// =============================================================================
// Fill history
// =============================================================================

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct FetchHistoryRequest {
    #[serde(default)]
    before_time: Option<chrono::DateTime<chrono::Utc>>,
    #[serde(default = "default_history_limit")]
    limit: usize,
    #[serde(default)]
    addresses: Option<Vec<String>>,
}

fn default_history_limit() -> usize {
    100
}

async fn fills_fetch_history(
    _auth: OwnerKey,
    State(state): State<Arc<EngineState>>,
    body: Result<Json<FetchHistoryRequest>, JsonRejection>,
) -> impl IntoResponse {
    let Json(req) = match body {
        Ok(body) => body,
        Err(e) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(serde_json::json!({ "error": e.to_string() })),
            )
                .into_response()
        }
    };

    let addresses = match normalize_all(req.addresses) {
        Ok(addresses) => addresses,
        Err(resp) => return resp,
    };

    let limit = req.limit.clamp(1, 1_000);
    match state
        .store
        .get_backfill_fills(req.before_time, limit, addresses.as_deref())
        .await
    {
        Ok(page) => Json(serde_json::json!({
            "fills": page.fills,
            "hasMore": page.has_more,
            "oldestTime": page.oldest_time,
        }))
        .into_response(),
        Err(e) => (dependency_status(&e), error_body(&e)).into_response(),
    }
}

/// Normalize an optional address list, turning the first bad entry into a
/// 400 response.
fn normalize_all(raw: Option<Vec<String>>) -> Result<Option<Vec<String>>, axum::response::Response> {
    let Some(raw) = raw else { return Ok(None) };
    let mut out = Vec::with_capacity(raw.len());
    for addr in &raw {
        match normalize_address(addr) {
            Ok(normalized) => out.push(normalized),
            Err(e) => {
                return Err((
                    StatusCode::BAD_REQUEST,
                    Json(serde_json::json!({ "error": e.to_string() })),
                )
                    .into_response())
            }
        }
    }
    Ok(Some(out))
}

// =============================================================================
// Chain validation & repair
// =============================================================================

#[derive(Deserialize)]
struct ChainRequest {
    address: String,
    asset: String,
}

impl ChainRequest {
    /// Normalize and check the pair against the configured asset set.
    fn resolve(&self, state: &EngineState) -> Result<(String, String), axum::response::Response> {
        let address = normalize_address(&self.address).map_err(|e| {
            (
                StatusCode::BAD_REQUEST,
                Json(serde_json::json!({ "error": e.to_string() })),
            )
                .into_response()
        })?;

        let asset = self.asset.to_uppercase();
        if !state.config.tracked_assets.contains(&asset) {
            return Err((
                StatusCode::BAD_REQUEST,
                Json(serde_json::json!({ "error": format!("unknown asset: {}", self.asset) })),
            )
                .into_response());
        }

        Ok((address, asset))
    }
}

async fn fills_validate(
    _auth: OwnerKey,
    State(state): State<Arc<EngineState>>,
    body: Result<Json<ChainRequest>, JsonRejection>,
) -> impl IntoResponse {
    let Json(req) = match body {
        Ok(body) => body,
        Err(e) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(serde_json::json!({ "error": e.to_string() })),
            )
                .into_response()
        }
    };
    let (address, asset) = match req.resolve(&state) {
        Ok(pair) => pair,
        Err(resp) => return resp,
    };

    match state.repairer.validate(&address, &asset).await {
        Ok(report) => Json(report).into_response(),
        Err(e) => (dependency_status(&e), error_body(&e)).into_response(),
    }
}

async fn fills_repair(
    _auth: OwnerKey,
    State(state): State<Arc<EngineState>>,
    body: Result<Json<ChainRequest>, JsonRejection>,
) -> impl IntoResponse {
    let Json(req) = match body {
        Ok(body) => body,
        Err(e) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(serde_json::json!({ "error": e.to_string() })),
            )
                .into_response()
        }
    };
    let (address, asset) = match req.resolve(&state) {
        Ok(pair) => pair,
        Err(resp) => return resp,
    };

    match state.repairer.repair(&address, &asset).await {
        Ok(outcome) => Json(outcome).into_response(),
        Err(e) => {
            warn!(address = %address, asset = %asset, error = %e, "manual repair failed");
            (dependency_status(&e), error_body(&e)).into_response()
        }
    }
}

#[derive(Deserialize)]
struct RepairAllRequest {
    /// Restrict to one asset; absent means every tracked asset.
    #[serde(default)]
    asset: Option<String>,
}

async fn fills_repair_all(
    _auth: OwnerKey,
    State(state): State<Arc<EngineState>>,
    body: Result<Json<RepairAllRequest>, JsonRejection>,
) -> impl IntoResponse {
    // An empty body means "all assets".
    let req = match body {
        Ok(Json(req)) => req,
        Err(JsonRejection::MissingJsonContentType(_)) => RepairAllRequest { asset: None },
        Err(e) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(serde_json::json!({ "error": e.to_string() })),
            )
                .into_response()
        }
    };

    let assets: Vec<String> = match req.asset {
        Some(asset) => {
            let asset = asset.to_uppercase();
            if !state.config.tracked_assets.contains(&asset) {
                return (
                    StatusCode::BAD_REQUEST,
                    Json(serde_json::json!({ "error": format!("unknown asset: {asset}") })),
                )
                    .into_response();
            }
            vec![asset]
        }
        None => state.config.tracked_assets.clone(),
    };

    let addresses = state.tracker.tracked_addresses();
    let outcome = state.repairer.sweep(&assets, &addresses).await;
    Json(outcome).into_response()
}

// =============================================================================
// Positions
// =============================================================================

async fn positions_status(
    _auth: OwnerKey,
    State(state): State<Arc<EngineState>>,
) -> impl IntoResponse {
    Json(serde_json::json!({
        "positionsReady": state.tracker.positions_ready(),
        "tracked": state.tracker.tracked_addresses().len(),
        "snapshotAgesSecs": state.tracker.position_ages(),
        "positions": state.tracker.position_snapshots(),
    }))
}
