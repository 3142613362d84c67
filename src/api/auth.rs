// =============================================================================
// Owner-Key Authentication — Axum extractor for the admin surface
// =============================================================================
//
// Mutating endpoints require the shared owner token in the `x-owner-key`
// header. The expected value comes from the engine configuration
// (OWNER_TOKEN); comparison runs in constant time to avoid a timing
// side-channel. A missing or wrong key short-circuits with 403 before the
// handler body executes.
// =============================================================================

use std::sync::Arc;

use axum::{
    extract::FromRequestParts,
    http::{request::Parts, StatusCode},
    response::{IntoResponse, Response},
};
use tracing::warn;

use crate::app_state::EngineState;

/// Header carrying the shared owner token.
pub const OWNER_KEY_HEADER: &str = "x-owner-key";

// =============================================================================
// Constant-time comparison
// =============================================================================

/// Compare two byte slices in constant time. Always examines every byte of
/// equal-length inputs even after a mismatch.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }

    let mut result: u8 = 0;
    for (x, y) in a.iter().zip(b.iter()) {
        result |= x ^ y;
    }
    result == 0
}

// =============================================================================
// Extractor
// =============================================================================

/// Extractor that validates `x-owner-key` against the configured token.
pub struct OwnerKey;

pub struct AuthRejection {
    status: StatusCode,
    message: &'static str,
}

impl IntoResponse for AuthRejection {
    fn into_response(self) -> Response {
        let body = serde_json::json!({ "error": self.message });
        (self.status, axum::Json(body)).into_response()
    }
}

#[async_trait::async_trait]
impl FromRequestParts<Arc<EngineState>> for OwnerKey {
    type Rejection = AuthRejection;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<EngineState>,
    ) -> Result<Self, Self::Rejection> {
        let expected = state.config.owner_token.as_bytes();

        if expected.is_empty() {
            warn!("OWNER_TOKEN is not set — rejecting all admin requests");
            return Err(AuthRejection {
                status: StatusCode::FORBIDDEN,
                message: "server authentication not configured",
            });
        }

        let presented = parts
            .headers
            .get(OWNER_KEY_HEADER)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");

        if !constant_time_eq(presented.as_bytes(), expected) {
            warn!("invalid owner key presented");
            return Err(AuthRejection {
                status: StatusCode::FORBIDDEN,
                message: "invalid owner key",
            });
        }

        Ok(OwnerKey)
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::ChainRepairer;
    use crate::config::Config;
    use crate::price_feed::PriceFeed;
    use crate::ring::EventRing;
    use crate::store::MemStore;
    use crate::tracker::RealtimeTracker;
    use crate::types::{PositionSnapshot, RawFill};
    use crate::upstream::Upstream;
    use crate::watchlist::Watchlist;
    use anyhow::Result;
    use async_trait::async_trait;
    use axum::http::Request;
    use metrics_exporter_prometheus::PrometheusBuilder;
    use tokio::sync::{mpsc, watch};

    const TOKEN: &str = "tok-9f2c41d8a7e3";

    // -- comparison helper ---------------------------------------------------

    #[test]
    fn equal_tokens_compare_equal() {
        assert!(constant_time_eq(TOKEN.as_bytes(), TOKEN.as_bytes()));
        assert!(constant_time_eq(b"", b""));
    }

    #[test]
    fn unequal_tokens_compare_unequal() {
        // Same length, one byte off at the end.
        assert!(!constant_time_eq(b"tok-9f2c41d8a7e3", b"tok-9f2c41d8a7e4"));
        // A truncated key never matches.
        assert!(!constant_time_eq(b"tok-9f2c", TOKEN.as_bytes()));
    }

    // -- extractor against a config-sourced token ----------------------------

    struct NullUpstream {
        generation: watch::Sender<u64>,
    }

    #[async_trait]
    impl Upstream for NullUpstream {
        async fn subscribe_fills(&self, _a: &str, _tx: mpsc::Sender<RawFill>) -> Result<()> {
            Ok(())
        }
        async fn subscribe_positions(
            &self,
            _a: &str,
            _tx: mpsc::Sender<Vec<PositionSnapshot>>,
        ) -> Result<()> {
            Ok(())
        }
        async fn unsubscribe(&self, _a: &str) -> Result<()> {
            Ok(())
        }
        async fn subscribe_price(&self, _asset: &str, _tx: mpsc::Sender<f64>) -> Result<()> {
            Ok(())
        }
        async fn fetch_user_fills(&self, _a: &str, _s: &[String]) -> Result<Vec<RawFill>> {
            Ok(Vec::new())
        }
        async fn current_positions(&self, _a: &str) -> Result<Vec<PositionSnapshot>> {
            Ok(Vec::new())
        }
        fn connection_generation(&self) -> watch::Receiver<u64> {
            self.generation.subscribe()
        }
    }

    fn engine_state(owner_token: &str) -> Arc<EngineState> {
        let config = Config {
            owner_token: owner_token.to_string(),
            ..Config::default()
        };
        let upstream: Arc<dyn Upstream> = Arc::new(NullUpstream {
            generation: watch::channel(0).0,
        });
        let store = Arc::new(MemStore::new());
        let ring = Arc::new(EventRing::new(16));
        let (publish_tx, _publish_rx) = mpsc::channel(8);

        let tracker = RealtimeTracker::new(
            upstream.clone(),
            store.clone(),
            ring.clone(),
            publish_tx,
            config.tracked_assets.clone(),
            config.position_prime_timeout,
            config.position_stale_after,
        );
        let price_feed = PriceFeed::new(upstream.clone(), store.clone(), config.tracked_assets.clone());
        let repairer = ChainRepairer::new(store.clone(), upstream.clone());
        let watchlist = Arc::new(Watchlist::new(
            config.scout_url.clone(),
            config.leaderboard_period.clone(),
            config.leaderboard_select_count,
            Vec::new(),
        ));
        let metrics = PrometheusBuilder::new().build_recorder().handle();

        EngineState::new(
            config, ring, tracker, price_feed, repairer, watchlist, store, metrics,
        )
    }

    fn parts_with_key(key: Option<&str>) -> Parts {
        let mut builder = Request::builder().uri("/api/v1/watchlist/refresh");
        if let Some(key) = key {
            builder = builder.header(OWNER_KEY_HEADER, key);
        }
        builder.body(()).unwrap().into_parts().0
    }

    #[tokio::test]
    async fn correct_key_from_config_is_accepted() {
        let state = engine_state(TOKEN);
        let mut parts = parts_with_key(Some(TOKEN));
        assert!(OwnerKey::from_request_parts(&mut parts, &state).await.is_ok());
    }

    #[tokio::test]
    async fn wrong_key_is_rejected() {
        let state = engine_state(TOKEN);
        let mut parts = parts_with_key(Some("tok-000000000000"));
        let rejection = OwnerKey::from_request_parts(&mut parts, &state)
            .await
            .err()
            .expect("wrong key must be rejected");
        assert_eq!(rejection.status, StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn missing_header_is_rejected() {
        let state = engine_state(TOKEN);
        let mut parts = parts_with_key(None);
        assert!(OwnerKey::from_request_parts(&mut parts, &state).await.is_err());
    }

    #[tokio::test]
    async fn unconfigured_token_rejects_everything() {
        // An empty OWNER_TOKEN must not make an empty header "match".
        let state = engine_state("");
        let mut parts = parts_with_key(Some(""));
        let rejection = OwnerKey::from_request_parts(&mut parts, &state)
            .await
            .err()
            .expect("empty configured token must lock the admin surface");
        assert_eq!(rejection.status, StatusCode::FORBIDDEN);
    }
}
