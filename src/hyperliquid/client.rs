// =============================================================================
// Hyperliquid Info Client — REST history/positions + WS subscription facade
// =============================================================================
//
// The info endpoint is a single POST route dispatched on a `type` field.
// Numeric fields arrive as decimal strings. Transient failures (network,
// 5xx, 429) are retried in-place; 4xx responses surface to the caller.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::ws::{parse_ws_fill, WsManager};
use crate::types::{PositionSnapshot, RawFill};
use crate::upstream::Upstream;

/// How often the per-address position poller refreshes.
const POSITION_POLL_SECS: u64 = 30;
/// Transient-failure retries per info request.
const INFO_RETRIES: u32 = 2;

pub struct HyperliquidClient {
    http: reqwest::Client,
    info_url: String,
    ws: Arc<WsManager>,
    /// address → position poller task, aborted on unsubscribe.
    position_pollers: Mutex<HashMap<String, JoinHandle<()>>>,
}

impl HyperliquidClient {
    pub fn new(info_url: String, ws_url: String) -> Self {
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .expect("failed to build reqwest client");

        Self {
            http,
            info_url,
            ws: WsManager::start(ws_url),
            position_pollers: Mutex::new(HashMap::new()),
        }
    }

    /// POST one info request, retrying transient failures.
    async fn info(&self, body: serde_json::Value) -> Result<serde_json::Value> {
        let mut attempt = 0;
        loop {
            let result = self.http.post(&self.info_url).json(&body).send().await;

            match result {
                Ok(resp) => {
                    let status = resp.status();
                    if status.is_success() {
                        return resp.json().await.context("failed to parse info response");
                    }
                    // 429 and 5xx are retriable; other 4xx are not.
                    let retriable = status.as_u16() == 429 || status.is_server_error();
                    if !retriable || attempt >= INFO_RETRIES {
                        let text = resp.text().await.unwrap_or_default();
                        bail!("info request returned {status}: {text}");
                    }
                    warn!(status = %status, attempt, "info request failed — retrying");
                }
                Err(e) => {
                    if attempt >= INFO_RETRIES {
                        return Err(e).context("info request failed");
                    }
                    warn!(error = %e, attempt, "info request error — retrying");
                }
            }

            attempt += 1;
            tokio::time::sleep(std::time::Duration::from_millis(500 * u64::from(attempt))).await;
        }
    }

    /// Fetch and convert the clearinghouse state for one address.
    async fn clearinghouse_positions(&self, address: &str) -> Result<Vec<PositionSnapshot>> {
        let body = serde_json::json!({ "type": "clearinghouseState", "user": address });
        let resp = self.info(body).await?;
        resp["assetPositions"]
            .as_array()
            .context("clearinghouseState missing assetPositions")?;
        Ok(parse_clearinghouse(address, &resp))
    }
}

#[async_trait]
impl Upstream for HyperliquidClient {
    async fn subscribe_fills(&self, address: &str, tx: mpsc::Sender<RawFill>) -> Result<()> {
        self.ws.subscribe_fills(address, tx);
        Ok(())
    }

    async fn subscribe_positions(
        &self,
        address: &str,
        tx: mpsc::Sender<Vec<PositionSnapshot>>,
    ) -> Result<()> {
        // Positions come from periodic clearinghouse polls; there is no
        // dedicated push channel for them on the public feed.
        let address = address.to_string();
        let poll_address = address.clone();
        let http = self.http.clone();
        let info_url = self.info_url.clone();

        let handle = tokio::spawn(async move {
            let client = PollClient { http, info_url };
            let mut interval =
                tokio::time::interval(std::time::Duration::from_secs(POSITION_POLL_SECS));
            loop {
                interval.tick().await;
                match client.positions(&poll_address).await {
                    Ok(snapshots) => {
                        if tx.send(snapshots).await.is_err() {
                            debug!(address = %poll_address, "position mailbox closed — poller exiting");
                            return;
                        }
                    }
                    Err(e) => {
                        warn!(address = %poll_address, error = %e, "position poll failed");
                    }
                }
            }
        });

        if let Some(old) = self.position_pollers.lock().insert(address, handle) {
            old.abort();
        }
        Ok(())
    }

    async fn unsubscribe(&self, address: &str) -> Result<()> {
        self.ws.unsubscribe_fills(address);
        if let Some(handle) = self.position_pollers.lock().remove(address) {
            handle.abort();
        }
        Ok(())
    }

    async fn subscribe_price(&self, asset: &str, tx: mpsc::Sender<f64>) -> Result<()> {
        self.ws.subscribe_price(asset, tx);
        Ok(())
    }

    async fn fetch_user_fills(&self, address: &str, symbols: &[String]) -> Result<Vec<RawFill>> {
        let body = serde_json::json!({
            "type": "userFills",
            "user": address,
            "aggregateByTime": true
        });
        let resp = self.info(body).await?;

        let entries = resp.as_array().context("userFills response is not an array")?;
        let mut fills = Vec::with_capacity(entries.len());
        for value in entries {
            match parse_ws_fill(value) {
                Ok(fill) => {
                    if symbols.iter().any(|s| s == &fill.coin) {
                        fills.push(fill);
                    }
                }
                Err(e) => warn!(address = %address, error = %e, "skipping malformed history fill"),
            }
        }

        // The endpoint returns newest-first; chain ingestion wants oldest
        // first, and same-timestamp legs collapsed into one economic event.
        fills.sort_by_key(|f| f.time);
        Ok(aggregate_fills(fills))
    }

    async fn current_positions(&self, address: &str) -> Result<Vec<PositionSnapshot>> {
        self.clearinghouse_positions(address).await
    }

    fn connection_generation(&self) -> watch::Receiver<u64> {
        self.ws.connection_generation()
    }
}

/// Minimal clone of the info caller usable from the position poller task
/// without holding a reference to the full client.
struct PollClient {
    http: reqwest::Client,
    info_url: String,
}

impl PollClient {
    async fn positions(&self, address: &str) -> Result<Vec<PositionSnapshot>> {
        let body = serde_json::json!({ "type": "clearinghouseState", "user": address });
        let resp = self
            .http
            .post(&self.info_url)
            .json(&body)
            .send()
            .await
            .context("clearinghouseState request failed")?
            .error_for_status()
            .context("clearinghouseState returned an error status")?
            .json::<serde_json::Value>()
            .await
            .context("failed to parse clearinghouseState")?;

        Ok(parse_clearinghouse(address, &resp))
    }
}

/// Convert a clearinghouseState response into position snapshots, skipping
/// flat entries.
fn parse_clearinghouse(address: &str, resp: &serde_json::Value) -> Vec<PositionSnapshot> {
    let now = Utc::now();
    let mut out = Vec::new();

    if let Some(positions) = resp["assetPositions"].as_array() {
        for entry in positions {
            let p = &entry["position"];
            let Some(coin) = p["coin"].as_str() else { continue };
            let size: f64 = p["szi"].as_str().and_then(|s| s.parse().ok()).unwrap_or(0.0);
            if size == 0.0 {
                continue;
            }
            out.push(PositionSnapshot {
                address: address.to_string(),
                asset: coin.to_string(),
                size,
                entry_price: p["entryPx"]
                    .as_str()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(0.0),
                liquidation_price: p["liquidationPx"].as_str().and_then(|s| s.parse().ok()),
                leverage: p["leverage"]["value"].as_f64(),
                at: now,
            });
        }
    }
    out
}

// ---------------------------------------------------------------------------
// History aggregation
// ---------------------------------------------------------------------------

/// Collapse fills sharing (time, coin, side, price) into a single economic
/// event: sizes, fees, and realized PnL sum; the first leg's hash and
/// startPosition carry over. Input must be sorted oldest-first.
pub(crate) fn aggregate_fills(fills: Vec<RawFill>) -> Vec<RawFill> {
    let mut out: Vec<RawFill> = Vec::with_capacity(fills.len());

    for fill in fills {
        match out.last_mut() {
            Some(prev)
                if prev.time == fill.time
                    && prev.coin == fill.coin
                    && prev.side == fill.side
                    && prev.price == fill.price =>
            {
                prev.size += fill.size;
                prev.closed_pnl = merge_opt(prev.closed_pnl, fill.closed_pnl);
                prev.fee = merge_opt(prev.fee, fill.fee);
            }
            _ => out.push(fill),
        }
    }

    out
}

fn merge_opt(a: Option<f64>, b: Option<f64>) -> Option<f64> {
    match (a, b) {
        (Some(x), Some(y)) => Some(x + y),
        (Some(x), None) | (None, Some(x)) => Some(x),
        (None, None) => None,
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Side;

    fn fill(time: i64, coin: &str, side: Side, size: f64, price: f64, start: f64) -> RawFill {
        RawFill {
            hash: Some(format!("0x{time}-{size}")),
            coin: coin.to_string(),
            side,
            size,
            price,
            time,
            start_position: start,
            closed_pnl: Some(1.0),
            fee: Some(0.1),
            fee_token: Some("USDC".into()),
        }
    }

    #[test]
    fn aggregates_same_time_coin_side_price() {
        let fills = vec![
            fill(100, "BTC", Side::Buy, 0.5, 60_000.0, 0.0),
            fill(100, "BTC", Side::Buy, 0.25, 60_000.0, 0.5),
            fill(100, "BTC", Side::Buy, 0.25, 60_000.0, 0.75),
        ];
        let out = aggregate_fills(fills);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].size, 1.0);
        // First leg's startPosition and hash survive.
        assert_eq!(out[0].start_position, 0.0);
        assert_eq!(out[0].hash.as_deref(), Some("0x100-0.5"));
        assert_eq!(out[0].closed_pnl, Some(3.0));
        assert_eq!(out[0].fee, Some(0.30000000000000004));
    }

    #[test]
    fn different_price_stays_separate() {
        let fills = vec![
            fill(100, "BTC", Side::Buy, 0.5, 60_000.0, 0.0),
            fill(100, "BTC", Side::Buy, 0.5, 60_001.0, 0.5),
        ];
        assert_eq!(aggregate_fills(fills).len(), 2);
    }

    #[test]
    fn different_side_or_coin_stays_separate() {
        let fills = vec![
            fill(100, "BTC", Side::Buy, 0.5, 60_000.0, 0.0),
            fill(100, "BTC", Side::Sell, 0.5, 60_000.0, 0.5),
            fill(100, "ETH", Side::Buy, 0.5, 60_000.0, 0.0),
        ];
        assert_eq!(aggregate_fills(fills).len(), 3);
    }

    #[test]
    fn preserves_chronological_order() {
        let fills = vec![
            fill(100, "BTC", Side::Buy, 1.0, 60_000.0, 0.0),
            fill(200, "BTC", Side::Sell, 1.0, 61_000.0, 1.0),
            fill(300, "BTC", Side::Buy, 2.0, 59_000.0, 0.0),
        ];
        let out = aggregate_fills(fills);
        let times: Vec<i64> = out.iter().map(|f| f.time).collect();
        assert_eq!(times, vec![100, 200, 300]);
    }
}
