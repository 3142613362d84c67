// =============================================================================
// Hyperliquid WebSocket session — multiplexed subscriptions with reconnect
// =============================================================================
//
// One socket carries every subscription: `userFills` per watched address and
// `l2Book` per tracked asset. The session task owns the socket; the rest of
// the engine talks to it through a registry of handler channels plus a
// command channel for frames that must go out on the live connection.
//
// On reconnect the whole registry is replayed, then the connection
// generation counter bumps so the tracker can re-prime position state.
// Exponential backoff between attempts, capped at 32 s.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use futures_util::{SinkExt, StreamExt};
use parking_lot::RwLock;
use serde::Deserialize;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message};
use tracing::{debug, error, info, warn};

use crate::types::{RawFill, Side};

/// Keepalive interval; Hyperliquid drops idle sockets after ~60 s.
const PING_INTERVAL_SECS: u64 = 30;
/// Reconnect backoff ceiling.
const MAX_BACKOFF_SECS: u64 = 32;

// ---------------------------------------------------------------------------
// Subscription registry
// ---------------------------------------------------------------------------

#[derive(Default)]
struct Registry {
    /// address → realtime fill mailbox
    fills: HashMap<String, mpsc::Sender<RawFill>>,
    /// coin → mid-price mailbox
    prices: HashMap<String, mpsc::Sender<f64>>,
}

/// Frames the engine asks the live connection to send.
enum Command {
    Subscribe(serde_json::Value),
    Unsubscribe(serde_json::Value),
}

// ---------------------------------------------------------------------------
// Manager handle
// ---------------------------------------------------------------------------

/// Shared handle to the WebSocket session task.
pub struct WsManager {
    registry: Arc<RwLock<Registry>>,
    cmd_tx: mpsc::UnboundedSender<Command>,
    generation_rx: watch::Receiver<u64>,
}

impl WsManager {
    /// Spawn the session task against `ws_url` and return the handle.
    pub fn start(ws_url: String) -> Arc<Self> {
        let registry = Arc::new(RwLock::new(Registry::default()));
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (generation_tx, generation_rx) = watch::channel(0u64);

        let task_registry = registry.clone();
        tokio::spawn(async move {
            run_session(ws_url, task_registry, cmd_rx, generation_tx).await;
        });

        Arc::new(Self {
            registry,
            cmd_tx,
            generation_rx,
        })
    }

    pub fn connection_generation(&self) -> watch::Receiver<u64> {
        self.generation_rx.clone()
    }

    /// Watch realtime fills for `address`.
    pub fn subscribe_fills(&self, address: &str, tx: mpsc::Sender<RawFill>) {
        self.registry.write().fills.insert(address.to_string(), tx);
        let _ = self
            .cmd_tx
            .send(Command::Subscribe(fills_subscription(address)));
    }

    /// Drop the fill subscription for `address`.
    pub fn unsubscribe_fills(&self, address: &str) {
        if self.registry.write().fills.remove(address).is_some() {
            let _ = self
                .cmd_tx
                .send(Command::Unsubscribe(fills_subscription(address)));
        }
    }

    /// Watch the book mid price for `coin`.
    pub fn subscribe_price(&self, coin: &str, tx: mpsc::Sender<f64>) {
        self.registry.write().prices.insert(coin.to_string(), tx);
        let _ = self
            .cmd_tx
            .send(Command::Subscribe(price_subscription(coin)));
    }
}

fn fills_subscription(address: &str) -> serde_json::Value {
    serde_json::json!({ "type": "userFills", "user": address })
}

fn price_subscription(coin: &str) -> serde_json::Value {
    serde_json::json!({ "type": "l2Book", "coin": coin })
}

// ---------------------------------------------------------------------------
// Session task
// ---------------------------------------------------------------------------

async fn run_session(
    ws_url: String,
    registry: Arc<RwLock<Registry>>,
    mut cmd_rx: mpsc::UnboundedReceiver<Command>,
    generation_tx: watch::Sender<u64>,
) {
    let mut backoff_secs: u64 = 1;

    loop {
        info!(url = %ws_url, "connecting upstream WebSocket");
        match connect_async(&ws_url).await {
            Ok((ws_stream, _response)) => {
                info!("upstream WebSocket connected");
                backoff_secs = 1;

                let (mut write, mut read) = ws_stream.split();

                // Replay the full registry on every (re)connect.
                let frames: Vec<serde_json::Value> = {
                    let reg = registry.read();
                    reg.fills
                        .keys()
                        .map(|a| fills_subscription(a))
                        .chain(reg.prices.keys().map(|c| price_subscription(c)))
                        .collect()
                };
                let mut subscribe_failed = false;
                for sub in frames {
                    let frame =
                        serde_json::json!({ "method": "subscribe", "subscription": sub });
                    if let Err(e) = write.send(Message::Text(frame.to_string())).await {
                        error!(error = %e, "resubscribe failed — reconnecting");
                        subscribe_failed = true;
                        break;
                    }
                }
                if subscribe_failed {
                    tokio::time::sleep(std::time::Duration::from_secs(backoff_secs)).await;
                    continue;
                }

                // Signal a fresh connection so the tracker re-primes.
                generation_tx.send_modify(|g| *g += 1);

                let mut ping = tokio::time::interval(std::time::Duration::from_secs(
                    PING_INTERVAL_SECS,
                ));
                ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

                loop {
                    tokio::select! {
                        _ = ping.tick() => {
                            let frame = serde_json::json!({ "method": "ping" });
                            if let Err(e) = write.send(Message::Text(frame.to_string())).await {
                                warn!(error = %e, "upstream ping failed — reconnecting");
                                break;
                            }
                        }

                        cmd = cmd_rx.recv() => {
                            let Some(cmd) = cmd else { return };
                            let frame = match cmd {
                                Command::Subscribe(sub) => {
                                    serde_json::json!({ "method": "subscribe", "subscription": sub })
                                }
                                Command::Unsubscribe(sub) => {
                                    serde_json::json!({ "method": "unsubscribe", "subscription": sub })
                                }
                            };
                            if let Err(e) = write.send(Message::Text(frame.to_string())).await {
                                warn!(error = %e, "subscription frame failed — reconnecting");
                                break;
                            }
                        }

                        msg = read.next() => {
                            match msg {
                                Some(Ok(Message::Text(text))) => {
                                    dispatch_message(&registry, &text).await;
                                }
                                Some(Ok(Message::Ping(data))) => {
                                    let _ = write.send(Message::Pong(data)).await;
                                }
                                Some(Ok(Message::Close(_))) => {
                                    warn!("upstream closed the WebSocket — reconnecting");
                                    break;
                                }
                                Some(Ok(_)) => {}
                                Some(Err(e)) => {
                                    error!(error = %e, "upstream WebSocket read error — reconnecting");
                                    break;
                                }
                                None => {
                                    warn!("upstream WebSocket stream ended — reconnecting");
                                    break;
                                }
                            }
                        }
                    }
                }
            }
            Err(e) => {
                error!(error = %e, retry_in_secs = backoff_secs, "upstream connect failed");
            }
        }

        tokio::time::sleep(std::time::Duration::from_secs(backoff_secs)).await;
        backoff_secs = (backoff_secs * 2).min(MAX_BACKOFF_SECS);
    }
}

// ---------------------------------------------------------------------------
// Message dispatch
// ---------------------------------------------------------------------------

async fn dispatch_message(registry: &Arc<RwLock<Registry>>, text: &str) {
    let Ok(parsed) = serde_json::from_str::<serde_json::Value>(text) else {
        debug!("unparseable upstream frame ignored");
        return;
    };

    match parsed["channel"].as_str().unwrap_or("") {
        "userFills" => {
            let Some(data) = parsed.get("data") else { return };
            // The first frame after subscribing is a history snapshot; the
            // tracker primes from the REST history instead, so only live
            // deltas flow through here.
            if data["isSnapshot"].as_bool().unwrap_or(false) {
                return;
            }
            let Some(user) = data["user"].as_str() else { return };
            let address = user.to_lowercase();

            let tx = registry.read().fills.get(&address).cloned();
            let Some(tx) = tx else { return };

            let Some(fills) = data["fills"].as_array() else { return };
            for value in fills {
                match parse_ws_fill(value) {
                    Ok(fill) => {
                        if tx.send(fill).await.is_err() {
                            warn!(address = %address, "fill mailbox closed — dropping subscription handler");
                            registry.write().fills.remove(&address);
                            return;
                        }
                    }
                    Err(e) => {
                        warn!(address = %address, error = %e, "failed to parse upstream fill");
                    }
                }
            }
        }

        "l2Book" => {
            let Some(data) = parsed.get("data") else { return };
            let Some(coin) = data["coin"].as_str() else { return };
            let Some(mid) = book_mid(data) else { return };

            let tx = registry.read().prices.get(coin).cloned();
            if let Some(tx) = tx {
                // Price updates are a lossy feed; drop on a full mailbox
                // rather than stalling the socket reader.
                let _ = tx.try_send(mid);
            }
        }

        // Subscription acks and keepalive replies.
        "subscriptionResponse" | "pong" => {}

        other => {
            debug!(channel = %other, "unhandled upstream channel");
        }
    }
}

/// Mid price from an l2Book frame: mean of best bid and best ask.
fn book_mid(data: &serde_json::Value) -> Option<f64> {
    let levels = data["levels"].as_array()?;
    let best_bid: f64 = levels.first()?.as_array()?.first()?["px"]
        .as_str()?
        .parse()
        .ok()?;
    let best_ask: f64 = levels.get(1)?.as_array()?.first()?["px"]
        .as_str()?
        .parse()
        .ok()?;
    Some((best_bid + best_ask) / 2.0)
}

// ---------------------------------------------------------------------------
// Fill parsing
// ---------------------------------------------------------------------------

/// Wire shape of one fill on the `userFills` channel. Numeric fields arrive
/// as decimal strings.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WsFill {
    coin: String,
    px: String,
    sz: String,
    side: String,
    time: i64,
    start_position: String,
    #[serde(default)]
    closed_pnl: Option<String>,
    #[serde(default)]
    hash: Option<String>,
    #[serde(default)]
    fee: Option<String>,
    #[serde(default)]
    fee_token: Option<String>,
}

pub(crate) fn parse_ws_fill(value: &serde_json::Value) -> Result<RawFill> {
    let wire: WsFill =
        serde_json::from_value(value.clone()).context("malformed userFills entry")?;

    let size: f64 = wire.sz.parse().context("bad fill size")?;
    let price: f64 = wire.px.parse().context("bad fill price")?;
    let start_position: f64 = wire
        .start_position
        .parse()
        .context("bad fill startPosition")?;

    Ok(RawFill {
        hash: wire.hash.filter(|h| !h.is_empty()),
        coin: wire.coin,
        side: Side::parse(&wire.side)?,
        size,
        price,
        time: wire.time,
        start_position,
        closed_pnl: wire.closed_pnl.and_then(|s| s.parse().ok()),
        fee: wire.fee.and_then(|s| s.parse().ok()),
        fee_token: wire.fee_token,
    })
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_a_user_fill_frame_entry() {
        let value = serde_json::json!({
            "coin": "BTC",
            "px": "60000.5",
            "sz": "0.25",
            "side": "B",
            "time": 1_700_000_000_000i64,
            "startPosition": "-1.5",
            "closedPnl": "12.5",
            "hash": "0xabc123",
            "fee": "0.9",
            "feeToken": "USDC",
            "oid": 42,
            "crossed": true
        });

        let fill = parse_ws_fill(&value).unwrap();
        assert_eq!(fill.coin, "BTC");
        assert_eq!(fill.side, Side::Buy);
        assert_eq!(fill.size, 0.25);
        assert_eq!(fill.price, 60_000.5);
        assert_eq!(fill.start_position, -1.5);
        assert_eq!(fill.closed_pnl, Some(12.5));
        assert_eq!(fill.hash.as_deref(), Some("0xabc123"));
        assert_eq!(fill.fee_token.as_deref(), Some("USDC"));
    }

    #[test]
    fn empty_hash_becomes_none() {
        let value = serde_json::json!({
            "coin": "ETH",
            "px": "3000",
            "sz": "1",
            "side": "A",
            "time": 1_700_000_000_000i64,
            "startPosition": "2.0"
        });

        let fill = parse_ws_fill(&value).unwrap();
        assert_eq!(fill.hash, None);
        assert_eq!(fill.side, Side::Sell);
        assert_eq!(fill.closed_pnl, None);
    }

    #[test]
    fn rejects_malformed_numerics() {
        let value = serde_json::json!({
            "coin": "BTC",
            "px": "sixty thousand",
            "sz": "1",
            "side": "B",
            "time": 0,
            "startPosition": "0"
        });
        assert!(parse_ws_fill(&value).is_err());
    }

    #[test]
    fn book_mid_averages_best_levels() {
        let data = serde_json::json!({
            "coin": "BTC",
            "levels": [
                [ { "px": "59990", "sz": "1", "n": 3 }, { "px": "59980", "sz": "2", "n": 1 } ],
                [ { "px": "60010", "sz": "1", "n": 2 } ]
            ]
        });
        assert_eq!(book_mid(&data), Some(60_000.0));
    }

    #[test]
    fn book_mid_requires_both_sides() {
        let data = serde_json::json!({ "coin": "BTC", "levels": [ [], [ { "px": "60010", "sz": "1", "n": 1 } ] ] });
        assert_eq!(book_mid(&data), None);
    }
}
