// =============================================================================
// Fan-out WebSocket — resumable event streaming for dashboards
// =============================================================================
//
// Protocol (single path /ws):
//   1. On connect the server sends `hello` with the ring head and current
//      prices, and the session cursor starts at 0 (full ring replay).
//   2. A client message `{"since": N}` moves the cursor and is answered with
//      one `batch` of up to 500 events past N.
//   3. Every second, sessions behind the ring head receive an `events`
//      frame with up to 200 new events; the cursor advances to the last
//      sequence sent.
//   4. Every two seconds, a `price` frame goes out if any price changed
//      since the session's last price frame.
//   5. Every thirty seconds a protocol ping goes out; a session that missed
//      the previous pong is terminated.
//
// A session whose socket errors is dropped; everyone else is unaffected.
// Each cursor lives on its session task, never shared with the ring writer.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use futures_util::{SinkExt, StreamExt};
use tokio::time::{interval, Duration};
use tracing::{debug, info, warn};

use crate::app_state::EngineState;
use crate::ring::RingEvent;
use crate::types::PriceSample;

/// Events per `batch` reply to a `since` request.
const BATCH_LIMIT: usize = 500;
/// Events per periodic `events` frame.
const EVENTS_PER_TICK: usize = 200;

const EVENTS_TICK: Duration = Duration::from_secs(1);
const PRICE_TICK: Duration = Duration::from_secs(2);
const PING_TICK: Duration = Duration::from_secs(30);

// =============================================================================
// Upgrade handler
// =============================================================================

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<EngineState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_session(socket, state))
}

// =============================================================================
// Session
// =============================================================================

async fn handle_session(socket: WebSocket, state: Arc<EngineState>) {
    let session = uuid::Uuid::new_v4();
    let clients = state.client_connected();
    info!(session = %session, clients, "fan-out client connected");

    let (mut sender, mut receiver) = socket.split();

    // Hello: ring head plus the current price table.
    let hello = hello_message(state.ring.latest_seq(), &state.price_feed.current_prices());
    if sender.send(Message::Text(hello.to_string())).await.is_err() {
        info!(session = %session, "client dropped before hello");
        state.client_disconnected();
        return;
    }

    let mut cursor: u64 = 0;
    let mut last_prices: HashMap<String, f64> = HashMap::new();
    let mut awaiting_pong = false;

    let mut events_tick = interval(EVENTS_TICK);
    let mut price_tick = interval(PRICE_TICK);
    let mut ping_tick = interval(PING_TICK);
    // The first tick of a tokio interval fires immediately; skip it so the
    // ping grace period starts after connect.
    ping_tick.tick().await;

    loop {
        tokio::select! {
            // ── Event delivery ──────────────────────────────────────────
            _ = events_tick.tick() => {
                if cursor >= state.ring.latest_seq() {
                    continue;
                }
                let events = state.ring.list_since(cursor, EVENTS_PER_TICK);
                let Some(last) = events.last().map(|e| e.seq) else { continue };

                let frame = events_message("events", &events);
                if let Err(e) = sender.send(Message::Text(frame.to_string())).await {
                    debug!(error = %e, "events send failed — dropping session");
                    break;
                }
                cursor = last;
            }

            // ── Price broadcast ─────────────────────────────────────────
            _ = price_tick.tick() => {
                let prices = state.price_feed.current_prices();
                let mids: HashMap<String, f64> =
                    prices.iter().map(|(k, v)| (k.clone(), v.mid)).collect();
                if mids == last_prices || mids.is_empty() {
                    continue;
                }

                let frame = price_message(&prices);
                if let Err(e) = sender.send(Message::Text(frame.to_string())).await {
                    debug!(error = %e, "price send failed — dropping session");
                    break;
                }
                last_prices = mids;
            }

            // ── Heartbeat ───────────────────────────────────────────────
            _ = ping_tick.tick() => {
                if awaiting_pong {
                    info!(session = %session, "client missed heartbeat — terminating session");
                    break;
                }
                if sender.send(Message::Ping(Vec::new())).await.is_err() {
                    break;
                }
                awaiting_pong = true;
            }

            // ── Client messages ─────────────────────────────────────────
            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        let Some(since) = parse_since(&text) else {
                            debug!(msg = %text, "ignoring unrecognized client message");
                            continue;
                        };

                        cursor = since;
                        let events = state.ring.list_since(since, BATCH_LIMIT);
                        if let Some(last) = events.last().map(|e| e.seq) {
                            cursor = cursor.max(last);
                        }
                        let frame = events_message("batch", &events);
                        if let Err(e) = sender.send(Message::Text(frame.to_string())).await {
                            debug!(error = %e, "batch send failed — dropping session");
                            break;
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if sender.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Pong(_))) => {
                        awaiting_pong = false;
                    }
                    Some(Ok(Message::Close(_))) => {
                        info!(session = %session, "client closed the connection");
                        break;
                    }
                    Some(Ok(Message::Binary(_))) => {
                        debug!("binary client message ignored");
                    }
                    Some(Err(e)) => {
                        warn!(error = %e, "client receive error — dropping session");
                        break;
                    }
                    None => break,
                }
            }
        }
    }

    let clients = state.client_disconnected();
    info!(session = %session, clients, "fan-out client disconnected");
}

// =============================================================================
// Frame builders
// =============================================================================

fn hello_message(latest_seq: u64, prices: &HashMap<String, PriceSample>) -> serde_json::Value {
    serde_json::json!({
        "type": "hello",
        "latestSeq": latest_seq,
        "prices": price_map(prices),
    })
}

fn events_message(kind: &str, events: &[RingEvent]) -> serde_json::Value {
    serde_json::json!({
        "type": kind,
        "events": events,
    })
}

fn price_message(prices: &HashMap<String, PriceSample>) -> serde_json::Value {
    let mut frame = serde_json::Map::new();
    frame.insert("type".into(), serde_json::Value::from("price"));
    for (asset, sample) in price_map(prices) {
        frame.insert(asset, sample);
    }
    serde_json::Value::Object(frame)
}

/// Lowercased asset → mid price.
fn price_map(prices: &HashMap<String, PriceSample>) -> serde_json::Map<String, serde_json::Value> {
    let mut map = serde_json::Map::new();
    for (asset, sample) in prices {
        map.insert(asset.to_lowercase(), serde_json::Value::from(sample.mid));
    }
    map
}

/// Parse a `{"since": N}` client message.
fn parse_since(text: &str) -> Option<u64> {
    let value: serde_json::Value = serde_json::from_str(text).ok()?;
    value.get("since")?.as_u64()
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ring::{EventRing, RingEventKind};
    use chrono::Utc;

    fn sample(mid: f64) -> PriceSample {
        PriceSample {
            mid,
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn parse_since_accepts_integers_only() {
        assert_eq!(parse_since(r#"{"since": 995}"#), Some(995));
        assert_eq!(parse_since(r#"{"since": 0}"#), Some(0));
        assert_eq!(parse_since(r#"{"since": -1}"#), None);
        assert_eq!(parse_since(r#"{"since": "995"}"#), None);
        assert_eq!(parse_since("not json"), None);
        assert_eq!(parse_since(r#"{"other": 1}"#), None);
    }

    #[test]
    fn hello_carries_head_and_prices() {
        let mut prices = HashMap::new();
        prices.insert("BTC".to_string(), sample(60_000.0));
        prices.insert("ETH".to_string(), sample(3_000.0));

        let hello = hello_message(1_000, &prices);
        assert_eq!(hello["type"], "hello");
        assert_eq!(hello["latestSeq"], 1_000);
        assert_eq!(hello["prices"]["btc"], 60_000.0);
        assert_eq!(hello["prices"]["eth"], 3_000.0);
    }

    #[test]
    fn price_frame_flattens_assets() {
        let mut prices = HashMap::new();
        prices.insert("BTC".to_string(), sample(60_000.0));
        prices.insert("ETH".to_string(), sample(3_000.0));

        let frame = price_message(&prices);
        assert_eq!(frame["type"], "price");
        assert_eq!(frame["btc"], 60_000.0);
        assert_eq!(frame["eth"], 3_000.0);
    }

    #[test]
    fn events_frame_preserves_ring_order() {
        let ring = EventRing::new(16);
        for i in 0..5 {
            ring.push(RingEventKind::Trade, serde_json::json!({ "i": i }));
        }
        let events = ring.list_since(2, 100);
        let frame = events_message("batch", &events);

        assert_eq!(frame["type"], "batch");
        let seqs: Vec<u64> = frame["events"]
            .as_array()
            .unwrap()
            .iter()
            .map(|e| e["seq"].as_u64().unwrap())
            .collect();
        assert_eq!(seqs, vec![3, 4, 5]);
    }
}
