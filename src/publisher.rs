// =============================================================================
// Durable Publisher — canonical fill events onto NATS JetStream
// =============================================================================
//
// Downstream services (signal scorer, consensus aggregator, executor) consume
// `c.fills.v1`. Each internal record is mapped to the canonical FillEvent
// shape, validated, and published with acknowledgement. Transient bus errors
// retry with backoff; a fill that exhausts its retry budget is dropped with
// a warning and a counter — consumers dedup on fill_id, so the relay leans
// at-least-once rather than blocking ingestion.
//
// Stream declaration is the only startup-fatal dependency of the process:
// if the stream cannot be created, downstream durability cannot be promised
// and the relay refuses to start.
// =============================================================================

use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use async_nats::jetstream;
use chrono::{DateTime, Utc};
use metrics::{counter, histogram};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::types::FillRecord;

/// Subject downstream consumers subscribe to.
pub const FILLS_SUBJECT: &str = "c.fills.v1";
/// JetStream stream that retains the subject.
pub const FILLS_STREAM: &str = "C_FILLS";

/// Publish attempts per event (first try + retries).
const PUBLISH_ATTEMPTS: u32 = 4;
/// Base backoff between attempts; doubles per retry.
const PUBLISH_BACKOFF: Duration = Duration::from_millis(250);

// ---------------------------------------------------------------------------
// Canonical fill event
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct FillEventMeta {
    pub action: Option<String>,
}

/// Wire shape on `c.fills.v1`.
#[derive(Debug, Clone, Serialize)]
pub struct FillEvent {
    pub fill_id: String,
    pub source: &'static str,
    pub address: String,
    pub asset: String,
    pub side: &'static str,
    pub size: f64,
    pub price: f64,
    pub start_position: Option<f64>,
    pub realized_pnl: Option<f64>,
    pub ts: DateTime<Utc>,
    pub meta: FillEventMeta,
}

impl FillEvent {
    pub fn from_record(record: &FillRecord) -> Self {
        Self {
            fill_id: record.hash.clone(),
            source: "hyperliquid",
            address: record.address.clone(),
            asset: record.asset.clone(),
            side: if record.action.is_buy() { "buy" } else { "sell" },
            size: record.size,
            price: record.price_usd,
            start_position: Some(record.start_position),
            realized_pnl: record.realized_pnl_usd,
            ts: record.at,
            meta: FillEventMeta {
                action: Some(record.action.to_string()),
            },
        }
    }

    /// Reject events that would poison downstream consumers: missing
    /// identifiers, non-positive sizes/prices, or non-finite numbers.
    pub fn validate(&self) -> Result<()> {
        if self.fill_id.is_empty() {
            bail!("fill_id is empty");
        }
        if self.address.is_empty() {
            bail!("address is empty");
        }
        if self.asset.is_empty() {
            bail!("asset is empty");
        }
        if !self.size.is_finite() || self.size <= 0.0 {
            bail!("size must be finite and positive, got {}", self.size);
        }
        if !self.price.is_finite() || self.price <= 0.0 {
            bail!("price must be finite and positive, got {}", self.price);
        }
        if let Some(v) = self.start_position {
            if !v.is_finite() {
                bail!("start_position is not finite");
            }
        }
        if let Some(v) = self.realized_pnl {
            if !v.is_finite() {
                bail!("realized_pnl is not finite");
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Publisher
// ---------------------------------------------------------------------------

pub struct BusPublisher {
    jetstream: jetstream::Context,
}

impl BusPublisher {
    /// Connect to the bus and declare the fills stream. Failure here is
    /// fatal to startup.
    pub async fn connect(nats_url: &str) -> Result<Self> {
        let client = async_nats::connect(nats_url)
            .await
            .with_context(|| format!("failed to connect to NATS at {nats_url}"))?;
        let jetstream = jetstream::new(client);

        jetstream
            .get_or_create_stream(jetstream::stream::Config {
                name: FILLS_STREAM.to_string(),
                subjects: vec![FILLS_SUBJECT.to_string()],
                ..Default::default()
            })
            .await
            .context("failed to declare the fills stream")?;

        info!(url = %nats_url, stream = FILLS_STREAM, "bus publisher connected");
        Ok(Self { jetstream })
    }

    /// Spawn the retry worker draining the tracker's publish channel. When
    /// the shutdown signal fires the channel stops accepting new fills, the
    /// backlog is flushed, and the worker exits; main bounds the flush with
    /// a deadline.
    pub fn spawn_worker(
        self,
        mut rx: mpsc::Receiver<FillRecord>,
        mut shutdown: tokio::sync::watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    maybe = rx.recv() => {
                        match maybe {
                            Some(record) => self.publish(&record).await,
                            None => break,
                        }
                    }
                    _ = shutdown.changed() => {
                        rx.close();
                        while let Some(record) = rx.recv().await {
                            self.publish(&record).await;
                        }
                        break;
                    }
                }
            }
            info!("bus publisher worker drained and stopped");
        })
    }

    /// Validate and publish one event, retrying transient failures with
    /// bounded backoff.
    pub async fn publish(&self, record: &FillRecord) {
        let event = FillEvent::from_record(record);
        if let Err(e) = event.validate() {
            warn!(fill_id = %event.fill_id, error = %e, "rejecting invalid fill event");
            counter!("bus_events_rejected_total", 1);
            return;
        }

        let payload = match serde_json::to_vec(&event) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(fill_id = %event.fill_id, error = %e, "failed to encode fill event");
                counter!("bus_events_rejected_total", 1);
                return;
            }
        };

        let started = Instant::now();
        let mut backoff = PUBLISH_BACKOFF;

        for attempt in 1..=PUBLISH_ATTEMPTS {
            match self.try_publish(payload.clone()).await {
                Ok(()) => {
                    histogram!(
                        "bus_publish_latency_seconds",
                        started.elapsed().as_secs_f64()
                    );
                    counter!("bus_published_total", 1);
                    debug!(fill_id = %event.fill_id, attempt, "fill event published");
                    return;
                }
                Err(e) if attempt < PUBLISH_ATTEMPTS => {
                    warn!(
                        fill_id = %event.fill_id,
                        attempt,
                        error = %e,
                        "bus publish failed — backing off"
                    );
                    tokio::time::sleep(backoff).await;
                    backoff *= 2;
                }
                Err(e) => {
                    warn!(
                        fill_id = %event.fill_id,
                        error = %e,
                        "bus publish failed after {PUBLISH_ATTEMPTS} attempts — dropping event"
                    );
                    counter!("bus_publish_failures_total", 1);
                }
            }
        }
    }

    async fn try_publish(&self, payload: Vec<u8>) -> Result<()> {
        let ack = self
            .jetstream
            .publish(FILLS_SUBJECT, payload.into())
            .await
            .context("publish failed")?;
        ack.await.context("publish was not acknowledged")?;
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifier::LifecycleAction;

    fn record() -> FillRecord {
        FillRecord {
            address: "0xaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa1".into(),
            asset: "BTC".into(),
            at: Utc::now(),
            action: LifecycleAction::CloseLong,
            size: 1.0,
            start_position: 1.0,
            price_usd: 61_000.0,
            realized_pnl_usd: Some(1_000.0),
            fee: Some(0.5),
            fee_token: Some("USDC".into()),
            hash: "0xfill".into(),
        }
    }

    #[test]
    fn maps_record_to_canonical_shape() {
        let event = FillEvent::from_record(&record());
        assert_eq!(event.fill_id, "0xfill");
        assert_eq!(event.source, "hyperliquid");
        assert_eq!(event.side, "sell");
        assert_eq!(event.start_position, Some(1.0));
        assert_eq!(event.realized_pnl, Some(1_000.0));
        assert_eq!(event.meta.action.as_deref(), Some("Close Long (Close All)"));
        assert!(event.validate().is_ok());
    }

    #[test]
    fn buy_actions_map_to_buy_side() {
        let mut r = record();
        r.action = LifecycleAction::DecreaseShort;
        assert_eq!(FillEvent::from_record(&r).side, "buy");
    }

    #[test]
    fn wire_shape_uses_snake_case_keys() {
        let event = FillEvent::from_record(&record());
        let v = serde_json::to_value(&event).unwrap();
        assert!(v.get("fill_id").is_some());
        assert!(v.get("start_position").is_some());
        assert!(v.get("realized_pnl").is_some());
        assert_eq!(v["meta"]["action"], "Close Long (Close All)");
        assert_eq!(v["source"], "hyperliquid");
    }

    #[test]
    fn validation_rejects_bad_events() {
        let mut event = FillEvent::from_record(&record());
        event.size = 0.0;
        assert!(event.validate().is_err());

        let mut event = FillEvent::from_record(&record());
        event.price = f64::NAN;
        assert!(event.validate().is_err());

        let mut event = FillEvent::from_record(&record());
        event.fill_id.clear();
        assert!(event.validate().is_err());

        let mut event = FillEvent::from_record(&record());
        event.start_position = Some(f64::INFINITY);
        assert!(event.validate().is_err());

        let mut event = FillEvent::from_record(&record());
        event.realized_pnl = Some(f64::NAN);
        assert!(event.validate().is_err());
    }

    #[test]
    fn validation_accepts_absent_optionals() {
        let mut event = FillEvent::from_record(&record());
        event.start_position = None;
        event.realized_pnl = None;
        assert!(event.validate().is_ok());
    }
}
