// =============================================================================
// Upstream seam — what the tracker and repairer need from the exchange
// =============================================================================
//
// The tracker, price feed, and chain repairer are written against this trait
// so tests can drive them with a scripted fake. `HyperliquidClient` is the
// production implementation.
// =============================================================================

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::{mpsc, watch};

use crate::types::{PositionSnapshot, RawFill};

#[async_trait]
pub trait Upstream: Send + Sync {
    /// Register for realtime fills of one address. Fills arrive on `tx` in
    /// upstream order. No dedup happens at this layer.
    async fn subscribe_fills(&self, address: &str, tx: mpsc::Sender<RawFill>) -> Result<()>;

    /// Register for position snapshot updates of one address.
    async fn subscribe_positions(
        &self,
        address: &str,
        tx: mpsc::Sender<Vec<PositionSnapshot>>,
    ) -> Result<()>;

    /// Tear down all subscriptions for one address.
    async fn unsubscribe(&self, address: &str) -> Result<()>;

    /// Register for mid-price updates of one asset.
    async fn subscribe_price(&self, asset: &str, tx: mpsc::Sender<f64>) -> Result<()>;

    /// Historical fills for one address, oldest to newest, restricted to
    /// `symbols`, with same-(time, coin, side, price) legs aggregated into a
    /// single economic event.
    async fn fetch_user_fills(&self, address: &str, symbols: &[String]) -> Result<Vec<RawFill>>;

    /// Current position snapshots for one address.
    async fn current_positions(&self, address: &str) -> Result<Vec<PositionSnapshot>>;

    /// Connection generation counter. Bumps on every successful (re)connect;
    /// the tracker watches it to re-prime positions after an upstream drop.
    fn connection_generation(&self) -> watch::Receiver<u64>;
}
