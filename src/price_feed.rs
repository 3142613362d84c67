// =============================================================================
// Price Feed — last-known mid price per tracked asset
// =============================================================================
//
// One upstream subscription per configured asset, established once and kept
// for the life of the process. The table is copy-on-update: readers clone
// the snapshot they need and never block the drain tasks. A version counter
// bumps on every accepted update so the fan-out broadcaster can cheaply
// detect "something changed since I last sent".
// =============================================================================

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::Utc;
use parking_lot::RwLock;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::store::FillStore;
use crate::types::PriceSample;
use crate::upstream::Upstream;

/// Mid-price updates queued per asset before the drain task catches up.
const PRICE_MAILBOX: usize = 64;

pub struct PriceFeed {
    upstream: Arc<dyn Upstream>,
    store: Arc<dyn FillStore>,
    assets: Vec<String>,
    prices: Arc<RwLock<HashMap<String, PriceSample>>>,
    subscribed: RwLock<HashSet<String>>,
    version_tx: watch::Sender<u64>,
}

impl PriceFeed {
    pub fn new(
        upstream: Arc<dyn Upstream>,
        store: Arc<dyn FillStore>,
        assets: Vec<String>,
    ) -> Arc<Self> {
        let (version_tx, _) = watch::channel(0u64);
        Arc::new(Self {
            upstream,
            store,
            assets,
            prices: Arc::new(RwLock::new(HashMap::new())),
            subscribed: RwLock::new(HashSet::new()),
            version_tx,
        })
    }

    /// Make sure every configured asset has a live subscription. Idempotent;
    /// the watchlist orchestrator calls this on every reconcile.
    pub async fn refresh(self: &Arc<Self>) {
        for asset in self.assets.clone() {
            if self.subscribed.read().contains(&asset) {
                continue;
            }

            let (tx, mut rx) = mpsc::channel::<f64>(PRICE_MAILBOX);
            if let Err(e) = self.upstream.subscribe_price(&asset, tx).await {
                warn!(asset = %asset, error = %e, "price subscription failed");
                continue;
            }
            self.subscribed.write().insert(asset.clone());

            let feed = self.clone();
            let drain_asset = asset.clone();
            tokio::spawn(async move {
                while let Some(mid) = rx.recv().await {
                    feed.apply_update(&drain_asset, mid);
                }
                debug!(asset = %drain_asset, "price drain task exiting");
            });

            info!(asset = %asset, "price feed subscribed");
        }
    }

    fn apply_update(&self, asset: &str, mid: f64) {
        if !mid.is_finite() || mid <= 0.0 {
            debug!(asset = %asset, mid, "discarding degenerate mid price");
            return;
        }

        self.prices.write().insert(
            asset.to_string(),
            PriceSample {
                mid,
                updated_at: Utc::now(),
            },
        );
        self.version_tx.send_modify(|v| *v += 1);
    }

    /// Snapshot of every known price.
    pub fn current_prices(&self) -> HashMap<String, PriceSample> {
        self.prices.read().clone()
    }

    pub fn price_of(&self, asset: &str) -> Option<PriceSample> {
        self.prices.read().get(asset).copied()
    }

    /// Version counter that bumps on every accepted price update.
    pub fn change_version(&self) -> watch::Receiver<u64> {
        self.version_tx.subscribe()
    }

    /// Persist the current table to the per-minute series. Called on the
    /// snapshot interval from main.
    pub async fn persist_snapshots(&self) {
        let snapshot = self.current_prices();
        for (asset, sample) in snapshot {
            if let Err(e) = self.store.insert_price_snapshot(&asset, sample.mid).await {
                warn!(asset = %asset, error = %e, "price snapshot insert failed");
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemStore;
    use crate::types::{PositionSnapshot, RawFill};
    use anyhow::Result;
    use async_trait::async_trait;
    use parking_lot::Mutex as SyncMutex;

    struct PriceUpstream {
        senders: SyncMutex<HashMap<String, mpsc::Sender<f64>>>,
        subscribe_calls: SyncMutex<Vec<String>>,
        generation: watch::Sender<u64>,
    }

    impl PriceUpstream {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                senders: SyncMutex::new(HashMap::new()),
                subscribe_calls: SyncMutex::new(Vec::new()),
                generation: watch::channel(0).0,
            })
        }

        async fn inject(&self, asset: &str, mid: f64) {
            let tx = self.senders.lock().get(asset).cloned().unwrap();
            tx.send(mid).await.unwrap();
        }
    }

    #[async_trait]
    impl Upstream for PriceUpstream {
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
        async fn subscribe_price(&self, asset: &str, tx: mpsc::Sender<f64>) -> Result<()> {
            self.subscribe_calls.lock().push(asset.to_string());
            self.senders.lock().insert(asset.to_string(), tx);
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

    async fn wait_until(mut check: impl FnMut() -> bool) {
        for _ in 0..200 {
            if check() {
                return;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        panic!("condition not reached in time");
    }

    #[tokio::test]
    async fn updates_flow_into_the_table() {
        let upstream = PriceUpstream::new();
        let store = Arc::new(MemStore::new());
        let feed = PriceFeed::new(upstream.clone(), store, vec!["BTC".into(), "ETH".into()]);

        feed.refresh().await;
        upstream.inject("BTC", 60_000.0).await;
        upstream.inject("ETH", 3_000.0).await;

        let probe = feed.clone();
        wait_until(move || probe.current_prices().len() == 2).await;

        assert_eq!(feed.price_of("BTC").unwrap().mid, 60_000.0);
        assert_eq!(feed.price_of("ETH").unwrap().mid, 3_000.0);
    }

    #[tokio::test]
    async fn refresh_subscribes_each_asset_once() {
        let upstream = PriceUpstream::new();
        let store = Arc::new(MemStore::new());
        let feed = PriceFeed::new(upstream.clone(), store, vec!["BTC".into()]);

        feed.refresh().await;
        feed.refresh().await;
        feed.refresh().await;

        assert_eq!(upstream.subscribe_calls.lock().len(), 1);
    }

    #[tokio::test]
    async fn degenerate_prices_are_discarded() {
        let upstream = PriceUpstream::new();
        let store = Arc::new(MemStore::new());
        let feed = PriceFeed::new(upstream.clone(), store, vec!["BTC".into()]);

        feed.refresh().await;
        upstream.inject("BTC", f64::NAN).await;
        upstream.inject("BTC", -5.0).await;
        upstream.inject("BTC", 60_000.0).await;

        let probe = feed.clone();
        wait_until(move || probe.price_of("BTC").is_some()).await;
        assert_eq!(feed.price_of("BTC").unwrap().mid, 60_000.0);
    }

    #[tokio::test]
    async fn persist_writes_one_row_per_known_asset() {
        let upstream = PriceUpstream::new();
        let store = Arc::new(MemStore::new());
        let feed = PriceFeed::new(
            upstream.clone(),
            store.clone(),
            vec!["BTC".into(), "ETH".into()],
        );

        feed.refresh().await;
        upstream.inject("BTC", 60_000.0).await;

        let probe = feed.clone();
        wait_until(move || probe.price_of("BTC").is_some()).await;

        feed.persist_snapshots().await;
        // Only BTC has a price yet; ETH has nothing to persist.
        assert_eq!(store.price_snapshot_count(), 1);
    }

    #[tokio::test]
    async fn change_version_bumps_on_update() {
        let upstream = PriceUpstream::new();
        let store = Arc::new(MemStore::new());
        let feed = PriceFeed::new(upstream.clone(), store, vec!["BTC".into()]);

        let version = feed.change_version();
        let initial = *version.borrow();

        feed.refresh().await;
        upstream.inject("BTC", 60_000.0).await;

        let probe = version.clone();
        wait_until(move || *probe.borrow() > initial).await;
    }
}
