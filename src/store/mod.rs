// =============================================================================
// Persistence Adapter — narrow store interface for fills and price history
// =============================================================================
//
// The relay touches the relational store through this trait only. Inserts
// are idempotent by fill hash, which is what lets the tracker and the chain
// repairer share one insert path. `MemStore` backs tests and store-less
// operation; `PgFillStore` (postgres module) is the production adapter.
// =============================================================================

pub mod postgres;

use std::collections::HashMap;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;

use crate::types::FillRecord;

pub use postgres::PgFillStore;

// ---------------------------------------------------------------------------
// Query result shapes
// ---------------------------------------------------------------------------

/// One page of reverse-chronological backfill results.
#[derive(Debug, Clone)]
pub struct BackfillPage {
    pub fills: Vec<FillRecord>,
    pub has_more: bool,
    /// Time of the oldest fill in this page; pass as `before_time` to fetch
    /// the next page.
    pub oldest_time: Option<DateTime<Utc>>,
}

// ---------------------------------------------------------------------------
// Store trait
// ---------------------------------------------------------------------------

#[async_trait]
pub trait FillStore: Send + Sync {
    /// Conditional insert keyed on `hash`. Returns `true` when the row was
    /// inserted, `false` when an identical hash already exists.
    async fn insert_trade_if_new(&self, fill: &FillRecord) -> Result<bool>;

    /// All stored fills for one (address, asset), ordered by time ascending.
    /// This is the chain validator's read path.
    async fn fills_for(&self, address: &str, asset: &str) -> Result<Vec<FillRecord>>;

    /// Paginated reverse-chronological history, optionally scoped to a set
    /// of addresses.
    async fn get_backfill_fills(
        &self,
        before_time: Option<DateTime<Utc>>,
        limit: usize,
        addresses: Option<&[String]>,
    ) -> Result<BackfillPage>;

    /// Time of the oldest stored fill, optionally scoped to addresses.
    async fn get_oldest_fill_time(
        &self,
        addresses: Option<&[String]>,
    ) -> Result<Option<DateTime<Utc>>>;

    /// Delete all fills for one (address, asset). Returns the row count.
    /// Only the chain repairer calls this.
    async fn clear_trades_for_address(&self, address: &str, asset: &str) -> Result<u64>;

    /// Append one price sample to the per-minute series.
    async fn insert_price_snapshot(&self, asset: &str, price: f64) -> Result<()>;
}

// =============================================================================
// In-memory store
// =============================================================================

/// Hash-keyed in-memory store. Used by tests and as the fallback when no
/// DATABASE_URL is configured.
#[derive(Default)]
pub struct MemStore {
    fills: RwLock<HashMap<String, FillRecord>>,
    prices: RwLock<Vec<(String, f64, DateTime<Utc>)>>,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fill_count(&self) -> usize {
        self.fills.read().len()
    }

    pub fn price_snapshot_count(&self) -> usize {
        self.prices.read().len()
    }
}

#[async_trait]
impl FillStore for MemStore {
    async fn insert_trade_if_new(&self, fill: &FillRecord) -> Result<bool> {
        let mut fills = self.fills.write();
        if fills.contains_key(&fill.hash) {
            return Ok(false);
        }
        fills.insert(fill.hash.clone(), fill.clone());
        Ok(true)
    }

    async fn fills_for(&self, address: &str, asset: &str) -> Result<Vec<FillRecord>> {
        let mut out: Vec<FillRecord> = self
            .fills
            .read()
            .values()
            .filter(|f| f.address == address && f.asset == asset)
            .cloned()
            .collect();
        out.sort_by_key(|f| f.at);
        Ok(out)
    }

    async fn get_backfill_fills(
        &self,
        before_time: Option<DateTime<Utc>>,
        limit: usize,
        addresses: Option<&[String]>,
    ) -> Result<BackfillPage> {
        let mut out: Vec<FillRecord> = self
            .fills
            .read()
            .values()
            .filter(|f| before_time.map_or(true, |t| f.at < t))
            .filter(|f| addresses.map_or(true, |a| a.contains(&f.address)))
            .cloned()
            .collect();
        out.sort_by(|a, b| b.at.cmp(&a.at));

        let has_more = out.len() > limit;
        out.truncate(limit);
        let oldest_time = out.last().map(|f| f.at);

        Ok(BackfillPage {
            fills: out,
            has_more,
            oldest_time,
        })
    }

    async fn get_oldest_fill_time(
        &self,
        addresses: Option<&[String]>,
    ) -> Result<Option<DateTime<Utc>>> {
        Ok(self
            .fills
            .read()
            .values()
            .filter(|f| addresses.map_or(true, |a| a.contains(&f.address)))
            .map(|f| f.at)
            .min())
    }

    async fn clear_trades_for_address(&self, address: &str, asset: &str) -> Result<u64> {
        let mut fills = self.fills.write();
        let before = fills.len();
        fills.retain(|_, f| !(f.address == address && f.asset == asset));
        Ok((before - fills.len()) as u64)
    }

    async fn insert_price_snapshot(&self, asset: &str, price: f64) -> Result<()> {
        self.prices
            .write()
            .push((asset.to_string(), price, Utc::now()));
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
    use chrono::TimeZone;

    fn fill(hash: &str, address: &str, asset: &str, secs: i64) -> FillRecord {
        FillRecord {
            address: address.to_string(),
            asset: asset.to_string(),
            at: Utc.timestamp_opt(secs, 0).unwrap(),
            action: LifecycleAction::OpenLong,
            size: 1.0,
            start_position: 0.0,
            price_usd: 100.0,
            realized_pnl_usd: None,
            fee: None,
            fee_token: None,
            hash: hash.to_string(),
        }
    }

    #[tokio::test]
    async fn duplicate_hash_inserts_exactly_once() {
        let store = MemStore::new();
        let f = fill("h1", "0xa", "BTC", 100);

        assert!(store.insert_trade_if_new(&f).await.unwrap());
        assert!(!store.insert_trade_if_new(&f).await.unwrap());
        assert_eq!(store.fill_count(), 1);
    }

    #[tokio::test]
    async fn fills_for_orders_by_time_ascending() {
        let store = MemStore::new();
        store.insert_trade_if_new(&fill("h2", "0xa", "BTC", 200)).await.unwrap();
        store.insert_trade_if_new(&fill("h1", "0xa", "BTC", 100)).await.unwrap();
        store.insert_trade_if_new(&fill("h3", "0xa", "ETH", 150)).await.unwrap();

        let fills = store.fills_for("0xa", "BTC").await.unwrap();
        let hashes: Vec<&str> = fills.iter().map(|f| f.hash.as_str()).collect();
        assert_eq!(hashes, vec!["h1", "h2"]);
    }

    #[tokio::test]
    async fn backfill_pages_reverse_chronologically() {
        let store = MemStore::new();
        for i in 0..5 {
            store
                .insert_trade_if_new(&fill(&format!("h{i}"), "0xa", "BTC", 100 + i))
                .await
                .unwrap();
        }

        let page = store.get_backfill_fills(None, 2, None).await.unwrap();
        assert_eq!(page.fills.len(), 2);
        assert!(page.has_more);
        assert_eq!(page.fills[0].hash, "h4");
        assert_eq!(page.fills[1].hash, "h3");

        let next = store
            .get_backfill_fills(page.oldest_time, 10, None)
            .await
            .unwrap();
        assert_eq!(next.fills.len(), 3);
        assert!(!next.has_more);
    }

    #[tokio::test]
    async fn backfill_scopes_to_addresses() {
        let store = MemStore::new();
        store.insert_trade_if_new(&fill("h1", "0xa", "BTC", 100)).await.unwrap();
        store.insert_trade_if_new(&fill("h2", "0xb", "BTC", 200)).await.unwrap();

        let scope = vec!["0xb".to_string()];
        let page = store
            .get_backfill_fills(None, 10, Some(&scope))
            .await
            .unwrap();
        assert_eq!(page.fills.len(), 1);
        assert_eq!(page.fills[0].address, "0xb");
    }

    #[tokio::test]
    async fn clear_removes_only_the_pair() {
        let store = MemStore::new();
        store.insert_trade_if_new(&fill("h1", "0xa", "BTC", 100)).await.unwrap();
        store.insert_trade_if_new(&fill("h2", "0xa", "ETH", 100)).await.unwrap();
        store.insert_trade_if_new(&fill("h3", "0xb", "BTC", 100)).await.unwrap();

        let cleared = store.clear_trades_for_address("0xa", "BTC").await.unwrap();
        assert_eq!(cleared, 1);
        assert_eq!(store.fill_count(), 2);
        assert!(store.fills_for("0xa", "BTC").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn oldest_fill_time_scopes() {
        let store = MemStore::new();
        store.insert_trade_if_new(&fill("h1", "0xa", "BTC", 100)).await.unwrap();
        store.insert_trade_if_new(&fill("h2", "0xb", "BTC", 50)).await.unwrap();

        let all = store.get_oldest_fill_time(None).await.unwrap().unwrap();
        assert_eq!(all.timestamp(), 50);

        let scope = vec!["0xa".to_string()];
        let scoped = store
            .get_oldest_fill_time(Some(&scope))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(scoped.timestamp(), 100);
    }
}
