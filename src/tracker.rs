// =============================================================================
// Realtime Tracker — per-address subscription workers and the trade pipeline
// =============================================================================
//
// Each watched address gets a dedicated worker: a fill mailbox drained by
// one task and a position mailbox drained by another. That serializes the
// pipeline per address (fills for one account never reorder) while keeping
// addresses fully independent.
//
// Per-trade pipeline, in order:
//   1. normalize + derive the dedup hash
//   2. classify against the upstream-reported startPosition
//   3. hand the record to the bus publisher (always — even for duplicates
//      and store failures, downstream consumers dedup on fill_id)
//   4. conditional insert; a fresh row also goes into the client ring.
//      An insert *error* still pushes to the ring: the live view stays
//      current and the chain repairer heals the store later.
// =============================================================================

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use metrics::counter;
use parking_lot::RwLock;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::classifier::classify;
use crate::ring::{EventRing, RingEventKind};
use crate::store::FillStore;
use crate::types::{normalize_address, FillRecord, PositionSnapshot, RawFill};
use crate::upstream::Upstream;

/// Mailbox depth for realtime fills of one address.
const FILL_MAILBOX: usize = 256;
/// Mailbox depth for position snapshot batches of one address.
const POSITION_MAILBOX: usize = 8;

// ---------------------------------------------------------------------------
// Record construction
// ---------------------------------------------------------------------------

/// Classify one raw fill into a stored record. Shared by the realtime
/// pipeline and the chain repairer so both produce identical rows.
pub fn to_fill_record(address: &str, fill: &RawFill, synth_seq: u64) -> FillRecord {
    let classified = classify(fill.start_position, fill.side, fill.size);

    FillRecord {
        address: address.to_string(),
        asset: fill.coin.clone(),
        at: fill.at(),
        action: classified.action,
        size: fill.size,
        start_position: fill.start_position,
        price_usd: fill.price,
        realized_pnl_usd: fill.closed_pnl,
        fee: fill.fee,
        fee_token: fill.fee_token.clone(),
        hash: fill.dedup_hash(address, synth_seq),
    }
}

// ---------------------------------------------------------------------------
// Worker bookkeeping
// ---------------------------------------------------------------------------

struct AddressWorker {
    fills_task: JoinHandle<()>,
    positions_task: JoinHandle<()>,
}

impl AddressWorker {
    fn abort(&self) {
        self.fills_task.abort();
        self.positions_task.abort();
    }
}

/// Outcome of one watchlist reconciliation.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct RefreshOutcome {
    pub added: Vec<String>,
    pub removed: Vec<String>,
}

// ---------------------------------------------------------------------------
// Tracker
// ---------------------------------------------------------------------------

pub struct RealtimeTracker {
    upstream: Arc<dyn Upstream>,
    store: Arc<dyn FillStore>,
    ring: Arc<EventRing>,
    /// Channel into the bus publisher worker.
    publish_tx: mpsc::Sender<FillRecord>,
    /// Assets under tracking; fills for anything else are ignored.
    assets: Vec<String>,
    prime_timeout: Duration,
    stale_after: Duration,

    workers: RwLock<HashMap<String, AddressWorker>>,
    /// (address, asset) → last known snapshot.
    positions: Arc<RwLock<HashMap<(String, String), PositionSnapshot>>>,
    /// address → when a position snapshot was last applied.
    last_position_update: Arc<RwLock<HashMap<String, Instant>>>,
    positions_ready: AtomicBool,
    /// Disambiguates synthesized hashes for fills without an upstream hash.
    synth_seq: Arc<AtomicU64>,
}

impl RealtimeTracker {
    pub fn new(
        upstream: Arc<dyn Upstream>,
        store: Arc<dyn FillStore>,
        ring: Arc<EventRing>,
        publish_tx: mpsc::Sender<FillRecord>,
        assets: Vec<String>,
        prime_timeout: Duration,
        stale_after: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            upstream,
            store,
            ring,
            publish_tx,
            assets,
            prime_timeout,
            stale_after,
            workers: RwLock::new(HashMap::new()),
            positions: Arc::new(RwLock::new(HashMap::new())),
            last_position_update: Arc::new(RwLock::new(HashMap::new())),
            positions_ready: AtomicBool::new(false),
            synth_seq: Arc::new(AtomicU64::new(0)),
        })
    }

    // -------------------------------------------------------------------------
    // Lifecycle
    // -------------------------------------------------------------------------

    /// Subscribe every address in the initial watchlist. With
    /// `await_positions`, blocks until each address has delivered one
    /// position snapshot or its prime timeout expires, then reports ready.
    pub async fn start(self: &Arc<Self>, addresses: &[String], await_positions: bool) -> Result<()> {
        let added = self.refresh(addresses, false).await?.added;
        info!(count = added.len(), "tracker started");

        if await_positions {
            self.prime_positions(&added).await;
        }
        self.positions_ready.store(true, Ordering::SeqCst);
        Ok(())
    }

    /// Reconcile the active subscription set against a new watchlist:
    /// unsubscribe what left, subscribe what arrived.
    pub async fn refresh(
        self: &Arc<Self>,
        addresses: &[String],
        await_positions: bool,
    ) -> Result<RefreshOutcome> {
        let mut target = Vec::with_capacity(addresses.len());
        for raw in addresses {
            match normalize_address(raw) {
                Ok(addr) => {
                    if !target.contains(&addr) {
                        target.push(addr);
                    }
                }
                Err(e) => warn!(address = %raw, error = %e, "skipping invalid watchlist address"),
            }
        }

        let (added, removed) = {
            let workers = self.workers.read();
            let added: Vec<String> = target
                .iter()
                .filter(|a| !workers.contains_key(*a))
                .cloned()
                .collect();
            let removed: Vec<String> = workers
                .keys()
                .filter(|a| !target.contains(*a))
                .cloned()
                .collect();
            (added, removed)
        };

        for address in &removed {
            if let Some(worker) = self.workers.write().remove(address) {
                worker.abort();
            }
            if let Err(e) = self.upstream.unsubscribe(address).await {
                warn!(address = %address, error = %e, "unsubscribe failed");
            }
            self.positions.write().retain(|(a, _), _| a != address);
            self.last_position_update.write().remove(address);
            info!(address = %address, "address left the watchlist");
        }

        for address in &added {
            if let Err(e) = self.add_address(address).await {
                error!(address = %address, error = %e, "failed to subscribe address");
            }
        }

        if await_positions && !added.is_empty() {
            self.prime_positions(&added).await;
        }

        Ok(RefreshOutcome { added, removed })
    }

    async fn add_address(self: &Arc<Self>, address: &str) -> Result<()> {
        let (fill_tx, mut fill_rx) = mpsc::channel::<RawFill>(FILL_MAILBOX);
        let (pos_tx, mut pos_rx) = mpsc::channel::<Vec<PositionSnapshot>>(POSITION_MAILBOX);

        self.upstream.subscribe_fills(address, fill_tx).await?;
        self.upstream.subscribe_positions(address, pos_tx).await?;

        let fills_tracker = self.clone();
        let fills_address = address.to_string();
        let fills_task = tokio::spawn(async move {
            while let Some(fill) = fill_rx.recv().await {
                fills_tracker.process_fill(&fills_address, fill).await;
            }
            debug!(address = %fills_address, "fill worker exiting");
        });

        let pos_tracker = self.clone();
        let pos_address = address.to_string();
        let positions_task = tokio::spawn(async move {
            while let Some(snapshots) = pos_rx.recv().await {
                pos_tracker.apply_snapshots(&pos_address, snapshots);
            }
            debug!(address = %pos_address, "position worker exiting");
        });

        self.workers.write().insert(
            address.to_string(),
            AddressWorker {
                fills_task,
                positions_task,
            },
        );

        info!(address = %address, "address under subscription");
        Ok(())
    }

    /// Addresses currently under subscription.
    pub fn tracked_addresses(&self) -> Vec<String> {
        self.workers.read().keys().cloned().collect()
    }

    pub fn positions_ready(&self) -> bool {
        self.positions_ready.load(Ordering::SeqCst)
    }

    /// Current position snapshots for every tracked address.
    pub fn position_snapshots(&self) -> Vec<PositionSnapshot> {
        let mut out: Vec<PositionSnapshot> = self.positions.read().values().cloned().collect();
        out.sort_by(|a, b| (&a.address, &a.asset).cmp(&(&b.address, &b.asset)));
        out
    }

    /// Seconds since the last position update per address.
    pub fn position_ages(&self) -> HashMap<String, u64> {
        self.last_position_update
            .read()
            .iter()
            .map(|(a, t)| (a.clone(), t.elapsed().as_secs()))
            .collect()
    }

    // -------------------------------------------------------------------------
    // Position priming & freshness
    // -------------------------------------------------------------------------

    /// Fetch one snapshot per address, bounded by the per-address prime
    /// timeout. Addresses that time out are logged and left for the
    /// staleness sweep.
    async fn prime_positions(self: &Arc<Self>, addresses: &[String]) {
        let mut tasks = Vec::with_capacity(addresses.len());
        for address in addresses {
            let tracker = self.clone();
            let address = address.clone();
            tasks.push(tokio::spawn(async move {
                let fetched = tokio::time::timeout(
                    tracker.prime_timeout,
                    tracker.upstream.current_positions(&address),
                )
                .await;

                match fetched {
                    Ok(Ok(snapshots)) => {
                        tracker.apply_snapshots(&address, snapshots);
                        None
                    }
                    Ok(Err(e)) => {
                        warn!(address = %address, error = %e, "position prime failed");
                        Some(address)
                    }
                    Err(_) => {
                        warn!(address = %address, "position prime timed out");
                        Some(address)
                    }
                }
            }));
        }

        let mut missing = Vec::new();
        for task in tasks {
            if let Ok(Some(address)) = task.await {
                missing.push(address);
            }
        }
        if !missing.is_empty() {
            warn!(missing = ?missing, "positions ready with partial data");
        }
    }

    /// Re-request a snapshot for every tracked address.
    pub async fn force_refresh_all_positions(self: &Arc<Self>) {
        let addresses = self.tracked_addresses();
        info!(count = addresses.len(), "forcing position refresh");
        self.prime_positions(&addresses).await;
    }

    /// Request snapshots for addresses whose position data has gone stale.
    /// Called from the 30 s sweep in main.
    pub async fn ensure_fresh_snapshots(self: &Arc<Self>) {
        let stale: Vec<String> = {
            let ages = self.last_position_update.read();
            self.tracked_addresses()
                .into_iter()
                .filter(|a| {
                    ages.get(a)
                        .map_or(true, |t| t.elapsed() > self.stale_after)
                })
                .collect()
        };

        if !stale.is_empty() {
            debug!(count = stale.len(), "refreshing stale position snapshots");
            self.prime_positions(&stale).await;
        }
    }

    fn apply_snapshots(&self, address: &str, snapshots: Vec<PositionSnapshot>) {
        self.last_position_update
            .write()
            .insert(address.to_string(), Instant::now());

        let mut seen = Vec::new();
        for snapshot in snapshots {
            if !self.assets.contains(&snapshot.asset) {
                continue;
            }
            seen.push(snapshot.asset.clone());

            let key = (address.to_string(), snapshot.asset.clone());
            let changed = {
                let positions = self.positions.read();
                positions.get(&key).map_or(true, |prev| {
                    prev.size != snapshot.size || prev.entry_price != snapshot.entry_price
                })
            };
            if !changed {
                continue;
            }

            self.positions.write().insert(key, snapshot.clone());
            match serde_json::to_value(&snapshot) {
                Ok(payload) => {
                    self.ring.push(RingEventKind::Position, payload);
                }
                Err(e) => warn!(error = %e, "failed to encode position snapshot"),
            }
        }

        // Positions absent from a fresh snapshot batch have been closed.
        self.positions
            .write()
            .retain(|(a, asset), _| a != address || seen.contains(asset));
    }

    // -------------------------------------------------------------------------
    // Trade pipeline
    // -------------------------------------------------------------------------

    async fn process_fill(&self, address: &str, fill: RawFill) {
        if !self.assets.contains(&fill.coin) {
            debug!(address = %address, coin = %fill.coin, "fill for untracked asset ignored");
            return;
        }
        if fill.size <= 0.0 || fill.price <= 0.0 {
            warn!(address = %address, size = fill.size, price = fill.price, "rejecting degenerate fill");
            counter!("fills_rejected_total", 1);
            return;
        }

        let synth = self.synth_seq.fetch_add(1, Ordering::Relaxed);
        let record = to_fill_record(address, &fill, synth);

        debug!(
            address = %address,
            asset = %record.asset,
            action = %record.action,
            size = record.size,
            "fill classified"
        );

        // Durable publish path runs for every classified trade. Bounded
        // channel: when the publisher is hopelessly behind, dropping here is
        // preferable to stalling the per-address pipeline.
        match self.publish_tx.try_send(record.clone()) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(hash = %record.hash, "publisher queue full — fill not enqueued");
                counter!("bus_publish_failures_total", 1);
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                warn!(hash = %record.hash, "publisher queue closed — fill not enqueued");
                counter!("bus_publish_failures_total", 1);
            }
        }

        match self.store.insert_trade_if_new(&record).await {
            Ok(true) => {
                counter!("fills_ingested_total", 1);
                self.push_trade_event(&record);
            }
            Ok(false) => {
                debug!(hash = %record.hash, "duplicate fill skipped");
                counter!("fills_deduped_total", 1);
            }
            Err(e) => {
                // Keep the live view current; the chain repairer re-ingests
                // from history once the store recovers.
                error!(hash = %record.hash, error = %e, "fill insert failed");
                counter!("fills_insert_errors_total", 1);
                self.push_trade_event(&record);
            }
        }
    }

    fn push_trade_event(&self, record: &FillRecord) {
        match serde_json::to_value(record) {
            Ok(payload) => {
                self.ring.push(RingEventKind::Trade, payload);
            }
            Err(e) => warn!(error = %e, "failed to encode trade event"),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
