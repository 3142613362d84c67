// =============================================================================
// Engine State — everything the API surface and background loops share
// =============================================================================
//
// One explicit value constructed in main and passed around as
// `Arc<EngineState>`; no component reaches for ambient globals. Subsystems
// manage their own interior mutability, this struct just ties them together.
// =============================================================================

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use metrics::gauge;
use metrics_exporter_prometheus::PrometheusHandle;

use crate::chain::ChainRepairer;
use crate::config::Config;
use crate::price_feed::PriceFeed;
use crate::ring::EventRing;
use crate::store::FillStore;
use crate::tracker::RealtimeTracker;
use crate::watchlist::Watchlist;

pub struct EngineState {
    pub config: Config,
    pub ring: Arc<EventRing>,
    pub tracker: Arc<RealtimeTracker>,
    pub price_feed: Arc<PriceFeed>,
    pub repairer: Arc<ChainRepairer>,
    pub watchlist: Arc<Watchlist>,
    pub store: Arc<dyn FillStore>,
    /// Prometheus render handle for the /metrics route.
    pub metrics: PrometheusHandle,

    /// Currently connected fan-out clients.
    ws_clients: AtomicU64,
    start_time: std::time::Instant,
}

impl EngineState {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Config,
        ring: Arc<EventRing>,
        tracker: Arc<RealtimeTracker>,
        price_feed: Arc<PriceFeed>,
        repairer: Arc<ChainRepairer>,
        watchlist: Arc<Watchlist>,
        store: Arc<dyn FillStore>,
        metrics: PrometheusHandle,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            ring,
            tracker,
            price_feed,
            repairer,
            watchlist,
            store,
            metrics,
            ws_clients: AtomicU64::new(0),
            start_time: std::time::Instant::now(),
        })
    }

    pub fn uptime_secs(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    pub fn client_connected(&self) -> u64 {
        let count = self.ws_clients.fetch_add(1, Ordering::SeqCst) + 1;
        gauge!("ws_clients_connected", count as f64);
        count
    }

    pub fn client_disconnected(&self) -> u64 {
        let count = self.ws_clients.fetch_sub(1, Ordering::SeqCst).saturating_sub(1);
        gauge!("ws_clients_connected", count as f64);
        count
    }

    pub fn client_count(&self) -> u64 {
        self.ws_clients.load(Ordering::SeqCst)
    }
}
