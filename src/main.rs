// =============================================================================
// Market Intel Relay — Main Entry Point
// =============================================================================
//
// Observes a curated set of trader accounts on Hyperliquid, reconstructs
// position lifecycles from their fills, streams normalized events to
// dashboards over /ws, and publishes canonical fill events onto NATS
// JetStream for downstream services.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod api;
mod app_state;
mod chain;
mod classifier;
mod config;
mod hyperliquid;
mod price_feed;
mod publisher;
mod ring;
mod store;
mod tracker;
mod types;
mod upstream;
mod watchlist;

use std::sync::Arc;

use metrics_exporter_prometheus::PrometheusBuilder;
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::app_state::EngineState;
use crate::chain::ChainRepairer;
use crate::config::Config;
use crate::hyperliquid::HyperliquidClient;
use crate::price_feed::PriceFeed;
use crate::publisher::BusPublisher;
use crate::ring::EventRing;
use crate::store::{FillStore, MemStore, PgFillStore};
use crate::tracker::RealtimeTracker;
use crate::upstream::Upstream;
use crate::watchlist::Watchlist;

/// Depth of the tracker → publisher channel.
const PUBLISH_QUEUE: usize = 4_096;
/// How long shutdown waits for the publisher backlog to flush.
const FLUSH_DEADLINE_SECS: u64 = 10;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = Config::from_env()?;
    info!(
        assets = ?config.tracked_assets,
        leaderboard_period = %config.leaderboard_period,
        leaderboard_count = config.leaderboard_select_count,
        auto_repair = config.auto_repair_enabled,
        "intel relay starting"
    );

    // ── 2. Metrics recorder ──────────────────────────────────────────────
    let metrics_handle = PrometheusBuilder::new()
        .install_recorder()
        .expect("failed to install metrics recorder");

    // ── 3. Persistence ───────────────────────────────────────────────────
    let store: Arc<dyn FillStore> = match &config.database_url {
        Some(url) => match PgFillStore::connect(url).await {
            Ok(pg) => Arc::new(pg),
            Err(e) => {
                // Degraded but alive: fills still flow to the ring and bus,
                // and the repairer backfills once the store returns.
                error!(error = %e, "postgres unavailable — falling back to in-memory store");
                Arc::new(MemStore::new())
            }
        },
        None => {
            warn!("DATABASE_URL not set — using in-memory store");
            Arc::new(MemStore::new())
        }
    };

    // ── 4. Durable bus (startup-fatal) ───────────────────────────────────
    let bus = BusPublisher::connect(&config.nats_url).await?;
    let (publish_tx, publish_rx) = mpsc::channel(PUBLISH_QUEUE);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let publisher_task = bus.spawn_worker(publish_rx, shutdown_rx.clone());

    // ── 5. Upstream client & core components ─────────────────────────────
    let upstream: Arc<dyn Upstream> = Arc::new(HyperliquidClient::new(
        config.upstream_info_url.clone(),
        config.upstream_ws_url.clone(),
    ));

    let ring = Arc::new(EventRing::new(config.ring_capacity));
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
        config.pinned_addresses.clone(),
    ));

    // ── 6. Initial watchlist & subscriptions ─────────────────────────────
    let initial = match watchlist.recompute().await {
        Ok(addresses) => addresses,
        Err(e) => {
            warn!(error = %e, "initial watchlist fetch failed — starting empty");
            Vec::new()
        }
    };
    tracker.start(&initial, true).await?;
    price_feed.refresh().await;
    info!(addresses = initial.len(), "tracking started");

    // ── 7. Shared engine state & API server ──────────────────────────────
    let state = EngineState::new(
        config.clone(),
        ring.clone(),
        tracker.clone(),
        price_feed.clone(),
        repairer.clone(),
        watchlist.clone(),
        store.clone(),
        metrics_handle,
    );

    let bind_addr = format!("{}:{}", config.bind_addr, config.port);
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    info!(addr = %bind_addr, "API server listening");

    let app = api::rest::router(state.clone());
    let mut server_shutdown = shutdown_rx.clone();
    let server_task = tokio::spawn(async move {
        let result = axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = server_shutdown.changed().await;
            })
            .await;
        if let Err(e) = result {
            error!(error = %e, "API server failed");
        }
    });

    // ── 8. Watchlist reconcile loop (every 60 s) ─────────────────────────
    {
        let watchlist = watchlist.clone();
        let tracker = tracker.clone();
        let price_feed = price_feed.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(std::time::Duration::from_secs(60));
            interval.tick().await;
            loop {
                interval.tick().await;
                match watchlist.recompute().await {
                    Ok(addresses) => {
                        if let Err(e) = tracker.refresh(&addresses, false).await {
                            error!(error = %e, "watchlist reconcile failed");
                        }
                        price_feed.refresh().await;
                    }
                    Err(e) => {
                        // Keep the previous watchlist on a failed fetch.
                        warn!(error = %e, "leaderboard fetch failed — keeping watchlist");
                    }
                }
            }
        });
    }

    // ── 9. Position staleness sweep (every 30 s) ─────────────────────────
    {
        let tracker = tracker.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(std::time::Duration::from_secs(30));
            interval.tick().await;
            loop {
                interval.tick().await;
                tracker.ensure_fresh_snapshots().await;
            }
        });
    }

    // ── 10. Upstream reconnect watcher ───────────────────────────────────
    {
        let tracker = tracker.clone();
        let mut generation = upstream.connection_generation();
        tokio::spawn(async move {
            loop {
                if generation.changed().await.is_err() {
                    return;
                }
                let current = *generation.borrow();
                if current <= 1 {
                    // First connect; startup priming already covered it.
                    continue;
                }
                info!(generation = current, "upstream reconnected — re-priming positions");
                tracker.force_refresh_all_positions().await;
            }
        });
    }

    // ── 11. Price snapshot persistence ───────────────────────────────────
    {
        let price_feed = price_feed.clone();
        let every = config.price_snapshot_interval;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            interval.tick().await;
            loop {
                interval.tick().await;
                price_feed.persist_snapshots().await;
            }
        });
    }

    // ── 12. Scheduled chain validation ───────────────────────────────────
    if config.auto_repair_enabled {
        let repairer = repairer.clone();
        let tracker = tracker.clone();
        let assets = config.tracked_assets.clone();
        let every = config.validation_interval;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            interval.tick().await;
            loop {
                interval.tick().await;
                let addresses = tracker.tracked_addresses();
                repairer.sweep(&assets, &addresses).await;
            }
        });
    } else {
        info!("auto repair disabled — chains only repaired via the admin API");
    }

    info!("all subsystems running");

    // ── 13. Graceful shutdown ────────────────────────────────────────────
    shutdown_signal().await;
    warn!("shutdown signal received — stopping gracefully");

    // Stop accepting clients and closing timers comes first; the publisher
    // then flushes its backlog under a deadline.
    let _ = shutdown_tx.send(true);

    let flush = tokio::time::timeout(
        std::time::Duration::from_secs(FLUSH_DEADLINE_SECS),
        publisher_task,
    );
    if flush.await.is_err() {
        warn!("publisher flush deadline exceeded — exiting with backlog");
    }

    let _ = tokio::time::timeout(std::time::Duration::from_secs(5), server_task).await;

    info!("intel relay shut down complete");
    Ok(())
}

/// Resolve on ctrl-c or SIGTERM.
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
