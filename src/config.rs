// =============================================================================
// Configuration — environment-driven relay settings
// =============================================================================
//
// Every knob is read once at startup from the environment (with `.env`
// support via dotenv in main). Fields carry defaults so a bare environment
// still boots against public endpoints; only OWNER_TOKEN has no usable
// default, which leaves the mutating admin surface locked until it is set.
// =============================================================================

use std::time::Duration;

use anyhow::{Context, Result};

// =============================================================================
// Default-value helpers
// =============================================================================

fn default_leaderboard_period() -> String {
    "month".to_string()
}

fn default_leaderboard_select_count() -> usize {
    10
}

fn default_price_snapshot_interval_ms() -> u64 {
    60_000
}

fn default_validation_interval_ms() -> u64 {
    300_000
}

fn default_scout_url() -> String {
    "http://127.0.0.1:8090".to_string()
}

fn default_nats_url() -> String {
    "nats://127.0.0.1:4222".to_string()
}

fn default_bind_addr() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_tracked_assets() -> Vec<String> {
    vec!["BTC".to_string(), "ETH".to_string()]
}

fn default_upstream_ws_url() -> String {
    "wss://api.hyperliquid.xyz/ws".to_string()
}

fn default_upstream_info_url() -> String {
    "https://api.hyperliquid.xyz/info".to_string()
}

// =============================================================================
// Config
// =============================================================================

/// Immutable runtime configuration, built once in `main` and shared via the
/// engine state.
#[derive(Debug, Clone)]
pub struct Config {
    // --- Watchlist ----------------------------------------------------------
    /// Leaderboard ranking period requested from the scout service.
    pub leaderboard_period: String,
    /// How many top leaderboard addresses to track.
    pub leaderboard_select_count: usize,
    /// Always-tracked addresses, unioned with the leaderboard.
    pub pinned_addresses: Vec<String>,

    // --- Assets & intervals -------------------------------------------------
    /// Assets under subscription (upstream coin symbols).
    pub tracked_assets: Vec<String>,
    /// How often the last-known mid prices are persisted.
    pub price_snapshot_interval: Duration,
    /// How often the chain validator sweeps the watchlist.
    pub validation_interval: Duration,
    /// Whether the scheduled sweep repairs invalid chains automatically.
    pub auto_repair_enabled: bool,

    // --- External endpoints -------------------------------------------------
    /// Leaderboard source-of-truth service.
    pub scout_url: String,
    /// Durable message bus.
    pub nats_url: String,
    /// Relational store. `None` runs with the in-memory store (fills are not
    /// durable across restarts; the bus publish path is unaffected).
    pub database_url: Option<String>,
    /// Upstream exchange WebSocket endpoint.
    pub upstream_ws_url: String,
    /// Upstream exchange info (REST) endpoint.
    pub upstream_info_url: String,

    // --- Serving ------------------------------------------------------------
    /// Shared bearer token for mutating admin endpoints (`x-owner-key`).
    pub owner_token: String,
    /// Interface the HTTP/WS listener binds to.
    pub bind_addr: String,
    /// HTTP/WS listener port.
    pub port: u16,

    // --- Tuning -------------------------------------------------------------
    /// Ring capacity for client replay.
    pub ring_capacity: usize,
    /// Per-address timeout while priming positions at startup.
    pub position_prime_timeout: Duration,
    /// A position snapshot older than this is considered stale.
    pub position_stale_after: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            leaderboard_period: default_leaderboard_period(),
            leaderboard_select_count: default_leaderboard_select_count(),
            pinned_addresses: Vec::new(),
            tracked_assets: default_tracked_assets(),
            price_snapshot_interval: Duration::from_millis(default_price_snapshot_interval_ms()),
            validation_interval: Duration::from_millis(default_validation_interval_ms()),
            auto_repair_enabled: true,
            scout_url: default_scout_url(),
            nats_url: default_nats_url(),
            database_url: None,
            upstream_ws_url: default_upstream_ws_url(),
            upstream_info_url: default_upstream_info_url(),
            owner_token: String::new(),
            bind_addr: default_bind_addr(),
            port: default_port(),
            ring_capacity: crate::ring::DEFAULT_RING_CAPACITY,
            position_prime_timeout: Duration::from_secs(10),
            position_stale_after: Duration::from_secs(60),
        }
    }
}

impl Config {
    /// Build the configuration from the process environment.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Ok(v) = std::env::var("LEADERBOARD_PERIOD") {
            config.leaderboard_period = v;
        }
        if let Ok(v) = std::env::var("LEADERBOARD_SELECT_COUNT") {
            config.leaderboard_select_count =
                v.parse().context("LEADERBOARD_SELECT_COUNT must be an integer")?;
        }
        if let Ok(v) = std::env::var("PINNED_ADDRESSES") {
            config.pinned_addresses = parse_list(&v);
        }
        if let Ok(v) = std::env::var("TRACKED_ASSETS") {
            let assets = parse_list(&v);
            if !assets.is_empty() {
                config.tracked_assets = assets;
            }
        }
        if let Ok(v) = std::env::var("PRICE_SNAPSHOT_INTERVAL_MS") {
            let ms: u64 = v
                .parse()
                .context("PRICE_SNAPSHOT_INTERVAL_MS must be an integer")?;
            config.price_snapshot_interval = Duration::from_millis(ms);
        }
        if let Ok(v) = std::env::var("VALIDATION_INTERVAL_MS") {
            let ms: u64 = v.parse().context("VALIDATION_INTERVAL_MS must be an integer")?;
            config.validation_interval = Duration::from_millis(ms);
        }
        if let Ok(v) = std::env::var("AUTO_REPAIR_ENABLED") {
            config.auto_repair_enabled = parse_bool(&v);
        }
        if let Ok(v) = std::env::var("SCOUT_URL") {
            config.scout_url = v.trim_end_matches('/').to_string();
        }
        if let Ok(v) = std::env::var("NATS_URL") {
            config.nats_url = v;
        }
        if let Ok(v) = std::env::var("DATABASE_URL") {
            if !v.is_empty() {
                config.database_url = Some(v);
            }
        }
        if let Ok(v) = std::env::var("UPSTREAM_WS_URL") {
            config.upstream_ws_url = v;
        }
        if let Ok(v) = std::env::var("UPSTREAM_INFO_URL") {
            config.upstream_info_url = v;
        }
        if let Ok(v) = std::env::var("OWNER_TOKEN") {
            config.owner_token = v;
        }
        if let Ok(v) = std::env::var("BIND_ADDR") {
            if !v.is_empty() {
                config.bind_addr = v;
            }
        }
        if let Ok(v) = std::env::var("PORT") {
            config.port = v.parse().context("PORT must be a port number")?;
        }
        if let Ok(v) = std::env::var("RING_CAPACITY") {
            config.ring_capacity = v.parse().context("RING_CAPACITY must be an integer")?;
        }

        Ok(config)
    }
}

// ---------------------------------------------------------------------------
// Parsing helpers
// ---------------------------------------------------------------------------

/// Split a comma-separated env value into trimmed, non-empty entries.
fn parse_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

/// Lenient boolean parsing: "1", "true", "yes", "on" (any case) are true.
fn parse_bool(raw: &str) -> bool {
    matches!(
        raw.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_expected_values() {
        let cfg = Config::default();
        assert_eq!(cfg.leaderboard_period, "month");
        assert_eq!(cfg.leaderboard_select_count, 10);
        assert_eq!(cfg.tracked_assets, vec!["BTC", "ETH"]);
        assert_eq!(cfg.price_snapshot_interval, Duration::from_secs(60));
        assert_eq!(cfg.validation_interval, Duration::from_secs(300));
        assert!(cfg.auto_repair_enabled);
        assert_eq!(cfg.bind_addr, "0.0.0.0");
        assert_eq!(cfg.port, 8080);
        assert_eq!(cfg.ring_capacity, 5_000);
        assert!(cfg.database_url.is_none());
        assert!(cfg.owner_token.is_empty());
    }

    #[test]
    fn parse_list_trims_and_drops_empties() {
        assert_eq!(
            parse_list(" 0xabc , 0xdef ,, "),
            vec!["0xabc".to_string(), "0xdef".to_string()]
        );
        assert!(parse_list("").is_empty());
    }

    #[test]
    fn parse_bool_accepts_common_spellings() {
        assert!(parse_bool("true"));
        assert!(parse_bool("TRUE"));
        assert!(parse_bool("1"));
        assert!(parse_bool("yes"));
        assert!(parse_bool("on"));
        assert!(!parse_bool("false"));
        assert!(!parse_bool("0"));
        assert!(!parse_bool(""));
    }
}
