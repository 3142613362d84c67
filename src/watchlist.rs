// =============================================================================
// Watchlist — leaderboard top-K unioned with pinned accounts
// =============================================================================
//
// The scout service is the source of truth for which traders are worth
// watching. Every reconcile cycle pulls the top-K for the configured period,
// unions it with the pinned accounts (first-seen order, deduplicated), and
// hands the result to the tracker and price feed. A failed fetch keeps the
// previous watchlist; an empty one is legal.
// =============================================================================

use anyhow::{Context, Result};
use parking_lot::RwLock;
use tracing::{info, warn};

use crate::types::normalize_address;

pub struct Watchlist {
    http: reqwest::Client,
    scout_url: String,
    period: String,
    select_count: usize,
    pinned: Vec<String>,
    current: RwLock<Vec<String>>,
}

impl Watchlist {
    pub fn new(
        scout_url: String,
        period: String,
        select_count: usize,
        pinned: Vec<String>,
    ) -> Self {
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .expect("failed to build reqwest client");

        // Pinned addresses are part of every recompute; normalize once and
        // drop anything malformed at construction.
        let pinned = pinned
            .iter()
            .filter_map(|raw| match normalize_address(raw) {
                Ok(addr) => Some(addr),
                Err(e) => {
                    warn!(address = %raw, error = %e, "dropping invalid pinned address");
                    None
                }
            })
            .collect();

        Self {
            http,
            scout_url,
            period,
            select_count,
            pinned,
            current: RwLock::new(Vec::new()),
        }
    }

    /// The watchlist as of the last successful recompute.
    pub fn current(&self) -> Vec<String> {
        self.current.read().clone()
    }

    pub fn len(&self) -> usize {
        self.current.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.current.read().is_empty()
    }

    /// Fetch the leaderboard and rebuild the address universe. On success
    /// the stored watchlist is swapped; on failure it is left untouched and
    /// the error surfaces to the caller.
    pub async fn recompute(&self) -> Result<Vec<String>> {
        let leaderboard = self.fetch_leaderboard().await?;
        let merged = union_addresses(&leaderboard, &self.pinned);

        info!(
            leaderboard = leaderboard.len(),
            pinned = self.pinned.len(),
            total = merged.len(),
            "watchlist recomputed"
        );

        *self.current.write() = merged.clone();
        Ok(merged)
    }

    async fn fetch_leaderboard(&self) -> Result<Vec<String>> {
        let url = format!(
            "{}/leaderboard?period={}&limit={}",
            self.scout_url, self.period, self.select_count
        );

        let resp = self
            .http
            .get(&url)
            .send()
            .await
            .context("leaderboard request failed")?
            .error_for_status()
            .context("leaderboard returned an error status")?
            .json::<serde_json::Value>()
            .await
            .context("failed to parse leaderboard response")?;

        Ok(parse_leaderboard(&resp, self.select_count))
    }
}

// ---------------------------------------------------------------------------
// Parsing & merging
// ---------------------------------------------------------------------------

/// Accepts either a bare array of addresses or an object with an `addresses`
/// array whose entries are strings or `{ "address": ... }` records.
fn parse_leaderboard(value: &serde_json::Value, limit: usize) -> Vec<String> {
    let entries = value
        .as_array()
        .or_else(|| value["addresses"].as_array())
        .map(|a| a.as_slice())
        .unwrap_or_default();

    let mut out = Vec::new();
    for entry in entries {
        let raw = entry
            .as_str()
            .or_else(|| entry["address"].as_str())
            .unwrap_or("");
        match normalize_address(raw) {
            Ok(addr) => {
                if !out.contains(&addr) {
                    out.push(addr);
                }
            }
            Err(e) => warn!(entry = %raw, error = %e, "skipping malformed leaderboard entry"),
        }
        if out.len() == limit {
            break;
        }
    }
    out
}

/// Union two address lists, deduplicated, preserving first-seen order
/// (leaderboard first, then pinned).
fn union_addresses(leaderboard: &[String], pinned: &[String]) -> Vec<String> {
    let mut out = Vec::with_capacity(leaderboard.len() + pinned.len());
    for addr in leaderboard.iter().chain(pinned.iter()) {
        if !out.contains(addr) {
            out.push(addr.clone());
        }
    }
    out
}

// =============================================================================
// Tests
// =============================================================================
