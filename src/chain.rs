// =============================================================================
// Position Chain Validator / Repairer
// =============================================================================
//
// The fills of one (address, asset), walked oldest to newest, must satisfy
// `start[i] + signed_size[i] == start[i+1]`. Anything else is a chain gap:
// a fill the relay missed (or an upstream replay anomaly). Repair is
// clear-and-backfill: drop every row for the pair, re-ingest from upstream
// history through the normal insert path, and revalidate.
//
// The scheduled sweep refuses to overlap with itself; a cycle that is still
// running when the next tick fires wins and the tick is skipped.
// =============================================================================

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use metrics::counter;
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::store::FillStore;
use crate::tracker::to_fill_record;
use crate::types::FillRecord;
use crate::upstream::Upstream;

/// Tolerance for the chain equality check, scaled by the magnitudes
/// involved (floats rebuilt from decimal strings carry residue).
const CHAIN_EPSILON: f64 = 1e-9;

// ---------------------------------------------------------------------------
// Validation (pure)
// ---------------------------------------------------------------------------

/// One broken link in a position chain.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChainGap {
    /// Time of the fill whose startPosition did not match.
    pub at: DateTime<Utc>,
    pub hash: String,
    /// What the previous fill implied the start should be.
    pub expected: f64,
    /// What the fill actually reported.
    pub actual: f64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChainReport {
    pub valid: bool,
    pub fill_count: usize,
    pub gaps: Vec<ChainGap>,
}

/// Walk fills in time order and record every link whose startPosition does
/// not continue the previous fill's end position.
pub fn validate_chain(fills: &[FillRecord]) -> ChainReport {
    let mut gaps = Vec::new();

    for pair in fills.windows(2) {
        let expected = pair[0].end_position();
        let actual = pair[1].start_position;
        let tolerance = CHAIN_EPSILON * expected.abs().max(actual.abs()).max(1.0);

        if (expected - actual).abs() > tolerance {
            gaps.push(ChainGap {
                at: pair[1].at,
                hash: pair[1].hash.clone(),
                expected,
                actual,
            });
        }
    }

    ChainReport {
        valid: gaps.is_empty(),
        fill_count: fills.len(),
        gaps,
    }
}

// ---------------------------------------------------------------------------
// Repairer
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RepairOutcome {
    pub cleared: u64,
    pub reingested: usize,
    pub report: ChainReport,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SweepOutcome {
    pub checked: usize,
    pub repaired: usize,
    pub still_invalid: usize,
    pub skipped: bool,
}

pub struct ChainRepairer {
    store: Arc<dyn FillStore>,
    upstream: Arc<dyn Upstream>,
    /// Disambiguates synthesized hashes during backfill.
    synth_seq: AtomicU64,
    /// Held for the duration of a sweep; `try_lock` failure means a cycle
    /// is already running and the new one is skipped.
    sweep_guard: Mutex<()>,
}

impl ChainRepairer {
    pub fn new(store: Arc<dyn FillStore>, upstream: Arc<dyn Upstream>) -> Arc<Self> {
        Arc::new(Self {
            store,
            upstream,
            synth_seq: AtomicU64::new(0),
            sweep_guard: Mutex::new(()),
        })
    }

    /// Validate the stored chain for one (address, asset).
    pub async fn validate(&self, address: &str, asset: &str) -> Result<ChainReport> {
        let fills = self.store.fills_for(address, asset).await?;
        Ok(validate_chain(&fills))
    }

    /// Clear and backfill one (address, asset) from upstream history, then
    /// revalidate.
    pub async fn repair(&self, address: &str, asset: &str) -> Result<RepairOutcome> {
        let cleared = self
            .store
            .clear_trades_for_address(address, asset)
            .await
            .context("failed to clear fills for repair")?;

        let symbols = vec![asset.to_string()];
        let history = self
            .upstream
            .fetch_user_fills(address, &symbols)
            .await
            .context("failed to fetch fill history for repair")?;

        let mut reingested = 0;
        for fill in &history {
            if fill.coin != asset {
                continue;
            }
            let synth = self.synth_seq.fetch_add(1, Ordering::Relaxed);
            let record = to_fill_record(address, fill, synth);
            if self.store.insert_trade_if_new(&record).await? {
                reingested += 1;
            }
        }

        let report = self.validate(address, asset).await?;
        counter!("chain_repairs_total", 1);
        info!(
            address = %address,
            asset = %asset,
            cleared,
            reingested,
            valid = report.valid,
            "chain repair complete"
        );

        Ok(RepairOutcome {
            cleared,
            reingested,
            report,
        })
    }

    /// Validate every watchlist address for one asset; repair the invalid
    /// chains sequentially.
    pub async fn repair_all(&self, asset: &str, addresses: &[String]) -> Result<SweepOutcome> {
        let mut outcome = SweepOutcome {
            checked: addresses.len(),
            ..SweepOutcome::default()
        };

        for address in addresses {
            let report = match self.validate(address, asset).await {
                Ok(report) => report,
                Err(e) => {
                    warn!(address = %address, asset = %asset, error = %e, "chain validation failed");
                    continue;
                }
            };
            if report.valid {
                continue;
            }

            warn!(
                address = %address,
                asset = %asset,
                gaps = report.gaps.len(),
                "chain gap detected — repairing"
            );
            match self.repair(address, asset).await {
                Ok(repaired) => {
                    outcome.repaired += 1;
                    if !repaired.report.valid {
                        outcome.still_invalid += 1;
                    }
                }
                Err(e) => {
                    warn!(address = %address, asset = %asset, error = %e, "chain repair failed");
                    outcome.still_invalid += 1;
                }
            }
        }

        Ok(outcome)
    }

    /// One scheduled validation cycle over every (asset, watchlist address)
    /// pair. Skips entirely when a previous cycle is still running.
    pub async fn sweep(&self, assets: &[String], addresses: &[String]) -> SweepOutcome {
        let Ok(_guard) = self.sweep_guard.try_lock() else {
            info!("validation sweep still running — skipping this cycle");
            return SweepOutcome {
                skipped: true,
                ..SweepOutcome::default()
            };
        };

        let mut total = SweepOutcome::default();
        for asset in assets {
            match self.repair_all(asset, addresses).await {
                Ok(outcome) => {
                    total.checked += outcome.checked;
                    total.repaired += outcome.repaired;
                    total.still_invalid += outcome.still_invalid;
                }
                Err(e) => warn!(asset = %asset, error = %e, "scheduled repair sweep failed"),
            }
        }

        if total.repaired > 0 || total.still_invalid > 0 {
            info!(
                checked = total.checked,
                repaired = total.repaired,
                still_invalid = total.still_invalid,
                "validation sweep finished"
            );
        }
        total
    }
}

// =============================================================================
// Tests
// =============================================================================
