// =============================================================================
// Shared types used across the relay engine
// =============================================================================

use anyhow::{bail, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::classifier::LifecycleAction;

// ---------------------------------------------------------------------------
// Address normalization
// ---------------------------------------------------------------------------

/// Normalize an account address to the canonical lowercase `0x` + 40-hex form.
///
/// Every ingress path (watchlist, upstream events, admin API) goes through
/// this before the address touches any map key or database row.
pub fn normalize_address(raw: &str) -> Result<String> {
    let trimmed = raw.trim().to_lowercase();
    let hex_part = trimmed.strip_prefix("0x").unwrap_or(&trimmed);

    if hex_part.len() != 40 || !hex_part.chars().all(|c| c.is_ascii_hexdigit()) {
        bail!("invalid address: {raw:?}");
    }

    Ok(format!("0x{hex_part}"))
}

// ---------------------------------------------------------------------------
// Fill side
// ---------------------------------------------------------------------------

/// Taker side of a fill. Upstream encodes buys as "B" and sells as "A" (ask)
/// or "S" depending on the channel; both sell spellings are accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    /// Parse the upstream single-letter side code.
    pub fn parse(code: &str) -> Result<Self> {
        match code {
            "B" | "b" => Ok(Self::Buy),
            "A" | "a" | "S" | "s" => Ok(Self::Sell),
            other => bail!("unknown fill side code: {other:?}"),
        }
    }

    /// Sign applied to the fill size to get the position delta.
    pub fn delta_sign(self) -> f64 {
        match self {
            Self::Buy => 1.0,
            Self::Sell => -1.0,
        }
    }

    /// Wire form used on the durable bus ("buy" / "sell").
    pub fn as_wire(self) -> &'static str {
        match self {
            Self::Buy => "buy",
            Self::Sell => "sell",
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_wire())
    }
}

// ---------------------------------------------------------------------------
// Raw fill (as delivered by the upstream exchange)
// ---------------------------------------------------------------------------

/// A fill as received from the upstream WebSocket or history endpoint, after
/// numeric parsing but before classification and dedup.
#[derive(Debug, Clone, PartialEq)]
pub struct RawFill {
    /// Upstream transaction hash when present; the stable dedup key.
    pub hash: Option<String>,
    pub coin: String,
    pub side: Side,
    pub size: f64,
    pub price: f64,
    /// Fill time, milliseconds since epoch.
    pub time: i64,
    /// Signed position size immediately before this fill (authoritative).
    pub start_position: f64,
    pub closed_pnl: Option<f64>,
    pub fee: Option<f64>,
    pub fee_token: Option<String>,
}

impl RawFill {
    /// Dedup key: the upstream hash when present, otherwise synthesized from
    /// `address|time|seq` where `seq` disambiguates same-millisecond fills.
    pub fn dedup_hash(&self, address: &str, seq: u64) -> String {
        match &self.hash {
            Some(h) if !h.is_empty() => h.clone(),
            _ => format!("{address}|{}|{seq}", self.time),
        }
    }

    pub fn at(&self) -> DateTime<Utc> {
        DateTime::<Utc>::from_timestamp_millis(self.time).unwrap_or_else(Utc::now)
    }
}

// ---------------------------------------------------------------------------
// Stored fill (trade event row)
// ---------------------------------------------------------------------------

/// A classified, persisted fill. Serializes to the ring `trade` payload shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FillRecord {
    pub address: String,
    #[serde(rename = "symbol")]
    pub asset: String,
    pub at: DateTime<Utc>,
    pub action: LifecycleAction,
    pub size: f64,
    pub start_position: f64,
    pub price_usd: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub realized_pnl_usd: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fee: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fee_token: Option<String>,
    pub hash: String,
}

impl FillRecord {
    /// Signed position delta implied by this fill (+size for buys, -size for
    /// sells). The direction is recoverable from the lifecycle action.
    pub fn signed_size(&self) -> f64 {
        if self.action.is_buy() {
            self.size
        } else {
            -self.size
        }
    }

    /// Position size immediately after this fill.
    pub fn end_position(&self) -> f64 {
        self.start_position + self.signed_size()
    }
}

// ---------------------------------------------------------------------------
// Position snapshot
// ---------------------------------------------------------------------------

/// Current position for one (address, asset). Serializes to the ring
/// `position` payload shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PositionSnapshot {
    pub address: String,
    #[serde(rename = "symbol")]
    pub asset: String,
    /// Signed size: positive long, negative short.
    pub size: f64,
    pub entry_price: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub liquidation_price: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub leverage: Option<f64>,
    /// When this snapshot was taken.
    pub at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Price sample
// ---------------------------------------------------------------------------

/// Last-known mid price for one asset.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PriceSample {
    pub mid: f64,
    pub updated_at: DateTime<Utc>,
}

// =============================================================================
// Tests
// =============================================================================
