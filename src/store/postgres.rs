// =============================================================================
// Postgres Fill Store — sqlx-backed persistence adapter
// =============================================================================
//
// Dedup is enforced by the primary key on `hash`; `insert_trade_if_new`
// relies on ON CONFLICT DO NOTHING and reports the affected-row count, so a
// replayed fill is indistinguishable from a fresh duplicate at this layer.
// =============================================================================

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use tracing::info;

use super::{BackfillPage, FillStore};
use crate::types::FillRecord;

/// Postgres-backed implementation of [`FillStore`].
pub struct PgFillStore {
    pool: PgPool,
}

impl PgFillStore {
    /// Connect and make sure the tables this adapter queries exist.
    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(8)
            .acquire_timeout(std::time::Duration::from_secs(5))
            .connect(database_url)
            .await
            .context("failed to connect to postgres")?;

        let store = Self { pool };
        store.ensure_schema().await?;
        info!("postgres fill store connected");
        Ok(store)
    }

    async fn ensure_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS fills (
                hash             TEXT PRIMARY KEY,
                address          TEXT NOT NULL,
                asset            TEXT NOT NULL,
                at               TIMESTAMPTZ NOT NULL,
                action           TEXT NOT NULL,
                size             DOUBLE PRECISION NOT NULL,
                start_position   DOUBLE PRECISION NOT NULL,
                price_usd        DOUBLE PRECISION NOT NULL,
                realized_pnl_usd DOUBLE PRECISION,
                fee              DOUBLE PRECISION,
                fee_token        TEXT
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .context("failed to create fills table")?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS fills_address_asset_at ON fills (address, asset, at)",
        )
        .execute(&self.pool)
        .await
        .context("failed to create fills index")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS price_snapshots (
                asset TEXT NOT NULL,
                price DOUBLE PRECISION NOT NULL,
                at    TIMESTAMPTZ NOT NULL DEFAULT now()
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .context("failed to create price_snapshots table")?;

        Ok(())
    }
}

fn row_to_fill(row: &PgRow) -> Result<FillRecord> {
    let action: String = row.try_get("action")?;
    Ok(FillRecord {
        address: row.try_get("address")?,
        asset: row.try_get("asset")?,
        at: row.try_get("at")?,
        action: action.parse()?,
        size: row.try_get("size")?,
        start_position: row.try_get("start_position")?,
        price_usd: row.try_get("price_usd")?,
        realized_pnl_usd: row.try_get("realized_pnl_usd")?,
        fee: row.try_get("fee")?,
        fee_token: row.try_get("fee_token")?,
        hash: row.try_get("hash")?,
    })
}

#[async_trait]
impl FillStore for PgFillStore {
    async fn insert_trade_if_new(&self, fill: &FillRecord) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO fills
                (hash, address, asset, at, action, size, start_position,
                 price_usd, realized_pnl_usd, fee, fee_token)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            ON CONFLICT (hash) DO NOTHING
            "#,
        )
        .bind(&fill.hash)
        .bind(&fill.address)
        .bind(&fill.asset)
        .bind(fill.at)
        .bind(fill.action.as_str())
        .bind(fill.size)
        .bind(fill.start_position)
        .bind(fill.price_usd)
        .bind(fill.realized_pnl_usd)
        .bind(fill.fee)
        .bind(&fill.fee_token)
        .execute(&self.pool)
        .await
        .context("fill insert failed")?;

        Ok(result.rows_affected() > 0)
    }

    async fn fills_for(&self, address: &str, asset: &str) -> Result<Vec<FillRecord>> {
        let rows = sqlx::query(
            "SELECT * FROM fills WHERE address = $1 AND asset = $2 ORDER BY at ASC",
        )
        .bind(address)
        .bind(asset)
        .fetch_all(&self.pool)
        .await
        .context("fills_for query failed")?;

        rows.iter().map(row_to_fill).collect()
    }

    async fn get_backfill_fills(
        &self,
        before_time: Option<DateTime<Utc>>,
        limit: usize,
        addresses: Option<&[String]>,
    ) -> Result<BackfillPage> {
        // Fetch one extra row to detect whether another page exists.
        let fetch = (limit + 1) as i64;
        let rows = sqlx::query(
            r#"
            SELECT * FROM fills
            WHERE ($1::timestamptz IS NULL OR at < $1)
              AND ($2::text[] IS NULL OR address = ANY($2))
            ORDER BY at DESC
            LIMIT $3
            "#,
        )
        .bind(before_time)
        .bind(addresses.map(|a| a.to_vec()))
        .bind(fetch)
        .fetch_all(&self.pool)
        .await
        .context("backfill query failed")?;

        let mut fills: Vec<FillRecord> =
            rows.iter().map(row_to_fill).collect::<Result<_>>()?;
        let has_more = fills.len() > limit;
        fills.truncate(limit);
        let oldest_time = fills.last().map(|f| f.at);

        Ok(BackfillPage {
            fills,
            has_more,
            oldest_time,
        })
    }

    async fn get_oldest_fill_time(
        &self,
        addresses: Option<&[String]>,
    ) -> Result<Option<DateTime<Utc>>> {
        let row = sqlx::query(
            "SELECT min(at) AS oldest FROM fills WHERE ($1::text[] IS NULL OR address = ANY($1))",
        )
        .bind(addresses.map(|a| a.to_vec()))
        .fetch_one(&self.pool)
        .await
        .context("oldest fill query failed")?;

        Ok(row.try_get("oldest")?)
    }

    async fn clear_trades_for_address(&self, address: &str, asset: &str) -> Result<u64> {
        let result = sqlx::query("DELETE FROM fills WHERE address = $1 AND asset = $2")
            .bind(address)
            .bind(asset)
            .execute(&self.pool)
            .await
            .context("clear fills failed")?;

        Ok(result.rows_affected())
    }

    async fn insert_price_snapshot(&self, asset: &str, price: f64) -> Result<()> {
        sqlx::query("INSERT INTO price_snapshots (asset, price) VALUES ($1, $2)")
            .bind(asset)
            .bind(price)
            .execute(&self.pool)
            .await
            .context("price snapshot insert failed")?;

        Ok(())
    }
}
