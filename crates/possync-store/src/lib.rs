//! Postgres persistence for synced sales rows: schema creation, dedup
//! inserts keyed on `(uid, item_order_time)`, and the tracked watermark.

use possync_core::SalesRecord;
use sqlx::{PgPool, Row};
use thiserror::Error;
use tracing::{debug, info};

pub const CRATE_NAME: &str = "possync-store";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Result of a dedup insert. A duplicate is an expected no-op, not an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    DuplicateIgnored,
}

const CREATE_SALES_RECORDS: &str = r#"
CREATE TABLE IF NOT EXISTS sales_records (
    id                  BIGSERIAL PRIMARY KEY,
    revenue_center_desc TEXT NOT NULL,
    order_id            TEXT NOT NULL,
    item_order_time     TEXT NOT NULL,
    item_number         TEXT NOT NULL,
    item_name           TEXT NOT NULL,
    item_quantity       DOUBLE PRECISION NOT NULL,
    item_gross_sales    DOUBLE PRECISION NOT NULL,
    item_net_sales      DOUBLE PRECISION NOT NULL,
    tip_amount          DOUBLE PRECISION NOT NULL,
    store_id            TEXT NOT NULL,
    uid                 TEXT NOT NULL,
    UNIQUE (uid, item_order_time)
)
"#;

// Single-row table; the CHECK pins the only legal key to TRUE.
const CREATE_SYNC_WATERMARK: &str = r#"
CREATE TABLE IF NOT EXISTS sync_watermark (
    id              BOOLEAN PRIMARY KEY DEFAULT TRUE CHECK (id),
    last_order_time TEXT NOT NULL
)
"#;

const INSERT_RECORD: &str = r#"
INSERT INTO sales_records (
    revenue_center_desc, order_id, item_order_time, item_number, item_name,
    item_quantity, item_gross_sales, item_net_sales, tip_amount, store_id, uid
)
VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
ON CONFLICT (uid, item_order_time) DO NOTHING
"#;

const UPSERT_WATERMARK: &str = r#"
INSERT INTO sync_watermark (id, last_order_time)
VALUES (TRUE, $1)
ON CONFLICT (id) DO UPDATE
    SET last_order_time = GREATEST(sync_watermark.last_order_time, EXCLUDED.last_order_time)
"#;

#[derive(Debug, Clone)]
pub struct SalesStore {
    pool: PgPool,
}

impl SalesStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Create the schema when absent. Safe to call on every startup.
    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::query(CREATE_SALES_RECORDS).execute(&self.pool).await?;
        sqlx::query(CREATE_SYNC_WATERMARK).execute(&self.pool).await?;
        info!("sales schema ready");
        Ok(())
    }

    pub async fn exists(&self, uid: &str, item_order_time: &str) -> Result<bool, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT EXISTS(
                SELECT 1 FROM sales_records
                 WHERE uid = $1 AND item_order_time = $2
            ) AS present
            "#,
        )
        .bind(uid)
        .bind(item_order_time)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.try_get("present")?)
    }

    /// Insert one row, skipping it when the `(uid, item_order_time)` key is
    /// already present. The insert and the watermark advance share one
    /// transaction, committed per record so partial run progress is durable.
    pub async fn insert(&self, record: &SalesRecord) -> Result<InsertOutcome, StoreError> {
        let mut tx = self.pool.begin().await?;

        let result = sqlx::query(INSERT_RECORD)
            .bind(&record.revenue_center_desc)
            .bind(&record.order_id)
            .bind(&record.item_order_time)
            .bind(&record.item_number)
            .bind(&record.item_name)
            .bind(record.item_quantity)
            .bind(record.item_gross_sales)
            .bind(record.item_net_sales)
            .bind(record.tip_amount)
            .bind(&record.store_id)
            .bind(&record.uid)
            .execute(&mut *tx)
            .await?;

        if result.rows_affected() == 0 {
            tx.rollback().await?;
            debug!(uid = %record.uid, time = %record.item_order_time, "duplicate row skipped");
            return Ok(InsertOutcome::DuplicateIgnored);
        }

        sqlx::query(UPSERT_WATERMARK)
            .bind(&record.item_order_time)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(InsertOutcome::Inserted)
    }

    /// Latest known order timestamp: the tracked value, or the maximum over
    /// stored rows when no tracker row exists yet.
    pub async fn watermark(&self) -> Result<Option<String>, StoreError> {
        let tracked = sqlx::query("SELECT last_order_time FROM sync_watermark WHERE id")
            .fetch_optional(&self.pool)
            .await?;
        if let Some(row) = tracked {
            return Ok(Some(row.try_get("last_order_time")?));
        }
        self.derived_watermark().await
    }

    /// Watermark recomputed from the data itself.
    pub async fn derived_watermark(&self) -> Result<Option<String>, StoreError> {
        let row = sqlx::query("SELECT MAX(item_order_time) AS latest FROM sales_records")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get("latest")?)
    }

    /// Repair the tracked watermark against the stored rows. Run before each
    /// sync pass so the tracker can never silently lag the data.
    pub async fn reconcile_watermark(&self) -> Result<(), StoreError> {
        let Some(derived) = self.derived_watermark().await? else {
            return Ok(());
        };
        sqlx::query(UPSERT_WATERMARK)
            .bind(&derived)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
