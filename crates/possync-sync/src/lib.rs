//! Incremental sync engine: watermark window computation, per-location
//! cursor pagination, and dedup inserts, plus the cron trigger wiring.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, SubsecRound, Utc};
use possync_core::{order_to_records, SalesRecord, SyncWindow};
use possync_square::{OrderSource, RemoteError, SquareApiSource, SquareClientConfig};
use possync_store::{InsertOutcome, SalesStore, StoreError};
use serde::Serialize;
use sqlx::postgres::PgPoolOptions;
use thiserror::Error;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "possync-sync";

/// Window start used when the store holds no rows and no override is set.
pub const DEFAULT_EPOCH_START: &str = "1970-01-01T00:00:00Z";

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub database_url: String,
    pub access_token: String,
    pub api_base_url: String,
    pub sync_cron: String,
    pub epoch_start: String,
    pub http_timeout_secs: u64,
}

impl SyncConfig {
    pub fn from_env() -> Self {
        let database_url = std::env::var("DATABASE_URL").unwrap_or_else(|_| {
            let host =
                std::env::var("DATABASE_HOST").unwrap_or_else(|_| "localhost".to_string());
            let user =
                std::env::var("DATABASE_USER").unwrap_or_else(|_| "postgres".to_string());
            let password = std::env::var("DATABASE_PASSWORD").unwrap_or_default();
            format!("postgres://{user}:{password}@{host}/postgres")
        });
        Self {
            database_url,
            access_token: std::env::var("SQUARE_ACCESS_TOKEN").unwrap_or_default(),
            api_base_url: std::env::var("SQUARE_API_BASE_URL")
                .unwrap_or_else(|_| possync_square::DEFAULT_BASE_URL.to_string()),
            sync_cron: std::env::var("SYNC_CRON").unwrap_or_else(|_| "0 30 7 * * *".to_string()),
            epoch_start: std::env::var("SYNC_EPOCH_START")
                .unwrap_or_else(|_| DEFAULT_EPOCH_START.to_string()),
            http_timeout_secs: std::env::var("SYNC_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(20),
        }
    }
}

/// Terminal failure of one run. Everything committed before the failure
/// stays committed; the next scheduled run is the retry mechanism.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Remote(#[from] RemoteError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Write side of the pipeline, behind a trait so engine tests can run
/// against an in-memory sink.
#[async_trait]
pub trait RecordSink: Send + Sync {
    async fn reconcile_watermark(&self) -> Result<(), StoreError>;
    async fn watermark(&self) -> Result<Option<String>, StoreError>;
    async fn insert(&self, record: &SalesRecord) -> Result<InsertOutcome, StoreError>;
}

#[async_trait]
impl RecordSink for SalesStore {
    async fn reconcile_watermark(&self) -> Result<(), StoreError> {
        SalesStore::reconcile_watermark(self).await
    }

    async fn watermark(&self) -> Result<Option<String>, StoreError> {
        SalesStore::watermark(self).await
    }

    async fn insert(&self, record: &SalesRecord) -> Result<InsertOutcome, StoreError> {
        SalesStore::insert(self, record).await
    }
}

/// Fetch window for one run: watermark (or the epoch fallback) up to
/// wall-clock now truncated to whole seconds. The start never moves
/// backward across runs; overlap with prior windows is handled by dedup,
/// not by window exclusion.
pub fn compute_window(
    watermark: Option<String>,
    epoch_start: &str,
    now: DateTime<Utc>,
) -> SyncWindow {
    SyncWindow {
        start: watermark.unwrap_or_else(|| epoch_start.to_string()),
        end: now
            .trunc_subsecs(0)
            .to_rfc3339_opts(SecondsFormat::Secs, true),
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub window_start: String,
    pub window_end: String,
    pub locations: usize,
    pub pages: usize,
    pub orders_seen: usize,
    pub records_inserted: usize,
    pub duplicates_skipped: usize,
}

pub struct SyncEngine {
    source: Arc<dyn OrderSource>,
    sink: Arc<dyn RecordSink>,
    epoch_start: String,
}

impl SyncEngine {
    pub fn new(
        source: Arc<dyn OrderSource>,
        sink: Arc<dyn RecordSink>,
        epoch_start: impl Into<String>,
    ) -> Self {
        Self {
            source,
            sink,
            epoch_start: epoch_start.into(),
        }
    }

    /// One sync pass. Locations are processed in listing order, pages in
    /// server order; the first remote or store failure aborts the run and
    /// leaves already-committed rows in place.
    pub async fn run_once(&self) -> Result<SyncRunSummary, SyncError> {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();

        self.sink.reconcile_watermark().await?;
        let watermark = self.sink.watermark().await?;
        let window = compute_window(watermark, &self.epoch_start, started_at);
        info!(%run_id, start = %window.start, end = %window.end, "starting sync run");

        let locations = self.source.list_locations().await?;

        let mut pages = 0usize;
        let mut orders_seen = 0usize;
        let mut records_inserted = 0usize;
        let mut duplicates_skipped = 0usize;

        for location in &locations {
            let mut cursor: Option<String> = None;
            loop {
                let page = self
                    .source
                    .search_orders(&location.id, &window, cursor.as_deref())
                    .await?;
                pages += 1;

                for order in &page.orders {
                    orders_seen += 1;
                    for record in order_to_records(order) {
                        match self.sink.insert(&record).await? {
                            InsertOutcome::Inserted => records_inserted += 1,
                            InsertOutcome::DuplicateIgnored => duplicates_skipped += 1,
                        }
                    }
                }

                cursor = page.cursor;
                if cursor.is_none() {
                    break;
                }
            }
        }

        let finished_at = Utc::now();
        info!(
            %run_id,
            locations = locations.len(),
            orders_seen,
            records_inserted,
            duplicates_skipped,
            "sync run complete"
        );
        Ok(SyncRunSummary {
            run_id,
            started_at,
            finished_at,
            window_start: window.start,
            window_end: window.end,
            locations: locations.len(),
            pages,
            orders_seen,
            records_inserted,
            duplicates_skipped,
        })
    }
}

/// Run one sync pass with everything wired from the environment. The pool
/// is acquired for this run only and released on every exit path; a store
/// that cannot be reached fails here, before the run begins.
pub async fn run_sync_once(config: &SyncConfig) -> Result<SyncRunSummary> {
    let pool = PgPoolOptions::new()
        .max_connections(2)
        .connect(&config.database_url)
        .await
        .context("connecting to database")?;
    let store = SalesStore::new(pool.clone());
    store.migrate().await.context("creating database schema")?;

    let source = SquareApiSource::new(SquareClientConfig {
        base_url: config.api_base_url.clone(),
        access_token: config.access_token.clone(),
        timeout: Duration::from_secs(config.http_timeout_secs),
    })
    .context("building commerce api client")?;

    let engine = SyncEngine::new(
        Arc::new(source),
        Arc::new(store),
        config.epoch_start.clone(),
    );
    let outcome = engine.run_once().await;
    pool.close().await;
    Ok(outcome?)
}

pub async fn run_sync_once_from_env() -> Result<SyncRunSummary> {
    let config = SyncConfig::from_env();
    run_sync_once(&config).await
}

/// Create the schema and nothing else.
pub async fn migrate_from_env() -> Result<()> {
    let config = SyncConfig::from_env();
    let pool = PgPoolOptions::new()
        .max_connections(1)
        .connect(&config.database_url)
        .await
        .context("connecting to database")?;
    SalesStore::new(pool.clone())
        .migrate()
        .await
        .context("creating database schema")?;
    pool.close().await;
    Ok(())
}

/// Build the scheduler with one job on the configured cron expression.
/// Jobs never run at startup; each firing wires a fresh run from the
/// environment so no connection outlives its run.
pub async fn build_scheduler(config: &SyncConfig) -> Result<JobScheduler> {
    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let cron = config.sync_cron.clone();
    let job = Job::new_async(cron.as_str(), |_uuid, _l| {
        Box::pin(async move {
            match run_sync_once_from_env().await {
                Ok(summary) => info!(
                    run_id = %summary.run_id,
                    records_inserted = summary.records_inserted,
                    duplicates_skipped = summary.duplicates_skipped,
                    "scheduled sync run complete"
                ),
                Err(err) => warn!(error = %format!("{err:#}"), "scheduled sync run failed"),
            }
        })
    })
    .with_context(|| format!("creating scheduler job for cron {cron}"))?;
    sched.add(job).await.context("adding scheduler job")?;
    Ok(sched)
}

/// Start the scheduler and park until interrupted.
pub async fn run_scheduler_from_env() -> Result<()> {
    let config = SyncConfig::from_env();
    let sched = build_scheduler(&config).await?;
    sched.start().await.context("starting scheduler")?;
    info!(cron = %config.sync_cron, "scheduler running");
    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;
    Ok(())
}
