//! Persistence contracts for the sync pipeline plus PostgreSQL and in-memory implementations.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use nrega_core::{MetricKey, PeriodMetric, Region, RegionBatch, RegionKey, SyncRun, SyncStatus, METRIC_FIELDS};
use serde::Serialize;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

pub const CRATE_NAME: &str = "nrega-storage";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("invalid batch: {0}")]
    InvalidBatch(String),
    #[error("corrupt ledger row: {0}")]
    Corrupt(String),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct WriteReport {
    pub regions_written: usize,
    pub metrics_written: usize,
}

/// Idempotent natural-key upsert of one district and its metric rows, atomically.
#[async_trait]
pub trait UpsertWriter: Send + Sync {
    async fn write(&self, batch: &RegionBatch) -> Result<WriteReport, StoreError>;
}

/// Append-only log of pipeline invocations.
#[async_trait]
pub trait RunLedger: Send + Sync {
    async fn record(&self, run: &SyncRun) -> Result<(), StoreError>;

    /// Newest rows first.
    async fn recent(&self, limit: usize) -> Result<Vec<SyncRun>, StoreError>;
}

/// Every metric in a batch must belong to the batch's district.
pub fn validate_batch(batch: &RegionBatch) -> Result<(), StoreError> {
    if batch.region.state_code.is_empty() || batch.region.district_code.is_empty() {
        return Err(StoreError::InvalidBatch(
            "region natural key has an empty component".to_string(),
        ));
    }
    let key = batch.region.key();
    for metric in &batch.metrics {
        if metric.state_code != key.state_code || metric.district_code != key.district_code {
            return Err(StoreError::InvalidBatch(format!(
                "metric for {}/{} inside batch for {}",
                metric.state_code, metric.district_code, key
            )));
        }
        if metric.fin_year.is_empty() {
            return Err(StoreError::InvalidBatch(format!(
                "metric for {key} has no fiscal year"
            )));
        }
    }
    Ok(())
}

#[derive(Debug, Clone, Copy)]
pub struct PoolSettings {
    pub max_connections: u32,
    pub acquire_timeout: Duration,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            max_connections: 5,
            acquire_timeout: Duration::from_secs(10),
        }
    }
}

const UPSERT_DISTRICT_SQL: &str = r#"
    INSERT INTO districts (state_code, state_name, district_code, district_name)
    VALUES ($1, $2, $3, $4)
    ON CONFLICT (state_code, district_code)
    DO UPDATE SET
        state_name = COALESCE(NULLIF(EXCLUDED.state_name, ''), districts.state_name),
        district_name = COALESCE(NULLIF(EXCLUDED.district_name, ''), districts.district_name),
        updated_at = now()
    RETURNING id
"#;

const INSERT_RUN_SQL: &str = r#"
    INSERT INTO sync_runs (
        id, source, operation, status, records_count, error_message,
        request_params, response_time_ms, started_at, completed_at
    )
    VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
"#;

const RECENT_RUNS_SQL: &str = r#"
    SELECT id, source, operation, status, records_count, error_message,
           request_params, response_time_ms, started_at, completed_at
      FROM sync_runs
     ORDER BY started_at DESC
     LIMIT $1
"#;

/// `INSERT .. ON CONFLICT (district_id, fin_year, month) DO UPDATE` over every metric column.
pub fn metric_upsert_sql() -> &'static str {
    static SQL: OnceLock<String> = OnceLock::new();
    SQL.get_or_init(|| {
        let fixed = ["district_id", "state_code", "state_name", "fin_year", "month"];
        let columns = fixed
            .iter()
            .copied()
            .chain(METRIC_FIELDS.iter().map(|f| f.column))
            .collect::<Vec<_>>();
        let placeholders = (1..=columns.len())
            .map(|i| format!("${i}"))
            .collect::<Vec<_>>()
            .join(", ");
        let updates = ["state_code", "state_name"]
            .iter()
            .copied()
            .chain(METRIC_FIELDS.iter().map(|f| f.column))
            .map(|c| format!("{c} = EXCLUDED.{c}"))
            .collect::<Vec<_>>()
            .join(",\n        ");
        format!(
            "INSERT INTO district_metrics ({})\n    VALUES ({})\n    ON CONFLICT (district_id, fin_year, month)\n    DO UPDATE SET\n        {},\n        updated_at = now()",
            columns.join(", "),
            placeholders,
            updates
        )
    })
}

#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(database_url: &str, settings: PoolSettings) -> Result<Self, StoreError> {
        let pool = Self::pool_options(settings).connect(database_url).await?;
        Ok(Self { pool })
    }

    /// Pool that only dials the database on first use.
    pub fn connect_lazy(database_url: &str, settings: PoolSettings) -> Result<Self, StoreError> {
        let pool = Self::pool_options(settings).connect_lazy(database_url)?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    fn pool_options(settings: PoolSettings) -> PgPoolOptions {
        PgPoolOptions::new()
            .max_connections(settings.max_connections.max(1))
            .acquire_timeout(settings.acquire_timeout)
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        Ok(())
    }

    pub async fn ping(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

#[async_trait]
impl UpsertWriter for PgStore {
    async fn write(&self, batch: &RegionBatch) -> Result<WriteReport, StoreError> {
        validate_batch(batch)?;

        // Dropping the transaction on an early return rolls back this district only.
        let mut tx = self.pool.begin().await?;

        let region = &batch.region;
        let district_id: i64 = sqlx::query_scalar(UPSERT_DISTRICT_SQL)
            .bind(&region.state_code)
            .bind(&region.state_name)
            .bind(&region.district_code)
            .bind(&region.district_name)
            .fetch_one(&mut *tx)
            .await?;

        let mut metrics_written = 0usize;
        for metric in &batch.metrics {
            let mut query = sqlx::query(metric_upsert_sql())
                .bind(district_id)
                .bind(&metric.state_code)
                .bind(&metric.state_name)
                .bind(&metric.fin_year)
                .bind(&metric.month);
            for value in metric.values.as_slice() {
                query = query.bind(*value);
            }
            query.execute(&mut *tx).await?;
            metrics_written += 1;
        }

        tx.commit().await?;
        debug!(district = %region.key(), metrics_written, "district batch committed");

        Ok(WriteReport {
            regions_written: 1,
            metrics_written,
        })
    }
}

#[async_trait]
impl RunLedger for PgStore {
    async fn record(&self, run: &SyncRun) -> Result<(), StoreError> {
        sqlx::query(INSERT_RUN_SQL)
            .bind(run.id)
            .bind(&run.source)
            .bind(&run.operation)
            .bind(run.status.as_str())
            .bind(run.records_count)
            .bind(&run.error_message)
            .bind(&run.request_params)
            .bind(run.response_time_ms)
            .bind(run.started_at)
            .bind(run.completed_at)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn recent(&self, limit: usize) -> Result<Vec<SyncRun>, StoreError> {
        let rows = sqlx::query(RECENT_RUNS_SQL)
            .bind(limit.min(i64::MAX as usize) as i64)
            .fetch_all(&self.pool)
            .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let status: String = row.try_get("status")?;
            let status = status.parse::<SyncStatus>().map_err(StoreError::Corrupt)?;
            let id: Uuid = row.try_get("id")?;
            let started_at: DateTime<Utc> = row.try_get("started_at")?;
            let completed_at: DateTime<Utc> = row.try_get("completed_at")?;
            out.push(SyncRun {
                id,
                source: row.try_get("source")?,
                operation: row.try_get("operation")?,
                status,
                records_count: row.try_get("records_count")?,
                error_message: row.try_get("error_message")?,
                request_params: row.try_get("request_params")?,
                response_time_ms: row.try_get("response_time_ms")?,
                started_at,
                completed_at,
            });
        }
        Ok(out)
    }
}

/// In-process store with the same natural-key semantics as [`PgStore`].
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

#[derive(Debug, Default)]
struct MemoryState {
    regions: BTreeMap<RegionKey, Region>,
    metrics: BTreeMap<MetricKey, PeriodMetric>,
    runs: Vec<SyncRun>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn region_count(&self) -> usize {
        self.lock().regions.len()
    }

    pub fn metric_count(&self) -> usize {
        self.lock().metrics.len()
    }

    pub fn region(&self, key: &RegionKey) -> Option<Region> {
        self.lock().regions.get(key).cloned()
    }

    pub fn metric(&self, key: &MetricKey) -> Option<PeriodMetric> {
        self.lock().metrics.get(key).cloned()
    }

    pub fn metrics(&self) -> Vec<PeriodMetric> {
        self.lock().metrics.values().cloned().collect()
    }

    pub fn runs(&self) -> Vec<SyncRun> {
        self.lock().runs.clone()
    }
}

fn refreshed(new: &str, old: &str) -> String {
    let chosen = if new.is_empty() { old } else { new };
    chosen.to_string()
}

#[async_trait]
impl UpsertWriter for MemoryStore {
    async fn write(&self, batch: &RegionBatch) -> Result<WriteReport, StoreError> {
        validate_batch(batch)?;

        let mut state = self.lock();
        let incoming = &batch.region;
        let merged = match state.regions.get(&incoming.key()) {
            Some(existing) => Region {
                state_code: existing.state_code.clone(),
                district_code: existing.district_code.clone(),
                state_name: refreshed(&incoming.state_name, &existing.state_name),
                district_name: refreshed(&incoming.district_name, &existing.district_name),
            },
            None => incoming.clone(),
        };
        state.regions.insert(merged.key(), merged);

        for metric in &batch.metrics {
            state.metrics.insert(metric.natural_key(), metric.clone());
        }

        Ok(WriteReport {
            regions_written: 1,
            metrics_written: batch.metrics.len(),
        })
    }
}

#[async_trait]
impl RunLedger for MemoryStore {
    async fn record(&self, run: &SyncRun) -> Result<(), StoreError> {
        self.lock().runs.push(run.clone());
        Ok(())
    }

    async fn recent(&self, limit: usize) -> Result<Vec<SyncRun>, StoreError> {
        let mut runs = self.lock().runs.clone();
        runs.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        runs.truncate(limit);
        Ok(runs)
    }
}
