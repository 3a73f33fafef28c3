use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Postgres, QueryBuilder, Row};
use tracing::debug;

use crate::config::PersistenceConfig;
use crate::error::LedgerError;
use crate::job::{ColumnMap, JobRecord, JobStatus, RowIndex};
use crate::ledger::{JobLedger, LedgerSchema};

/// Rows per bulk upsert statement; keeps the bind count below the
/// protocol limit.
const UPSERT_CHUNK: usize = 1_000;

/// PostgreSQL-backed job ledger.
///
/// Many ledgers can share the `fleet_jobs` table; each is scoped by its
/// name. Writes are bulk upserts keyed on `(ledger_name, row_idx)`, where
/// unset fields keep their stored value and caller columns are merged into
/// the stored `columns` document.
#[derive(Debug, Clone)]
pub struct PostgresLedger {
    pool: PgPool,
    name: String,
    schema: LedgerSchema,
}

impl PostgresLedger {
    pub fn new(pool: PgPool, name: impl Into<String>, schema: LedgerSchema) -> Self {
        Self {
            pool,
            name: name.into(),
            schema,
        }
    }

    /// Connect a pool from `config` and make sure the ledger tables exist.
    pub async fn connect(config: &PersistenceConfig, schema: LedgerSchema) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(Duration::from_secs(config.acquire_timeout_seconds))
            .connect(&config.connection_string)
            .await?;
        let ledger = Self::new(pool, config.ledger_name.clone(), schema);
        ledger.ensure_schema().await?;
        Ok(ledger)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Get a reference to the connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create the ledger tables if they are missing.
    pub async fn ensure_schema(&self) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS fleet_ledgers (
                name TEXT PRIMARY KEY,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS fleet_jobs (
                ledger_name TEXT NOT NULL REFERENCES fleet_ledgers(name),
                row_idx BIGINT NOT NULL,
                job_id TEXT,
                backend_name TEXT,
                status TEXT NOT NULL DEFAULT 'not_started',
                start_time TIMESTAMPTZ,
                running_start_time TIMESTAMPTZ,
                cpu TEXT,
                memory TEXT,
                duration TEXT,
                costs DOUBLE PRECISION,
                columns JSONB NOT NULL DEFAULT '{}'::jsonb,
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                PRIMARY KEY (ledger_name, row_idx)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    fn decode(&self, row: &PgRow) -> anyhow::Result<JobRecord> {
        let row_idx: i64 = row.try_get("row_idx")?;
        let status: String = row.try_get("status")?;
        let columns: serde_json::Value = row.try_get("columns")?;

        let mut record = JobRecord::new(row_idx as usize);
        record.status = status
            .parse()
            .map_err(|message: String| LedgerError::malformed(self.location(), message))?;
        record.id = row.try_get("job_id")?;
        record.backend_name = row.try_get("backend_name")?;
        record.start_time = row.try_get::<Option<DateTime<Utc>>, _>("start_time")?;
        record.running_start_time = row.try_get::<Option<DateTime<Utc>>, _>("running_start_time")?;
        record.cpu = row.try_get("cpu")?;
        record.memory = row.try_get("memory")?;
        record.duration = row.try_get("duration")?;
        record.costs = row.try_get("costs")?;
        record.columns = serde_json::from_value::<ColumnMap>(columns).map_err(|err| {
            LedgerError::malformed(self.location(), format!("row {row_idx} columns: {err}"))
        })?;
        Ok(record)
    }

    fn status_filter(statuses: &[JobStatus]) -> Option<Vec<String>> {
        if statuses.is_empty() {
            None
        } else {
            Some(statuses.iter().map(|s| s.as_str().to_string()).collect())
        }
    }
}

#[async_trait]
impl JobLedger for PostgresLedger {
    fn location(&self) -> String {
        format!("postgres:fleet_jobs/{}", self.name)
    }

    async fn exists(&self) -> anyhow::Result<bool> {
        let row = sqlx::query("SELECT EXISTS (SELECT 1 FROM fleet_ledgers WHERE name = $1) AS present")
            .bind(&self.name)
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get("present")?)
    }

    async fn persist(&self, records: &[JobRecord]) -> anyhow::Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("INSERT INTO fleet_ledgers (name) VALUES ($1) ON CONFLICT (name) DO NOTHING")
            .bind(&self.name)
            .execute(&mut *tx)
            .await?;

        for chunk in records.chunks(UPSERT_CHUNK) {
            let mut rows = Vec::with_capacity(chunk.len());
            for record in chunk {
                let mut record = record.clone();
                self.schema.fill_defaults(&mut record);
                let columns = serde_json::to_value(&record.columns)?;
                rows.push((record, columns));
            }

            let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(
                "INSERT INTO fleet_jobs (ledger_name, row_idx, job_id, backend_name, status, \
                 start_time, running_start_time, cpu, memory, duration, costs, columns) ",
            );
            builder.push_values(rows, |mut b, (record, columns)| {
                b.push_bind(&self.name)
                    .push_bind(record.row.0 as i64)
                    .push_bind(record.id)
                    .push_bind(record.backend_name)
                    .push_bind(record.status.as_str())
                    .push_bind(record.start_time)
                    .push_bind(record.running_start_time)
                    .push_bind(record.cpu)
                    .push_bind(record.memory)
                    .push_bind(record.duration)
                    .push_bind(record.costs)
                    .push_bind(columns);
            });
            builder.push(
                r#"
                ON CONFLICT (ledger_name, row_idx) DO UPDATE SET
                    job_id = COALESCE(fleet_jobs.job_id, EXCLUDED.job_id),
                    backend_name = COALESCE(EXCLUDED.backend_name, fleet_jobs.backend_name),
                    status = EXCLUDED.status,
                    start_time = COALESCE(EXCLUDED.start_time, fleet_jobs.start_time),
                    running_start_time = COALESCE(EXCLUDED.running_start_time, fleet_jobs.running_start_time),
                    cpu = COALESCE(EXCLUDED.cpu, fleet_jobs.cpu),
                    memory = COALESCE(EXCLUDED.memory, fleet_jobs.memory),
                    duration = COALESCE(EXCLUDED.duration, fleet_jobs.duration),
                    costs = COALESCE(EXCLUDED.costs, fleet_jobs.costs),
                    columns = fleet_jobs.columns || EXCLUDED.columns,
                    updated_at = NOW()
                "#,
            );
            builder.build().execute(&mut *tx).await?;
        }

        tx.commit().await?;
        debug!(ledger = %self.name, rows = records.len(), "persisted ledger rows");
        Ok(())
    }

    async fn count_by_status(
        &self,
        statuses: &[JobStatus],
    ) -> anyhow::Result<HashMap<JobStatus, usize>> {
        let rows = sqlx::query(
            r#"
            SELECT status, COUNT(*)::bigint AS count
            FROM fleet_jobs
            WHERE ledger_name = $1
              AND ($2::text[] IS NULL OR status = ANY($2))
            GROUP BY status
            "#,
        )
        .bind(&self.name)
        .bind(Self::status_filter(statuses))
        .fetch_all(&self.pool)
        .await?;

        let mut counts: HashMap<JobStatus, usize> = statuses.iter().map(|s| (*s, 0)).collect();
        for row in rows {
            let status: String = row.try_get("status")?;
            let count: i64 = row.try_get("count")?;
            let status: JobStatus = status
                .parse()
                .map_err(|message: String| LedgerError::malformed(self.location(), message))?;
            counts.insert(status, count as usize);
        }
        Ok(counts)
    }

    async fn get_by_status(
        &self,
        statuses: &[JobStatus],
        max: Option<usize>,
    ) -> anyhow::Result<Vec<JobRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT row_idx, job_id, backend_name, status, start_time, running_start_time,
                   cpu, memory, duration, costs, columns
            FROM fleet_jobs
            WHERE ledger_name = $1
              AND ($2::text[] IS NULL OR status = ANY($2))
            ORDER BY row_idx ASC
            LIMIT $3
            "#,
        )
        .bind(&self.name)
        .bind(Self::status_filter(statuses))
        .bind(max.map(|m| m as i64))
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(|row| self.decode(row)).collect()
    }

    async fn get_by_indices(&self, indices: &[RowIndex]) -> anyhow::Result<Vec<JobRecord>> {
        let wanted: Vec<i64> = indices.iter().map(|i| i.0 as i64).collect();
        let rows = sqlx::query(
            r#"
            SELECT row_idx, job_id, backend_name, status, start_time, running_start_time,
                   cpu, memory, duration, costs, columns
            FROM fleet_jobs
            WHERE ledger_name = $1
              AND row_idx = ANY($2)
            ORDER BY row_idx ASC
            "#,
        )
        .bind(&self.name)
        .bind(&wanted)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(|row| self.decode(row)).collect()
    }
}
