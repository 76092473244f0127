//! PostgreSQL storage backend.
//!
//! Every trait method runs in one transaction. Concurrency rests on row locks:
//!
//! - claims lock candidate job rows `FOR UPDATE SKIP LOCKED`, then re-read the
//!   current status of the locked jobs in a fresh statement, so a job claimed
//!   by a transaction that committed meanwhile is dropped from the batch
//! - status appends lock the affected job rows in id order before validating
//! - inserts take `FOR SHARE` on the dataset's catalog row, so sealing (an
//!   update of that row) waits for in-flight inserts and later inserts see
//!   the sealed state
//! - structural changes update the catalog row before dropping tables, so
//!   readers holding the row share lock finish first
//!
//! The structural lock is a session-level advisory lock on a pooled
//! connection kept for as long as the lock is held. It is released when the
//! holder unlocks or its session ends; the lease only arbitrates between
//! owners inside this process.

mod sql;

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::pool::PoolConnection;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::types::Json;
use sqlx::{Postgres, QueryBuilder, Row, Transaction};
use tokio::sync::Mutex;
use tracing::{debug, instrument, warn};

use crate::{
    backend::StorageBackend,
    types::{
        ArchiveHandle, ArchivedJob, Dataset, DatasetIndex, DatasetState, Job, JobFilter, JobId,
        JobState, JobWithStatus, JournalEntry, JournalEntryId, JournalOperation, LockOwner, NewJob,
        NewStatus, StateCounts, StatusEvent, StatusUpdate,
    },
    JobsDbError, JobsDbResult,
};

use sql::{
    archive_handle_from_row, datasets_table, is_undefined_table, is_unique_violation,
    job_from_row, job_sequence, joined_from_row, journal_from_row, journal_table,
    latest_status_select, map_dataset_error, map_sqlx_error, migrations_table, push_job_filter,
    push_state_filter, state_names, status_from_row, JOB_COLUMNS, STATUS_COLUMNS,
};

/// Rows per multi-row INSERT, well below the bind parameter limit
const INSERT_CHUNK: usize = 1000;

struct HeldLock {
    owner: LockOwner,
    expires_at: DateTime<Utc>,
    conn: PoolConnection<Postgres>,
}

/// Postgres-backed [`StorageBackend`]
#[derive(Clone)]
pub struct PostgresBackend {
    pool: PgPool,
    locks: Arc<Mutex<HashMap<String, HeldLock>>>,
}

impl PostgresBackend {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            locks: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Connect a pool of `max_connections` to `url`
    pub async fn connect(url: &str, max_connections: u32) -> JobsDbResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await
            .map_err(|e| map_sqlx_error("connect", e))?;
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn begin(&self, operation: &str) -> JobsDbResult<Transaction<'static, Postgres>> {
        self.pool.begin().await.map_err(|e| map_sqlx_error(operation, e))
    }

    async fn commit(tx: Transaction<'static, Postgres>, operation: &str) -> JobsDbResult<()> {
        tx.commit().await.map_err(|e| map_sqlx_error(operation, e))
    }

    async fn ensure_migrations_table(&self, prefix: &str) -> JobsDbResult<()> {
        let table = migrations_table(prefix);
        sqlx::query(&format!(
            "CREATE TABLE IF NOT EXISTS {table} (
                singleton BOOLEAN PRIMARY KEY DEFAULT TRUE CHECK (singleton),
                version BIGINT NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )"
        ))
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("ensure_migrations_table", e))?;
        Ok(())
    }

    async fn record_version(
        conn: &mut sqlx::PgConnection,
        prefix: &str,
        version: i64,
    ) -> Result<(), sqlx::Error> {
        let table = migrations_table(prefix);
        sqlx::query(&format!(
            "INSERT INTO {table} (singleton, version) VALUES (TRUE, $1)
             ON CONFLICT (singleton) DO UPDATE SET version = EXCLUDED.version, updated_at = NOW()"
        ))
        .bind(version)
        .execute(conn)
        .await?;
        Ok(())
    }

    /// Create the tables of `index` and register it, unless it is registered already
    async fn insert_dataset(
        tx: &mut Transaction<'static, Postgres>,
        prefix: &str,
        index: &DatasetIndex,
        schema_version: i64,
        ddl: &[String],
        state: DatasetState,
    ) -> Result<bool, sqlx::Error> {
        let table = datasets_table(prefix);
        let exists: Option<i32> = sqlx::query_scalar(&format!("SELECT 1 FROM {table} WHERE idx = $1"))
            .bind(index.to_string())
            .fetch_optional(&mut **tx)
            .await?;
        if exists.is_some() {
            return Ok(false);
        }

        for statement in ddl {
            sqlx::query(statement).execute(&mut **tx).await?;
        }
        let components: Vec<i32> = index.components().iter().map(|c| *c as i32).collect();
        sqlx::query(&format!(
            "INSERT INTO {table} (idx, components, state, schema_version) VALUES ($1, $2, $3, $4)"
        ))
        .bind(index.to_string())
        .bind(components)
        .bind(state.as_str())
        .bind(schema_version)
        .execute(&mut **tx)
        .await?;
        Ok(true)
    }

    /// Lock the catalog rows of `indices` for share, returning the states of those found
    async fn share_datasets(
        tx: &mut Transaction<'static, Postgres>,
        prefix: &str,
        indices: &[DatasetIndex],
    ) -> JobsDbResult<HashMap<DatasetIndex, DatasetState>> {
        let table = datasets_table(prefix);
        let names: Vec<String> = indices.iter().map(ToString::to_string).collect();
        let rows = sqlx::query(&format!(
            "SELECT idx, state FROM {table} WHERE idx = ANY($1) ORDER BY components FOR SHARE"
        ))
        .bind(names)
        .fetch_all(&mut **tx)
        .await
        .map_err(|e| map_sqlx_error("share_datasets", e))?;

        let mut states = HashMap::with_capacity(rows.len());
        for row in rows {
            let idx: String = row.try_get("idx").map_err(|e| map_sqlx_error("share_datasets", e))?;
            let state: String = row.try_get("state").map_err(|e| map_sqlx_error("share_datasets", e))?;
            states.insert(idx.parse()?, state.parse()?);
        }
        Ok(states)
    }

    /// Current status per job, read in a fresh statement
    async fn current_statuses(
        tx: &mut Transaction<'static, Postgres>,
        prefix: &str,
        index: &DatasetIndex,
        job_ids: &[i64],
    ) -> JobsDbResult<HashMap<JobId, StatusEvent>> {
        let status = index.status_table(prefix);
        let rows = sqlx::query(&format!(
            "SELECT DISTINCT ON (job_id) status_id, {STATUS_COLUMNS} FROM {status}
             WHERE job_id = ANY($1) ORDER BY job_id, status_id DESC"
        ))
        .bind(job_ids.to_vec())
        .fetch_all(&mut **tx)
        .await
        .map_err(|e| map_dataset_error("current_statuses", index, e))?;

        rows.iter()
            .map(|row| status_from_row(row, "parameters").map(|status| (status.job_id, status)))
            .collect()
    }

    /// Insert status rows in order and return them with their ids
    async fn insert_statuses(
        tx: &mut Transaction<'static, Postgres>,
        prefix: &str,
        index: &DatasetIndex,
        rows: Vec<NewStatus>,
    ) -> JobsDbResult<Vec<StatusEvent>> {
        let status = index.status_table(prefix);
        let mut events = Vec::with_capacity(rows.len());
        for chunk in rows.chunks(INSERT_CHUNK) {
            let mut builder: QueryBuilder<Postgres> =
                QueryBuilder::new(format!("INSERT INTO {status} ({STATUS_COLUMNS}) "));
            builder.push_values(chunk, |mut b, row| {
                b.push_bind(row.job_id.0)
                    .push_bind(row.state.as_str())
                    .push_bind(row.attempt as i32)
                    .push_bind(row.exec_time)
                    .push_bind(row.retry_time)
                    .push_bind(row.error_code.clone())
                    .push_bind(row.error_response.clone().map(Json))
                    .push_bind(row.worker.clone())
                    .push_bind(Json(row.parameters.clone()));
            });
            builder.push(" RETURNING status_id");
            let mut ids: Vec<i64> = builder
                .build_query_scalar()
                .fetch_all(&mut **tx)
                .await
                .map_err(|e| map_dataset_error("insert_statuses", index, e))?;
            // Serial ids are drawn in VALUES order
            ids.sort_unstable();
            if ids.len() != chunk.len() {
                return Err(JobsDbError::Internal(format!(
                    "inserted {} statuses into {status}, expected {}",
                    ids.len(),
                    chunk.len()
                )));
            }
            events.extend(chunk.iter().cloned().zip(ids).map(|(row, id)| row.into_event(id)));
        }
        Ok(events)
    }

    async fn claim_in_dataset(
        tx: &mut Transaction<'static, Postgres>,
        prefix: &str,
        index: &DatasetIndex,
        filter: &JobFilter,
        limit: usize,
        worker: &str,
        now: DateTime<Utc>,
    ) -> JobsDbResult<Vec<JobWithStatus>> {
        let mut builder = latest_status_select(prefix, index);
        push_job_filter(&mut builder, filter);
        push_state_filter(&mut builder, filter);
        builder
            .push(" AND (s.state = 'waiting' OR (s.state = 'failed' AND s.retry_time <= ")
            .push_bind(now)
            .push(")) ORDER BY j.job_id LIMIT ")
            .push_bind(limit as i64)
            .push(" FOR UPDATE OF j SKIP LOCKED");
        let rows = builder
            .build()
            .fetch_all(&mut **tx)
            .await
            .map_err(|e| map_dataset_error("claim_jobs", index, e))?;
        if rows.is_empty() {
            return Ok(Vec::new());
        }

        let mut candidates = Vec::with_capacity(rows.len());
        for row in &rows {
            candidates.push(job_from_row(row)?);
        }
        let ids: Vec<i64> = candidates.iter().map(|job| job.job_id.0).collect();

        // The statement snapshot predates our row locks; trust only a fresh read
        let current = Self::current_statuses(tx, prefix, index, &ids).await?;
        let mut claimed_jobs = Vec::new();
        let mut statuses = Vec::new();
        for job in candidates {
            let Some(status) = current.get(&job.job_id) else {
                continue;
            };
            if !filter.claimable(status, now) {
                debug!(job_id = %job.job_id, state = %status.state, "job changed before claim, skipping");
                continue;
            }
            statuses.push(NewStatus::executing(job.job_id, status.attempt + 1, worker, now));
            claimed_jobs.push(job);
        }

        let events = Self::insert_statuses(tx, prefix, index, statuses).await?;
        Ok(claimed_jobs
            .into_iter()
            .zip(events)
            .map(|(job, status)| JobWithStatus {
                dataset: index.clone(),
                job,
                status,
            })
            .collect())
    }

    async fn dataset_stats(&self, prefix: &str, dataset: &mut Dataset) -> JobsDbResult<()> {
        let jobs = dataset.index.jobs_table(prefix);
        let row = match sqlx::query(&format!(
            "SELECT COUNT(*) AS row_count, MIN(job_id) AS min_id, MAX(job_id) AS max_id FROM {jobs}"
        ))
        .fetch_one(&self.pool)
        .await
        {
            Ok(row) => row,
            // Dropped after the catalog was read
            Err(e) if is_undefined_table(&e) => return Ok(()),
            Err(e) => return Err(map_sqlx_error("dataset_stats", e)),
        };
        let count: i64 = row.try_get("row_count").map_err(|e| map_sqlx_error("dataset_stats", e))?;
        let min: Option<i64> = row.try_get("min_id").map_err(|e| map_sqlx_error("dataset_stats", e))?;
        let max: Option<i64> = row.try_get("max_id").map_err(|e| map_sqlx_error("dataset_stats", e))?;
        dataset.row_count = count.max(0) as u64;
        dataset.min_job_id = min.map(JobId);
        dataset.max_job_id = max.map(JobId);
        Ok(())
    }
}

fn lease_until(lease: Duration) -> JobsDbResult<DateTime<Utc>> {
    let lease = chrono::Duration::from_std(lease)
        .map_err(|e| JobsDbError::Config(format!("lock lease out of range: {e}")))?;
    Ok(Utc::now() + lease)
}

#[async_trait]
impl StorageBackend for PostgresBackend {
    fn name(&self) -> &'static str {
        "postgres"
    }

    async fn try_lock(&self, scope: &str, owner: &LockOwner, lease: Duration) -> JobsDbResult<bool> {
        let expires_at = lease_until(lease)?;
        let mut locks = self.locks.lock().await;
        if let Some(held) = locks.get_mut(scope) {
            if held.owner != *owner && held.expires_at > Utc::now() {
                return Ok(false);
            }
            // Same owner, or an expired local holder: the session lock carries over
            held.owner = owner.clone();
            held.expires_at = expires_at;
            return Ok(true);
        }

        let mut conn = self
            .pool
            .acquire()
            .await
            .map_err(|e| map_sqlx_error("try_lock", e))?;
        let acquired: bool = sqlx::query_scalar("SELECT pg_try_advisory_lock(hashtext($1))")
            .bind(scope)
            .fetch_one(&mut *conn)
            .await
            .map_err(|e| map_sqlx_error("try_lock", e))?;
        if acquired {
            locks.insert(
                scope.to_string(),
                HeldLock {
                    owner: owner.clone(),
                    expires_at,
                    conn,
                },
            );
        }
        Ok(acquired)
    }

    async fn renew_lock(&self, scope: &str, owner: &LockOwner, lease: Duration) -> JobsDbResult<bool> {
        let expires_at = lease_until(lease)?;
        let mut locks = self.locks.lock().await;
        let Some(held) = locks.get_mut(scope) else {
            return Ok(false);
        };
        if held.owner != *owner {
            return Ok(false);
        }
        // The advisory lock lives exactly as long as its session
        match sqlx::query("SELECT 1").execute(&mut *held.conn).await {
            Ok(_) => {
                held.expires_at = expires_at;
                Ok(true)
            }
            Err(e) => {
                warn!(scope, error = %e, "lock session lost");
                if let Some(held) = locks.remove(scope) {
                    let _ = held.conn.close().await;
                }
                Ok(false)
            }
        }
    }

    async fn unlock(&self, scope: &str, owner: &LockOwner) -> JobsDbResult<()> {
        let mut locks = self.locks.lock().await;
        if !locks.get(scope).is_some_and(|held| held.owner == *owner) {
            return Ok(());
        }
        let Some(mut held) = locks.remove(scope) else {
            return Ok(());
        };
        let released = sqlx::query("SELECT pg_advisory_unlock(hashtext($1))")
            .bind(scope)
            .execute(&mut *held.conn)
            .await;
        if let Err(e) = released {
            // Closing the session releases the lock as well
            warn!(scope, error = %e, "advisory unlock failed, closing session");
            let _ = held.conn.close().await;
        }
        Ok(())
    }

    async fn schema_version(&self, prefix: &str) -> JobsDbResult<Option<i64>> {
        self.ensure_migrations_table(prefix).await?;
        let table = migrations_table(prefix);
        sqlx::query_scalar(&format!("SELECT version FROM {table} WHERE singleton"))
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("schema_version", e))
    }

    #[instrument(skip(self, statements), fields(statements = statements.len()), err)]
    async fn apply_migration(&self, prefix: &str, version: i64, statements: &[String]) -> JobsDbResult<()> {
        self.ensure_migrations_table(prefix).await?;
        let mut tx = self.begin("apply_migration").await?;
        for statement in statements {
            sqlx::query(statement)
                .execute(&mut *tx)
                .await
                .map_err(|e| JobsDbError::MigrationFailure(format!("{prefix} v{version}: {e}")))?;
        }
        Self::record_version(&mut tx, prefix, version)
            .await
            .map_err(|e| map_sqlx_error("apply_migration", e))?;

        let table = datasets_table(prefix);
        let catalog: Option<String> = sqlx::query_scalar("SELECT to_regclass($1)::text")
            .bind(&table)
            .fetch_one(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("apply_migration", e))?;
        if catalog.is_some() {
            sqlx::query(&format!(
                "UPDATE {table} SET schema_version = $1 WHERE state <> 'dropped'"
            ))
            .bind(version)
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("apply_migration", e))?;
        }
        Self::commit(tx, "apply_migration").await
    }

    async fn force_schema_version(&self, prefix: &str, version: i64) -> JobsDbResult<()> {
        self.ensure_migrations_table(prefix).await?;
        let mut conn = self
            .pool
            .acquire()
            .await
            .map_err(|e| map_sqlx_error("force_schema_version", e))?;
        Self::record_version(&mut conn, prefix, version)
            .await
            .map_err(|e| map_sqlx_error("force_schema_version", e))
    }

    async fn journal_begin(&self, prefix: &str, operation: &JournalOperation) -> JobsDbResult<JournalEntryId> {
        let table = journal_table(prefix);
        let id: i64 = sqlx::query_scalar(&format!(
            "INSERT INTO {table} (operation) VALUES ($1) RETURNING id"
        ))
        .bind(Json(operation))
        .fetch_one(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("journal_begin", e))?;
        Ok(JournalEntryId(id))
    }

    async fn journal_commit(&self, prefix: &str, id: JournalEntryId) -> JobsDbResult<()> {
        let table = journal_table(prefix);
        let result = sqlx::query(&format!("DELETE FROM {table} WHERE id = $1"))
            .bind(id.0)
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("journal_commit", e))?;
        if result.rows_affected() == 0 {
            return Err(JobsDbError::Internal(format!("journal entry {id} not found")));
        }
        Ok(())
    }

    async fn journal_pending(&self, prefix: &str) -> JobsDbResult<Vec<JournalEntry>> {
        let table = journal_table(prefix);
        let rows = match sqlx::query(&format!(
            "SELECT id, operation, started_at FROM {table} ORDER BY id"
        ))
        .fetch_all(&self.pool)
        .await
        {
            Ok(rows) => rows,
            Err(e) if is_undefined_table(&e) => return Ok(Vec::new()),
            Err(e) => return Err(map_sqlx_error("journal_pending", e)),
        };
        rows.iter().map(journal_from_row).collect()
    }

    async fn list_datasets(&self, prefix: &str) -> JobsDbResult<Vec<Dataset>> {
        let table = datasets_table(prefix);
        let rows = match sqlx::query(&format!(
            "SELECT idx, state, created_at, sealed_at, schema_version, archive_handle
             FROM {table} ORDER BY components"
        ))
        .fetch_all(&self.pool)
        .await
        {
            Ok(rows) => rows,
            // Fresh prefix, catalog not migrated yet
            Err(e) if is_undefined_table(&e) => return Ok(Vec::new()),
            Err(e) => return Err(map_sqlx_error("list_datasets", e)),
        };

        let mut datasets = Vec::with_capacity(rows.len());
        for row in &rows {
            let idx: String = row.try_get("idx").map_err(|e| map_sqlx_error("list_datasets", e))?;
            let state: String = row.try_get("state").map_err(|e| map_sqlx_error("list_datasets", e))?;
            let version: i64 = row
                .try_get("schema_version")
                .map_err(|e| map_sqlx_error("list_datasets", e))?;
            let mut dataset = Dataset::new(idx.parse()?, state.parse()?, version);
            dataset.created_at = row.try_get("created_at").map_err(|e| map_sqlx_error("list_datasets", e))?;
            dataset.sealed_at = row.try_get("sealed_at").map_err(|e| map_sqlx_error("list_datasets", e))?;
            dataset.archive_handle = archive_handle_from_row(row)?;
            if dataset.state.has_tables() {
                self.dataset_stats(prefix, &mut dataset).await?;
            }
            datasets.push(dataset);
        }
        Ok(datasets)
    }

    #[instrument(skip(self, ddl), fields(dataset = %index), err)]
    async fn create_dataset(
        &self,
        prefix: &str,
        index: &DatasetIndex,
        schema_version: i64,
        ddl: &[String],
        state: DatasetState,
    ) -> JobsDbResult<bool> {
        let mut tx = self.begin("create_dataset").await?;
        match Self::insert_dataset(&mut tx, prefix, index, schema_version, ddl, state).await {
            Ok(true) => {}
            Ok(false) => return Ok(false),
            Err(e) if is_unique_violation(&e) => return Ok(false),
            Err(e) => return Err(map_sqlx_error("create_dataset", e)),
        }
        Self::commit(tx, "create_dataset").await?;
        Ok(true)
    }

    #[instrument(skip(self, ddl), fields(dataset = %index), err)]
    async fn rotate_dataset(
        &self,
        prefix: &str,
        index: &DatasetIndex,
        schema_version: i64,
        ddl: &[String],
        seal: Option<&DatasetIndex>,
    ) -> JobsDbResult<bool> {
        let table = datasets_table(prefix);
        let mut tx = self.begin("rotate_dataset").await?;
        let created = Self::insert_dataset(&mut tx, prefix, index, schema_version, ddl, DatasetState::Active)
            .await
            .map_err(|e| map_sqlx_error("rotate_dataset", e))?;
        if let Some(previous) = seal {
            // Waits for inserts holding the row for share
            let state: Option<String> = sqlx::query_scalar(&format!(
                "SELECT state FROM {table} WHERE idx = $1 FOR UPDATE"
            ))
            .bind(previous.to_string())
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("rotate_dataset", e))?;
            let state: DatasetState = state
                .ok_or_else(|| JobsDbError::DatasetNotFound(previous.clone()))?
                .parse()?;
            if state == DatasetState::Active {
                sqlx::query(&format!(
                    "UPDATE {table} SET state = 'sealed', sealed_at = COALESCE(sealed_at, NOW())
                     WHERE idx = $1"
                ))
                .bind(previous.to_string())
                .execute(&mut *tx)
                .await
                .map_err(|e| map_sqlx_error("rotate_dataset", e))?;
            }
        }
        Self::commit(tx, "rotate_dataset").await?;
        Ok(created)
    }

    async fn set_dataset_state(&self, prefix: &str, index: &DatasetIndex, state: DatasetState) -> JobsDbResult<()> {
        let table = datasets_table(prefix);
        let result = sqlx::query(&format!(
            "UPDATE {table} SET state = $2,
                sealed_at = CASE WHEN $2 = 'sealed' THEN COALESCE(sealed_at, NOW()) ELSE sealed_at END
             WHERE idx = $1"
        ))
        .bind(index.to_string())
        .bind(state.as_str())
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("set_dataset_state", e))?;
        if result.rows_affected() == 0 {
            return Err(JobsDbError::DatasetNotFound(index.clone()));
        }
        Ok(())
    }

    async fn set_archive_handle(&self, prefix: &str, index: &DatasetIndex, handle: &ArchiveHandle) -> JobsDbResult<()> {
        let table = datasets_table(prefix);
        let result = sqlx::query(&format!(
            "UPDATE {table} SET archive_handle = $2, state = 'archived' WHERE idx = $1"
        ))
        .bind(index.to_string())
        .bind(Json(handle))
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("set_archive_handle", e))?;
        if result.rows_affected() == 0 {
            return Err(JobsDbError::DatasetNotFound(index.clone()));
        }
        Ok(())
    }

    #[instrument(skip(self), fields(dataset = %index), err)]
    async fn drop_dataset_tables(&self, prefix: &str, index: &DatasetIndex) -> JobsDbResult<()> {
        let table = datasets_table(prefix);
        let mut tx = self.begin("drop_dataset_tables").await?;
        let result = sqlx::query(&format!("UPDATE {table} SET state = 'dropped' WHERE idx = $1"))
            .bind(index.to_string())
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("drop_dataset_tables", e))?;
        if result.rows_affected() == 0 {
            return Err(JobsDbError::DatasetNotFound(index.clone()));
        }
        sqlx::query(&format!(
            "DROP TABLE IF EXISTS {}, {}",
            index.status_table(prefix),
            index.jobs_table(prefix)
        ))
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("drop_dataset_tables", e))?;
        Self::commit(tx, "drop_dataset_tables").await
    }

    #[instrument(skip(self), fields(source = %source, target = %target), err)]
    async fn copy_dataset(&self, prefix: &str, source: &DatasetIndex, target: &DatasetIndex) -> JobsDbResult<u64> {
        let (source_jobs, source_status) = (source.jobs_table(prefix), source.status_table(prefix));
        let (target_jobs, target_status) = (target.jobs_table(prefix), target.status_table(prefix));
        let mut tx = self.begin("copy_dataset").await?;

        let copied: Vec<i64> = sqlx::query_scalar(&format!(
            "INSERT INTO {target_jobs} ({JOB_COLUMNS})
             SELECT {JOB_COLUMNS} FROM {source_jobs} s
             WHERE NOT EXISTS (SELECT 1 FROM {target_jobs} t WHERE t.job_id = s.job_id)
             ORDER BY s.job_id
             RETURNING job_id"
        ))
        .fetch_all(&mut *tx)
        .await
        .map_err(|e| map_dataset_error("copy_dataset", source, e))?;

        if !copied.is_empty() {
            sqlx::query(&format!(
                "INSERT INTO {target_status} ({STATUS_COLUMNS})
                 SELECT {STATUS_COLUMNS} FROM {source_status}
                 WHERE job_id = ANY($1)
                 ORDER BY status_id"
            ))
            .bind(&copied)
            .execute(&mut *tx)
            .await
            .map_err(|e| map_dataset_error("copy_dataset", source, e))?;
        }
        Self::commit(tx, "copy_dataset").await?;
        Ok(copied.len() as u64)
    }

    #[instrument(skip(self, sources), fields(target = %target, sources = sources.len()), err)]
    async fn replace_datasets(&self, prefix: &str, sources: &[DatasetIndex], target: &DatasetIndex) -> JobsDbResult<()> {
        let table = datasets_table(prefix);
        let mut tx = self.begin("replace_datasets").await?;

        let sealed = sqlx::query(&format!(
            "UPDATE {table} SET state = 'sealed', sealed_at = COALESCE(sealed_at, NOW()) WHERE idx = $1"
        ))
        .bind(target.to_string())
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("replace_datasets", e))?;
        if sealed.rows_affected() == 0 {
            return Err(JobsDbError::DatasetNotFound(target.clone()));
        }

        let names: Vec<String> = sources.iter().map(ToString::to_string).collect();
        let dropped = sqlx::query(&format!("UPDATE {table} SET state = 'dropped' WHERE idx = ANY($1)"))
            .bind(&names)
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("replace_datasets", e))?;
        if dropped.rows_affected() != sources.len() as u64 {
            let known: Vec<String> = sqlx::query_scalar(&format!("SELECT idx FROM {table} WHERE idx = ANY($1)"))
                .bind(&names)
                .fetch_all(&mut *tx)
                .await
                .map_err(|e| map_sqlx_error("replace_datasets", e))?;
            if let Some(missing) = sources.iter().find(|source| !known.contains(&source.to_string())) {
                return Err(JobsDbError::DatasetNotFound(missing.clone()));
            }
        }

        for source in sources {
            sqlx::query(&format!(
                "DROP TABLE IF EXISTS {}, {}",
                source.status_table(prefix),
                source.jobs_table(prefix)
            ))
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("replace_datasets", e))?;
        }
        Self::commit(tx, "replace_datasets").await
    }

    #[instrument(skip(self), err)]
    async fn drop_all(&self, prefix: &str) -> JobsDbResult<()> {
        let datasets = self.list_datasets(prefix).await?;
        let mut tx = self.begin("drop_all").await?;
        for dataset in datasets {
            sqlx::query(&format!(
                "DROP TABLE IF EXISTS {}, {}",
                dataset.status_table(prefix),
                dataset.jobs_table(prefix)
            ))
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("drop_all", e))?;
        }
        sqlx::query(&format!(
            "DROP TABLE IF EXISTS {}, {}, {}",
            datasets_table(prefix),
            journal_table(prefix),
            migrations_table(prefix)
        ))
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("drop_all", e))?;
        sqlx::query(&format!("DROP SEQUENCE IF EXISTS {}", job_sequence(prefix)))
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("drop_all", e))?;
        Self::commit(tx, "drop_all").await
    }

    async fn insert_jobs(
        &self,
        prefix: &str,
        index: &DatasetIndex,
        jobs: Vec<NewJob>,
        now: DateTime<Utc>,
    ) -> JobsDbResult<Vec<Job>> {
        if jobs.is_empty() {
            return Ok(Vec::new());
        }
        let mut tx = self.begin("insert_jobs").await?;
        let states = Self::share_datasets(&mut tx, prefix, std::slice::from_ref(index)).await?;
        match states.get(index) {
            None => return Err(JobsDbError::DatasetNotFound(index.clone())),
            Some(DatasetState::Active) => {}
            Some(_) => return Err(JobsDbError::DatasetSealed(index.clone())),
        }

        let ids: Vec<i64> = sqlx::query_scalar(&format!(
            "SELECT nextval('{}') FROM generate_series(1, $1)",
            job_sequence(prefix)
        ))
        .bind(jobs.len() as i64)
        .fetch_all(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("insert_jobs", e))?;
        if ids.len() != jobs.len() {
            return Err(JobsDbError::Internal("job id sequence returned too few ids".into()));
        }

        let inserted: Vec<Job> = jobs
            .into_iter()
            .zip(ids)
            .map(|(job, id)| job.into_job(JobId(id), now))
            .collect();

        let jobs_table = index.jobs_table(prefix);
        for chunk in inserted.chunks(INSERT_CHUNK) {
            let mut builder: QueryBuilder<Postgres> =
                QueryBuilder::new(format!("INSERT INTO {jobs_table} ({JOB_COLUMNS}) "));
            builder.push_values(chunk, |mut b, job| {
                b.push_bind(job.job_id.0)
                    .push_bind(job.uuid)
                    .push_bind(job.ordering_key.clone())
                    .push_bind(job.custom_val.clone())
                    .push_bind(job.workspace_id.clone())
                    .push_bind(job.event_count as i32)
                    .push_bind(job.payload.clone())
                    .push_bind(Json(job.parameters.clone()))
                    .push_bind(job.created_at)
                    .push_bind(job.expire_at);
            });
            builder
                .build()
                .execute(&mut *tx)
                .await
                .map_err(|e| map_dataset_error("insert_jobs", index, e))?;
        }

        let waiting = inserted.iter().map(|job| NewStatus::waiting(job.job_id, now)).collect();
        Self::insert_statuses(&mut tx, prefix, index, waiting).await?;
        Self::commit(tx, "insert_jobs").await?;
        Ok(inserted)
    }

    async fn claim_jobs(
        &self,
        prefix: &str,
        datasets: &[DatasetIndex],
        filter: &JobFilter,
        limit: usize,
        worker: &str,
        now: DateTime<Utc>,
    ) -> JobsDbResult<Vec<JobWithStatus>> {
        if limit == 0 || datasets.is_empty() {
            return Ok(Vec::new());
        }
        let mut tx = self.begin("claim_jobs").await?;
        let states = Self::share_datasets(&mut tx, prefix, datasets).await?;

        let mut claimed = Vec::new();
        for index in datasets {
            if claimed.len() >= limit {
                break;
            }
            if !states.get(index).is_some_and(DatasetState::is_readable) {
                continue;
            }
            let batch =
                Self::claim_in_dataset(&mut tx, prefix, index, filter, limit - claimed.len(), worker, now).await?;
            claimed.extend(batch);
        }
        Self::commit(tx, "claim_jobs").await?;
        Ok(claimed)
    }

    async fn append_statuses(
        &self,
        prefix: &str,
        updates: &[(DatasetIndex, StatusUpdate)],
        now: DateTime<Utc>,
    ) -> JobsDbResult<Vec<StatusEvent>> {
        if updates.is_empty() {
            return Ok(Vec::new());
        }
        let mut by_dataset: BTreeMap<DatasetIndex, Vec<i64>> = BTreeMap::new();
        for (index, update) in updates {
            by_dataset.entry(index.clone()).or_default().push(update.job_id.0);
        }
        let indices: Vec<DatasetIndex> = by_dataset.keys().cloned().collect();

        let mut tx = self.begin("append_statuses").await?;
        let states = Self::share_datasets(&mut tx, prefix, &indices).await?;

        let mut current: HashMap<JobId, (JobState, u32)> = HashMap::new();
        for (index, job_ids) in &mut by_dataset {
            if !states.get(index).is_some_and(DatasetState::has_tables) {
                return Err(JobsDbError::DatasetNotFound(index.clone()));
            }
            job_ids.sort_unstable();
            job_ids.dedup();
            // Serialize with claims and concurrent updates of the same jobs
            let jobs_table = index.jobs_table(prefix);
            sqlx::query(&format!(
                "SELECT job_id FROM {jobs_table} WHERE job_id = ANY($1) ORDER BY job_id FOR UPDATE"
            ))
            .bind(job_ids.clone())
            .execute(&mut *tx)
            .await
            .map_err(|e| map_dataset_error("append_statuses", index, e))?;

            let statuses = Self::current_statuses(&mut tx, prefix, index, job_ids).await?;
            current.extend(
                statuses
                    .into_iter()
                    .map(|(job_id, status)| (job_id, (status.state, status.attempt))),
            );
        }

        let mut rows: BTreeMap<DatasetIndex, Vec<(usize, NewStatus)>> = BTreeMap::new();
        let mut seen = HashSet::new();
        for (position, (index, update)) in updates.iter().enumerate() {
            let Some((from, attempt)) = current.get(&update.job_id).copied() else {
                return Err(JobsDbError::InvalidTransition {
                    job_id: update.job_id,
                    from: None,
                    to: update.state,
                });
            };
            if !from.can_transition_to(update.state) {
                return Err(JobsDbError::InvalidTransition {
                    job_id: update.job_id,
                    from: Some(from),
                    to: update.state,
                });
            }
            seen.insert(update.job_id);
            current.insert(update.job_id, (update.state, attempt));
            rows.entry(index.clone())
                .or_default()
                .push((position, NewStatus::from_update(update, attempt, now)));
        }

        let mut appended: Vec<(usize, StatusEvent)> = Vec::with_capacity(updates.len());
        for (index, staged) in rows {
            let (positions, statuses): (Vec<usize>, Vec<NewStatus>) = staged.into_iter().unzip();
            let events = Self::insert_statuses(&mut tx, prefix, &index, statuses).await?;
            appended.extend(positions.into_iter().zip(events));
        }
        Self::commit(tx, "append_statuses").await?;

        appended.sort_by_key(|(position, _)| *position);
        debug!(jobs = seen.len(), statuses = appended.len(), "appended statuses");
        Ok(appended.into_iter().map(|(_, event)| event).collect())
    }

    async fn query_jobs(
        &self,
        prefix: &str,
        index: &DatasetIndex,
        filter: &JobFilter,
        after: Option<JobId>,
        limit: usize,
    ) -> JobsDbResult<Vec<JobWithStatus>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let mut builder = latest_status_select(prefix, index);
        if let Some(after) = after {
            builder.push(" AND j.job_id > ").push_bind(after.0);
        }
        push_job_filter(&mut builder, filter);
        push_state_filter(&mut builder, filter);
        builder.push(" ORDER BY j.job_id LIMIT ").push_bind(limit as i64);

        let rows = builder
            .build()
            .fetch_all(&self.pool)
            .await
            .map_err(|e| map_dataset_error("query_jobs", index, e))?;
        rows.iter()
            .map(|row| {
                joined_from_row(row).map(|(job, status)| JobWithStatus {
                    dataset: index.clone(),
                    job,
                    status,
                })
            })
            .collect()
    }

    async fn job_history(&self, prefix: &str, index: &DatasetIndex, job_id: JobId) -> JobsDbResult<Vec<StatusEvent>> {
        let jobs = index.jobs_table(prefix);
        let status = index.status_table(prefix);
        let mut tx = self.begin("job_history").await?;
        let exists: Option<i64> = sqlx::query_scalar(&format!("SELECT job_id FROM {jobs} WHERE job_id = $1"))
            .bind(job_id.0)
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| map_dataset_error("job_history", index, e))?;
        if exists.is_none() {
            return Err(JobsDbError::JobNotFound(job_id));
        }
        let rows = sqlx::query(&format!(
            "SELECT status_id, {STATUS_COLUMNS} FROM {status} WHERE job_id = $1 ORDER BY status_id"
        ))
        .bind(job_id.0)
        .fetch_all(&mut *tx)
        .await
        .map_err(|e| map_dataset_error("job_history", index, e))?;
        Self::commit(tx, "job_history").await?;
        rows.iter().map(|row| status_from_row(row, "parameters")).collect()
    }

    async fn export_dataset(&self, prefix: &str, index: &DatasetIndex) -> JobsDbResult<Vec<ArchivedJob>> {
        let jobs_table = index.jobs_table(prefix);
        let status_table = index.status_table(prefix);
        let mut tx = self.begin("export_dataset").await?;
        let job_rows = sqlx::query(&format!("SELECT {JOB_COLUMNS} FROM {jobs_table} ORDER BY job_id"))
            .fetch_all(&mut *tx)
            .await
            .map_err(|e| map_dataset_error("export_dataset", index, e))?;
        let status_rows = sqlx::query(&format!(
            "SELECT status_id, {STATUS_COLUMNS} FROM {status_table} ORDER BY status_id"
        ))
        .fetch_all(&mut *tx)
        .await
        .map_err(|e| map_dataset_error("export_dataset", index, e))?;
        Self::commit(tx, "export_dataset").await?;

        let mut history: HashMap<JobId, Vec<StatusEvent>> = HashMap::new();
        for row in &status_rows {
            let event = status_from_row(row, "parameters")?;
            history.entry(event.job_id).or_default().push(event);
        }
        job_rows
            .iter()
            .map(|row| {
                let job = job_from_row(row)?;
                let history = history.remove(&job.job_id).unwrap_or_default();
                Ok(ArchivedJob { job, history })
            })
            .collect()
    }

    async fn state_counts(&self, prefix: &str, index: &DatasetIndex) -> JobsDbResult<StateCounts> {
        let status = index.status_table(prefix);
        let rows = sqlx::query(&format!(
            "SELECT state, COUNT(*) AS jobs FROM (
                SELECT DISTINCT ON (job_id) state FROM {status} ORDER BY job_id, status_id DESC
             ) latest GROUP BY state"
        ))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_dataset_error("state_counts", index, e))?;

        let mut counts = StateCounts::default();
        for row in &rows {
            let state: String = row.try_get("state").map_err(|e| map_sqlx_error("state_counts", e))?;
            let jobs: i64 = row.try_get("jobs").map_err(|e| map_sqlx_error("state_counts", e))?;
            counts.add(state.parse()?, jobs.max(0) as u64);
        }
        Ok(counts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_names_match_stored_text() {
        assert_eq!(
            state_names(&[JobState::Waiting, JobState::Failed]),
            vec!["waiting".to_string(), "failed".to_string()]
        );
    }
}
