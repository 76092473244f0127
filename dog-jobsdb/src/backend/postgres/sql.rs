//! Row mapping, filter rendering and error translation for the Postgres backend.
//!
//! Table names are interpolated, never bound: prefixes are validated as
//! lowercase identifiers by the config and dataset indices render as digits
//! and underscores, so every name built here is a plain SQL identifier.

use sqlx::postgres::PgRow;
use sqlx::types::Json;
use sqlx::{Postgres, QueryBuilder, Row};

use crate::{
    types::{
        ArchiveHandle, DatasetIndex, Job, JobFilter, JobId, JobState, JournalEntry, JournalEntryId,
        JournalOperation, StatusEvent,
    },
    JobsDbError, JobsDbResult,
};

/// Job columns in insert order
pub(super) const JOB_COLUMNS: &str =
    "job_id, uuid, ordering_key, custom_val, workspace_id, event_count, payload, parameters, created_at, expire_at";

/// Status columns in insert order, without the serial id
pub(super) const STATUS_COLUMNS: &str =
    "job_id, state, attempt, exec_time, retry_time, error_code, error_response, worker, parameters";

/// Job columns plus the latest status, as selected by [`latest_status_select`]
const JOINED_COLUMNS: &str = "j.job_id, j.uuid, j.ordering_key, j.custom_val, j.workspace_id, j.event_count, \
     j.payload, j.parameters, j.created_at, j.expire_at, \
     s.status_id, s.state, s.attempt, s.exec_time, s.retry_time, s.error_code, \
     s.error_response, s.worker, s.parameters AS status_parameters";

pub(super) fn datasets_table(prefix: &str) -> String {
    format!("{prefix}_datasets")
}

pub(super) fn journal_table(prefix: &str) -> String {
    format!("{prefix}_journal")
}

pub(super) fn migrations_table(prefix: &str) -> String {
    format!("{prefix}_schema_migrations")
}

pub(super) fn job_sequence(prefix: &str) -> String {
    format!("{prefix}_job_id_seq")
}

/// `SELECT <job + latest status> FROM jobs j JOIN LATERAL (...)` without a WHERE clause
pub(super) fn latest_status_select<'a>(prefix: &str, index: &DatasetIndex) -> QueryBuilder<'a, Postgres> {
    let jobs = index.jobs_table(prefix);
    let status = index.status_table(prefix);
    QueryBuilder::new(format!(
        "SELECT {JOINED_COLUMNS} FROM {jobs} j \
         JOIN LATERAL (SELECT * FROM {status} st WHERE st.job_id = j.job_id ORDER BY st.status_id DESC LIMIT 1) s ON TRUE \
         WHERE TRUE"
    ))
}

/// Append ` AND ...` conditions for the immutable job attributes of `filter`
pub(super) fn push_job_filter(builder: &mut QueryBuilder<'_, Postgres>, filter: &JobFilter) {
    if !filter.ordering_keys.is_empty() {
        builder
            .push(" AND j.ordering_key = ANY(")
            .push_bind(filter.ordering_keys.clone())
            .push(")");
    }
    if !filter.custom_vals.is_empty() {
        builder
            .push(" AND j.custom_val = ANY(")
            .push_bind(filter.custom_vals.clone())
            .push(")");
    }
    if let Some(workspace_id) = &filter.workspace_id {
        builder
            .push(" AND j.workspace_id = ")
            .push_bind(workspace_id.clone());
    }
    for parameter in &filter.parameters {
        builder
            .push(" AND j.parameters ->> ")
            .push_bind(parameter.name.clone())
            .push(" = ")
            .push_bind(parameter.value.clone());
    }
}

/// Append ` AND s.state = ANY(...)` when `filter` names states
pub(super) fn push_state_filter(builder: &mut QueryBuilder<'_, Postgres>, filter: &JobFilter) {
    if !filter.states.is_empty() {
        builder
            .push(" AND s.state = ANY(")
            .push_bind(state_names(&filter.states))
            .push(")");
    }
}

pub(super) fn state_names(states: &[JobState]) -> Vec<String> {
    states.iter().map(|state| state.as_str().to_string()).collect()
}

fn decode<T>(row: &PgRow, column: &str) -> JobsDbResult<T>
where
    T: for<'r> sqlx::Decode<'r, Postgres> + sqlx::Type<Postgres>,
{
    row.try_get(column)
        .map_err(|e| JobsDbError::Serialization(format!("column {column}: {e}")))
}

fn non_negative(value: i32, column: &str) -> JobsDbResult<u32> {
    u32::try_from(value).map_err(|_| JobsDbError::Serialization(format!("column {column}: negative value {value}")))
}

pub(super) fn job_from_row(row: &PgRow) -> JobsDbResult<Job> {
    let parameters: Json<serde_json::Value> = decode(row, "parameters")?;
    Ok(Job {
        job_id: JobId(decode(row, "job_id")?),
        uuid: decode(row, "uuid")?,
        ordering_key: decode(row, "ordering_key")?,
        custom_val: decode(row, "custom_val")?,
        workspace_id: decode(row, "workspace_id")?,
        event_count: non_negative(decode(row, "event_count")?, "event_count")?,
        payload: decode(row, "payload")?,
        parameters: parameters.0,
        created_at: decode(row, "created_at")?,
        expire_at: decode(row, "expire_at")?,
    })
}

/// Decode a status row. `parameters_column` differs when joined with the job.
pub(super) fn status_from_row(row: &PgRow, parameters_column: &str) -> JobsDbResult<StatusEvent> {
    let state: String = decode(row, "state")?;
    let error_response: Option<Json<serde_json::Value>> = decode(row, "error_response")?;
    let parameters: Json<serde_json::Value> = decode(row, parameters_column)?;
    Ok(StatusEvent {
        status_id: decode(row, "status_id")?,
        job_id: JobId(decode(row, "job_id")?),
        state: state.parse()?,
        attempt: non_negative(decode(row, "attempt")?, "attempt")?,
        exec_time: decode(row, "exec_time")?,
        retry_time: decode(row, "retry_time")?,
        error_code: decode(row, "error_code")?,
        error_response: error_response.map(|json| json.0),
        worker: decode(row, "worker")?,
        parameters: parameters.0,
    })
}

/// Decode a row selected with [`latest_status_select`]
pub(super) fn joined_from_row(row: &PgRow) -> JobsDbResult<(Job, StatusEvent)> {
    Ok((job_from_row(row)?, status_from_row(row, "status_parameters")?))
}

pub(super) fn journal_from_row(row: &PgRow) -> JobsDbResult<JournalEntry> {
    let operation: Json<JournalOperation> = decode(row, "operation")?;
    Ok(JournalEntry {
        id: JournalEntryId(decode(row, "id")?),
        operation: operation.0,
        started_at: decode(row, "started_at")?,
    })
}

pub(super) fn archive_handle_from_row(row: &PgRow) -> JobsDbResult<Option<ArchiveHandle>> {
    let handle: Option<Json<ArchiveHandle>> = decode(row, "archive_handle")?;
    Ok(handle.map(|json| json.0))
}

/// Postgres error code of a database error
fn sqlstate(err: &sqlx::Error) -> Option<String> {
    match err {
        sqlx::Error::Database(db_err) => db_err.code().map(|code| code.into_owned()),
        _ => None,
    }
}

pub(super) fn is_undefined_table(err: &sqlx::Error) -> bool {
    sqlstate(err).as_deref() == Some("42P01")
}

pub(super) fn is_unique_violation(err: &sqlx::Error) -> bool {
    sqlstate(err).as_deref() == Some("23505")
}

/// Translate a sqlx error raised by `operation`.
///
/// Connection-level faults, serialization failures and deadlocks become
/// [`JobsDbError::Write`] so callers retry them; anything else is internal.
pub(super) fn map_sqlx_error(operation: &str, err: sqlx::Error) -> JobsDbError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {operation}: {}", db_err.message());
            match db_err.code().as_deref() {
                // serialization_failure, deadlock_detected, lock_not_available
                Some("40001") | Some("40P01") | Some("55P03") => JobsDbError::Write(msg),
                // connection exceptions, admin shutdown, too many connections
                Some(code) if code.starts_with("08") || code.starts_with("57") || code == "53300" => {
                    JobsDbError::Write(msg)
                }
                _ => JobsDbError::Internal(msg),
            }
        }
        sqlx::Error::PoolTimedOut => JobsDbError::write(format!("connection pool timed out in {operation}")),
        sqlx::Error::PoolClosed => JobsDbError::write(format!("connection pool closed in {operation}")),
        sqlx::Error::Io(e) => JobsDbError::write(format!("io error in {operation}: {e}")),
        sqlx::Error::Tls(e) => JobsDbError::write(format!("tls error in {operation}: {e}")),
        sqlx::Error::ColumnDecode { index, source } => {
            JobsDbError::Serialization(format!("column {index} in {operation}: {source}"))
        }
        sqlx::Error::Decode(e) => JobsDbError::Serialization(format!("decode error in {operation}: {e}")),
        other => JobsDbError::Internal(format!("sqlx error in {operation}: {other}")),
    }
}

/// Like [`map_sqlx_error`], reporting a missing table as a missing dataset
pub(super) fn map_dataset_error(operation: &str, index: &DatasetIndex, err: sqlx::Error) -> JobsDbError {
    if is_undefined_table(&err) {
        JobsDbError::DatasetNotFound(index.clone())
    } else {
        map_sqlx_error(operation, err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lateral_select_names_dataset_tables() {
        let index: DatasetIndex = "3_1".parse().unwrap();
        let mut builder = latest_status_select("gw", &index);
        push_job_filter(&mut builder, &JobFilter::new().custom_vals(["WEBHOOK"]).parameter("source_id", "s1"));
        push_state_filter(&mut builder, &JobFilter::new().states([JobState::Waiting]));
        let sql = builder.sql();
        assert!(sql.contains("FROM gw_jobs_3_1 j"));
        assert!(sql.contains("FROM gw_job_status_3_1 st"));
        assert!(sql.contains("j.custom_val = ANY($1)"));
        assert!(sql.contains("j.parameters ->> $2 = $3"));
        assert!(sql.contains("s.state = ANY($4)"));
    }

    #[test]
    fn pool_faults_are_retryable() {
        assert!(map_sqlx_error("claim", sqlx::Error::PoolTimedOut).is_retryable());
        assert!(!map_sqlx_error("claim", sqlx::Error::RowNotFound).is_retryable());
    }
}
