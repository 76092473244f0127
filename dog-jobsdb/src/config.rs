//! Runtime configuration for a jobsdb instance.
//!
//! Values are plain fields with defaults suited to a single-node pipeline.
//! Deployments override them either through the builder methods or through
//! environment variables using the `PREFIX__KEY` convention:
//!
//! ```bash
//! export JOBSDB__MAX_DS_ROWS=500000
//! export JOBSDB__MAX_DS_AGE=30m
//! export JOBSDB__FORCE_SET_LOWER_VERSION=true
//! ```
//!
//! Durations accept `ms`, `s`, `m` and `h` suffixes; a bare number is seconds.

use std::time::Duration;

use crate::error::{JobsDbError, JobsDbResult};

#[derive(Debug, Clone, PartialEq)]
pub struct JobsDbConfig {
    /// Prefix of every table, the lock scope and archive keys (`gw`, `rt`, `batch_rt`)
    pub table_prefix: String,
    /// Rotate once the writable dataset holds this many jobs
    pub max_ds_rows: u64,
    /// Rotate once the writable dataset is this old
    pub max_ds_age: Duration,
    /// Maximum age of the local catalog snapshot before a read refreshes it
    pub refresh_interval: Duration,
    /// How long structural operations wait for the lock, and enqueues for a writable dataset
    pub lock_timeout: Duration,
    /// Lease of lock rows on backends without advisory locks
    pub lock_lease: Duration,
    /// Lower a recorded schema version that is ahead of the migration set instead of
    /// failing. Off by default.
    pub force_set_lower_version: bool,
    /// How long a sealed dataset stays live before it may be archived
    pub archive_retention: Duration,
    pub compaction_enabled: bool,
    /// Upper bound on the combined size of datasets merged by one compaction
    pub compaction_max_rows: u64,
    pub maintenance_interval: Duration,
    /// Random extra delay added to each maintenance sleep
    pub maintenance_jitter: Duration,
    /// Page size used by `query` streams
    pub query_page_size: usize,
    /// Fail jobs left `Executing` by a previous process during setup
    pub reset_executing_on_startup: bool,
    /// Retries of an enqueue whose dataset was sealed or dropped under it
    pub enqueue_retries: u32,
}

impl Default for JobsDbConfig {
    fn default() -> Self {
        Self {
            table_prefix: "jobs".to_string(),
            max_ds_rows: 100_000,
            max_ds_age: Duration::from_secs(3600),
            refresh_interval: Duration::from_secs(5),
            lock_timeout: Duration::from_secs(30),
            lock_lease: Duration::from_secs(30),
            force_set_lower_version: false,
            archive_retention: Duration::from_secs(24 * 3600),
            compaction_enabled: false,
            compaction_max_rows: 50_000,
            maintenance_interval: Duration::from_secs(15),
            maintenance_jitter: Duration::from_secs(2),
            query_page_size: 500,
            reset_executing_on_startup: false,
            enqueue_retries: 3,
        }
    }
}

impl JobsDbConfig {
    pub fn new(table_prefix: impl Into<String>) -> Self {
        Self {
            table_prefix: table_prefix.into(),
            ..Self::default()
        }
    }

    /// Defaults overridden by `{prefix}__{KEY}` environment variables
    pub fn from_env(prefix: &str) -> JobsDbResult<Self> {
        Self::from_vars(prefix, std::env::vars())
    }

    /// Same as [`from_env`](Self::from_env) over an explicit variable list
    pub fn from_vars<I, K, V>(prefix: &str, vars: I) -> JobsDbResult<Self>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let mut config = Self::default();
        let marker = format!("{}__", prefix.to_uppercase());
        for (key, value) in vars {
            let Some(field) = key.as_ref().strip_prefix(&marker) else {
                continue;
            };
            config.set(&field.to_lowercase(), value.as_ref())?;
        }
        config.validate()?;
        Ok(config)
    }

    fn set(&mut self, field: &str, value: &str) -> JobsDbResult<()> {
        match field {
            "table_prefix" => self.table_prefix = value.to_string(),
            "max_ds_rows" => self.max_ds_rows = parse_number(field, value)?,
            "max_ds_age" => self.max_ds_age = parse_duration(field, value)?,
            "refresh_interval" => self.refresh_interval = parse_duration(field, value)?,
            "lock_timeout" => self.lock_timeout = parse_duration(field, value)?,
            "lock_lease" => self.lock_lease = parse_duration(field, value)?,
            "force_set_lower_version" => self.force_set_lower_version = parse_bool(field, value)?,
            "archive_retention" => self.archive_retention = parse_duration(field, value)?,
            "compaction_enabled" => self.compaction_enabled = parse_bool(field, value)?,
            "compaction_max_rows" => self.compaction_max_rows = parse_number(field, value)?,
            "maintenance_interval" => self.maintenance_interval = parse_duration(field, value)?,
            "maintenance_jitter" => self.maintenance_jitter = parse_duration(field, value)?,
            "query_page_size" => self.query_page_size = parse_number(field, value)?,
            "reset_executing_on_startup" => {
                self.reset_executing_on_startup = parse_bool(field, value)?
            }
            "enqueue_retries" => self.enqueue_retries = parse_number(field, value)?,
            other => {
                tracing::debug!(key = other, "ignoring unknown jobsdb setting");
            }
        }
        Ok(())
    }

    /// Reject settings the engine cannot run with
    pub fn validate(&self) -> JobsDbResult<()> {
        let prefix_ok = !self.table_prefix.is_empty()
            && self
                .table_prefix
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
            && self
                .table_prefix
                .chars()
                .next()
                .is_some_and(|c| c.is_ascii_lowercase());
        if !prefix_ok {
            return Err(JobsDbError::Config(format!(
                "table_prefix must be a lowercase identifier, got {:?}",
                self.table_prefix
            )));
        }
        if self.max_ds_rows == 0 {
            return Err(JobsDbError::Config("max_ds_rows must be positive".into()));
        }
        if self.query_page_size == 0 {
            return Err(JobsDbError::Config("query_page_size must be positive".into()));
        }
        if self.lock_lease.is_zero() {
            return Err(JobsDbError::Config("lock_lease must be positive".into()));
        }
        Ok(())
    }

    /// Name of the structural lock of this prefix
    pub fn lock_scope(&self) -> String {
        format!("{}_jobsdb", self.table_prefix)
    }

    pub fn with_max_ds_rows(mut self, rows: u64) -> Self {
        self.max_ds_rows = rows;
        self
    }

    pub fn with_max_ds_age(mut self, age: Duration) -> Self {
        self.max_ds_age = age;
        self
    }

    pub fn with_refresh_interval(mut self, interval: Duration) -> Self {
        self.refresh_interval = interval;
        self
    }

    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    pub fn with_lock_lease(mut self, lease: Duration) -> Self {
        self.lock_lease = lease;
        self
    }

    pub fn with_force_set_lower_version(mut self, force: bool) -> Self {
        self.force_set_lower_version = force;
        self
    }

    pub fn with_archive_retention(mut self, retention: Duration) -> Self {
        self.archive_retention = retention;
        self
    }

    pub fn with_compaction(mut self, max_rows: u64) -> Self {
        self.compaction_enabled = true;
        self.compaction_max_rows = max_rows;
        self
    }

    pub fn with_maintenance_interval(mut self, interval: Duration, jitter: Duration) -> Self {
        self.maintenance_interval = interval;
        self.maintenance_jitter = jitter;
        self
    }

    pub fn with_query_page_size(mut self, size: usize) -> Self {
        self.query_page_size = size;
        self
    }

    pub fn with_reset_executing_on_startup(mut self, reset: bool) -> Self {
        self.reset_executing_on_startup = reset;
        self
    }

    pub fn with_enqueue_retries(mut self, retries: u32) -> Self {
        self.enqueue_retries = retries;
        self
    }
}

fn parse_number<T: std::str::FromStr>(field: &str, value: &str) -> JobsDbResult<T> {
    value
        .trim()
        .parse()
        .map_err(|_| JobsDbError::Config(format!("{field}: expected a number, got {value:?}")))
}

fn parse_bool(field: &str, value: &str) -> JobsDbResult<bool> {
    match value.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(JobsDbError::Config(format!(
            "{field}: expected a boolean, got {value:?}"
        ))),
    }
}

pub(crate) fn parse_duration(field: &str, value: &str) -> JobsDbResult<Duration> {
    let value = value.trim();
    let (digits, unit) = match value.find(|c: char| !c.is_ascii_digit()) {
        Some(pos) => value.split_at(pos),
        None => (value, "s"),
    };
    let amount: u64 = digits
        .parse()
        .map_err(|_| JobsDbError::Config(format!("{field}: invalid duration {value:?}")))?;
    match unit {
        "ms" => Ok(Duration::from_millis(amount)),
        "s" => Ok(Duration::from_secs(amount)),
        "m" => Ok(Duration::from_secs(amount * 60)),
        "h" => Ok(Duration::from_secs(amount * 3600)),
        _ => Err(JobsDbError::Config(format!(
            "{field}: unknown duration unit in {value:?}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_overrides() {
        let vars = [
            ("JOBSDB__TABLE_PREFIX", "gw"),
            ("JOBSDB__MAX_DS_ROWS", "500"),
            ("JOBSDB__MAX_DS_AGE", "30m"),
            ("JOBSDB__LOCK_TIMEOUT", "250ms"),
            ("JOBSDB__COMPACTION_ENABLED", "yes"),
            ("OTHER__MAX_DS_ROWS", "7"),
        ];
        let config = JobsDbConfig::from_vars("jobsdb", vars).unwrap();
        assert_eq!(config.table_prefix, "gw");
        assert_eq!(config.max_ds_rows, 500);
        assert_eq!(config.max_ds_age, Duration::from_secs(1800));
        assert_eq!(config.lock_timeout, Duration::from_millis(250));
        assert!(config.compaction_enabled);
        assert_eq!(config.lock_scope(), "gw_jobsdb");
        assert!(!config.force_set_lower_version);
    }

    #[test]
    fn lowering_schema_version_is_opt_in() {
        assert!(!JobsDbConfig::default().force_set_lower_version);
        assert!(!JobsDbConfig::new("gw").force_set_lower_version);

        let vars = [("JOBSDB__FORCE_SET_LOWER_VERSION", "true")];
        assert!(JobsDbConfig::from_vars("jobsdb", vars).unwrap().force_set_lower_version);
    }

    #[test]
    fn rejects_bad_values() {
        assert!(JobsDbConfig::from_vars("jobsdb", [("JOBSDB__MAX_DS_ROWS", "many")]).is_err());
        assert!(JobsDbConfig::from_vars("jobsdb", [("JOBSDB__MAX_DS_AGE", "3d")]).is_err());
        assert!(JobsDbConfig::from_vars("jobsdb", [("JOBSDB__TABLE_PREFIX", "Gw;drop")]).is_err());
        assert!(JobsDbConfig::new("rt").with_max_ds_rows(0).validate().is_err());
    }
}
