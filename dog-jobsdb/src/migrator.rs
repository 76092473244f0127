//! Versioned schema migrations per table prefix.
//!
//! A [`MigrationSet`] is an ordered list of steps, each rendering its SQL
//! from a [`MigrationContext`] (the table prefix and the datasets that exist
//! when the migration runs), plus the template used to create the tables of
//! every new dataset. The [`Migrator`] applies the steps above the recorded
//! version, one backend transaction per step.

use std::sync::Arc;

use tracing::{info, instrument, warn};

use crate::{backend::StorageBackend, types::DatasetIndex, JobsDbError, JobsDbResult};

/// Input of a migration template
#[derive(Debug, Clone, PartialEq)]
pub struct MigrationContext {
    pub prefix: String,
    /// Datasets whose tables exist, in index order
    pub datasets: Vec<DatasetIndex>,
}

pub type RenderFn = fn(&MigrationContext) -> Vec<String>;
pub type DatasetTablesFn = fn(&str, &DatasetIndex) -> Vec<String>;

#[derive(Clone)]
pub struct MigrationStep {
    pub version: i64,
    pub description: String,
    pub render: RenderFn,
}

impl std::fmt::Debug for MigrationStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MigrationStep")
            .field("version", &self.version)
            .field("description", &self.description)
            .finish()
    }
}

#[derive(Clone, Debug)]
pub struct MigrationSet {
    name: String,
    steps: Vec<MigrationStep>,
    dataset_tables: DatasetTablesFn,
}

impl MigrationSet {
    pub fn new(name: impl Into<String>, dataset_tables: DatasetTablesFn) -> Self {
        Self {
            name: name.into(),
            steps: Vec::new(),
            dataset_tables,
        }
    }

    pub fn step(mut self, version: i64, description: impl Into<String>, render: RenderFn) -> Self {
        self.steps.push(MigrationStep {
            version,
            description: description.into(),
            render,
        });
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn steps(&self) -> &[MigrationStep] {
        &self.steps
    }

    pub fn latest_version(&self) -> Option<i64> {
        self.steps.last().map(|step| step.version)
    }

    /// Versions must be strictly increasing
    pub fn validate(&self) -> JobsDbResult<()> {
        for pair in self.steps.windows(2) {
            if pair[1].version <= pair[0].version {
                return Err(JobsDbError::MigrationFailure(format!(
                    "migration set {}: version {} follows {}",
                    self.name, pair[1].version, pair[0].version
                )));
            }
        }
        Ok(())
    }

    /// Statements creating the tables of a new dataset at the latest schema
    pub fn dataset_ddl(&self, prefix: &str, index: &DatasetIndex) -> Vec<String> {
        (self.dataset_tables)(prefix, index)
    }

    /// The Postgres schema of a jobsdb table prefix
    pub fn jobsdb() -> Self {
        Self::new("jobsdb", jobsdb_dataset_tables)
            .step(1, "catalog, journal and job id sequence", |ctx| {
                let p = &ctx.prefix;
                vec![
                    format!(
                        "CREATE TABLE IF NOT EXISTS {p}_datasets (
                            idx TEXT PRIMARY KEY,
                            components INTEGER[] NOT NULL,
                            state TEXT NOT NULL,
                            created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                            sealed_at TIMESTAMPTZ,
                            schema_version BIGINT NOT NULL,
                            archive_handle JSONB
                        )"
                    ),
                    format!(
                        "CREATE TABLE IF NOT EXISTS {p}_journal (
                            id BIGSERIAL PRIMARY KEY,
                            operation JSONB NOT NULL,
                            started_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
                        )"
                    ),
                    format!("CREATE SEQUENCE IF NOT EXISTS {p}_job_id_seq"),
                ]
            })
            .step(2, "status lookup index", |ctx| {
                ctx.datasets
                    .iter()
                    .map(|index| status_lookup_index(&ctx.prefix, index))
                    .collect()
            })
            .step(3, "claim scope index", |ctx| {
                ctx.datasets
                    .iter()
                    .map(|index| claim_scope_index(&ctx.prefix, index))
                    .collect()
            })
    }
}

fn jobsdb_dataset_tables(prefix: &str, index: &DatasetIndex) -> Vec<String> {
    let jobs = index.jobs_table(prefix);
    let status = index.status_table(prefix);
    vec![
        format!(
            "CREATE TABLE IF NOT EXISTS {jobs} (
                job_id BIGINT PRIMARY KEY,
                uuid UUID NOT NULL,
                ordering_key TEXT NOT NULL,
                custom_val TEXT NOT NULL,
                workspace_id TEXT NOT NULL DEFAULT '',
                event_count INTEGER NOT NULL DEFAULT 1,
                payload BYTEA NOT NULL,
                parameters JSONB NOT NULL,
                created_at TIMESTAMPTZ NOT NULL,
                expire_at TIMESTAMPTZ
            )"
        ),
        format!(
            "CREATE TABLE IF NOT EXISTS {status} (
                status_id BIGSERIAL PRIMARY KEY,
                job_id BIGINT NOT NULL REFERENCES {jobs}(job_id),
                state TEXT NOT NULL,
                attempt INTEGER NOT NULL,
                exec_time TIMESTAMPTZ NOT NULL,
                retry_time TIMESTAMPTZ NOT NULL,
                error_code TEXT,
                error_response JSONB,
                worker TEXT,
                parameters JSONB NOT NULL DEFAULT '{{}}'
            )"
        ),
        status_lookup_index(prefix, index),
        claim_scope_index(prefix, index),
    ]
}

fn status_lookup_index(prefix: &str, index: &DatasetIndex) -> String {
    let status = index.status_table(prefix);
    format!("CREATE INDEX IF NOT EXISTS {status}_job_idx ON {status} (job_id, status_id DESC)")
}

fn claim_scope_index(prefix: &str, index: &DatasetIndex) -> String {
    let jobs = index.jobs_table(prefix);
    format!("CREATE INDEX IF NOT EXISTS {jobs}_scope_idx ON {jobs} (custom_val, job_id)")
}

/// Outcome of a migration run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationReport {
    pub from: Option<i64>,
    pub to: Option<i64>,
    pub applied: Vec<i64>,
    /// The recorded version was ahead of the set and has been lowered
    pub forced_down: bool,
}

#[derive(Clone)]
pub struct Migrator {
    backend: Arc<dyn StorageBackend>,
    force_set_lower_version: bool,
}

impl Migrator {
    pub fn new(backend: Arc<dyn StorageBackend>, force_set_lower_version: bool) -> Self {
        Self {
            backend,
            force_set_lower_version,
        }
    }

    /// Bring `prefix` to the latest version of `set`
    #[instrument(skip(self, set, ctx), fields(set = %set.name()), err)]
    pub async fn migrate(
        &self,
        prefix: &str,
        set: &MigrationSet,
        ctx: &MigrationContext,
    ) -> JobsDbResult<MigrationReport> {
        set.validate()?;
        let from = self
            .backend
            .schema_version(prefix)
            .await
            .map_err(as_migration_failure)?;
        let latest = set.latest_version();
        let mut report = MigrationReport {
            from,
            to: from,
            applied: Vec::new(),
            forced_down: false,
        };

        if let (Some(recorded), Some(latest)) = (from, latest) {
            if recorded > latest {
                if !self.force_set_lower_version {
                    return Err(JobsDbError::MigrationFailure(format!(
                        "{prefix}: recorded schema version {recorded} is newer than {} version {latest}",
                        set.name()
                    )));
                }
                warn!(
                    prefix,
                    recorded, latest, "schema version ahead of migrations, forcing it lower"
                );
                self.backend
                    .force_schema_version(prefix, latest)
                    .await
                    .map_err(as_migration_failure)?;
                report.to = Some(latest);
                report.forced_down = true;
                return Ok(report);
            }
        }

        for step in set.steps() {
            if from.is_some_and(|recorded| step.version <= recorded) {
                continue;
            }
            let statements = (step.render)(ctx);
            info!(
                prefix,
                version = step.version,
                description = %step.description,
                statements = statements.len(),
                "applying migration"
            );
            self.backend
                .apply_migration(prefix, step.version, &statements)
                .await
                .map_err(|e| {
                    JobsDbError::MigrationFailure(format!(
                        "{prefix}: version {} ({}) failed: {e}",
                        step.version, step.description
                    ))
                })?;
            report.applied.push(step.version);
            report.to = Some(step.version);
        }

        Ok(report)
    }

    /// Record `version` for `prefix` without running anything, so the next
    /// [`migrate`](Self::migrate) re-applies every step above it. Only
    /// versions the set knows (or 0) are accepted.
    #[instrument(skip(self, set), fields(set = %set.name()), err)]
    pub async fn force_version(&self, prefix: &str, set: &MigrationSet, version: i64) -> JobsDbResult<()> {
        set.validate()?;
        let latest = set.latest_version().unwrap_or(0);
        if !(0..=latest).contains(&version) {
            return Err(JobsDbError::Config(format!(
                "cannot force {prefix} to schema version {version}, {} knows 0..={latest}",
                set.name()
            )));
        }
        let recorded = self
            .backend
            .schema_version(prefix)
            .await
            .map_err(as_migration_failure)?;
        warn!(prefix, ?recorded, version, "forcing schema version");
        self.backend
            .force_schema_version(prefix, version)
            .await
            .map_err(as_migration_failure)
    }
}

fn as_migration_failure(err: JobsDbError) -> JobsDbError {
    match err {
        JobsDbError::MigrationFailure(_) => err,
        other => JobsDbError::MigrationFailure(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;

    fn ctx(prefix: &str, datasets: &[&str]) -> MigrationContext {
        MigrationContext {
            prefix: prefix.to_string(),
            datasets: datasets.iter().map(|d| d.parse().unwrap()).collect(),
        }
    }

    #[tokio::test]
    async fn applies_each_step_once() {
        let backend = MemoryBackend::new();
        let migrator = Migrator::new(Arc::new(backend.clone()), false);
        let set = MigrationSet::jobsdb();

        let report = migrator.migrate("gw", &set, &ctx("gw", &["1", "2"])).await.unwrap();
        assert_eq!(report.from, None);
        assert_eq!(report.applied, vec![1, 2, 3]);
        let applied = backend.applied_migrations("gw");
        assert_eq!(applied[1].statements.len(), 2);
        assert!(applied[1].statements[1].contains("gw_job_status_2"));

        let writes = backend.schema_writes();
        let again = migrator.migrate("gw", &set, &ctx("gw", &["1", "2"])).await.unwrap();
        assert!(again.applied.is_empty());
        assert_eq!(backend.schema_writes(), writes);
    }

    #[tokio::test]
    async fn newer_recorded_version() {
        let backend = MemoryBackend::new();
        backend.force_schema_version("rt", 9).await.unwrap();
        let set = MigrationSet::jobsdb();

        let strict = Migrator::new(Arc::new(backend.clone()), false);
        let err = strict.migrate("rt", &set, &ctx("rt", &[])).await.unwrap_err();
        assert!(err.is_fatal());

        let forcing = Migrator::new(Arc::new(backend.clone()), true);
        let report = forcing.migrate("rt", &set, &ctx("rt", &[])).await.unwrap();
        assert!(report.forced_down);
        assert_eq!(backend.schema_version("rt").await.unwrap(), Some(3));
        assert!(backend.applied_migrations("rt").is_empty());
    }

    #[tokio::test]
    async fn forced_version_reapplies_later_steps() {
        let backend = MemoryBackend::new();
        let migrator = Migrator::new(Arc::new(backend.clone()), false);
        let set = MigrationSet::jobsdb();
        migrator.migrate("gw", &set, &ctx("gw", &["1"])).await.unwrap();

        migrator.force_version("gw", &set, 1).await.unwrap();
        assert_eq!(backend.schema_version("gw").await.unwrap(), Some(1));
        let report = migrator.migrate("gw", &set, &ctx("gw", &["1"])).await.unwrap();
        assert_eq!(report.from, Some(1));
        assert_eq!(report.applied, vec![2, 3]);

        assert!(matches!(
            migrator.force_version("gw", &set, 4).await,
            Err(JobsDbError::Config(_))
        ));
        assert!(migrator.force_version("gw", &set, -1).await.is_err());
        assert_eq!(backend.schema_version("gw").await.unwrap(), Some(3));
    }

    #[test]
    fn versions_must_increase() {
        let set = MigrationSet::new("broken", |_, _| Vec::new())
            .step(2, "b", |_| Vec::new())
            .step(2, "c", |_| Vec::new());
        assert!(set.validate().is_err());
        let ddl = MigrationSet::jobsdb().dataset_ddl("gw", &"3_1".parse().unwrap());
        assert!(ddl[0].contains("gw_jobs_3_1"));
    }
}
