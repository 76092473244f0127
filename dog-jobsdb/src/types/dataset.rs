use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::JobId;
use crate::error::JobsDbError;

/// Position of a dataset in the global read order.
///
/// An index is a dotted sequence of components (`1`, `2`, `2_1`) compared
/// component-wise, so a shorter index sorts before any of its extensions.
/// Rotation always appends a new top-level index after the last one; inserting
/// between two neighbours (compaction) extends the lower one instead of
/// renumbering anything. Components are rendered with `_` so the index can be
/// embedded in table names.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct DatasetIndex(Vec<u32>);

impl DatasetIndex {
    /// Index of the very first dataset of a table prefix
    pub fn first() -> Self {
        Self(vec![1])
    }

    pub fn new(components: Vec<u32>) -> Result<Self, JobsDbError> {
        if components.is_empty() {
            return Err(JobsDbError::InvalidIndex("empty index".to_string()));
        }
        Ok(Self(components))
    }

    pub fn components(&self) -> &[u32] {
        &self.0
    }

    /// The next top-level index, strictly greater than `self` and all its extensions
    pub fn next(&self) -> Self {
        Self(vec![self.0[0].saturating_add(1)])
    }

    /// An index strictly between `lo` and `hi`, or strictly below `hi` when `lo` is `None`.
    ///
    /// Returns `None` when no such index exists (`hi` is `lo` followed by a single `0`)
    /// or when `lo >= hi`.
    pub fn between(lo: Option<&DatasetIndex>, hi: &DatasetIndex) -> Option<DatasetIndex> {
        let Some(lo) = lo else {
            let mut below = hi.0.clone();
            let last = below.len() - 1;
            if below[last] == 0 {
                return None;
            }
            below[last] -= 1;
            below.push(1);
            return Some(Self(below));
        };

        if lo >= hi {
            return None;
        }

        // lo ++ [0; k] ++ [1] is always greater than lo; take the first one below hi.
        for zeros in 0..=hi.0.len() {
            let mut candidate = lo.0.clone();
            candidate.extend(std::iter::repeat(0).take(zeros));
            candidate.push(1);
            if candidate < hi.0 {
                return Some(Self(candidate));
            }
        }

        // hi = lo ++ [0; n] ++ [1, ..]: fall back to lo ++ [0; n] when it is still below hi.
        for zeros in 1..hi.0.len() {
            let mut candidate = lo.0.clone();
            candidate.extend(std::iter::repeat(0).take(zeros));
            if candidate > lo.0 && candidate < hi.0 {
                return Some(Self(candidate));
            }
        }
        None
    }

    /// Name of the jobs table of this dataset
    pub fn jobs_table(&self, prefix: &str) -> String {
        format!("{prefix}_jobs_{self}")
    }

    /// Name of the status table of this dataset
    pub fn status_table(&self, prefix: &str) -> String {
        format!("{prefix}_job_status_{self}")
    }
}

impl fmt::Display for DatasetIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (position, component) in self.0.iter().enumerate() {
            if position > 0 {
                f.write_str("_")?;
            }
            write!(f, "{component}")?;
        }
        Ok(())
    }
}

impl FromStr for DatasetIndex {
    type Err = JobsDbError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let components = s
            .split(['_', '.'])
            .map(|part| {
                part.parse::<u32>()
                    .map_err(|_| JobsDbError::InvalidIndex(s.to_string()))
            })
            .collect::<Result<Vec<_>, _>>()?;
        Self::new(components)
    }
}

impl TryFrom<String> for DatasetIndex {
    type Error = JobsDbError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<DatasetIndex> for String {
    fn from(index: DatasetIndex) -> Self {
        index.to_string()
    }
}

/// Lifecycle of a dataset
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DatasetState {
    /// Receives new jobs
    Active,
    /// Read-only; superseded by a newer dataset
    Sealed,
    /// Being filled by a structural operation; invisible to readers
    Migrating,
    /// Exported to an archive sink; tables still present
    Archived,
    /// Tables removed; the index is never reused
    Dropped,
}

impl DatasetState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Sealed => "sealed",
            Self::Migrating => "migrating",
            Self::Archived => "archived",
            Self::Dropped => "dropped",
        }
    }

    /// Whether readers (claim/query) see the dataset's jobs
    pub fn is_readable(&self) -> bool {
        matches!(self, Self::Active | Self::Sealed | Self::Archived)
    }

    /// Whether the dataset's tables exist
    pub fn has_tables(&self) -> bool {
        !matches!(self, Self::Dropped)
    }
}

impl fmt::Display for DatasetState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DatasetState {
    type Err = JobsDbError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(Self::Active),
            "sealed" => Ok(Self::Sealed),
            "migrating" => Ok(Self::Migrating),
            "archived" => Ok(Self::Archived),
            "dropped" => Ok(Self::Dropped),
            other => Err(JobsDbError::Serialization(format!(
                "unknown dataset state: {other}"
            ))),
        }
    }
}

/// Receipt of a durable archive write
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchiveHandle {
    /// Sink-relative key, deterministic per table prefix and dataset
    pub key: String,
    /// Where the sink put the data (path, URL, ...)
    pub location: String,
    pub job_count: u64,
    pub status_count: u64,
    pub written_at: DateTime<Utc>,
}

/// Catalog entry for one dataset
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Dataset {
    pub index: DatasetIndex,
    pub state: DatasetState,
    pub created_at: DateTime<Utc>,
    pub sealed_at: Option<DateTime<Utc>>,
    /// Schema version the tables are at; migrations advance every live dataset
    pub schema_version: i64,
    pub archive_handle: Option<ArchiveHandle>,
    /// Number of jobs in the dataset at the time the catalog was read
    pub row_count: u64,
    pub min_job_id: Option<JobId>,
    pub max_job_id: Option<JobId>,
}

impl Dataset {
    pub fn new(index: DatasetIndex, state: DatasetState, schema_version: i64) -> Self {
        Self {
            index,
            state,
            created_at: Utc::now(),
            sealed_at: None,
            schema_version,
            archive_handle: None,
            row_count: 0,
            min_job_id: None,
            max_job_id: None,
        }
    }

    pub fn jobs_table(&self, prefix: &str) -> String {
        self.index.jobs_table(prefix)
    }

    pub fn status_table(&self, prefix: &str) -> String {
        self.index.status_table(prefix)
    }

    pub fn is_writable(&self) -> bool {
        self.state == DatasetState::Active
    }

    /// Whether `job_id` falls inside the id range observed for this dataset
    pub fn may_contain(&self, job_id: JobId) -> bool {
        match (self.min_job_id, self.max_job_id) {
            (Some(min), Some(max)) => min <= job_id && job_id <= max,
            _ => false,
        }
    }

    /// Age of the dataset relative to `now`
    pub fn age(&self, now: DateTime<Utc>) -> chrono::Duration {
        now - self.created_at
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn idx(s: &str) -> DatasetIndex {
        s.parse().unwrap()
    }

    #[test]
    fn ordering_and_rendering() {
        assert!(idx("1") < idx("1_1"));
        assert!(idx("1_1") < idx("2"));
        assert!(idx("2") < idx("10"));
        assert_eq!(idx("2.1"), idx("2_1"));
        assert_eq!(idx("3_0_1").to_string(), "3_0_1");
        assert_eq!(idx("7").jobs_table("gw"), "gw_jobs_7");
        assert_eq!(idx("7_1").status_table("rt"), "rt_job_status_7_1");
        assert!("".parse::<DatasetIndex>().is_err());
        assert!("1_x".parse::<DatasetIndex>().is_err());
    }

    #[test]
    fn next_skips_extensions() {
        assert_eq!(idx("1").next(), idx("2"));
        assert_eq!(idx("4_2_1").next(), idx("5"));
        assert!(idx("4_2_1").next() > idx("4_2_1"));
    }

    #[test]
    fn between_neighbours() {
        assert_eq!(DatasetIndex::between(Some(&idx("1")), &idx("2")), Some(idx("1_1")));
        assert_eq!(DatasetIndex::between(Some(&idx("1")), &idx("1_1")), Some(idx("1_0_1")));
        assert_eq!(DatasetIndex::between(None, &idx("1")), Some(idx("0_1")));
        assert_eq!(DatasetIndex::between(Some(&idx("2")), &idx("1")), None);
        assert_eq!(DatasetIndex::between(Some(&idx("1")), &idx("1_0")), None);
    }

    #[test]
    fn serde_as_string() {
        let json = serde_json::to_string(&idx("2_1")).unwrap();
        assert_eq!(json, "\"2_1\"");
        let back: DatasetIndex = serde_json::from_str(&json).unwrap();
        assert_eq!(back, idx("2_1"));
    }

    fn arb_index() -> impl Strategy<Value = DatasetIndex> {
        prop::collection::vec(0u32..4, 1..5).prop_map(|c| DatasetIndex::new(c).unwrap())
    }

    proptest! {
        #[test]
        fn between_is_strictly_inside(a in arb_index(), b in arb_index()) {
            let (lo, hi) = if a < b { (a, b) } else { (b, a) };
            if let Some(mid) = DatasetIndex::between(Some(&lo), &hi) {
                prop_assert!(lo < mid);
                prop_assert!(mid < hi);
            }
        }

        #[test]
        fn below_is_strictly_lower(hi in arb_index()) {
            if let Some(below) = DatasetIndex::between(None, &hi) {
                prop_assert!(below < hi);
            }
        }

        #[test]
        fn display_round_trips(index in arb_index()) {
            let parsed: DatasetIndex = index.to_string().parse().unwrap();
            prop_assert_eq!(parsed, index);
        }
    }
}
