pub mod ids;
pub mod dataset;
pub mod status;
pub mod job;
pub mod filter;
pub mod cursor;
pub mod events;
pub mod journal;

pub use ids::{JobId, JournalEntryId, LockOwner};
pub use dataset::{ArchiveHandle, Dataset, DatasetIndex, DatasetState};
pub use status::{JobState, NewStatus, StatusEvent, StatusUpdate};
pub use job::{ArchivedJob, Job, JobWithStatus, JobsDbStats, NewJob, StateCounts};
pub use filter::{ClaimRequest, JobFilter, ParameterFilter, QueryFilter};
pub use cursor::{QueryCursor, QueryPage};
pub use events::JobsDbEvent;
pub use journal::{JournalEntry, JournalOperation};
