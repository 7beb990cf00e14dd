//! Spillway dump store
//!
//! Messages the publishing client cannot hand to the broker are appended to a
//! [`Dumper`]. The [`Replayer`] later reads them back, republishes them and
//! removes each record only after a confirmed publish.

use async_trait::async_trait;
use sw_common::{DumpedRecord, Job, JobType};

pub mod error;
pub mod memory;
pub mod recovery;
pub mod replayer;

#[cfg(feature = "sqlite")]
pub mod sqlite;

pub use error::DumpError;
pub use memory::MemoryDumpStore;
pub use recovery::{RecoveryConfig, RecoveryTask};
pub use replayer::{RecoveryReport, Replayer};

#[cfg(feature = "sqlite")]
pub use sqlite::SqliteDumpStore;

pub type Result<T> = std::result::Result<T, DumpError>;

/// A message to append to the store.
#[derive(Debug, Clone, PartialEq)]
pub struct DumpRequest {
    pub queue: String,
    pub payload: Vec<u8>,
    pub job_type: JobType,
    /// Delivery mode to restore on replay
    pub persistent: bool,
}

impl DumpRequest {
    pub fn new(queue: impl Into<String>, payload: impl Into<Vec<u8>>, job_type: JobType) -> Self {
        Self {
            queue: queue.into(),
            payload: payload.into(),
            job_type,
            persistent: true,
        }
    }

    pub fn with_persistent(mut self, persistent: bool) -> Self {
        self.persistent = persistent;
        self
    }
}

/// Selects records for [`Dumper::fetch`] and [`Dumper::count`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecordFilter {
    pub job_type: Option<JobType>,
    pub queue: Option<String>,
    /// Only records with fewer failed attempts than this
    pub max_attempts: Option<u32>,
    /// Maximum records returned by `fetch`; ignored by `count`
    pub limit: Option<u32>,
}

impl RecordFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn job_type(mut self, job_type: JobType) -> Self {
        self.job_type = Some(job_type);
        self
    }

    pub fn queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = Some(queue.into());
        self
    }

    pub fn max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    pub fn limit(mut self, limit: u32) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn matches(&self, record: &DumpedRecord) -> bool {
        self.job_type.map_or(true, |t| t == record.job_type)
            && self.queue.as_deref().map_or(true, |q| q == record.queue)
            && self.max_attempts.map_or(true, |max| record.attempts < max)
    }
}

/// Append-only store of undeliverable messages.
#[async_trait]
pub trait Dumper: Send + Sync {
    /// Append one record atomically and return its id
    async fn output(&self, request: DumpRequest) -> Result<i64>;

    /// Records matching `filter`, oldest first
    async fn fetch(&self, filter: &RecordFilter) -> Result<Vec<DumpedRecord>>;

    /// Remove a record after it was republished
    async fn remove(&self, id: i64) -> Result<()>;

    /// Bump the attempt counter and keep the failure reason
    async fn record_failure(&self, id: i64, error: &str) -> Result<()>;

    async fn count(&self, filter: &RecordFilter) -> Result<u64>;
}

/// Publishes a recovered body straight to the broker, never back into a dump.
#[async_trait]
pub trait Republisher: Send + Sync {
    /// Called once before a pass that has records to replay.
    async fn prepare(&self) {}

    /// Publish `record.payload` to `record.queue` with its stored delivery mode.
    async fn republish(&self, record: &DumpedRecord) -> anyhow::Result<()>;
}

/// Called after a record was republished and before it is removed.
#[async_trait]
pub trait RecoverHook: Send + Sync {
    /// `job` is set when the stored body decodes as a job envelope.
    async fn after_recover(&self, record: &DumpedRecord, job: Option<&Job>);
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn record(queue: &str, job_type: JobType) -> DumpedRecord {
        DumpedRecord {
            id: 1,
            queue: queue.to_string(),
            payload: b"abc".to_vec(),
            job_type,
            persistent: true,
            dumped_at: Utc::now(),
            attempts: 0,
            last_error: None,
        }
    }

    #[test]
    fn test_filter_matching() {
        let msg = record("q1", JobType::Message);
        let call = record("q2", JobType::FunctionCall);

        assert!(RecordFilter::all().matches(&msg));
        assert!(RecordFilter::all().job_type(JobType::Message).matches(&msg));
        assert!(!RecordFilter::all().job_type(JobType::Message).matches(&call));
        assert!(RecordFilter::all().queue("q2").matches(&call));
        assert!(!RecordFilter::all().queue("q2").job_type(JobType::Message).matches(&call));
    }

    #[test]
    fn test_filter_attempt_cap() {
        let mut tried = record("q1", JobType::Message);
        tried.attempts = 3;

        assert!(RecordFilter::all().max_attempts(4).matches(&tried));
        assert!(!RecordFilter::all().max_attempts(3).matches(&tried));
        assert!(!RecordFilter::all().max_attempts(0).matches(&record("q1", JobType::Message)));
    }
}
