//! Recovery replay of dumped records.
//!
//! Delivery is at-least-once: a record is removed only after the broker
//! confirmed the republish, so a crash between publish and removal replays
//! the same body again on the next pass.

use std::sync::Arc;

use tracing::{debug, error, info, warn};

use sw_common::{codes, DumpedRecord, ErrorRequest, Job, JobType, LastError, Severity};

use crate::{Dumper, RecordFilter, RecoverHook, Republisher, Result};

/// Outcome of one [`Replayer::recover`] pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Records fetched for replay
    pub scanned: usize,
    /// Republished and removed
    pub replayed: usize,
    /// Republish or decode failed; kept with the attempt recorded
    pub failed: usize,
    /// At or past `max_attempts`; kept in the store and not fetched
    pub exhausted: usize,
}

pub struct Replayer {
    dumper: Arc<dyn Dumper>,
    republisher: Arc<dyn Republisher>,
    hook: Option<Arc<dyn RecoverHook>>,
    max_attempts: Option<u32>,
    last_error: Arc<LastError>,
}

impl Replayer {
    pub fn new(dumper: Arc<dyn Dumper>, republisher: Arc<dyn Republisher>) -> Self {
        Self {
            dumper,
            republisher,
            hook: None,
            max_attempts: None,
            last_error: Arc::new(LastError::default()),
        }
    }

    pub fn with_hook(mut self, hook: Arc<dyn RecoverHook>) -> Self {
        self.hook = Some(hook);
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: Option<u32>) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_last_error(mut self, last_error: Arc<LastError>) -> Self {
        self.last_error = last_error;
        self
    }

    pub fn last_error(&self) -> &LastError {
        &self.last_error
    }

    /// Replay every record matching `filter`, oldest first.
    ///
    /// Records at `max_attempts` are left out of the fetch itself, so they
    /// never take batch slots from newer records. Only a failure to read the
    /// store aborts the pass. Per-record failures are recorded on the record
    /// and counted in the report.
    pub async fn recover(&self, filter: &RecordFilter) -> Result<RecoveryReport> {
        let mut eligible = filter.clone();
        if let Some(max) = self.max_attempts {
            eligible.max_attempts = Some(eligible.max_attempts.map_or(max, |m| m.min(max)));
        }

        let records = self.dumper.fetch(&eligible).await?;
        let mut report = RecoveryReport {
            scanned: records.len(),
            exhausted: self.count_exhausted(filter, &eligible).await,
            ..Default::default()
        };

        if report.exhausted > 0 {
            error!(
                exhausted = report.exhausted,
                max_attempts = ?eligible.max_attempts,
                "Dumped records exhausted their recovery attempts, leaving them in the store"
            );
        }

        if !records.is_empty() {
            self.republisher.prepare().await;
        }

        for record in &records {
            if self.replay(record).await {
                report.replayed += 1;
            } else {
                report.failed += 1;
            }
        }

        if report.scanned > 0 {
            info!(
                scanned = report.scanned,
                replayed = report.replayed,
                failed = report.failed,
                exhausted = report.exhausted,
                "Recovery pass finished"
            );
        }
        Ok(report)
    }

    async fn count_exhausted(&self, filter: &RecordFilter, eligible: &RecordFilter) -> usize {
        if eligible.max_attempts.is_none() {
            return 0;
        }
        let mut all = filter.clone();
        all.max_attempts = None;
        match (self.dumper.count(&all).await, self.dumper.count(eligible).await) {
            (Ok(total), Ok(open)) => total.saturating_sub(open) as usize,
            (Err(e), _) | (_, Err(e)) => {
                warn!(error = %e, "Failed to count exhausted dumped records");
                0
            }
        }
    }

    async fn replay(&self, record: &DumpedRecord) -> bool {
        let job = match Job::decode(&record.payload) {
            Ok(job) => Some(job),
            Err(e) if record.job_type == JobType::FunctionCall => {
                self.last_error.set_last_error(
                    ErrorRequest::new(codes::SERIALIZATION)
                        .message("dumped function call could not be decoded")
                        .level(Severity::Warning)
                        .cause(e),
                );
                self.note_failure(record, "undecodable function call body").await;
                return false;
            }
            // Message bodies are opaque and republished as stored
            Err(_) => None,
        };

        if let Err(e) = self.republisher.republish(record).await {
            warn!(id = record.id, queue = %record.queue, error = %e, "Republish failed");
            self.last_error.set_last_error(
                ErrorRequest::new(codes::RECOVER)
                    .message(format!("recovering record {} failed", record.id))
                    .developer_message(e.to_string())
                    .level(Severity::Error),
            );
            self.note_failure(record, &e.to_string()).await;
            return false;
        }

        if let Some(hook) = &self.hook {
            hook.after_recover(record, job.as_ref()).await;
        }

        if let Err(e) = self.dumper.remove(record.id).await {
            // Republished but still stored: the next pass delivers it again.
            error!(id = record.id, error = %e, "Failed to remove recovered record");
            self.last_error.set_last_error(
                ErrorRequest::new(codes::DUMP)
                    .message("recovered record could not be removed")
                    .level(Severity::Critical)
                    .cause(e),
            );
            return false;
        }

        debug!(id = record.id, queue = %record.queue, "Dumped record recovered");
        true
    }

    async fn note_failure(&self, record: &DumpedRecord, reason: &str) {
        if let Err(e) = self.dumper.record_failure(record.id, reason).await {
            error!(id = record.id, error = %e, "Failed to record recovery attempt");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{DumpRequest, MemoryDumpStore};
    use async_trait::async_trait;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct RecordingPublisher {
        published: Mutex<Vec<(String, Vec<u8>)>>,
        fail: bool,
    }

    #[async_trait]
    impl Republisher for RecordingPublisher {
        async fn republish(&self, record: &DumpedRecord) -> anyhow::Result<()> {
            if self.fail {
                anyhow::bail!("broker unreachable");
            }
            self.published
                .lock()
                .push((record.queue.clone(), record.payload.clone()));
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_undecodable_function_call_is_kept() {
        let store = Arc::new(MemoryDumpStore::new());
        store
            .output(DumpRequest::new("q", "not a job", JobType::FunctionCall))
            .await
            .unwrap();
        let publisher = Arc::new(RecordingPublisher::default());
        let replayer = Replayer::new(store.clone(), publisher.clone());

        let report = replayer.recover(&RecordFilter::all()).await.unwrap();
        assert_eq!(report.failed, 1);
        assert!(publisher.published.lock().is_empty());
        assert_eq!(store.records()[0].attempts, 1);
        assert_eq!(
            replayer.last_error().last_error().map(|e| e.code),
            Some(codes::SERIALIZATION)
        );
    }

    #[tokio::test]
    async fn test_exhausted_records_are_skipped_not_dropped() {
        let store = Arc::new(MemoryDumpStore::new());
        let id = store
            .output(DumpRequest::new("q", "abc", JobType::Message))
            .await
            .unwrap();
        store.record_failure(id, "down").await.unwrap();
        store.record_failure(id, "down").await.unwrap();

        let publisher = Arc::new(RecordingPublisher::default());
        let replayer =
            Replayer::new(store.clone(), publisher.clone()).with_max_attempts(Some(2));

        let report = replayer.recover(&RecordFilter::all()).await.unwrap();
        assert_eq!(report.exhausted, 1);
        assert_eq!(report.replayed, 0);
        assert_eq!(store.len(), 1);
        assert!(publisher.published.lock().is_empty());
    }

    #[tokio::test]
    async fn test_exhausted_records_do_not_starve_newer_ones() {
        let store = Arc::new(MemoryDumpStore::new());
        let old = store
            .output(DumpRequest::new("q", "old", JobType::Message))
            .await
            .unwrap();
        store
            .output(DumpRequest::new("q", "fresh", JobType::Message))
            .await
            .unwrap();
        store.record_failure(old, "down").await.unwrap();

        let publisher = Arc::new(RecordingPublisher::default());
        let replayer =
            Replayer::new(store.clone(), publisher.clone()).with_max_attempts(Some(1));

        let report = replayer.recover(&RecordFilter::all().limit(1)).await.unwrap();
        assert_eq!(report.scanned, 1);
        assert_eq!(report.replayed, 1);
        assert_eq!(report.exhausted, 1);
        assert_eq!(
            *publisher.published.lock(),
            vec![("q".to_string(), b"fresh".to_vec())]
        );

        let remaining: Vec<_> = store.records().into_iter().map(|r| r.payload).collect();
        assert_eq!(remaining, vec![b"old".to_vec()]);
    }
}
