//! In-memory dump store for tests and embedded use. Nothing survives a restart.

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use tracing::debug;

use sw_common::DumpedRecord;

use crate::{DumpError, DumpRequest, Dumper, RecordFilter, Result};

#[derive(Default)]
struct Inner {
    next_id: i64,
    records: BTreeMap<i64, DumpedRecord>,
}

#[derive(Default)]
pub struct MemoryDumpStore {
    inner: Mutex<Inner>,
}

impl MemoryDumpStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of every stored record, oldest first
    pub fn records(&self) -> Vec<DumpedRecord> {
        self.inner.lock().records.values().cloned().collect()
    }
}

#[async_trait]
impl Dumper for MemoryDumpStore {
    async fn output(&self, request: DumpRequest) -> Result<i64> {
        let mut inner = self.inner.lock();
        inner.next_id += 1;
        let id = inner.next_id;

        inner.records.insert(
            id,
            DumpedRecord {
                id,
                queue: request.queue,
                payload: request.payload,
                job_type: request.job_type,
                persistent: request.persistent,
                dumped_at: Utc::now(),
                attempts: 0,
                last_error: None,
            },
        );
        debug!(id, "Record dumped to memory store");
        Ok(id)
    }

    async fn fetch(&self, filter: &RecordFilter) -> Result<Vec<DumpedRecord>> {
        let inner = self.inner.lock();
        let limit = filter.limit.map(|l| l as usize).unwrap_or(usize::MAX);
        Ok(inner
            .records
            .values()
            .filter(|r| filter.matches(r))
            .take(limit)
            .cloned()
            .collect())
    }

    async fn remove(&self, id: i64) -> Result<()> {
        match self.inner.lock().records.remove(&id) {
            Some(_) => Ok(()),
            None => Err(DumpError::NotFound(id)),
        }
    }

    async fn record_failure(&self, id: i64, error: &str) -> Result<()> {
        let mut inner = self.inner.lock();
        let record = inner.records.get_mut(&id).ok_or(DumpError::NotFound(id))?;
        record.attempts += 1;
        record.last_error = Some(error.to_string());
        Ok(())
    }

    async fn count(&self, filter: &RecordFilter) -> Result<u64> {
        let inner = self.inner.lock();
        Ok(inner.records.values().filter(|r| filter.matches(r)).count() as u64)
    }
}
