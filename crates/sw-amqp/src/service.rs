//! Job Service
//!
//! Caller-facing publish API. Results are flattened to `bool`; the reason for
//! a `false` is in [`JobService::last_error`].
//!
//! The last-error slot belongs to the client, not to a call: concurrent
//! publishes and `dispatch` tasks overwrite each other's entry. A confirmed
//! publish clears it.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use sw_common::{codes, Delivery, DumpedRecord, Error, ErrorRequest, Job, Severity};
use sw_dump::RecoverHook;

use crate::client::AmqpClient;

pub struct JobService {
    client: Arc<AmqpClient>,
    recovered: AtomicU64,
}

impl JobService {
    pub fn new(client: Arc<AmqpClient>) -> Self {
        Self {
            client,
            recovered: AtomicU64::new(0),
        }
    }

    pub fn client(&self) -> &Arc<AmqpClient> {
        &self.client
    }

    /// True only when the broker confirmed the job. A dumped job is `false`
    /// but safe for recovery.
    pub async fn publish(&self, job: &Job) -> bool {
        match self.client.publish(job).await {
            Ok(Delivery::Delivered) => {
                self.client.last_error().clear_last_error();
                true
            }
            Ok(Delivery::Dumped) => {
                self.client.last_error().set_last_error(
                    ErrorRequest::new(codes::AMQP_PUBLISH)
                        .message(format!("job {} dumped for later recovery", job.id))
                        .level(Severity::Warning),
                );
                false
            }
            Err(e) => {
                // The client already recorded the cause in the shared slot.
                debug!(job_id = %job.id, error = %e, "Job not published");
                false
            }
        }
    }

    /// Queue a call of `function` with `args` for a consumer on `queue`.
    pub async fn call_async(
        &self,
        function: &str,
        args: Vec<serde_json::Value>,
        queue: &str,
    ) -> bool {
        self.publish(&Job::function_call(queue, function, args)).await
    }

    /// Fire-and-forget publish on a background task.
    pub fn dispatch(self: &Arc<Self>, job: Job) -> JoinHandle<bool> {
        let service = Arc::clone(self);
        tokio::spawn(async move { service.publish(&job).await })
    }

    pub fn last_error(&self) -> Option<Arc<Error>> {
        self.client.last_error().last_error()
    }

    pub fn clear_last_error(&self) {
        self.client.last_error().clear_last_error();
    }

    /// Records replayed through this service's hook
    pub fn recovered_count(&self) -> u64 {
        self.recovered.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl RecoverHook for JobService {
    async fn after_recover(&self, record: &DumpedRecord, job: Option<&Job>) {
        self.recovered.fetch_add(1, Ordering::Relaxed);
        match job {
            Some(job) => info!(
                record_id = record.id,
                job_id = %job.id,
                queue = %record.queue,
                job_type = %record.job_type,
                "Dumped job recovered"
            ),
            None => debug!(record_id = record.id, queue = %record.queue, "Dumped body recovered"),
        }
    }
}
