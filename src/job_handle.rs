use aide_de_camp::core::{job_handle::JobHandle, queue::QueueError, Bytes, Xid};
use async_trait::async_trait;
use chrono::Utc;
use tracing::instrument;

use crate::{schedule::Schedule, store::Store, types::JobRecord};

/// A job taken off a schedule by a worker.
///
/// The job is already unlisted; its record stays in the store until the handle resolves it.
pub struct ScheduleJobHandle<S> {
    schedule: Schedule<S>,
    row: JobRecord,
}

impl<S: Store> ScheduleJobHandle<S> {
    pub(crate) fn new(schedule: Schedule<S>, row: JobRecord) -> Self {
        Self { schedule, row }
    }

    pub fn record(&self) -> &JobRecord {
        &self.row
    }
}

#[async_trait]
impl<S> JobHandle for ScheduleJobHandle<S>
where
    S: Store + Clone + 'static,
{
    fn id(&self) -> Xid {
        self.row.jid
    }

    fn job_type(&self) -> &str {
        &self.row.job_type
    }

    fn payload(&self) -> Bytes {
        self.row.payload.clone()
    }

    fn retries(&self) -> u32 {
        self.row.retries
    }

    #[instrument(skip_all, err, fields(jid = %self.row.jid))]
    async fn complete(self) -> Result<(), QueueError> {
        let jid = self.id().to_string();
        JobRecord::delete(self.schedule.store(), self.schedule.config(), &jid).await?;
        Ok(())
    }

    /// Relist the work as a fresh job due now. The failed record is removed.
    #[instrument(skip_all, err, fields(jid = %self.row.jid))]
    async fn fail(self) -> Result<(), QueueError> {
        let mut retry = JobRecord::new(Utc::now(), self.row.payload.clone(), self.row.timeout)
            .with_job_type(self.row.job_type.clone())
            .with_priority(self.row.priority);
        retry.retries = self.row.retries;

        self.schedule.enqueue(retry).await?;
        let jid = self.id().to_string();
        JobRecord::delete(self.schedule.store(), self.schedule.config(), &jid).await?;

        Ok(())
    }

    #[instrument(skip_all, err, fields(jid = %self.row.jid))]
    async fn dead_queue(self) -> Result<(), QueueError> {
        self.schedule.dead_letter(&self.row).await?;
        Ok(())
    }
}
