use aide_de_camp::core::{
    job_processor::JobProcessor,
    queue::{Queue, QueueError},
    DateTime, Xid,
};
use async_trait::async_trait;
use bincode::{Decode, Encode};
use tracing::{instrument, warn};

use crate::{job_handle::ScheduleJobHandle, schedule::Schedule, store::Store, types::JobRecord};

/// Jobs are handed out in ETA order. `priority` is recorded on the job but does not reorder it.
#[async_trait]
impl<S> Queue for Schedule<S>
where
    S: Store + Clone + 'static,
{
    type JobHandle = ScheduleJobHandle<S>;

    #[instrument(skip_all, err, ret, fields(job_type = J::name(), payload_size))]
    async fn schedule_at<J>(
        &self,
        payload: J::Payload,
        scheduled_at: DateTime,
        priority: i8,
    ) -> Result<Xid, QueueError>
    where
        J: JobProcessor + 'static,
        J::Payload: Encode,
    {
        let job = JobRecord::encode_payload(scheduled_at, &payload, None)?
            .with_job_type(J::name())
            .with_priority(priority);

        tracing::Span::current().record("payload_size", job.payload.len());

        let job = self.enqueue(job).await?;
        Ok(job.jid)
    }

    #[instrument(skip_all, err)]
    async fn poll_next_with_instant(
        &self,
        job_types: &[&str],
        now: DateTime,
    ) -> Result<Option<Self::JobHandle>, QueueError> {
        let Some(mut job) = self.take_next(job_types, now).await? else {
            return Ok(None);
        };

        // The job is already unlisted, so it goes out even if the attempt can't be recorded.
        job.retries += 1;
        if let Err(err) = job.save(self.store(), self.config()).await {
            warn!(jid = %job.jid, error = %err, "failed to record attempt");
        }

        Ok(Some(ScheduleJobHandle::new(self.clone(), job)))
    }

    #[instrument(skip_all, err)]
    async fn cancel_job(&self, job_id: Xid) -> Result<(), QueueError> {
        let jid = job_id.to_string();

        if self.remove(&jid).await? {
            JobRecord::delete(self.store(), self.config(), &jid).await?;
            Ok(())
        } else {
            Err(QueueError::JobNotFound(job_id))
        }
    }

    #[instrument(skip_all, err)]
    async fn unschedule_job<J>(&self, job_id: Xid) -> Result<J::Payload, QueueError>
    where
        J: JobProcessor + 'static,
        J::Payload: Decode,
    {
        let jid = job_id.to_string();
        let job = JobRecord::fetch(self.store(), self.config(), &jid)
            .await
            .map_err(|err| err.in_schedule(self.name()))?;

        if job.job_type != J::name() {
            return Err(QueueError::JobNotFound(job_id));
        }

        let decoded = job.decode_payload::<J::Payload>()?;
        if !self.remove(&jid).await? {
            return Err(QueueError::JobNotFound(job_id));
        }
        JobRecord::delete(self.store(), self.config(), &jid).await?;

        Ok(decoded)
    }
}
