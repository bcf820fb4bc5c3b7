//! An ETA-ordered schedule of job ids kept in a store-resident list.
//!
//! The list is shared by every process talking to the store, so all mutations are optimistic:
//! watch the list key, compute the new contents, commit, and start over if someone else wrote
//! the key in the meantime. Job records live under their own keys and may be deleted at any time
//! by whoever consumed them. Ids whose record is gone ("orphans") are tolerated anywhere in the
//! list and dropped lazily by enqueue, dequeue and [`Schedule::compact`].

use std::sync::Arc;

use aide_de_camp::core::DateTime;
use tracing::{debug, instrument, warn};

use crate::{
    config::ScheduleConfig,
    error::{ScheduleError, StoreError},
    store::{keys, Store, Transaction},
    types::JobRecord,
};

#[derive(Clone)]
pub struct Schedule<S> {
    name: String,
    store: S,
    config: Arc<ScheduleConfig>,
}

/// A listed id together with its ETA, `None` when the record exists but can't be decoded.
type Entry = (String, Option<DateTime>);

impl<S: Store> Schedule<S> {
    pub fn new(name: impl Into<String>, store: S) -> Self {
        Self::with_config(name, store, ScheduleConfig::default())
    }

    pub fn with_config(name: impl Into<String>, store: S, config: ScheduleConfig) -> Self {
        Self {
            name: name.into(),
            store,
            config: Arc::new(config),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn config(&self) -> &ScheduleConfig {
        &self.config
    }

    fn list_key(&self) -> String {
        keys::schedule(&self.config, &self.name)
    }

    /// Save `job` and list it at the position its ETA implies.
    ///
    /// Jobs with equal ETAs keep insertion order. Orphans met while resolving the current list
    /// are dropped from the rewritten list.
    #[instrument(skip_all, err, fields(schedule = %self.name, jid = %job.jid))]
    pub async fn enqueue(&self, mut job: JobRecord) -> Result<JobRecord, ScheduleError> {
        job.stamp(&self.name);
        job.save(&self.store, &self.config).await?;

        let jid = job.jid.to_string();
        let key = self.list_key();
        let mut attempts = 0;

        loop {
            attempts += 1;
            let mut txn = self.store.watch(&key).await?;
            let listed = txn.list_read().await?;

            let mut entries = self.resolve(listed).await?;
            entries.retain(|(id, _)| id != &jid);
            let at = insertion_point(&entries, job.eta);
            entries.insert(at, (jid.clone(), Some(job.eta)));

            txn.list_replace(entries.into_iter().map(|(id, _)| id).collect());
            if committed(txn).await? {
                debug!(attempts, position = at, "job listed");
                return Ok(job);
            }
            self.check_attempts(attempts)?;
        }
    }

    /// Pop the earliest job, whether or not its ETA has arrived.
    ///
    /// Orphans at the front are skipped. A record that exists but doesn't decode is removed from
    /// the list and reported as [`ScheduleError::Decode`].
    #[instrument(skip_all, err, fields(schedule = %self.name))]
    pub async fn dequeue(&self) -> Result<Option<JobRecord>, ScheduleError> {
        let key = self.list_key();

        loop {
            let Some(jid) = self.store.list_pop_front(&key).await? else {
                return Ok(None);
            };

            match JobRecord::fetch(&self.store, &self.config, &jid).await {
                Ok(job) => {
                    self.compact_after_pop().await;
                    return Ok(Some(job));
                }
                Err(ScheduleError::NotFound(_)) => {
                    debug!(%jid, "skipping orphaned job id");
                }
                Err(err) => return Err(err.in_schedule(&self.name)),
            }
        }
    }

    /// Pop the earliest job only if its ETA is at or before `now`.
    pub async fn dequeue_due(&self, now: DateTime) -> Result<Option<JobRecord>, ScheduleError> {
        self.take_first(now, |_| true).await
    }

    /// Remove the earliest due job whose type is one of `job_types`.
    ///
    /// Earlier jobs of other types keep their place.
    pub async fn take_next(
        &self,
        job_types: &[&str],
        now: DateTime,
    ) -> Result<Option<JobRecord>, ScheduleError> {
        self.take_first(now, |job| job_types.contains(&job.job_type.as_str()))
            .await
    }

    /// The job `dequeue` would return, without removing it.
    #[instrument(skip_all, err, fields(schedule = %self.name))]
    pub async fn peek(&self) -> Result<Option<JobRecord>, ScheduleError> {
        for jid in self.store.list_read(&self.list_key()).await? {
            match JobRecord::fetch(&self.store, &self.config, &jid).await {
                Ok(job) => return Ok(Some(job)),
                Err(ScheduleError::NotFound(_)) => continue,
                Err(err) => return Err(err.in_schedule(&self.name)),
            }
        }
        Ok(None)
    }

    /// Drop orphaned ids, keeping the order of everything else. Returns how many were dropped.
    ///
    /// Best effort: when the commit loses a race the pass is abandoned and reports zero.
    #[instrument(skip_all, err, fields(schedule = %self.name))]
    pub async fn compact(&self) -> Result<usize, ScheduleError> {
        let mut txn = self.store.watch(&self.list_key()).await?;
        let listed = txn.list_read().await?;

        let mut kept = Vec::with_capacity(listed.len());
        for jid in &listed {
            if JobRecord::exists(&self.store, &self.config, jid).await? {
                kept.push(jid.clone());
            }
        }

        let removed = listed.len() - kept.len();
        if removed == 0 {
            return Ok(0);
        }

        txn.list_replace(kept);
        if committed(txn).await? {
            debug!(removed, "compacted schedule");
            Ok(removed)
        } else {
            Ok(0)
        }
    }

    /// Unlist `jid`. Returns `false` if it was not listed. The record is left alone.
    #[instrument(skip_all, err, fields(schedule = %self.name))]
    pub async fn remove(&self, jid: &str) -> Result<bool, ScheduleError> {
        let key = self.list_key();
        let mut attempts = 0;

        loop {
            attempts += 1;
            let mut txn = self.store.watch(&key).await?;
            let mut listed = txn.list_read().await?;
            let before = listed.len();
            listed.retain(|id| id != jid);
            if listed.len() == before {
                return Ok(false);
            }

            txn.list_replace(listed);
            if committed(txn).await? {
                return Ok(true);
            }
            self.check_attempts(attempts)?;
        }
    }

    /// Unlist the job and park its id on this schedule's dead list.
    #[instrument(skip_all, err, fields(schedule = %self.name, jid = %job.jid))]
    pub async fn dead_letter(&self, job: &JobRecord) -> Result<(), ScheduleError> {
        let jid = job.jid.to_string();
        self.remove(&jid).await?;
        job.save(&self.store, &self.config).await?;
        self.store
            .list_push(&keys::dead(&self.config, &self.name), &jid)
            .await?;
        Ok(())
    }

    /// Dead-lettered jobs whose record still exists, oldest first.
    pub async fn dead_jobs(&self) -> Result<Vec<JobRecord>, ScheduleError> {
        let listed = self
            .store
            .list_read(&keys::dead(&self.config, &self.name))
            .await?;
        let mut jobs = Vec::with_capacity(listed.len());
        for jid in listed {
            match JobRecord::fetch(&self.store, &self.config, &jid).await {
                Ok(job) => jobs.push(job),
                Err(ScheduleError::NotFound(_)) => continue,
                Err(err) => return Err(err.in_schedule(&self.name)),
            }
        }
        Ok(jobs)
    }

    /// Listed ids, orphans included.
    pub async fn job_ids(&self) -> Result<Vec<String>, ScheduleError> {
        Ok(self.store.list_read(&self.list_key()).await?)
    }

    pub async fn len(&self) -> Result<usize, ScheduleError> {
        Ok(self.store.list_len(&self.list_key()).await?)
    }

    pub async fn is_empty(&self) -> Result<bool, ScheduleError> {
        Ok(self.len().await? == 0)
    }

    #[instrument(skip_all, err, fields(schedule = %self.name))]
    async fn take_first<F>(&self, now: DateTime, matches: F) -> Result<Option<JobRecord>, ScheduleError>
    where
        F: Fn(&JobRecord) -> bool + Send + Sync,
    {
        let key = self.list_key();
        let mut attempts = 0;

        loop {
            attempts += 1;
            let mut txn = self.store.watch(&key).await?;
            let listed = txn.list_read().await?;

            let mut kept = Vec::with_capacity(listed.len());
            let mut taken = None;
            let mut failure = None;
            let mut orphans = 0;
            let mut rest = listed.into_iter();

            for jid in rest.by_ref() {
                match JobRecord::fetch(&self.store, &self.config, &jid).await {
                    Ok(job) if !job.is_due(now) => {
                        kept.push(jid);
                        break;
                    }
                    Ok(job) if matches(&job) => {
                        taken = Some(job);
                        break;
                    }
                    Ok(_) => kept.push(jid),
                    Err(ScheduleError::NotFound(_)) => orphans += 1,
                    Err(err @ ScheduleError::Decode { .. }) => {
                        failure = Some(err.in_schedule(&self.name));
                        break;
                    }
                    Err(err) => return Err(err),
                }
            }
            kept.extend(rest);

            if taken.is_none() && failure.is_none() && orphans == 0 {
                return Ok(None);
            }

            txn.list_replace(kept);
            if committed(txn).await? {
                if orphans > 0 {
                    debug!(orphans, "dropped orphaned job ids");
                }
                return match failure {
                    Some(err) => Err(err),
                    None => Ok(taken),
                };
            }
            self.check_attempts(attempts)?;
        }
    }

    /// Resolve listed ids to their ETAs, dropping orphans.
    async fn resolve(&self, listed: Vec<String>) -> Result<Vec<Entry>, ScheduleError> {
        let mut entries = Vec::with_capacity(listed.len() + 1);
        for jid in listed {
            match JobRecord::fetch(&self.store, &self.config, &jid).await {
                Ok(job) => entries.push((jid, Some(job.eta))),
                Err(ScheduleError::NotFound(_)) => {
                    debug!(%jid, "dropping orphaned job id");
                }
                Err(ScheduleError::Decode { source, .. }) => {
                    warn!(%jid, error = %source, "keeping undecodable job in place");
                    entries.push((jid, None));
                }
                Err(err) => return Err(err),
            }
        }
        Ok(entries)
    }

    /// Compact what the pop left behind. Nothing to do once the list is empty.
    async fn compact_after_pop(&self) {
        if !self.config.compact_on_dequeue {
            return;
        }
        match self.len().await {
            Ok(0) => return,
            Ok(_) => {}
            Err(err) => {
                warn!(schedule = %self.name, error = %err, "compaction after dequeue failed");
                return;
            }
        }
        if let Err(err) = self.compact().await {
            warn!(schedule = %self.name, error = %err, "compaction after dequeue failed");
        }
    }

    fn check_attempts(&self, attempts: u32) -> Result<(), ScheduleError> {
        if self.config.attempts_exhausted(attempts) {
            return Err(ScheduleError::Contention {
                schedule: self.name.clone(),
                attempts,
            });
        }
        debug!(attempts, "transaction aborted, retrying");
        Ok(())
    }
}

/// Index after every entry due at or before `eta`. Undecodable entries don't take part in the
/// comparison and stay where they are relative to their neighbours.
fn insertion_point(entries: &[Entry], eta: DateTime) -> usize {
    entries
        .iter()
        .position(|(_, listed)| matches!(listed, Some(at) if *at > eta))
        .unwrap_or(entries.len())
}

/// `Ok(false)` when the commit lost a race.
async fn committed<T: Transaction>(txn: T) -> Result<bool, ScheduleError> {
    match txn.commit().await {
        Ok(()) => Ok(true),
        Err(StoreError::Aborted(_)) => Ok(false),
        Err(err) => Err(err.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryStore;
    use crate::test_support::FaultyStore;
    use chrono::{Duration, Utc};

    fn job_at(eta: DateTime) -> JobRecord {
        JobRecord::new(eta, Vec::new(), None)
    }

    #[tokio::test]
    async fn dequeues_in_eta_order() {
        let schedule = Schedule::new("default", MemoryStore::new());
        let t = Utc::now();

        let a = schedule.enqueue(job_at(t + Duration::seconds(30))).await.unwrap();
        let b = schedule.enqueue(job_at(t + Duration::seconds(10))).await.unwrap();
        let c = schedule.enqueue(job_at(t + Duration::seconds(20))).await.unwrap();

        assert_eq!(schedule.dequeue().await.unwrap().unwrap().jid, b.jid);
        assert_eq!(schedule.dequeue().await.unwrap().unwrap().jid, c.jid);
        assert_eq!(schedule.dequeue().await.unwrap().unwrap().jid, a.jid);
        assert!(schedule.dequeue().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn equal_etas_keep_insertion_order() {
        let schedule = Schedule::new("default", MemoryStore::new());
        let t = Utc::now();

        let first = schedule.enqueue(job_at(t)).await.unwrap();
        let second = schedule.enqueue(job_at(t)).await.unwrap();
        let third = schedule.enqueue(job_at(t)).await.unwrap();

        assert_eq!(
            schedule.job_ids().await.unwrap(),
            vec![
                first.jid.to_string(),
                second.jid.to_string(),
                third.jid.to_string()
            ]
        );
    }

    #[tokio::test]
    async fn enqueue_stamps_origin() {
        let schedule = Schedule::new("mail", MemoryStore::new());
        let job = schedule.enqueue(job_at(Utc::now())).await.unwrap();

        assert_eq!(job.origin, "mail");
        assert!(job.enqueued_at.is_some());
        let stored = schedule.peek().await.unwrap().unwrap();
        assert_eq!(stored.origin, "mail");
    }

    #[tokio::test]
    async fn orphan_is_skipped_and_dropped() {
        let schedule = Schedule::new("default", MemoryStore::new());
        let t = Utc::now();

        let a = schedule.enqueue(job_at(t)).await.unwrap();
        JobRecord::delete(schedule.store(), schedule.config(), &a.jid.to_string())
            .await
            .unwrap();
        let b = schedule.enqueue(job_at(t + Duration::seconds(5))).await.unwrap();

        assert_eq!(schedule.dequeue().await.unwrap().unwrap().jid, b.jid);
        assert!(!schedule
            .job_ids()
            .await
            .unwrap()
            .contains(&a.jid.to_string()));
    }

    #[tokio::test]
    async fn dequeue_skips_orphan_at_front() {
        let schedule = Schedule::new("default", MemoryStore::new());
        let t = Utc::now();

        let a = schedule.enqueue(job_at(t)).await.unwrap();
        let b = schedule.enqueue(job_at(t + Duration::seconds(5))).await.unwrap();
        JobRecord::delete(schedule.store(), schedule.config(), &a.jid.to_string())
            .await
            .unwrap();

        assert_eq!(schedule.dequeue().await.unwrap().unwrap().jid, b.jid);
        assert!(schedule.dequeue().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn corrupt_record_surfaces_decode_error() {
        let schedule = Schedule::new("reports", MemoryStore::new());
        let job = schedule.enqueue(job_at(Utc::now())).await.unwrap();
        let key = keys::job(schedule.config(), &job.jid.to_string());
        schedule
            .store()
            .set(&key, vec![0xde, 0xad].into())
            .await
            .unwrap();

        let err = schedule.dequeue().await.unwrap_err();
        match err {
            ScheduleError::Decode { schedule, id, .. } => {
                assert_eq!(schedule.as_deref(), Some("reports"));
                assert_eq!(id, job.jid.to_string());
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn peek_does_not_remove() {
        let schedule = Schedule::new("default", MemoryStore::new());
        assert!(schedule.peek().await.unwrap().is_none());

        let job = schedule.enqueue(job_at(Utc::now())).await.unwrap();
        assert_eq!(schedule.peek().await.unwrap().unwrap().jid, job.jid);
        assert_eq!(schedule.len().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn compact_drops_orphans_and_is_idempotent() {
        let schedule = Schedule::new("default", MemoryStore::new());
        let t = Utc::now();

        let a = schedule.enqueue(job_at(t)).await.unwrap();
        let b = schedule.enqueue(job_at(t + Duration::seconds(1))).await.unwrap();
        let c = schedule.enqueue(job_at(t + Duration::seconds(2))).await.unwrap();
        JobRecord::delete(schedule.store(), schedule.config(), &b.jid.to_string())
            .await
            .unwrap();

        assert_eq!(schedule.compact().await.unwrap(), 1);
        let once = schedule.job_ids().await.unwrap();
        assert_eq!(once, vec![a.jid.to_string(), c.jid.to_string()]);

        assert_eq!(schedule.compact().await.unwrap(), 0);
        assert_eq!(schedule.job_ids().await.unwrap(), once);
    }

    #[tokio::test]
    async fn dequeue_due_waits_for_eta() {
        let schedule = Schedule::new("default", MemoryStore::new());
        let now = Utc::now();
        let job = schedule.enqueue(job_at(now + Duration::minutes(5))).await.unwrap();

        assert!(schedule.dequeue_due(now).await.unwrap().is_none());
        assert_eq!(schedule.len().await.unwrap(), 1);

        let later = now + Duration::minutes(6);
        assert_eq!(schedule.dequeue_due(later).await.unwrap().unwrap().jid, job.jid);
        assert!(schedule.is_empty().await.unwrap());
    }

    #[tokio::test]
    async fn take_next_filters_by_type_and_keeps_order() {
        let schedule = Schedule::new("default", MemoryStore::new());
        let t = Utc::now() - Duration::seconds(10);

        let report = schedule
            .enqueue(job_at(t).with_job_type("report"))
            .await
            .unwrap();
        let mail = schedule
            .enqueue(job_at(t + Duration::seconds(1)).with_job_type("mail"))
            .await
            .unwrap();

        let taken = schedule.take_next(&["mail"], Utc::now()).await.unwrap().unwrap();
        assert_eq!(taken.jid, mail.jid);
        assert_eq!(schedule.job_ids().await.unwrap(), vec![report.jid.to_string()]);

        assert!(schedule.take_next(&["mail"], Utc::now()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn remove_unlists_only_the_target() {
        let schedule = Schedule::new("default", MemoryStore::new());
        let t = Utc::now();
        let a = schedule.enqueue(job_at(t)).await.unwrap();
        let b = schedule.enqueue(job_at(t)).await.unwrap();

        assert!(schedule.remove(&a.jid.to_string()).await.unwrap());
        assert!(!schedule.remove(&a.jid.to_string()).await.unwrap());
        assert_eq!(schedule.job_ids().await.unwrap(), vec![b.jid.to_string()]);
    }

    #[tokio::test]
    async fn dead_letter_parks_the_job() {
        let schedule = Schedule::new("default", MemoryStore::new());
        let job = schedule.enqueue(job_at(Utc::now())).await.unwrap();

        schedule.dead_letter(&job).await.unwrap();

        assert!(schedule.is_empty().await.unwrap());
        let dead = schedule.dead_jobs().await.unwrap();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].jid, job.jid);
    }

    #[tokio::test]
    async fn schedules_are_independent() {
        let store = MemoryStore::new();
        let mail = Schedule::new("mail", store.clone());
        let reports = Schedule::new("reports", store);

        let job = mail.enqueue(job_at(Utc::now())).await.unwrap();

        assert!(reports.dequeue().await.unwrap().is_none());
        assert_eq!(mail.dequeue().await.unwrap().unwrap().jid, job.jid);
    }

    #[test]
    fn insertion_point_skips_undecodable_entries() {
        let t = Utc::now();
        let entries = vec![
            ("a".to_string(), Some(t)),
            ("bad".to_string(), None),
            ("c".to_string(), Some(t + Duration::seconds(10))),
        ];

        assert_eq!(insertion_point(&entries, t + Duration::seconds(5)), 2);
        assert_eq!(insertion_point(&entries, t - Duration::seconds(5)), 0);
        assert_eq!(insertion_point(&entries, t + Duration::seconds(20)), 3);
    }

    #[tokio::test]
    async fn malformed_orphan_id_is_skipped() {
        let schedule = Schedule::new("default", MemoryStore::new());
        let key = keys::schedule(schedule.config(), schedule.name());
        let b = job_at(Utc::now());
        b.save(schedule.store(), schedule.config()).await.unwrap();
        schedule.store().list_push(&key, "legacy-42").await.unwrap();
        schedule.store().list_push(&key, &b.jid.to_string()).await.unwrap();

        assert_eq!(schedule.dequeue().await.unwrap().unwrap().jid, b.jid);
        assert!(schedule.dequeue().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn enqueue_drops_malformed_orphan_id() {
        let schedule = Schedule::new("default", MemoryStore::new());
        let key = keys::schedule(schedule.config(), schedule.name());
        schedule.store().list_push(&key, "legacy-42").await.unwrap();

        let b = schedule.enqueue(job_at(Utc::now())).await.unwrap();
        assert_eq!(schedule.job_ids().await.unwrap(), vec![b.jid.to_string()]);
    }

    #[tokio::test]
    async fn take_next_drops_malformed_orphan_id() {
        let schedule = Schedule::new("default", MemoryStore::new());
        let key = keys::schedule(schedule.config(), schedule.name());
        schedule.store().list_push(&key, "legacy-42").await.unwrap();

        assert!(schedule.dequeue_due(Utc::now()).await.unwrap().is_none());
        assert!(schedule.is_empty().await.unwrap());
    }

    #[tokio::test]
    async fn capped_retries_report_contention() {
        let store = FaultyStore::new();
        let config = ScheduleConfig::default().with_max_attempts(3);
        let schedule = Schedule::with_config("busy", store.clone(), config);
        let listed = schedule.enqueue(job_at(Utc::now())).await.unwrap();

        store.abort_commits(usize::MAX);
        let watches = store.watches();

        let err = schedule.enqueue(job_at(Utc::now())).await.unwrap_err();
        assert!(matches!(
            err,
            ScheduleError::Contention { ref schedule, attempts: 3 } if schedule == "busy"
        ));
        assert_eq!(store.watches() - watches, 3);

        let err = schedule.remove(&listed.jid.to_string()).await.unwrap_err();
        assert!(matches!(err, ScheduleError::Contention { attempts: 3, .. }));

        let err = schedule.take_next(&[""], Utc::now()).await.unwrap_err();
        assert!(matches!(err, ScheduleError::Contention { attempts: 3, .. }));

        assert_eq!(schedule.job_ids().await.unwrap(), vec![listed.jid.to_string()]);
    }

    #[tokio::test]
    async fn uncapped_retries_outlast_aborts() {
        let store = FaultyStore::new();
        let schedule = Schedule::new("busy", store.clone());

        store.abort_commits(5);
        let job = schedule.enqueue(job_at(Utc::now())).await.unwrap();

        assert_eq!(store.watches(), 6);
        assert_eq!(schedule.job_ids().await.unwrap(), vec![job.jid.to_string()]);
    }

    #[tokio::test]
    async fn compact_gives_up_on_abort() {
        let store = FaultyStore::new();
        let schedule = Schedule::new("default", store.clone());
        let t = Utc::now();
        let a = schedule.enqueue(job_at(t)).await.unwrap();
        let b = schedule.enqueue(job_at(t + Duration::seconds(1))).await.unwrap();
        JobRecord::delete(schedule.store(), schedule.config(), &a.jid.to_string())
            .await
            .unwrap();
        let before = schedule.job_ids().await.unwrap();

        store.abort_commits(usize::MAX);
        let watches = store.watches();
        assert_eq!(schedule.compact().await.unwrap(), 0);

        assert_eq!(store.watches() - watches, 1);
        assert_eq!(schedule.job_ids().await.unwrap(), before);
        assert!(before.contains(&b.jid.to_string()));
    }

    #[tokio::test]
    async fn dequeue_compacts_only_when_jobs_remain() {
        let store = FaultyStore::new();
        let schedule = Schedule::new("default", store.clone());
        let t = Utc::now();
        schedule.enqueue(job_at(t)).await.unwrap();
        schedule.enqueue(job_at(t + Duration::seconds(1))).await.unwrap();

        let watches = store.watches();
        schedule.dequeue().await.unwrap().unwrap();
        assert_eq!(store.watches() - watches, 1);

        let watches = store.watches();
        schedule.dequeue().await.unwrap().unwrap();
        assert_eq!(store.watches(), watches);
    }
}
