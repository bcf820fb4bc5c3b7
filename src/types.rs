use std::time::Duration;

use aide_de_camp::core::{new_xid, Bytes, DateTime, Xid};
use bincode::{Decode, Encode};
use chrono::{TimeZone, Utc};
use tracing::instrument;

use crate::{
    config::ScheduleConfig,
    error::{RecordDecodeError, ScheduleError},
    store::{keys, Store},
};

const RECORD_VERSION: u8 = 1;

/// A unit of deferred work.
///
/// The record and its listing in a schedule are separate pieces of store state: the record
/// lives under its own key and may disappear while its id is still listed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobRecord {
    pub jid: Xid,
    pub eta: DateTime,
    pub payload: Bytes,
    /// Name of the schedule the job was last enqueued into. Empty until then.
    pub origin: String,
    pub enqueued_at: Option<DateTime>,
    /// Advisory execution budget for workers. Never enforced here.
    pub timeout: Option<Duration>,
    pub job_type: String,
    pub retries: u32,
    /// Kept for the processor's benefit, ordering is by `eta` only.
    pub priority: i8,
}

impl JobRecord {
    pub fn new(eta: DateTime, payload: impl Into<Bytes>, timeout: Option<Duration>) -> Self {
        Self {
            jid: new_xid(),
            eta,
            payload: payload.into(),
            origin: String::new(),
            enqueued_at: None,
            timeout,
            job_type: String::new(),
            retries: 0,
            priority: 0,
        }
    }

    /// Build a record whose payload is the bincode encoding of `payload`.
    pub fn encode_payload<T: Encode>(
        eta: DateTime,
        payload: &T,
        timeout: Option<Duration>,
    ) -> Result<Self, ScheduleError> {
        let bytes = bincode::encode_to_vec(payload, bincode::config::standard())?;
        Ok(Self::new(eta, bytes, timeout))
    }

    pub fn with_job_type(mut self, job_type: impl Into<String>) -> Self {
        self.job_type = job_type.into();
        self
    }

    pub fn with_priority(mut self, priority: i8) -> Self {
        self.priority = priority;
        self
    }

    pub fn decode_payload<T: Decode>(&self) -> Result<T, ScheduleError> {
        let (decoded, _) = bincode::decode_from_slice(&self.payload, bincode::config::standard())
            .map_err(|source| ScheduleError::Decode {
                schedule: None,
                id: self.jid.to_string(),
                source: source.into(),
            })?;
        Ok(decoded)
    }

    pub fn is_due(&self, now: DateTime) -> bool {
        self.eta <= now
    }

    /// Stamp the record as accepted by `origin`. `enqueued_at` is only ever set once.
    pub(crate) fn stamp(&mut self, origin: &str) {
        self.origin = origin.to_string();
        if self.enqueued_at.is_none() {
            self.enqueued_at = Some(Utc::now());
        }
    }

    pub(crate) fn to_bytes(&self) -> Result<Vec<u8>, ScheduleError> {
        let stored = StoredJob {
            version: RECORD_VERSION,
            jid: self.jid.to_string(),
            eta: self.eta.timestamp_micros(),
            payload: self.payload.to_vec(),
            origin: self.origin.clone(),
            enqueued_at: self.enqueued_at.map(|at| at.timestamp_micros()),
            timeout: self.timeout.map(|t| (t.as_secs(), t.subsec_nanos())),
            job_type: self.job_type.clone(),
            retries: self.retries,
            priority: self.priority,
        };
        Ok(bincode::encode_to_vec(&stored, bincode::config::standard())?)
    }

    pub(crate) fn from_bytes(bytes: &[u8]) -> Result<Self, RecordDecodeError> {
        let (stored, _): (StoredJob, usize) =
            bincode::decode_from_slice(bytes, bincode::config::standard())?;
        if stored.version != RECORD_VERSION {
            return Err(RecordDecodeError::UnsupportedVersion(stored.version));
        }
        let jid = stored
            .jid
            .parse::<Xid>()
            .map_err(|_| RecordDecodeError::InvalidId(stored.jid.clone()))?;
        let timeout = match stored.timeout {
            Some((_, nanos)) if nanos >= 1_000_000_000 => {
                return Err(RecordDecodeError::InvalidTimeout(nanos))
            }
            Some((secs, nanos)) => Some(Duration::new(secs, nanos)),
            None => None,
        };
        let enqueued_at = match stored.enqueued_at {
            Some(micros) => Some(timestamp(micros)?),
            None => None,
        };

        Ok(Self {
            jid,
            eta: timestamp(stored.eta)?,
            payload: stored.payload.into(),
            origin: stored.origin,
            enqueued_at,
            timeout,
            job_type: stored.job_type,
            retries: stored.retries,
            priority: stored.priority,
        })
    }

    /// Persist under the record's key, overwriting whatever is there.
    #[instrument(skip_all, err, fields(jid = %self.jid))]
    pub async fn save<S: Store>(&self, store: &S, config: &ScheduleConfig) -> Result<(), ScheduleError> {
        let bytes = self.to_bytes()?;
        store
            .set(&keys::job(config, &self.jid.to_string()), bytes.into())
            .await?;
        Ok(())
    }

    pub async fn fetch<S: Store>(
        store: &S,
        config: &ScheduleConfig,
        jid: &str,
    ) -> Result<Self, ScheduleError> {
        let bytes = store.get(&keys::job(config, jid)).await?;
        match bytes {
            Some(bytes) => Self::from_bytes(&bytes).map_err(|source| ScheduleError::Decode {
                schedule: None,
                id: jid.to_string(),
                source,
            }),
            None => Err(ScheduleError::NotFound(jid.to_string())),
        }
    }

    /// Existence check without decoding.
    pub async fn exists<S: Store>(
        store: &S,
        config: &ScheduleConfig,
        jid: &str,
    ) -> Result<bool, ScheduleError> {
        Ok(store.exists(&keys::job(config, jid)).await?)
    }

    pub async fn delete<S: Store>(
        store: &S,
        config: &ScheduleConfig,
        jid: &str,
    ) -> Result<(), ScheduleError> {
        store.delete(&keys::job(config, jid)).await?;
        Ok(())
    }
}

fn timestamp(micros: i64) -> Result<DateTime, RecordDecodeError> {
    Utc.timestamp_micros(micros)
        .single()
        .ok_or(RecordDecodeError::InvalidTimestamp(micros))
}

/// On-store layout of a [`JobRecord`].
#[derive(Debug, Encode, Decode)]
struct StoredJob {
    version: u8,
    jid: String,
    eta: i64,
    payload: Vec<u8>,
    origin: String,
    enqueued_at: Option<i64>,
    /// Whole seconds and subsecond nanos.
    timeout: Option<(u64, u32)>,
    job_type: String,
    retries: u32,
    priority: i8,
}
