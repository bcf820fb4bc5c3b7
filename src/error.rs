use aide_de_camp::core::{queue::QueueError, Xid};
use thiserror::Error;

/// Failures reported by a [`Store`](crate::store::Store) implementation.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The watched key changed between `watch` and `commit`.
    #[error("transaction aborted, watched key `{0}` was modified")]
    Aborted(String),
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[cfg(feature = "redis")]
    #[error(transparent)]
    Redis(#[from] redis::RedisError),
}

impl StoreError {
    pub fn is_aborted(&self) -> bool {
        matches!(self, StoreError::Aborted(_))
    }
}

/// Why stored bytes could not be turned back into a [`JobRecord`](crate::types::JobRecord).
#[derive(Debug, Error)]
pub enum RecordDecodeError {
    #[error(transparent)]
    Bincode(#[from] bincode::error::DecodeError),
    #[error("unsupported record format version {0}")]
    UnsupportedVersion(u8),
    #[error("malformed job id `{0}`")]
    InvalidId(String),
    #[error("timestamp out of range: {0}us")]
    InvalidTimestamp(i64),
    #[error("timeout has {0} subsecond nanos")]
    InvalidTimeout(u32),
}

#[derive(Debug, Error)]
pub enum ScheduleError {
    /// No record under a listed or requested id. Carries the id as stored, which need not be a
    /// well-formed [`Xid`].
    #[error("job `{0}` not found")]
    NotFound(String),
    #[error("job `{id}` could not be decoded{}", schedule_suffix(.schedule))]
    Decode {
        schedule: Option<String>,
        id: String,
        #[source]
        source: RecordDecodeError,
    },
    #[error("failed to encode job record")]
    Encode(#[from] bincode::error::EncodeError),
    #[error("schedule `{schedule}` gave up after {attempts} aborted transactions")]
    Contention { schedule: String, attempts: u32 },
    #[error(transparent)]
    Store(#[from] StoreError),
}

fn schedule_suffix(schedule: &Option<String>) -> String {
    match schedule {
        Some(name) => format!(" in schedule `{name}`"),
        None => String::new(),
    }
}

impl ScheduleError {
    /// Attach the schedule identity to a decode failure.
    pub(crate) fn in_schedule(self, name: &str) -> Self {
        match self {
            ScheduleError::Decode {
                schedule: None,
                id,
                source,
            } => ScheduleError::Decode {
                schedule: Some(name.to_string()),
                id,
                source,
            },
            other => other,
        }
    }
}

impl From<ScheduleError> for QueueError {
    fn from(err: ScheduleError) -> Self {
        match err {
            ScheduleError::NotFound(jid) => match jid.parse::<Xid>() {
                Ok(jid) => QueueError::JobNotFound(jid),
                Err(_) => QueueError::Other(anyhow::Error::new(ScheduleError::NotFound(jid))),
            },
            ScheduleError::Encode(source) => QueueError::from(source),
            other => QueueError::Other(anyhow::Error::new(other)),
        }
    }
}
