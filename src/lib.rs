//! ETA-ordered delayed-job schedules for [`aide_de_camp`], kept in a shared key/value store.
//!
//! A [`Schedule`] is a named list of job ids sorted by the time each job should run. Any number
//! of producers may enqueue concurrently; ordering is protected by optimistic store transactions
//! rather than in-process locks. [`MemoryStore`] backs a schedule inside one process, and with
//! the `redis` feature `store::redis::RedisStore` shares it between processes.
//!
//! ```no_run
//! use aide_de_camp_schedule::{JobRecord, MemoryStore, Schedule};
//! use chrono::{Duration, Utc};
//!
//! # async fn run() -> Result<(), aide_de_camp_schedule::ScheduleError> {
//! let schedule = Schedule::new("mail", MemoryStore::new());
//! schedule
//!     .enqueue(JobRecord::new(Utc::now() + Duration::seconds(30), vec![1, 2, 3], None))
//!     .await?;
//!
//! while let Some(job) = schedule.dequeue_due(Utc::now()).await? {
//!     println!("running {}", job.jid);
//! }
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod job_handle;
pub mod queue;
pub mod schedule;
pub mod store;
#[cfg(test)]
mod test_support;
pub mod types;

pub use config::ScheduleConfig;
pub use error::{RecordDecodeError, ScheduleError, StoreError};
pub use job_handle::ScheduleJobHandle;
pub use schedule::Schedule;
pub use store::{memory::MemoryStore, Store, Transaction};
pub use types::JobRecord;
