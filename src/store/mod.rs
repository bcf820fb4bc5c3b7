//! The store primitives a schedule is built on.
//!
//! A store holds keyed byte records and ordered lists of ids. Mutual exclusion comes from
//! optimistic transactions only: [`Store::watch`] a key, read, stage a list replacement and
//! [`Transaction::commit`]. The commit fails with [`StoreError::Aborted`] when anything wrote to
//! the watched key in between.

use aide_de_camp::core::Bytes;
use async_trait::async_trait;

use crate::error::StoreError;

pub mod memory;
#[cfg(feature = "redis")]
pub mod redis;

#[async_trait]
pub trait Store: Send + Sync {
    type Transaction: Transaction;

    async fn get(&self, key: &str) -> Result<Option<Bytes>, StoreError>;

    async fn exists(&self, key: &str) -> Result<bool, StoreError>;

    async fn set(&self, key: &str, value: Bytes) -> Result<(), StoreError>;

    async fn delete(&self, key: &str) -> Result<(), StoreError>;

    /// Read a list. A missing key reads as empty.
    async fn list_read(&self, key: &str) -> Result<Vec<String>, StoreError>;

    async fn list_len(&self, key: &str) -> Result<usize, StoreError>;

    async fn list_push(&self, key: &str, id: &str) -> Result<(), StoreError>;

    /// Atomically remove and return the first element of a list.
    async fn list_pop_front(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// Start an optimistic transaction guarded by `key`.
    async fn watch(&self, key: &str) -> Result<Self::Transaction, StoreError>;
}

#[async_trait]
pub trait Transaction: Send + Sized {
    /// Read the watched list.
    async fn list_read(&mut self) -> Result<Vec<String>, StoreError>;

    /// Stage replacing the watched list with `ids`. Nothing is written until commit.
    fn list_replace(&mut self, ids: Vec<String>);

    /// Apply staged writes if the watched key is unchanged, otherwise [`StoreError::Aborted`].
    async fn commit(self) -> Result<(), StoreError>;
}

pub mod keys {
    use crate::config::ScheduleConfig;

    pub fn schedule(config: &ScheduleConfig, name: &str) -> String {
        format!("{}:schedule:{}", config.key_prefix, name)
    }

    pub fn dead(config: &ScheduleConfig, name: &str) -> String {
        format!("{}:schedule:{}:dead", config.key_prefix, name)
    }

    pub fn job(config: &ScheduleConfig, jid: &str) -> String {
        format!("{}:job:{}", config.key_prefix, jid)
    }
}
