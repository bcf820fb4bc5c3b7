use std::sync::{
    atomic::{AtomicBool, AtomicUsize, Ordering},
    Arc,
};

use aide_de_camp::core::Bytes;
use async_trait::async_trait;

use crate::{
    error::StoreError,
    store::{
        memory::{MemoryStore, MemoryTransaction},
        Store, Transaction,
    },
};

/// [`MemoryStore`] with switchable faults and a count of transactions opened.
#[derive(Clone, Default)]
pub(crate) struct FaultyStore {
    inner: MemoryStore,
    faults: Arc<Faults>,
}

#[derive(Default)]
struct Faults {
    aborts_left: AtomicUsize,
    fail_sets: AtomicBool,
    watches: AtomicUsize,
}

impl FaultyStore {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Abort the next `count` commits as if another writer got there first.
    pub(crate) fn abort_commits(&self, count: usize) {
        self.faults.aborts_left.store(count, Ordering::SeqCst);
    }

    pub(crate) fn fail_sets(&self, fail: bool) {
        self.faults.fail_sets.store(fail, Ordering::SeqCst);
    }

    pub(crate) fn watches(&self) -> usize {
        self.faults.watches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Store for FaultyStore {
    type Transaction = FaultyTransaction;

    async fn get(&self, key: &str) -> Result<Option<Bytes>, StoreError> {
        self.inner.get(key).await
    }

    async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        self.inner.exists(key).await
    }

    async fn set(&self, key: &str, value: Bytes) -> Result<(), StoreError> {
        if self.faults.fail_sets.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable(format!("refusing to write `{key}`")));
        }
        self.inner.set(key, value).await
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.inner.delete(key).await
    }

    async fn list_read(&self, key: &str) -> Result<Vec<String>, StoreError> {
        self.inner.list_read(key).await
    }

    async fn list_len(&self, key: &str) -> Result<usize, StoreError> {
        self.inner.list_len(key).await
    }

    async fn list_push(&self, key: &str, id: &str) -> Result<(), StoreError> {
        self.inner.list_push(key, id).await
    }

    async fn list_pop_front(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.inner.list_pop_front(key).await
    }

    async fn watch(&self, key: &str) -> Result<Self::Transaction, StoreError> {
        self.faults.watches.fetch_add(1, Ordering::SeqCst);
        Ok(FaultyTransaction {
            inner: self.inner.watch(key).await?,
            key: key.to_string(),
            faults: Arc::clone(&self.faults),
        })
    }
}

pub(crate) struct FaultyTransaction {
    inner: MemoryTransaction,
    key: String,
    faults: Arc<Faults>,
}

#[async_trait]
impl Transaction for FaultyTransaction {
    async fn list_read(&mut self) -> Result<Vec<String>, StoreError> {
        self.inner.list_read().await
    }

    fn list_replace(&mut self, ids: Vec<String>) {
        self.inner.list_replace(ids);
    }

    async fn commit(self) -> Result<(), StoreError> {
        let aborted = self
            .faults
            .aborts_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if aborted {
            return Err(StoreError::Aborted(self.key));
        }
        self.inner.commit().await
    }
}
