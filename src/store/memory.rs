use std::{collections::HashMap, sync::Arc};

use aide_de_camp::core::Bytes;
use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::{
    error::StoreError,
    store::{Store, Transaction},
};

/// In-process store. Every write bumps the key's version, which is what transactions watch.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<RwLock<Inner>>,
}

#[derive(Default)]
struct Inner {
    records: HashMap<String, Bytes>,
    lists: HashMap<String, Vec<String>>,
    versions: HashMap<String, u64>,
}

impl Inner {
    fn touch(&mut self, key: &str) {
        *self.versions.entry(key.to_string()).or_default() += 1;
    }

    fn version(&self, key: &str) -> u64 {
        self.versions.get(key).copied().unwrap_or_default()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Store for MemoryStore {
    type Transaction = MemoryTransaction;

    async fn get(&self, key: &str) -> Result<Option<Bytes>, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner.records.get(key).cloned())
    }

    async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner.records.contains_key(key) || inner.lists.contains_key(key))
    }

    async fn set(&self, key: &str, value: Bytes) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        inner.records.insert(key.to_string(), value);
        inner.touch(key);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        let removed = inner.records.remove(key).is_some() | inner.lists.remove(key).is_some();
        if removed {
            inner.touch(key);
        }
        Ok(())
    }

    async fn list_read(&self, key: &str) -> Result<Vec<String>, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner.lists.get(key).cloned().unwrap_or_default())
    }

    async fn list_len(&self, key: &str) -> Result<usize, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner.lists.get(key).map_or(0, Vec::len))
    }

    async fn list_push(&self, key: &str, id: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        inner
            .lists
            .entry(key.to_string())
            .or_default()
            .push(id.to_string());
        inner.touch(key);
        Ok(())
    }

    async fn list_pop_front(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut inner = self.inner.write().await;
        let Some(list) = inner.lists.get_mut(key) else {
            return Ok(None);
        };
        let popped = if list.is_empty() {
            None
        } else {
            Some(list.remove(0))
        };
        if list.is_empty() {
            inner.lists.remove(key);
        }
        if popped.is_some() {
            inner.touch(key);
        }
        Ok(popped)
    }

    async fn watch(&self, key: &str) -> Result<Self::Transaction, StoreError> {
        let version = self.inner.read().await.version(key);
        Ok(MemoryTransaction {
            inner: Arc::clone(&self.inner),
            key: key.to_string(),
            version,
            staged: None,
        })
    }
}

pub struct MemoryTransaction {
    inner: Arc<RwLock<Inner>>,
    key: String,
    version: u64,
    staged: Option<Vec<String>>,
}

#[async_trait]
impl Transaction for MemoryTransaction {
    async fn list_read(&mut self) -> Result<Vec<String>, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner.lists.get(&self.key).cloned().unwrap_or_default())
    }

    fn list_replace(&mut self, ids: Vec<String>) {
        self.staged = Some(ids);
    }

    async fn commit(self) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        if inner.version(&self.key) != self.version {
            return Err(StoreError::Aborted(self.key));
        }

        if let Some(ids) = self.staged {
            if ids.is_empty() {
                inner.lists.remove(&self.key);
            } else {
                inner.lists.insert(self.key.clone(), ids);
            }
            inner.touch(&self.key);
        }

        Ok(())
    }
}
