//! Redis-backed store. Transactions map onto WATCH / MULTI / EXEC on a connection of their own.

use aide_de_camp::core::Bytes;
use async_trait::async_trait;
use redis::{aio::MultiplexedConnection, AsyncCommands, Client};
use tracing::instrument;

use crate::{
    error::StoreError,
    store::{Store, Transaction},
};

#[derive(Clone)]
pub struct RedisStore {
    client: Client,
    conn: MultiplexedConnection,
}

impl RedisStore {
    /// Connect to e.g. `redis://localhost:6379`.
    pub async fn connect(redis_url: impl AsRef<str>) -> Result<Self, StoreError> {
        let client = Client::open(redis_url.as_ref())?;
        let conn = client.get_multiplexed_tokio_connection().await?;
        Ok(Self { client, conn })
    }
}

#[async_trait]
impl Store for RedisStore {
    type Transaction = RedisTransaction;

    async fn get(&self, key: &str) -> Result<Option<Bytes>, StoreError> {
        let mut conn = self.conn.clone();
        let value: Option<Vec<u8>> = conn.get(key).await?;
        Ok(value.map(Bytes::from))
    }

    async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();
        let exists: bool = conn.exists(key).await?;
        Ok(exists)
    }

    async fn set(&self, key: &str, value: Bytes) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        conn.set::<_, _, ()>(key, value.to_vec()).await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        conn.del::<_, ()>(key).await?;
        Ok(())
    }

    async fn list_read(&self, key: &str) -> Result<Vec<String>, StoreError> {
        let mut conn = self.conn.clone();
        let ids: Vec<String> = conn.lrange(key, 0, -1).await?;
        Ok(ids)
    }

    async fn list_len(&self, key: &str) -> Result<usize, StoreError> {
        let mut conn = self.conn.clone();
        let len: usize = conn.llen(key).await?;
        Ok(len)
    }

    async fn list_push(&self, key: &str, id: &str) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        conn.rpush::<_, _, ()>(key, id).await?;
        Ok(())
    }

    async fn list_pop_front(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut conn = self.conn.clone();
        let popped: Option<String> = conn.lpop(key, None).await?;
        Ok(popped)
    }

    #[instrument(skip(self), err)]
    async fn watch(&self, key: &str) -> Result<Self::Transaction, StoreError> {
        // WATCH state is per connection, so every transaction gets a fresh one.
        let mut conn = self.client.get_multiplexed_tokio_connection().await?;
        redis::cmd("WATCH")
            .arg(key)
            .query_async::<_, ()>(&mut conn)
            .await?;
        Ok(RedisTransaction {
            conn,
            key: key.to_string(),
            staged: None,
        })
    }
}

pub struct RedisTransaction {
    conn: MultiplexedConnection,
    key: String,
    staged: Option<Vec<String>>,
}

#[async_trait]
impl Transaction for RedisTransaction {
    async fn list_read(&mut self) -> Result<Vec<String>, StoreError> {
        let ids: Vec<String> = self.conn.lrange(&self.key, 0, -1).await?;
        Ok(ids)
    }

    fn list_replace(&mut self, ids: Vec<String>) {
        self.staged = Some(ids);
    }

    async fn commit(mut self) -> Result<(), StoreError> {
        let Some(ids) = self.staged.take() else {
            redis::cmd("UNWATCH")
                .query_async::<_, ()>(&mut self.conn)
                .await?;
            return Ok(());
        };

        let mut pipe = redis::pipe();
        pipe.atomic().del(&self.key).ignore();
        if !ids.is_empty() {
            pipe.rpush(&self.key, ids).ignore();
        }

        // EXEC answers nil when a watched key changed.
        let applied: Option<()> = pipe.query_async(&mut self.conn).await?;
        match applied {
            Some(()) => Ok(()),
            None => Err(StoreError::Aborted(self.key)),
        }
    }
}
