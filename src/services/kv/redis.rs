use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;
use std::time::Duration;

use super::{KvBackend, KvError, WriteOp};

/// Redis-backed key-value store sharing one multiplexed connection.
#[derive(Clone)]
pub struct RedisBackend {
    conn: MultiplexedConnection,
}

impl RedisBackend {
    pub async fn connect(redis_url: &str) -> Result<Self, KvError> {
        let client = redis::Client::open(redis_url)?;
        let conn = client.get_multiplexed_async_connection().await?;
        Ok(Self { conn })
    }
}

fn millis(ttl: Duration) -> u64 {
    ttl.as_millis().max(1) as u64
}

#[async_trait::async_trait]
impl KvBackend for RedisBackend {
    async fn set(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> Result<(), KvError> {
        let mut conn = self.conn.clone();
        match ttl {
            Some(ttl) => {
                redis::cmd("SET")
                    .arg(key)
                    .arg(value)
                    .arg("PX")
                    .arg(millis(ttl))
                    .query_async::<()>(&mut conn)
                    .await?
            }
            None => conn.set::<_, _, ()>(key, value).await?,
        }
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, KvError> {
        let mut conn = self.conn.clone();
        Ok(conn.get(key).await?)
    }

    async fn exists(&self, key: &str) -> Result<bool, KvError> {
        let mut conn = self.conn.clone();
        Ok(conn.exists(key).await?)
    }

    async fn list_range(&self, key: &str) -> Result<Vec<Vec<u8>>, KvError> {
        let mut conn = self.conn.clone();
        Ok(conn.lrange(key, 0, -1).await?)
    }

    async fn hash_exists(&self, key: &str, field: &str) -> Result<bool, KvError> {
        let mut conn = self.conn.clone();
        Ok(conn.hexists(key, field).await?)
    }

    async fn hash_keys(&self, key: &str) -> Result<Vec<String>, KvError> {
        let mut conn = self.conn.clone();
        Ok(conn.hkeys(key).await?)
    }

    async fn atomic(&self, ops: Vec<WriteOp>) -> Result<(), KvError> {
        let mut pipe = redis::pipe();
        pipe.atomic();
        for op in &ops {
            match op {
                WriteOp::Delete { key } => pipe.del(key).ignore(),
                WriteOp::ListPush { key, value } => pipe.rpush(key, value.as_slice()).ignore(),
                WriteOp::HashSet { key, field, value } => {
                    pipe.hset(key, field, value.as_slice()).ignore()
                }
                WriteOp::HashDelete { key, field } => pipe.hdel(key, field).ignore(),
                WriteOp::Expire { key, ttl } => {
                    pipe.cmd("PEXPIRE").arg(key).arg(millis(*ttl)).ignore()
                }
            };
        }

        let mut conn = self.conn.clone();
        pipe.query_async::<()>(&mut conn).await?;
        Ok(())
    }

    async fn take_list(
        &self,
        key: &str,
        registry: &str,
        field: &str,
    ) -> Result<Option<Vec<Vec<u8>>>, KvError> {
        let mut conn = self.conn.clone();
        let (registered, chunks): (bool, Vec<Vec<u8>>) = redis::pipe()
            .atomic()
            .hexists(registry, field)
            .lrange(key, 0, -1)
            .del(key)
            .ignore()
            .hdel(registry, field)
            .ignore()
            .query_async(&mut conn)
            .await?;

        Ok(registered.then_some(chunks))
    }

    async fn ping(&self) -> Result<(), KvError> {
        let mut conn = self.conn.clone();
        redis::cmd("PING").query_async::<String>(&mut conn).await?;
        Ok(())
    }
}
