//! Redis cache backend
//!
//! Networked backend over a deadpool connection pool. Bulk writes are
//! pipelined into a single round trip; TTLs use millisecond precision via
//! `SET ... PX`.

use async_trait::async_trait;
use deadpool_redis::{Config as PoolSettings, Pool, PoolConfig, Runtime};
use redis::AsyncCommands;
use std::time::Duration;

use crate::error::BackendError;
use crate::store::backend::{CacheBackend, CacheEntry, KeyTtl};

impl From<redis::RedisError> for BackendError {
    fn from(err: redis::RedisError) -> Self {
        if err.is_io_error() || err.is_connection_refusal() || err.is_connection_dropped() {
            BackendError::Connection(err.to_string())
        } else if err.is_timeout() {
            BackendError::Timeout(Duration::ZERO)
        } else {
            BackendError::Protocol(err.to_string())
        }
    }
}

/// Redis-backed cache
pub struct RedisBackend {
    pool: Pool,
}

impl RedisBackend {
    /// Build a pooled client for the given server URL
    pub fn connect(url: &str, pool_size: usize) -> Result<Self, BackendError> {
        let mut settings = PoolSettings::from_url(url);
        settings.pool = Some(PoolConfig::new(pool_size));
        let pool = settings
            .create_pool(Some(Runtime::Tokio1))
            .map_err(|err| BackendError::Connection(err.to_string()))?;
        Ok(Self { pool })
    }

    async fn conn(&self) -> Result<deadpool_redis::Connection, BackendError> {
        self.pool
            .get()
            .await
            .map_err(|err| BackendError::Connection(err.to_string()))
    }
}

#[async_trait]
impl CacheBackend for RedisBackend {
    fn name(&self) -> &'static str {
        "redis"
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, BackendError> {
        let mut conn = self.conn().await?;
        let value: Option<Vec<u8>> = conn.get(key).await?;
        Ok(value)
    }

    async fn mget(&self, keys: &[String]) -> Result<Vec<Option<Vec<u8>>>, BackendError> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let mut conn = self.conn().await?;
        let mut cmd = redis::cmd("MGET");
        for key in keys {
            cmd.arg(key);
        }
        let values: Vec<Option<Vec<u8>>> = cmd.query_async(&mut conn).await?;
        Ok(values)
    }

    async fn set(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> Result<(), BackendError> {
        let mut conn = self.conn().await?;
        match ttl {
            Some(ttl) => {
                let _: () = redis::cmd("SET")
                    .arg(key)
                    .arg(value)
                    .arg("PX")
                    .arg(ttl.as_millis() as u64)
                    .query_async(&mut conn)
                    .await?;
            }
            None => {
                let _: () = conn.set(key, value).await?;
            }
        }
        Ok(())
    }

    async fn mset(&self, entries: &[CacheEntry]) -> Result<(), BackendError> {
        if entries.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn().await?;
        let mut pipe = redis::pipe();
        for entry in entries {
            match entry.ttl {
                Some(ttl) => {
                    pipe.cmd("SET")
                        .arg(&entry.key)
                        .arg(&entry.value)
                        .arg("PX")
                        .arg(ttl.as_millis() as u64)
                        .ignore();
                }
                None => {
                    pipe.cmd("SET").arg(&entry.key).arg(&entry.value).ignore();
                }
            }
        }
        let _: () = pipe.query_async(&mut conn).await?;
        Ok(())
    }

    async fn del(&self, keys: &[String]) -> Result<u64, BackendError> {
        if keys.is_empty() {
            return Ok(0);
        }
        let mut conn = self.conn().await?;
        let removed: u64 = conn.del(keys).await?;
        Ok(removed)
    }

    async fn exists(&self, key: &str) -> Result<bool, BackendError> {
        let mut conn = self.conn().await?;
        let exists: bool = conn.exists(key).await?;
        Ok(exists)
    }

    async fn ttl(&self, key: &str) -> Result<KeyTtl, BackendError> {
        let mut conn = self.conn().await?;
        let pttl: i64 = redis::cmd("PTTL").arg(key).query_async(&mut conn).await?;
        Ok(match pttl {
            -2 => KeyTtl::Missing,
            -1 => KeyTtl::Persistent,
            ms => KeyTtl::Expires(Duration::from_millis(ms.max(0) as u64)),
        })
    }

    async fn incr(&self, key: &str, by: i64) -> Result<i64, BackendError> {
        let mut conn = self.conn().await?;
        let value: i64 = conn.incr(key, by).await?;
        Ok(value)
    }

    async fn ping(&self) -> Result<(), BackendError> {
        let mut conn = self.conn().await?;
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }

    async fn flush(&self) -> Result<(), BackendError> {
        let mut conn = self.conn().await?;
        let _: () = redis::cmd("FLUSHDB").query_async(&mut conn).await?;
        Ok(())
    }

    fn close(&self) {
        self.pool.close();
    }
}
