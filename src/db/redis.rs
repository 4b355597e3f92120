use core::fmt;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use tracing::instrument;

use crate::session::cache::{CacheErr, CacheResult, KeyTtl, SessionCache};

const SCAN_BATCH: usize = 200;

/// Redis-backed [`SessionCache`]. Every command is bounded by `op_timeout`.
#[derive(Clone)]
pub struct RedisCache {
    manager: ConnectionManager,
    op_timeout: Duration,
}

impl fmt::Debug for RedisCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisCache")
            .field("manager", &"ConnectionManager")
            .field("op_timeout", &self.op_timeout)
            .finish()
    }
}

impl RedisCache {
    /// Connects and pings within `op_timeout`; an unreachable server is an error, not a hang.
    #[instrument(skip(redis_url))]
    pub async fn connect(redis_url: &str, op_timeout: Duration) -> CacheResult<Self> {
        let client = redis::Client::open(redis_url)?;
        let manager = tokio::time::timeout(op_timeout, ConnectionManager::new(client))
            .await
            .map_err(|_| CacheErr::Timeout(op_timeout))??;

        let cache = Self {
            manager,
            op_timeout,
        };
        cache.ping().await?;

        tracing::debug!("connected to redis");
        Ok(cache)
    }

    async fn run<T>(&self, cmd: &redis::Cmd) -> CacheResult<T>
    where
        T: redis::FromRedisValue,
    {
        let mut conn = self.manager.clone();
        let reply = tokio::time::timeout(self.op_timeout, cmd.query_async(&mut conn))
            .await
            .map_err(|_| CacheErr::Timeout(self.op_timeout))?;

        reply.map_err(|e| {
            tracing::warn!(error = ?e, "redis command failed");
            CacheErr::from(e)
        })
    }
}

fn millis(ttl: Duration) -> u64 {
    u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1)
}

#[async_trait]
impl SessionCache for RedisCache {
    async fn ping(&self) -> CacheResult<()> {
        let _: String = self.run(&redis::cmd("PING")).await?;
        Ok(())
    }

    async fn get(&self, key: &str) -> CacheResult<Option<String>> {
        self.run(redis::cmd("GET").arg(key)).await
    }

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> CacheResult<()> {
        let _: () = self
            .run(redis::cmd("SET").arg(key).arg(value).arg("PX").arg(millis(ttl)))
            .await?;
        Ok(())
    }

    async fn ttl(&self, key: &str) -> CacheResult<KeyTtl> {
        let remaining: i64 = self.run(redis::cmd("PTTL").arg(key)).await?;
        Ok(match remaining {
            -1 => KeyTtl::Persistent,
            ms if ms < 0 => KeyTtl::Missing,
            ms => KeyTtl::Expires(Duration::from_millis(ms as u64)),
        })
    }

    async fn expire(&self, key: &str, ttl: Duration) -> CacheResult<bool> {
        let updated: i64 = self
            .run(redis::cmd("PEXPIRE").arg(key).arg(millis(ttl)))
            .await?;
        Ok(updated == 1)
    }

    async fn delete(&self, key: &str) -> CacheResult<bool> {
        let removed: i64 = self.run(redis::cmd("DEL").arg(key)).await?;
        Ok(removed == 1)
    }

    #[instrument(skip(self))]
    async fn scan_prefix(&self, prefix: &str) -> CacheResult<Vec<String>> {
        let pattern = format!("{prefix}*");
        let mut cursor: u64 = 0;
        let mut keys = Vec::new();

        loop {
            let (next, batch): (u64, Vec<String>) = self
                .run(
                    redis::cmd("SCAN")
                        .arg(cursor)
                        .arg("MATCH")
                        .arg(&pattern)
                        .arg("COUNT")
                        .arg(SCAN_BATCH),
                )
                .await?;

            keys.extend(batch);
            if next == 0 {
                break;
            }
            cursor = next;
        }

        // SCAN may return a key more than once
        keys.sort_unstable();
        keys.dedup();
        Ok(keys)
    }
}
