//! Redis-backed config store.

use async_trait::async_trait;
use serde_json::Value;
use tenant_router_core::{ConfigStore, RouterError};
use tracing::debug;

use crate::{RedisConfig, RedisError, RedisPool, RedisPoolBuilder};

/// Keys requested per SCAN round trip.
const SCAN_COUNT: usize = 100;

type StoreResult<T> = std::result::Result<T, RouterError>;

/// Config store over a pooled Redis connection.
///
/// Values are stored as JSON strings. Key patterns are translated to
/// Redis MATCH globs, so only `*` and `?` keep their wildcard meaning.
#[derive(Clone)]
pub struct RedisConfigStore {
    pool: RedisPool,
}

impl RedisConfigStore {
    /// Wrap an existing pool.
    pub fn new(pool: RedisPool) -> Self {
        Self { pool }
    }

    /// Build a pool from `config` and wrap it.
    pub async fn connect(config: RedisConfig) -> crate::Result<Self> {
        let pool = RedisPoolBuilder::new(config).build().await?;
        Ok(Self::new(pool))
    }

    /// The underlying pool.
    pub fn pool(&self) -> &RedisPool {
        &self.pool
    }
}

/// Escape Redis glob metacharacters other than `*` and `?`.
pub(crate) fn match_pattern(pattern: &str) -> String {
    let mut out = String::with_capacity(pattern.len());
    for c in pattern.chars() {
        if matches!(c, '[' | ']' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

#[async_trait]
impl ConfigStore for RedisConfigStore {
    async fn get(&self, key: &str) -> StoreResult<Option<Value>> {
        let mut conn = self.pool.get().await.map_err(RedisError::from)?;
        let raw: Option<String> = redis::cmd("GET")
            .arg(key)
            .query_async(&mut *conn)
            .await
            .map_err(RedisError::from)?;

        match raw {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: Value) -> StoreResult<()> {
        let encoded = serde_json::to_string(&value)?;
        let mut conn = self.pool.get().await.map_err(RedisError::from)?;
        let _: () = redis::cmd("SET")
            .arg(key)
            .arg(encoded)
            .query_async(&mut *conn)
            .await
            .map_err(RedisError::from)?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> StoreResult<bool> {
        let mut conn = self.pool.get().await.map_err(RedisError::from)?;
        let removed: u32 = redis::cmd("DEL")
            .arg(key)
            .query_async(&mut *conn)
            .await
            .map_err(RedisError::from)?;
        Ok(removed > 0)
    }

    async fn clear(&self) -> StoreResult<()> {
        let mut conn = self.pool.get().await.map_err(RedisError::from)?;
        let _: () = redis::cmd("FLUSHDB")
            .query_async(&mut *conn)
            .await
            .map_err(RedisError::from)?;
        debug!("Redis config store flushed");
        Ok(())
    }

    async fn iter_keys(&self, pattern: &str) -> StoreResult<Vec<String>> {
        let pattern = match_pattern(pattern);
        let mut conn = self.pool.get().await.map_err(RedisError::from)?;
        let mut keys = Vec::new();
        let mut cursor: u64 = 0;

        loop {
            let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(SCAN_COUNT)
                .query_async(&mut *conn)
                .await
                .map_err(RedisError::from)?;
            keys.extend(batch);
            if next == 0 {
                break;
            }
            cursor = next;
        }

        // SCAN may return a key more than once
        keys.sort();
        keys.dedup();
        Ok(keys)
    }
}
