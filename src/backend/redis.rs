//! Redis cache backend.

use super::CacheBackend;
use crate::config::CacheConfig;
use crate::error::{Error, Result};
use deadpool_redis::redis::{cmd, RedisError};
use deadpool_redis::{Config, Connection, Pool, PoolConfig, Runtime};
use std::time::Duration;

/// Keys fetched per SCAN round during pattern deletion.
const SCAN_BATCH: u64 = 500;

/// Configuration for the Redis backend.
#[derive(Clone, Debug)]
pub struct RedisConfig {
    pub url: String, // e.g. "redis://localhost:6379"
    pub pool_size: usize,
    pub connection_timeout: Duration,
}

impl Default for RedisConfig {
    fn default() -> Self {
        RedisConfig {
            url: "redis://localhost:6379".to_string(),
            pool_size: 10,
            connection_timeout: Duration::from_secs(5),
        }
    }
}

/// Redis backend over a deadpool connection pool.
///
/// # Example
///
/// ```no_run
/// # use cache_mesh::backend::{CacheBackend, RedisBackend, RedisConfig};
/// # async fn example() -> cache_mesh::Result<()> {
/// let backend = RedisBackend::new(RedisConfig::default())?;
/// backend.set("key", b"value".to_vec(), None).await?;
/// let value = backend.get("key").await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct RedisBackend {
    pool: Pool,
}

impl RedisBackend {
    /// Create a backend from configuration.
    ///
    /// # Errors
    /// Returns `Err` if the pool cannot be created.
    pub fn new(config: RedisConfig) -> Result<Self> {
        let mut cfg = Config::from_url(config.url.clone());
        let mut pool_config = PoolConfig::new(config.pool_size.max(1));
        pool_config.timeouts.wait = Some(config.connection_timeout);
        pool_config.timeouts.create = Some(config.connection_timeout);
        cfg.pool = Some(pool_config);

        let pool = cfg
            .create_pool(Some(Runtime::Tokio1))
            .map_err(|e| Error::ConfigError(format!("Failed to create Redis pool: {}", e)))?;

        info!(
            "✓ Redis backend initialized: {} (pool size: {})",
            config.url, config.pool_size
        );
        Ok(RedisBackend { pool })
    }

    /// One backend per address in `config.addrs`, using the pool settings
    /// of the engine configuration.
    pub fn from_config(config: &CacheConfig) -> Result<Vec<(String, Self)>> {
        if config.addrs.is_empty() {
            return Err(Error::ConfigError("No Redis addresses specified".into()));
        }
        config
            .addrs
            .iter()
            .map(|addr| {
                let backend = Self::from_addr(addr, config.pool_size as usize, config.dial_timeout)?;
                Ok((addr.clone(), backend))
            })
            .collect()
    }

    /// Backend for a single `host:port` or `redis://` address.
    pub fn from_addr(addr: &str, pool_size: usize, timeout: Duration) -> Result<Self> {
        let url = if addr.contains("://") {
            addr.to_string()
        } else {
            format!("redis://{}", addr)
        };
        Self::new(RedisConfig {
            url,
            pool_size,
            connection_timeout: timeout,
        })
    }

    async fn conn(&self) -> Result<Connection> {
        self.pool
            .get()
            .await
            .map_err(|e| Error::BackendError(format!("Failed to get Redis connection: {}", e)))
    }
}

fn command_error(op: &str, key: &str, e: RedisError) -> Error {
    Error::BackendError(format!("Redis {} failed for key {}: {}", op, key, e))
}

impl CacheBackend for RedisBackend {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let mut conn = self.conn().await?;
        let value: Option<Vec<u8>> = cmd("GET")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(|e| command_error("GET", key, e))?;

        match &value {
            Some(_) => debug!("✓ Redis GET {} -> HIT", key),
            None => debug!("✓ Redis GET {} -> MISS", key),
        }
        Ok(value)
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> Result<()> {
        let mut conn = self.conn().await?;
        let mut command = cmd("SET");
        command.arg(key).arg(value);
        if let Some(d) = ttl {
            // PX takes whole milliseconds; never send 0.
            command.arg("PX").arg((d.as_millis() as u64).max(1));
        }
        let _: () = command
            .query_async(&mut conn)
            .await
            .map_err(|e| command_error("SET", key, e))?;

        debug!("✓ Redis SET {} (TTL: {:?})", key, ttl);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut conn = self.conn().await?;
        let _: u64 = cmd("DEL")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(|e| command_error("DEL", key, e))?;

        debug!("✓ Redis DELETE {}", key);
        Ok(())
    }

    async fn delete_by_pattern(&self, pattern: &str) -> Result<u64> {
        let mut conn = self.conn().await?;
        let mut cursor: u64 = 0;
        let mut removed = 0;

        loop {
            let (next, keys): (u64, Vec<String>) = cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(pattern)
                .arg("COUNT")
                .arg(SCAN_BATCH)
                .query_async(&mut conn)
                .await
                .map_err(|e| command_error("SCAN", pattern, e))?;

            if !keys.is_empty() {
                let n: u64 = cmd("DEL")
                    .arg(&keys)
                    .query_async(&mut conn)
                    .await
                    .map_err(|e| command_error("DEL", pattern, e))?;
                removed += n;
            }

            cursor = next;
            if cursor == 0 {
                break;
            }
        }

        debug!("✓ Redis DELETE pattern {} ({} keys)", pattern, removed);
        Ok(removed)
    }

    async fn exists(&self, key: &str) -> Result<u64> {
        let mut conn = self.conn().await?;
        cmd("EXISTS")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(|e| command_error("EXISTS", key, e))
    }

    async fn health_check(&self) -> Result<bool> {
        let mut conn = self.conn().await?;
        let pong: String = cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(|e| Error::BackendError(format!("Redis PING failed: {}", e)))?;
        Ok(pong == "PONG")
    }
}
