//! Backing-store implementations.
//!
//! The engine talks to every store through [`CacheBackend`]. A backend sees
//! only physical (namespaced) keys and already-encoded bytes.

use crate::error::Result;
use std::future::Future;
use std::time::Duration;

#[cfg(feature = "inmemory")]
pub mod inmemory;
pub mod instrumented;

#[cfg(feature = "redis")]
pub mod redis;

#[cfg(feature = "inmemory")]
pub use inmemory::InMemoryBackend;
pub use instrumented::InstrumentedBackend;

#[cfg(feature = "redis")]
pub use self::redis::{RedisBackend, RedisConfig};

/// Remote key/value store consumed by the cache engine.
///
/// Implementations map their native failures into
/// [`Error::BackendError`](crate::Error::BackendError). A miss is `Ok(None)`,
/// never an error.
pub trait CacheBackend: Send + Sync + 'static {
    /// Fetch raw bytes; `Ok(None)` on a miss or an expired entry.
    fn get(&self, key: &str) -> impl Future<Output = Result<Option<Vec<u8>>>> + Send;

    /// Store bytes, expiring after `ttl` when given.
    fn set(
        &self,
        key: &str,
        value: Vec<u8>,
        ttl: Option<Duration>,
    ) -> impl Future<Output = Result<()>> + Send;

    /// Remove a key. Deleting a missing key succeeds.
    fn delete(&self, key: &str) -> impl Future<Output = Result<()>> + Send;

    /// Remove every key matching a glob pattern; returns how many went.
    ///
    /// Not atomic with respect to concurrent writers.
    fn delete_by_pattern(&self, pattern: &str) -> impl Future<Output = Result<u64>> + Send;

    /// Number of the given key present (0 or 1).
    fn exists(&self, key: &str) -> impl Future<Output = Result<u64>> + Send;

    /// Cheap liveness probe.
    fn health_check(&self) -> impl Future<Output = Result<bool>> + Send;
}
