//! Call counting and fault injection around another backend.

use super::CacheBackend;
use crate::error::{Error, Result};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Default)]
struct Controls {
    calls: AtomicU64,
    failing: AtomicBool,
    latency_ms: AtomicU64,
}

/// Wraps a backend, counting every call and optionally failing or slowing
/// them down. Clones share the same counters and switches.
///
/// Handy for exercising breaker and slow-query behavior without a real
/// outage.
///
/// ```
/// # use cache_mesh::backend::{CacheBackend, InMemoryBackend, InstrumentedBackend};
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let backend = InstrumentedBackend::new(InMemoryBackend::new());
/// backend.set_failing(true);
/// assert!(backend.get("k").await.is_err());
/// assert_eq!(backend.calls(), 1);
/// # }
/// ```
#[derive(Clone, Debug)]
pub struct InstrumentedBackend<B> {
    inner: B,
    controls: Arc<Controls>,
}

impl<B: CacheBackend> InstrumentedBackend<B> {
    pub fn new(inner: B) -> Self {
        InstrumentedBackend {
            inner,
            controls: Arc::new(Controls::default()),
        }
    }

    pub fn inner(&self) -> &B {
        &self.inner
    }

    /// Backend calls made so far, failed ones included.
    pub fn calls(&self) -> u64 {
        self.controls.calls.load(Ordering::SeqCst)
    }

    pub fn reset_calls(&self) {
        self.controls.calls.store(0, Ordering::SeqCst);
    }

    /// Make every subsequent call fail with a backend error.
    pub fn set_failing(&self, failing: bool) {
        self.controls.failing.store(failing, Ordering::SeqCst);
    }

    /// Delay applied before every subsequent call.
    pub fn set_latency(&self, latency: Duration) {
        self.controls
            .latency_ms
            .store(latency.as_millis() as u64, Ordering::SeqCst);
    }

    async fn enter(&self, op: &str, key: &str) -> Result<()> {
        self.controls.calls.fetch_add(1, Ordering::SeqCst);
        let latency = self.controls.latency_ms.load(Ordering::SeqCst);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }
        if self.controls.failing.load(Ordering::SeqCst) {
            return Err(Error::BackendError(format!(
                "Injected failure on {} {}",
                op, key
            )));
        }
        Ok(())
    }
}

impl<B: CacheBackend> CacheBackend for InstrumentedBackend<B> {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        self.enter("GET", key).await?;
        self.inner.get(key).await
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> Result<()> {
        self.enter("SET", key).await?;
        self.inner.set(key, value, ttl).await
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.enter("DELETE", key).await?;
        self.inner.delete(key).await
    }

    async fn delete_by_pattern(&self, pattern: &str) -> Result<u64> {
        self.enter("DELETE pattern", pattern).await?;
        self.inner.delete_by_pattern(pattern).await
    }

    async fn exists(&self, key: &str) -> Result<u64> {
        self.enter("EXISTS", key).await?;
        self.inner.exists(key).await
    }

    async fn health_check(&self) -> Result<bool> {
        self.enter("PING", "").await?;
        self.inner.health_check().await
    }
}

#[cfg(all(test, feature = "inmemory"))]
mod tests {
    use super::*;
    use crate::backend::InMemoryBackend;

    #[tokio::test]
    async fn test_counts_and_fails() {
        let backend = InstrumentedBackend::new(InMemoryBackend::new());
        backend.set("k", vec![1], None).await.unwrap();
        assert_eq!(backend.get("k").await.unwrap(), Some(vec![1]));
        assert_eq!(backend.calls(), 2);

        let shared = backend.clone();
        shared.set_failing(true);
        assert!(backend.get("k").await.unwrap_err().is_backend());
        assert_eq!(backend.calls(), 3);

        shared.set_failing(false);
        backend.reset_calls();
        assert!(backend.health_check().await.unwrap());
        assert_eq!(backend.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_latency_is_applied() {
        let backend = InstrumentedBackend::new(InMemoryBackend::new());
        backend.set_latency(Duration::from_millis(250));

        let started = tokio::time::Instant::now();
        backend.exists("k").await.unwrap();
        assert!(started.elapsed() >= Duration::from_millis(250));
    }
}
