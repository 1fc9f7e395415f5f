//! In-memory cache backend.

use super::CacheBackend;
use crate::error::Result;
use crate::key::matches_pattern;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Clone, Debug)]
struct StoredValue {
    data: Vec<u8>,
    expires_at: Option<Instant>,
}

impl StoredValue {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| now >= at)
    }
}

/// Process-local store with per-entry expiry.
///
/// Clones share the same underlying map, so one instance can be handed to
/// an engine while tests keep a handle for inspection.
///
/// # Example
///
/// ```
/// # use cache_mesh::backend::{CacheBackend, InMemoryBackend};
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() -> cache_mesh::Result<()> {
/// let backend = InMemoryBackend::new();
/// backend.set("key", b"value".to_vec(), None).await?;
/// assert_eq!(backend.get("key").await?, Some(b"value".to_vec()));
/// # Ok(())
/// # }
/// ```
#[derive(Clone, Debug, Default)]
pub struct InMemoryBackend {
    store: Arc<DashMap<String, StoredValue>>,
}

impl InMemoryBackend {
    pub fn new() -> Self {
        InMemoryBackend::default()
    }

    /// Live (unexpired) entries.
    pub async fn len(&self) -> usize {
        let now = Instant::now();
        self.store.iter().filter(|e| !e.is_expired(now)).count()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Physical keys currently stored, expired ones excluded.
    pub fn keys(&self) -> Vec<String> {
        let now = Instant::now();
        self.store
            .iter()
            .filter(|e| !e.is_expired(now))
            .map(|e| e.key().clone())
            .collect()
    }

    pub async fn clear_all(&self) -> Result<()> {
        self.store.clear();
        warn!("⚠ In-memory backend cleared");
        Ok(())
    }

    fn purge_expired(&self) {
        let now = Instant::now();
        self.store.retain(|_, v| !v.is_expired(now));
    }
}

impl CacheBackend for InMemoryBackend {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let now = Instant::now();
        let hit = match self.store.get(key) {
            Some(entry) if !entry.is_expired(now) => Some(entry.data.clone()),
            Some(_) => None,
            None => {
                debug!("✓ InMemory GET {} -> MISS", key);
                return Ok(None);
            }
        };

        match hit {
            Some(data) => {
                debug!("✓ InMemory GET {} -> HIT", key);
                Ok(Some(data))
            }
            None => {
                // Expired: drop it unless a writer replaced it meanwhile.
                self.store.remove_if(key, |_, v| v.is_expired(now));
                debug!("✓ InMemory GET {} -> EXPIRED", key);
                Ok(None)
            }
        }
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> Result<()> {
        let expires_at = ttl.and_then(|d| Instant::now().checked_add(d));
        self.store.insert(
            key.to_string(),
            StoredValue {
                data: value,
                expires_at,
            },
        );
        debug!("✓ InMemory SET {} (TTL: {:?})", key, ttl);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.store.remove(key);
        debug!("✓ InMemory DELETE {}", key);
        Ok(())
    }

    async fn delete_by_pattern(&self, pattern: &str) -> Result<u64> {
        self.purge_expired();
        let doomed: Vec<String> = self
            .store
            .iter()
            .filter(|e| matches_pattern(pattern, e.key()))
            .map(|e| e.key().clone())
            .collect();

        let mut removed = 0;
        for key in doomed {
            if self.store.remove(&key).is_some() {
                removed += 1;
            }
        }
        debug!("✓ InMemory DELETE pattern {} ({} keys)", pattern, removed);
        Ok(removed)
    }

    async fn exists(&self, key: &str) -> Result<u64> {
        let now = Instant::now();
        Ok(match self.store.get(key) {
            Some(entry) if !entry.is_expired(now) => 1,
            _ => 0,
        })
    }

    async fn health_check(&self) -> Result<bool> {
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_set_get_delete() {
        let backend = InMemoryBackend::new();
        backend.set("k", b"v".to_vec(), None).await.unwrap();
        assert_eq!(backend.get("k").await.unwrap(), Some(b"v".to_vec()));
        assert_eq!(backend.exists("k").await.unwrap(), 1);

        backend.delete("k").await.unwrap();
        assert_eq!(backend.get("k").await.unwrap(), None);
        assert_eq!(backend.exists("k").await.unwrap(), 0);
        // Deleting again is fine.
        backend.delete("k").await.unwrap();
    }

    #[tokio::test]
    async fn test_ttl_expiry() {
        let backend = InMemoryBackend::new();
        backend
            .set("short", b"v".to_vec(), Some(Duration::from_millis(20)))
            .await
            .unwrap();
        assert!(backend.get("short").await.unwrap().is_some());

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(backend.get("short").await.unwrap().is_none());
        assert_eq!(backend.exists("short").await.unwrap(), 0);
        assert_eq!(backend.len().await, 0);
    }

    #[tokio::test]
    async fn test_delete_by_pattern() {
        let backend = InMemoryBackend::new();
        for key in ["a:user:1", "a:user:2", "a:order:1", "b:user:1"] {
            backend.set(key, vec![1], None).await.unwrap();
        }

        assert_eq!(backend.delete_by_pattern("a:user:*").await.unwrap(), 2);
        let mut left = backend.keys();
        left.sort();
        assert_eq!(left, vec!["a:order:1", "b:user:1"]);
    }

    #[tokio::test]
    async fn test_clones_share_state() {
        let backend = InMemoryBackend::new();
        let other = backend.clone();
        backend.set("shared", vec![9], None).await.unwrap();
        assert_eq!(other.get("shared").await.unwrap(), Some(vec![9]));

        other.clear_all().await.unwrap();
        assert!(backend.is_empty().await);
    }
}
