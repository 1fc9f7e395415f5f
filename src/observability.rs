//! Metrics hooks and TTL resolution.

use std::time::Duration;

/// Metrics sink for cache operations.
///
/// Every method has a no-op default, so implementors override only what
/// they export. Hooks fire only when `enable_metrics` is set on the engine
/// configuration (installing a sink through the builder sets it).
pub trait CacheMetrics: Send + Sync {
    /// Value found, in the local tier or the backend.
    fn record_hit(&self, _key: &str, _duration: Duration) {}

    fn record_miss(&self, _key: &str, _duration: Duration) {}

    fn record_set(&self, _key: &str, _duration: Duration) {}

    fn record_delete(&self, _key: &str, _duration: Duration) {}

    fn record_error(&self, _key: &str, _error: &str) {}

    /// Operation slower than `slow_query_threshold`.
    fn record_slow_query(&self, _operation: &str, _key: &str, _duration: Duration) {}

    /// Call refused by an open breaker.
    fn record_breaker_rejection(&self, _component: &str) {}
}

/// Discards everything.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoOpMetrics;

impl CacheMetrics for NoOpMetrics {}

/// TTL applied when a caller does not pass one.
///
/// # Example
///
/// ```
/// use cache_mesh::observability::TtlPolicy;
/// use std::time::Duration;
///
/// let policy = TtlPolicy::PerPrefix(vec![
///     ("session:".to_string(), Duration::from_secs(60)),
///     ("user:".to_string(), Duration::from_secs(3600)),
/// ]);
/// let default = Duration::from_secs(300);
///
/// assert_eq!(policy.get_ttl("session:9", default), Some(Duration::from_secs(60)));
/// assert_eq!(policy.get_ttl("order:1", default), Some(default));
/// ```
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum TtlPolicy {
    /// The engine's `default_ttl`; zero means no expiry.
    #[default]
    Default,
    /// Same TTL for every key.
    Fixed(Duration),
    /// Never expire.
    Infinite,
    /// First matching logical-key prefix wins; unmatched keys use the default.
    PerPrefix(Vec<(String, Duration)>),
}

impl TtlPolicy {
    /// Resolve the TTL for logical `key`. `None` means no expiry.
    pub fn get_ttl(&self, key: &str, default: Duration) -> Option<Duration> {
        let ttl = match self {
            TtlPolicy::Default => default,
            TtlPolicy::Fixed(ttl) => *ttl,
            TtlPolicy::Infinite => return None,
            TtlPolicy::PerPrefix(rules) => rules
                .iter()
                .find(|(prefix, _)| key.starts_with(prefix.as_str()))
                .map_or(default, |(_, ttl)| *ttl),
        };
        (!ttl.is_zero()).then_some(ttl)
    }
}
