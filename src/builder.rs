//! Builder for cache engines.

use crate::backend::CacheBackend;
use crate::config::CacheConfig;
use crate::engine::{check_weight, CacheEngine, EngineCore, NodeTable};
use crate::error::{Error, Result};
use crate::key::CacheKeyBuilder;
use crate::observability::{CacheMetrics, NoOpMetrics, TtlPolicy};
use crate::resilience::{AdaptiveCircuitBreaker, Breaker, CircuitBreaker, CircuitBreakerConfig};
use crate::ring::{HashRing, NodeId};
use crate::serialization::ValueCodec;
use crate::tier::LocalTier;
use parking_lot::RwLock;
use std::sync::Arc;
use tokio::runtime::Handle;

/// Component name reported by the engine's breaker.
const BREAKER_NAME: &str = "cache-backend";

/// Fluent builder for a [`CacheEngine`] over one or more named backends.
///
/// # Example
///
/// ```
/// use cache_mesh::backend::InMemoryBackend;
/// use cache_mesh::observability::TtlPolicy;
/// use cache_mesh::{CacheConfig, CacheEngineBuilder};
/// use std::time::Duration;
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() -> cache_mesh::Result<()> {
/// let config = CacheConfig {
///     enable_sharding: true,
///     replication_factor: 2,
///     ..Default::default()
/// };
///
/// let engine = CacheEngineBuilder::new(config)
///     .node("cache-1", InMemoryBackend::new())
///     .node("cache-2", InMemoryBackend::new())
///     .weighted_node("cache-big", InMemoryBackend::new(), 2)
///     .ttl_policy(TtlPolicy::Fixed(Duration::from_secs(300)))
///     .build()?;
///
/// assert_eq!(engine.nodes().len(), 3);
/// # Ok(())
/// # }
/// ```
pub struct CacheEngineBuilder<B: CacheBackend> {
    config: CacheConfig,
    nodes: Vec<(String, B, u32)>,
    metrics: Option<Box<dyn CacheMetrics>>,
    ttl_policy: TtlPolicy,
}

impl<B: CacheBackend> CacheEngineBuilder<B> {
    pub fn new(config: CacheConfig) -> Self {
        CacheEngineBuilder {
            config,
            nodes: Vec::new(),
            metrics: None,
            ttl_policy: TtlPolicy::default(),
        }
    }

    /// Add a backend with weight 1.
    pub fn node(self, name: impl Into<String>, backend: B) -> Self {
        self.weighted_node(name, backend, 1)
    }

    /// Add a backend owning `weight` times the base virtual-node count.
    pub fn weighted_node(mut self, name: impl Into<String>, backend: B, weight: u32) -> Self {
        self.nodes.push((name.into(), backend, weight));
        self
    }

    /// Install a metrics sink. Turns on `enable_metrics`.
    pub fn metrics(mut self, metrics: impl CacheMetrics + 'static) -> Self {
        self.metrics = Some(Box::new(metrics));
        self.config.enable_metrics = true;
        self
    }

    /// TTL used when callers pass `None`.
    pub fn ttl_policy(mut self, policy: TtlPolicy) -> Self {
        self.ttl_policy = policy;
        self
    }

    /// Validate the configuration and start the engine.
    ///
    /// # Errors
    ///
    /// - `Error::ConfigError`: invalid configuration, duplicate node names,
    ///   or a write-back / adaptive setup outside a Tokio runtime
    /// - `Error::NoNodes`: no backend was added
    pub fn build(self) -> Result<CacheEngine<B>> {
        let CacheEngineBuilder {
            config,
            nodes,
            metrics,
            ttl_policy,
        } = self;

        config.validate()?;
        if nodes.is_empty() {
            return Err(Error::NoNodes);
        }

        let needs_runtime = !config.strategy.is_synchronous()
            || (config.circuit_breaker_enabled && config.adaptive.is_some());
        let runtime = Handle::try_current().ok();
        if needs_runtime && runtime.is_none() {
            return Err(Error::ConfigError(
                "write-back and adaptive breakers require a Tokio runtime".into(),
            ));
        }

        let ring = HashRing::new(config.virtual_nodes);
        let mut table = NodeTable::new();
        for (name, backend, weight) in nodes {
            check_weight(&name, weight)?;
            if !table.insert(NodeId::from(name.as_str()), backend) {
                return Err(Error::ConfigError(format!(
                    "Node {} registered twice",
                    name
                )));
            }
            ring.add(&name, weight);
        }

        let mut tasks = Vec::new();
        let breaker: Option<Arc<dyn Breaker>> = if config.circuit_breaker_enabled {
            let breaker_config = CircuitBreakerConfig {
                failure_threshold: config.failure_threshold,
                success_threshold: config.success_threshold,
                recovery_timeout: config.recovery_timeout,
                half_open_max_requests: config.half_open_max_requests,
            };
            match (&config.adaptive, &runtime) {
                (Some(adaptive), Some(_)) => {
                    let breaker = Arc::new(AdaptiveCircuitBreaker::new(
                        BREAKER_NAME,
                        breaker_config,
                        adaptive.clone(),
                    ));
                    tasks.push(breaker.spawn_tuner());
                    Some(breaker as Arc<dyn Breaker>)
                }
                _ => Some(Arc::new(CircuitBreaker::new(BREAKER_NAME, breaker_config)) as Arc<dyn Breaker>),
            }
        } else {
            None
        };

        let tier = (config.local_tier_capacity > 0)
            .then(|| LocalTier::new(config.local_tier_capacity, config.eviction_policy));

        let core = EngineCore {
            keys: CacheKeyBuilder::new(config.namespace.clone(), config.max_key_length),
            codec: ValueCodec::new(config.serialization_mode, config.compression_enabled),
            nodes: RwLock::new(table),
            ring,
            breaker,
            tier,
            metrics: metrics.unwrap_or_else(|| Box::new(NoOpMetrics)),
            ttl_policy,
            config,
        };
        CacheEngine::start(core, tasks)
    }
}
