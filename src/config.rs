//! Engine configuration.
//!
//! A [`CacheConfig`] is an immutable snapshot taken once at engine
//! construction. It can be built in code, parsed from JSON, or assembled from
//! `CACHE_MESH_*` environment variables layered over the defaults.

use crate::error::{Error, Result};
use crate::resilience::AdaptiveConfig;
use crate::serialization::SerializationMode;
use crate::strategy::WriteStrategy;
use crate::tier::EvictionPolicy;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;

/// Prefix of every environment variable read by [`CacheConfig::from_env`].
pub const ENV_PREFIX: &str = "CACHE_MESH_";

/// Which replica serves reads when sharding is enabled.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ReadPreference {
    /// Always read from the key's primary owner.
    #[default]
    Primary,
    /// Read from the first replica, falling back to the primary when there is none.
    Replica,
    /// Spread reads uniformly across the key's replica set.
    Any,
}

/// How many replicas must acknowledge a write before it counts as stored.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum WriteConsistency {
    #[default]
    One,
    Quorum,
    All,
}

impl WriteConsistency {
    /// Acknowledgements required out of `replicas` targets.
    pub fn required_acks(&self, replicas: usize) -> usize {
        match self {
            WriteConsistency::One => replicas.min(1),
            WriteConsistency::Quorum => replicas / 2 + 1,
            WriteConsistency::All => replicas,
        }
    }
}

/// Key routing scheme used when sharding is enabled.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
#[non_exhaustive]
pub enum ShardingStrategy {
    /// Weighted consistent hashing with virtual nodes.
    #[default]
    ConsistentHash,
}

/// Configuration snapshot for a [`CacheEngine`](crate::CacheEngine).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Backend endpoints, e.g. `["cache-1:6379", "cache-2:6379"]`.
    pub addrs: Vec<String>,
    pub pool_size: u32,
    pub min_idle_conns: u32,
    #[serde(with = "duration_ms")]
    pub dial_timeout: Duration,
    #[serde(with = "duration_ms")]
    pub read_timeout: Duration,
    #[serde(with = "duration_ms")]
    pub write_timeout: Duration,

    /// Prefix applied to every physical key (`"{namespace}:{key}"`).
    pub namespace: String,
    /// TTL used when the caller omits one.
    #[serde(with = "duration_ms")]
    pub default_ttl: Duration,
    pub max_key_length: usize,
    /// Largest encoded value accepted by `set`, in bytes.
    pub max_entry_size: usize,
    /// Advisory only; this layer never enforces it.
    pub max_memory: Option<u64>,

    pub strategy: WriteStrategy,
    pub eviction_policy: EvictionPolicy,
    /// Entries held by the local front tier; 0 disables the tier.
    pub local_tier_capacity: usize,
    pub write_back_queue_size: usize,

    pub read_preference: ReadPreference,
    pub write_consistency: WriteConsistency,
    pub replication_factor: usize,

    pub compression_enabled: bool,
    pub compression_level: u32,
    pub serialization_mode: SerializationMode,

    pub enable_sharding: bool,
    pub sharding_strategy: ShardingStrategy,
    /// Virtual nodes per unit of node weight.
    pub virtual_nodes: usize,

    pub circuit_breaker_enabled: bool,
    pub failure_threshold: u32,
    pub success_threshold: u32,
    #[serde(with = "duration_ms")]
    pub recovery_timeout: Duration,
    pub half_open_max_requests: u32,
    /// Enables threshold retuning from the rolling failure rate.
    pub adaptive: Option<AdaptiveConfig>,

    #[serde(with = "duration_ms")]
    pub slow_query_threshold: Duration,
    pub enable_metrics: bool,
    pub enable_tracing: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        CacheConfig {
            addrs: vec!["localhost:6379".to_string()],
            pool_size: 10,
            min_idle_conns: 2,
            dial_timeout: Duration::from_secs(5),
            read_timeout: Duration::from_secs(3),
            write_timeout: Duration::from_secs(3),
            namespace: String::new(),
            default_ttl: Duration::from_secs(3600),
            max_key_length: 250,
            max_entry_size: 1024 * 1024,
            max_memory: None,
            strategy: WriteStrategy::WriteThrough,
            eviction_policy: EvictionPolicy::Lru,
            local_tier_capacity: 0,
            write_back_queue_size: 1024,
            read_preference: ReadPreference::Primary,
            write_consistency: WriteConsistency::One,
            replication_factor: 1,
            compression_enabled: false,
            compression_level: 1,
            serialization_mode: SerializationMode::Postcard,
            enable_sharding: false,
            sharding_strategy: ShardingStrategy::ConsistentHash,
            virtual_nodes: 150,
            circuit_breaker_enabled: true,
            failure_threshold: 5,
            success_threshold: 3,
            recovery_timeout: Duration::from_secs(30),
            half_open_max_requests: 3,
            adaptive: None,
            slow_query_threshold: Duration::from_millis(100),
            enable_metrics: false,
            enable_tracing: false,
        }
    }
}

impl CacheConfig {
    /// Parse a JSON document; missing fields take their defaults.
    ///
    /// # Errors
    /// Returns `Error::ConfigError` on malformed JSON or a failed [`validate`](Self::validate).
    pub fn from_json(json: &str) -> Result<Self> {
        let config: CacheConfig = serde_json::from_str(json)
            .map_err(|e| Error::ConfigError(format!("Invalid cache config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults overlaid with `CACHE_MESH_*` environment variables.
    ///
    /// # Errors
    /// Returns `Error::ConfigError` if a variable fails to parse or the
    /// result does not validate.
    pub fn from_env() -> Result<Self> {
        let mut config = CacheConfig::default();
        config.apply_env(|name| std::env::var(name).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Overlay values produced by `lookup`, keyed by full variable name.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |suffix: &str| lookup(&format!("{}{}", ENV_PREFIX, suffix));

        if let Some(addrs) = var("ADDRS") {
            self.addrs = addrs
                .split(',')
                .map(str::trim)
                .filter(|a| !a.is_empty())
                .map(String::from)
                .collect();
        }
        if let Some(v) = var("POOL_SIZE") {
            self.pool_size = parse_env("POOL_SIZE", &v)?;
        }
        if let Some(v) = var("DEFAULT_TTL_MS") {
            self.default_ttl = Duration::from_millis(parse_env("DEFAULT_TTL_MS", &v)?);
        }
        if let Some(v) = var("NAMESPACE") {
            self.namespace = v;
        }
        if let Some(v) = var("STRATEGY") {
            self.strategy = v.parse()?;
        }
        if let Some(v) = var("SHARDING") {
            self.enable_sharding = parse_env("SHARDING", &v)?;
        }
        if let Some(v) = var("VIRTUAL_NODES") {
            self.virtual_nodes = parse_env("VIRTUAL_NODES", &v)?;
        }
        if let Some(v) = var("REPLICATION_FACTOR") {
            self.replication_factor = parse_env("REPLICATION_FACTOR", &v)?;
        }
        if let Some(v) = var("FAILURE_THRESHOLD") {
            self.failure_threshold = parse_env("FAILURE_THRESHOLD", &v)?;
        }
        if let Some(v) = var("RECOVERY_TIMEOUT_MS") {
            self.recovery_timeout = Duration::from_millis(parse_env("RECOVERY_TIMEOUT_MS", &v)?);
        }
        Ok(())
    }

    /// Check cross-field constraints.
    ///
    /// # Errors
    /// Returns `Error::ConfigError` describing the first violated constraint.
    pub fn validate(&self) -> Result<()> {
        if self.max_key_length == 0 {
            return Err(Error::ConfigError("max_key_length must be > 0".into()));
        }
        if self.max_entry_size == 0 {
            return Err(Error::ConfigError("max_entry_size must be > 0".into()));
        }
        if self.enable_sharding && self.virtual_nodes == 0 {
            return Err(Error::ConfigError(
                "virtual_nodes must be > 0 when sharding is enabled".into(),
            ));
        }
        if self.replication_factor == 0 {
            return Err(Error::ConfigError("replication_factor must be >= 1".into()));
        }
        if self.strategy == WriteStrategy::WriteBack {
            if self.local_tier_capacity == 0 {
                return Err(Error::ConfigError(
                    "write-back requires a local tier (local_tier_capacity > 0)".into(),
                ));
            }
            if self.write_back_queue_size == 0 {
                return Err(Error::ConfigError(
                    "write_back_queue_size must be > 0".into(),
                ));
            }
        }
        if self.circuit_breaker_enabled {
            if self.failure_threshold == 0
                || self.success_threshold == 0
                || self.half_open_max_requests == 0
            {
                return Err(Error::ConfigError(
                    "circuit breaker thresholds must be > 0".into(),
                ));
            }
            if let Some(adaptive) = &self.adaptive {
                adaptive.validate()?;
            }
        }
        Ok(())
    }
}

fn parse_env<T: FromStr>(name: &str, value: &str) -> Result<T> {
    value.trim().parse().map_err(|_| {
        Error::ConfigError(format!(
            "Invalid value for {}{}: {:?}",
            ENV_PREFIX, name, value
        ))
    })
}

/// Serde adapter storing a `Duration` as integer milliseconds.
pub(crate) mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}
