//! Cache engine: validation, namespacing, routing and failure isolation.
//!
//! Every operation follows the same pipeline:
//!
//! ```text
//! logical key ──validate──► namespaced key ──ring──► replica set
//!                                                       │
//!                               breaker.allow() ◄───────┘
//!                                     │
//!                          backend call(s) ──► record_success / record_failure
//! ```
//!
//! Validation failures never reach the breaker. Breaker rejections never
//! reach a backend. A call that is cancelled or dropped mid-flight gives its
//! breaker slot back without counting as success or failure.

use crate::backend::CacheBackend;
use crate::config::{CacheConfig, ReadPreference};
use crate::error::{Error, Result};
use crate::key::CacheKeyBuilder;
use crate::observability::{CacheMetrics, TtlPolicy};
use crate::resilience::{Breaker, BreakerStats, CircuitState, StateTransition};
use crate::ring::{HashRing, NodeId, RebalanceMove, MAX_NODE_WEIGHT, REBALANCE_SAMPLES};
use crate::serialization::ValueCodec;
use crate::strategy::WriteStrategy;
use crate::tier::LocalTier;
use futures::future::join_all;
use parking_lot::RwLock;
use rand::Rng;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::future::Future;
use std::ops::Range;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::runtime::Handle;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;

/// Registered backends, in insertion order.
pub(crate) struct NodeTable<B> {
    order: Vec<NodeId>,
    backends: HashMap<NodeId, Arc<B>>,
}

impl<B> NodeTable<B> {
    pub(crate) fn new() -> Self {
        NodeTable {
            order: Vec::new(),
            backends: HashMap::new(),
        }
    }

    pub(crate) fn insert(&mut self, id: NodeId, backend: B) -> bool {
        if self.backends.contains_key(&id) {
            return false;
        }
        self.order.push(id.clone());
        self.backends.insert(id, Arc::new(backend));
        true
    }

    fn remove(&mut self, id: &str) -> bool {
        if self.backends.remove(id).is_none() {
            return false;
        }
        self.order.retain(|n| n.as_ref() != id);
        true
    }

    fn all(&self) -> Vec<(NodeId, Arc<B>)> {
        self.order
            .iter()
            .filter_map(|id| self.backends.get(id).map(|b| (id.clone(), Arc::clone(b))))
            .collect()
    }
}

enum WriteBackOp {
    Set {
        key: String,
        value: Vec<u8>,
        ttl: Option<Duration>,
    },
    Flush(oneshot::Sender<()>),
}

/// A breaker admission that must be settled exactly once.
///
/// Dropping an unsettled permit (cancellation, panic, early return) releases
/// the half-open trial slot.
struct Permit<'a> {
    breaker: Option<&'a dyn Breaker>,
    generation: u64,
    settled: bool,
}

impl Permit<'_> {
    fn success(mut self) {
        if let Some(breaker) = self.breaker {
            breaker.record_success();
        }
        self.settled = true;
    }

    fn failure(mut self) {
        if let Some(breaker) = self.breaker {
            breaker.record_failure();
        }
        self.settled = true;
    }
}

impl Drop for Permit<'_> {
    fn drop(&mut self) {
        if !self.settled {
            if let Some(breaker) = self.breaker {
                breaker.release_trial(self.generation);
            }
        }
    }
}

/// State shared between the engine handle and its background tasks.
pub(crate) struct EngineCore<B> {
    pub(crate) config: CacheConfig,
    pub(crate) keys: CacheKeyBuilder,
    pub(crate) codec: ValueCodec,
    pub(crate) nodes: RwLock<NodeTable<B>>,
    pub(crate) ring: HashRing,
    pub(crate) breaker: Option<Arc<dyn Breaker>>,
    pub(crate) tier: Option<LocalTier>,
    pub(crate) metrics: Box<dyn CacheMetrics>,
    pub(crate) ttl_policy: TtlPolicy,
}

impl<B: CacheBackend> EngineCore<B> {
    fn metrics(&self) -> Option<&dyn CacheMetrics> {
        self.config.enable_metrics.then_some(&*self.metrics)
    }

    fn resolve_ttl(&self, key: &str, ttl: Option<Duration>) -> Option<Duration> {
        match ttl {
            Some(ttl) if ttl.is_zero() => None,
            Some(ttl) => Some(ttl),
            None => self.ttl_policy.get_ttl(key, self.config.default_ttl),
        }
    }

    /// Replica set for `physical`, primary first.
    fn replicas(&self, physical: &str) -> Result<Vec<(NodeId, Arc<B>)>> {
        // Lock order: node table, then ring.
        let table = self.nodes.read();
        let ids = if self.config.enable_sharding {
            self.ring
                .get_multiple(physical, self.config.replication_factor)
        } else {
            table.order.first().cloned().into_iter().collect()
        };

        let targets: Vec<_> = ids
            .into_iter()
            .filter_map(|id| table.backends.get(&id).map(|b| (id.clone(), Arc::clone(b))))
            .collect();
        if targets.is_empty() {
            return Err(Error::NoNodes);
        }
        Ok(targets)
    }

    /// Positions in a replica set of `len` that reads may be routed to.
    fn readable(&self, len: usize) -> Range<usize> {
        match self.config.read_preference {
            ReadPreference::Primary => 0..1,
            ReadPreference::Replica => {
                let i = usize::from(len > 1);
                i..i + 1
            }
            ReadPreference::Any => 0..len,
        }
    }

    fn read_target(&self, physical: &str) -> Result<(NodeId, Arc<B>)> {
        let mut replicas = self.replicas(physical)?;
        let readable = self.readable(replicas.len());
        let index = rand::rng().random_range(readable);
        Ok(replicas.swap_remove(index))
    }

    fn all_nodes(&self) -> Result<Vec<(NodeId, Arc<B>)>> {
        let nodes = self.nodes.read().all();
        if nodes.is_empty() {
            return Err(Error::NoNodes);
        }
        Ok(nodes)
    }

    fn admit(&self) -> Result<Permit<'_>> {
        let Some(breaker) = self.breaker.as_deref() else {
            return Ok(Permit {
                breaker: None,
                generation: 0,
                settled: false,
            });
        };
        let Some(generation) = breaker.acquire() else {
            debug!("Cache breaker {} rejected call", breaker.name());
            if let Some(metrics) = self.metrics() {
                metrics.record_breaker_rejection(breaker.name());
            }
            return Err(Error::CircuitOpen {
                component: breaker.name().to_string(),
            });
        };
        Ok(Permit {
            breaker: Some(breaker),
            generation,
            settled: false,
        })
    }

    fn observe(&self, op: &str, key: &str, node: &str, elapsed: Duration) {
        if self.config.enable_tracing {
            trace!("{} {} on {} in {:?}", op, key, node, elapsed);
        }
        let threshold = self.config.slow_query_threshold;
        if !threshold.is_zero() && elapsed >= threshold {
            warn!(
                "⚠ Slow cache {} for {} on {}: {:?} (threshold {:?})",
                op, key, node, elapsed, threshold
            );
            if let Some(metrics) = self.metrics() {
                metrics.record_slow_query(op, key, elapsed);
            }
        }
    }

    async fn fetch(&self, physical: &str) -> Result<Option<Vec<u8>>> {
        let (node, backend) = self.read_target(physical)?;
        let permit = self.admit()?;
        let started = Instant::now();
        let result = backend.get(physical).await;
        self.observe("GET", physical, &node, started.elapsed());

        match result {
            Ok(Some(bytes)) => {
                permit.success();
                Ok(Some(bytes))
            }
            // A miss says nothing about backend health; the permit is released.
            Ok(None) => Ok(None),
            Err(e) => {
                permit.failure();
                Err(e)
            }
        }
    }

    async fn store(&self, physical: &str, bytes: Vec<u8>, ttl: Option<Duration>) -> Result<()> {
        let replicas = self.replicas(physical)?;
        let required = self
            .config
            .write_consistency
            .required_acks(replicas.len())
            .max(1);
        let permit = self.admit()?;
        let started = Instant::now();
        let results = join_all(
            replicas
                .iter()
                .map(|(_, backend)| backend.set(physical, bytes.clone(), ttl)),
        )
        .await;
        self.observe("SET", physical, &replicas[0].0, started.elapsed());

        // Replicas that serve reads must hold the new value whatever the consistency level.
        let readable = self.readable(replicas.len());
        settle(permit, tally(results, required, readable, "SET", physical)).map(|_| ())
    }

    /// Delete from every replica; any failure leaves a readable copy behind
    /// and is reported.
    async fn remove(&self, physical: &str) -> Result<()> {
        let replicas = self.replicas(physical)?;
        let permit = self.admit()?;
        let started = Instant::now();
        let results = join_all(replicas.iter().map(|(_, backend)| backend.delete(physical))).await;
        self.observe("DELETE", physical, &replicas[0].0, started.elapsed());

        let total = replicas.len();
        settle(permit, tally(results, total, 0..total, "DELETE", physical)).map(|_| ())
    }

    async fn remove_matching(&self, pattern: &str) -> Result<u64> {
        let nodes = self.all_nodes()?;
        let permit = self.admit()?;
        let started = Instant::now();
        let results = join_all(
            nodes
                .iter()
                .map(|(_, backend)| backend.delete_by_pattern(pattern)),
        )
        .await;
        self.observe("CLEAR", pattern, "*", started.elapsed());

        let total = nodes.len();
        let removed = settle(permit, tally(results, total, 0..total, "CLEAR", pattern))?;
        Ok(removed.into_iter().sum())
    }

    async fn count(&self, physical: &str) -> Result<u64> {
        let (node, backend) = self.read_target(physical)?;
        let permit = self.admit()?;
        let started = Instant::now();
        let result = backend.exists(physical).await;
        self.observe("EXISTS", physical, &node, started.elapsed());
        settle(permit, result)
    }
}

/// Collect replica results, succeeding if at least `required` acknowledged
/// and no replica in `critical` failed.
fn tally<T>(
    results: Vec<Result<T>>,
    required: usize,
    critical: Range<usize>,
    op: &str,
    key: &str,
) -> Result<Vec<T>> {
    let total = results.len();
    let mut acks = Vec::with_capacity(total);
    let mut first_error = None;
    let mut critical_error = None;
    for (i, result) in results.into_iter().enumerate() {
        match result {
            Ok(value) => acks.push(value),
            Err(e) if critical.contains(&i) => {
                critical_error.get_or_insert(e);
            }
            Err(e) => {
                first_error.get_or_insert(e);
            }
        }
    }

    if let Some(e) = critical_error {
        warn!(
            "⚠ {} {}: a replica serving reads failed, {}/{} acknowledged",
            op,
            key,
            acks.len(),
            total
        );
        return Err(e);
    }
    if acks.len() >= required {
        if let Some(e) = first_error {
            warn!(
                "⚠ {} {}: {}/{} replicas acknowledged ({})",
                op,
                key,
                acks.len(),
                total,
                e
            );
        }
        return Ok(acks);
    }
    Err(first_error.unwrap_or_else(|| {
        Error::BackendError(format!(
            "{} {}: {}/{} acknowledgements",
            op,
            key,
            acks.len(),
            required
        ))
    }))
}

fn settle<T>(permit: Permit<'_>, result: Result<T>) -> Result<T> {
    match &result {
        Ok(_) => permit.success(),
        Err(_) => permit.failure(),
    }
    result
}

/// Race `op` against `signal`; the signal wins ties.
async fn cancellable<T, S, F>(signal: S, op: F) -> Result<T>
where
    S: Future<Output = ()>,
    F: Future<Output = Result<T>>,
{
    tokio::select! {
        biased;
        _ = signal => {
            debug!("Cache operation cancelled");
            Err(Error::Cancelled)
        }
        result = op => result,
    }
}

async fn run_flusher<B: CacheBackend>(core: Arc<EngineCore<B>>, mut rx: mpsc::Receiver<WriteBackOp>) {
    while let Some(op) = rx.recv().await {
        match op {
            WriteBackOp::Set { key, value, ttl } => {
                if let Err(e) = core.store(&key, value, ttl).await {
                    warn!("⚠ Write-back flush failed for {}: {}", key, e);
                    if let Some(metrics) = core.metrics() {
                        let logical = core.keys.logical(&key).unwrap_or(key.as_str());
                        metrics.record_error(logical, &e.to_string());
                    }
                }
            }
            WriteBackOp::Flush(ack) => {
                let _ = ack.send(());
            }
        }
    }
    debug!("Write-back flusher stopped");
}

async fn log_transitions(name: String, mut rx: broadcast::Receiver<StateTransition>) {
    loop {
        match rx.recv().await {
            Ok(t) if t.to == CircuitState::Open => {
                warn!("🚨 Cache backend {} degraded ({} -> {})", name, t.from, t.to)
            }
            Ok(t) => info!("Cache backend {} breaker {} -> {}", name, t.from, t.to),
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                warn!("⚠ Breaker listener for {} missed {} transitions", name, missed)
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

/// Sharded, breaker-protected cache over one or more backends.
///
/// Built with [`CacheEngineBuilder`](crate::CacheEngineBuilder), or
/// [`CacheEngine::new`] for a single backend.
///
/// # Example
///
/// ```
/// use cache_mesh::{backend::InMemoryBackend, CacheConfig, CacheEngine};
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() -> cache_mesh::Result<()> {
/// let config = CacheConfig {
///     namespace: "users".into(),
///     ..Default::default()
/// };
/// let engine = CacheEngine::new(config, InMemoryBackend::new())?;
///
/// engine.set("42", &"alice".to_string(), None).await?;
/// assert_eq!(engine.get::<String>("42").await?, Some("alice".to_string()));
/// # Ok(())
/// # }
/// ```
pub struct CacheEngine<B: CacheBackend> {
    core: Arc<EngineCore<B>>,
    write_back: Option<mpsc::Sender<WriteBackOp>>,
    tasks: Vec<JoinHandle<()>>,
}

impl<B: CacheBackend> CacheEngine<B> {
    /// Engine over a single backend, named after the first configured address.
    pub fn new(config: CacheConfig, backend: B) -> Result<Self> {
        let name = config
            .addrs
            .first()
            .cloned()
            .unwrap_or_else(|| "local".to_string());
        crate::CacheEngineBuilder::new(config)
            .node(name, backend)
            .build()
    }

    pub(crate) fn start(core: EngineCore<B>, mut tasks: Vec<JoinHandle<()>>) -> Result<Self> {
        let core = Arc::new(core);
        let runtime = Handle::try_current().ok();

        if let (Some(breaker), Some(handle)) = (&core.breaker, &runtime) {
            tasks.push(handle.spawn(log_transitions(
                breaker.name().to_string(),
                breaker.subscribe(),
            )));
        }

        let write_back = if !core.config.strategy.is_synchronous() {
            let handle = runtime.ok_or_else(|| {
                Error::ConfigError("write-back requires a Tokio runtime".into())
            })?;
            let (tx, rx) = mpsc::channel(core.config.write_back_queue_size);
            // Not tracked in `tasks`: it drains the queue after the engine drops.
            handle.spawn(run_flusher(Arc::clone(&core), rx));
            Some(tx)
        } else {
            None
        };

        info!(
            "✓ Cache engine ready: namespace={:?} strategy={} nodes={} sharding={} breaker={}",
            core.config.namespace,
            core.config.strategy,
            core.nodes.read().order.len(),
            core.config.enable_sharding,
            core.breaker.is_some()
        );
        if let Some(limit) = core.config.max_memory {
            info!("Cache max_memory advisory limit: {} bytes (not enforced)", limit);
        }

        Ok(CacheEngine {
            core,
            write_back,
            tasks,
        })
    }

    /// Fetch and decode `key`. A miss (or an expired entry) is `Ok(None)`.
    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        let physical = self.core.keys.build(key)?;
        let started = Instant::now();

        if let Some(tier) = &self.core.tier {
            if let Some(bytes) = tier.get(&physical) {
                let value = self.core.codec.decode(&bytes)?;
                debug!("✓ Cache GET {} -> local HIT", physical);
                if let Some(metrics) = self.core.metrics() {
                    metrics.record_hit(key, started.elapsed());
                }
                return Ok(Some(value));
            }
        }

        match self.core.fetch(&physical).await {
            Ok(Some(bytes)) => {
                let value = self.core.codec.decode(&bytes)?;
                if let Some(metrics) = self.core.metrics() {
                    metrics.record_hit(key, started.elapsed());
                }
                Ok(Some(value))
            }
            Ok(None) => {
                if let Some(metrics) = self.core.metrics() {
                    metrics.record_miss(key, started.elapsed());
                }
                Ok(None)
            }
            Err(e) => Err(self.failed(key, e)),
        }
    }

    /// Encode and store `value` under `key`.
    ///
    /// `ttl` of `None` falls back to the TTL policy; a zero TTL means no
    /// expiry. When this returns under write-through, every required replica
    /// has acknowledged the write.
    pub async fn set<T: Serialize + ?Sized>(
        &self,
        key: &str,
        value: &T,
        ttl: Option<Duration>,
    ) -> Result<()> {
        let physical = self.core.keys.build(key)?;
        let bytes = self.core.codec.encode(value)?;
        if bytes.len() > self.core.config.max_entry_size {
            return Err(Error::ValidationError(format!(
                "Encoded value of {} bytes exceeds max_entry_size {}",
                bytes.len(),
                self.core.config.max_entry_size
            )));
        }
        let ttl = self.core.resolve_ttl(key, ttl);
        let started = Instant::now();

        let result = match self.core.config.strategy {
            WriteStrategy::WriteThrough => {
                let cached = self.core.tier.as_ref().map(|_| bytes.clone());
                let stored = self.core.store(&physical, bytes, ttl).await;
                if let (Ok(()), Some(tier), Some(bytes)) = (&stored, &self.core.tier, cached) {
                    tier.insert(&physical, bytes, ttl);
                }
                stored
            }
            WriteStrategy::WriteBack => {
                if let Some(tier) = &self.core.tier {
                    tier.insert(&physical, bytes.clone(), ttl);
                }
                self.enqueue(WriteBackOp::Set {
                    key: physical.clone(),
                    value: bytes,
                    ttl,
                })
                .await
            }
            WriteStrategy::WriteAround => {
                let stored = self.core.store(&physical, bytes, ttl).await;
                if let Some(tier) = &self.core.tier {
                    tier.remove(&physical);
                }
                stored
            }
        };

        match result {
            Ok(()) => {
                debug!("✓ Cache SET {} (TTL: {:?})", physical, ttl);
                if let Some(metrics) = self.core.metrics() {
                    metrics.record_set(key, started.elapsed());
                }
                Ok(())
            }
            Err(e) => Err(self.failed(key, e)),
        }
    }

    /// Remove `key` from the local tier and every replica. Missing keys are fine.
    pub async fn delete(&self, key: &str) -> Result<()> {
        let physical = self.core.keys.build(key)?;
        let started = Instant::now();
        // Pending write-backs must not resurrect the key.
        self.flush().await?;
        if let Some(tier) = &self.core.tier {
            tier.remove(&physical);
        }

        match self.core.remove(&physical).await {
            Ok(()) => {
                debug!("✓ Cache DELETE {}", physical);
                if let Some(metrics) = self.core.metrics() {
                    metrics.record_delete(key, started.elapsed());
                }
                Ok(())
            }
            Err(e) => Err(self.failed(key, e)),
        }
    }

    /// Best-effort bulk delete of namespaced keys matching the glob `pattern`
    /// on every node. An empty pattern clears the whole namespace.
    ///
    /// Not atomic: concurrent writers may add matching keys while it runs.
    pub async fn clear(&self, pattern: &str) -> Result<u64> {
        let physical = self.core.keys.pattern(pattern);
        self.flush().await?;
        if let Some(tier) = &self.core.tier {
            tier.remove_matching(&physical);
        }

        match self.core.remove_matching(&physical).await {
            Ok(removed) => {
                info!("✓ Cache CLEAR {} ({} keys)", physical, removed);
                Ok(removed)
            }
            Err(e) => Err(self.failed(pattern, e)),
        }
    }

    /// Whether `key` is present in the local tier or on its read replica.
    pub async fn exists(&self, key: &str) -> Result<bool> {
        let physical = self.core.keys.build(key)?;
        if let Some(tier) = &self.core.tier {
            if tier.get(&physical).is_some() {
                return Ok(true);
            }
        }
        match self.core.count(&physical).await {
            Ok(n) => Ok(n > 0),
            Err(e) => Err(self.failed(key, e)),
        }
    }

    /// [`get`](Self::get), abandoned with [`Error::Cancelled`] if `signal`
    /// resolves first. A cancelled call is not held against the breaker.
    ///
    /// `signal` can be any future: a timer, a shutdown notification, a
    /// oneshot receiver.
    pub async fn get_cancellable<T, S>(&self, key: &str, signal: S) -> Result<Option<T>>
    where
        T: DeserializeOwned,
        S: Future<Output = ()>,
    {
        cancellable(signal, self.get(key)).await
    }

    pub async fn set_cancellable<T, S>(
        &self,
        key: &str,
        value: &T,
        ttl: Option<Duration>,
        signal: S,
    ) -> Result<()>
    where
        T: Serialize + ?Sized,
        S: Future<Output = ()>,
    {
        cancellable(signal, self.set(key, value, ttl)).await
    }

    pub async fn delete_cancellable<S>(&self, key: &str, signal: S) -> Result<()>
    where
        S: Future<Output = ()>,
    {
        cancellable(signal, self.delete(key)).await
    }

    pub async fn clear_cancellable<S>(&self, pattern: &str, signal: S) -> Result<u64>
    where
        S: Future<Output = ()>,
    {
        cancellable(signal, self.clear(pattern)).await
    }

    pub async fn exists_cancellable<S>(&self, key: &str, signal: S) -> Result<bool>
    where
        S: Future<Output = ()>,
    {
        cancellable(signal, self.exists(key)).await
    }

    /// Wait until every write-back queued before this call has been flushed.
    /// No-op for the synchronous strategies.
    pub async fn flush(&self) -> Result<()> {
        let Some(tx) = &self.write_back else {
            return Ok(());
        };
        let (ack, done) = oneshot::channel();
        tx.send(WriteBackOp::Flush(ack))
            .await
            .map_err(|_| flusher_stopped())?;
        done.await.map_err(|_| flusher_stopped())
    }

    async fn enqueue(&self, op: WriteBackOp) -> Result<()> {
        let Some(tx) = &self.write_back else {
            return Err(Error::ConfigError("write-back queue is not running".into()));
        };
        tx.send(op).await.map_err(|_| flusher_stopped())
    }

    fn failed(&self, key: &str, e: Error) -> Error {
        if !e.is_validation() {
            if let Some(metrics) = self.core.metrics() {
                metrics.record_error(key, &e.to_string());
            }
        }
        e
    }

    /// Register a backend and place it on the ring.
    ///
    /// Returns the sampled estimate of ranges that changed owner.
    /// Fails with `ConfigError` for a duplicate name or a weight outside
    /// `1..=MAX_NODE_WEIGHT`.
    pub fn add_node(
        &self,
        name: impl Into<String>,
        backend: B,
        weight: u32,
    ) -> Result<Vec<RebalanceMove>> {
        let name = name.into();
        check_weight(&name, weight)?;
        let moves = {
            // Baseline, change and diff all happen under the table lock.
            let mut table = self.core.nodes.write();
            if !table.insert(NodeId::from(name.as_str()), backend) {
                return Err(Error::ConfigError(format!("Node {} already registered", name)));
            }
            let previous = self.core.ring.clone();
            self.core.ring.add(&name, weight);
            self.core.ring.get_rebalance_info(&previous)
        };

        info!(
            "✓ Node {} joined (weight {}); {}/{} sampled ranges move",
            name,
            weight,
            moves.len(),
            REBALANCE_SAMPLES
        );
        Ok(moves)
    }

    /// Deregister a backend and take it off the ring.
    pub fn remove_node(&self, name: &str) -> Result<Vec<RebalanceMove>> {
        let moves = {
            let mut table = self.core.nodes.write();
            if !table.remove(name) {
                return Err(Error::ConfigError(format!("Node {} is not registered", name)));
            }
            let previous = self.core.ring.clone();
            self.core.ring.remove(name);
            self.core.ring.get_rebalance_info(&previous)
        };

        warn!(
            "⚠ Node {} left; {}/{} sampled ranges move",
            name,
            moves.len(),
            REBALANCE_SAMPLES
        );
        Ok(moves)
    }

    /// Probe every backend. Errors read as unhealthy.
    pub async fn health_check(&self) -> Vec<(NodeId, bool)> {
        let nodes = self.core.nodes.read().all();
        let probes = join_all(nodes.iter().map(|(_, backend)| backend.health_check())).await;
        nodes
            .into_iter()
            .zip(probes)
            .map(|((id, _), probe)| {
                let healthy = probe.unwrap_or_else(|e| {
                    warn!("⚠ Health check failed for {}: {}", id, e);
                    false
                });
                (id, healthy)
            })
            .collect()
    }

    /// Node owning `key` (before replication), or `None` with no nodes.
    pub fn node_for(&self, key: &str) -> Result<Option<NodeId>> {
        let physical = self.core.keys.build(key)?;
        Ok(self
            .core
            .replicas(&physical)
            .ok()
            .and_then(|r| r.into_iter().next().map(|(id, _)| id)))
    }

    pub fn nodes(&self) -> Vec<NodeId> {
        self.core.nodes.read().order.clone()
    }

    pub fn backend(&self, node: &str) -> Option<Arc<B>> {
        self.core.nodes.read().backends.get(node).cloned()
    }

    pub fn ring(&self) -> &HashRing {
        &self.core.ring
    }

    /// Share of the hash space per node, in percent.
    pub fn distribution(&self) -> HashMap<NodeId, f64> {
        self.core.ring.distribution()
    }

    pub fn config(&self) -> &CacheConfig {
        &self.core.config
    }

    pub fn namespace(&self) -> &str {
        self.core.keys.namespace()
    }

    pub fn local_tier(&self) -> Option<&LocalTier> {
        self.core.tier.as_ref()
    }

    pub fn breaker_state(&self) -> Option<CircuitState> {
        self.core.breaker.as_ref().map(|b| b.state())
    }

    pub fn breaker_stats(&self) -> Option<BreakerStats> {
        self.core.breaker.as_ref().map(|b| b.stats())
    }

    /// Breaker state changes, delivered asynchronously.
    pub fn subscribe(&self) -> Option<broadcast::Receiver<StateTransition>> {
        self.core.breaker.as_ref().map(|b| b.subscribe())
    }

    /// Manual recovery: close the breaker and clear its counters.
    pub fn reset_breaker(&self) {
        if let Some(breaker) = &self.core.breaker {
            breaker.reset();
        }
    }

    /// Manual degradation: reject every call until recovery.
    pub fn force_open_breaker(&self) {
        if let Some(breaker) = &self.core.breaker {
            breaker.force_open();
        }
    }
}

impl<B: CacheBackend> Drop for CacheEngine<B> {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

fn flusher_stopped() -> Error {
    Error::BackendError("write-back flusher has stopped".into())
}

/// Reject node weights outside `1..=MAX_NODE_WEIGHT`.
pub(crate) fn check_weight(name: &str, weight: u32) -> Result<()> {
    if weight == 0 || weight > MAX_NODE_WEIGHT {
        return Err(Error::ConfigError(format!(
            "Node {} weight {} outside 1..={}",
            name, weight, MAX_NODE_WEIGHT
        )));
    }
    Ok(())
}

#[cfg(all(test, feature = "inmemory"))]
mod tests {
    use super::*;
    use crate::backend::{InMemoryBackend, InstrumentedBackend};
    use crate::config::WriteConsistency;
    use crate::observability::CacheMetrics;
    use crate::CacheEngineBuilder;
    use serde::Deserialize;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Profile {
        id: u64,
        name: String,
    }

    fn profile() -> Profile {
        Profile {
            id: 7,
            name: "Ada".to_string(),
        }
    }

    fn config() -> CacheConfig {
        CacheConfig {
            namespace: "test".into(),
            ..Default::default()
        }
    }

    fn sharded(nodes: usize, replication_factor: usize) -> (CacheEngine<InMemoryBackend>, Vec<InMemoryBackend>) {
        let config = CacheConfig {
            enable_sharding: true,
            replication_factor,
            ..config()
        };
        let backends: Vec<_> = (0..nodes).map(|_| InMemoryBackend::new()).collect();
        let mut builder = CacheEngineBuilder::new(config);
        for (i, backend) in backends.iter().enumerate() {
            builder = builder.node(format!("node-{}", i), backend.clone());
        }
        (builder.build().unwrap(), backends)
    }

    #[tokio::test]
    async fn test_set_get_round_trip() {
        let backend = InMemoryBackend::new();
        let engine = CacheEngine::new(config(), backend.clone()).unwrap();

        engine.set("p:7", &profile(), None).await.unwrap();
        assert_eq!(engine.get::<Profile>("p:7").await.unwrap(), Some(profile()));
        assert!(engine.exists("p:7").await.unwrap());
        assert_eq!(backend.keys(), vec!["test:p:7".to_string()]);
    }

    #[tokio::test]
    async fn test_miss_does_not_touch_breaker() {
        let engine = CacheEngine::new(config(), InMemoryBackend::new()).unwrap();
        assert_eq!(engine.get::<Profile>("absent").await.unwrap(), None);

        let stats = engine.breaker_stats().unwrap();
        assert_eq!(stats.total_successes, 0);
        assert_eq!(stats.total_failures, 0);
    }

    #[tokio::test]
    async fn test_oversized_value_is_validation_error() {
        let backend = InstrumentedBackend::new(InMemoryBackend::new());
        let config = CacheConfig {
            max_entry_size: 64,
            ..config()
        };
        let engine = CacheEngine::new(config, backend.clone()).unwrap();

        let err = engine.set("big", &vec![0u8; 512], None).await.unwrap_err();
        assert!(err.is_validation());
        assert_eq!(backend.calls(), 0);
    }

    #[tokio::test]
    async fn test_sharded_replication_writes_every_replica() {
        let (engine, backends) = sharded(3, 2);
        engine.set("order:1", &42u32, None).await.unwrap();

        let holders = backends
            .iter()
            .filter(|b| b.keys().contains(&"test:order:1".to_string()))
            .count();
        assert_eq!(holders, 2);

        engine.delete("order:1").await.unwrap();
        for backend in &backends {
            assert!(backend.is_empty().await);
        }
    }

    #[tokio::test]
    async fn test_keys_spread_across_shards() {
        let (engine, backends) = sharded(3, 1);
        for i in 0..300 {
            engine.set(&format!("k{}", i), &i, None).await.unwrap();
        }
        for backend in &backends {
            let n = backend.len().await;
            assert!(n > 30, "shard holds only {} of 300 keys", n);
        }
        assert_eq!(engine.clear("").await.unwrap(), 300);
    }

    #[tokio::test]
    async fn test_quorum_tolerates_one_failed_replica() {
        let config = CacheConfig {
            enable_sharding: true,
            replication_factor: 3,
            write_consistency: WriteConsistency::Quorum,
            circuit_breaker_enabled: false,
            ..config()
        };
        let backends: Vec<_> = (0..3)
            .map(|_| InstrumentedBackend::new(InMemoryBackend::new()))
            .collect();
        let engine = CacheEngineBuilder::new(config)
            .node("a", backends[0].clone())
            .node("b", backends[1].clone())
            .node("c", backends[2].clone())
            .build()
            .unwrap();

        // Reads go to the primary, so only the other two may fail quietly.
        let order = engine.ring().get_multiple("test:q", 3);
        let node = |i: usize| engine.backend(&order[i]).unwrap();

        node(1).set_failing(true);
        engine.set("q", &1u8, None).await.unwrap();

        node(2).set_failing(true);
        let err = engine.set("q", &2u8, None).await.unwrap_err();
        assert!(err.is_backend());
    }

    type Instrumented = InstrumentedBackend<InMemoryBackend>;

    fn instrumented(read_preference: ReadPreference) -> CacheEngine<Instrumented> {
        let config = CacheConfig {
            enable_sharding: true,
            replication_factor: 2,
            read_preference,
            circuit_breaker_enabled: false,
            ..config()
        };
        let mut builder = CacheEngineBuilder::new(config);
        for i in 0..3 {
            builder = builder.node(
                format!("node-{}", i),
                InstrumentedBackend::new(InMemoryBackend::new()),
            );
        }
        builder.build().unwrap()
    }

    /// Backends of `key`'s replica set (primary first) and of the one node outside it.
    fn placement(
        engine: &CacheEngine<Instrumented>,
        key: &str,
    ) -> (Vec<Arc<Instrumented>>, Arc<Instrumented>) {
        let physical = format!("test:{}", key);
        let owners = engine.ring().get_multiple(&physical, 2);
        let outsider = engine
            .nodes()
            .into_iter()
            .find(|n| !owners.contains(n))
            .unwrap();
        let replicas = owners.iter().map(|n| engine.backend(n).unwrap()).collect();
        (replicas, engine.backend(&outsider).unwrap())
    }

    #[tokio::test]
    async fn test_delete_fails_when_primary_keeps_value() {
        let engine = instrumented(ReadPreference::Primary);
        let (replicas, _) = placement(&engine, "k");
        engine.set("k", &7u32, None).await.unwrap();

        replicas[0].set_failing(true);
        let err = engine.delete("k").await.unwrap_err();
        assert!(err.is_backend());
        replicas[0].set_failing(false);

        // The error was honest: the primary still serves the value.
        assert_eq!(engine.get::<u32>("k").await.unwrap(), Some(7));
        engine.delete("k").await.unwrap();
        assert_eq!(engine.get::<u32>("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_delete_requires_every_replica() {
        let engine = instrumented(ReadPreference::Primary);
        let (replicas, _) = placement(&engine, "k");
        engine.set("k", &7u32, None).await.unwrap();

        replicas[1].set_failing(true);
        assert!(engine.delete("k").await.unwrap_err().is_backend());
    }

    #[tokio::test]
    async fn test_set_fails_when_read_replica_misses_write() {
        let engine = instrumented(ReadPreference::Primary);
        let (replicas, _) = placement(&engine, "k");
        engine.set("k", &1u32, None).await.unwrap();

        replicas[0].set_failing(true);
        assert!(engine.set("k", &2u32, None).await.unwrap_err().is_backend());
        replicas[0].set_failing(false);
        assert_eq!(engine.get::<u32>("k").await.unwrap(), Some(1));

        // A non-read replica failing is tolerated under WriteConsistency::One.
        replicas[1].set_failing(true);
        engine.set("k", &3u32, None).await.unwrap();
        assert_eq!(engine.get::<u32>("k").await.unwrap(), Some(3));
    }

    #[tokio::test]
    async fn test_replica_preference_reads_second_owner() {
        let engine = instrumented(ReadPreference::Replica);
        let (replicas, outsider) = placement(&engine, "k");
        engine.set("k", &5u32, None).await.unwrap();

        replicas[0].set_failing(true);
        assert_eq!(engine.get::<u32>("k").await.unwrap(), Some(5));
        assert!(engine.exists("k").await.unwrap());

        replicas[0].set_failing(false);
        replicas[1].set_failing(true);
        assert!(engine.get::<u32>("k").await.unwrap_err().is_backend());
        assert_eq!(outsider.calls(), 0);
    }

    #[tokio::test]
    async fn test_any_preference_stays_within_replica_set() {
        let engine = instrumented(ReadPreference::Any);
        let (replicas, outsider) = placement(&engine, "k");
        engine.set("k", &9u32, None).await.unwrap();
        for replica in &replicas {
            replica.reset_calls();
        }

        outsider.set_failing(true);
        for _ in 0..64 {
            assert_eq!(engine.get::<u32>("k").await.unwrap(), Some(9));
        }
        assert_eq!(outsider.calls(), 0);
        assert_eq!(replicas[0].calls() + replicas[1].calls(), 64);
        assert!(replicas.iter().all(|r| r.calls() > 0));
    }

    #[tokio::test]
    async fn test_write_back_defers_backend_write() {
        let backend = InMemoryBackend::new();
        let config = CacheConfig {
            strategy: WriteStrategy::WriteBack,
            local_tier_capacity: 16,
            ..config()
        };
        let engine = CacheEngine::new(config, backend.clone()).unwrap();

        engine.set("wb", &"queued", None).await.unwrap();
        assert_eq!(engine.get::<String>("wb").await.unwrap().as_deref(), Some("queued"));

        engine.flush().await.unwrap();
        assert_eq!(backend.keys(), vec!["test:wb".to_string()]);

        engine.delete("wb").await.unwrap();
        assert!(backend.is_empty().await);
        assert_eq!(engine.get::<String>("wb").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_write_around_invalidates_local_tier() {
        let backend = InMemoryBackend::new();
        let config = CacheConfig {
            strategy: WriteStrategy::WriteAround,
            local_tier_capacity: 16,
            ..config()
        };
        let engine = CacheEngine::new(config, backend.clone()).unwrap();

        engine.set("wa", &1u32, None).await.unwrap();
        assert!(engine.local_tier().unwrap().is_empty());
        assert_eq!(engine.get::<u32>("wa").await.unwrap(), Some(1));
    }

    #[tokio::test]
    async fn test_write_through_fills_local_tier() {
        let backend = InstrumentedBackend::new(InMemoryBackend::new());
        let config = CacheConfig {
            local_tier_capacity: 16,
            ..config()
        };
        let engine = CacheEngine::new(config, backend.clone()).unwrap();

        engine.set("wt", &5u32, None).await.unwrap();
        backend.reset_calls();
        assert_eq!(engine.get::<u32>("wt").await.unwrap(), Some(5));
        assert_eq!(backend.calls(), 0);
    }

    #[tokio::test]
    async fn test_breaker_rejects_without_backend_call() {
        let backend = InstrumentedBackend::new(InMemoryBackend::new());
        let config = CacheConfig {
            failure_threshold: 2,
            ..config()
        };
        let engine = CacheEngine::new(config, backend.clone()).unwrap();

        backend.set_failing(true);
        for _ in 0..2 {
            assert!(engine.get::<u8>("k").await.unwrap_err().is_backend());
        }
        assert_eq!(engine.breaker_state(), Some(CircuitState::Open));

        let calls = backend.calls();
        let err = engine.set("k", &1u8, None).await.unwrap_err();
        assert!(err.is_circuit_open());
        assert!(err.is_degraded());
        assert_eq!(backend.calls(), calls);
    }

    #[tokio::test]
    async fn test_cancelled_call_is_not_counted() {
        let backend = InstrumentedBackend::new(InMemoryBackend::new());
        backend.set_latency(Duration::from_millis(200));
        let engine = CacheEngine::new(config(), backend.clone()).unwrap();

        let err = engine
            .set_cancellable("slow", &1u8, None, tokio::time::sleep(Duration::from_millis(10)))
            .await
            .unwrap_err();
        assert!(err.is_cancelled());

        let stats = engine.breaker_stats().unwrap();
        assert_eq!(stats.total_successes + stats.total_failures, 0);
    }

    #[tokio::test]
    async fn test_cancel_in_half_open_releases_trial() {
        let backend = InstrumentedBackend::new(InMemoryBackend::new());
        let config = CacheConfig {
            failure_threshold: 1,
            half_open_max_requests: 1,
            success_threshold: 1,
            recovery_timeout: Duration::from_millis(20),
            ..config()
        };
        let engine = CacheEngine::new(config, backend.clone()).unwrap();

        backend.set_failing(true);
        assert!(engine.get::<u8>("k").await.is_err());
        backend.set_failing(false);
        tokio::time::sleep(Duration::from_millis(40)).await;

        backend.set_latency(Duration::from_millis(200));
        let err = engine
            .get_cancellable::<u8, _>("k", tokio::time::sleep(Duration::from_millis(10)))
            .await
            .unwrap_err();
        assert!(err.is_cancelled());
        assert_eq!(engine.breaker_state(), Some(CircuitState::HalfOpen));

        // The slot came back, so a fresh trial is admitted and closes the breaker.
        backend.set_latency(Duration::ZERO);
        engine.set("k", &1u8, None).await.unwrap();
        assert_eq!(engine.breaker_state(), Some(CircuitState::Closed));
    }

    #[tokio::test]
    async fn test_add_and_remove_node_report_moves() {
        let (engine, _) = sharded(2, 1);
        let moves = engine.add_node("node-2", InMemoryBackend::new(), 1).unwrap();
        assert!(!moves.is_empty());
        assert!(moves
            .iter()
            .all(|m| m.to_node.as_deref() == Some("node-2")));
        assert!(engine.add_node("node-2", InMemoryBackend::new(), 1).is_err());

        let moves = engine.remove_node("node-2").unwrap();
        assert!(moves
            .iter()
            .all(|m| m.from_node.as_deref() == Some("node-2")));
        assert_eq!(engine.nodes().len(), 2);
        assert!(engine.remove_node("node-2").is_err());
    }

    #[tokio::test]
    async fn test_add_node_rejects_oversized_weight() {
        let (engine, _) = sharded(2, 1);
        let err = engine
            .add_node("huge", InMemoryBackend::new(), u32::MAX)
            .unwrap_err();
        assert!(matches!(err, Error::ConfigError(_)));
        assert_eq!(engine.nodes().len(), 2);
        assert!(!engine.ring().contains("huge"));
    }

    #[tokio::test]
    async fn test_concurrent_joins_diff_against_own_baseline() {
        let (engine, _) = sharded(2, 1);
        let reports: Vec<(String, Vec<RebalanceMove>)> = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..6)
                .map(|i| {
                    let engine = &engine;
                    scope.spawn(move || {
                        let name = format!("joiner-{}", i);
                        let moves = engine.add_node(name.as_str(), InMemoryBackend::new(), 1).unwrap();
                        (name, moves)
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        for (name, moves) in reports {
            assert!(moves
                .iter()
                .all(|m| m.to_node.as_deref() == Some(name.as_str())));
        }
        assert_eq!(engine.nodes().len(), 8);
    }

    #[tokio::test]
    async fn test_no_nodes_is_degraded() {
        let (engine, _) = sharded(1, 1);
        engine.remove_node("node-0").unwrap();
        let err = engine.get::<u8>("k").await.unwrap_err();
        assert_eq!(err, Error::NoNodes);
        assert!(err.is_degraded());
    }

    #[tokio::test]
    async fn test_metrics_hooks() {
        #[derive(Clone, Default)]
        struct Counting {
            hits: Arc<AtomicUsize>,
            misses: Arc<AtomicUsize>,
            sets: Arc<AtomicUsize>,
            slow: Arc<AtomicUsize>,
        }

        impl CacheMetrics for Counting {
            fn record_hit(&self, _key: &str, _duration: Duration) {
                self.hits.fetch_add(1, Ordering::SeqCst);
            }

            fn record_miss(&self, _key: &str, _duration: Duration) {
                self.misses.fetch_add(1, Ordering::SeqCst);
            }

            fn record_set(&self, _key: &str, _duration: Duration) {
                self.sets.fetch_add(1, Ordering::SeqCst);
            }

            fn record_slow_query(&self, _op: &str, _key: &str, _duration: Duration) {
                self.slow.fetch_add(1, Ordering::SeqCst);
            }
        }

        let metrics = Counting::default();
        let backend = InstrumentedBackend::new(InMemoryBackend::new());
        let config = CacheConfig {
            slow_query_threshold: Duration::from_millis(20),
            ..config()
        };
        let engine = CacheEngineBuilder::new(config)
            .node("only", backend.clone())
            .metrics(metrics.clone())
            .build()
            .unwrap();

        engine.set("a", &1u8, None).await.unwrap();
        engine.get::<u8>("a").await.unwrap();
        engine.get::<u8>("b").await.unwrap();
        backend.set_latency(Duration::from_millis(30));
        engine.get::<u8>("a").await.unwrap();

        assert_eq!(metrics.sets.load(Ordering::SeqCst), 1);
        assert_eq!(metrics.hits.load(Ordering::SeqCst), 2);
        assert_eq!(metrics.misses.load(Ordering::SeqCst), 1);
        assert_eq!(metrics.slow.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_ttl_policy_applies_when_ttl_omitted() {
        let backend = InMemoryBackend::new();
        let engine = CacheEngineBuilder::new(config())
            .node("only", backend.clone())
            .ttl_policy(TtlPolicy::PerPrefix(vec![(
                "flash:".to_string(),
                Duration::from_millis(20),
            )]))
            .build()
            .unwrap();

        engine.set("flash:1", &1u8, None).await.unwrap();
        engine.set("keep:1", &1u8, None).await.unwrap();
        tokio::time::sleep(Duration::from_millis(40)).await;

        assert_eq!(engine.get::<u8>("flash:1").await.unwrap(), None);
        assert_eq!(engine.get::<u8>("keep:1").await.unwrap(), Some(1));
    }

    #[tokio::test]
    async fn test_breaker_transitions_are_published() {
        let config = CacheConfig {
            failure_threshold: 1,
            ..config()
        };
        let engine = CacheEngine::new(config, InMemoryBackend::new()).unwrap();
        let mut rx = engine.subscribe().unwrap();

        engine.force_open_breaker();
        let t = rx.recv().await.unwrap();
        assert_eq!((t.from, t.to), (CircuitState::Closed, CircuitState::Open));

        engine.reset_breaker();
        let t = rx.recv().await.unwrap();
        assert_eq!(t.to, CircuitState::Closed);
    }
}
