//! # Circuit Breaker
//!
//! Three-state gate protecting calls to the backing store.
//!
//! ```text
//!  Closed ──(failures ≥ threshold)──▶ Open ──(recovery_timeout, next allow)──▶ HalfOpen
//!    ▲                                 ▲                                          │
//!    │                                 └────────────────(any failure)─────────────┤
//!    └────────────────────────(successes ≥ success_threshold)─────────────────────┘
//! ```
//!
//! All state lives behind one lock. Transitions are announced on a broadcast
//! channel; sending never blocks the transition.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;

/// Buffered transitions per subscriber before the oldest are dropped.
const TRANSITION_CHANNEL_CAPACITY: usize = 64;

/// Circuit breaker states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CircuitState {
    /// Normal operation - all calls are allowed through
    Closed,
    /// Failure mode - all calls fail fast without executing
    Open,
    /// Testing recovery - a bounded batch of trial calls is allowed
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half-open"),
        }
    }
}

/// A state change, as delivered to [`CircuitBreaker::subscribe`] receivers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateTransition {
    pub from: CircuitState,
    pub to: CircuitState,
}

/// Errors from [`CircuitBreaker::call`].
#[derive(Debug, thiserror::Error)]
pub enum CircuitBreakerError<E> {
    /// Circuit is open, rejecting all calls
    #[error("Circuit breaker is open for {component}")]
    CircuitOpen { component: String },

    /// Operation failed and was recorded
    #[error("Operation failed: {0}")]
    OperationFailed(E),
}

/// Breaker construction parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures (while closed) that trip the breaker.
    pub failure_threshold: u32,
    /// Half-open successes needed to close again.
    pub success_threshold: u32,
    /// Time after the last failure before a trial is allowed.
    pub recovery_timeout: Duration,
    /// Trial calls admitted per half-open batch.
    pub half_open_max_requests: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        CircuitBreakerConfig {
            failure_threshold: 5,
            success_threshold: 3,
            recovery_timeout: Duration::from_secs(30),
            half_open_max_requests: 3,
        }
    }
}

/// Point-in-time view of a breaker.
#[derive(Debug, Clone, PartialEq)]
pub struct BreakerStats {
    pub state: CircuitState,
    pub failure_count: u32,
    pub success_count: u32,
    pub half_open_requests: u32,
    pub failure_threshold: u32,
    /// Time since the last recorded failure, if any.
    pub since_last_failure: Option<Duration>,
    pub total_successes: u64,
    pub total_failures: u64,
    pub total_rejections: u64,
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    failure_count: u32,
    success_count: u32,
    half_open_requests: u32,
    failure_threshold: u32,
    /// Bumped on every transition; tags the half-open batch a trial belongs to.
    generation: u64,
    last_failure: Option<Instant>,
    total_successes: u64,
    total_failures: u64,
    total_rejections: u64,
}

impl BreakerInner {
    fn clear_counters(&mut self) {
        self.failure_count = 0;
        self.success_count = 0;
        self.half_open_requests = 0;
    }
}

/// Fixed-threshold circuit breaker.
///
/// ```
/// use cache_mesh::resilience::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
///
/// let breaker = CircuitBreaker::new("backend", CircuitBreakerConfig {
///     failure_threshold: 2,
///     ..Default::default()
/// });
/// breaker.record_failure();
/// breaker.record_failure();
/// assert_eq!(breaker.state(), CircuitState::Open);
/// assert!(!breaker.allow());
/// ```
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: RwLock<BreakerInner>,
    transitions: broadcast::Sender<StateTransition>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        let name = name.into();
        info!(
            "🛡️ Circuit breaker {} initialized (failure_threshold={}, success_threshold={}, recovery={:?}, half_open_max={})",
            name,
            config.failure_threshold,
            config.success_threshold,
            config.recovery_timeout,
            config.half_open_max_requests
        );
        let (transitions, _) = broadcast::channel(TRANSITION_CHANNEL_CAPACITY);

        CircuitBreaker {
            inner: RwLock::new(BreakerInner {
                state: CircuitState::Closed,
                failure_count: 0,
                success_count: 0,
                half_open_requests: 0,
                failure_threshold: config.failure_threshold.max(1),
                generation: 0,
                last_failure: None,
                total_successes: 0,
                total_failures: 0,
                total_rejections: 0,
            }),
            name,
            config,
            transitions,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Decide whether a call may proceed.
    ///
    /// In `Open`, the first call after `recovery_timeout` moves the breaker to
    /// `HalfOpen` and is admitted as the first trial.
    pub fn allow(&self) -> bool {
        self.acquire().is_some()
    }

    /// Like [`allow`](Self::allow), but hands back the generation the
    /// admission belongs to, for a later [`release_trial`](Self::release_trial).
    pub fn acquire(&self) -> Option<u64> {
        let mut inner = self.inner.write();
        match inner.state {
            CircuitState::Closed => Some(inner.generation),
            CircuitState::Open => {
                let recovered = inner
                    .last_failure
                    .map_or(true, |at| at.elapsed() >= self.config.recovery_timeout);
                if recovered {
                    self.transition(&mut inner, CircuitState::HalfOpen);
                    inner.half_open_requests = 1;
                    Some(inner.generation)
                } else {
                    inner.total_rejections += 1;
                    None
                }
            }
            CircuitState::HalfOpen => {
                if inner.half_open_requests < self.config.half_open_max_requests {
                    inner.half_open_requests += 1;
                    Some(inner.generation)
                } else {
                    inner.total_rejections += 1;
                    None
                }
            }
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.inner.write();
        inner.total_successes += 1;
        match inner.state {
            CircuitState::Closed => inner.failure_count = 0,
            CircuitState::HalfOpen => {
                inner.success_count += 1;
                if inner.success_count >= self.effective_success_threshold() {
                    self.transition(&mut inner, CircuitState::Closed);
                }
            }
            CircuitState::Open => {
                debug!("Breaker {}: late success ignored while open", self.name);
            }
        }
    }

    pub fn record_failure(&self) {
        let mut inner = self.inner.write();
        inner.total_failures += 1;
        inner.last_failure = Some(Instant::now());
        match inner.state {
            CircuitState::Closed => {
                inner.failure_count += 1;
                if inner.failure_count >= inner.failure_threshold {
                    self.transition(&mut inner, CircuitState::Open);
                }
            }
            CircuitState::HalfOpen => self.transition(&mut inner, CircuitState::Open),
            CircuitState::Open => {}
        }
    }

    /// Hand back a half-open trial slot whose call never completed.
    ///
    /// Counts as neither success nor failure. A slot acquired before the
    /// breaker last changed state is stale and releases nothing.
    pub fn release_trial(&self, generation: u64) {
        let mut inner = self.inner.write();
        if inner.generation != generation {
            debug!("Breaker {}: stale trial release ignored", self.name);
            return;
        }
        if inner.state == CircuitState::HalfOpen && inner.half_open_requests > 0 {
            inner.half_open_requests -= 1;
        }
    }

    pub fn state(&self) -> CircuitState {
        self.inner.read().state
    }

    pub fn stats(&self) -> BreakerStats {
        let inner = self.inner.read();
        BreakerStats {
            state: inner.state,
            failure_count: inner.failure_count,
            success_count: inner.success_count,
            half_open_requests: inner.half_open_requests,
            failure_threshold: inner.failure_threshold,
            since_last_failure: inner.last_failure.map(|at| at.elapsed()),
            total_successes: inner.total_successes,
            total_failures: inner.total_failures,
            total_rejections: inner.total_rejections,
        }
    }

    /// Force `Closed` and clear all counters (manual recovery).
    pub fn reset(&self) {
        let mut inner = self.inner.write();
        warn!("🚨 Circuit breaker {} reset", self.name);
        self.transition(&mut inner, CircuitState::Closed);
    }

    /// Force `Open` and stamp the failure time (manual degradation).
    pub fn force_open(&self) {
        let mut inner = self.inner.write();
        warn!("🚨 Circuit breaker {} forced open", self.name);
        inner.last_failure = Some(Instant::now());
        self.transition(&mut inner, CircuitState::Open);
    }

    pub fn failure_threshold(&self) -> u32 {
        self.inner.read().failure_threshold
    }

    /// Replace the trip threshold (min 1). Returns the previous value.
    pub fn set_failure_threshold(&self, threshold: u32) -> u32 {
        self.update_failure_threshold(|_| threshold).0
    }

    /// Apply `f` to the trip threshold under the breaker lock.
    ///
    /// Returns `(old, new)`. The current state is left untouched.
    pub(crate) fn update_failure_threshold<F>(&self, f: F) -> (u32, u32)
    where
        F: FnOnce(u32) -> u32,
    {
        let mut inner = self.inner.write();
        let old = inner.failure_threshold;
        inner.failure_threshold = f(old).max(1);
        (old, inner.failure_threshold)
    }

    /// Receive every subsequent state transition.
    pub fn subscribe(&self) -> broadcast::Receiver<StateTransition> {
        self.transitions.subscribe()
    }

    /// Run `operation` behind the breaker, recording its outcome.
    pub async fn call<F, T, E, Fut>(&self, operation: F) -> Result<T, CircuitBreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        if !self.allow() {
            return Err(CircuitBreakerError::CircuitOpen {
                component: self.name.clone(),
            });
        }

        let result = operation().await;
        match &result {
            Ok(_) => self.record_success(),
            Err(_) => self.record_failure(),
        }
        result.map_err(CircuitBreakerError::OperationFailed)
    }

    /// Successes required in half-open; never more than the trial batch admits.
    fn effective_success_threshold(&self) -> u32 {
        self.config
            .success_threshold
            .min(self.config.half_open_max_requests)
            .max(1)
    }

    fn transition(&self, inner: &mut BreakerInner, to: CircuitState) {
        let from = inner.state;
        inner.state = to;
        inner.generation = inner.generation.wrapping_add(1);
        inner.clear_counters();

        match to {
            CircuitState::Open => error!(
                "🔴 Circuit breaker {} opened ({} -> {}, threshold={}, recovery={:?})",
                self.name, from, to, inner.failure_threshold, self.config.recovery_timeout
            ),
            CircuitState::HalfOpen => info!(
                "🟡 Circuit breaker {} half-open (testing recovery, {} trials)",
                self.name, self.config.half_open_max_requests
            ),
            CircuitState::Closed => info!(
                "🟢 Circuit breaker {} closed ({} -> {})",
                self.name, from, to
            ),
        }

        if from != to {
            // No subscribers is fine.
            let _ = self.transitions.send(StateTransition { from, to });
        }
    }
}
