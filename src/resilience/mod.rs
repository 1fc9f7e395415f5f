//! # Resilience Module
//!
//! Failure isolation for backing-store calls.
//!
//! ## Architecture
//!
//! - **[`CircuitBreaker`]**: fixed-threshold closed/open/half-open gate
//! - **[`AdaptiveCircuitBreaker`]**: retunes the trip threshold from a rolling failure rate
//! - **[`Breaker`]**: the seam the engine consumes, implemented by both
//!
//! ## Usage
//!
//! ```rust
//! use cache_mesh::resilience::{Breaker, CircuitBreaker, CircuitBreakerConfig};
//! use std::time::Duration;
//!
//! let breaker = CircuitBreaker::new("backend", CircuitBreakerConfig {
//!     failure_threshold: 5,
//!     success_threshold: 3,
//!     recovery_timeout: Duration::from_secs(30),
//!     half_open_max_requests: 3,
//! });
//!
//! if breaker.allow() {
//!     // ... call the backend ...
//!     breaker.record_success();
//! }
//! ```

pub mod adaptive;
pub mod circuit_breaker;

pub use adaptive::{AdaptiveCircuitBreaker, AdaptiveConfig, FailureWindow};
pub use circuit_breaker::{
    BreakerStats, CircuitBreaker, CircuitBreakerConfig, CircuitBreakerError, CircuitState,
    StateTransition,
};

use tokio::sync::broadcast;

/// Gate consulted before every backend call.
pub trait Breaker: Send + Sync {
    fn name(&self) -> &str;

    /// Whether the next call may proceed.
    fn allow(&self) -> bool {
        self.acquire().is_some()
    }

    /// Admit a call and return its generation, or `None` when rejected. Must
    /// be paired with exactly one of `record_success`, `record_failure` or
    /// `release_trial`.
    fn acquire(&self) -> Option<u64>;

    fn record_success(&self);

    fn record_failure(&self);

    /// Give back an admitted call that never produced an outcome. A no-op if
    /// the breaker changed state since `generation` was handed out.
    fn release_trial(&self, generation: u64);

    fn state(&self) -> CircuitState;

    fn stats(&self) -> BreakerStats;

    fn subscribe(&self) -> broadcast::Receiver<StateTransition>;

    /// Force Closed and clear all counters.
    fn reset(&self);

    /// Force Open, e.g. for maintenance.
    fn force_open(&self);
}

impl Breaker for CircuitBreaker {
    fn name(&self) -> &str {
        CircuitBreaker::name(self)
    }

    fn acquire(&self) -> Option<u64> {
        CircuitBreaker::acquire(self)
    }

    fn record_success(&self) {
        CircuitBreaker::record_success(self)
    }

    fn record_failure(&self) {
        CircuitBreaker::record_failure(self)
    }

    fn release_trial(&self, generation: u64) {
        CircuitBreaker::release_trial(self, generation)
    }

    fn state(&self) -> CircuitState {
        CircuitBreaker::state(self)
    }

    fn stats(&self) -> BreakerStats {
        CircuitBreaker::stats(self)
    }

    fn subscribe(&self) -> broadcast::Receiver<StateTransition> {
        CircuitBreaker::subscribe(self)
    }

    fn reset(&self) {
        CircuitBreaker::reset(self)
    }

    fn force_open(&self) {
        CircuitBreaker::force_open(self)
    }
}

impl Breaker for AdaptiveCircuitBreaker {
    fn name(&self) -> &str {
        AdaptiveCircuitBreaker::name(self)
    }

    fn acquire(&self) -> Option<u64> {
        AdaptiveCircuitBreaker::acquire(self)
    }

    fn record_success(&self) {
        AdaptiveCircuitBreaker::record_success(self)
    }

    fn record_failure(&self) {
        AdaptiveCircuitBreaker::record_failure(self)
    }

    fn release_trial(&self, generation: u64) {
        AdaptiveCircuitBreaker::release_trial(self, generation)
    }

    fn state(&self) -> CircuitState {
        AdaptiveCircuitBreaker::state(self)
    }

    fn stats(&self) -> BreakerStats {
        AdaptiveCircuitBreaker::stats(self)
    }

    fn subscribe(&self) -> broadcast::Receiver<StateTransition> {
        AdaptiveCircuitBreaker::subscribe(self)
    }

    fn reset(&self) {
        AdaptiveCircuitBreaker::reset(self)
    }

    fn force_open(&self) {
        AdaptiveCircuitBreaker::force_open(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    fn gates() -> Vec<Arc<dyn Breaker>> {
        let config = CircuitBreakerConfig {
            failure_threshold: 2,
            ..Default::default()
        };
        vec![
            Arc::new(CircuitBreaker::new("fixed", config.clone())),
            Arc::new(AdaptiveCircuitBreaker::new(
                "adaptive",
                config,
                AdaptiveConfig {
                    window: Duration::from_secs(5),
                    ..Default::default()
                },
            )),
        ]
    }

    #[test]
    fn test_both_gates_trip_through_trait() {
        for gate in gates() {
            assert!(gate.allow());
            gate.record_failure();
            assert!(gate.allow());
            gate.record_failure();
            assert_eq!(gate.state(), CircuitState::Open, "{}", gate.name());
            assert!(!gate.allow());
            assert_eq!(gate.stats().total_rejections, 1);

            gate.reset();
            assert_eq!(gate.state(), CircuitState::Closed);
            gate.force_open();
            assert!(!gate.allow());
        }
    }
}
