//! Adaptive circuit breaker.
//!
//! Decorates a [`CircuitBreaker`] with a rolling failure-rate estimate. A
//! background tuner periodically halves the trip threshold when the failure
//! rate runs hot and doubles it (up to 3× the configured base) when things are
//! quiet. Retuning never changes the breaker's current state.

use super::circuit_breaker::{
    BreakerStats, CircuitBreaker, CircuitBreakerConfig, CircuitBreakerError, CircuitState,
    StateTransition,
};
use crate::error::{Error, Result};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// Ceiling on threshold growth, as a multiple of the base threshold.
const MAX_THRESHOLD_MULTIPLIER: u32 = 3;

/// Tuning parameters for [`AdaptiveCircuitBreaker`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdaptiveConfig {
    /// Only requests newer than this count toward the failure rate.
    #[serde(with = "crate::config::duration_ms")]
    pub window: Duration,
    /// Below this rate the threshold doubles.
    pub min_failure_rate: f64,
    /// Above this rate the threshold halves.
    pub max_failure_rate: f64,
    /// Period of the background tuner.
    #[serde(with = "crate::config::duration_ms")]
    pub tune_interval: Duration,
}

impl Default for AdaptiveConfig {
    fn default() -> Self {
        AdaptiveConfig {
            window: Duration::from_secs(60),
            min_failure_rate: 0.05,
            max_failure_rate: 0.25,
            tune_interval: Duration::from_secs(10),
        }
    }
}

impl AdaptiveConfig {
    pub fn validate(&self) -> Result<()> {
        let in_range = |r: f64| (0.0..=1.0).contains(&r);
        if !in_range(self.min_failure_rate) || !in_range(self.max_failure_rate) {
            return Err(Error::ConfigError(
                "adaptive failure rates must lie in [0, 1]".into(),
            ));
        }
        if self.min_failure_rate > self.max_failure_rate {
            return Err(Error::ConfigError(
                "adaptive min_failure_rate exceeds max_failure_rate".into(),
            ));
        }
        if self.window.is_zero() || self.tune_interval.is_zero() {
            return Err(Error::ConfigError(
                "adaptive window and tune_interval must be > 0".into(),
            ));
        }
        Ok(())
    }
}

/// Time-bounded log of request and failure timestamps.
///
/// Entries older than the window are pruned lazily on every record.
#[derive(Debug)]
pub struct FailureWindow {
    window: Duration,
    requests: VecDeque<Instant>,
    failures: VecDeque<Instant>,
}

impl FailureWindow {
    pub fn new(window: Duration) -> Self {
        FailureWindow {
            window,
            requests: VecDeque::new(),
            failures: VecDeque::new(),
        }
    }

    pub fn record_request(&mut self, now: Instant) {
        self.prune(now);
        self.requests.push_back(now);
    }

    pub fn record_failure(&mut self, now: Instant) {
        self.prune(now);
        self.failures.push_back(now);
    }

    /// Failures over requests inside the window; `None` with no requests.
    pub fn failure_rate(&mut self, now: Instant) -> Option<f64> {
        self.prune(now);
        if self.requests.is_empty() {
            return None;
        }
        Some((self.failures.len() as f64 / self.requests.len() as f64).min(1.0))
    }

    /// `(requests, failures)` currently retained.
    pub fn counts(&self) -> (usize, usize) {
        (self.requests.len(), self.failures.len())
    }

    fn prune(&mut self, now: Instant) {
        let Some(cutoff) = now.checked_sub(self.window) else {
            return;
        };
        while self.requests.front().is_some_and(|t| *t < cutoff) {
            self.requests.pop_front();
        }
        while self.failures.front().is_some_and(|t| *t < cutoff) {
            self.failures.pop_front();
        }
    }
}

/// Circuit breaker whose trip threshold follows the observed failure rate.
#[derive(Debug)]
pub struct AdaptiveCircuitBreaker {
    breaker: CircuitBreaker,
    base_failure_threshold: u32,
    config: AdaptiveConfig,
    window: Mutex<FailureWindow>,
}

impl AdaptiveCircuitBreaker {
    pub fn new(
        name: impl Into<String>,
        breaker_config: CircuitBreakerConfig,
        config: AdaptiveConfig,
    ) -> Self {
        let base_failure_threshold = breaker_config.failure_threshold.max(1);
        AdaptiveCircuitBreaker {
            breaker: CircuitBreaker::new(name, breaker_config),
            base_failure_threshold,
            window: Mutex::new(FailureWindow::new(config.window)),
            config,
        }
    }

    pub fn name(&self) -> &str {
        self.breaker.name()
    }

    /// The wrapped fixed-threshold breaker.
    pub fn inner(&self) -> &CircuitBreaker {
        &self.breaker
    }

    pub fn adaptive_config(&self) -> &AdaptiveConfig {
        &self.config
    }

    /// Gate a call; accepted calls are recorded as requests.
    pub fn allow(&self) -> bool {
        self.acquire().is_some()
    }

    /// Gate a call, returning the admission's generation.
    pub fn acquire(&self) -> Option<u64> {
        let generation = self.breaker.acquire()?;
        self.record_request();
        Some(generation)
    }

    pub fn record_request(&self) {
        self.window.lock().record_request(Instant::now());
    }

    pub fn record_success(&self) {
        self.breaker.record_success();
    }

    /// Feeds both the failure window and the wrapped breaker.
    pub fn record_failure(&self) {
        self.window.lock().record_failure(Instant::now());
        self.breaker.record_failure();
    }

    pub fn release_trial(&self, generation: u64) {
        self.breaker.release_trial(generation);
    }

    pub fn state(&self) -> CircuitState {
        self.breaker.state()
    }

    pub fn stats(&self) -> BreakerStats {
        self.breaker.stats()
    }

    pub fn failure_threshold(&self) -> u32 {
        self.breaker.failure_threshold()
    }

    pub fn reset(&self) {
        self.breaker.reset();
    }

    pub fn force_open(&self) {
        self.breaker.force_open();
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StateTransition> {
        self.breaker.subscribe()
    }

    /// Rolling failure rate right now, if any requests are in the window.
    pub fn failure_rate(&self) -> Option<f64> {
        self.window.lock().failure_rate(Instant::now())
    }

    /// Adjust the trip threshold from the current failure rate.
    ///
    /// Returns the threshold in force afterwards, or `None` when the window
    /// holds no requests and nothing was changed.
    pub fn retune(&self) -> Option<u32> {
        let rate = self.failure_rate()?;
        let ceiling = self.base_failure_threshold * MAX_THRESHOLD_MULTIPLIER;
        let (min, max) = (self.config.min_failure_rate, self.config.max_failure_rate);

        let (old, new) = self.breaker.update_failure_threshold(|current| {
            if rate > max {
                (current / 2).max(1)
            } else if rate < min {
                current.saturating_mul(2).min(ceiling)
            } else {
                current
            }
        });

        if old != new {
            info!(
                "Breaker {}: failure rate {:.3} retuned threshold {} -> {}",
                self.name(),
                rate,
                old,
                new
            );
        }
        Some(new)
    }

    /// Start the periodic tuner on the current tokio runtime.
    ///
    /// The task holds only a weak reference and exits once the breaker is
    /// dropped. No lock is held across ticks.
    pub fn spawn_tuner(self: &Arc<Self>) -> JoinHandle<()> {
        let weak = Arc::downgrade(self);
        let period = self.config.tune_interval;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // First tick fires immediately.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(breaker) = weak.upgrade() else {
                    debug!("Adaptive tuner stopping: breaker dropped");
                    break;
                };
                breaker.retune();
            }
        })
    }

    /// Run `operation` behind the breaker, recording its outcome.
    pub async fn call<F, T, E, Fut>(&self, operation: F) -> std::result::Result<T, CircuitBreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
    {
        if !self.allow() {
            return Err(CircuitBreakerError::CircuitOpen {
                component: self.name().to_string(),
            });
        }

        let result = operation().await;
        match &result {
            Ok(_) => self.record_success(),
            Err(_) => self.record_failure(),
        }
        result.map_err(CircuitBreakerError::OperationFailed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn adaptive(base: u32) -> AdaptiveCircuitBreaker {
        AdaptiveCircuitBreaker::new(
            "adaptive",
            CircuitBreakerConfig {
                failure_threshold: base,
                recovery_timeout: Duration::from_secs(60),
                ..Default::default()
            },
            AdaptiveConfig {
                window: Duration::from_secs(60),
                min_failure_rate: 0.1,
                max_failure_rate: 0.5,
                tune_interval: Duration::from_millis(100),
            },
        )
    }

    fn traffic(breaker: &AdaptiveCircuitBreaker, requests: usize, failures: usize) {
        for i in 0..requests {
            assert!(breaker.allow());
            if i < failures {
                breaker.record_failure();
            } else {
                breaker.record_success();
            }
        }
    }

    #[test]
    fn test_window_prunes_old_entries() {
        let mut window = FailureWindow::new(Duration::from_millis(100));
        let start = Instant::now();
        window.record_request(start);
        window.record_failure(start);
        assert_eq!(window.failure_rate(start), Some(1.0));

        let later = start + Duration::from_millis(250);
        window.record_request(later);
        assert_eq!(window.counts(), (1, 0));
        assert_eq!(window.failure_rate(later), Some(0.0));
    }

    #[test]
    fn test_empty_window_has_no_rate() {
        let breaker = adaptive(8);
        assert_eq!(breaker.failure_rate(), None);
        assert_eq!(breaker.retune(), None);
        assert_eq!(breaker.failure_threshold(), 8);
    }

    #[test]
    fn test_high_failure_rate_halves_threshold() {
        let breaker = adaptive(20);
        traffic(&breaker, 10, 6);
        assert_eq!(breaker.state(), CircuitState::Closed);

        assert_eq!(breaker.retune(), Some(10));
        assert_eq!(breaker.retune(), Some(5));
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[test]
    fn test_low_failure_rate_doubles_up_to_cap() {
        let breaker = adaptive(4);
        traffic(&breaker, 50, 0);

        assert_eq!(breaker.retune(), Some(8));
        assert_eq!(breaker.retune(), Some(12));
        assert_eq!(breaker.retune(), Some(12));
    }

    #[test]
    fn test_moderate_rate_leaves_threshold() {
        let breaker = adaptive(10);
        traffic(&breaker, 10, 3);
        assert_eq!(breaker.retune(), Some(10));
    }

    #[test]
    fn test_retune_does_not_change_state() {
        let breaker = adaptive(2);
        traffic(&breaker, 2, 2);
        assert_eq!(breaker.state(), CircuitState::Open);

        assert_eq!(breaker.retune(), Some(1));
        assert_eq!(breaker.state(), CircuitState::Open);
        // Floor of one.
        assert_eq!(breaker.retune(), Some(1));
    }

    #[test]
    fn test_rejected_calls_are_not_requests() {
        let breaker = adaptive(1);
        traffic(&breaker, 1, 1);
        assert!(!breaker.allow());
        assert!(!breaker.allow());
        assert_eq!(breaker.failure_rate(), Some(1.0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_background_tuner_retunes() {
        let breaker = Arc::new(adaptive(20));
        traffic(&breaker, 10, 8);

        let handle = breaker.spawn_tuner();
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(breaker.failure_threshold() < 20);

        drop(breaker);
        tokio::time::sleep(Duration::from_millis(250)).await;
        assert!(handle.is_finished());
    }

    #[tokio::test]
    async fn test_call_records_requests() {
        let breaker = adaptive(5);
        let _ = breaker.call(|| async { Err::<(), _>("nope") }).await;
        let ok = breaker.call(|| async { Ok::<_, String>(1) }).await;
        assert_eq!(ok.unwrap(), 1);
        assert_eq!(breaker.failure_rate(), Some(0.5));
    }

    #[test]
    fn test_config_validation() {
        assert!(AdaptiveConfig::default().validate().is_ok());
        let inverted = AdaptiveConfig {
            min_failure_rate: 0.6,
            max_failure_rate: 0.2,
            ..Default::default()
        };
        assert!(inverted.validate().is_err());
        let out_of_range = AdaptiveConfig {
            max_failure_rate: 1.5,
            ..Default::default()
        };
        assert!(out_of_range.validate().is_err());
    }
}
