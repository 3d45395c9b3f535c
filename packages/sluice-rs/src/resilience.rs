//! Retry with backoff and per-effect circuit breaking for async effects.
//!
//! [`RetryMiddleware`] decorates async effects. A wrapped effect is retried
//! with exponential backoff and a per-attempt timeout. When attempts are
//! exhausted, or the effect's circuit is open, the decorator returns a single
//! [`ServiceUnavailable`] action in place of the effect's normal output.
//!
//! # Circuit states
//!
//! ```text
//!            threshold consecutive failures
//!   Closed ───────────────────────────────► Open
//!     ▲                                      │
//!     │ probe succeeds                       │ open_duration elapsed
//!     │                                      ▼
//!     └──────────────────────────────── HalfOpen
//!                    probe fails: back to Open
//! ```
//!
//! # Example
//!
//! ```ignore
//! let retry = RetryMiddleware::new(ResilienceConfig::default());
//!
//! let engine = EngineBuilder::new()
//!     .with_effect(retry.wrap(SyncTodos::new(api)))
//!     .build()?;
//!
//! // later
//! assert_eq!(retry.circuit_state("sync-todos"), Some(CircuitState::Closed));
//! ```

use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use dashmap::DashMap;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::{millis, ResilienceConfig};
use crate::core::Action;
use crate::effect_impl::AsyncEffect;
use crate::error::panic_message;
use crate::state::RootState;

/// Action type dispatched when a resilient effect gives up.
pub const SERVICE_UNAVAILABLE: &str = "ServiceUnavailable";

// =============================================================================
// Retry policy
// =============================================================================

/// Attempt limit, backoff and timeout for one effect.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    /// Delay after the first failure; doubles after each further failure.
    #[serde(rename = "base_backoff_ms", with = "millis")]
    pub base_backoff: Duration,
    /// Upper bound for the delay between attempts.
    #[serde(rename = "max_backoff_ms", with = "millis")]
    pub max_backoff: Duration,
    /// Limit for a single attempt; exceeding it counts as a failure.
    #[serde(rename = "attempt_timeout_ms", with = "millis")]
    pub attempt_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(5),
            attempt_timeout: Duration::from_secs(10),
        }
    }
}

impl RetryPolicy {
    /// Delay after failed attempt number `attempt` (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.base_backoff
            .checked_mul(1u32 << exponent)
            .unwrap_or(self.max_backoff)
            .min(self.max_backoff)
    }
}

// =============================================================================
// Circuit breaker
// =============================================================================

/// State of one effect's circuit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CircuitState {
    /// Calls flow normally.
    Closed,
    /// Calls are rejected until the open window elapses.
    Open,
    /// One probe call is allowed through.
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half_open"),
        }
    }
}

/// Thresholds for a circuit breaker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Consecutive failed attempts that open the circuit.
    pub failure_threshold: u32,
    /// How long the circuit stays open before allowing a probe.
    #[serde(rename = "open_duration_ms", with = "millis")]
    pub open_duration: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            open_duration: Duration::from_secs(30),
        }
    }
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    probe_in_flight: bool,
}

/// Failure-count driven Closed/Open/HalfOpen state machine.
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                opened_at: None,
                probe_in_flight: false,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BreakerInner> {
        self.inner.lock().unwrap_or_else(|poisoned| {
            warn!(circuit = %self.name, "circuit lock poisoned, recovering");
            poisoned.into_inner()
        })
    }

    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.lock().consecutive_failures
    }

    /// Ask to make a call.
    ///
    /// Closed always admits. Open admits nothing until `open_duration` has
    /// passed, then moves to HalfOpen and admits exactly one probe.
    pub fn try_acquire(&self) -> bool {
        let mut inner = self.lock();
        match inner.state {
            CircuitState::Closed => true,
            CircuitState::Open => {
                let elapsed = inner
                    .opened_at
                    .map(|at| at.elapsed() >= self.config.open_duration)
                    .unwrap_or(true);
                if elapsed {
                    info!(circuit = %self.name, "circuit half-open, probing");
                    inner.state = CircuitState::HalfOpen;
                    inner.probe_in_flight = true;
                    true
                } else {
                    false
                }
            }
            CircuitState::HalfOpen => {
                if inner.probe_in_flight {
                    false
                } else {
                    inner.probe_in_flight = true;
                    true
                }
            }
        }
    }

    /// Give back a HalfOpen probe slot without reporting an outcome.
    ///
    /// Used when a probe call is cancelled before it finishes; the circuit
    /// stays HalfOpen and admits the next caller as its probe.
    pub fn release_probe(&self) {
        let mut inner = self.lock();
        if inner.state == CircuitState::HalfOpen && inner.probe_in_flight {
            debug!(circuit = %self.name, "probe abandoned, slot released");
            inner.probe_in_flight = false;
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.lock();
        if inner.state != CircuitState::Closed {
            info!(circuit = %self.name, from = %inner.state, "circuit closed");
        }
        inner.state = CircuitState::Closed;
        inner.consecutive_failures = 0;
        inner.opened_at = None;
        inner.probe_in_flight = false;
    }

    pub fn record_failure(&self) {
        let mut inner = self.lock();
        inner.consecutive_failures = inner.consecutive_failures.saturating_add(1);
        inner.probe_in_flight = false;

        let should_open = match inner.state {
            CircuitState::HalfOpen => true,
            CircuitState::Closed => inner.consecutive_failures >= self.config.failure_threshold,
            CircuitState::Open => false,
        };
        if should_open {
            warn!(
                circuit = %self.name,
                failures = inner.consecutive_failures,
                "circuit opened"
            );
            inner.state = CircuitState::Open;
            inner.opened_at = Some(Instant::now());
        }
    }
}

// =============================================================================
// ServiceUnavailable
// =============================================================================

/// Fallback produced when a resilient effect gives up.
///
/// Wire shape of the payload: `{ "reason": "...", "originalAction": { ... } }`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceUnavailable {
    pub reason: String,
    pub original_action: Action,
}

impl ServiceUnavailable {
    pub fn new(reason: impl Into<String>, original_action: Action) -> Self {
        Self {
            reason: reason.into(),
            original_action,
        }
    }

    /// Wrap into an error-flagged action of type [`SERVICE_UNAVAILABLE`].
    pub fn into_action(self) -> Action {
        let payload = serde_json::json!({
            "reason": self.reason,
            "originalAction": self.original_action,
        });
        Action::new(SERVICE_UNAVAILABLE)
            .with_payload_value(payload)
            .as_error()
    }

    /// Decode from a dispatched action, if it is one.
    pub fn from_action(action: &Action) -> Option<Self> {
        if !action.is(SERVICE_UNAVAILABLE) {
            return None;
        }
        action.payload_as().ok()
    }
}

// =============================================================================
// Retry middleware
// =============================================================================

/// Owns one circuit per wrapped effect and produces resilient decorators.
#[derive(Clone)]
pub struct RetryMiddleware {
    config: ResilienceConfig,
    circuits: Arc<DashMap<String, Arc<CircuitBreaker>>>,
}

impl RetryMiddleware {
    pub fn new(config: ResilienceConfig) -> Self {
        Self {
            config,
            circuits: Arc::new(DashMap::new()),
        }
    }

    pub fn config(&self) -> &ResilienceConfig {
        &self.config
    }

    /// Wrap an effect with the default retry policy.
    pub fn wrap<E: AsyncEffect>(&self, effect: E) -> Resilient<E> {
        let policy = self.config.retry.clone();
        self.wrap_with(effect, policy)
    }

    /// Wrap an effect with its own retry policy.
    ///
    /// Effects sharing a name share a circuit.
    pub fn wrap_with<E: AsyncEffect>(&self, effect: E, policy: RetryPolicy) -> Resilient<E> {
        let name = effect.name().to_string();
        let breaker = self
            .circuits
            .entry(name.clone())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(name, self.config.breaker.clone())))
            .clone();
        Resilient {
            effect,
            policy,
            breaker,
        }
    }

    /// Circuit state of the effect registered under `name`.
    pub fn circuit_state(&self, name: &str) -> Option<CircuitState> {
        self.circuits.get(name).map(|breaker| breaker.state())
    }

    /// The circuit for `name`, if one was created.
    pub fn circuit(&self, name: &str) -> Option<Arc<CircuitBreaker>> {
        self.circuits.get(name).map(|breaker| breaker.clone())
    }
}

impl fmt::Debug for RetryMiddleware {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryMiddleware")
            .field("config", &self.config)
            .field("circuits", &self.circuits.len())
            .finish()
    }
}

/// Reports one admitted call's outcome to its circuit.
///
/// Dropped without a report (the call's future was cancelled), it releases
/// any probe slot the call held.
struct CallPermit<'a> {
    breaker: &'a CircuitBreaker,
    reported: bool,
}

impl<'a> CallPermit<'a> {
    fn new(breaker: &'a CircuitBreaker) -> Self {
        Self {
            breaker,
            reported: false,
        }
    }

    fn success(&mut self) {
        self.reported = true;
        self.breaker.record_success();
    }

    fn failure(&mut self) {
        self.reported = true;
        self.breaker.record_failure();
    }
}

impl Drop for CallPermit<'_> {
    fn drop(&mut self) {
        if !self.reported {
            self.breaker.release_probe();
        }
    }
}

/// An async effect decorated with retry and circuit breaking.
pub struct Resilient<E> {
    effect: E,
    policy: RetryPolicy,
    breaker: Arc<CircuitBreaker>,
}

impl<E> Resilient<E> {
    pub fn circuit(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }
}

#[async_trait]
impl<E: AsyncEffect> AsyncEffect for Resilient<E> {
    fn name(&self) -> &str {
        self.effect.name()
    }

    fn matches(&self, action: &Action) -> bool {
        self.effect.matches(action)
    }

    async fn run(&self, action: Action, state: RootState) -> Result<Vec<Action>> {
        let name = self.effect.name();

        if !self.breaker.try_acquire() {
            debug!(effect = name, "circuit open, skipping effect");
            return Ok(vec![ServiceUnavailable::new("circuit open", action).into_action()]);
        }

        let mut permit = CallPermit::new(&self.breaker);
        let max_attempts = self.policy.max_attempts.max(1);
        let mut last_reason = String::new();

        for attempt in 1..=max_attempts {
            let call = AssertUnwindSafe(self.effect.run(action.clone(), state.clone())).catch_unwind();
            let reason = match tokio::time::timeout(self.policy.attempt_timeout, call).await {
                Ok(Ok(Ok(outputs))) => {
                    permit.success();
                    return Ok(outputs);
                }
                Ok(Ok(Err(e))) => format!("{:#}", e),
                Ok(Err(panic)) => format!("effect panicked: {}", panic_message(panic.as_ref())),
                Err(_) => format!("attempt timed out after {:?}", self.policy.attempt_timeout),
            };

            warn!(effect = name, attempt, max_attempts, reason = %reason, "effect attempt failed");
            permit.failure();
            last_reason = reason;

            if self.breaker.state() == CircuitState::Open {
                break;
            }
            if attempt < max_attempts {
                tokio::time::sleep(self.policy.backoff(attempt)).await;
            }
        }

        Ok(vec![ServiceUnavailable::new(last_reason, action).into_action()])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::effect_impl::{effect_fn, ActionFilter};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            base_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(4),
            attempt_timeout: Duration::from_millis(200),
        }
    }

    fn config(threshold: u32, open_ms: u64) -> ResilienceConfig {
        ResilienceConfig {
            retry: fast_policy(3),
            breaker: CircuitBreakerConfig {
                failure_threshold: threshold,
                open_duration: Duration::from_millis(open_ms),
            },
        }
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = RetryPolicy {
            base_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_millis(350),
            ..RetryPolicy::default()
        };
        assert_eq!(policy.backoff(1), Duration::from_millis(100));
        assert_eq!(policy.backoff(2), Duration::from_millis(200));
        assert_eq!(policy.backoff(3), Duration::from_millis(350));
        assert_eq!(policy.backoff(60), Duration::from_millis(350));
    }

    #[test]
    fn test_breaker_opens_at_threshold() {
        let breaker = CircuitBreaker::new("x", CircuitBreakerConfig {
            failure_threshold: 2,
            open_duration: Duration::from_secs(60),
        });

        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Closed);
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(!breaker.try_acquire());
    }

    #[test]
    fn test_success_resets_failure_count() {
        let breaker = CircuitBreaker::new("x", CircuitBreakerConfig::default());
        breaker.record_failure();
        breaker.record_failure();
        breaker.record_success();
        breaker.record_failure();
        assert_eq!(breaker.consecutive_failures(), 1);
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_breaker_half_open_probe_cycle() {
        let breaker = CircuitBreaker::new("x", CircuitBreakerConfig {
            failure_threshold: 1,
            open_duration: Duration::from_millis(20),
        });

        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(!breaker.try_acquire());

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(breaker.try_acquire());
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        // Only one probe at a time.
        assert!(!breaker.try_acquire());

        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Open);

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(breaker.try_acquire());
        breaker.record_success();
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert!(breaker.try_acquire());
    }

    #[tokio::test]
    async fn test_exhausted_retries_yield_one_service_unavailable() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let attempts_c = attempts.clone();
        let flaky = effect_fn("payments", ActionFilter::of_type("Charge"), move |_, _| {
            attempts_c.fetch_add(1, Ordering::SeqCst);
            async { Err::<Vec<Action>, _>(anyhow::anyhow!("gateway down")) }
        });

        let retry = RetryMiddleware::new(config(3, 60_000));
        let resilient = retry.wrap(flaky);
        let trigger = Action::new("Charge").with_payload(&42).unwrap();

        let outputs = resilient.run(trigger.clone(), RootState::default()).await.unwrap();

        assert_eq!(attempts.load(Ordering::SeqCst), 3);
        assert_eq!(outputs.len(), 1);
        assert!(outputs[0].is(SERVICE_UNAVAILABLE));
        assert!(outputs[0].is_error());
        let fallback = ServiceUnavailable::from_action(&outputs[0]).unwrap();
        assert_eq!(fallback.original_action, trigger);
        assert!(fallback.reason.contains("gateway down"));
        assert_eq!(retry.circuit_state("payments"), Some(CircuitState::Open));
    }

    #[tokio::test]
    async fn test_open_circuit_short_circuits() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let attempts_c = attempts.clone();
        let flaky = effect_fn("search", ActionFilter::Any, move |_, _| {
            attempts_c.fetch_add(1, Ordering::SeqCst);
            async { Err::<Vec<Action>, _>(anyhow::anyhow!("timeout")) }
        });

        let retry = RetryMiddleware::new(config(3, 60_000));
        let resilient = retry.wrap(flaky);

        resilient.run(Action::new("Q"), RootState::default()).await.unwrap();
        assert_eq!(attempts.load(Ordering::SeqCst), 3);

        let outputs = resilient.run(Action::new("Q"), RootState::default()).await.unwrap();
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
        assert_eq!(
            ServiceUnavailable::from_action(&outputs[0]).unwrap().reason,
            "circuit open"
        );
    }

    #[tokio::test]
    async fn test_recovers_after_transient_failure() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let attempts_c = attempts.clone();
        let flaky = effect_fn("sync", ActionFilter::Any, move |_, _| {
            let n = attempts_c.fetch_add(1, Ordering::SeqCst);
            async move {
                if n == 0 {
                    anyhow::bail!("blip");
                }
                Ok(vec![Action::new("Synced")])
            }
        });

        let retry = RetryMiddleware::new(config(3, 60_000));
        let outputs = retry
            .wrap(flaky)
            .run(Action::new("Sync"), RootState::default())
            .await
            .unwrap();

        assert_eq!(outputs, vec![Action::new("Synced")]);
        assert_eq!(retry.circuit_state("sync"), Some(CircuitState::Closed));
        assert_eq!(retry.circuit("sync").unwrap().consecutive_failures(), 0);
    }

    #[tokio::test]
    async fn test_attempt_timeout_counts_as_failure() {
        let slow = effect_fn("slow", ActionFilter::Any, |_, _| async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(vec![])
        });

        let retry = RetryMiddleware::new(config(3, 60_000));
        let resilient = retry.wrap_with(
            slow,
            RetryPolicy {
                max_attempts: 2,
                attempt_timeout: Duration::from_millis(10),
                ..fast_policy(2)
            },
        );

        let outputs = resilient.run(Action::new("Go"), RootState::default()).await.unwrap();

        let fallback = ServiceUnavailable::from_action(&outputs[0]).unwrap();
        assert!(fallback.reason.contains("timed out"));
        assert_eq!(resilient.circuit().consecutive_failures(), 2);
    }

    #[tokio::test]
    async fn test_half_open_probe_success_closes_circuit() {
        let healthy = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let healthy_c = healthy.clone();
        let effect = effect_fn("probe", ActionFilter::Any, move |_, _| {
            let ok = healthy_c.load(Ordering::SeqCst);
            async move {
                anyhow::ensure!(ok, "still down");
                Ok(vec![])
            }
        });

        let retry = RetryMiddleware::new(config(1, 20));
        let resilient = retry.wrap(effect);

        resilient.run(Action::new("Go"), RootState::default()).await.unwrap();
        assert_eq!(retry.circuit_state("probe"), Some(CircuitState::Open));

        healthy.store(true, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(30)).await;

        let outputs = resilient.run(Action::new("Go"), RootState::default()).await.unwrap();
        assert!(outputs.is_empty());
        assert_eq!(retry.circuit_state("probe"), Some(CircuitState::Closed));
    }

    #[test]
    fn test_service_unavailable_wire_shape() {
        let action = ServiceUnavailable::new("down", Action::new("Charge")).into_action();
        assert_eq!(
            serde_json::to_value(&action).unwrap(),
            serde_json::json!({
                "type": "ServiceUnavailable",
                "payload": { "reason": "down", "originalAction": { "type": "Charge" } },
                "error": true
            })
        );
        assert!(ServiceUnavailable::from_action(&Action::new("Other")).is_none());
    }

    #[tokio::test]
    async fn test_cancelled_probe_releases_half_open_slot() {
        let effect = effect_fn("hang", ActionFilter::Any, |_, _| async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(vec![])
        });

        let retry = RetryMiddleware::new(config(1, 20));
        let resilient = retry.wrap_with(
            effect,
            RetryPolicy {
                attempt_timeout: Duration::from_secs(30),
                ..fast_policy(1)
            },
        );
        let breaker = resilient.circuit().clone();
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Open);
        tokio::time::sleep(Duration::from_millis(30)).await;

        // The probe call is dropped mid-flight.
        let cancelled = tokio::time::timeout(
            Duration::from_millis(20),
            resilient.run(Action::new("Go"), RootState::default()),
        )
        .await;
        assert!(cancelled.is_err());

        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        assert!(breaker.try_acquire());
        assert!(!breaker.try_acquire());
    }

    #[test]
    fn test_release_probe_ignored_outside_half_open() {
        let breaker = CircuitBreaker::new("x", CircuitBreakerConfig::default());
        breaker.release_probe();
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert!(breaker.try_acquire());
    }
}
