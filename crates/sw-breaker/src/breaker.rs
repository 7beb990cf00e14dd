//! Circuit Breaker - per-action failure tracking with gradual reopening
//!
//! State machine per action key:
//! - **Closed**: calls pass; consecutive failures are counted and reaching the
//!   threshold opens the action.
//! - **Open**: every call is denied for the cooldown (openness 0).
//! - **HalfOpen**: after the cooldown openness starts at `probe_openness` and
//!   climbs to 100 over `ramp`. Each call is admitted by the provider with
//!   probability `openness / 100`. An admitted success closes the action, an
//!   admitted failure reopens it and restarts the cooldown.
//!
//! Denials never count as failures. Errors and timeouts do.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::action::Action;
use crate::provider::{Participation, Provider};

/// Circuit state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    /// Normal operation
    Closed,
    /// Rejecting every call
    Open,
    /// Probing: admitting a growing share of calls
    HalfOpen,
}

impl Default for CircuitState {
    fn default() -> Self {
        Self::Closed
    }
}

/// Statistics for a single action
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CircuitBreakerStats {
    pub name: String,
    pub state: CircuitState,
    pub openness: u8,
    pub consecutive_failures: u32,
    pub successful_calls: u64,
    pub failed_calls: u64,
    /// Calls denied while open or not admitted while half-open
    pub rejected_calls: u64,
    /// Failed calls that exceeded their budget (also counted in `failed_calls`)
    pub timed_out_calls: u64,
    /// Failure rate (0.0 - 1.0)
    pub failure_rate: f64,
}

/// Configuration shared by every action of one breaker
#[derive(Debug, Clone)]
pub struct BreakerSettings {
    /// Consecutive failures before opening
    pub failure_threshold: u32,
    /// Time an open action denies every call
    pub cooldown: Duration,
    /// Openness right after the cooldown
    pub probe_openness: u8,
    /// Time for openness to reach 100 after the cooldown
    pub ramp: Duration,
    /// Budget used for [`Participation::DefaultBudget`]
    pub default_timeout: Duration,
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown: Duration::from_secs(30),
            probe_openness: 10,
            ramp: Duration::from_secs(60),
            default_timeout: Duration::from_millis(100),
        }
    }
}

/// Why an admitted call failed.
#[derive(Error, Debug)]
pub enum CallFailure<E> {
    #[error(transparent)]
    Error(E),

    #[error("call timed out after {0:?}")]
    TimedOut(Duration),
}

/// Result of a guarded call.
#[derive(Debug)]
pub enum Invocation<T, E, F> {
    Completed(T),
    Failed(CallFailure<E>),
    /// The breaker denied the call and the provider's fallback ran
    Denied(F),
}

impl<T, E, F> Invocation<T, E, F> {
    pub fn is_completed(&self) -> bool {
        matches!(self, Invocation::Completed(_))
    }

    pub fn is_denied(&self) -> bool {
        matches!(self, Invocation::Denied(_))
    }
}

enum Admission {
    Pass,
    Deny,
    Probe(u8),
}

#[derive(Default)]
struct ActionState {
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    successful_calls: u64,
    failed_calls: u64,
    rejected_calls: u64,
    timed_out_calls: u64,
}

impl ActionState {
    /// Current openness; lazily moves Open to HalfOpen once the cooldown is over.
    fn openness(&mut self, settings: &BreakerSettings) -> u8 {
        match self.state {
            CircuitState::Closed => 100,
            CircuitState::Open | CircuitState::HalfOpen => {
                let elapsed = self.opened_at.map(|t| t.elapsed()).unwrap_or(Duration::MAX);
                if elapsed < settings.cooldown {
                    return 0;
                }
                self.state = CircuitState::HalfOpen;

                let probe = settings.probe_openness.min(100);
                if settings.ramp.is_zero() {
                    return 100;
                }
                let ramp_elapsed = (elapsed - settings.cooldown).as_secs_f64();
                let progress = (ramp_elapsed / settings.ramp.as_secs_f64()).min(1.0);
                let openness = probe as f64 + (100 - probe) as f64 * progress;
                openness.floor() as u8
            }
        }
    }
}

/// Per-action breaker; all state transitions happen under one lock.
struct ActionBreaker {
    name: String,
    inner: Mutex<ActionState>,
}

impl ActionBreaker {
    fn new(name: String) -> Self {
        Self {
            name,
            inner: Mutex::new(ActionState::default()),
        }
    }

    fn admission(&self, settings: &BreakerSettings) -> Admission {
        let mut inner = self.inner.lock();
        match inner.openness(settings) {
            _ if inner.state == CircuitState::Closed => Admission::Pass,
            0 => Admission::Deny,
            openness => Admission::Probe(openness),
        }
    }

    fn record_success(&self) {
        let mut inner = self.inner.lock();
        inner.successful_calls += 1;
        inner.consecutive_failures = 0;
        if inner.state != CircuitState::Closed {
            inner.state = CircuitState::Closed;
            inner.opened_at = None;
            info!(action = %self.name, "Circuit closed after successful probe");
        }
    }

    fn record_failure(&self, settings: &BreakerSettings, timed_out: bool) {
        let mut inner = self.inner.lock();
        inner.failed_calls += 1;
        if timed_out {
            inner.timed_out_calls += 1;
        }

        match inner.state {
            CircuitState::Closed => {
                inner.consecutive_failures += 1;
                if inner.consecutive_failures >= settings.failure_threshold {
                    inner.state = CircuitState::Open;
                    inner.opened_at = Some(Instant::now());
                    inner.consecutive_failures = 0;
                    warn!(
                        action = %self.name,
                        threshold = settings.failure_threshold,
                        cooldown_ms = settings.cooldown.as_millis() as u64,
                        "Circuit opened"
                    );
                }
            }
            CircuitState::HalfOpen => {
                inner.state = CircuitState::Open;
                inner.opened_at = Some(Instant::now());
                inner.consecutive_failures = 0;
                warn!(action = %self.name, "Probe failed, circuit reopened");
            }
            CircuitState::Open => {}
        }
    }

    fn record_rejected(&self) {
        self.inner.lock().rejected_calls += 1;
    }

    fn stats(&self, settings: &BreakerSettings) -> CircuitBreakerStats {
        let mut inner = self.inner.lock();
        let openness = inner.openness(settings);
        let total = inner.successful_calls + inner.failed_calls;
        let failure_rate = if total > 0 {
            inner.failed_calls as f64 / total as f64
        } else {
            0.0
        };

        CircuitBreakerStats {
            name: self.name.clone(),
            state: inner.state,
            openness,
            consecutive_failures: inner.consecutive_failures,
            successful_calls: inner.successful_calls,
            failed_calls: inner.failed_calls,
            rejected_calls: inner.rejected_calls,
            timed_out_calls: inner.timed_out_calls,
            failure_rate,
        }
    }

    fn reset(&self) {
        let mut inner = self.inner.lock();
        inner.state = CircuitState::Closed;
        inner.opened_at = None;
        inner.consecutive_failures = 0;
    }
}

/// Invocation wrapper that guards named actions of one service.
pub struct CircuitBreaker {
    service: String,
    breakers: RwLock<HashMap<String, Arc<ActionBreaker>>>,
    settings: BreakerSettings,
}

impl CircuitBreaker {
    pub fn new(service: impl Into<String>, settings: BreakerSettings) -> Self {
        Self {
            service: service.into(),
            breakers: RwLock::new(HashMap::new()),
            settings,
        }
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn settings(&self) -> &BreakerSettings {
        &self.settings
    }

    fn get_or_create(&self, key: &str) -> Arc<ActionBreaker> {
        {
            let breakers = self.breakers.read();
            if let Some(breaker) = breakers.get(key) {
                return Arc::clone(breaker);
            }
        }

        let mut breakers = self.breakers.write();
        Arc::clone(
            breakers
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(ActionBreaker::new(key.to_string()))),
        )
    }

    /// Run `call` as `action` under the provider's policy.
    pub async fn invoke<P, T, E, Fut>(
        &self,
        provider: &P,
        action: &Action,
        args: &P::Args,
        call: Fut,
    ) -> Invocation<T, E, P::Fallback>
    where
        P: Provider + ?Sized,
        Fut: Future<Output = Result<T, E>>,
    {
        let budget = match provider.participation(action, args) {
            Participation::Skip => {
                return match call.await {
                    Ok(value) => Invocation::Completed(value),
                    Err(e) => Invocation::Failed(CallFailure::Error(e)),
                };
            }
            Participation::DefaultBudget => self.settings.default_timeout,
            Participation::Budget(budget) => budget,
        };

        if !provider.is_monitored() {
            return match tokio::time::timeout(budget, call).await {
                Ok(Ok(value)) => Invocation::Completed(value),
                Ok(Err(e)) => Invocation::Failed(CallFailure::Error(e)),
                Err(_) => Invocation::Failed(CallFailure::TimedOut(budget)),
            };
        }

        let key = action.key();
        let breaker = self.get_or_create(&key);

        let admitted = match breaker.admission(&self.settings) {
            Admission::Pass => true,
            Admission::Deny => false,
            Admission::Probe(openness) => {
                let admit = provider.admit_while_degraded(openness, action, args);
                debug!(
                    service = %self.service,
                    action = %key,
                    openness,
                    admitted = admit,
                    "Degraded admission check"
                );
                admit
            }
        };

        if !admitted {
            breaker.record_rejected();
            debug!(service = %self.service, action = %key, "Call denied, running fallback");
            return Invocation::Denied(provider.on_denied(action, args).await);
        }

        match tokio::time::timeout(budget, call).await {
            Ok(Ok(value)) => {
                breaker.record_success();
                Invocation::Completed(value)
            }
            Ok(Err(e)) => {
                breaker.record_failure(&self.settings, false);
                Invocation::Failed(CallFailure::Error(e))
            }
            Err(_) => {
                breaker.record_failure(&self.settings, true);
                warn!(
                    service = %self.service,
                    action = %key,
                    budget_ms = budget.as_millis() as u64,
                    "Call exceeded its budget"
                );
                Invocation::Failed(CallFailure::TimedOut(budget))
            }
        }
    }

    /// State of an action, if it has been called before
    pub fn state(&self, key: &str) -> Option<CircuitState> {
        let breaker = self.breakers.read().get(key).cloned()?;
        let mut inner = breaker.inner.lock();
        inner.openness(&self.settings);
        Some(inner.state)
    }

    /// Openness of an action; unknown actions are fully open to traffic
    pub fn openness(&self, key: &str) -> u8 {
        match self.breakers.read().get(key).cloned() {
            Some(breaker) => breaker.inner.lock().openness(&self.settings),
            None => 100,
        }
    }

    pub fn stats(&self, key: &str) -> Option<CircuitBreakerStats> {
        let breaker = self.breakers.read().get(key).cloned()?;
        Some(breaker.stats(&self.settings))
    }

    pub fn all_stats(&self) -> HashMap<String, CircuitBreakerStats> {
        let breakers: Vec<_> = self.breakers.read().values().cloned().collect();
        breakers
            .iter()
            .map(|b| (b.name.clone(), b.stats(&self.settings)))
            .collect()
    }

    /// Number of actions currently open or half-open
    pub fn open_count(&self) -> usize {
        self.all_stats()
            .values()
            .filter(|s| s.state != CircuitState::Closed)
            .count()
    }

    pub fn reset(&self, key: &str) -> bool {
        match self.breakers.read().get(key) {
            Some(breaker) => {
                breaker.reset();
                true
            }
            None => false,
        }
    }

    pub fn reset_all(&self) {
        for breaker in self.breakers.read().values() {
            breaker.reset();
        }
    }
}
