//! CircuitBreaker Tests
//!
//! Tests for:
//! - Threshold tripping and denial fallbacks
//! - Cooldown, probing and reclosing
//! - Timeouts counting as failures
//! - Skipped and unmonitored providers

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;

use sw_breaker::{
    Action, BreakerSettings, CallFailure, CircuitBreaker, CircuitState, Invocation, Participation,
    Provider,
};

/// Mock provider that records fallbacks and lets tests pick the policy
struct MockProvider {
    denied: AtomicU32,
    participation: Participation,
    monitored: bool,
}

impl MockProvider {
    fn new() -> Self {
        Self {
            denied: AtomicU32::new(0),
            participation: Participation::DefaultBudget,
            monitored: true,
        }
    }

    fn with_participation(participation: Participation) -> Self {
        Self {
            participation,
            ..Self::new()
        }
    }

    fn unmonitored() -> Self {
        Self {
            monitored: false,
            ..Self::new()
        }
    }

    fn denied(&self) -> u32 {
        self.denied.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Provider for MockProvider {
    type Args = ();
    type Fallback = &'static str;

    fn participation(&self, _action: &Action, _args: &()) -> Participation {
        self.participation
    }

    async fn on_denied(&self, _action: &Action, _args: &()) -> &'static str {
        self.denied.fetch_add(1, Ordering::SeqCst);
        "fallback"
    }

    fn is_monitored(&self) -> bool {
        self.monitored
    }
}

fn settings(threshold: u32, cooldown_ms: u64) -> BreakerSettings {
    BreakerSettings {
        failure_threshold: threshold,
        cooldown: Duration::from_millis(cooldown_ms),
        probe_openness: 100,
        ramp: Duration::ZERO,
        default_timeout: Duration::from_millis(200),
    }
}

async fn fail(
    breaker: &CircuitBreaker,
    provider: &MockProvider,
    action: &Action,
) -> Invocation<(), &'static str, &'static str> {
    breaker
        .invoke(provider, action, &(), async { Err::<(), _>("boom") })
        .await
}

async fn succeed(
    breaker: &CircuitBreaker,
    provider: &MockProvider,
    action: &Action,
) -> Invocation<u32, &'static str, &'static str> {
    breaker
        .invoke(provider, action, &(), async { Ok::<_, &'static str>(7) })
        .await
}

#[tokio::test]
async fn test_closed_call_completes() {
    let breaker = CircuitBreaker::new("test", settings(3, 1000));
    let provider = MockProvider::new();
    let action = Action::publish("q1");

    match succeed(&breaker, &provider, &action).await {
        Invocation::Completed(v) => assert_eq!(v, 7),
        other => panic!("unexpected: {:?}", other),
    }
    assert_eq!(breaker.state("publish:q1"), Some(CircuitState::Closed));
    assert_eq!(provider.denied(), 0);
}

#[tokio::test]
async fn test_threshold_opens_and_denies() {
    let breaker = CircuitBreaker::new("test", settings(3, 10_000));
    let provider = MockProvider::new();
    let action = Action::publish("q1");

    for _ in 0..3 {
        assert!(matches!(
            fail(&breaker, &provider, &action).await,
            Invocation::Failed(CallFailure::Error("boom"))
        ));
    }
    assert_eq!(breaker.state("publish:q1"), Some(CircuitState::Open));
    assert_eq!(breaker.openness("publish:q1"), 0);

    let calls = AtomicU32::new(0);
    let result = breaker
        .invoke(&provider, &action, &(), async {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok::<_, &'static str>(())
        })
        .await;

    assert!(matches!(result, Invocation::Denied("fallback")));
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert_eq!(provider.denied(), 1);
    assert_eq!(breaker.open_count(), 1);
}

#[tokio::test]
async fn test_actions_are_isolated() {
    let breaker = CircuitBreaker::new("test", settings(1, 10_000));
    let provider = MockProvider::new();

    fail(&breaker, &provider, &Action::publish("orders")).await;

    assert!(succeed(&breaker, &provider, &Action::publish("mail")).await.is_completed());
    assert_eq!(breaker.state("publish:orders"), Some(CircuitState::Open));
    assert_eq!(breaker.state("publish:mail"), Some(CircuitState::Closed));
}

#[tokio::test]
async fn test_denials_do_not_count_as_failures() {
    let breaker = CircuitBreaker::new("test", settings(1, 10_000));
    let provider = MockProvider::new();
    let action = Action::open_channel();

    fail(&breaker, &provider, &action).await;
    for _ in 0..5 {
        assert!(fail(&breaker, &provider, &action).await.is_denied());
    }

    let stats = breaker.stats("open-channel").unwrap();
    assert_eq!(stats.failed_calls, 1);
    assert_eq!(stats.rejected_calls, 5);
}

#[tokio::test]
async fn test_probe_success_closes() {
    let breaker = CircuitBreaker::new("test", settings(1, 30));
    let provider = MockProvider::new();
    let action = Action::establish_connection();

    fail(&breaker, &provider, &action).await;
    assert!(succeed(&breaker, &provider, &action).await.is_denied());

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(breaker.state("establish-connection"), Some(CircuitState::HalfOpen));

    assert!(succeed(&breaker, &provider, &action).await.is_completed());
    assert_eq!(breaker.state("establish-connection"), Some(CircuitState::Closed));
    assert_eq!(breaker.openness("establish-connection"), 100);
}

#[tokio::test]
async fn test_probe_failure_reopens() {
    let breaker = CircuitBreaker::new("test", settings(1, 30));
    let provider = MockProvider::new();
    let action = Action::publish("q1");

    fail(&breaker, &provider, &action).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert!(matches!(fail(&breaker, &provider, &action).await, Invocation::Failed(_)));
    assert_eq!(breaker.state("publish:q1"), Some(CircuitState::Open));
    assert!(succeed(&breaker, &provider, &action).await.is_denied());
}

#[tokio::test]
async fn test_zero_probe_openness_denies_until_ramp() {
    let breaker = CircuitBreaker::new(
        "test",
        BreakerSettings {
            probe_openness: 0,
            ramp: Duration::from_secs(3600),
            ..settings(1, 10)
        },
    );
    let provider = MockProvider::new();
    let action = Action::publish("q1");

    fail(&breaker, &provider, &action).await;
    tokio::time::sleep(Duration::from_millis(20)).await;

    for _ in 0..20 {
        assert!(succeed(&breaker, &provider, &action).await.is_denied());
    }
}

#[tokio::test]
async fn test_timeout_counts_as_failure() {
    let breaker = CircuitBreaker::new("test", settings(2, 10_000));
    let provider = MockProvider::with_participation(Participation::Budget(Duration::from_millis(20)));
    let action = Action::publish("slow");

    for _ in 0..2 {
        let result = breaker
            .invoke(&provider, &action, &(), async {
                tokio::time::sleep(Duration::from_millis(200)).await;
                Ok::<_, &'static str>(())
            })
            .await;
        assert!(matches!(result, Invocation::Failed(CallFailure::TimedOut(_))));
    }

    let stats = breaker.stats("publish:slow").unwrap();
    assert_eq!(stats.state, CircuitState::Open);
    assert_eq!(stats.timed_out_calls, 2);
}

#[tokio::test]
async fn test_skipped_actions_are_not_tracked() {
    let breaker = CircuitBreaker::new("test", settings(1, 10_000));
    let provider = MockProvider::with_participation(Participation::Skip);
    let action = Action::publish("q1");

    for _ in 0..3 {
        assert!(matches!(fail(&breaker, &provider, &action).await, Invocation::Failed(_)));
    }
    assert!(breaker.state("publish:q1").is_none());
    assert_eq!(provider.denied(), 0);
}

#[tokio::test]
async fn test_unmonitored_provider_bypasses_state() {
    let breaker = CircuitBreaker::new("test", settings(1, 10_000));
    let provider = MockProvider::unmonitored();
    let action = Action::publish("q1");

    fail(&breaker, &provider, &action).await;
    fail(&breaker, &provider, &action).await;

    assert!(succeed(&breaker, &provider, &action).await.is_completed());
    assert!(breaker.all_stats().is_empty());
}

#[tokio::test]
async fn test_reset() {
    let breaker = CircuitBreaker::new("test", settings(1, 10_000));
    let provider = MockProvider::new();

    fail(&breaker, &provider, &Action::publish("a")).await;
    fail(&breaker, &provider, &Action::publish("b")).await;
    assert_eq!(breaker.open_count(), 2);

    assert!(breaker.reset("publish:a"));
    assert!(!breaker.reset("publish:unknown"));
    assert_eq!(breaker.open_count(), 1);

    breaker.reset_all();
    assert_eq!(breaker.open_count(), 0);
    assert!(succeed(&breaker, &provider, &Action::publish("b")).await.is_completed());
}
