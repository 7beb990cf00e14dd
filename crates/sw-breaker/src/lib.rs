//! Spillway circuit breaker
//!
//! Guards named actions of a [`Provider`] with a per-action state machine.
//! Calls are admitted, timed out or denied; a denied call runs the provider's
//! fallback instead.

pub mod action;
pub mod breaker;
pub mod provider;

pub use action::{Action, ActionKind};
pub use breaker::{
    BreakerSettings, CallFailure, CircuitBreaker, CircuitBreakerStats, CircuitState, Invocation,
};
pub use provider::{admit_by_openness, Participation, Provider};
