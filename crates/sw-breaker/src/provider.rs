//! Provider contract
//!
//! A component that wants its calls guarded implements [`Provider`] so the
//! breaker can ask, per action, whether and how long to guard it, whether to
//! let a call through while degraded, and what to hand back on denial.

use async_trait::async_trait;
use rand::Rng;
use std::time::Duration;

use crate::action::Action;

/// How an action takes part in breaking.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Participation {
    /// Run the call directly: no state tracking, no timeout
    Skip,
    /// Guard the call with the breaker's default budget
    DefaultBudget,
    /// Guard the call with this budget
    Budget(Duration),
}

#[async_trait]
pub trait Provider: Send + Sync {
    /// Call arguments handed to the policy hooks
    type Args: Send + Sync;
    /// Value produced when the breaker denies a call
    type Fallback: Send;

    fn participation(&self, action: &Action, args: &Self::Args) -> Participation;

    /// Decide whether this call may run while the action is not fully closed.
    fn admit_while_degraded(&self, openness: u8, _action: &Action, _args: &Self::Args) -> bool {
        admit_by_openness(openness)
    }

    /// Fallback routine invoked whenever the breaker denies a call.
    async fn on_denied(&self, action: &Action, args: &Self::Args) -> Self::Fallback;

    /// Unmonitored providers bypass state tracking entirely.
    fn is_monitored(&self) -> bool {
        true
    }
}

/// Admit with probability `openness / 100`.
///
/// 0 never admits and 100 (or more) always admits.
pub fn admit_by_openness(openness: u8) -> bool {
    match openness {
        0 => false,
        o if o >= 100 => true,
        o => rand::thread_rng().gen_range(0..100u8) < o,
    }
}
