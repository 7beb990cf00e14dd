//! Actions guarded by the breaker
//!
//! Every breakable call is named by an [`Action`]. The breaker keeps one state
//! machine per action key, so a failing `publish:orders` does not degrade
//! `publish:mail` or connection setup.

use std::fmt;

/// The closed set of operations that can be guarded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ActionKind {
    EstablishConnection,
    OpenChannel,
    Publish,
}

/// kind, key prefix, short label used in logs.
/// Rows are ordered by discriminant.
static ACTION_TABLE: [(ActionKind, &str, &str); 3] = [
    (ActionKind::EstablishConnection, "establish-connection", "connect"),
    (ActionKind::OpenChannel, "open-channel", "channel"),
    (ActionKind::Publish, "publish", "publish"),
];

impl ActionKind {
    fn entry(&self) -> &'static (ActionKind, &'static str, &'static str) {
        &ACTION_TABLE[*self as usize]
    }

    pub fn name(&self) -> &'static str {
        self.entry().1
    }

    pub fn label(&self) -> &'static str {
        self.entry().2
    }
}

/// A named call executed through the breaker.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Action {
    kind: ActionKind,
    target: Option<String>,
}

impl Action {
    pub fn establish_connection() -> Self {
        Self { kind: ActionKind::EstablishConnection, target: None }
    }

    pub fn open_channel() -> Self {
        Self { kind: ActionKind::OpenChannel, target: None }
    }

    pub fn publish(queue: impl Into<String>) -> Self {
        Self { kind: ActionKind::Publish, target: Some(queue.into()) }
    }

    pub fn kind(&self) -> ActionKind {
        self.kind
    }

    pub fn target(&self) -> Option<&str> {
        self.target.as_deref()
    }

    /// State key: `establish-connection`, `open-channel`, `publish:<queue>`
    pub fn key(&self) -> String {
        match &self.target {
            Some(target) => format!("{}:{}", self.kind.name(), target),
            None => self.kind.name().to_string(),
        }
    }

    /// Short human label, e.g. `publish(orders)`
    pub fn label(&self) -> String {
        match &self.target {
            Some(target) => format!("{}({})", self.kind.label(), target),
            None => self.kind.label().to_string(),
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key())
    }
}
