//! Last-error sink
//!
//! Components that absorb failures (connection setup, publish fallback,
//! recovery) report them here instead of returning rich errors. The sink keeps
//! exactly one immutable [`Error`] per scope; every new failure overwrites the
//! previous one.
//!
//! Severity follows syslog ordering: lower numeric values are more severe.
//! Errors at or above the configured log threshold are emitted as structured
//! `tracing` events, with a backtrace outside production (and always for
//! `Critical` and worse).

use std::backtrace::Backtrace;
use std::fmt;
use std::panic::Location;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

/// Well-known error codes.
pub mod codes {
    pub const COMMON: i32 = 1000;
    pub const AMQP_CONNECT: i32 = 2001;
    pub const AMQP_PUBLISH: i32 = 2002;
    pub const SERIALIZATION: i32 = 2003;
    pub const DUMP: i32 = 2004;
    pub const RECOVER: i32 = 2005;
}

/// Syslog-style severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Emergency = 0,
    Alert = 1,
    Critical = 2,
    Error = 3,
    Warning = 4,
    Notice = 5,
    Info = 6,
    Debug = 7,
}

impl Severity {
    pub fn code(&self) -> u8 {
        *self as u8
    }

    /// True when `self` is at least as severe as `other`.
    pub fn at_least(&self, other: Severity) -> bool {
        self.code() <= other.code()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Emergency => "emergency",
            Severity::Alert => "alert",
            Severity::Critical => "critical",
            Severity::Error => "error",
            Severity::Warning => "warning",
            Severity::Notice => "notice",
            Severity::Info => "info",
            Severity::Debug => "debug",
        }
    }

    /// Parse from string, accepting the short syslog spellings too
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "emergency" | "emerg" => Some(Severity::Emergency),
            "alert" => Some(Severity::Alert),
            "critical" | "crit" => Some(Severity::Critical),
            "error" | "err" => Some(Severity::Error),
            "warning" | "warn" => Some(Severity::Warning),
            "notice" => Some(Severity::Notice),
            "info" => Some(Severity::Info),
            "debug" => Some(Severity::Debug),
            _ => None,
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

type Cause = Arc<dyn std::error::Error + Send + Sync + 'static>;

/// Structured request to record a failure.
///
/// Unset fields fall back to defaults: code [`codes::COMMON`], level `Info`,
/// or `Error` when a cause is attached.
#[derive(Default)]
pub struct ErrorRequest {
    code: Option<i32>,
    message: Option<String>,
    developer_message: Option<String>,
    level: Option<Severity>,
    cause: Option<Cause>,
}

impl ErrorRequest {
    pub fn new(code: i32) -> Self {
        Self {
            code: Some(code),
            ..Default::default()
        }
    }

    pub fn message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn developer_message(mut self, message: impl Into<String>) -> Self {
        self.developer_message = Some(message.into());
        self
    }

    pub fn level(mut self, level: Severity) -> Self {
        self.level = Some(level);
        self
    }

    pub fn cause<E>(mut self, cause: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        self.cause = Some(Arc::new(cause));
        self
    }
}

/// An immutable, normalized failure report.
pub struct Error {
    pub code: i32,
    pub message: Option<String>,
    pub developer_message: Option<String>,
    pub level: Severity,
    pub cause: Option<Cause>,
    pub location: &'static Location<'static>,
    pub backtrace: Option<Backtrace>,
    pub occurred_at: DateTime<Utc>,
}

impl Error {
    fn from_request(request: ErrorRequest, location: &'static Location<'static>) -> Self {
        let level = request.level.unwrap_or(if request.cause.is_some() {
            Severity::Error
        } else {
            Severity::Info
        });

        Self {
            code: request.code.unwrap_or(codes::COMMON),
            message: request.message,
            developer_message: request.developer_message,
            level,
            cause: request.cause,
            location,
            backtrace: None,
            occurred_at: Utc::now(),
        }
    }

    /// `file:line` of the reporting site
    pub fn source_location(&self) -> String {
        format!("{}:{}", self.location.file(), self.location.line())
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Error")
            .field("code", &self.code)
            .field("message", &self.message)
            .field("developer_message", &self.developer_message)
            .field("level", &self.level)
            .field("cause", &self.cause.as_ref().map(|c| c.to_string()))
            .field("location", &self.source_location())
            .field("occurred_at", &self.occurred_at)
            .finish()
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] ", self.code)?;
        match (&self.message, &self.cause) {
            (Some(msg), Some(cause)) => write!(f, "{}: {}", msg, cause),
            (Some(msg), None) => f.write_str(msg),
            (None, Some(cause)) => write!(f, "{}", cause),
            (None, None) => f.write_str("unknown error"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.cause
            .as_ref()
            .map(|c| c.as_ref() as &(dyn std::error::Error + 'static))
    }
}

/// Sink behaviour.
#[derive(Debug, Clone)]
pub struct ErrorSinkConfig {
    /// Errors at least this severe are logged
    pub log_threshold: Severity,
    /// Production suppresses backtraces below `Critical`
    pub production: bool,
    pub log_disabled: bool,
}

impl Default for ErrorSinkConfig {
    fn default() -> Self {
        Self {
            log_threshold: Severity::Notice,
            production: false,
            log_disabled: false,
        }
    }
}

/// Scoped holder of the most recent failure.
pub struct LastError {
    slot: RwLock<Option<Arc<Error>>>,
    config: ErrorSinkConfig,
}

impl LastError {
    pub fn new(config: ErrorSinkConfig) -> Self {
        Self {
            slot: RwLock::new(None),
            config,
        }
    }

    pub fn config(&self) -> &ErrorSinkConfig {
        &self.config
    }

    /// Most recent failure, if any.
    pub fn last_error(&self) -> Option<Arc<Error>> {
        self.slot.read().clone()
    }

    pub fn clear_last_error(&self) {
        *self.slot.write() = None;
    }

    /// Normalize `request` into an [`Error`], log it if severe enough and
    /// store it as the last error.
    #[track_caller]
    pub fn set_last_error(&self, request: ErrorRequest) -> Arc<Error> {
        let mut err = Error::from_request(request, Location::caller());

        if err.level.at_least(self.config.log_threshold) && !self.config.log_disabled {
            let with_backtrace =
                !self.config.production || err.level.at_least(Severity::Critical);
            if with_backtrace {
                err.backtrace = Some(Backtrace::force_capture());
            }
            emit(&err);
        }

        let err = Arc::new(err);
        *self.slot.write() = Some(Arc::clone(&err));
        err
    }
}

impl Default for LastError {
    fn default() -> Self {
        Self::new(ErrorSinkConfig::default())
    }
}

fn emit(err: &Error) {
    let message = err.message.as_deref().unwrap_or("");
    let developer_message = err.developer_message.as_deref().unwrap_or("");
    let cause = err.cause.as_ref().map(|c| c.to_string()).unwrap_or_default();
    let location = err.source_location();
    let backtrace = err
        .backtrace
        .as_ref()
        .map(|b| b.to_string())
        .unwrap_or_default();

    match err.level {
        Severity::Emergency | Severity::Alert | Severity::Critical | Severity::Error => error!(
            code = err.code,
            level = %err.level,
            developer_message = %developer_message,
            cause = %cause,
            location = %location,
            backtrace = %backtrace,
            "{}",
            message
        ),
        Severity::Warning => warn!(
            code = err.code,
            level = %err.level,
            developer_message = %developer_message,
            cause = %cause,
            location = %location,
            backtrace = %backtrace,
            "{}",
            message
        ),
        Severity::Notice | Severity::Info | Severity::Debug => info!(
            code = err.code,
            level = %err.level,
            developer_message = %developer_message,
            cause = %cause,
            location = %location,
            "{}",
            message
        ),
    }
}
