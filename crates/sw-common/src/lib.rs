use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod last_error;
pub mod logging;

pub use last_error::{codes, Error, ErrorRequest, ErrorSinkConfig, LastError, Severity};

// ============================================================================
// Job Types
// ============================================================================

/// The unit of work handed to the publishing client.
///
/// A job targets exactly one queue. Its body is either a plain serialized
/// payload or a deferred function call that a consumer executes later.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub id: String,
    pub queue: String,
    #[serde(default = "default_persistent")]
    pub persistent: bool,
    pub created_at: DateTime<Utc>,
    pub kind: JobKind,
}

fn default_persistent() -> bool {
    true
}

/// What the job carries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobKind {
    /// Opaque payload delivered as-is to consumers
    Message { payload: serde_json::Value },
    /// Deferred call: the consumer invokes `function` with `args`
    FunctionCall {
        function: String,
        #[serde(default)]
        args: Vec<serde_json::Value>,
    },
}

/// Job could not be encoded or decoded.
#[derive(Error, Debug)]
#[error("Serialization error: {0}")]
pub struct SerializationError(#[from] serde_json::Error);

impl Job {
    fn with_kind(queue: impl Into<String>, kind: JobKind) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            queue: queue.into(),
            persistent: true,
            created_at: Utc::now(),
            kind,
        }
    }

    /// Build a message job from any serializable payload.
    pub fn message<T: Serialize + ?Sized>(
        queue: impl Into<String>,
        payload: &T,
    ) -> Result<Self, SerializationError> {
        let payload = serde_json::to_value(payload)?;
        Ok(Self::with_kind(queue, JobKind::Message { payload }))
    }

    /// Build a deferred function-call job.
    pub fn function_call(
        queue: impl Into<String>,
        function: impl Into<String>,
        args: Vec<serde_json::Value>,
    ) -> Self {
        Self::with_kind(
            queue,
            JobKind::FunctionCall {
                function: function.into(),
                args,
            },
        )
    }

    pub fn with_persistent(mut self, persistent: bool) -> Self {
        self.persistent = persistent;
        self
    }

    pub fn job_type(&self) -> JobType {
        match self.kind {
            JobKind::Message { .. } => JobType::Message,
            JobKind::FunctionCall { .. } => JobType::FunctionCall,
        }
    }

    /// Encode the full job envelope as the broker message body.
    pub fn encode(&self) -> Result<Vec<u8>, SerializationError> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode(body: &[u8]) -> Result<Self, SerializationError> {
        Ok(serde_json::from_slice(body)?)
    }
}

/// Job type tag stored alongside every dumped record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobType {
    Message,
    FunctionCall,
}

impl JobType {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobType::Message => "MESSAGE",
            JobType::FunctionCall => "FUNCTION_CALL",
        }
    }

    /// Parse from string
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_uppercase().as_str() {
            "MESSAGE" => Some(JobType::Message),
            "FUNCTION_CALL" | "FUNCTIONCALL" | "FUNCTION-CALL" => Some(JobType::FunctionCall),
            _ => None,
        }
    }
}

impl std::fmt::Display for JobType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Terminal state of a publish attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Broker accepted the message
    Delivered,
    /// Message was written to the dump store for later recovery
    Dumped,
}

// ============================================================================
// Dump Types
// ============================================================================

/// A message that could not be delivered and sits in the dump store.
///
/// Records are append-only and leave the store only after a confirmed
/// republish.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DumpedRecord {
    pub id: i64,
    pub queue: String,
    pub payload: Vec<u8>,
    pub job_type: JobType,
    /// Delivery mode the message was published with
    #[serde(default = "default_persistent")]
    pub persistent: bool,
    pub dumped_at: DateTime<Utc>,
    /// Number of failed recovery attempts so far
    #[serde(default)]
    pub attempts: u32,
    #[serde(default)]
    pub last_error: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_message_job_encodes_envelope() {
        let job = Job::message("q1", &json!({"order": 42})).unwrap();
        assert_eq!(job.job_type(), JobType::Message);
        assert!(job.persistent);

        let body = job.encode().unwrap();
        let value: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(value["queue"], "q1");
        assert_eq!(value["kind"]["type"], "MESSAGE");
        assert_eq!(value["kind"]["payload"]["order"], 42);

        assert_eq!(Job::decode(&body).unwrap(), job);
    }

    #[test]
    fn test_function_call_job() {
        let job = Job::function_call("mail", "send_welcome", vec![json!("user-1")])
            .with_persistent(false);
        assert_eq!(job.job_type(), JobType::FunctionCall);
        assert!(!job.persistent);
        match &job.kind {
            JobKind::FunctionCall { function, args } => {
                assert_eq!(function, "send_welcome");
                assert_eq!(args.len(), 1);
            }
            other => panic!("unexpected kind: {:?}", other),
        }
    }

    #[test]
    fn test_decode_garbage_is_serialization_error() {
        let err = Job::decode(b"not json").unwrap_err();
        assert!(err.to_string().starts_with("Serialization error"));
    }

    #[test]
    fn test_missing_persistent_defaults_to_true() {
        let body = br#"{"id":"1","queue":"q","createdAt":"2024-01-01T00:00:00Z","kind":{"type":"MESSAGE","payload":"abc"}}"#;
        let job = Job::decode(body).unwrap();
        assert!(job.persistent);
        assert_eq!(job.kind, JobKind::Message { payload: json!("abc") });
    }

    #[test]
    fn test_job_type_parsing() {
        assert_eq!(JobType::from_str("message"), Some(JobType::Message));
        assert_eq!(JobType::from_str("function-call"), Some(JobType::FunctionCall));
        assert_eq!(JobType::from_str("amqp"), None);
        assert_eq!(JobType::FunctionCall.to_string(), "FUNCTION_CALL");
    }
}
