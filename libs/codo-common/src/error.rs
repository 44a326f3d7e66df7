use thiserror::Error;
use uuid::Uuid;

/// Raised when a language tag has no judging strategy
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unsupported language: {0}")]
pub struct UnsupportedLanguage(pub String);

/// Participant-facing diagnostics. These end up in a submission's `error`
/// field; they are normal judging outcomes, not engine faults.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Diagnostic {
    #[error("compile error: {0}")]
    CompileError(String),

    #[error("runtime error (exit code {exit_code}): {stderr}")]
    RuntimeError { exit_code: i64, stderr: String },

    #[error("runtime error: killed by signal {signal}: {stderr}")]
    Crash { signal: i32, stderr: String },

    #[error("timeout: exceeded time limit of {limit_ms} ms")]
    Timeout { limit_ms: u64 },

    #[error("memory limit exceeded ({limit_mb} MB)")]
    MemoryExceeded { limit_mb: u64 },

    #[error("output limit exceeded ({limit_bytes} bytes)")]
    OutputLimitExceeded { limit_bytes: usize },

    #[error("unsupported language: {0}")]
    UnsupportedLanguage(String),

    #[error("problem {0} not found")]
    ProblemNotFound(String),

    #[error("problem has no test cases")]
    NoTestCases,

    #[error("cancelled before judging")]
    Cancelled,

    #[error("execution infrastructure failure: {0}")]
    ExecutionInfrastructureFailure(String),
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("submission {0} not found")]
    NotFound(Uuid),

    #[error("submission {0} is already in a terminal state")]
    AlreadyTerminal(Uuid),

    #[error("submission {0} is held by a different lease")]
    LeaseMismatch(Uuid),

    #[error("submission {0} is no longer pending")]
    NotPending(Uuid),

    #[error("problem {0} not found")]
    ProblemNotFound(String),

    #[error("corrupt record {key}: {reason}")]
    Corrupt { key: String, reason: String },

    #[error("store backend error: {0}")]
    Backend(String),
}

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("queue is full ({pending} pending, ceiling {ceiling})")]
    QueueFull { pending: usize, ceiling: usize },

    #[error("lease for submission {0} is no longer held")]
    LeaseLost(Uuid),

    #[error("queue backend error: {0}")]
    Backend(String),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value '{value}' for {key}: {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
}

impl From<redis::RedisError> for StoreError {
    fn from(e: redis::RedisError) -> Self {
        StoreError::Backend(e.to_string())
    }
}

impl From<redis::RedisError> for QueueError {
    fn from(e: redis::RedisError) -> Self {
        QueueError::Backend(e.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Backend(format!("serialization error: {}", e))
    }
}
