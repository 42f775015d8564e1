use thiserror::Error;

/// Result type for queue operations
pub type QueueResult<T> = Result<T, QueueError>;

/// Infrastructure errors for queue operations
#[derive(Error, Debug)]
pub enum QueueError {
    #[error("Queue not found: {0}")]
    QueueNotFound(String),

    #[error("Job not found: {0}")]
    JobNotFound(String),

    #[error("Broker error: {0}")]
    Broker(String),

    #[cfg(feature = "redis")]
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Backend does not support feature: {0}")]
    BackendUnsupported(String),

    #[error("Queue has been shut down")]
    Shutdown,

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Job execution outcome - determines retry behavior
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum JobError {
    /// Retryable error - will schedule retry if attempts remain
    #[error("Retryable error: {0}")]
    Retryable(String),

    /// Permanent error - dead-lettered immediately, no retry
    #[error("Permanent error: {0}")]
    Permanent(String),
}

impl JobError {
    /// Create a retryable error
    pub fn retryable(msg: impl Into<String>) -> Self {
        Self::Retryable(msg.into())
    }

    /// Create a permanent error
    pub fn permanent(msg: impl Into<String>) -> Self {
        Self::Permanent(msg.into())
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Retryable(_))
    }

    /// Get the error message
    pub fn message(&self) -> &str {
        match self {
            Self::Retryable(msg) | Self::Permanent(msg) => msg,
        }
    }
}

impl From<serde_json::Error> for QueueError {
    fn from(err: serde_json::Error) -> Self {
        Self::SerializationError(err.to_string())
    }
}

impl From<tokio::task::JoinError> for QueueError {
    fn from(err: tokio::task::JoinError) -> Self {
        Self::Internal(format!("Worker join error: {}", err))
    }
}
