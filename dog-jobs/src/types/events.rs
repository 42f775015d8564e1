use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle events emitted by the embedded engine
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum JobEvent {
    /// Job was appended to the pending list
    Enqueued {
        name: String,
        at: DateTime<Utc>,
    },

    /// Handler returned success; the job is discarded
    Completed {
        name: String,
        attempt: u32,
        at: DateTime<Utc>,
    },

    /// Handler failed and a retry is waiting on its backoff timer
    RetryScheduled {
        name: String,
        attempt: u32,
        delay_ms: u64,
        error: String,
        at: DateTime<Utc>,
    },

    /// Retries exhausted; the job is in the dead-letter store
    DeadLettered {
        name: String,
        total_attempts: u32,
        error: String,
        at: DateTime<Utc>,
    },

    /// No handler registered for the job name
    Dropped {
        name: String,
        at: DateTime<Utc>,
    },
}

impl JobEvent {
    /// Get event type name as string
    pub fn event_name(&self) -> &'static str {
        match self {
            Self::Enqueued { .. } => "enqueued",
            Self::Completed { .. } => "completed",
            Self::RetryScheduled { .. } => "retry_scheduled",
            Self::DeadLettered { .. } => "dead_lettered",
            Self::Dropped { .. } => "dropped",
        }
    }

    /// Get the job name from any event
    pub fn job_name(&self) -> &str {
        match self {
            Self::Enqueued { name, .. } => name,
            Self::Completed { name, .. } => name,
            Self::RetryScheduled { name, .. } => name,
            Self::DeadLettered { name, .. } => name,
            Self::Dropped { name, .. } => name,
        }
    }

    /// Get the timestamp from any event
    pub fn timestamp(&self) -> &DateTime<Utc> {
        match self {
            Self::Enqueued { at, .. } => at,
            Self::Completed { at, .. } => at,
            Self::RetryScheduled { at, .. } => at,
            Self::DeadLettered { at, .. } => at,
            Self::Dropped { at, .. } => at,
        }
    }
}
