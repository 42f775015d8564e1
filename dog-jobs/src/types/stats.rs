use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::{Job, JobId};
use crate::QueueError;

/// Per-name counters reported by the durable broker
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub name: String,
    pub waiting: u64,
    pub active: u64,
    pub delayed: u64,
    pub completed: u64,
    pub failed: u64,
    pub paused: bool,
}

impl QueueStats {
    /// Jobs that have not finished yet
    pub fn outstanding(&self) -> u64 {
        self.waiting + self.active + self.delayed
    }
}

/// A job the broker moved to its failed set
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailedJob {
    pub id: JobId,
    pub job: Job,
    pub failed_reason: Option<String>,
    pub attempts_made: u32,
    pub failed_at: Option<DateTime<Utc>>,
}

/// Which broker set `clean` sweeps
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CleanStatus {
    Completed,
    Failed,
    Delayed,
    Wait,
}

impl CleanStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Delayed => "delayed",
            Self::Wait => "wait",
        }
    }
}

impl fmt::Display for CleanStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CleanStatus {
    type Err = QueueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "delayed" => Ok(Self::Delayed),
            "wait" | "waiting" => Ok(Self::Wait),
            other => Err(QueueError::Config(format!("unknown clean status: {}", other))),
        }
    }
}
