pub mod embedded;
pub mod durable;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::{Job, QueueResult};

/// Which implementation is serving a [`JobQueue`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Embedded,
    Durable,
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Embedded => f.write_str("embedded"),
            Self::Durable => f.write_str("durable"),
        }
    }
}

/// Operations every backend offers to producers.
///
/// Producers depend on this trait only, so swapping backends needs no
/// caller changes.
#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Submit a job without waiting for it to run
    async fn enqueue(&self, job: Job) -> QueueResult<()>;

    /// Jobs waiting to run, if the backend can tell cheaply
    async fn queue_length(&self) -> Option<usize> {
        None
    }

    /// Whether a drain is in progress, if the backend tracks it
    fn is_processing(&self) -> Option<bool> {
        None
    }

    /// Stop processing and release resources. Safe to call twice.
    async fn shutdown(&self) -> QueueResult<()>;

    /// Implementation behind this queue
    fn kind(&self) -> BackendKind;
}
