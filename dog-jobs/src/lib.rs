//! # dog-jobs: background job processing
//!
//! Fire-and-forget jobs identified by name, executed by registered async
//! handlers, with retries, exponential backoff and quarantine of jobs
//! that keep failing.
//!
//! Two interchangeable backends sit behind [`JobQueue`]:
//!
//! - [`EmbeddedQueue`]: in-process FIFO engine. Retries after
//!   `base * 2^attempt` and moves exhausted jobs to an in-memory
//!   dead-letter list. Nothing survives a restart.
//! - [`DurableQueue`]: forwards jobs to a broker (Redis with the `redis`
//!   feature) that owns persistence, workers and retries, and exposes the
//!   broker's stats and failed set to operators.
//!
//! [`get_queue_service`] picks one at startup from [`QueueSettings`] and
//! falls back to the embedded engine if the durable one cannot start.
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use dog_jobs::prelude::*;
//!
//! # async fn run() -> QueueResult<()> {
//! let registry = Arc::new(HandlerRegistry::new());
//! registry.register_fn("leaderboard.refresh", |_job: Job| async { Ok(()) });
//!
//! let service = get_queue_service(registry, &QueueSettings::from_env()).await;
//! service.enqueue(Job::named("leaderboard.refresh")).await?;
//! service.shutdown().await?;
//! # Ok(())
//! # }
//! ```

pub mod backend;
pub mod config;
pub mod error;
pub mod job;
pub mod observability;
pub mod retry;
pub mod selector;
pub mod types;

pub use backend::durable::{Broker, BrokerQueue, BrokerWorker, DurableQueue};
pub use backend::embedded::EmbeddedQueue;
pub use backend::{BackendKind, JobQueue};
pub use config::{DurableConfig, EmbeddedConfig, QueueSettings};
pub use error::{JobError, QueueError, QueueResult};
pub use job::{Dispatched, HandlerRegistry, JobHandler};
pub use observability::{LiveMetrics, MetricsSnapshot};
pub use retry::BackoffPolicy;
pub use selector::{get_queue_service, select_backend, QueueService};
pub use types::{CleanStatus, DeadLetterJob, FailedJob, Job, JobEvent, JobId, Payload, QueueStats};

#[cfg(feature = "redis")]
pub use backend::durable::redis::RedisBroker;

#[cfg(feature = "tracing-basic")]
pub use observability::init_tracing;

/// Common imports for producers and handler authors
pub mod prelude {
    pub use crate::{
        get_queue_service, HandlerRegistry, Job, JobError, JobQueue, Payload, QueueResult,
        QueueService, QueueSettings,
    };

    pub use async_trait::async_trait;
}
