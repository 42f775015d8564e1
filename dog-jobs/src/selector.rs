//! Startup backend selection
//!
//! The only place that decides between the embedded engine and the
//! durable adapter. A durable backend that cannot start is downgraded to
//! the embedded engine with a warning, so startup never fails here.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use tracing::{info, warn};

use crate::{
    backend::{durable::DurableQueue, embedded::EmbeddedQueue, BackendKind, JobQueue},
    config::{DurableConfig, QueueSettings},
    job::HandlerRegistry,
    Job, QueueResult,
};

#[derive(Clone)]
enum ActiveBackend {
    Embedded(Arc<EmbeddedQueue>),
    Durable(Arc<DurableQueue>),
}

/// Handle to whichever backend was selected at startup
#[derive(Clone)]
pub struct QueueService {
    active: ActiveBackend,
}

impl QueueService {
    pub fn from_embedded(queue: EmbeddedQueue) -> Self {
        Self {
            active: ActiveBackend::Embedded(Arc::new(queue)),
        }
    }

    pub fn from_durable(queue: DurableQueue) -> Self {
        Self {
            active: ActiveBackend::Durable(Arc::new(queue)),
        }
    }

    /// The selected backend behind the common interface
    pub fn queue(&self) -> Arc<dyn JobQueue> {
        match &self.active {
            ActiveBackend::Embedded(queue) => queue.clone() as Arc<dyn JobQueue>,
            ActiveBackend::Durable(queue) => queue.clone() as Arc<dyn JobQueue>,
        }
    }

    pub fn kind(&self) -> BackendKind {
        match &self.active {
            ActiveBackend::Embedded(_) => BackendKind::Embedded,
            ActiveBackend::Durable(_) => BackendKind::Durable,
        }
    }

    /// Embedded engine, for dead-letter tooling
    pub fn embedded(&self) -> Option<&Arc<EmbeddedQueue>> {
        match &self.active {
            ActiveBackend::Embedded(queue) => Some(queue),
            ActiveBackend::Durable(_) => None,
        }
    }

    /// Durable adapter, for broker management
    pub fn durable(&self) -> Option<&Arc<DurableQueue>> {
        match &self.active {
            ActiveBackend::Durable(queue) => Some(queue),
            ActiveBackend::Embedded(_) => None,
        }
    }

    pub async fn enqueue(&self, job: Job) -> QueueResult<()> {
        match &self.active {
            ActiveBackend::Embedded(queue) => queue.submit(job),
            ActiveBackend::Durable(queue) => queue.enqueue(job).await,
        }
    }

    /// Shut down the active backend. Safe to call more than once.
    pub async fn shutdown(&self) -> QueueResult<()> {
        match &self.active {
            ActiveBackend::Embedded(queue) => queue.shutdown().await,
            ActiveBackend::Durable(queue) => queue.shutdown().await,
        }
    }
}

impl std::fmt::Debug for QueueService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueService").field("kind", &self.kind()).finish()
    }
}

/// Build the queue service described by `settings`.
///
/// With `durable` set, connects the Redis adapter (when built with the
/// `redis` feature) and falls back to the embedded engine on any failure.
pub async fn get_queue_service(registry: Arc<HandlerRegistry>, settings: &QueueSettings) -> QueueService {
    select_backend(registry, settings, connect_durable).await
}

#[cfg(feature = "redis")]
async fn connect_durable(config: DurableConfig, registry: Arc<HandlerRegistry>) -> QueueResult<DurableQueue> {
    DurableQueue::connect_redis(config, registry).await
}

#[cfg(not(feature = "redis"))]
async fn connect_durable(_config: DurableConfig, _registry: Arc<HandlerRegistry>) -> QueueResult<DurableQueue> {
    Err(crate::QueueError::BackendUnsupported(
        "durable queue requires the `redis` feature".to_string(),
    ))
}

/// Choose a backend, using `init_durable` to build the durable adapter.
///
/// An error or panic from `init_durable` selects the embedded engine.
pub async fn select_backend<F, Fut>(
    registry: Arc<HandlerRegistry>,
    settings: &QueueSettings,
    init_durable: F,
) -> QueueService
where
    F: FnOnce(DurableConfig, Arc<HandlerRegistry>) -> Fut,
    Fut: Future<Output = QueueResult<DurableQueue>>,
{
    if settings.durable {
        let attempt = AssertUnwindSafe(init_durable(settings.durable(), registry.clone()))
            .catch_unwind()
            .await;

        match attempt {
            Ok(Ok(queue)) => {
                info!(backend = %BackendKind::Durable, "Queue backend selected");
                return QueueService::from_durable(queue);
            }
            Ok(Err(e)) => {
                warn!(error = %e, "Durable queue unavailable, falling back to embedded queue");
            }
            Err(_) => {
                warn!("Durable queue initialization panicked, falling back to embedded queue");
            }
        }
    }

    info!(backend = %BackendKind::Embedded, "Queue backend selected");
    QueueService::from_embedded(EmbeddedQueue::new(registry, settings.embedded()))
}
