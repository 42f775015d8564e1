//! Broker-backed queue adapter
//!
//! One broker queue and one broker worker are provisioned per registered
//! job name. Persistence, worker concurrency, retries and the failed set
//! all belong to the broker; this adapter only forwards calls to it.

#[cfg(feature = "redis")]
pub mod redis;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::{debug, error, info, instrument, warn};

use crate::{
    backend::{BackendKind, JobQueue},
    job::HandlerRegistry,
    CleanStatus, FailedJob, Job, JobId, QueueError, QueueResult, QueueStats,
};

#[cfg(feature = "redis")]
use crate::config::DurableConfig;

/// Factory for per-name broker queues and workers
#[async_trait]
pub trait Broker: Send + Sync {
    /// Open (or create) the queue for a job name
    async fn queue(&self, name: &str) -> QueueResult<Arc<dyn BrokerQueue>>;

    /// Start a worker that feeds jobs of `name` to the registry
    async fn worker(
        &self,
        name: &str,
        registry: Arc<HandlerRegistry>,
    ) -> QueueResult<Arc<dyn BrokerWorker>>;
}

/// Broker-side queue for a single job name
#[async_trait]
pub trait BrokerQueue: Send + Sync {
    async fn add(&self, job: &Job) -> QueueResult<JobId>;

    async fn stats(&self) -> QueueResult<QueueStats>;

    async fn failed_jobs(&self) -> QueueResult<Vec<FailedJob>>;

    /// Move a failed job back to the wait list. `false` if it is not failed.
    async fn retry_failed(&self, id: &JobId) -> QueueResult<bool>;

    /// Delete a failed job. `false` if it is not failed.
    async fn remove_failed(&self, id: &JobId) -> QueueResult<bool>;

    /// Remove jobs in `status` older than `grace`, returning their ids
    async fn clean(&self, grace: Duration, status: CleanStatus) -> QueueResult<Vec<JobId>>;

    async fn pause(&self) -> QueueResult<()>;

    async fn resume(&self) -> QueueResult<()>;

    async fn close(&self) -> QueueResult<()>;
}

/// Broker-side worker for a single job name
#[async_trait]
pub trait BrokerWorker: Send + Sync {
    /// Stop taking jobs and wait for in-flight ones to finish
    async fn close(&self) -> QueueResult<()>;
}

#[derive(Clone)]
struct Lane {
    queue: Arc<dyn BrokerQueue>,
    worker: Arc<dyn BrokerWorker>,
}

/// Durable backend exposing broker management to operators
pub struct DurableQueue {
    registry: Arc<HandlerRegistry>,
    lanes: Mutex<HashMap<String, Lane>>,
    closed: AtomicBool,
}

impl DurableQueue {
    /// Provision one queue and one worker per registered job name.
    ///
    /// Job types must be registered before this is called. If any lane
    /// fails to start, the lanes already started are closed and the
    /// error is returned.
    pub async fn start(broker: Arc<dyn Broker>, registry: Arc<HandlerRegistry>) -> QueueResult<Self> {
        let adapter = Self {
            registry: registry.clone(),
            lanes: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
        };

        for name in registry.registered_names() {
            if let Err(e) = adapter.provision(broker.as_ref(), &name).await {
                error!(queue = %name, error = %e, "Failed to provision durable queue");
                if let Err(close_err) = adapter.shutdown().await {
                    warn!(error = %close_err, "Error while closing partially started durable queue");
                }
                return Err(e);
            }
        }

        info!(queues = adapter.lanes.lock().len(), "Durable queue started");
        Ok(adapter)
    }

    /// Connect to Redis and start lanes for every registered job name
    #[cfg(feature = "redis")]
    pub async fn connect_redis(config: DurableConfig, registry: Arc<HandlerRegistry>) -> QueueResult<Self> {
        let broker = self::redis::RedisBroker::connect(config).await?;
        Self::start(Arc::new(broker), registry).await
    }

    async fn provision(&self, broker: &dyn Broker, name: &str) -> QueueResult<()> {
        let queue = broker.queue(name).await?;
        let worker = match broker.worker(name, self.registry.clone()).await {
            Ok(worker) => worker,
            Err(e) => {
                if let Err(close_err) = queue.close().await {
                    warn!(queue = %name, error = %close_err, "Error while closing queue after worker start failed");
                }
                return Err(e);
            }
        };

        debug!(queue = %name, "Provisioned durable queue and worker");
        self.lanes.lock().insert(name.to_string(), Lane { queue, worker });
        Ok(())
    }

    fn lane(&self, name: &str) -> QueueResult<Lane> {
        self.lanes
            .lock()
            .get(name)
            .cloned()
            .ok_or_else(|| QueueError::QueueNotFound(name.to_string()))
    }

    /// Names with a provisioned queue, sorted
    pub fn queue_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.lanes.lock().keys().cloned().collect();
        names.sort();
        names
    }

    /// Submit a job to its broker queue, returning the broker id.
    ///
    /// `Ok(None)` means no queue exists for the name and the job was dropped.
    #[instrument(skip(self, job), fields(job = %job.name))]
    pub async fn add(&self, job: Job) -> QueueResult<Option<JobId>> {
        if self.closed.load(Ordering::Acquire) {
            return Err(QueueError::Shutdown);
        }

        let lane = match self.lane(&job.name) {
            Ok(lane) => lane,
            Err(_) => {
                warn!("No durable queue for job, dropping it");
                return Ok(None);
            }
        };

        let id = lane.queue.add(&job).await?;
        debug!(job_id = %id, "Enqueued job on broker");
        Ok(Some(id))
    }

    pub async fn get_queue_stats(&self, name: &str) -> QueueResult<QueueStats> {
        self.lane(name)?.queue.stats().await
    }

    pub async fn get_failed_jobs(&self, name: &str) -> QueueResult<Vec<FailedJob>> {
        self.lane(name)?.queue.failed_jobs().await
    }

    pub async fn retry_failed_job(&self, name: &str, id: &JobId) -> QueueResult<bool> {
        let retried = self.lane(name)?.queue.retry_failed(id).await?;
        if retried {
            info!(queue = %name, job_id = %id, "Retrying failed job");
        }
        Ok(retried)
    }

    pub async fn remove_failed_job(&self, name: &str, id: &JobId) -> QueueResult<bool> {
        let removed = self.lane(name)?.queue.remove_failed(id).await?;
        if removed {
            info!(queue = %name, job_id = %id, "Removed failed job");
        }
        Ok(removed)
    }

    pub async fn clean_queue(&self, name: &str, grace: Duration, status: CleanStatus) -> QueueResult<Vec<JobId>> {
        let removed = self.lane(name)?.queue.clean(grace, status).await?;
        info!(queue = %name, %status, removed = removed.len(), "Cleaned queue");
        Ok(removed)
    }

    pub async fn pause_queue(&self, name: &str) -> QueueResult<()> {
        self.lane(name)?.queue.pause().await?;
        info!(queue = %name, "Paused queue");
        Ok(())
    }

    pub async fn resume_queue(&self, name: &str) -> QueueResult<()> {
        self.lane(name)?.queue.resume().await?;
        info!(queue = %name, "Resumed queue");
        Ok(())
    }

    /// Close every worker and queue. Later calls are no-ops.
    pub async fn shutdown(&self) -> QueueResult<()> {
        self.closed.store(true, Ordering::Release);
        let lanes: Vec<(String, Lane)> = self.lanes.lock().drain().collect();
        if lanes.is_empty() {
            return Ok(());
        }

        let mut first_error = None;
        for (name, lane) in lanes {
            // Workers first so nothing is mid-flight when the queue closes
            if let Err(e) = lane.worker.close().await {
                warn!(queue = %name, error = %e, "Error closing durable worker");
                first_error.get_or_insert(e);
            }
            if let Err(e) = lane.queue.close().await {
                warn!(queue = %name, error = %e, "Error closing durable queue");
                first_error.get_or_insert(e);
            }
        }

        info!("Durable queue shut down");
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl JobQueue for DurableQueue {
    async fn enqueue(&self, job: Job) -> QueueResult<()> {
        self.add(job).await.map(|_| ())
    }

    async fn queue_length(&self) -> Option<usize> {
        let lanes: Vec<(String, Lane)> = self
            .lanes
            .lock()
            .iter()
            .map(|(name, lane)| (name.clone(), lane.clone()))
            .collect();

        let mut waiting = 0;
        for (name, lane) in lanes {
            match lane.queue.stats().await {
                Ok(stats) => waiting += stats.waiting + stats.delayed,
                Err(e) => {
                    warn!(queue = %name, error = %e, "Could not read queue length");
                    return None;
                }
            }
        }
        Some(waiting as usize)
    }

    async fn shutdown(&self) -> QueueResult<()> {
        DurableQueue::shutdown(self).await
    }

    fn kind(&self) -> BackendKind {
        BackendKind::Durable
    }
}
