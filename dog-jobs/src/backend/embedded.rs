//! Single-process job engine
//!
//! Jobs wait in a FIFO list and are drained one at a time by a dedicated
//! worker task. A failed job is re-appended to the tail once its backoff
//! timer fires, or moved to the in-memory dead-letter store when its
//! attempts are used up.
//!
//! Nothing here is persisted: pending jobs and scheduled retries are lost
//! when the process exits or the engine is shut down.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::{broadcast, watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::{
    backend::{BackendKind, JobQueue},
    config::EmbeddedConfig,
    job::{Dispatched, HandlerRegistry},
    observability::LiveMetrics,
    DeadLetterJob, Job, JobError, JobEvent, QueueError, QueueResult,
};

const EVENT_CAPACITY: usize = 1024;

/// In-process queue with retry scheduling and a dead-letter store
pub struct EmbeddedQueue {
    inner: Arc<Inner>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

struct Inner {
    registry: Arc<HandlerRegistry>,
    config: EmbeddedConfig,
    pending: Mutex<VecDeque<Job>>,
    dead_letters: Mutex<Vec<DeadLetterJob>>,
    /// Held for the whole of a drain; at most one drain runs at a time
    processing: AtomicBool,
    /// Jobs accepted but not yet completed, dropped or dead-lettered
    outstanding: AtomicUsize,
    scheduled_retries: AtomicUsize,
    wake: Notify,
    shutdown: watch::Sender<bool>,
    events: broadcast::Sender<JobEvent>,
    metrics: LiveMetrics,
}

impl EmbeddedQueue {
    /// Create an engine and start its drain worker.
    ///
    /// # Panics
    ///
    /// Panics if called outside a Tokio runtime.
    pub fn new(registry: Arc<HandlerRegistry>, mut config: EmbeddedConfig) -> Self {
        config.max_retries = config.max_retries.max(1);

        let (shutdown, shutdown_rx) = watch::channel(false);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        let inner = Arc::new(Inner {
            registry,
            config,
            pending: Mutex::new(VecDeque::new()),
            dead_letters: Mutex::new(Vec::new()),
            processing: AtomicBool::new(false),
            outstanding: AtomicUsize::new(0),
            scheduled_retries: AtomicUsize::new(0),
            wake: Notify::new(),
            shutdown,
            events,
            metrics: LiveMetrics::new(),
        });

        let worker = tokio::spawn(drain_worker(inner.clone(), shutdown_rx));
        debug!(max_retries = config.max_retries, "Embedded queue started");

        Self {
            inner,
            worker: Mutex::new(Some(worker)),
        }
    }

    /// Create an engine with default retry settings
    pub fn with_defaults(registry: Arc<HandlerRegistry>) -> Self {
        Self::new(registry, EmbeddedConfig::default())
    }

    /// Append a job to the tail of the queue and wake the drain worker.
    ///
    /// Returns immediately; the handler runs later on the worker task.
    pub fn submit(&self, job: Job) -> QueueResult<()> {
        if self.inner.is_shut_down() {
            return Err(QueueError::Shutdown);
        }

        let job = job.normalized(Utc::now());
        debug!(job = %job.name, attempt = job.attempt_count, "Enqueued job");

        self.inner.emit(JobEvent::Enqueued {
            name: job.name.clone(),
            at: Utc::now(),
        });
        self.inner.metrics.increment_jobs_enqueued();
        self.inner.outstanding.fetch_add(1, Ordering::AcqRel);

        self.inner.pending.lock().push_back(job);
        self.inner.wake.notify_one();
        Ok(())
    }

    /// Drain the pending list on the calling task.
    ///
    /// Returns at once if another drain is already running. Cancelling the
    /// returned future mid-job puts that job back at the head of the list
    /// for the worker, so its handler may run again.
    pub async fn process(&self) {
        self.inner.process().await;
    }

    /// Number of jobs waiting to run
    pub fn queue_length(&self) -> usize {
        self.inner.pending.lock().len()
    }

    /// Whether a drain is currently running
    pub fn is_processing(&self) -> bool {
        self.inner.processing.load(Ordering::Acquire)
    }

    /// Retries waiting on their backoff timer
    pub fn pending_retries(&self) -> usize {
        self.inner.scheduled_retries.load(Ordering::Acquire)
    }

    /// True when every accepted job has reached a final outcome
    pub fn is_idle(&self) -> bool {
        self.inner.outstanding.load(Ordering::Acquire) == 0
    }

    /// Copy of the dead-letter store
    pub fn dead_letter_queue(&self) -> Vec<DeadLetterJob> {
        self.inner.dead_letters.lock().clone()
    }

    /// Empty the dead-letter store, returning how many entries were dropped
    pub fn clear_dead_letter_queue(&self) -> usize {
        let cleared = std::mem::take(&mut *self.inner.dead_letters.lock()).len();
        info!(cleared, "Cleared dead-letter queue");
        cleared
    }

    /// Remove the dead-letter entry at `index` and enqueue a fresh copy
    /// with its attempt count reset. Returns `false` for an unknown index.
    pub fn retry_dead_letter_job(&self, index: usize) -> bool {
        if self.inner.is_shut_down() {
            return false;
        }

        let dead = {
            let mut dead_letters = self.inner.dead_letters.lock();
            if index >= dead_letters.len() {
                return false;
            }
            dead_letters.remove(index)
        };

        info!(job = %dead.name(), index, "Requeueing dead-lettered job");
        match self.submit(dead.requeue()) {
            Ok(()) => true,
            Err(_) => {
                let mut dead_letters = self.inner.dead_letters.lock();
                let at = index.min(dead_letters.len());
                dead_letters.insert(at, dead);
                false
            }
        }
    }

    /// Subscribe to lifecycle events
    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.inner.events.subscribe()
    }

    pub fn metrics(&self) -> &LiveMetrics {
        &self.inner.metrics
    }

    pub fn registry(&self) -> &Arc<HandlerRegistry> {
        &self.inner.registry
    }

    pub fn config(&self) -> &EmbeddedConfig {
        &self.inner.config
    }

    /// Stop the drain worker after the job in hand and cancel scheduled
    /// retries. Anything still queued is discarded.
    pub async fn shutdown(&self) -> QueueResult<()> {
        let worker = self.worker.lock().take();
        let Some(worker) = worker else {
            return Ok(());
        };

        self.inner.shutdown.send_replace(true);
        let scheduled_retries = self.pending_retries();

        worker.await?;
        let pending = self.inner.discard_pending();

        if pending > 0 || scheduled_retries > 0 {
            warn!(
                pending,
                scheduled_retries,
                "Embedded queue shut down with unprocessed jobs; they are not persisted"
            );
        } else {
            info!("Embedded queue shut down");
        }
        Ok(())
    }
}

impl Drop for EmbeddedQueue {
    fn drop(&mut self) {
        self.inner.shutdown.send_replace(true);
    }
}

#[async_trait]
impl JobQueue for EmbeddedQueue {
    async fn enqueue(&self, job: Job) -> QueueResult<()> {
        self.submit(job)
    }

    async fn queue_length(&self) -> Option<usize> {
        Some(EmbeddedQueue::queue_length(self))
    }

    fn is_processing(&self) -> Option<bool> {
        Some(EmbeddedQueue::is_processing(self))
    }

    async fn shutdown(&self) -> QueueResult<()> {
        EmbeddedQueue::shutdown(self).await
    }

    fn kind(&self) -> BackendKind {
        BackendKind::Embedded
    }
}

async fn drain_worker(inner: Arc<Inner>, mut shutdown: watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow_and_update() {
            break;
        }

        tokio::select! {
            _ = inner.wake.notified() => inner.process().await,
            changed = shutdown.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }
    }
    debug!("Embedded drain worker stopped");
}

impl Inner {
    fn is_shut_down(&self) -> bool {
        *self.shutdown.borrow()
    }

    fn emit(&self, event: JobEvent) {
        let _ = self.events.send(event);
    }

    async fn process(self: &Arc<Self>) {
        loop {
            let Some(mut guard) = DrainGuard::acquire(self) else {
                return;
            };
            self.drain(&mut guard).await;
            drop(guard);

            // A job appended after the last pop but before the flag was
            // released would otherwise wait for the next wake-up.
            if self.is_shut_down() || self.pending.lock().is_empty() {
                return;
            }
        }
    }

    async fn drain(self: &Arc<Self>, guard: &mut DrainGuard<'_>) {
        while !self.is_shut_down() {
            let next = self.pending.lock().pop_front();
            let Some(job) = next else {
                break;
            };
            guard.in_hand = Some(job.clone());
            self.run(job).await;
            guard.in_hand = None;
        }
    }

    async fn run(self: &Arc<Self>, job: Job) {
        if job.attempt_count >= self.config.max_retries {
            let error = job
                .last_error
                .clone()
                .unwrap_or_else(|| "retry budget exhausted before dispatch".to_string());
            self.dead_letter(job, error);
            return;
        }

        debug!(job = %job.name, attempt = job.attempt_count, "Processing job");

        match self.registry.dispatch(&job).await {
            Ok(Dispatched::Handled) => {
                info!(job = %job.name, attempt = job.attempt_count, "Job completed");
                self.metrics.increment_jobs_completed();
                self.emit(JobEvent::Completed {
                    name: job.name,
                    attempt: job.attempt_count,
                    at: Utc::now(),
                });
                self.settle_one();
            }
            Ok(Dispatched::NoHandler) => {
                self.metrics.increment_jobs_dropped();
                self.emit(JobEvent::Dropped {
                    name: job.name,
                    at: Utc::now(),
                });
                self.settle_one();
            }
            Err(err) => self.fail(job, err),
        }
    }

    fn fail(self: &Arc<Self>, mut job: Job, err: JobError) {
        job.record_failure(err.message());

        if err.is_retryable() && job.attempt_count < self.config.max_retries {
            let delay = self.config.backoff.delay_for(job.attempt_count);
            let delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
            warn!(
                job = %job.name,
                attempt = job.attempt_count,
                delay_ms,
                error = %err.message(),
                "Job failed, scheduling retry"
            );
            self.metrics.increment_jobs_retried();
            self.emit(JobEvent::RetryScheduled {
                name: job.name.clone(),
                attempt: job.attempt_count,
                delay_ms,
                error: err.message().to_string(),
                at: Utc::now(),
            });
            self.schedule_retry(job, delay);
        } else {
            self.dead_letter(job, err.message().to_string());
        }
    }

    fn schedule_retry(self: &Arc<Self>, job: Job, delay: Duration) {
        let mut shutdown = self.shutdown.subscribe();
        if *shutdown.borrow() {
            debug!(job = %job.name, "Queue is shutting down, retry dropped");
            self.settle_one();
            return;
        }

        self.scheduled_retries.fetch_add(1, Ordering::AcqRel);
        let inner = Arc::clone(self);

        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {
                    debug!(job = %job.name, attempt = job.attempt_count, "Retry timer fired");
                    inner.pending.lock().push_back(job);
                    inner.scheduled_retries.fetch_sub(1, Ordering::AcqRel);
                    inner.wake.notify_one();
                }
                _ = shutdown.changed() => {
                    debug!(job = %job.name, "Retry cancelled by shutdown");
                    inner.scheduled_retries.fetch_sub(1, Ordering::AcqRel);
                    inner.settle_one();
                }
            }
        });
    }

    fn dead_letter(&self, job: Job, final_error: String) {
        let dead = DeadLetterJob::from_failure(job, final_error);
        error!(
            job = %dead.name(),
            total_attempts = dead.total_attempts,
            error = %dead.final_error,
            "Job exhausted retries, moved to dead-letter queue"
        );

        self.metrics.increment_jobs_dead_lettered();
        self.emit(JobEvent::DeadLettered {
            name: dead.job.name.clone(),
            total_attempts: dead.total_attempts,
            error: dead.final_error.clone(),
            at: Utc::now(),
        });
        self.dead_letters.lock().push(dead);
        self.settle_one();
    }

    fn settle_one(&self) {
        self.settle(1);
    }

    fn settle(&self, count: usize) {
        self.outstanding.fetch_sub(count, Ordering::AcqRel);
    }

    /// Empty the pending list, settling every job in it as lost
    fn discard_pending(&self) -> usize {
        let discarded = std::mem::take(&mut *self.pending.lock()).len();
        self.settle(discarded);
        discarded
    }
}

/// Holds the re-entrancy flag for one drain.
///
/// Dropping the drain future mid-job releases the flag and puts the job in
/// hand back at the head of the list, so the worker picks it up again.
struct DrainGuard<'a> {
    inner: &'a Inner,
    in_hand: Option<Job>,
}

impl<'a> DrainGuard<'a> {
    fn acquire(inner: &'a Inner) -> Option<Self> {
        inner
            .processing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self { inner, in_hand: None })
    }
}

impl Drop for DrainGuard<'_> {
    fn drop(&mut self) {
        self.inner.processing.store(false, Ordering::Release);

        let Some(job) = self.in_hand.take() else {
            return;
        };
        if self.inner.is_shut_down() {
            warn!(job = %job.name, "Drain cancelled during shutdown, job lost");
            self.inner.settle_one();
            return;
        }
        warn!(job = %job.name, attempt = job.attempt_count, "Drain cancelled mid-job, requeueing at head");
        self.inner.pending.lock().push_front(job);
        self.inner.wake.notify_one();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retry::BackoffPolicy;

    fn fast_config() -> EmbeddedConfig {
        EmbeddedConfig {
            max_retries: 3,
            backoff: BackoffPolicy::exponential(Duration::from_millis(1)),
        }
    }

    async fn settle(queue: &EmbeddedQueue) {
        while !queue.is_idle() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    #[tokio::test]
    async fn test_unknown_job_is_counted_as_dropped() {
        let registry = Arc::new(HandlerRegistry::new());
        let queue = EmbeddedQueue::new(registry, fast_config());

        let mut events = queue.subscribe();
        queue.submit(Job::named("nonexistent.job")).unwrap();

        match events.recv().await.unwrap() {
            JobEvent::Enqueued { name, .. } => assert_eq!(name, "nonexistent.job"),
            other => panic!("unexpected event {:?}", other),
        }
        settle(&queue).await;
        assert_eq!(queue.metrics().jobs_dropped(), 1);
    }

    #[tokio::test]
    async fn test_exhausted_job_is_not_dispatched() {
        let registry = Arc::new(HandlerRegistry::new());
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        registry.register_fn("retention.sweep", move |_job: Job| {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Ok(()) }
        });
        let queue = EmbeddedQueue::new(registry, fast_config());

        let mut job = Job::named("retention.sweep");
        job.attempt_count = 3;
        job.last_error = Some("disk full".to_string());
        queue.submit(job).unwrap();
        settle(&queue).await;

        let dead = queue.dead_letter_queue();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].final_error, "disk full");
        assert_eq!(dead[0].total_attempts, 3);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_permanent_error_skips_retries() {
        let registry = Arc::new(HandlerRegistry::new());
        registry.register_fn("leaderboard.refresh", |_job: Job| async {
            Err(JobError::permanent("unknown period"))
        });
        let queue = EmbeddedQueue::new(registry, fast_config());

        queue.submit(Job::named("leaderboard.refresh")).unwrap();
        settle(&queue).await;

        let dead = queue.dead_letter_queue();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].total_attempts, 1);
        assert_eq!(queue.metrics().jobs_retried(), 0);
    }

    #[tokio::test]
    async fn test_submit_after_shutdown_is_rejected() {
        let registry = Arc::new(HandlerRegistry::new());
        let queue = EmbeddedQueue::new(registry, fast_config());

        queue.shutdown().await.unwrap();
        queue.shutdown().await.unwrap();

        assert!(matches!(queue.submit(Job::named("retention.sweep")), Err(QueueError::Shutdown)));
    }

    #[tokio::test]
    async fn test_shutdown_settles_discarded_jobs() {
        let registry = Arc::new(HandlerRegistry::new());
        registry.register_fn("retention.sweep", |_job: Job| async { Ok(()) });
        let queue = EmbeddedQueue::new(registry, fast_config());

        for _ in 0..3 {
            queue.submit(Job::named("retention.sweep")).unwrap();
        }
        assert!(!queue.is_idle());
        queue.shutdown().await.unwrap();

        assert_eq!(queue.queue_length(), 0);
        assert!(queue.is_idle());
        assert_eq!(queue.metrics().jobs_completed(), 0);
    }

    #[tokio::test]
    async fn test_saturated_backoff_reports_max_delay() {
        let registry = Arc::new(HandlerRegistry::new());
        registry.register_fn("leaderboard.refresh", |_job: Job| async {
            Err(JobError::retryable("db unreachable"))
        });
        let config = EmbeddedConfig {
            max_retries: 3,
            backoff: BackoffPolicy::exponential(Duration::MAX),
        };
        let queue = EmbeddedQueue::new(registry, config);
        let mut events = queue.subscribe();

        queue.submit(Job::named("leaderboard.refresh")).unwrap();
        loop {
            match events.recv().await.unwrap() {
                JobEvent::RetryScheduled { delay_ms, .. } => {
                    assert_eq!(delay_ms, u64::MAX);
                    break;
                }
                JobEvent::Enqueued { .. } => continue,
                other => panic!("unexpected event {:?}", other),
            }
        }
        queue.shutdown().await.unwrap();
        settle(&queue).await;
        assert_eq!(queue.pending_retries(), 0);
    }

    #[tokio::test]
    async fn test_zero_retries_still_attempts_once() {
        let registry = Arc::new(HandlerRegistry::new());
        registry.register_fn("retention.sweep", |_job: Job| async { Ok(()) });
        let config = EmbeddedConfig {
            max_retries: 0,
            ..fast_config()
        };
        let queue = EmbeddedQueue::new(registry, config);

        queue.submit(Job::named("retention.sweep")).unwrap();
        settle(&queue).await;

        assert_eq!(queue.metrics().jobs_completed(), 1);
        assert!(queue.dead_letter_queue().is_empty());
    }
}
