#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use dog_jobs::{
    Broker, BrokerQueue, BrokerWorker, CleanStatus, FailedJob, HandlerRegistry, Job, JobId,
    QueueError, QueueResult, QueueStats,
};

/// Everything the fake broker has been asked to do, keyed by job name
#[derive(Default)]
pub struct BrokerState {
    pub next_id: u64,
    pub waiting: HashMap<String, Vec<(JobId, Job)>>,
    pub failed: HashMap<String, Vec<FailedJob>>,
    pub paused: HashSet<String>,
    pub opened_queues: Vec<String>,
    pub closed_queues: Vec<String>,
    pub started_workers: Vec<String>,
    pub closed_workers: Vec<String>,
}

/// In-memory [`Broker`] that records calls instead of running jobs
#[derive(Clone, Default)]
pub struct FakeBroker {
    pub state: Arc<Mutex<BrokerState>>,
    /// Refuse to start a worker for this name
    pub fail_worker_for: Option<String>,
    /// Make every queue's `close` return an error
    pub fail_queue_close: bool,
}

impl FakeBroker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing_worker(name: &str) -> Self {
        Self {
            fail_worker_for: Some(name.to_string()),
            ..Self::default()
        }
    }

    pub fn refusing_close(mut self) -> Self {
        self.fail_queue_close = true;
        self
    }

    pub fn seed_failed(&self, name: &str, id: &str, reason: &str) {
        let mut job = Job::named(name);
        job.attempt_count = 3;
        job.last_error = Some(reason.to_string());
        self.state.lock().failed.entry(name.to_string()).or_default().push(FailedJob {
            id: JobId::from(id),
            job,
            failed_reason: Some(reason.to_string()),
            attempts_made: 3,
            failed_at: None,
        });
    }

    pub fn waiting(&self, name: &str) -> Vec<Job> {
        self.state
            .lock()
            .waiting
            .get(name)
            .map(|jobs| jobs.iter().map(|(_, job)| job.clone()).collect())
            .unwrap_or_default()
    }
}

#[async_trait]
impl Broker for FakeBroker {
    async fn queue(&self, name: &str) -> QueueResult<Arc<dyn BrokerQueue>> {
        self.state.lock().opened_queues.push(name.to_string());
        Ok(Arc::new(FakeQueue {
            name: name.to_string(),
            state: self.state.clone(),
            fail_close: self.fail_queue_close,
        }))
    }

    async fn worker(&self, name: &str, _registry: Arc<HandlerRegistry>) -> QueueResult<Arc<dyn BrokerWorker>> {
        if self.fail_worker_for.as_deref() == Some(name) {
            return Err(QueueError::Broker(format!("worker for {} refused", name)));
        }
        self.state.lock().started_workers.push(name.to_string());
        Ok(Arc::new(FakeWorker {
            name: name.to_string(),
            state: self.state.clone(),
        }))
    }
}

struct FakeQueue {
    name: String,
    state: Arc<Mutex<BrokerState>>,
    fail_close: bool,
}

#[async_trait]
impl BrokerQueue for FakeQueue {
    async fn add(&self, job: &Job) -> QueueResult<JobId> {
        let mut state = self.state.lock();
        state.next_id += 1;
        let id = JobId::from(state.next_id);
        state
            .waiting
            .entry(self.name.clone())
            .or_default()
            .push((id.clone(), job.clone()));
        Ok(id)
    }

    async fn stats(&self) -> QueueResult<QueueStats> {
        let state = self.state.lock();
        Ok(QueueStats {
            name: self.name.clone(),
            waiting: state.waiting.get(&self.name).map_or(0, Vec::len) as u64,
            failed: state.failed.get(&self.name).map_or(0, Vec::len) as u64,
            paused: state.paused.contains(&self.name),
            ..QueueStats::default()
        })
    }

    async fn failed_jobs(&self) -> QueueResult<Vec<FailedJob>> {
        Ok(self.state.lock().failed.get(&self.name).cloned().unwrap_or_default())
    }

    async fn retry_failed(&self, id: &JobId) -> QueueResult<bool> {
        let mut state = self.state.lock();
        let failed = state.failed.entry(self.name.clone()).or_default();
        let Some(pos) = failed.iter().position(|f| &f.id == id) else {
            return Ok(false);
        };
        let entry = failed.remove(pos);
        let mut job = entry.job;
        job.attempt_count = 0;
        job.last_error = None;
        state.waiting.entry(self.name.clone()).or_default().push((entry.id, job));
        Ok(true)
    }

    async fn remove_failed(&self, id: &JobId) -> QueueResult<bool> {
        let mut state = self.state.lock();
        let failed = state.failed.entry(self.name.clone()).or_default();
        let before = failed.len();
        failed.retain(|f| &f.id != id);
        Ok(failed.len() < before)
    }

    async fn clean(&self, _grace: Duration, status: CleanStatus) -> QueueResult<Vec<JobId>> {
        let mut state = self.state.lock();
        let removed = match status {
            CleanStatus::Failed => state
                .failed
                .remove(&self.name)
                .unwrap_or_default()
                .into_iter()
                .map(|f| f.id)
                .collect(),
            CleanStatus::Wait => state
                .waiting
                .remove(&self.name)
                .unwrap_or_default()
                .into_iter()
                .map(|(id, _)| id)
                .collect(),
            CleanStatus::Completed | CleanStatus::Delayed => Vec::new(),
        };
        Ok(removed)
    }

    async fn pause(&self) -> QueueResult<()> {
        self.state.lock().paused.insert(self.name.clone());
        Ok(())
    }

    async fn resume(&self) -> QueueResult<()> {
        self.state.lock().paused.remove(&self.name);
        Ok(())
    }

    async fn close(&self) -> QueueResult<()> {
        self.state.lock().closed_queues.push(self.name.clone());
        if self.fail_close {
            return Err(QueueError::Broker(format!("queue {} did not close cleanly", self.name)));
        }
        Ok(())
    }
}

struct FakeWorker {
    name: String,
    state: Arc<Mutex<BrokerState>>,
}

#[async_trait]
impl BrokerWorker for FakeWorker {
    async fn close(&self) -> QueueResult<()> {
        self.state.lock().closed_workers.push(self.name.clone());
        Ok(())
    }
}

/// Registry with the three production job names, all succeeding
pub fn registry_with_defaults() -> Arc<HandlerRegistry> {
    let registry = Arc::new(HandlerRegistry::new());
    for name in ["leaderboard.refresh", "points.streaks.evaluate", "retention.sweep"] {
        registry.register_fn(name, |_job: Job| async { Ok(()) });
    }
    registry
}
