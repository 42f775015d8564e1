use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// Live counters for one queue engine
#[derive(Debug, Default)]
pub struct LiveMetrics {
    jobs_enqueued: AtomicU64,
    jobs_completed: AtomicU64,
    jobs_retried: AtomicU64,
    jobs_dead_lettered: AtomicU64,
    jobs_dropped: AtomicU64,
}

impl LiveMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn increment_jobs_enqueued(&self) {
        self.jobs_enqueued.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_jobs_completed(&self) {
        self.jobs_completed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_jobs_retried(&self) {
        self.jobs_retried.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_jobs_dead_lettered(&self) {
        self.jobs_dead_lettered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_jobs_dropped(&self) {
        self.jobs_dropped.fetch_add(1, Ordering::Relaxed);
    }

    // Getters for global metrics
    pub fn jobs_enqueued(&self) -> u64 {
        self.jobs_enqueued.load(Ordering::Relaxed)
    }

    pub fn jobs_completed(&self) -> u64 {
        self.jobs_completed.load(Ordering::Relaxed)
    }

    pub fn jobs_retried(&self) -> u64 {
        self.jobs_retried.load(Ordering::Relaxed)
    }

    pub fn jobs_dead_lettered(&self) -> u64 {
        self.jobs_dead_lettered.load(Ordering::Relaxed)
    }

    pub fn jobs_dropped(&self) -> u64 {
        self.jobs_dropped.load(Ordering::Relaxed)
    }

    /// Point-in-time copy of every counter
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            enqueued: self.jobs_enqueued(),
            completed: self.jobs_completed(),
            retried: self.jobs_retried(),
            dead_lettered: self.jobs_dead_lettered(),
            dropped: self.jobs_dropped(),
        }
    }
}

/// Serializable copy of [`LiveMetrics`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub enqueued: u64,
    pub completed: u64,
    pub retried: u64,
    pub dead_lettered: u64,
    pub dropped: u64,
}

impl MetricsSnapshot {
    /// Percentage of finished jobs that succeeded
    pub fn success_rate(&self) -> f64 {
        let finished = self.completed + self.dead_lettered;
        if finished == 0 {
            100.0
        } else {
            (self.completed as f64 / finished as f64) * 100.0
        }
    }
}
