use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::{QueueError, QueueResult};

/// Opaque job payload. Only the handler knows its shape.
pub type Payload = Map<String, Value>;

/// A unit of background work, addressed to a handler by `name`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    /// Handler name shared between producers and the registry
    pub name: String,

    /// Handler-defined payload
    #[serde(default)]
    pub payload: Payload,

    /// Number of failed attempts so far
    #[serde(default)]
    pub attempt_count: u32,

    /// Error message of the last failed attempt (informational)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,

    /// Set once on first enqueue, carried across retries
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enqueued_at: Option<DateTime<Utc>>,
}

impl Job {
    /// Create a fresh job; `enqueued_at` is filled in on enqueue
    pub fn new(name: impl Into<String>, payload: Payload) -> Self {
        Self {
            name: name.into(),
            payload,
            attempt_count: 0,
            last_error: None,
            enqueued_at: None,
        }
    }

    /// Create a job with an empty payload
    pub fn named(name: impl Into<String>) -> Self {
        Self::new(name, Payload::new())
    }

    /// Create a job from a JSON value, which must be an object
    pub fn from_json(name: impl Into<String>, payload: Value) -> QueueResult<Self> {
        match payload {
            Value::Object(map) => Ok(Self::new(name, map)),
            other => Err(QueueError::SerializationError(format!(
                "job payload must be a JSON object, got {}",
                other
            ))),
        }
    }

    /// Fill in defaults for a job entering a queue for the first time.
    /// Retries keep their original `enqueued_at`.
    pub fn normalized(mut self, now: DateTime<Utc>) -> Self {
        if self.enqueued_at.is_none() {
            self.enqueued_at = Some(now);
        }
        self
    }

    /// Record a failed attempt
    pub fn record_failure(&mut self, error: &str) {
        self.attempt_count += 1;
        self.last_error = Some(error.to_string());
    }

    /// Get a payload field
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.payload.get(key)
    }
}

/// A job that exhausted its retries and was moved to quarantine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeadLetterJob {
    #[serde(flatten)]
    pub job: Job,

    /// When the final attempt failed
    pub failed_at: DateTime<Utc>,

    /// Error message of the final attempt
    pub final_error: String,

    /// Number of attempts made
    pub total_attempts: u32,
}

impl DeadLetterJob {
    /// Quarantine a job whose last attempt failed with `final_error`
    pub fn from_failure(job: Job, final_error: impl Into<String>) -> Self {
        Self {
            total_attempts: job.attempt_count,
            final_error: final_error.into(),
            failed_at: Utc::now(),
            job,
        }
    }

    /// Build the fresh job an operator requeue submits.
    /// Attempts and errors are reset; `enqueued_at` is assigned again.
    pub fn requeue(&self) -> Job {
        Job::new(self.job.name.clone(), self.job.payload.clone())
    }

    pub fn name(&self) -> &str {
        &self.job.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_missing_fields_default_on_the_wire() {
        let job: Job = serde_json::from_value(json!({ "name": "retention.sweep" })).unwrap();
        assert_eq!(job.attempt_count, 0);
        assert!(job.payload.is_empty());
        assert!(job.enqueued_at.is_none());
        assert!(job.last_error.is_none());
    }

    #[test]
    fn test_normalize_preserves_original_enqueue_time() {
        let first = Utc::now() - chrono::Duration::seconds(30);
        let job = Job::named("leaderboard.refresh").normalized(first);
        let again = job.normalized(Utc::now());
        assert_eq!(again.enqueued_at, Some(first));
    }

    #[test]
    fn test_from_json_rejects_non_objects() {
        assert!(Job::from_json("x", json!([1, 2])).is_err());
        let job = Job::from_json("leaderboard.refresh", json!({ "period": "week" })).unwrap();
        assert_eq!(job.get("period"), Some(&json!("week")));
    }

    #[test]
    fn test_dead_letter_serializes_flat() {
        let mut job = Job::from_json("points.streaks.evaluate", json!({ "userId": 7 })).unwrap();
        for _ in 0..3 {
            job.record_failure("db unreachable");
        }
        let dead = DeadLetterJob::from_failure(job, "db unreachable");
        assert_eq!(dead.total_attempts, 3);

        let value = serde_json::to_value(&dead).unwrap();
        assert_eq!(value["name"], "points.streaks.evaluate");
        assert_eq!(value["attemptCount"], 3);
        assert_eq!(value["totalAttempts"], 3);
        assert_eq!(value["finalError"], "db unreachable");
    }

    #[test]
    fn test_requeue_resets_attempts() {
        let mut job = Job::named("retention.sweep").normalized(Utc::now());
        job.record_failure("boom");
        let dead = DeadLetterJob::from_failure(job, "boom");

        let fresh = dead.requeue();
        assert_eq!(fresh.attempt_count, 0);
        assert!(fresh.last_error.is_none());
        assert!(fresh.enqueued_at.is_none());
        assert_eq!(fresh.name, "retention.sweep");
    }
}
