//! Redis broker
//!
//! Key layout per job name (`{prefix}:{name}:...`):
//!
//! - `id`        counter for broker job ids
//! - `job:{id}`  hash with the serialized job and its bookkeeping fields
//! - `wait`      list of ids ready to run (pushed left, taken right)
//! - `active`    list of ids a worker has taken
//! - `delayed`   sorted set of ids waiting for a retry, scored by due time
//! - `completed` sorted set scored by finish time, trimmed to `keep_completed`
//! - `failed`    sorted set scored by finish time, trimmed to `keep_failed`
//! - `paused`    present while the queue is paused

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use redis::aio::ConnectionManager;
use redis::Script;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::{Broker, BrokerQueue, BrokerWorker};
use crate::{
    config::DurableConfig, job::HandlerRegistry, CleanStatus, FailedJob, Job, JobError, JobId,
    QueueError, QueueResult, QueueStats,
};

const BOOKKEEPING_ATTEMPTS: u32 = 3;

const PROMOTE_DELAYED: &str = r#"
local ids = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[1], 'LIMIT', 0, 100)
for _, id in ipairs(ids) do
  redis.call('ZREM', KEYS[1], id)
  redis.call('LPUSH', KEYS[2], id)
end
return #ids
"#;

const FINISH: &str = r#"
redis.call('LREM', KEYS[1], 1, ARGV[1])
redis.call('ZADD', KEYS[2], ARGV[2], ARGV[1])
redis.call('HSET', KEYS[3], 'finishedOn', ARGV[2], 'attemptsMade', ARGV[5])
if ARGV[6] ~= '' then
  redis.call('HSET', KEYS[3], 'failedReason', ARGV[6])
end
local excess = redis.call('ZCARD', KEYS[2]) - tonumber(ARGV[3])
if excess > 0 then
  local stale = redis.call('ZRANGE', KEYS[2], 0, excess - 1)
  for _, old in ipairs(stale) do
    redis.call('DEL', ARGV[4] .. old)
  end
  redis.call('ZREMRANGEBYRANK', KEYS[2], 0, excess - 1)
end
return 0
"#;

const RETRY_FAILED: &str = r#"
if redis.call('ZREM', KEYS[1], ARGV[1]) == 0 then
  return 0
end
redis.call('HSET', KEYS[3], 'attemptsMade', 0)
redis.call('HDEL', KEYS[3], 'failedReason', 'finishedOn')
redis.call('LPUSH', KEYS[2], ARGV[1])
return 1
"#;

const RECOVER_ACTIVE: &str = r#"
local moved = 0
while redis.call('LMOVE', KEYS[1], KEYS[2], 'LEFT', 'RIGHT') do
  moved = moved + 1
end
return moved
"#;

struct Scripts {
    promote: Script,
    finish: Script,
    retry_failed: Script,
    recover: Script,
}

impl Scripts {
    fn load() -> Self {
        Self {
            promote: Script::new(PROMOTE_DELAYED),
            finish: Script::new(FINISH),
            retry_failed: Script::new(RETRY_FAILED),
            recover: Script::new(RECOVER_ACTIVE),
        }
    }
}

/// Key names for one job name under a prefix
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueKeys {
    prefix: String,
    name: String,
}

impl QueueKeys {
    pub fn new(prefix: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            name: name.into(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn key(&self, suffix: &str) -> String {
        format!("{}:{}:{}", self.prefix, self.name, suffix)
    }

    pub fn id(&self) -> String {
        self.key("id")
    }

    pub fn wait(&self) -> String {
        self.key("wait")
    }

    pub fn active(&self) -> String {
        self.key("active")
    }

    pub fn delayed(&self) -> String {
        self.key("delayed")
    }

    pub fn completed(&self) -> String {
        self.key("completed")
    }

    pub fn failed(&self) -> String {
        self.key("failed")
    }

    pub fn paused(&self) -> String {
        self.key("paused")
    }

    pub fn job_prefix(&self) -> String {
        self.key("job:")
    }

    pub fn job(&self, id: &JobId) -> String {
        format!("{}{}", self.job_prefix(), id)
    }
}

/// [`Broker`] backed by a single multiplexed Redis connection
#[derive(Clone)]
pub struct RedisBroker {
    conn: ConnectionManager,
    config: DurableConfig,
    scripts: Arc<Scripts>,
}

impl RedisBroker {
    /// Connect and ping, failing if the server does not answer within
    /// `config.connect_timeout`
    pub async fn connect(config: DurableConfig) -> QueueResult<Self> {
        let client = redis::Client::open(config.redis_url.as_str())?;
        let mut conn = tokio::time::timeout(config.connect_timeout, ConnectionManager::new(client))
            .await
            .map_err(|_| {
                QueueError::Broker(format!(
                    "timed out connecting to Redis after {:?}",
                    config.connect_timeout
                ))
            })??;

        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        info!(prefix = %config.key_prefix, "Connected to Redis broker");

        Ok(Self {
            conn,
            config,
            scripts: Arc::new(Scripts::load()),
        })
    }

    fn keys(&self, name: &str) -> QueueKeys {
        QueueKeys::new(self.config.key_prefix.clone(), name)
    }
}

#[async_trait]
impl Broker for RedisBroker {
    async fn queue(&self, name: &str) -> QueueResult<Arc<dyn BrokerQueue>> {
        Ok(Arc::new(RedisQueue {
            conn: self.conn.clone(),
            keys: self.keys(name),
            scripts: self.scripts.clone(),
        }))
    }

    async fn worker(&self, name: &str, registry: Arc<HandlerRegistry>) -> QueueResult<Arc<dyn BrokerWorker>> {
        let poller = Arc::new(Poller {
            conn: self.conn.clone(),
            keys: self.keys(name),
            config: self.config.clone(),
            scripts: self.scripts.clone(),
            registry,
        });

        // Ids left in `active` by a previous process never finished
        let mut conn = self.conn.clone();
        let recovered: u64 = poller
            .scripts
            .recover
            .key(poller.keys.active())
            .key(poller.keys.wait())
            .invoke_async(&mut conn)
            .await?;
        if recovered > 0 {
            warn!(queue = %name, recovered, "Requeued jobs left active by a previous worker");
        }

        let (shutdown, _) = watch::channel(false);
        let tasks = (0..self.config.concurrency.max(1))
            .map(|slot| tokio::spawn(poll_loop(poller.clone(), slot, shutdown.subscribe())))
            .collect();

        debug!(queue = %name, concurrency = self.config.concurrency, "Started Redis worker");
        Ok(Arc::new(RedisWorker {
            name: name.to_string(),
            shutdown,
            tasks: Mutex::new(tasks),
        }))
    }
}

struct RedisQueue {
    conn: ConnectionManager,
    keys: QueueKeys,
    scripts: Arc<Scripts>,
}

impl RedisQueue {
    /// Ids from `ids` whose job was enqueued at or before `cutoff`
    async fn enqueued_before(&self, conn: &mut ConnectionManager, ids: Vec<String>, cutoff: i64) -> QueueResult<Vec<String>> {
        let mut old = Vec::new();
        for id in ids {
            let timestamp: Option<i64> = redis::cmd("HGET")
                .arg(self.keys.job(&JobId::from(id.as_str())))
                .arg("timestamp")
                .query_async(conn)
                .await?;
            if timestamp.map_or(true, |ts| ts <= cutoff) {
                old.push(id);
            }
        }
        Ok(old)
    }
}

#[async_trait]
impl BrokerQueue for RedisQueue {
    async fn add(&self, job: &Job) -> QueueResult<JobId> {
        let mut conn = self.conn.clone();
        let now = Utc::now();
        let job = job.clone().normalized(now);
        let data = serde_json::to_string(&job)?;

        let seq: u64 = redis::cmd("INCR").arg(self.keys.id()).query_async(&mut conn).await?;
        let id = JobId::from(seq);

        let _: () = redis::pipe()
            .atomic()
            .cmd("HSET")
            .arg(self.keys.job(&id))
            .arg("name")
            .arg(&job.name)
            .arg("data")
            .arg(&data)
            .arg("timestamp")
            .arg(now.timestamp_millis())
            .arg("attemptsMade")
            .arg(job.attempt_count)
            .ignore()
            .cmd("LPUSH")
            .arg(self.keys.wait())
            .arg(id.as_str())
            .ignore()
            .query_async(&mut conn)
            .await?;

        Ok(id)
    }

    async fn stats(&self) -> QueueResult<QueueStats> {
        let mut conn = self.conn.clone();
        let (waiting, active, delayed, completed, failed, paused): (u64, u64, u64, u64, u64, bool) = redis::pipe()
            .cmd("LLEN")
            .arg(self.keys.wait())
            .cmd("LLEN")
            .arg(self.keys.active())
            .cmd("ZCARD")
            .arg(self.keys.delayed())
            .cmd("ZCARD")
            .arg(self.keys.completed())
            .cmd("ZCARD")
            .arg(self.keys.failed())
            .cmd("EXISTS")
            .arg(self.keys.paused())
            .query_async(&mut conn)
            .await?;

        Ok(QueueStats {
            name: self.keys.name().to_string(),
            waiting,
            active,
            delayed,
            completed,
            failed,
            paused,
        })
    }

    async fn failed_jobs(&self) -> QueueResult<Vec<FailedJob>> {
        let mut conn = self.conn.clone();
        let ids: Vec<String> = redis::cmd("ZREVRANGE")
            .arg(self.keys.failed())
            .arg(0)
            .arg(-1)
            .query_async(&mut conn)
            .await?;

        let mut failed = Vec::with_capacity(ids.len());
        for id in ids.into_iter().map(JobId::from) {
            let fields: HashMap<String, String> = redis::cmd("HGETALL")
                .arg(self.keys.job(&id))
                .query_async(&mut conn)
                .await?;
            if fields.is_empty() {
                continue;
            }
            failed.push(failed_job(id, &fields)?);
        }
        Ok(failed)
    }

    async fn retry_failed(&self, id: &JobId) -> QueueResult<bool> {
        let mut conn = self.conn.clone();
        let moved: i64 = self
            .scripts
            .retry_failed
            .key(self.keys.failed())
            .key(self.keys.wait())
            .key(self.keys.job(id))
            .arg(id.as_str())
            .invoke_async(&mut conn)
            .await?;
        Ok(moved == 1)
    }

    async fn remove_failed(&self, id: &JobId) -> QueueResult<bool> {
        let mut conn = self.conn.clone();
        let removed: u64 = redis::cmd("ZREM")
            .arg(self.keys.failed())
            .arg(id.as_str())
            .query_async(&mut conn)
            .await?;
        if removed == 0 {
            return Ok(false);
        }
        let _: u64 = redis::cmd("DEL").arg(self.keys.job(id)).query_async(&mut conn).await?;
        Ok(true)
    }

    async fn clean(&self, grace: Duration, status: CleanStatus) -> QueueResult<Vec<JobId>> {
        let mut conn = self.conn.clone();
        let grace_ms = i64::try_from(grace.as_millis()).unwrap_or(i64::MAX);
        let cutoff = Utc::now().timestamp_millis().saturating_sub(grace_ms);

        let (ids, container) = match status {
            CleanStatus::Completed | CleanStatus::Failed => {
                let set = if status == CleanStatus::Completed {
                    self.keys.completed()
                } else {
                    self.keys.failed()
                };
                let ids: Vec<String> = redis::cmd("ZRANGEBYSCORE")
                    .arg(&set)
                    .arg("-inf")
                    .arg(cutoff)
                    .query_async(&mut conn)
                    .await?;
                (ids, set)
            }
            CleanStatus::Delayed => {
                let all: Vec<String> = redis::cmd("ZRANGE")
                    .arg(self.keys.delayed())
                    .arg(0)
                    .arg(-1)
                    .query_async(&mut conn)
                    .await?;
                (self.enqueued_before(&mut conn, all, cutoff).await?, self.keys.delayed())
            }
            CleanStatus::Wait => {
                let all: Vec<String> = redis::cmd("LRANGE")
                    .arg(self.keys.wait())
                    .arg(0)
                    .arg(-1)
                    .query_async(&mut conn)
                    .await?;
                (self.enqueued_before(&mut conn, all, cutoff).await?, self.keys.wait())
            }
        };

        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let mut pipe = redis::pipe();
        pipe.atomic();
        for id in &ids {
            if status == CleanStatus::Wait {
                pipe.cmd("LREM").arg(&container).arg(0).arg(id).ignore();
            } else {
                pipe.cmd("ZREM").arg(&container).arg(id).ignore();
            }
            pipe.cmd("DEL").arg(self.keys.job(&JobId::from(id.as_str()))).ignore();
        }
        let _: () = pipe.query_async(&mut conn).await?;

        Ok(ids.into_iter().map(JobId::from).collect())
    }

    async fn pause(&self) -> QueueResult<()> {
        let mut conn = self.conn.clone();
        let _: () = redis::cmd("SET").arg(self.keys.paused()).arg(1).query_async(&mut conn).await?;
        Ok(())
    }

    async fn resume(&self) -> QueueResult<()> {
        let mut conn = self.conn.clone();
        let _: u64 = redis::cmd("DEL").arg(self.keys.paused()).query_async(&mut conn).await?;
        Ok(())
    }

    async fn close(&self) -> QueueResult<()> {
        debug!(queue = %self.keys.name(), "Closed Redis queue");
        Ok(())
    }
}

struct RedisWorker {
    name: String,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

#[async_trait]
impl BrokerWorker for RedisWorker {
    async fn close(&self) -> QueueResult<()> {
        self.shutdown.send_replace(true);
        let tasks = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            task.await?;
        }
        debug!(queue = %self.name, "Closed Redis worker");
        Ok(())
    }
}

struct Poller {
    conn: ConnectionManager,
    keys: QueueKeys,
    config: DurableConfig,
    scripts: Arc<Scripts>,
    registry: Arc<HandlerRegistry>,
}

async fn poll_loop(poller: Arc<Poller>, slot: usize, mut shutdown: watch::Receiver<bool>) {
    loop {
        let stop = *shutdown.borrow_and_update();
        if stop {
            break;
        }

        match poller.tick().await {
            Ok(true) => continue,
            Ok(false) => {}
            Err(e) => warn!(queue = %poller.keys.name(), slot, error = %e, "Durable worker poll failed"),
        }

        tokio::select! {
            _ = tokio::time::sleep(poller.config.poll_interval) => {}
            changed = shutdown.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }
    }
    debug!(queue = %poller.keys.name(), slot, "Durable worker slot stopped");
}

impl Poller {
    /// Take and run one job. `Ok(false)` when there was nothing to take.
    async fn tick(&self) -> QueueResult<bool> {
        let mut conn = self.conn.clone();

        let _: u64 = self
            .scripts
            .promote
            .key(self.keys.delayed())
            .key(self.keys.wait())
            .arg(Utc::now().timestamp_millis())
            .invoke_async(&mut conn)
            .await?;

        let paused: bool = redis::cmd("EXISTS").arg(self.keys.paused()).query_async(&mut conn).await?;
        if paused {
            return Ok(false);
        }

        let taken: Option<String> = redis::cmd("LMOVE")
            .arg(self.keys.wait())
            .arg(self.keys.active())
            .arg("RIGHT")
            .arg("LEFT")
            .query_async(&mut conn)
            .await?;

        match taken {
            Some(id) => {
                self.run(&mut conn, JobId::from(id)).await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn run(&self, conn: &mut ConnectionManager, id: JobId) -> QueueResult<()> {
        let fields: HashMap<String, String> = redis::cmd("HGETALL")
            .arg(self.keys.job(&id))
            .query_async(conn)
            .await?;

        let job = match decode_job(&fields) {
            Ok(job) => job,
            Err(e) => {
                error!(queue = %self.keys.name(), job_id = %id, error = %e, "Discarding unreadable durable job");
                let _: () = redis::pipe()
                    .atomic()
                    .cmd("LREM")
                    .arg(self.keys.active())
                    .arg(1)
                    .arg(id.as_str())
                    .ignore()
                    .cmd("DEL")
                    .arg(self.keys.job(&id))
                    .ignore()
                    .query_async(conn)
                    .await?;
                return Ok(());
            }
        };

        let attempts_made = job.attempt_count + 1;
        let settlement = match self.registry.dispatch(&job).await {
            Ok(_) => Settlement::Completed,
            Err(err) => settle_failure(&self.config, &err, attempts_made, Utc::now().timestamp_millis()),
        };

        // The handler has already run; losing this write would strand the
        // id in `active` until the next worker start.
        with_retries(BOOKKEEPING_ATTEMPTS, self.config.poll_interval, || {
            let mut conn = self.conn.clone();
            let settlement = &settlement;
            let id = &id;
            async move { self.record(&mut conn, id, attempts_made, settlement).await }
        })
        .await?;

        match &settlement {
            Settlement::Completed => {
                info!(job = %job.name, job_id = %id, attempt = attempts_made, "Job completed");
            }
            Settlement::Retry { delay, reason, .. } => warn!(
                job = %job.name,
                job_id = %id,
                attempt = attempts_made,
                delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                error = %reason,
                "Job failed, retry scheduled"
            ),
            Settlement::Failed { reason } => error!(
                job = %job.name,
                job_id = %id,
                total_attempts = attempts_made,
                error = %reason,
                "Job moved to failed set"
            ),
        }
        Ok(())
    }

    async fn record(
        &self,
        conn: &mut ConnectionManager,
        id: &JobId,
        attempts_made: u32,
        settlement: &Settlement,
    ) -> QueueResult<()> {
        match settlement {
            Settlement::Completed => self.finish(conn, id, true, attempts_made, "").await,
            Settlement::Retry { due_ms, reason, .. } => {
                let _: () = redis::pipe()
                    .atomic()
                    .cmd("LREM")
                    .arg(self.keys.active())
                    .arg(1)
                    .arg(id.as_str())
                    .ignore()
                    .cmd("HSET")
                    .arg(self.keys.job(id))
                    .arg("attemptsMade")
                    .arg(attempts_made)
                    .arg("failedReason")
                    .arg(reason)
                    .ignore()
                    .cmd("ZADD")
                    .arg(self.keys.delayed())
                    .arg(*due_ms)
                    .arg(id.as_str())
                    .ignore()
                    .query_async(conn)
                    .await?;
                Ok(())
            }
            Settlement::Failed { reason } => self.finish(conn, id, false, attempts_made, reason).await,
        }
    }

    async fn finish(
        &self,
        conn: &mut ConnectionManager,
        id: &JobId,
        succeeded: bool,
        attempts_made: u32,
        failed_reason: &str,
    ) -> QueueResult<()> {
        let (set, keep) = if succeeded {
            (self.keys.completed(), self.config.keep_completed)
        } else {
            (self.keys.failed(), self.config.keep_failed)
        };

        let _: i64 = self
            .scripts
            .finish
            .key(self.keys.active())
            .key(set)
            .key(self.keys.job(id))
            .arg(id.as_str())
            .arg(Utc::now().timestamp_millis())
            .arg(keep)
            .arg(self.keys.job_prefix())
            .arg(attempts_made)
            .arg(failed_reason)
            .invoke_async(conn)
            .await?;
        Ok(())
    }
}

/// Where a job goes once its handler has returned
#[derive(Debug, Clone, PartialEq)]
enum Settlement {
    Completed,
    /// Back to `delayed`, due at `due_ms` (epoch millis)
    Retry {
        delay: Duration,
        due_ms: i64,
        reason: String,
    },
    Failed {
        reason: String,
    },
}

/// Retry while attempts remain, waiting `base * factor^(attempts_made - 1)`
fn settle_failure(config: &DurableConfig, err: &JobError, attempts_made: u32, now_ms: i64) -> Settlement {
    let reason = err.message().to_string();
    if !err.is_retryable() || attempts_made >= config.attempts {
        return Settlement::Failed { reason };
    }

    let delay = config.backoff.delay_for(attempts_made.saturating_sub(1));
    let delay_ms = i64::try_from(delay.as_millis()).unwrap_or(i64::MAX);
    Settlement::Retry {
        delay,
        due_ms: now_ms.saturating_add(delay_ms),
        reason,
    }
}

/// Run `op` up to `attempts` times, pausing between failures
async fn with_retries<F, Fut>(attempts: u32, pause: Duration, mut op: F) -> QueueResult<()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = QueueResult<()>>,
{
    let mut tried = 1;
    loop {
        match op().await {
            Ok(()) => return Ok(()),
            Err(e) if tried < attempts => {
                warn!(attempt = tried, error = %e, "Durable bookkeeping write failed, retrying");
                tried += 1;
                tokio::time::sleep(pause).await;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Rebuild a job from its broker hash
fn decode_job(fields: &HashMap<String, String>) -> QueueResult<Job> {
    let data = fields
        .get("data")
        .ok_or_else(|| QueueError::SerializationError("job hash has no data field".to_string()))?;
    let mut job: Job = serde_json::from_str(data)?;

    job.attempt_count = fields
        .get("attemptsMade")
        .and_then(|raw| raw.parse().ok())
        .unwrap_or(0);
    job.last_error = fields.get("failedReason").filter(|reason| !reason.is_empty()).cloned();
    Ok(job)
}

fn failed_job(id: JobId, fields: &HashMap<String, String>) -> QueueResult<FailedJob> {
    let job = decode_job(fields)?;
    let failed_at = fields
        .get("finishedOn")
        .and_then(|raw| raw.parse::<i64>().ok())
        .and_then(DateTime::<Utc>::from_timestamp_millis);

    Ok(FailedJob {
        id,
        failed_reason: job.last_error.clone(),
        attempts_made: job.attempt_count,
        failed_at,
        job,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retry::BackoffPolicy;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn hash(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn test_key_layout() {
        let keys = QueueKeys::new("dog-jobs", "leaderboard.refresh");
        assert_eq!(keys.wait(), "dog-jobs:leaderboard.refresh:wait");
        assert_eq!(keys.delayed(), "dog-jobs:leaderboard.refresh:delayed");
        assert_eq!(keys.paused(), "dog-jobs:leaderboard.refresh:paused");
        assert_eq!(keys.job(&JobId::from(42u64)), "dog-jobs:leaderboard.refresh:job:42");
        assert!(keys.job(&JobId::from("7")).starts_with(&keys.job_prefix()));
    }

    #[test]
    fn test_decode_job_applies_bookkeeping() {
        let job = Job::from_json("retention.sweep", json!({"days": 30})).unwrap();
        let data = serde_json::to_string(&job).unwrap();
        let fields = hash(&[
            ("data", data.as_str()),
            ("attemptsMade", "2"),
            ("failedReason", "db unreachable"),
            ("finishedOn", "1700000000000"),
        ]);

        let failed = failed_job(JobId::from("9"), &fields).unwrap();
        assert_eq!(failed.job.name, "retention.sweep");
        assert_eq!(failed.job.get("days"), Some(&json!(30)));
        assert_eq!(failed.attempts_made, 2);
        assert_eq!(failed.failed_reason.as_deref(), Some("db unreachable"));
        assert_eq!(failed.failed_at.map(|t| t.timestamp_millis()), Some(1_700_000_000_000));
    }

    fn three_attempts() -> DurableConfig {
        DurableConfig {
            attempts: 3,
            backoff: BackoffPolicy::exponential(Duration::from_millis(2000)),
            ..DurableConfig::default()
        }
    }

    #[test]
    fn test_retryable_failures_back_off_until_attempts_run_out() {
        let config = three_attempts();
        let err = JobError::retryable("db unreachable");
        let now = 1_700_000_000_000;

        match settle_failure(&config, &err, 1, now) {
            Settlement::Retry { delay, due_ms, reason } => {
                assert_eq!(delay, Duration::from_secs(2));
                assert_eq!(due_ms, now + 2000);
                assert_eq!(reason, "db unreachable");
            }
            other => panic!("unexpected settlement {:?}", other),
        }
        assert!(matches!(
            settle_failure(&config, &err, 2, now),
            Settlement::Retry { due_ms, .. } if due_ms == now + 4000
        ));
        assert_eq!(
            settle_failure(&config, &err, 3, now),
            Settlement::Failed { reason: "db unreachable".to_string() }
        );
    }

    #[test]
    fn test_permanent_failure_skips_retries() {
        let settlement = settle_failure(&three_attempts(), &JobError::permanent("unknown period"), 1, 0);
        assert_eq!(settlement, Settlement::Failed { reason: "unknown period".to_string() });
    }

    #[test]
    fn test_saturated_delay_keeps_due_time_in_range() {
        let config = DurableConfig {
            backoff: BackoffPolicy::exponential(Duration::MAX),
            ..three_attempts()
        };
        let settlement = settle_failure(&config, &JobError::retryable("timeout"), 2, 5);
        assert!(matches!(settlement, Settlement::Retry { due_ms: i64::MAX, .. }));
    }

    #[test]
    fn test_retry_bookkeeping_feeds_the_next_attempt() {
        let job = Job::from_json("leaderboard.refresh", json!({"period": "weekly"})).unwrap();
        let data = serde_json::to_string(&job).unwrap();
        // What a scheduled retry leaves in the hash after the first failure
        let fields = hash(&[("data", data.as_str()), ("attemptsMade", "1"), ("failedReason", "db unreachable")]);

        let next = decode_job(&fields).unwrap();
        assert_eq!(next.attempt_count, 1);
        assert_eq!(next.last_error.as_deref(), Some("db unreachable"));
        assert_eq!(next.get("period"), Some(&json!("weekly")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_bookkeeping_write_is_retried() {
        let calls = AtomicU32::new(0);
        let result = with_retries(3, Duration::from_millis(100), || {
            let call = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if call < 2 {
                    Err(QueueError::Broker("connection reset".to_string()))
                } else {
                    Ok(())
                }
            }
        })
        .await;

        assert!(result.is_ok());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_bookkeeping_gives_up_after_its_attempts() {
        let calls = AtomicU32::new(0);
        let result = with_retries(3, Duration::from_millis(100), || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(QueueError::Broker("connection reset".to_string())) }
        })
        .await;

        assert!(matches!(result, Err(QueueError::Broker(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_decode_job_without_data_fails() {
        let err = decode_job(&hash(&[("attemptsMade", "1")])).unwrap_err();
        assert!(matches!(err, QueueError::SerializationError(_)));
    }
}
