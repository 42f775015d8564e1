//! Gamification maintenance jobs
//!
//! Stand-ins for the real database work: each handler logs what it would
//! do and fails the way the real one can.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use dog_jobs::{HandlerRegistry, Job, JobError};
use tracing::info;

pub const LEADERBOARD_REFRESH: &str = "leaderboard.refresh";
pub const STREAKS_EVALUATE: &str = "points.streaks.evaluate";
pub const RETENTION_SWEEP: &str = "retention.sweep";

const PERIODS: [&str; 3] = ["daily", "weekly", "all_time"];

pub fn register_all(registry: &HandlerRegistry) {
    registry.register_fn(LEADERBOARD_REFRESH, |job: Job| async move { refresh_leaderboard(job) });

    // Fails on the first two calls to show retries recovering
    let streak_calls = Arc::new(AtomicU32::new(0));
    registry.register_fn(STREAKS_EVALUATE, move |job: Job| {
        let call = streak_calls.fetch_add(1, Ordering::SeqCst);
        async move {
            if call < 2 {
                return Err(JobError::retryable("db unreachable"));
            }
            let user = job.get("userId").and_then(|v| v.as_str()).unwrap_or("all");
            info!(user, "Evaluated point streaks");
            Ok(())
        }
    });

    registry.register_fn(RETENTION_SWEEP, |job: Job| async move {
        let days = job
            .get("olderThanDays")
            .and_then(|v| v.as_u64())
            .ok_or_else(|| JobError::permanent("olderThanDays is required"))?;
        info!(days, "Swept expired activity rows");
        Ok::<(), JobError>(())
    });
}

fn refresh_leaderboard(job: Job) -> Result<(), JobError> {
    let period = job.get("period").and_then(|v| v.as_str()).unwrap_or("weekly");
    if !PERIODS.contains(&period) {
        return Err(JobError::permanent(format!("unknown leaderboard period: {}", period)));
    }
    info!(period, "Refreshed leaderboard view");
    Ok(())
}
