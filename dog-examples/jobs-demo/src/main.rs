mod handlers;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use dog_jobs::{
    get_queue_service, init_tracing, HandlerRegistry, Job, JobQueue, QueueService, QueueSettings,
};
use serde_json::json;
use tracing::info;

use handlers::{LEADERBOARD_REFRESH, RETENTION_SWEEP, STREAKS_EVALUATE};

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();

    let registry = Arc::new(HandlerRegistry::new());
    handlers::register_all(&registry);

    let settings = QueueSettings::from_env();
    let service = get_queue_service(registry, &settings).await;
    info!(backend = %service.kind(), "Queue service ready");

    service
        .enqueue(Job::from_json(LEADERBOARD_REFRESH, json!({"period": "weekly"}))?)
        .await?;
    service
        .enqueue(Job::from_json(LEADERBOARD_REFRESH, json!({"period": "hourly"}))?)
        .await?;
    service
        .enqueue(Job::from_json(STREAKS_EVALUATE, json!({"userId": "u-17"}))?)
        .await?;
    service
        .enqueue(Job::from_json(RETENTION_SWEEP, json!({"olderThanDays": 90}))?)
        .await?;
    service.enqueue(Job::named("badges.recompute")).await?;

    wait_for_quiet(&service).await;
    report(&service).await?;

    service.shutdown().await?;
    Ok(())
}

/// Give the active backend time to work through the demo jobs
async fn wait_for_quiet(service: &QueueService) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(30);
    while tokio::time::Instant::now() < deadline {
        let quiet = match service.embedded() {
            Some(engine) => engine.is_idle(),
            None => service.queue().queue_length().await == Some(0),
        };
        if quiet {
            return;
        }
        tokio::time::sleep(Duration::from_millis(250)).await;
    }
}

async fn report(service: &QueueService) -> Result<()> {
    if let Some(engine) = service.embedded() {
        for (index, dead) in engine.dead_letter_queue().iter().enumerate() {
            println!(
                "dead-letter[{}] {} after {} attempts: {}",
                index, dead.job.name, dead.total_attempts, dead.final_error
            );
        }
        println!("{}", serde_json::to_string_pretty(&engine.metrics().snapshot())?);
    }

    if let Some(durable) = service.durable() {
        for name in durable.queue_names() {
            let stats = durable.get_queue_stats(&name).await?;
            println!("{}", serde_json::to_string(&stats)?);
            for failed in durable.get_failed_jobs(&name).await? {
                println!(
                    "failed {} #{}: {}",
                    name,
                    failed.id,
                    failed.failed_reason.unwrap_or_default()
                );
            }
        }
    }
    Ok(())
}
