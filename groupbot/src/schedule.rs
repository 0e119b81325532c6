//! Periodic jobs. Cron expressions are evaluated in UTC.

use std::future::Future;

use chrono::Utc;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{debug, error, info};

use crate::{service::BotService, Error};

fn job<F, Fut>(schedule: &str, service: &BotService, run: F) -> Result<Job, Error>
where
    F: Fn(BotService) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let service = service.clone();
    Ok(Job::new_async(schedule, move |_uuid, _lock| {
        Box::pin(run(service.clone()))
    })?)
}

/// Start the broadcast, cleanup and keep-alive jobs.
pub async fn start(service: &BotService) -> Result<JobScheduler, Error> {
    let schedule = &service.config.schedule;
    let scheduler = JobScheduler::new().await?;

    scheduler
        .add(job(&schedule.broadcast, service, |service| async move {
            match service.broadcasts.tick(Utc::now()).await {
                Ok(0) => {}
                Ok(sent) => debug!("Posted {sent} broadcasts"),
                Err(err) => error!("Broadcast tick failed: {err}"),
            }
        })?)
        .await?;

    scheduler
        .add(job(&schedule.cleanup, service, |service| async move {
            if let Err(err) = service.cleanup().await {
                error!("Cleanup failed: {err}");
            }
        })?)
        .await?;

    scheduler
        .add(job(&schedule.keepalive, service, |service| async move {
            service.keepalive().await;
        })?)
        .await?;

    scheduler.start().await?;
    info!(
        "Scheduler started: broadcast `{}`, cleanup `{}`, keepalive `{}`",
        schedule.broadcast, schedule.cleanup, schedule.keepalive
    );
    Ok(scheduler)
}
