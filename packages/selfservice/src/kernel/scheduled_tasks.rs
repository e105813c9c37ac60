//! Scheduled background tasks using tokio-cron-scheduler.
//!
//! The expiry sweeper runs on a fixed schedule, independent of message
//! traffic. It cancels through the same transactional service path as every
//! other mutation, so cancellations flow through the outbox and the removal
//! policy. Races with concurrent approvals resolve at the aggregate: a
//! terminal state short-circuits further transitions.

use anyhow::Result;
use std::sync::Arc;
use tokio_cron_scheduler::{Job, JobScheduler};

use crate::domains::membership::service::MembershipApplicationService;
use crate::kernel::persistence::Database;

/// Start all scheduled tasks
pub async fn start_scheduler<D: Database>(
    service: Arc<MembershipApplicationService<D>>,
) -> Result<JobScheduler> {
    let scheduler = JobScheduler::new().await?;

    // Expiry sweep - runs every five minutes
    let sweep_service = Arc::clone(&service);
    let sweep_job = Job::new_async("0 */5 * * * *", move |_uuid, _lock| {
        let service = Arc::clone(&sweep_service);
        Box::pin(async move {
            match service.cancel_expired_membership_applications().await {
                Ok(0) => {}
                Ok(count) => {
                    tracing::info!(count, "cancelled expired membership applications");
                }
                Err(e) => {
                    tracing::error!("expired membership application sweep failed: {}", e);
                }
            }
        })
    })?;

    scheduler.add(sweep_job).await?;
    scheduler.start().await?;

    tracing::info!("Scheduled tasks started (membership application expiry sweep every 5 minutes)");
    Ok(scheduler)
}
