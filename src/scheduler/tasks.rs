use std::sync::Arc;

use tracing::{info, warn};

use crate::dedup::Deduplicator;
use crate::queue::MemoryQueue;
use crate::scheduler::Scheduler;

/// Register the dedup eviction sweep and the hourly heartbeat.
///
/// One sweep covers every stage because the stages share a store.
pub async fn register_builtin_tasks(
    scheduler: &mut Scheduler,
    dedup: Arc<Deduplicator>,
    sweep_cron: &str,
    queue: Arc<MemoryQueue>,
) -> anyhow::Result<()> {
    scheduler
        .add_cron_job(sweep_cron, "dedup-sweep", move || {
            let dedup = dedup.clone();
            Box::pin(async move {
                if let Err(e) = dedup.sweep().await {
                    warn!(error = %e, "dedup sweep failed");
                }
            })
        })
        .await?;

    scheduler
        .add_cron_job("0 0 * * * *", "heartbeat", move || {
            let stats = queue.stats();
            Box::pin(async move {
                info!(
                    published = stats.published,
                    acked = stats.acked,
                    redelivered = stats.redelivered,
                    dead_lettered = stats.dead_lettered,
                    "Heartbeat: bot is alive"
                );
            })
        })
        .await?;

    Ok(())
}
