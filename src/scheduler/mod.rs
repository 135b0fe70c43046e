pub mod tasks;

use std::future::Future;
use std::pin::Pin;

use anyhow::{Context, Result};
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{info, warn};

/// Boxed future produced by a scheduled task on every tick.
pub type TaskFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

/// Cron-driven background jobs (dedup sweep, heartbeat).
pub struct Scheduler {
    inner: JobScheduler,
    jobs: Vec<String>,
}

impl Scheduler {
    pub async fn new() -> Result<Self> {
        let inner = JobScheduler::new()
            .await
            .context("Failed to create job scheduler")?;
        Ok(Self {
            inner,
            jobs: Vec::new(),
        })
    }

    /// Add a recurring job. `cron_expr` uses the six-field form with seconds.
    pub async fn add_cron_job<F>(&mut self, cron_expr: &str, name: &str, task: F) -> Result<()>
    where
        F: Fn() -> TaskFuture + Send + Sync + 'static,
    {
        let job_name = name.to_string();
        let job = Job::new_async(cron_expr, move |_uuid, _lock| {
            let name = job_name.clone();
            let fut = task();
            Box::pin(async move {
                info!(task = %name, "running scheduled task");
                fut.await;
            })
        })
        .with_context(|| format!("Invalid cron expression '{}' for job: {}", cron_expr, name))?;

        self.inner
            .add(job)
            .await
            .with_context(|| format!("Failed to add job: {}", name))?;

        info!("Scheduled task '{}' with cron: {}", name, cron_expr);
        self.jobs.push(name.to_string());
        Ok(())
    }

    pub fn job_names(&self) -> &[String] {
        &self.jobs
    }

    pub async fn start(&self) -> Result<()> {
        self.inner
            .start()
            .await
            .context("Failed to start scheduler")?;
        info!(jobs = self.jobs.len(), "Scheduler started");
        Ok(())
    }

    pub async fn shutdown(&mut self) {
        match self.inner.shutdown().await {
            Ok(()) => info!("Scheduler stopped"),
            Err(e) => warn!(error = %e, "Scheduler did not shut down cleanly"),
        }
    }
}
