//! Worker that claims queued jobs and starts them.

use pipewright_core::JobId;
use pipewright_core::queue::JobQueue;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{info, warn};

use crate::manager::JobActionManager;
use crate::{SmError, SmResult};

/// A worker that claims jobs from one queue and moves them to RUNNING.
pub struct Worker {
    id: String,
    queue_name: String,
    queue: Arc<dyn JobQueue>,
    manager: Arc<JobActionManager>,
}

impl Worker {
    pub fn new(
        id: impl Into<String>,
        queue_name: impl Into<String>,
        queue: Arc<dyn JobQueue>,
        manager: Arc<JobActionManager>,
    ) -> Self {
        Self {
            id: id.into(),
            queue_name: queue_name.into(),
            queue,
            manager,
        }
    }

    /// Claim and start at most one job. Returns whether a message was
    /// claimed.
    pub async fn poll_once(&self) -> SmResult<bool> {
        let Some(payload) = self.queue.claim(&self.queue_name).await? else {
            return Ok(false);
        };

        let job_id = JobId::from_bytes(&payload)?;
        info!(worker_id = %self.id, job_id = %job_id, "Claimed job");

        let job = self.manager.jobs().get(job_id).await?;
        match self.manager.to_run(job).await {
            Ok(job) => {
                info!(job_id = %job.id, status = %job.status, path = ?job.current_path, "Job started");
            }
            Err(SmError::JobFinished(id)) => {
                info!(job_id = %id, "Claimed job is already finished");
            }
            Err(e) => {
                warn!(worker_id = %self.id, job_id = %job_id, error = %e, "Failed to start job");
            }
        }
        Ok(true)
    }

    /// Run the worker loop.
    pub async fn run(&self) {
        info!(worker_id = %self.id, queue = %self.queue_name, "Starting worker");

        loop {
            match self.poll_once().await {
                Ok(true) => {}
                Ok(false) => {
                    // No jobs available, wait before polling again
                    sleep(Duration::from_secs(1)).await;
                }
                Err(e) => {
                    warn!(worker_id = %self.id, error = %e, "Failed to claim job");
                    sleep(Duration::from_secs(5)).await;
                }
            }
        }
    }
}
