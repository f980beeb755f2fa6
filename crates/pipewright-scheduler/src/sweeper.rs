//! Periodic timeout sweep.
//!
//! Jobs that waited past their expiry before dispatch, and dispatched jobs
//! that ran past their run timeout, are moved to TIMEOUT.

use chrono::{DateTime, Utc};
use pipewright_core::job::{Job, JobStatus};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::SmResult;
use crate::manager::JobActionManager;

pub struct TimeoutSweeper {
    manager: Arc<JobActionManager>,
    interval: Duration,
}

impl TimeoutSweeper {
    pub fn new(manager: Arc<JobActionManager>) -> Self {
        let interval = manager.config().sweep_interval;
        Self { manager, interval }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Time out every job that is overdue at `now`. Returns how many jobs
    /// were moved.
    pub async fn sweep_once(&self, now: DateTime<Utc>) -> SmResult<usize> {
        let candidates = self
            .manager
            .jobs()
            .list_by_status(&[
                JobStatus::Created,
                JobStatus::Queued,
                JobStatus::Running,
                JobStatus::Cancelling,
            ])
            .await?;

        let mut swept = 0;
        for job in candidates.into_iter().filter(|job| is_overdue(job, now)) {
            let job_id = job.id;
            match self.manager.to_timeout(job).await {
                Ok(job) if job.status == JobStatus::Timeout => {
                    info!(job_id = %job_id, "job timed out");
                    swept += 1;
                }
                Ok(job) => {
                    debug!(job_id = %job_id, status = %job.status, "job settled before timing out");
                }
                Err(e) => warn!(job_id = %job_id, error = %e, "unable to time out job"),
            }
        }
        Ok(swept)
    }

    /// Sweep every interval, forever.
    pub async fn run(&self) {
        info!(interval = ?self.interval, "Starting timeout sweeper");
        loop {
            if let Err(e) = self.sweep_once(Utc::now()).await {
                warn!(error = %e, "timeout sweep failed");
            }
            sleep(self.interval).await;
        }
    }
}

fn is_overdue(job: &Job, now: DateTime<Utc>) -> bool {
    match job.status {
        JobStatus::Created | JobStatus::Queued => job.is_expired(now),
        JobStatus::Running | JobStatus::Cancelling => job.is_run_timeout(now),
        _ => false,
    }
}
