//! Post-job tasks.

use async_trait::async_trait;
use pipewright_core::job::Job;
use pipewright_core::task::LocalTaskRunner;
use pipewright_core::vars::keys;
use pipewright_core::Result;
use tracing::info;

/// Reports each finished job in the log.
#[derive(Debug, Default)]
pub struct LogTaskRunner;

#[async_trait]
impl LocalTaskRunner for LogTaskRunner {
    async fn run(&self, job: &Job) -> Result<()> {
        let duration = match (job.started_at, job.finished_at) {
            (Some(start), Some(finish)) => Some((finish - start).num_milliseconds()),
            _ => None,
        };
        info!(
            job_id = %job.id,
            flow = %job.flow_name,
            build = job.build_number,
            status = %job.status,
            duration_ms = ?duration,
            steps = job.context.get(keys::JOB_STEPS).unwrap_or_default(),
            message = %job.message,
            "job finished"
        );
        Ok(())
    }
}
