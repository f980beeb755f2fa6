//! Collaborators the job engine calls around a job's lifetime.

use async_trait::async_trait;

use crate::job::Job;
use crate::Result;

/// Loads pipeline YAML for jobs whose flow lives in a repository.
#[async_trait]
pub trait YmlFetcher: Send + Sync {
    async fn fetch(&self, job: &Job) -> Result<String>;
}

/// Post-job work (notifications and similar) run once a job finishes.
#[async_trait]
pub trait LocalTaskRunner: Send + Sync {
    async fn run(&self, job: &Job) -> Result<()>;
}
