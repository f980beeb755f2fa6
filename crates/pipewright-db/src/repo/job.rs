//! Job repository.

use async_trait::async_trait;
use pipewright_core::job::{Job, JobStatus};
use pipewright_core::{AgentId, JobId};
use std::collections::HashMap;
use tokio::sync::RwLock;

use crate::{DbError, DbResult};

#[async_trait]
pub trait JobRepo: Send + Sync {
    /// Insert or replace the job document.
    async fn save(&self, job: &Job) -> DbResult<()>;
    async fn get(&self, id: JobId) -> DbResult<Job>;
    async fn find(&self, id: JobId) -> DbResult<Option<Job>>;
    async fn list_by_status(&self, statuses: &[JobStatus]) -> DbResult<Vec<Job>>;
    async fn list_by_agent(&self, agent_id: AgentId) -> DbResult<Vec<Job>>;
    async fn delete(&self, id: JobId) -> DbResult<()>;
}

/// In-memory job store.
#[derive(Default)]
pub struct MemJobRepo {
    jobs: RwLock<HashMap<JobId, Job>>,
}

impl MemJobRepo {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl JobRepo for MemJobRepo {
    async fn save(&self, job: &Job) -> DbResult<()> {
        self.jobs.write().await.insert(job.id, job.clone());
        Ok(())
    }

    async fn get(&self, id: JobId) -> DbResult<Job> {
        self.find(id)
            .await?
            .ok_or_else(|| DbError::NotFound(format!("job {id}")))
    }

    async fn find(&self, id: JobId) -> DbResult<Option<Job>> {
        Ok(self.jobs.read().await.get(&id).cloned())
    }

    async fn list_by_status(&self, statuses: &[JobStatus]) -> DbResult<Vec<Job>> {
        let mut jobs: Vec<Job> = self
            .jobs
            .read()
            .await
            .values()
            .filter(|j| statuses.contains(&j.status))
            .cloned()
            .collect();
        jobs.sort_by_key(|j| j.created_at);
        Ok(jobs)
    }

    async fn list_by_agent(&self, agent_id: AgentId) -> DbResult<Vec<Job>> {
        Ok(self
            .jobs
            .read()
            .await
            .values()
            .filter(|j| j.agent_id == Some(agent_id))
            .cloned()
            .collect())
    }

    async fn delete(&self, id: JobId) -> DbResult<()> {
        self.jobs
            .write()
            .await
            .remove(&id)
            .map(|_| ())
            .ok_or_else(|| DbError::NotFound(format!("job {id}")))
    }
}
