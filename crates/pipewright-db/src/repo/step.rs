//! Step repository.

use async_trait::async_trait;
use pipewright_core::JobId;
use pipewright_core::step::Step;
use std::collections::HashMap;
use tokio::sync::RwLock;

use crate::{DbError, DbResult};

#[async_trait]
pub trait StepRepo: Send + Sync {
    /// Replace all steps of the job with `steps`, keeping their order.
    async fn save_all(&self, job_id: JobId, steps: &[Step]) -> DbResult<()>;
    async fn save(&self, step: &Step) -> DbResult<()>;
    async fn get(&self, job_id: JobId, node_path: &str) -> DbResult<Step>;
    /// Steps of a job in tree order.
    async fn list(&self, job_id: JobId) -> DbResult<Vec<Step>>;
    async fn delete_by_job(&self, job_id: JobId) -> DbResult<()>;
}

/// In-memory step store.
#[derive(Default)]
pub struct MemStepRepo {
    steps: RwLock<HashMap<JobId, Vec<Step>>>,
}

impl MemStepRepo {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StepRepo for MemStepRepo {
    async fn save_all(&self, job_id: JobId, steps: &[Step]) -> DbResult<()> {
        self.steps.write().await.insert(job_id, steps.to_vec());
        Ok(())
    }

    async fn save(&self, step: &Step) -> DbResult<()> {
        let mut all = self.steps.write().await;
        let steps = all.entry(step.job_id).or_default();
        match steps.iter_mut().find(|s| s.node_path == step.node_path) {
            Some(existing) => *existing = step.clone(),
            None => steps.push(step.clone()),
        }
        Ok(())
    }

    async fn get(&self, job_id: JobId, node_path: &str) -> DbResult<Step> {
        self.steps
            .read()
            .await
            .get(&job_id)
            .and_then(|steps| steps.iter().find(|s| s.node_path == node_path))
            .cloned()
            .ok_or_else(|| DbError::NotFound(format!("step {job_id}:{node_path}")))
    }

    async fn list(&self, job_id: JobId) -> DbResult<Vec<Step>> {
        Ok(self
            .steps
            .read()
            .await
            .get(&job_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn delete_by_job(&self, job_id: JobId) -> DbResult<()> {
        self.steps.write().await.remove(&job_id);
        Ok(())
    }
}
