//! Job YAML snapshot repository.

use async_trait::async_trait;
use pipewright_core::JobId;
use pipewright_core::job::JobYml;
use std::collections::HashMap;
use tokio::sync::RwLock;

use crate::{DbError, DbResult};

#[async_trait]
pub trait YmlRepo: Send + Sync {
    /// Store the snapshot; a job's YAML cannot be replaced once stored.
    async fn create(&self, yml: &JobYml) -> DbResult<()>;
    async fn get(&self, job_id: JobId) -> DbResult<JobYml>;
}

/// In-memory snapshot store.
#[derive(Default)]
pub struct MemYmlRepo {
    ymls: RwLock<HashMap<JobId, JobYml>>,
}

impl MemYmlRepo {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl YmlRepo for MemYmlRepo {
    async fn create(&self, yml: &JobYml) -> DbResult<()> {
        let mut ymls = self.ymls.write().await;
        if ymls.contains_key(&yml.job_id) {
            return Err(DbError::Duplicate(format!("yaml of job {}", yml.job_id)));
        }
        ymls.insert(yml.job_id, yml.clone());
        Ok(())
    }

    async fn get(&self, job_id: JobId) -> DbResult<JobYml> {
        self.ymls
            .read()
            .await
            .get(&job_id)
            .cloned()
            .ok_or_else(|| DbError::NotFound(format!("yaml of job {job_id}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_snapshot_is_immutable() {
        let repo = MemYmlRepo::new();
        let job_id = JobId::new();
        repo.create(&JobYml::new(job_id, "steps: []")).await.unwrap();

        let again = repo.create(&JobYml::new(job_id, "steps: [changed]")).await;
        assert!(matches!(again, Err(DbError::Duplicate(_))));
        assert_eq!(repo.get(job_id).await.unwrap().raw, "steps: []");
    }
}
