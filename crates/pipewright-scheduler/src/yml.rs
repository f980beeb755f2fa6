//! Job YAML snapshots and their parsed trees.

use pipewright_config::{NodeTree, TreeCache};
use pipewright_core::job::{Job, JobYml};
use pipewright_db::YmlRepo;
use std::sync::Arc;
use std::time::Duration;

use crate::SmResult;

pub struct YmlManager {
    repo: Arc<dyn YmlRepo>,
    cache: TreeCache,
}

impl YmlManager {
    pub fn new(repo: Arc<dyn YmlRepo>, ttl: Duration) -> Self {
        Self {
            repo,
            cache: TreeCache::new(ttl),
        }
    }

    /// Parse `yml` and pin it to `job`. Nothing is stored if it does not parse.
    pub async fn create(&self, job: &Job, yml: &str) -> SmResult<Arc<NodeTree>> {
        let tree = self.cache.get_or_parse(&job.flow_name, yml)?;
        self.repo.create(&JobYml::new(job.id, yml)).await?;
        Ok(tree)
    }

    /// The tree of the YAML pinned to `job`.
    pub async fn get_tree(&self, job: &Job) -> SmResult<Arc<NodeTree>> {
        let yml = self.repo.get(job.id).await?;
        Ok(self.cache.get_or_parse(&job.flow_name, &yml.raw)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::SmError;
    use pipewright_config::ConfigError;
    use pipewright_core::FlowId;
    use pipewright_core::job::Trigger;
    use pipewright_db::{DbError, MemYmlRepo};

    fn manager() -> YmlManager {
        YmlManager::new(Arc::new(MemYmlRepo::new()), Duration::from_secs(60))
    }

    #[tokio::test]
    async fn test_create_then_get_tree() {
        let ymls = manager();
        let job = Job::new(FlowId::new(), "demo", 1, Trigger::Manual);

        let created = ymls.create(&job, "steps:\n  - bash: echo hi\n").await.unwrap();
        let loaded = ymls.get_tree(&job).await.unwrap();
        assert!(Arc::ptr_eq(&created, &loaded));
        assert_eq!(loaded.get("demo/step-1").unwrap().attrs.bash.as_deref(), Some("echo hi"));
    }

    #[tokio::test]
    async fn test_invalid_yaml_is_not_stored() {
        let ymls = manager();
        let job = Job::new(FlowId::new(), "demo", 1, Trigger::Manual);

        let result = ymls.create(&job, "steps: []\n").await;
        assert!(matches!(result, Err(SmError::Config(ConfigError::MissingField(_)))));

        let missing = ymls.get_tree(&job).await;
        assert!(matches!(missing, Err(SmError::Db(DbError::NotFound(_)))));
    }
}
