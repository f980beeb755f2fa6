//! Step records of a job: creation, monotonic updates and summaries.

use chrono::Utc;
use pipewright_config::{Node, NodeTree};
use pipewright_core::JobId;
use pipewright_core::event::{EventBus, JobEvent};
use pipewright_core::job::Job;
use pipewright_core::step::{Step, StepCallback, StepStatus};
use pipewright_db::StepRepo;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::SmResult;

pub struct StepService {
    repo: Arc<dyn StepRepo>,
    events: Arc<dyn EventBus>,
}

impl StepService {
    pub fn new(repo: Arc<dyn StepRepo>, events: Arc<dyn EventBus>) -> Self {
        Self { repo, events }
    }

    /// Create one PENDING step per tree node, replacing any previous set.
    pub async fn init(&self, job: &Job, tree: &NodeTree) -> SmResult<Vec<Step>> {
        let steps: Vec<Step> = tree
            .steps()
            .iter()
            .map(|node| {
                Step::new(
                    job,
                    node.path_str(),
                    node.attrs.allow_failure.unwrap_or(false),
                    node.is_final(),
                )
            })
            .collect();

        self.repo.save_all(job.id, &steps).await?;
        self.events.publish(JobEvent::StepsInitialized {
            job_id: job.id,
            steps: steps.clone(),
        });
        debug!(job_id = %job.id, count = steps.len(), "steps initialized");
        Ok(steps)
    }

    pub async fn get(&self, job_id: JobId, path: &str) -> SmResult<Step> {
        Ok(self.repo.get(job_id, path).await?)
    }

    pub async fn list(&self, job_id: JobId) -> SmResult<Vec<Step>> {
        Ok(self.repo.list(job_id).await?)
    }

    /// Move `step` to `status` unless a status of higher severity is already
    /// recorded. Returns whether the step changed.
    pub async fn to_status(
        &self,
        step: &mut Step,
        status: StepStatus,
        error: Option<&str>,
    ) -> SmResult<bool> {
        if !step.can_move_to(status) {
            debug!(
                job_id = %step.job_id,
                path = %step.node_path,
                from = %step.status,
                to = %status,
                "ignoring step status downgrade"
            );
            return Ok(false);
        }

        let now = Utc::now();
        step.status = status;
        if status != StepStatus::Pending && step.start_at.is_none() {
            step.start_at = Some(now);
        }
        if status.is_finished() && step.finish_at.is_none() {
            step.finish_at = Some(now);
        }
        if let Some(error) = error {
            step.error = Some(error.to_string());
        }

        self.save(step).await?;
        Ok(true)
    }

    /// Apply a result reported by an agent. Lower severity results than the
    /// recorded one are ignored and the stored step is returned as is.
    pub async fn apply_callback(&self, callback: &StepCallback) -> SmResult<Step> {
        let mut step = self.get(callback.job_id, &callback.node_path).await?;
        if !step.can_move_to(callback.status) {
            warn!(
                job_id = %step.job_id,
                path = %step.node_path,
                recorded = %step.status,
                reported = %callback.status,
                "step result ignored, a more severe status is recorded"
            );
            return Ok(step);
        }

        step.status = callback.status;
        step.code = callback.code.or(step.code);
        step.output.merge(&callback.output, true);
        if callback.error.is_some() {
            step.error = callback.error.clone();
        }
        step.start_at = callback.start_at.or(step.start_at);
        step.finish_at = callback.finish_at.or(step.finish_at);
        if step.status.is_finished() && step.finish_at.is_none() {
            step.finish_at = Some(Utc::now());
        }

        self.save(&step).await?;
        Ok(step)
    }

    /// Mark `node` and everything below it SKIPPED.
    pub async fn skip_with_descendants(
        &self,
        job_id: JobId,
        tree: &NodeTree,
        node: &Node,
        message: &str,
    ) -> SmResult<Vec<Step>> {
        let mut skipped = Vec::new();
        let nodes = std::iter::once(node).chain(tree.descendants(node));
        for n in nodes {
            let mut step = self.get(job_id, &n.path_str()).await?;
            if self.to_status(&mut step, StepStatus::Skipped, Some(message)).await? {
                skipped.push(step);
            }
        }
        Ok(skipped)
    }

    /// Mark every step that never finished SKIPPED.
    pub async fn skip_unfinished(&self, job_id: JobId) -> SmResult<()> {
        for mut step in self.list(job_id).await? {
            if step.status.is_finished() {
                continue;
            }
            step.status = StepStatus::Skipped;
            step.finish_at = Some(Utc::now());
            self.save(&step).await?;
        }
        Ok(())
    }

    /// Derive the status of group steps from their children. Groups are never
    /// dispatched, so this runs once the job settles.
    pub async fn settle_groups(&self, job_id: JobId, tree: &NodeTree) -> SmResult<()> {
        let mut by_path: HashMap<String, Step> = self
            .list(job_id)
            .await?
            .into_iter()
            .map(|s| (s.node_path.clone(), s))
            .collect();

        // innermost groups first so outer groups see settled children
        for node in tree.steps().iter().rev().filter(|n| n.has_children()) {
            let children: Vec<&Step> = tree
                .children(node)
                .filter_map(|child| by_path.get(&child.path_str()))
                .collect();
            if children.is_empty() {
                continue;
            }

            let status = group_status(&children);
            let start_at = children.iter().filter_map(|s| s.start_at).min();
            let finish_at = children.iter().filter_map(|s| s.finish_at).max();

            let Some(group) = by_path.get_mut(&node.path_str()) else {
                continue;
            };
            if group.status.is_finished() && group.status.level() >= status.level() {
                continue;
            }
            group.status = status;
            group.start_at = start_at;
            group.finish_at = finish_at.or(Some(Utc::now()));

            let group = group.clone();
            self.save(&group).await?;
        }

        Ok(())
    }

    /// `name=STATUS;...` over the leaf steps up to and including `path`.
    pub async fn summary(&self, job_id: JobId, tree: &NodeTree, path: &str) -> SmResult<String> {
        let steps = self.list(job_id).await?;
        let mut parts = Vec::new();

        for step in &steps {
            let is_leaf = tree.get(&step.node_path).is_ok_and(|n| !n.has_children());
            if is_leaf {
                let name = step.node_path.rsplit('/').next().unwrap_or_default();
                parts.push(format!("{name}={}", step.status));
            }
            if step.node_path == path {
                break;
            }
        }

        Ok(parts.join(";"))
    }

    async fn save(&self, step: &Step) -> SmResult<()> {
        self.repo.save(step).await?;
        self.events.publish(JobEvent::StepStatusChanged(Box::new(step.clone())));
        Ok(())
    }
}

/// A group fails with its most severe counted failure, is skipped when all
/// children were skipped and succeeds otherwise.
fn group_status(children: &[&Step]) -> StepStatus {
    let failure = children
        .iter()
        .filter(|s| s.status.is_failure() && !s.allow_failure)
        .map(|s| s.status)
        .max_by_key(|s| s.level());
    if let Some(status) = failure {
        return status;
    }
    if children.iter().all(|s| s.status == StepStatus::Skipped) {
        return StepStatus::Skipped;
    }
    if children.iter().any(|s| !s.status.is_finished()) {
        return StepStatus::Skipped;
    }
    StepStatus::Success
}

#[cfg(test)]
mod tests {
    use super::*;
    use pipewright_core::FlowId;
    use pipewright_core::event::BroadcastEventBus;
    use pipewright_core::job::Trigger;
    use pipewright_db::MemStepRepo;

    const YAML: &str = r#"
steps:
  - name: checkout
    bash: git status
  - name: build
    steps:
      - name: compile
        bash: make
      - name: package
        bash: make dist
"#;

    async fn setup() -> (StepService, Job, NodeTree) {
        let service = StepService::new(Arc::new(MemStepRepo::new()), Arc::new(BroadcastEventBus::default()));
        let job = Job::new(FlowId::new(), "demo", 1, Trigger::Manual);
        let tree = NodeTree::from_yaml("demo", YAML).unwrap();
        service.init(&job, &tree).await.unwrap();
        (service, job, tree)
    }

    #[tokio::test]
    async fn test_init_creates_step_per_node() {
        let (service, job, _) = setup().await;
        let steps = service.list(job.id).await.unwrap();
        let paths: Vec<_> = steps.iter().map(|s| s.node_path.as_str()).collect();
        assert_eq!(
            paths,
            vec!["demo/checkout", "demo/build", "demo/build/compile", "demo/build/package"]
        );
        assert!(steps.iter().all(|s| s.status == StepStatus::Pending));
    }

    #[tokio::test]
    async fn test_to_status_is_monotonic() {
        let (service, job, _) = setup().await;
        let mut step = service.get(job.id, "demo/checkout").await.unwrap();

        assert!(service.to_status(&mut step, StepStatus::Exception, Some("boom")).await.unwrap());
        assert!(!service.to_status(&mut step, StepStatus::Success, None).await.unwrap());

        let stored = service.get(job.id, "demo/checkout").await.unwrap();
        assert_eq!(stored.status, StepStatus::Exception);
        assert_eq!(stored.error.as_deref(), Some("boom"));
        assert!(stored.finish_at.is_some());
    }

    #[tokio::test]
    async fn test_apply_callback_merges_output() {
        let (service, job, _) = setup().await;
        let mut callback = StepCallback::new(job.id, "demo/checkout", StepStatus::Success);
        callback.output.put("SHA", "abc123");
        callback.code = Some(0);

        let step = service.apply_callback(&callback).await.unwrap();
        assert_eq!(step.status, StepStatus::Success);
        assert_eq!(step.output.get("SHA"), Some("abc123"));

        let late = StepCallback::new(job.id, "demo/checkout", StepStatus::Running);
        let step = service.apply_callback(&late).await.unwrap();
        assert_eq!(step.status, StepStatus::Success);
    }

    #[tokio::test]
    async fn test_skip_group_and_settle() {
        let (service, job, tree) = setup().await;
        let build = tree.get("demo/build").unwrap();

        let skipped = service
            .skip_with_descendants(job.id, &tree, build, "Skipped due to condition")
            .await
            .unwrap();
        assert_eq!(skipped.len(), 3);

        let mut checkout = service.get(job.id, "demo/checkout").await.unwrap();
        service.to_status(&mut checkout, StepStatus::Success, None).await.unwrap();

        service.settle_groups(job.id, &tree).await.unwrap();
        let group = service.get(job.id, "demo/build").await.unwrap();
        assert_eq!(group.status, StepStatus::Skipped);
    }

    #[tokio::test]
    async fn test_group_fails_with_child() {
        let (service, job, tree) = setup().await;
        let mut compile = service.get(job.id, "demo/build/compile").await.unwrap();
        service.to_status(&mut compile, StepStatus::Exception, None).await.unwrap();

        service.settle_groups(job.id, &tree).await.unwrap();
        service.skip_unfinished(job.id).await.unwrap();

        let group = service.get(job.id, "demo/build").await.unwrap();
        assert_eq!(group.status, StepStatus::Exception);
        let package = service.get(job.id, "demo/build/package").await.unwrap();
        assert_eq!(package.status, StepStatus::Skipped);
    }

    #[tokio::test]
    async fn test_summary_up_to_path() {
        let (service, job, tree) = setup().await;
        let mut checkout = service.get(job.id, "demo/checkout").await.unwrap();
        service.to_status(&mut checkout, StepStatus::Success, None).await.unwrap();

        let summary = service.summary(job.id, &tree, "demo/build/compile").await.unwrap();
        assert_eq!(summary, "checkout=SUCCESS;compile=PENDING");
    }
}
