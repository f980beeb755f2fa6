//! Walking the node tree: recording step results and dispatching the next
//! runnable step.

use pipewright_config::{Node, NodeTree};
use pipewright_core::Error;
use pipewright_core::agent::Cmd;
use pipewright_core::job::{Job, JobStatus};
use pipewright_core::step::{MESSAGE_SKIPPED_ON_CONDITION, Step, StepStatus};
use pipewright_core::vars::keys;
use tracing::{debug, info, warn};

use crate::context::JobSmContext;
use crate::manager::JobActionManager;
use crate::sm::Next;
use crate::SmResult;

impl JobActionManager {
    /// Record the finished step in `ctx` and dispatch what comes after it.
    pub(crate) async fn continue_from_step(&self, ctx: &mut JobSmContext) -> SmResult<Next> {
        let Some(step) = ctx.step.clone() else {
            return Ok(Next::Done);
        };

        if ctx.job.current_path.as_deref() != Some(step.node_path.as_str()) {
            warn!(
                job_id = %ctx.job.id,
                path = %step.node_path,
                current = ?ctx.job.current_path,
                "stale step result, job has moved on"
            );
            return Ok(Next::Done);
        }

        let tree = self.ymls.get_tree(&ctx.job).await?;
        let node = tree.get(&step.node_path)?;

        self.record_step(ctx, &tree, &step).await?;
        self.set_status_and_save(&mut ctx.job, JobStatus::Running, None).await?;

        let counted_failure = !node.is_final() && !step.is_success();
        let next = if counted_failure || (node.is_final() && upstream_failed(&ctx.job)) {
            tree.next_final(&step.node_path)?
        } else {
            tree.next(&step.node_path)?
        };

        if self.execute_node(ctx, &tree, next).await? {
            return Ok(Next::Done);
        }
        Ok(Next::To(self.finish_status(ctx)))
    }

    /// Copy a step result into the job: timestamps, outputs and, unless the
    /// step is final, the job status and error it implies.
    pub(crate) async fn record_step(
        &self,
        ctx: &mut JobSmContext,
        tree: &NodeTree,
        step: &Step,
    ) -> SmResult<()> {
        let job = &mut ctx.job;

        if tree.is_first(&step.node_path) && step.start_at.is_some() {
            job.started_at = step.start_at;
        }
        if step.finish_at.is_some() {
            job.finished_at = step.finish_at;
        }

        job.context.merge(&step.output, true);
        if let Some(start) = job.started_at {
            job.context.put(keys::JOB_START_AT, start.to_rfc3339());
        }
        if let Some(finish) = job.finished_at {
            job.context.put(keys::JOB_FINISH_AT, finish.to_rfc3339());
        }
        let summary = self.steps.summary(job.id, tree, &step.node_path).await?;
        job.context.put(keys::JOB_STEPS, summary);

        if !step.is_final {
            let status = step.job_status();
            job.set_status_to_context(status);
            let error = step.error.as_deref().filter(|_| status != JobStatus::Success);
            job.set_error_to_context(error);
        }
        Ok(())
    }

    /// Dispatch the first runnable node starting at `start`. Nodes whose
    /// condition is false are skipped together with their subtree, and group
    /// nodes are entered rather than run. Once a counted step has failed,
    /// only final nodes are considered after a skip. Returns whether a step
    /// was sent to the agent.
    pub(crate) async fn execute_node<'t>(
        &self,
        ctx: &mut JobSmContext,
        tree: &'t NodeTree,
        start: Option<&'t Node>,
    ) -> SmResult<bool> {
        let mut cursor = start;

        while let Some(node) = cursor {
            let path = node.path_str();
            ctx.job.current_path = Some(path.clone());
            self.set_status_and_save(&mut ctx.job, JobStatus::Running, None).await?;

            let cmd = self.commands.build(&ctx.job, tree, node).await?;
            let should_run = self
                .conditions
                .run(node.attrs.condition.as_deref(), &cmd.inputs)
                .await?;

            if !should_run {
                info!(job_id = %ctx.job.id, path = %path, "step skipped on condition");
                let skipped = self
                    .steps
                    .skip_with_descendants(ctx.job.id, tree, node, MESSAGE_SKIPPED_ON_CONDITION)
                    .await?;
                if let Some(step) = skipped.first() {
                    self.record_step(ctx, tree, step).await?;
                    self.set_status_and_save(&mut ctx.job, JobStatus::Running, None).await?;
                }

                let after = if node.has_children() {
                    tree.next_root_step(&path)?
                } else {
                    tree.next(&path)?
                };
                cursor = match after {
                    Some(next) if !next.is_final() && upstream_failed(&ctx.job) => {
                        tree.next_final(&next.path_str())?
                    }
                    other => other,
                };
                continue;
            }

            if node.has_children() {
                cursor = tree.next(&path)?;
                continue;
            }

            let agent_id = ctx
                .job
                .agent_id
                .ok_or_else(|| Error::NotAvailable(format!("no agent assigned to job {}", ctx.job.id)))?;
            let agent = self.agents.get(agent_id).await?;
            if !agent.is_online() {
                return Err(Error::NotAvailable(format!("agent {} is offline", agent.name)).into());
            }

            let mut step = self.steps.get(ctx.job.id, &path).await?;
            step.agent_id = Some(agent_id);
            self.steps.to_status(&mut step, StepStatus::Running, None).await?;

            self.agents.dispatch(Cmd::Shell(cmd), &agent).await?;
            info!(job_id = %ctx.job.id, path = %path, agent = %agent.name, "step dispatched");
            return Ok(true);
        }

        debug!(job_id = %ctx.job.id, "no more steps to dispatch");
        Ok(false)
    }

    /// Terminal status once nothing is left to dispatch, taken from the last
    /// counted step.
    pub(crate) fn finish_status(&self, ctx: &mut JobSmContext) -> JobStatus {
        let status = match ctx.job.status_from_context() {
            Some(status) if status.is_terminal() => status,
            _ => JobStatus::Success,
        };
        if status != JobStatus::Success {
            if let Some(error) = ctx.job.error_from_context() {
                ctx.error = Some(error.to_string());
            }
        }
        status
    }
}

/// Whether a counted step has already failed the job.
fn upstream_failed(job: &Job) -> bool {
    !matches!(
        job.status_from_context(),
        None | Some(JobStatus::Running) | Some(JobStatus::Success)
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::fixture;
    use pipewright_config::EngineConfig;
    use pipewright_core::FlowId;
    use pipewright_core::job::Trigger;

    const YAML: &str = r#"
steps:
  - name: lint
    condition: $RUN_LINT == "true"
    bash: cargo clippy
  - name: checks
    condition: "false"
    steps:
      - name: fmt
        bash: cargo fmt --check
  - name: build
    bash: cargo build
"#;

    #[tokio::test]
    async fn test_skip_cascade_reaches_first_runnable_step() {
        let fx = fixture(EngineConfig::default());
        let manager = &fx.manager;

        let job = Job::new(FlowId::new(), "demo", 1, Trigger::Manual);
        let job = manager.create_job(job).await.unwrap();
        let job = manager.to_created(job, YAML).await.unwrap();
        let job = manager.to_start(job).await.unwrap();
        let job = manager.to_run(job).await.unwrap();

        assert_eq!(job.status, JobStatus::Running);
        assert_eq!(job.current_path.as_deref(), Some("demo/build"));

        let sent = fx.agents.sent();
        assert_eq!(sent.len(), 1);
        assert!(matches!(&sent[0], Cmd::Shell(cmd) if cmd.node_path == "demo/build"));

        let steps = manager.steps().list(job.id).await.unwrap();
        let status = |path: &str| steps.iter().find(|s| s.node_path == path).unwrap().status;
        assert_eq!(status("demo/lint"), StepStatus::Skipped);
        assert_eq!(status("demo/checks"), StepStatus::Skipped);
        assert_eq!(status("demo/checks/fmt"), StepStatus::Skipped);
        assert_eq!(status("demo/build"), StepStatus::Running);
    }

    #[tokio::test]
    async fn test_finish_status_from_context() {
        let fx = fixture(EngineConfig::default());
        let mut job = Job::new(FlowId::new(), "demo", 1, Trigger::Manual);

        let mut ctx = JobSmContext::new(job.clone());
        assert_eq!(fx.manager.finish_status(&mut ctx), JobStatus::Success);

        job.set_status_to_context(JobStatus::Failure);
        job.set_error_to_context(Some("exit code 2"));
        let mut ctx = JobSmContext::new(job);
        assert_eq!(fx.manager.finish_status(&mut ctx), JobStatus::Failure);
        assert_eq!(ctx.error.as_deref(), Some("exit code 2"));
    }
}
