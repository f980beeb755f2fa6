//! Entry points that move jobs through the state machine.

use chrono::Utc;
use futures::future::BoxFuture;
use pipewright_config::EngineConfig;
use pipewright_core::agent::{AgentDispatcher, AgentEvent, AgentStatus, CanAcquire};
use pipewright_core::event::{EventBus, JobEvent};
use pipewright_core::job::{Job, JobStatus};
use pipewright_core::lock::DistributedLock;
use pipewright_core::plugin::PluginLookup;
use pipewright_core::queue::JobQueue;
use pipewright_core::step::{Step, StepCallback};
use pipewright_core::task::{LocalTaskRunner, YmlFetcher};
use pipewright_core::{AgentId, JobId};
use pipewright_db::{JobRepo, StepRepo, YmlRepo};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::command::CommandBuilder;
use crate::condition::ConditionEvaluator;
use crate::context::JobSmContext;
use crate::sm::StateMachine;
use crate::steps::StepService;
use crate::yml::YmlManager;
use crate::{SmError, SmResult, transitions};

/// Everything the manager talks to.
pub struct Collaborators {
    pub jobs: Arc<dyn JobRepo>,
    pub steps: Arc<dyn StepRepo>,
    pub ymls: Arc<dyn YmlRepo>,
    pub queue: Arc<dyn JobQueue>,
    pub lock: Arc<dyn DistributedLock>,
    pub agents: Arc<dyn AgentDispatcher>,
    pub events: Arc<dyn EventBus>,
    pub plugins: Arc<dyn PluginLookup>,
    pub fetcher: Arc<dyn YmlFetcher>,
    pub tasks: Arc<dyn LocalTaskRunner>,
}

pub struct JobActionManager {
    pub(crate) jobs: Arc<dyn JobRepo>,
    pub(crate) steps: StepService,
    pub(crate) ymls: YmlManager,
    pub(crate) queue: Arc<dyn JobQueue>,
    pub(crate) lock: Arc<dyn DistributedLock>,
    pub(crate) agents: Arc<dyn AgentDispatcher>,
    pub(crate) events: Arc<dyn EventBus>,
    pub(crate) fetcher: Arc<dyn YmlFetcher>,
    pub(crate) tasks: Arc<dyn LocalTaskRunner>,
    pub(crate) conditions: ConditionEvaluator,
    pub(crate) commands: CommandBuilder,
    pub(crate) config: EngineConfig,
    sm: StateMachine<JobActionManager, JobSmContext>,
}

impl JobActionManager {
    pub fn new(collab: Collaborators, config: EngineConfig) -> SmResult<Self> {
        Ok(Self {
            jobs: collab.jobs,
            steps: StepService::new(collab.steps, collab.events.clone()),
            ymls: YmlManager::new(collab.ymls, config.tree_cache_ttl),
            queue: collab.queue,
            lock: collab.lock,
            agents: collab.agents,
            events: collab.events,
            fetcher: collab.fetcher,
            tasks: collab.tasks,
            conditions: ConditionEvaluator::new(config.condition_timeout),
            commands: CommandBuilder::new(collab.plugins),
            config,
            sm: transitions::build()?,
        })
    }

    pub fn jobs(&self) -> &Arc<dyn JobRepo> {
        &self.jobs
    }

    pub fn steps(&self) -> &StepService {
        &self.steps
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Store a new PENDING job with the configured expiry and run timeout.
    pub async fn create_job(&self, mut job: Job) -> SmResult<Job> {
        job.status = JobStatus::Pending;
        job.expire = self.config.job_expire;
        job.timeout = self.config.job_timeout;
        self.jobs.save(&job).await?;
        self.events.publish(JobEvent::StatusChanged(Box::new(job.clone())));
        info!(job_id = %job.id, flow = %job.flow_name, build = job.build_number, "job created");
        Ok(job)
    }

    /// PENDING -> LOADING -> CREATED, fetching the YAML from the repository.
    pub async fn to_loading(&self, job: Job) -> SmResult<Job> {
        self.run(JobSmContext::new(job), JobStatus::Loading).await
    }

    /// Run [`Self::to_loading`] in the background.
    pub fn spawn_loading(self: &Arc<Self>, job: Job) -> JoinHandle<()> {
        let manager = self.clone();
        tokio::spawn(async move {
            let job_id = job.id;
            if let Err(e) = manager.to_loading(job).await {
                error!(job_id = %job_id, error = %e, "loading job yaml failed");
            }
        })
    }

    /// PENDING/LOADING -> CREATED with the given YAML.
    pub async fn to_created(&self, job: Job, yml: impl Into<String>) -> SmResult<Job> {
        self.run(JobSmContext::new(job).with_yml(yml), JobStatus::Created).await
    }

    /// CREATED -> QUEUED.
    pub async fn to_start(&self, job: Job) -> SmResult<Job> {
        self.run(JobSmContext::new(job), JobStatus::Queued).await
    }

    /// QUEUED -> RUNNING: acquire an agent and dispatch the first step.
    pub async fn to_run(&self, job: Job) -> SmResult<Job> {
        self.run(JobSmContext::new(job), JobStatus::Running).await
    }

    /// Advance after `step` finished.
    pub async fn to_continue(&self, job: Job, step: Step) -> SmResult<Job> {
        let target = match job.status {
            JobStatus::Cancelling => JobStatus::Cancelled,
            _ => JobStatus::Running,
        };
        self.run(JobSmContext::new(job).with_step(step), target).await
    }

    pub async fn to_cancelled(&self, job: Job, reason: impl Into<String>) -> SmResult<Job> {
        let job = self.jobs.get(job.id).await?;
        if job.is_done() {
            return Err(SmError::JobFinished(job.id));
        }

        let target = match job.status {
            JobStatus::Running if self.agent_online(job.agent_id).await => JobStatus::Cancelling,
            _ => JobStatus::Cancelled,
        };
        self.run(JobSmContext::new(job).with_reason(reason), target).await
    }

    pub async fn to_timeout(&self, job: Job) -> SmResult<Job> {
        let job = self.jobs.get(job.id).await?;
        if job.is_done() {
            return Ok(job);
        }
        self.run(JobSmContext::new(job), JobStatus::Timeout).await
    }

    /// Record a step result reported by an agent and advance the job.
    pub async fn on_step_callback(&self, callback: StepCallback) -> SmResult<Job> {
        let job = self.jobs.get(callback.job_id).await?;
        if job.is_done() {
            return Err(SmError::JobFinished(job.id));
        }

        if job.current_path.as_deref() != Some(callback.node_path.as_str()) {
            warn!(
                job_id = %job.id,
                path = %callback.node_path,
                current = ?job.current_path,
                "step callback does not match the current step, ignored"
            );
            return Ok(job);
        }

        let step = self.steps.apply_callback(&callback).await?;
        if !step.status.is_finished() {
            return Ok(job);
        }
        self.to_continue(job, step).await
    }

    pub async fn on_agent_event(&self, event: AgentEvent) -> SmResult<()> {
        match event {
            AgentEvent::StepFinished(callback) => {
                self.on_step_callback(callback).await?;
            }
            AgentEvent::StatusChanged {
                agent_id,
                status: AgentStatus::Offline,
            } => {
                self.on_agent_offline(agent_id).await?;
            }
            AgentEvent::StatusChanged { agent_id, status } => {
                debug!(agent_id = %agent_id, status = %status, "agent status changed");
            }
            AgentEvent::CmdSent {
                agent_id,
                job_id,
                node_path,
            } => {
                debug!(agent_id = %agent_id, job_id = %job_id, path = %node_path, "command sent");
            }
        }
        Ok(())
    }

    async fn on_agent_offline(&self, agent_id: AgentId) -> SmResult<()> {
        for job in self.jobs.list_by_agent(agent_id).await? {
            let job_id = job.id;
            let result = match job.status {
                JobStatus::Running => {
                    let ctx = JobSmContext::new(job).with_error("Agent went offline");
                    self.run(ctx, JobStatus::Failure).await
                }
                JobStatus::Cancelling => {
                    let ctx = JobSmContext::new(job).with_reason("Agent went offline");
                    self.run(ctx, JobStatus::Cancelled).await
                }
                _ => continue,
            };
            if let Err(e) = result {
                warn!(job_id = %job_id, agent_id = %agent_id, error = %e, "unable to settle job of offline agent");
            }
        }
        Ok(())
    }

    async fn run(&self, mut ctx: JobSmContext, to: JobStatus) -> SmResult<Job> {
        let from = ctx.job.status;
        let settled = self.sm.execute(self, from, to, &mut ctx).await?;
        debug!(job_id = %ctx.job.id, settled = %settled, status = %ctx.job.status, "transition chain settled");
        Ok(ctx.job)
    }

    async fn agent_online(&self, agent_id: Option<AgentId>) -> bool {
        let Some(agent_id) = agent_id else {
            return false;
        };
        match self.agents.get(agent_id).await {
            Ok(agent) => agent.is_online(),
            Err(e) => {
                debug!(agent_id = %agent_id, error = %e, "agent lookup failed");
                false
            }
        }
    }

    /// Set `status` when it is ahead of the current one, then persist and
    /// publish. A status that is not ahead only refreshes the stored job.
    /// A job that is already finished in the store is never overwritten by
    /// a copy in another status.
    pub(crate) async fn set_status_and_save(
        &self,
        job: &mut Job,
        status: JobStatus,
        message: Option<String>,
    ) -> SmResult<()> {
        let stored = self.jobs.get(job.id).await?;
        if stored.is_done() && stored.status != job.status {
            warn!(job_id = %job.id, stored = %stored.status, status = %job.status, "job already finished, not saving");
            return Err(SmError::JobFinished(job.id));
        }

        if status.order() > job.status.order() {
            let from = job.status;
            job.status = status;
            job.set_status_to_context(status);
            if let Some(message) = message {
                job.message = message;
            }
            info!(job_id = %job.id, from = %from, to = %status, "job status changed");
        }

        job.updated_at = Utc::now();
        self.jobs.save(job).await?;
        self.events.publish(JobEvent::StatusChanged(Box::new(job.clone())));
        Ok(())
    }

    /// Take the job lock unless this run already holds it, then reload the
    /// job so the transition works on the stored state.
    pub(crate) async fn lock_and_reload(&self, ctx: &mut JobSmContext) -> SmResult<()> {
        if ctx.lock.is_some() {
            return Ok(());
        }

        let path = ctx.job.lock_path();
        let handle = self
            .lock
            .lock(&path, self.config.lock_timeout)
            .await?
            .ok_or(SmError::LockUnavailable(ctx.job.id))?;
        debug!(job_id = %ctx.job.id, path = %path, "job locked");
        ctx.lock = Some(handle);

        ctx.job = self.jobs.get(ctx.job.id).await?;
        Ok(())
    }

    /// Runs once a chain settles at a terminal status.
    pub(crate) async fn finish(&self, ctx: &mut JobSmContext) -> SmResult<()> {
        if ctx.job.is_done() {
            debug!(job_id = %ctx.job.id, status = %ctx.job.status, "job already finished");
            return Ok(());
        }

        let status = ctx.to;
        if let Some(error) = ctx.error.as_deref() {
            ctx.job.set_error_to_context(Some(error));
        }
        ctx.job.finished_at = Some(Utc::now());
        let message = Some(ctx.message()).filter(|m| !m.is_empty());
        self.set_status_and_save(&mut ctx.job, status, message).await?;

        match self.ymls.get_tree(&ctx.job).await {
            Ok(tree) => self.steps.settle_groups(ctx.job.id, &tree).await?,
            Err(e) => debug!(job_id = %ctx.job.id, error = %e, "no tree to settle steps against"),
        }
        self.steps.skip_unfinished(ctx.job.id).await?;

        if let Some(agent_id) = ctx.job.agent_id {
            if let Err(e) = self.agents.try_release(agent_id).await {
                warn!(job_id = %ctx.job.id, agent_id = %agent_id, error = %e, "unable to release agent");
            }
        }

        let tasks = self.tasks.clone();
        let job = ctx.job.clone();
        tokio::spawn(async move {
            if let Err(e) = tasks.run(&job).await {
                warn!(job_id = %job.id, error = %e, "local task failed");
            }
        });
        Ok(())
    }

    /// Whether an agent should still be acquired for the job.
    pub(crate) fn can_acquire(&self, job_id: JobId) -> CanAcquire {
        let jobs = self.jobs.clone();
        Arc::new(move || -> BoxFuture<'static, bool> {
            let jobs = jobs.clone();
            Box::pin(async move {
                match jobs.get(job_id).await {
                    Ok(job) => !job.is_expired(Utc::now()) && !job.is_cancelling() && !job.is_done(),
                    Err(_) => false,
                }
            })
        })
    }
}
