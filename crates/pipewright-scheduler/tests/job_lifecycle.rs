//! End-to-end job lifecycles against in-memory collaborators.

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use pipewright_config::EngineConfig;
use pipewright_core::agent::{Agent, AgentDispatcher, AgentEvent, AgentStatus, CanAcquire, Cmd};
use pipewright_core::event::BroadcastEventBus;
use pipewright_core::job::{Job, JobStatus, Trigger};
use pipewright_core::lock::DistributedLock;
use pipewright_core::plugin::{Plugin, PluginLookup};
use pipewright_core::step::{StepCallback, StepStatus};
use pipewright_core::task::{LocalTaskRunner, YmlFetcher};
use pipewright_core::vars::keys;
use pipewright_core::{AgentId, Error, FlowId, Result};
use pipewright_db::{JobRepo, MemJobRepo, MemStepRepo, MemYmlRepo};
use pipewright_scheduler::{
    Collaborators, InMemoryJobQueue, InMemoryLock, JobActionManager, SmError, SmResult, TimeoutSweeper,
};
use std::sync::{Arc, Mutex};
use std::time::Duration;

struct FakeAgents {
    agent: Mutex<Agent>,
    sent: Mutex<Vec<Cmd>>,
}

impl FakeAgents {
    fn new() -> Self {
        Self {
            agent: Mutex::new(Agent::new("fake-1")),
            sent: Mutex::new(Vec::new()),
        }
    }

    fn go_offline(&self) -> AgentId {
        let mut agent = self.agent.lock().unwrap();
        agent.status = AgentStatus::Offline;
        agent.id
    }

    fn shell_paths(&self) -> Vec<String> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .filter_map(|cmd| match cmd {
                Cmd::Shell(shell) => Some(shell.node_path.clone()),
                Cmd::Kill { .. } => None,
            })
            .collect()
    }

    fn kills(&self) -> usize {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .filter(|cmd| matches!(cmd, Cmd::Kill { .. }))
            .count()
    }
}

#[async_trait]
impl AgentDispatcher for FakeAgents {
    async fn acquire(&self, _: &Job, _: CanAcquire) -> Result<Option<Agent>> {
        let mut agent = self.agent.lock().unwrap();
        agent.status = AgentStatus::Busy;
        Ok(Some(agent.clone()))
    }

    async fn dispatch(&self, cmd: Cmd, agent: &Agent) -> Result<()> {
        if !agent.is_online() {
            return Err(Error::NotAvailable(format!("agent {} is offline", agent.name)));
        }
        self.sent.lock().unwrap().push(cmd);
        Ok(())
    }

    async fn try_release(&self, _: AgentId) -> Result<()> {
        let mut agent = self.agent.lock().unwrap();
        if agent.is_online() {
            agent.status = AgentStatus::Idle;
        }
        Ok(())
    }

    async fn get(&self, _: AgentId) -> Result<Agent> {
        Ok(self.agent.lock().unwrap().clone())
    }
}

struct StaticFetcher(Option<&'static str>);

#[async_trait]
impl YmlFetcher for StaticFetcher {
    async fn fetch(&self, _: &Job) -> Result<String> {
        self.0
            .map(str::to_string)
            .ok_or_else(|| Error::NotAvailable("repository unreachable".to_string()))
    }
}

struct NoPlugins;

#[async_trait]
impl PluginLookup for NoPlugins {
    async fn get(&self, name: &str) -> Result<Plugin> {
        Err(Error::NotFound(format!("plugin {name}")))
    }
}

struct NoTasks;

#[async_trait]
impl LocalTaskRunner for NoTasks {
    async fn run(&self, _: &Job) -> Result<()> {
        Ok(())
    }
}

struct Harness {
    manager: Arc<JobActionManager>,
    agents: Arc<FakeAgents>,
    lock: Arc<InMemoryLock>,
    jobs: Arc<MemJobRepo>,
}

fn harness_with(config: EngineConfig, fetched: Option<&'static str>) -> Harness {
    let agents = Arc::new(FakeAgents::new());
    let lock = Arc::new(InMemoryLock::new());
    let jobs = Arc::new(MemJobRepo::new());
    let collab = Collaborators {
        jobs: jobs.clone(),
        steps: Arc::new(MemStepRepo::new()),
        ymls: Arc::new(MemYmlRepo::new()),
        queue: Arc::new(InMemoryJobQueue::new()),
        lock: lock.clone(),
        agents: agents.clone(),
        events: Arc::new(BroadcastEventBus::default()),
        plugins: Arc::new(NoPlugins),
        fetcher: Arc::new(StaticFetcher(fetched)),
        tasks: Arc::new(NoTasks),
    };
    Harness {
        manager: Arc::new(JobActionManager::new(collab, config).unwrap()),
        agents,
        lock,
        jobs,
    }
}

fn harness() -> Harness {
    harness_with(EngineConfig::default(), None)
}

impl Harness {
    async fn started(&self, yml: &str) -> Job {
        let job = Job::new(FlowId::new(), "demo", 1, Trigger::Manual);
        let job = self.manager.create_job(job).await.unwrap();
        let job = self.manager.to_created(job, yml).await.unwrap();
        let job = self.manager.to_start(job).await.unwrap();
        self.manager.to_run(job).await.unwrap()
    }

    async fn report(&self, job: &Job, path: &str, status: StepStatus) -> SmResult<Job> {
        self.manager
            .on_step_callback(StepCallback::new(job.id, path, status))
            .await
    }

    async fn step_status(&self, job: &Job, path: &str) -> StepStatus {
        self.manager.steps().get(job.id, path).await.unwrap().status
    }
}

const TWO_STEPS: &str = r#"
envs:
  GREETING: hello
steps:
  - name: first
    bash: echo $GREETING
  - name: second
    bash: echo done
"#;

#[tokio::test]
async fn test_two_steps_succeed_with_merged_outputs() {
    let h = harness();
    let job = h.started(TWO_STEPS).await;
    assert_eq!(job.status, JobStatus::Running);
    assert_eq!(job.context.get("GREETING"), Some("hello"));

    let mut first = StepCallback::new(job.id, "demo/first", StepStatus::Success);
    first.output.put("ARTIFACT", "first.tar");
    let job = h.manager.on_step_callback(first).await.unwrap();
    assert_eq!(job.current_path.as_deref(), Some("demo/second"));

    let mut second = StepCallback::new(job.id, "demo/second", StepStatus::Success);
    second.output.put("DIGEST", "abc123");
    let job = h.manager.on_step_callback(second).await.unwrap();

    assert_eq!(job.status, JobStatus::Success);
    assert_eq!(job.context.get("ARTIFACT"), Some("first.tar"));
    assert_eq!(job.context.get("DIGEST"), Some("abc123"));
    assert_eq!(job.context.get(keys::JOB_STEPS), Some("first=SUCCESS;second=SUCCESS"));
    assert!(job.finished_at.is_some());
    assert_eq!(h.agents.shell_paths(), vec!["demo/first", "demo/second"]);
    assert!(!h.lock.exists(&job.lock_path()).await.unwrap());
}

#[tokio::test]
async fn test_failed_step_skips_the_rest() {
    let h = harness();
    let job = h.started(TWO_STEPS).await;

    let mut failed = StepCallback::new(job.id, "demo/first", StepStatus::Exception);
    failed.code = Some(2);
    failed.error = Some("exit code 2".to_string());
    let job = h.manager.on_step_callback(failed).await.unwrap();

    assert_eq!(job.status, JobStatus::Failure);
    assert_eq!(job.error_from_context(), Some("exit code 2"));
    assert_eq!(h.step_status(&job, "demo/first").await, StepStatus::Exception);
    assert_eq!(h.step_status(&job, "demo/second").await, StepStatus::Skipped);
    assert_eq!(h.agents.shell_paths(), vec!["demo/first"]);
}

#[tokio::test]
async fn test_allowed_failure_continues() {
    let h = harness();
    let yml = r#"
steps:
  - name: flaky
    allow_failure: true
    bash: ./flaky.sh
  - name: build
    bash: make
"#;
    let job = h.started(yml).await;

    let job = h.report(&job, "demo/flaky", StepStatus::Exception).await.unwrap();
    assert_eq!(job.status, JobStatus::Running);
    assert_eq!(job.current_path.as_deref(), Some("demo/build"));

    let job = h.report(&job, "demo/build", StepStatus::Success).await.unwrap();
    assert_eq!(job.status, JobStatus::Success);
}

#[tokio::test]
async fn test_condition_skips_trailing_step() {
    let h = harness();
    let yml = r#"
steps:
  - name: build
    bash: make
  - name: publish
    condition: $BRANCH == "main"
    bash: make publish
"#;
    let job = h.started(yml).await;

    let job = h.report(&job, "demo/build", StepStatus::Success).await.unwrap();
    assert_eq!(job.status, JobStatus::Success);
    assert_eq!(h.step_status(&job, "demo/publish").await, StepStatus::Skipped);
    assert_eq!(h.agents.shell_paths(), vec!["demo/build"]);
}

#[tokio::test]
async fn test_final_step_runs_after_failure() {
    let h = harness();
    let yml = r#"
steps:
  - name: test
    bash: cargo test
  - name: deploy
    bash: ./deploy.sh
  - name: cleanup
    final: true
    bash: rm -rf target
"#;
    let job = h.started(yml).await;

    let job = h.report(&job, "demo/test", StepStatus::Exception).await.unwrap();
    assert_eq!(job.status, JobStatus::Running);
    assert_eq!(job.current_path.as_deref(), Some("demo/cleanup"));

    let job = h.report(&job, "demo/cleanup", StepStatus::Success).await.unwrap();
    assert_eq!(job.status, JobStatus::Failure);
    assert_eq!(h.step_status(&job, "demo/deploy").await, StepStatus::Skipped);
    assert_eq!(h.step_status(&job, "demo/cleanup").await, StepStatus::Success);
    assert_eq!(h.agents.shell_paths(), vec!["demo/test", "demo/cleanup"]);
}

#[tokio::test]
async fn test_loading_from_repository() {
    let h = harness_with(EngineConfig::default(), Some(TWO_STEPS));
    let job = Job::new(FlowId::new(), "demo", 1, Trigger::Push);
    let job = h.manager.create_job(job).await.unwrap();

    let job = h.manager.to_loading(job).await.unwrap();
    assert_eq!(job.status, JobStatus::Created);
    assert_eq!(job.current_path.as_deref(), Some("demo"));
    assert_eq!(h.manager.steps().list(job.id).await.unwrap().len(), 2);
}

#[tokio::test]
async fn test_loading_failure_fails_job() {
    let h = harness();
    let job = Job::new(FlowId::new(), "demo", 1, Trigger::Push);
    let job = h.manager.create_job(job).await.unwrap();

    let job = h.manager.to_loading(job).await.unwrap();
    assert_eq!(job.status, JobStatus::Failure);
    assert!(job.message.contains("repository unreachable"));
}

#[tokio::test]
async fn test_invalid_yaml_fails_job() {
    let h = harness();
    let job = Job::new(FlowId::new(), "demo", 1, Trigger::Manual);
    let job = h.manager.create_job(job).await.unwrap();

    let job = h.manager.to_created(job, "steps: [").await.unwrap();
    assert_eq!(job.status, JobStatus::Failure);
    assert!(!job.message.is_empty());
}

#[tokio::test]
async fn test_queued_job_times_out_on_sweep() {
    let h = harness();
    let job = Job::new(FlowId::new(), "demo", 1, Trigger::Manual);
    let job = h.manager.create_job(job).await.unwrap();
    let job = h.manager.to_created(job, TWO_STEPS).await.unwrap();
    let job = h.manager.to_start(job).await.unwrap();
    assert_eq!(job.status, JobStatus::Queued);

    let mut aged = h.jobs.get(job.id).await.unwrap();
    aged.created_at = aged.created_at - ChronoDuration::seconds(i64::from(aged.expire) + 5);
    h.jobs.save(&aged).await.unwrap();

    let sweeper = TimeoutSweeper::new(h.manager.clone());
    assert_eq!(sweeper.sweep_once(Utc::now()).await.unwrap(), 1);

    let job = h.jobs.get(job.id).await.unwrap();
    assert_eq!(job.status, JobStatus::Timeout);
    assert_eq!(h.step_status(&job, "demo/first").await, StepStatus::Skipped);
    assert!(h.agents.shell_paths().is_empty());
}

#[tokio::test]
async fn test_cancel_running_job_with_online_agent() {
    let h = harness();
    let job = h.started(TWO_STEPS).await;

    let job = h.manager.to_cancelled(job, "stopped by user").await.unwrap();
    assert_eq!(job.status, JobStatus::Cancelling);
    assert_eq!(h.agents.kills(), 1);

    let job = h.report(&job, "demo/first", StepStatus::Exception).await.unwrap();
    assert_eq!(job.status, JobStatus::Cancelled);
    assert_eq!(job.message, "stopped by user");
    assert_eq!(h.step_status(&job, "demo/second").await, StepStatus::Skipped);
    assert!(!h.lock.exists(&job.lock_path()).await.unwrap());
}

#[tokio::test]
async fn test_cancel_with_offline_agent_cancels_directly() {
    let h = harness();
    let job = h.started(TWO_STEPS).await;
    h.agents.go_offline();

    let job = h.manager.to_cancelled(job, "stopped by user").await.unwrap();
    assert_eq!(job.status, JobStatus::Cancelled);
    assert_eq!(h.agents.kills(), 0);
    assert_eq!(h.step_status(&job, "demo/first").await, StepStatus::Skipped);
}

#[tokio::test]
async fn test_agent_offline_fails_running_job() {
    let h = harness();
    let job = h.started(TWO_STEPS).await;
    let agent_id = h.agents.go_offline();

    h.manager
        .on_agent_event(AgentEvent::StatusChanged {
            agent_id,
            status: AgentStatus::Offline,
        })
        .await
        .unwrap();

    let job = h.jobs.get(job.id).await.unwrap();
    assert_eq!(job.status, JobStatus::Failure);
    assert_eq!(job.message, "Agent went offline");
    assert_eq!(h.step_status(&job, "demo/first").await, StepStatus::Exception);
}

#[tokio::test]
async fn test_locked_job_reports_lock_unavailable() {
    let config = EngineConfig {
        lock_timeout: Duration::from_millis(50),
        ..EngineConfig::default()
    };
    let h = harness_with(config, None);
    let job = h.started(TWO_STEPS).await;

    let held = h.lock.lock(&job.lock_path(), Duration::from_secs(1)).await.unwrap().unwrap();
    let err = h.report(&job, "demo/first", StepStatus::Success).await.unwrap_err();
    assert!(matches!(err, SmError::LockUnavailable(id) if id == job.id));

    let cancel = h.manager.to_cancelled(job.clone(), "stop").await;
    assert!(matches!(cancel, Err(SmError::LockUnavailable(_))));

    h.lock.release(held).await.unwrap();
    let stored = h.jobs.get(job.id).await.unwrap();
    assert_eq!(stored.status, JobStatus::Running);
    assert_eq!(stored.current_path.as_deref(), Some("demo/first"));
}

#[tokio::test]
async fn test_duplicate_callbacks_advance_once() {
    let h = harness();
    let job = h.started(TWO_STEPS).await;

    let (a, b) = tokio::join!(
        h.report(&job, "demo/first", StepStatus::Success),
        h.report(&job, "demo/first", StepStatus::Success),
    );
    a.unwrap();
    b.unwrap();

    let job = h.jobs.get(job.id).await.unwrap();
    assert_eq!(job.status, JobStatus::Running);
    assert_eq!(job.current_path.as_deref(), Some("demo/second"));
    assert_eq!(h.agents.shell_paths(), vec!["demo/first", "demo/second"]);
}

#[tokio::test]
async fn test_stale_callback_changes_nothing() {
    let h = harness();
    let job = h.started(TWO_STEPS).await;

    let job = h.report(&job, "demo/second", StepStatus::Success).await.unwrap();
    assert_eq!(job.status, JobStatus::Running);
    assert_eq!(job.current_path.as_deref(), Some("demo/first"));
    assert_eq!(h.step_status(&job, "demo/second").await, StepStatus::Pending);
    assert_eq!(h.agents.shell_paths(), vec!["demo/first"]);
}

#[tokio::test]
async fn test_finished_job_stays_finished() {
    let h = harness();
    let job = h.started(TWO_STEPS).await;
    let job = h.report(&job, "demo/first", StepStatus::Exception).await.unwrap();
    assert_eq!(job.status, JobStatus::Failure);

    let err = h.report(&job, "demo/first", StepStatus::Success).await.unwrap_err();
    assert!(matches!(err, SmError::JobFinished(_)));

    let job = h.manager.to_timeout(job).await.unwrap();
    assert_eq!(job.status, JobStatus::Failure);
    assert!(matches!(
        h.manager.to_cancelled(job.clone(), "late").await,
        Err(SmError::JobFinished(_))
    ));
    assert_eq!(h.step_status(&job, "demo/first").await, StepStatus::Exception);
}

#[tokio::test]
async fn test_running_step_callback_only_updates_step() {
    let h = harness();
    let job = h.started(TWO_STEPS).await;

    let job = h.report(&job, "demo/first", StepStatus::Running).await.unwrap();
    assert_eq!(job.status, JobStatus::Running);
    assert_eq!(job.current_path.as_deref(), Some("demo/first"));
    assert_eq!(h.agents.shell_paths(), vec!["demo/first"]);
}

#[tokio::test]
async fn test_skipped_final_step_does_not_resume_normal_steps() {
    let h = harness();
    let yml = r#"
steps:
  - name: test
    bash: cargo test
  - name: cleanup
    final: true
    condition: "false"
    bash: rm -rf target
  - name: deploy
    bash: ./deploy.sh
"#;
    let job = h.started(yml).await;

    let job = h.report(&job, "demo/test", StepStatus::Exception).await.unwrap();
    assert_eq!(job.status, JobStatus::Failure);
    assert_eq!(h.step_status(&job, "demo/cleanup").await, StepStatus::Skipped);
    assert_eq!(h.step_status(&job, "demo/deploy").await, StepStatus::Skipped);
    assert_eq!(h.agents.shell_paths(), vec!["demo/test"]);
}

#[tokio::test]
async fn test_condition_error_fails_job() {
    let h = harness();
    let yml = r#"
steps:
  - name: check
    condition: $X + 1
    bash: make check
  - name: build
    bash: make
"#;
    let job = h.started(yml).await;

    assert_eq!(job.status, JobStatus::Failure);
    assert!(job.message.starts_with("condition"), "message: {}", job.message);
    assert_eq!(h.step_status(&job, "demo/check").await, StepStatus::Exception);
    assert_eq!(h.step_status(&job, "demo/build").await, StepStatus::Skipped);
    assert!(h.agents.shell_paths().is_empty());
    assert!(!h.lock.exists(&job.lock_path()).await.unwrap());
}

#[tokio::test]
async fn test_offline_cancel_and_agent_drop_wait_for_job_lock() {
    let config = EngineConfig {
        lock_timeout: Duration::from_millis(50),
        ..EngineConfig::default()
    };
    let h = harness_with(config, None);
    let job = h.started(TWO_STEPS).await;
    let agent_id = h.agents.go_offline();

    let held = h.lock.lock(&job.lock_path(), Duration::from_secs(1)).await.unwrap().unwrap();
    let cancel = h.manager.to_cancelled(job.clone(), "stop").await;
    assert!(matches!(cancel, Err(SmError::LockUnavailable(_))));

    let offline = AgentEvent::StatusChanged {
        agent_id,
        status: AgentStatus::Offline,
    };
    h.manager.on_agent_event(offline.clone()).await.unwrap();
    assert_eq!(h.jobs.get(job.id).await.unwrap().status, JobStatus::Running);

    h.lock.release(held).await.unwrap();
    h.manager.on_agent_event(offline).await.unwrap();

    let job = h.jobs.get(job.id).await.unwrap();
    assert_eq!(job.status, JobStatus::Failure);
    assert_eq!(job.message, "Agent went offline");
    assert!(!h.lock.exists(&job.lock_path()).await.unwrap());
}

#[tokio::test]
async fn test_cancelling_job_times_out_on_sweep() {
    let h = harness();
    let job = h.started(TWO_STEPS).await;
    let job = h.manager.to_cancelled(job, "stopped by user").await.unwrap();
    assert_eq!(job.status, JobStatus::Cancelling);
    assert_eq!(h.agents.kills(), 1);

    let sweeper = TimeoutSweeper::new(h.manager.clone());
    let later = Utc::now() + ChronoDuration::seconds(i64::from(job.timeout) + 1);
    assert_eq!(sweeper.sweep_once(later).await.unwrap(), 1);

    let job = h.jobs.get(job.id).await.unwrap();
    assert_eq!(job.status, JobStatus::Timeout);
    assert_eq!(h.step_status(&job, "demo/first").await, StepStatus::Timeout);
    assert_eq!(h.step_status(&job, "demo/second").await, StepStatus::Skipped);
    assert_eq!(h.agents.kills(), 2);
    assert!(!h.lock.exists(&job.lock_path()).await.unwrap());
}
