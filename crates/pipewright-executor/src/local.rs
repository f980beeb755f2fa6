//! Local agent pool.
//!
//! Each agent is a slot that runs one job at a time on this host. Step
//! scripts run under `/bin/sh -c` in a per-job work directory and results
//! come back through the [`AgentEvent`] channel handed to the pool.

use async_trait::async_trait;
use chrono::Utc;
use pipewright_core::agent::{Agent, AgentDispatcher, AgentEvent, AgentStatus, CanAcquire, Cmd, ShellCmd};
use pipewright_core::job::Job;
use pipewright_core::step::{StepCallback, StepStatus};
use pipewright_core::{AgentId, Error, JobId, Result, Vars};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::process::Command;
use tokio::sync::Notify;
use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// Path of the file the step shell dumps its environment into on exit.
const ENV_FILE_VAR: &str = "PIPEWRIGHT_ENV_FILE";

/// How often a waiting acquire re-checks whether the job still wants an agent.
const ACQUIRE_RECHECK: Duration = Duration::from_secs(1);

struct RunningStep {
    node_path: String,
    handle: JoinHandle<()>,
}

type RunningSteps = Arc<Mutex<HashMap<JobId, RunningStep>>>;

pub struct LocalAgentPool {
    workspace: PathBuf,
    agents: Mutex<Vec<Agent>>,
    released: Notify,
    running: RunningSteps,
    events: UnboundedSender<AgentEvent>,
}

impl LocalAgentPool {
    /// Create `size` idle agents working under `workspace`.
    pub fn new(size: usize, workspace: impl Into<PathBuf>, events: UnboundedSender<AgentEvent>) -> Self {
        let agents = (1..=size).map(|i| Agent::new(format!("local-{i}"))).collect();
        Self {
            workspace: workspace.into(),
            agents: Mutex::new(agents),
            released: Notify::new(),
            running: Arc::new(Mutex::new(HashMap::new())),
            events,
        }
    }

    pub fn agents(&self) -> Vec<Agent> {
        self.agents.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Change an agent's status and report it, e.g. to take an agent offline.
    pub fn set_status(&self, agent_id: AgentId, status: AgentStatus) -> Result<()> {
        {
            let mut agents = self.agents.lock().unwrap_or_else(PoisonError::into_inner);
            let agent = agents
                .iter_mut()
                .find(|a| a.id == agent_id)
                .ok_or_else(|| Error::NotFound(format!("agent {agent_id}")))?;
            agent.status = status;
            if status == AgentStatus::Idle {
                agent.job_id = None;
            }
        }
        info!(agent_id = %agent_id, status = %status, "agent status changed");
        if status == AgentStatus::Idle {
            self.released.notify_waiters();
        }
        emit(&self.events, AgentEvent::StatusChanged { agent_id, status });
        Ok(())
    }

    fn take_idle(&self, job: &Job) -> Option<Agent> {
        let mut agents = self.agents.lock().unwrap_or_else(PoisonError::into_inner);
        let agent = agents.iter_mut().find(|a| a.is_idle())?;
        agent.status = AgentStatus::Busy;
        agent.job_id = Some(job.id);
        Some(agent.clone())
    }

    fn work_dir(&self, job_id: JobId) -> PathBuf {
        self.workspace.join(job_id.to_string())
    }

    fn start_shell(&self, cmd: ShellCmd, agent: &Agent) {
        let job_id = cmd.job_id;
        let node_path = cmd.node_path.clone();
        let work_dir = self.work_dir(job_id);
        let running = self.running.clone();
        let events = self.events.clone();

        // held across spawn so the step cannot finish before it is registered
        let mut steps = running.lock().unwrap_or_else(PoisonError::into_inner);
        let handle = {
            let running = running.clone();
            tokio::spawn(async move {
                let callback = run_shell(&cmd, &work_dir).await;
                let mut steps = running.lock().unwrap_or_else(PoisonError::into_inner);
                let current = steps.get(&cmd.job_id).is_some_and(|s| s.node_path == cmd.node_path);
                if current {
                    steps.remove(&cmd.job_id);
                    emit(&events, AgentEvent::StepFinished(callback));
                }
            })
        };
        if let Some(previous) = steps.insert(job_id, RunningStep { node_path: node_path.clone(), handle }) {
            warn!(job_id = %job_id, path = %previous.node_path, "replacing a step that is still running");
            previous.handle.abort();
        }
        drop(steps);

        emit(
            &self.events,
            AgentEvent::CmdSent {
                agent_id: agent.id,
                job_id,
                node_path,
            },
        );
    }

    fn kill(&self, job_id: JobId) {
        let killed = self
            .running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&job_id);

        let Some(step) = killed else {
            debug!(job_id = %job_id, "nothing running to kill");
            return;
        };
        step.handle.abort();
        info!(job_id = %job_id, path = %step.node_path, "step killed");

        let mut callback = StepCallback::new(job_id, step.node_path, StepStatus::Exception);
        callback.error = Some("Killed".to_string());
        callback.finish_at = Some(Utc::now());
        emit(&self.events, AgentEvent::StepFinished(callback));
    }
}

#[async_trait]
impl AgentDispatcher for LocalAgentPool {
    async fn acquire(&self, job: &Job, can_acquire: CanAcquire) -> Result<Option<Agent>> {
        loop {
            let released = self.released.notified();
            if let Some(agent) = self.take_idle(job) {
                info!(job_id = %job.id, agent = %agent.name, "agent assigned");
                return Ok(Some(agent));
            }
            if !can_acquire().await {
                debug!(job_id = %job.id, "job no longer waits for an agent");
                return Ok(None);
            }
            // either an agent was released or it is time to re-check the job
            let _ = timeout(ACQUIRE_RECHECK, released).await;
        }
    }

    async fn dispatch(&self, cmd: Cmd, agent: &Agent) -> Result<()> {
        if !agent.is_online() {
            return Err(Error::NotAvailable(format!("agent {} is offline", agent.name)));
        }
        match cmd {
            Cmd::Shell(shell) => self.start_shell(shell, agent),
            Cmd::Kill { job_id } => self.kill(job_id),
        }
        Ok(())
    }

    async fn try_release(&self, agent_id: AgentId) -> Result<()> {
        let released = {
            let mut agents = self.agents.lock().unwrap_or_else(PoisonError::into_inner);
            match agents.iter_mut().find(|a| a.id == agent_id) {
                Some(agent) if agent.status == AgentStatus::Busy => {
                    agent.status = AgentStatus::Idle;
                    agent.job_id = None;
                    true
                }
                _ => false,
            }
        };
        if released {
            debug!(agent_id = %agent_id, "agent released");
            self.released.notify_waiters();
        }
        Ok(())
    }

    async fn get(&self, agent_id: AgentId) -> Result<Agent> {
        self.agents
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .find(|a| a.id == agent_id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("agent {agent_id}")))
    }
}

fn emit(events: &UnboundedSender<AgentEvent>, event: AgentEvent) {
    if events.send(event).is_err() {
        warn!("agent event receiver dropped");
    }
}

struct ShellOutcome {
    code: i32,
    output: Vars,
    stderr: String,
}

async fn run_shell(cmd: &ShellCmd, work_dir: &Path) -> StepCallback {
    let mut callback = StepCallback::new(cmd.job_id, &cmd.node_path, StepStatus::Running);
    callback.start_at = Some(Utc::now());

    if !cmd.dockers.is_empty() {
        warn!(job_id = %cmd.job_id, path = %cmd.node_path, "local agents ignore docker options");
    }

    match execute(cmd, work_dir).await {
        Ok(outcome) => {
            callback.code = Some(outcome.code);
            callback.output = outcome.output;
            if outcome.code == 0 {
                callback.status = StepStatus::Success;
            } else {
                callback.status = StepStatus::Exception;
                let detail = outcome.stderr.lines().last().unwrap_or_default().trim().to_string();
                callback.error = Some(if detail.is_empty() {
                    format!("exit code {}", outcome.code)
                } else {
                    format!("exit code {}: {detail}", outcome.code)
                });
            }
        }
        Err(Error::Timeout(message)) => {
            callback.status = StepStatus::Timeout;
            callback.error = Some(message);
        }
        Err(e) => {
            callback.status = StepStatus::Exception;
            callback.error = Some(e.to_string());
        }
    }

    callback.finish_at = Some(Utc::now());
    info!(job_id = %cmd.job_id, path = %cmd.node_path, status = %callback.status, "step finished");
    callback
}

async fn execute(cmd: &ShellCmd, work_dir: &Path) -> Result<ShellOutcome> {
    tokio::fs::create_dir_all(work_dir)
        .await
        .map_err(|e| Error::ExecutionFailed(format!("unable to create {}: {e}", work_dir.display())))?;

    let env_file = work_dir.join(format!(".env-{:x}", md5::compute(&cmd.id)));
    let script = format!("set -e\ntrap 'env > \"${ENV_FILE_VAR}\"' EXIT\n{}", cmd.script());

    let child = Command::new("/bin/sh")
        .arg("-c")
        .arg(&script)
        .envs(cmd.inputs.iter())
        .env(ENV_FILE_VAR, &env_file)
        .current_dir(work_dir)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .output();

    let limit = Duration::from_secs(u64::from(cmd.timeout.max(1)));
    let output = match timeout(limit, child).await {
        Ok(result) => result.map_err(|e| Error::ExecutionFailed(format!("unable to run /bin/sh: {e}")))?,
        Err(_) => {
            return Err(Error::Timeout(format!("Step timed out after {}s", cmd.timeout)));
        }
    };

    for line in String::from_utf8_lossy(&output.stdout).lines() {
        debug!(job_id = %cmd.job_id, path = %cmd.node_path, "{line}");
    }

    let output_vars = match tokio::fs::read_to_string(&env_file).await {
        Ok(dump) => {
            let _ = tokio::fs::remove_file(&env_file).await;
            parse_exports(&dump, &cmd.env_filters)
        }
        Err(e) => {
            debug!(path = %env_file.display(), error = %e, "no environment dump");
            Vars::new()
        }
    };

    Ok(ShellOutcome {
        code: output.status.code().unwrap_or(-1),
        output: output_vars,
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
    })
}

/// Pick the exported variables out of an `env` dump.
fn parse_exports(dump: &str, filters: &[String]) -> Vars {
    let mut vars = Vars::new();
    for line in dump.lines() {
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        if filters.iter().any(|f| f == key) {
            vars.put(key, value);
        }
    }
    vars
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::future::BoxFuture;
    use pipewright_core::FlowId;
    use pipewright_core::job::Trigger;
    use tokio::sync::mpsc;

    fn can_acquire(value: bool) -> CanAcquire {
        Arc::new(move || -> BoxFuture<'static, bool> { Box::pin(async move { value }) })
    }

    fn job() -> Job {
        Job::new(FlowId::new(), "demo", 1, Trigger::Manual)
    }

    fn shell(job: &Job, path: &str, script: &str) -> ShellCmd {
        ShellCmd {
            id: format!("{}:{path}", job.id),
            job_id: job.id,
            flow_id: job.flow_id,
            node_path: path.to_string(),
            scripts: vec![script.to_string()],
            inputs: Vars::new(),
            dockers: Vec::new(),
            env_filters: Vec::new(),
            allow_failure: false,
            plugin: None,
            timeout: 30,
        }
    }

    #[test]
    fn test_parse_exports() {
        let dump = "HOME=/root\nVERSION=1.2.3\nURL=http://x?a=b\nnot a var\n";
        let filters = vec!["VERSION".to_string(), "URL".to_string()];
        let vars = parse_exports(dump, &filters);
        assert_eq!(vars.get("VERSION"), Some("1.2.3"));
        assert_eq!(vars.get("URL"), Some("http://x?a=b"));
        assert_eq!(vars.get("HOME"), None);
    }

    #[tokio::test]
    async fn test_acquire_and_release() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let pool = LocalAgentPool::new(1, std::env::temp_dir(), tx);

        let agent = pool.acquire(&job(), can_acquire(true)).await.unwrap().unwrap();
        assert_eq!(pool.get(agent.id).await.unwrap().status, AgentStatus::Busy);

        // pool exhausted and the job gave up
        assert!(pool.acquire(&job(), can_acquire(false)).await.unwrap().is_none());

        pool.try_release(agent.id).await.unwrap();
        let again = pool.acquire(&job(), can_acquire(true)).await.unwrap().unwrap();
        assert_eq!(again.id, agent.id);
    }

    #[tokio::test]
    async fn test_offline_agent_refuses_commands() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let pool = LocalAgentPool::new(1, std::env::temp_dir(), tx);
        let job = job();
        let agent = pool.acquire(&job, can_acquire(true)).await.unwrap().unwrap();

        pool.set_status(agent.id, AgentStatus::Offline).unwrap();
        assert!(matches!(
            rx.recv().await,
            Some(AgentEvent::StatusChanged { status: AgentStatus::Offline, .. })
        ));

        let agent = pool.get(agent.id).await.unwrap();
        let err = pool.dispatch(Cmd::Kill { job_id: job.id }, &agent).await.unwrap_err();
        assert!(matches!(err, Error::NotAvailable(_)));
    }

    #[tokio::test]
    #[ignore] // Requires /bin/sh
    async fn test_shell_step_reports_exports() {
        let dir = tempfile::tempdir().unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let pool = LocalAgentPool::new(1, dir.path(), tx);
        let job = job();
        let agent = pool.acquire(&job, can_acquire(true)).await.unwrap().unwrap();

        let mut cmd = shell(&job, "demo/build", "export VERSION=\"$MAJOR.4\"\necho building");
        cmd.inputs.put("MAJOR", "3");
        cmd.env_filters = vec!["VERSION".to_string()];
        pool.dispatch(Cmd::Shell(cmd), &agent).await.unwrap();

        assert!(matches!(rx.recv().await, Some(AgentEvent::CmdSent { .. })));
        let Some(AgentEvent::StepFinished(callback)) = rx.recv().await else {
            panic!("expected a step result");
        };
        assert_eq!(callback.status, StepStatus::Success);
        assert_eq!(callback.code, Some(0));
        assert_eq!(callback.output.get("VERSION"), Some("3.4"));
    }

    #[tokio::test]
    #[ignore] // Requires /bin/sh
    async fn test_failing_script_stops_early() {
        let dir = tempfile::tempdir().unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let pool = LocalAgentPool::new(1, dir.path(), tx);
        let job = job();
        let agent = pool.acquire(&job, can_acquire(true)).await.unwrap().unwrap();

        let cmd = shell(&job, "demo/test", "false\ntouch never");
        pool.dispatch(Cmd::Shell(cmd), &agent).await.unwrap();

        rx.recv().await.unwrap();
        let Some(AgentEvent::StepFinished(callback)) = rx.recv().await else {
            panic!("expected a step result");
        };
        assert_eq!(callback.status, StepStatus::Exception);
        assert_eq!(callback.code, Some(1));
        assert!(!dir.path().join(job.id.to_string()).join("never").exists());
    }

    #[tokio::test]
    #[ignore] // Requires /bin/sh
    async fn test_kill_reports_once() {
        let dir = tempfile::tempdir().unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let pool = LocalAgentPool::new(1, dir.path(), tx);
        let job = job();
        let agent = pool.acquire(&job, can_acquire(true)).await.unwrap().unwrap();

        pool.dispatch(Cmd::Shell(shell(&job, "demo/slow", "sleep 30")), &agent)
            .await
            .unwrap();
        rx.recv().await.unwrap();

        pool.dispatch(Cmd::Kill { job_id: job.id }, &agent).await.unwrap();
        let Some(AgentEvent::StepFinished(callback)) = rx.recv().await else {
            panic!("expected a step result");
        };
        assert_eq!(callback.status, StepStatus::Exception);
        assert_eq!(callback.error.as_deref(), Some("Killed"));

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    #[ignore] // Requires /bin/sh
    async fn test_step_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let job = job();
        let mut cmd = shell(&job, "demo/slow", "sleep 5");
        cmd.timeout = 1;

        let callback = run_shell(&cmd, dir.path()).await;
        assert_eq!(callback.status, StepStatus::Timeout);
        assert_eq!(callback.error.as_deref(), Some("Step timed out after 1s"));
    }
}
