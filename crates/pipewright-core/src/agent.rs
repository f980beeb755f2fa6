//! Agents, the commands sent to them, and the dispatcher trait.
//!
//! Agents run dispatched commands somewhere else and report results back
//! later as [`AgentEvent`]s.

use async_trait::async_trait;
use derive_more::Display;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::job::Job;
use crate::step::StepCallback;
use crate::{AgentId, FlowId, JobId, Result, Vars};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AgentStatus {
    #[display("OFFLINE")]
    Offline,
    #[display("STARTING")]
    Starting,
    #[display("IDLE")]
    Idle,
    #[display("BUSY")]
    Busy,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Agent {
    pub id: AgentId,
    pub name: String,
    pub status: AgentStatus,
    pub job_id: Option<JobId>,
    pub tags: Vec<String>,
}

impl Agent {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: AgentId::new(),
            name: name.into(),
            status: AgentStatus::Idle,
            job_id: None,
            tags: Vec::new(),
        }
    }

    pub fn is_online(&self) -> bool {
        self.status != AgentStatus::Offline
    }

    pub fn is_idle(&self) -> bool {
        self.status == AgentStatus::Idle
    }
}

/// Container settings for a step.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DockerOption {
    pub image: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub entrypoint: Vec<String>,
    #[serde(default)]
    pub command: Vec<String>,
    #[serde(default)]
    pub ports: Vec<String>,
    #[serde(default)]
    pub network: Option<String>,
    #[serde(default)]
    pub environment: BTreeMap<String, String>,
    /// The container the step script runs in, as opposed to a service container.
    #[serde(default)]
    pub is_runtime: bool,
}

/// Command that runs one step on an agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShellCmd {
    /// `{job_id}:{node_path}`
    pub id: String,
    pub job_id: JobId,
    pub flow_id: FlowId,
    pub node_path: String,
    pub scripts: Vec<String>,
    pub inputs: Vars,
    pub dockers: Vec<DockerOption>,
    /// Variable names the agent reports back as step output.
    pub env_filters: Vec<String>,
    pub allow_failure: bool,
    pub plugin: Option<String>,
    pub timeout: u32,
}

impl ShellCmd {
    pub fn script(&self) -> String {
        self.scripts.join("\n")
    }

    pub fn runtime_docker(&self) -> Option<&DockerOption> {
        self.dockers.iter().find(|d| d.is_runtime)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Cmd {
    Shell(ShellCmd),
    /// Stop whatever the agent is running for the job.
    Kill { job_id: JobId },
}

/// Events an agent pool reports back to the job engine.
#[derive(Debug, Clone, PartialEq)]
pub enum AgentEvent {
    CmdSent {
        agent_id: AgentId,
        job_id: JobId,
        node_path: String,
    },
    StatusChanged {
        agent_id: AgentId,
        status: AgentStatus,
    },
    StepFinished(StepCallback),
}

/// Re-checked while waiting for an agent; returning false abandons the wait.
pub type CanAcquire = Arc<dyn Fn() -> BoxFuture<'static, bool> + Send + Sync>;

/// Acquires agents for jobs and sends them commands.
#[async_trait]
pub trait AgentDispatcher: Send + Sync {
    /// Wait for an agent for `job`. Returns `None` once `can_acquire`
    /// reports that the job no longer wants one.
    async fn acquire(&self, job: &Job, can_acquire: CanAcquire) -> Result<Option<Agent>>;

    /// Send a command. Results arrive later as agent events.
    async fn dispatch(&self, cmd: Cmd, agent: &Agent) -> Result<()>;

    /// Return the agent to the pool if it is still assigned.
    async fn try_release(&self, agent_id: AgentId) -> Result<()>;

    async fn get(&self, agent_id: AgentId) -> Result<Agent>;
}
