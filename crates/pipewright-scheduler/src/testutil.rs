//! Fakes shared by the unit tests.

use async_trait::async_trait;
use pipewright_config::EngineConfig;
use pipewright_core::agent::{Agent, AgentDispatcher, AgentStatus, CanAcquire, Cmd};
use pipewright_core::event::BroadcastEventBus;
use pipewright_core::job::Job;
use pipewright_core::plugin::{Plugin, PluginLookup};
use pipewright_core::task::{LocalTaskRunner, YmlFetcher};
use pipewright_core::{AgentId, Error, Result};
use pipewright_db::{MemJobRepo, MemStepRepo, MemYmlRepo};
use std::sync::{Arc, Mutex};

use crate::lock::InMemoryLock;
use crate::manager::{Collaborators, JobActionManager};
use crate::queue::InMemoryJobQueue;

/// A single always-available agent that records what it is sent.
pub(crate) struct OneAgent {
    pub agent: Mutex<Agent>,
    pub sent: Mutex<Vec<Cmd>>,
}

impl OneAgent {
    pub fn new() -> Self {
        Self {
            agent: Mutex::new(Agent::new("local-1")),
            sent: Mutex::new(Vec::new()),
        }
    }

    pub fn set_status(&self, status: AgentStatus) {
        self.agent.lock().unwrap().status = status;
    }

    pub fn sent(&self) -> Vec<Cmd> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl AgentDispatcher for OneAgent {
    async fn acquire(&self, _: &Job, _: CanAcquire) -> Result<Option<Agent>> {
        Ok(Some(self.agent.lock().unwrap().clone()))
    }
    async fn dispatch(&self, cmd: Cmd, _: &Agent) -> Result<()> {
        self.sent.lock().unwrap().push(cmd);
        Ok(())
    }
    async fn try_release(&self, _: AgentId) -> Result<()> {
        Ok(())
    }
    async fn get(&self, _: AgentId) -> Result<Agent> {
        Ok(self.agent.lock().unwrap().clone())
    }
}

pub(crate) struct Nothing;

#[async_trait]
impl PluginLookup for Nothing {
    async fn get(&self, name: &str) -> Result<Plugin> {
        Err(Error::NotFound(name.to_string()))
    }
}

#[async_trait]
impl YmlFetcher for Nothing {
    async fn fetch(&self, _: &Job) -> Result<String> {
        Err(Error::NotAvailable("no repository".to_string()))
    }
}

#[async_trait]
impl LocalTaskRunner for Nothing {
    async fn run(&self, _: &Job) -> Result<()> {
        Ok(())
    }
}

pub(crate) struct Fixture {
    pub manager: Arc<JobActionManager>,
    pub agents: Arc<OneAgent>,
    pub queue: Arc<InMemoryJobQueue>,
}

pub(crate) fn fixture(config: EngineConfig) -> Fixture {
    let agents = Arc::new(OneAgent::new());
    let queue = Arc::new(InMemoryJobQueue::new());
    let collab = Collaborators {
        jobs: Arc::new(MemJobRepo::new()),
        steps: Arc::new(MemStepRepo::new()),
        ymls: Arc::new(MemYmlRepo::new()),
        queue: queue.clone(),
        lock: Arc::new(InMemoryLock::new()),
        agents: agents.clone(),
        events: Arc::new(BroadcastEventBus::default()),
        plugins: Arc::new(Nothing),
        fetcher: Arc::new(Nothing),
        tasks: Arc::new(Nothing),
    };
    let manager = Arc::new(JobActionManager::new(collab, config).unwrap());
    Fixture {
        manager,
        agents,
        queue,
    }
}
