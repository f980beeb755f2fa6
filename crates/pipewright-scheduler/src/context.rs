//! Scratch state carried through one state machine run.

use pipewright_core::AgentId;
use pipewright_core::job::{Job, JobStatus};
use pipewright_core::lock::LockHandle;
use pipewright_core::step::Step;

use crate::sm::SmContext;

pub struct JobSmContext {
    pub job: Job,
    /// Step result that triggered the run.
    pub step: Option<Step>,
    /// Raw YAML, when the run has to parse it.
    pub yml: Option<String>,
    /// Error message persisted if the run ends in a terminal status.
    pub error: Option<String>,
    pub agent_id: Option<AgentId>,
    /// Why the job is being cancelled.
    pub reason: Option<String>,
    pub lock: Option<LockHandle>,
    pub from: JobStatus,
    pub to: JobStatus,
}

impl JobSmContext {
    pub fn new(job: Job) -> Self {
        let status = job.status;
        Self {
            agent_id: job.agent_id,
            job,
            step: None,
            yml: None,
            error: None,
            reason: None,
            lock: None,
            from: status,
            to: status,
        }
    }

    pub fn with_step(mut self, step: Step) -> Self {
        self.step = Some(step);
        self
    }

    pub fn with_yml(mut self, yml: impl Into<String>) -> Self {
        self.yml = Some(yml.into());
        self
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    /// Message stored on the job when the run finishes.
    pub fn message(&self) -> String {
        self.error
            .clone()
            .or_else(|| self.reason.clone())
            .unwrap_or_default()
    }
}

impl SmContext for JobSmContext {
    fn set_current(&mut self, from: JobStatus, to: JobStatus) {
        self.from = from;
        self.to = to;
    }
}
