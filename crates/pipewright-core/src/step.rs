//! Step documents: the execution record of one tree node within a job.

use chrono::{DateTime, Utc};
use derive_more::Display;
use serde::{Deserialize, Serialize};

use crate::id::AgentId;
use crate::job::{Job, JobStatus};
use crate::{FlowId, JobId, Vars};

pub const MESSAGE_SKIPPED_ON_CONDITION: &str = "Skipped due to condition";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepStatus {
    #[display("PENDING")]
    Pending,
    #[display("RUNNING")]
    Running,
    #[display("SUCCESS")]
    Success,
    #[display("SKIPPED")]
    Skipped,
    #[display("EXCEPTION")]
    Exception,
    #[display("TIMEOUT")]
    Timeout,
}

impl StepStatus {
    /// Severity level; a recorded status is never replaced by a lower one.
    pub const fn level(self) -> u8 {
        match self {
            StepStatus::Pending => 0,
            StepStatus::Running => 1,
            StepStatus::Success | StepStatus::Skipped => 2,
            StepStatus::Exception => 3,
            StepStatus::Timeout => 4,
        }
    }

    pub const fn is_failure(self) -> bool {
        matches!(self, StepStatus::Exception | StepStatus::Timeout)
    }

    pub const fn is_finished(self) -> bool {
        !matches!(self, StepStatus::Pending | StepStatus::Running)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    /// `{job_id}:{node_path}`
    pub id: String,
    pub job_id: JobId,
    pub flow_id: FlowId,
    pub build_number: u64,
    pub node_path: String,
    pub status: StepStatus,
    pub allow_failure: bool,
    pub is_final: bool,
    pub agent_id: Option<AgentId>,
    pub code: Option<i32>,
    pub output: Vars,
    pub error: Option<String>,
    pub start_at: Option<DateTime<Utc>>,
    pub finish_at: Option<DateTime<Utc>>,
}

impl Step {
    pub fn new(job: &Job, node_path: impl Into<String>, allow_failure: bool, is_final: bool) -> Self {
        let node_path = node_path.into();
        Self {
            id: step_id(job.id, &node_path),
            job_id: job.id,
            flow_id: job.flow_id,
            build_number: job.build_number,
            node_path,
            status: StepStatus::Pending,
            allow_failure,
            is_final,
            agent_id: None,
            code: None,
            output: Vars::new(),
            error: None,
            start_at: None,
            finish_at: None,
        }
    }

    /// Whether the pipeline may continue past this step.
    pub fn is_success(&self) -> bool {
        match self.status {
            StepStatus::Success | StepStatus::Skipped => true,
            status if status.is_failure() => self.allow_failure,
            _ => false,
        }
    }

    /// Whether `status` may replace the current status.
    pub fn can_move_to(&self, status: StepStatus) -> bool {
        status == self.status || status.level() > self.status.level()
    }

    /// Job status implied by this step's outcome.
    pub fn job_status(&self) -> JobStatus {
        match self.status {
            StepStatus::Pending | StepStatus::Running => JobStatus::Running,
            StepStatus::Success | StepStatus::Skipped => JobStatus::Success,
            StepStatus::Exception | StepStatus::Timeout if self.allow_failure => JobStatus::Success,
            StepStatus::Exception => JobStatus::Failure,
            StepStatus::Timeout => JobStatus::Timeout,
        }
    }
}

pub fn step_id(job_id: JobId, node_path: &str) -> String {
    format!("{job_id}:{node_path}")
}

/// Result of a dispatched step as reported by an agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepCallback {
    pub job_id: JobId,
    pub node_path: String,
    pub status: StepStatus,
    pub code: Option<i32>,
    pub output: Vars,
    pub error: Option<String>,
    pub start_at: Option<DateTime<Utc>>,
    pub finish_at: Option<DateTime<Utc>>,
}

impl StepCallback {
    pub fn new(job_id: JobId, node_path: impl Into<String>, status: StepStatus) -> Self {
        Self {
            job_id,
            node_path: node_path.into(),
            status,
            code: None,
            output: Vars::new(),
            error: None,
            start_at: None,
            finish_at: None,
        }
    }
}
