//! Job documents and the job status ordering.

use chrono::{DateTime, Duration, Utc};
use derive_more::Display;
use serde::{Deserialize, Serialize};

use crate::vars::keys;
use crate::{Error, FlowId, JobId, Result, Vars};
use crate::id::AgentId;

/// Seconds a job may wait between creation and dispatch.
pub const DEFAULT_EXPIRE_SECS: u32 = 1800;

/// Seconds a job may spend running.
pub const DEFAULT_TIMEOUT_SECS: u32 = 1800;

pub const MIN_PRIORITY: u8 = 1;
pub const MAX_PRIORITY: u8 = 255;

/// Lifecycle status of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    #[display("PENDING")]
    Pending,
    #[display("LOADING")]
    Loading,
    #[display("CREATED")]
    Created,
    #[display("QUEUED")]
    Queued,
    #[display("RUNNING")]
    Running,
    #[display("CANCELLING")]
    Cancelling,
    #[display("CANCELLED")]
    Cancelled,
    #[display("TIMEOUT")]
    Timeout,
    #[display("FAILURE")]
    Failure,
    #[display("SUCCESS")]
    Success,
}

impl JobStatus {
    pub const ALL: [JobStatus; 10] = [
        JobStatus::Pending,
        JobStatus::Loading,
        JobStatus::Created,
        JobStatus::Queued,
        JobStatus::Running,
        JobStatus::Cancelling,
        JobStatus::Cancelled,
        JobStatus::Timeout,
        JobStatus::Failure,
        JobStatus::Success,
    ];

    /// Ordering used to reject status regressions. Terminal statuses share
    /// the highest order so none of them can replace another.
    pub const fn order(self) -> u8 {
        match self {
            JobStatus::Pending => 0,
            JobStatus::Loading => 1,
            JobStatus::Created => 2,
            JobStatus::Queued => 3,
            JobStatus::Running => 4,
            JobStatus::Cancelling => 5,
            JobStatus::Cancelled
            | JobStatus::Timeout
            | JobStatus::Failure
            | JobStatus::Success => 10,
        }
    }

    pub const fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Success | JobStatus::Failure | JobStatus::Timeout | JobStatus::Cancelled
        )
    }
}

impl std::str::FromStr for JobStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        JobStatus::ALL
            .into_iter()
            .find(|status| status.to_string() == s)
            .ok_or_else(|| Error::InvalidInput(format!("unknown job status: {s}")))
    }
}

/// What caused a job to be created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
pub enum Trigger {
    #[display("manual")]
    Manual,
    #[display("api")]
    Api,
    #[display("scheduler")]
    Scheduler,
    #[display("push")]
    Push,
    #[display("pr_opened")]
    PrOpened,
    #[display("pr_merged")]
    PrMerged,
    #[display("tag")]
    Tag,
}

/// One execution of a flow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub flow_id: FlowId,
    pub flow_name: String,
    pub build_number: u64,
    pub status: JobStatus,
    pub trigger: Trigger,
    /// Path of the node currently dispatched, once the job has started.
    pub current_path: Option<String>,
    pub agent_id: Option<AgentId>,
    pub context: Vars,
    pub priority: u8,
    /// Seconds the job may wait before it is dispatched.
    pub expire: u32,
    /// Seconds the job may run once dispatched.
    pub timeout: u32,
    /// The YAML has to be fetched from the flow's repository.
    pub yaml_from_repo: bool,
    pub message: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Job {
    pub fn new(flow_id: FlowId, flow_name: impl Into<String>, build_number: u64, trigger: Trigger) -> Self {
        let flow_name = flow_name.into();
        let now = Utc::now();

        let mut context = Vars::new();
        context.put(keys::FLOW_NAME, flow_name.clone());
        context.put(keys::JOB_BUILD_NUMBER, build_number.to_string());

        Self {
            id: JobId::new(),
            flow_id,
            flow_name,
            build_number,
            status: JobStatus::Pending,
            trigger,
            current_path: None,
            agent_id: None,
            context,
            priority: MIN_PRIORITY,
            expire: DEFAULT_EXPIRE_SECS,
            timeout: DEFAULT_TIMEOUT_SECS,
            yaml_from_repo: false,
            message: String::new(),
            created_at: now,
            updated_at: now,
            started_at: None,
            finished_at: None,
        }
    }

    /// `{flow_id}-{build_number}`, unique per flow.
    pub fn key(&self) -> String {
        format!("{}-{}", self.flow_id, self.build_number)
    }

    /// Name of the queue this job is sent to, e.g. `flow.q.{flow_id}.job`.
    pub fn queue_name(&self, prefix: &str) -> String {
        format!("{prefix}{}.job", self.flow_id)
    }

    /// Name of the distributed lock guarding this job.
    pub fn lock_path(&self) -> String {
        format!("/job-locks/{}", self.id)
    }

    pub fn expire_at(&self) -> DateTime<Utc> {
        self.created_at + Duration::seconds(i64::from(self.expire))
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expire_at()
    }

    /// Whether a running job has exceeded its run timeout.
    pub fn is_run_timeout(&self, now: DateTime<Utc>) -> bool {
        match self.started_at {
            Some(started) => now >= started + Duration::seconds(i64::from(self.timeout)),
            None => false,
        }
    }

    pub fn is_done(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn is_running(&self) -> bool {
        self.status == JobStatus::Running
    }

    pub fn is_cancelling(&self) -> bool {
        self.status == JobStatus::Cancelling
    }

    /// The status most recently recorded into the context by a counted step.
    pub fn status_from_context(&self) -> Option<JobStatus> {
        self.context
            .non_empty(keys::JOB_STATUS)
            .and_then(|s| s.parse().ok())
    }

    pub fn set_status_to_context(&mut self, status: JobStatus) {
        self.context.put(keys::JOB_STATUS, status.to_string());
    }

    pub fn error_from_context(&self) -> Option<&str> {
        self.context.non_empty(keys::JOB_ERROR)
    }

    pub fn set_error_to_context(&mut self, error: Option<&str>) {
        match error {
            Some(err) => self.context.put(keys::JOB_ERROR, err),
            None => {
                self.context.remove(keys::JOB_ERROR);
            }
        }
    }
}

/// Raw YAML pinned to a job when it reaches CREATED.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobYml {
    pub job_id: JobId,
    pub raw: String,
    pub created_at: DateTime<Utc>,
}

impl JobYml {
    pub fn new(job_id: JobId, raw: impl Into<String>) -> Self {
        Self {
            job_id,
            raw: raw.into(),
            created_at: Utc::now(),
        }
    }
}
