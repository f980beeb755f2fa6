//! Job scheduling for pipewright.
//!
//! Drives every job through its lifecycle with a table-driven state
//! machine: loading and parsing the flow YAML, queueing, agent dispatch,
//! step callbacks, cancellation and timeouts. Per-job locking keeps
//! concurrent transitions on one job exclusive, and the queue uses
//! PostgreSQL with SKIP LOCKED for distributed job claiming.

pub mod command;
pub mod condition;
pub mod context;
mod dispatch;
pub mod error;
pub mod lock;
pub mod manager;
pub mod queue;
pub mod sm;
pub mod steps;
pub mod sweeper;
#[cfg(test)]
mod testutil;
mod transitions;
pub mod worker;
pub mod yml;

pub use command::CommandBuilder;
pub use condition::{ConditionError, ConditionEvaluator};
pub use context::JobSmContext;
pub use error::{SmError, SmResult};
pub use lock::{InMemoryLock, PgAdvisoryLock};
pub use manager::{Collaborators, JobActionManager};
pub use queue::{InMemoryJobQueue, PgJobQueue};
pub use steps::StepService;
pub use sweeper::TimeoutSweeper;
pub use worker::Worker;
pub use yml::YmlManager;
