//! State machine errors.

use pipewright_config::ConfigError;
use pipewright_core::JobId;
use pipewright_core::job::JobStatus;
use pipewright_db::DbError;
use thiserror::Error;

use crate::condition::ConditionError;

#[derive(Debug, Error)]
pub enum SmError {
    #[error("no transition from {from} to {to}")]
    TransitionNotFound { from: JobStatus, to: JobStatus },

    #[error("transition from {from} to {to} is registered twice")]
    DuplicateTransition { from: JobStatus, to: JobStatus },

    #[error("transition chain starting at {0} did not settle")]
    Unsettled(JobStatus),

    #[error("unable to lock job {0}")]
    LockUnavailable(JobId),

    #[error("job {0} is being processed, try later")]
    TryLater(JobId),

    #[error("job {0} is already finished")]
    JobFinished(JobId),

    #[error("job {job} expected to be {expected} but is {actual}")]
    UnexpectedStatus {
        job: JobId,
        expected: JobStatus,
        actual: JobStatus,
    },

    #[error(transparent)]
    Core(#[from] pipewright_core::Error),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Db(#[from] DbError),

    #[error(transparent)]
    Condition(#[from] ConditionError),
}

pub type SmResult<T> = std::result::Result<T, SmError>;
