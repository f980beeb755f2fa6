//! Core domain types and traits for the pipewright job engine.
//!
//! This crate contains:
//! - Resource identifiers and the ordered variable map
//! - Job, step and job YAML snapshot documents
//! - Agent commands and the agent dispatcher trait
//! - Plugin definitions and typed input verification
//! - Collaborator traits (queue, lock, event bus, YAML fetcher, local tasks)

pub mod agent;
pub mod error;
pub mod event;
pub mod id;
pub mod job;
pub mod lock;
pub mod plugin;
pub mod queue;
pub mod step;
pub mod task;
pub mod vars;

pub use error::{Error, Result};
pub use id::{AgentId, FlowId, JobId};
pub use vars::Vars;
