//! Execution backends for pipewright.
//!
//! Provides the collaborators a job engine needs to run flows on one host:
//! - A local agent pool that runs step scripts with `/bin/sh`
//! - A git-backed fetcher for flow YAML
//! - An in-memory plugin registry
//! - A post-job task runner that logs finished jobs

pub mod git;
pub mod local;
pub mod plugins;
pub mod tasks;

pub use git::{GitError, GitYmlFetcher};
pub use local::LocalAgentPool;
pub use plugins::InMemoryPluginRegistry;
pub use tasks::LogTaskRunner;
