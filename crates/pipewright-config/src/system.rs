//! Engine configuration parsing.
//!
//! ```kdl
//! engine {
//!     lock-timeout 20
//!     condition-timeout 2
//!     tree-cache-ttl 600
//!     queue-prefix "flow.q."
//!     job-expire 1800
//!     job-timeout 1800
//!     sweep-interval 10
//! }
//! workspace "/tmp/pipewright"
//! ```

use kdl::{KdlDocument, KdlNode};
use std::path::{Path, PathBuf};
use std::time::Duration;

use pipewright_core::job::{DEFAULT_EXPIRE_SECS, DEFAULT_TIMEOUT_SECS};

use crate::{ConfigError, ConfigResult};

#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    /// How long a transition waits for the per-job lock.
    pub lock_timeout: Duration,
    pub condition_timeout: Duration,
    pub tree_cache_ttl: Duration,
    pub queue_prefix: String,
    /// Seconds a new job may wait before dispatch.
    pub job_expire: u32,
    /// Seconds a job may run.
    pub job_timeout: u32,
    pub sweep_interval: Duration,
    pub workspace: PathBuf,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            lock_timeout: Duration::from_secs(20),
            condition_timeout: Duration::from_secs(2),
            tree_cache_ttl: Duration::from_secs(600),
            queue_prefix: "flow.q.".to_string(),
            job_expire: DEFAULT_EXPIRE_SECS,
            job_timeout: DEFAULT_TIMEOUT_SECS,
            sweep_interval: Duration::from_secs(10),
            workspace: std::env::temp_dir().join("pipewright"),
        }
    }
}

/// Parse engine configuration from KDL text. Missing settings keep their
/// defaults and unknown nodes are ignored.
pub fn parse_engine_config(kdl: &str) -> ConfigResult<EngineConfig> {
    let doc: KdlDocument = kdl.parse()?;
    let mut config = EngineConfig::default();

    for node in doc.nodes() {
        match node.name().value() {
            "engine" => {
                if let Some(children) = node.children() {
                    for child in children.nodes() {
                        apply_engine_setting(&mut config, child)?;
                    }
                }
            }
            "workspace" => {
                config.workspace = PathBuf::from(string_arg(node)?);
            }
            _ => {}
        }
    }

    Ok(config)
}

/// Read and parse an engine configuration file.
pub fn load_engine_config(path: &Path) -> ConfigResult<EngineConfig> {
    let content = std::fs::read_to_string(path)?;
    parse_engine_config(&content)
}

fn apply_engine_setting(config: &mut EngineConfig, node: &KdlNode) -> ConfigResult<()> {
    match node.name().value() {
        "lock-timeout" => config.lock_timeout = Duration::from_secs(u64_arg(node)?),
        "condition-timeout" => config.condition_timeout = Duration::from_secs(u64_arg(node)?),
        "tree-cache-ttl" => config.tree_cache_ttl = Duration::from_secs(u64_arg(node)?),
        "queue-prefix" => config.queue_prefix = string_arg(node)?,
        "job-expire" => config.job_expire = u32_arg(node)?,
        "job-timeout" => config.job_timeout = u32_arg(node)?,
        "sweep-interval" => config.sweep_interval = Duration::from_secs(u64_arg(node)?),
        _ => {}
    }
    Ok(())
}

fn first_arg(node: &KdlNode) -> ConfigResult<&kdl::KdlValue> {
    node.entries()
        .iter()
        .find(|e| e.name().is_none())
        .map(|e| e.value())
        .ok_or_else(|| ConfigError::MissingField(node.name().value().to_string()))
}

fn string_arg(node: &KdlNode) -> ConfigResult<String> {
    first_arg(node)?
        .as_string()
        .map(|s| s.to_string())
        .ok_or_else(|| invalid(node, "expected a string"))
}

fn u64_arg(node: &KdlNode) -> ConfigResult<u64> {
    first_arg(node)?
        .as_integer()
        .and_then(|i| u64::try_from(i).ok())
        .ok_or_else(|| invalid(node, "expected a non-negative integer"))
}

fn u32_arg(node: &KdlNode) -> ConfigResult<u32> {
    u32::try_from(u64_arg(node)?).map_err(|_| invalid(node, "value is too large"))
}

fn invalid(node: &KdlNode, message: &str) -> ConfigError {
    ConfigError::InvalidValue {
        field: node.name().value().to_string(),
        message: message.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_config() {
        let kdl = r#"
            engine {
                lock-timeout 5
                condition-timeout 1
                tree-cache-ttl 60
                queue-prefix "ci.q."
                job-expire 100
                job-timeout 200
                sweep-interval 3
            }
            workspace "/var/lib/pipewright"
        "#;

        let config = parse_engine_config(kdl).unwrap();
        assert_eq!(config.lock_timeout, Duration::from_secs(5));
        assert_eq!(config.condition_timeout, Duration::from_secs(1));
        assert_eq!(config.tree_cache_ttl, Duration::from_secs(60));
        assert_eq!(config.queue_prefix, "ci.q.");
        assert_eq!(config.job_expire, 100);
        assert_eq!(config.job_timeout, 200);
        assert_eq!(config.sweep_interval, Duration::from_secs(3));
        assert_eq!(config.workspace, PathBuf::from("/var/lib/pipewright"));
    }

    #[test]
    fn test_defaults_and_unknown_nodes() {
        let config = parse_engine_config("telemetry \"off\"\nengine { colour 3 }").unwrap();
        assert_eq!(config, EngineConfig::default());
    }

    #[test]
    fn test_wrong_type() {
        let result = parse_engine_config("engine { lock-timeout \"soon\" }");
        assert!(matches!(result, Err(ConfigError::InvalidValue { .. })));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pipewright.kdl");
        std::fs::write(&path, "engine { job-expire 42 }").unwrap();

        let config = load_engine_config(&path).unwrap();
        assert_eq!(config.job_expire, 42);
    }
}
