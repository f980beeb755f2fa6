//! Pipeline YAML parsing.
//!
//! ```yaml
//! envs:
//!   GREETING: hello
//! steps:
//!   - name: build
//!     bash: echo $GREETING
//!   - parallel:
//!       unit:
//!         steps:
//!           - bash: make test
//!       lint:
//!         steps:
//!           - plugin: clippy
//!   - name: notify
//!     final: true
//!     bash: ./notify.sh
//! ```

use pipewright_core::Vars;
use pipewright_core::agent::DockerOption;
use serde::Deserialize;
use serde_yml::{Mapping, Value};
use std::collections::BTreeMap;

use crate::node::{NodeAttrs, NodeDef, NodeKind};
use crate::path::validate_name;
use crate::{ConfigError, ConfigResult};

const DEFAULT_STEP_PREFIX: &str = "step-";
const DEFAULT_PARALLEL_PREFIX: &str = "parallel-";

#[derive(Debug, Default, Deserialize)]
struct FlowYml {
    #[serde(default)]
    envs: BTreeMap<String, Value>,
    #[serde(default)]
    condition: Option<String>,
    #[serde(default)]
    docker: Option<DockerOption>,
    #[serde(default)]
    dockers: Option<Vec<DockerOption>>,
    #[serde(default)]
    steps: Vec<StepYml>,
}

#[derive(Debug, Default, Deserialize)]
struct StepYml {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    envs: BTreeMap<String, Value>,
    #[serde(default)]
    condition: Option<String>,
    #[serde(default)]
    allow_failure: Option<bool>,
    #[serde(default)]
    bash: Option<String>,
    /// Older spelling of `bash`.
    #[serde(default)]
    script: Option<String>,
    #[serde(default)]
    plugin: Option<String>,
    #[serde(default)]
    exports: Vec<String>,
    #[serde(default)]
    timeout: Option<u32>,
    #[serde(default, rename = "final")]
    is_final: Option<bool>,
    #[serde(default)]
    docker: Option<DockerOption>,
    #[serde(default)]
    dockers: Option<Vec<DockerOption>>,
    #[serde(default)]
    steps: Option<Vec<StepYml>>,
    #[serde(default)]
    parallel: Option<Mapping>,
}

impl StepYml {
    fn has_step_fields(&self) -> bool {
        self.name.is_some()
            || !self.envs.is_empty()
            || self.condition.is_some()
            || self.allow_failure.is_some()
            || self.bash.is_some()
            || self.script.is_some()
            || self.plugin.is_some()
            || !self.exports.is_empty()
            || self.timeout.is_some()
            || self.is_final.is_some()
            || self.docker.is_some()
            || self.dockers.is_some()
            || self.steps.is_some()
    }
}

/// Parse pipeline YAML into a node definition rooted at `flow_name`.
pub fn parse(flow_name: &str, yaml: &str) -> ConfigResult<NodeDef> {
    let flow: FlowYml = serde_yml::from_str(yaml)?;
    validate_name(flow_name)?;

    if flow.steps.is_empty() {
        return Err(ConfigError::MissingField("steps".to_string()));
    }

    let mut root = NodeDef::new(flow_name, NodeKind::Flow);
    root.attrs.envs = to_vars(&flow.envs, "envs")?;
    root.attrs.condition = non_blank(flow.condition);
    root.attrs.dockers = to_dockers(flow.docker, flow.dockers, flow_name)?;
    root.children = parse_steps(flow.steps)?;
    Ok(root)
}

fn parse_steps(steps: Vec<StepYml>) -> ConfigResult<Vec<NodeDef>> {
    let mut nodes: Vec<NodeDef> = Vec::with_capacity(steps.len());

    for (i, step) in steps.into_iter().enumerate() {
        let node = if step.parallel.is_some() {
            parse_parallel(step, i + 1)?
        } else {
            parse_step(step, i + 1)?
        };

        if nodes.iter().any(|n| n.name == node.name) {
            return Err(ConfigError::Duplicate(format!("step name '{}'", node.name)));
        }
        nodes.push(node);
    }

    Ok(nodes)
}

fn parse_step(step: StepYml, position: usize) -> ConfigResult<NodeDef> {
    let name = step
        .name
        .clone()
        .unwrap_or_else(|| format!("{DEFAULT_STEP_PREFIX}{position}"));
    validate_name(&name)?;

    let bash = match (step.bash, step.script) {
        (Some(_), Some(_)) => {
            return Err(ConfigError::InvalidValue {
                field: format!("{name}.script"),
                message: "use either 'bash' or 'script', not both".to_string(),
            });
        }
        (bash, script) => non_blank(bash.or(script)),
    };

    let children = match step.steps {
        Some(steps) if !steps.is_empty() => parse_steps(steps)?,
        _ => Vec::new(),
    };

    if step.plugin.is_some() && !children.is_empty() {
        return Err(ConfigError::InvalidValue {
            field: format!("{name}.plugin"),
            message: "a step with nested steps cannot use a plugin".to_string(),
        });
    }
    if children.is_empty() && bash.is_none() && step.plugin.is_none() {
        return Err(ConfigError::MissingField(format!("bash or plugin for step '{name}'")));
    }

    let mut node = NodeDef::new(name.clone(), NodeKind::Step);
    node.attrs = NodeAttrs {
        condition: non_blank(step.condition),
        envs: to_vars(&step.envs, &format!("{name}.envs"))?,
        bash,
        plugin: step.plugin,
        allow_failure: step.allow_failure,
        exports: step.exports,
        dockers: to_dockers(step.docker, step.dockers, &name)?,
        is_final: step.is_final.unwrap_or(false),
        timeout: step.timeout,
    };
    node.children = children;
    Ok(node)
}

fn parse_parallel(step: StepYml, position: usize) -> ConfigResult<NodeDef> {
    let name = format!("{DEFAULT_PARALLEL_PREFIX}{position}");
    if step.has_step_fields() {
        return Err(ConfigError::InvalidValue {
            field: name,
            message: "a parallel section cannot declare other fields".to_string(),
        });
    }

    let branches = step.parallel.unwrap_or_default();
    if branches.is_empty() {
        return Err(ConfigError::MissingField(format!("branches of '{name}'")));
    }

    let mut node = NodeDef::new(name.clone(), NodeKind::Parallel);
    for (key, value) in branches {
        let branch_name = key
            .as_str()
            .ok_or_else(|| ConfigError::InvalidValue {
                field: name.clone(),
                message: "branch names must be strings".to_string(),
            })?
            .to_string();
        validate_name(&branch_name)?;

        let flow: FlowYml = serde_yml::from_value(value)?;
        if flow.steps.is_empty() {
            return Err(ConfigError::MissingField(format!("steps of branch '{branch_name}'")));
        }

        let mut branch = NodeDef::new(branch_name.clone(), NodeKind::Branch);
        branch.attrs.envs = to_vars(&flow.envs, &format!("{branch_name}.envs"))?;
        branch.attrs.condition = non_blank(flow.condition);
        branch.attrs.dockers = to_dockers(flow.docker, flow.dockers, &branch_name)?;
        branch.children = parse_steps(flow.steps)?;
        node.children.push(branch);
    }

    Ok(node)
}

fn to_vars(envs: &BTreeMap<String, Value>, field: &str) -> ConfigResult<Vars> {
    let mut vars = Vars::new();
    for (key, value) in envs {
        let text = match value {
            Value::String(s) => s.clone(),
            Value::Bool(b) => b.to_string(),
            Value::Number(n) => n.to_string(),
            Value::Null => String::new(),
            _ => {
                return Err(ConfigError::InvalidValue {
                    field: format!("{field}.{key}"),
                    message: "env values must be scalars".to_string(),
                });
            }
        };
        vars.put(key.clone(), text);
    }
    Ok(vars)
}

/// Exactly one docker option runs the step script; a lone option is it.
fn to_dockers(
    docker: Option<DockerOption>,
    dockers: Option<Vec<DockerOption>>,
    owner: &str,
) -> ConfigResult<Vec<DockerOption>> {
    let mut options = match (docker, dockers) {
        (Some(_), Some(_)) => {
            return Err(ConfigError::InvalidValue {
                field: format!("{owner}.dockers"),
                message: "use either 'docker' or 'dockers', not both".to_string(),
            });
        }
        (Some(single), None) => vec![single],
        (None, Some(many)) => many,
        (None, None) => return Ok(Vec::new()),
    };

    if options.len() == 1 {
        options[0].is_runtime = true;
    }

    let runtimes = options.iter().filter(|d| d.is_runtime).count();
    if !options.is_empty() && runtimes != 1 {
        return Err(ConfigError::InvalidValue {
            field: format!("{owner}.dockers"),
            message: format!("exactly one runtime docker is required, found {runtimes}"),
        });
    }
    if let Some(blank) = options.iter().find(|d| d.image.trim().is_empty()) {
        return Err(ConfigError::InvalidValue {
            field: format!("{owner}.dockers"),
            message: format!("docker image is empty (name: {:?})", blank.name),
        });
    }

    Ok(options)
}

fn non_blank(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}
