//! Builds the command an agent runs for one step.

use pipewright_config::variables::interpolate_docker;
use pipewright_config::{Node, NodeTree};
use pipewright_core::agent::{DockerOption, ShellCmd};
use pipewright_core::job::Job;
use pipewright_core::plugin::{Input, Plugin, PluginLookup};
use pipewright_core::step::step_id;
use pipewright_core::vars::keys;
use pipewright_core::{Error, Vars};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::debug;

use crate::SmResult;

pub struct CommandBuilder {
    plugins: Arc<dyn PluginLookup>,
}

impl CommandBuilder {
    pub fn new(plugins: Arc<dyn PluginLookup>) -> Self {
        Self { plugins }
    }

    /// Build the command for `node`.
    ///
    /// Variables come from the node's lineage, nearest node winning, over
    /// the job context. Scripts run from the outermost ancestor down and
    /// exports accumulate along the way. Docker options are taken from the
    /// nearest node declaring any.
    pub async fn build(&self, job: &Job, tree: &NodeTree, node: &Node) -> SmResult<ShellCmd> {
        let lineage = tree.lineage(node);

        let mut inputs = Vars::new();
        for n in &lineage {
            inputs.merge(&n.attrs.envs, true);
        }
        inputs.merge(&job.context, false);

        let mut scripts: Vec<String> = lineage
            .iter()
            .filter_map(|n| n.attrs.bash.clone())
            .collect();

        let mut env_filters: Vec<String> = Vec::new();
        for n in &lineage {
            for export in &n.attrs.exports {
                if !env_filters.contains(export) {
                    env_filters.push(export.clone());
                }
            }
        }

        let mut dockers: Vec<DockerOption> = lineage
            .iter()
            .rev()
            .find(|n| !n.attrs.dockers.is_empty())
            .map(|n| n.attrs.dockers.clone())
            .unwrap_or_default();

        let mut allow_failure = node.attrs.allow_failure.unwrap_or(false);

        if let Some(name) = &node.attrs.plugin {
            let plugin = self.resolve(name).await?;
            fill_and_verify(&plugin, &mut inputs)?;

            if let Some(script) = &plugin.script {
                scripts.push(script.clone());
            }
            for export in &plugin.exports {
                if !env_filters.contains(export) {
                    env_filters.push(export.clone());
                }
            }
            allow_failure = node.attrs.allow_failure.unwrap_or(plugin.allow_failure);

            if let Some(docker) = &plugin.docker {
                dockers.retain(|d| !d.is_runtime);
                dockers.insert(
                    0,
                    DockerOption {
                        is_runtime: true,
                        ..docker.clone()
                    },
                );
            }
        }

        if inputs.get(keys::DOCKER_ENABLED) == Some("false") {
            dockers.clear();
        }
        let dockers = dockers.iter().map(|d| interpolate_docker(d, &inputs)).collect();

        let path = node.path_str();
        debug!(job_id = %job.id, path = %path, "command built");

        Ok(ShellCmd {
            id: step_id(job.id, &path),
            job_id: job.id,
            flow_id: job.flow_id,
            node_path: path,
            scripts,
            inputs,
            dockers,
            env_filters,
            allow_failure,
            plugin: node.attrs.plugin.clone(),
            timeout: node.attrs.timeout.unwrap_or(job.timeout),
        })
    }

    /// Look up `name` and fold in its parent chain. A plugin without its own
    /// script runs its parent's, and inputs declared along the chain are
    /// merged with the nearest declaration winning.
    async fn resolve(&self, name: &str) -> SmResult<Plugin> {
        let mut plugin = self.plugins.get(name).await?;
        let mut seen = HashSet::from([plugin.name.clone()]);
        let mut parent_name = plugin.parent.clone();

        while let Some(parent) = parent_name {
            if !seen.insert(parent.clone()) {
                return Err(Error::InvalidInput(format!(
                    "plugin {name} has a cyclic parent chain through {parent}"
                ))
                .into());
            }

            let parent = self.plugins.get(&parent).await?;
            if parent.parent.is_none() && !parent.has_script() {
                return Err(Error::NotAvailable(format!(
                    "parent plugin {} of {name} has no script",
                    parent.name
                ))
                .into());
            }

            if !plugin.has_script() {
                plugin.script = parent.script.clone();
            }
            for input in &parent.inputs {
                if !plugin.inputs.iter().any(|i| i.name == input.name) {
                    plugin.inputs.push(input.clone());
                }
            }
            for export in &parent.exports {
                if !plugin.exports.contains(export) {
                    plugin.exports.push(export.clone());
                }
            }
            if plugin.docker.is_none() {
                plugin.docker = parent.docker.clone();
            }
            parent_name = parent.parent.clone();
        }

        if !plugin.has_script() {
            return Err(Error::NotAvailable(format!("plugin {name} has no script")).into());
        }
        Ok(plugin)
    }
}

/// Fill empty inputs with plugin defaults, then check every declared input.
fn fill_and_verify(plugin: &Plugin, inputs: &mut Vars) -> SmResult<()> {
    for input in &plugin.inputs {
        if inputs.non_empty(&input.name).is_none() {
            if let Some(default) = &input.value {
                inputs.put(&input.name, default);
            }
        }
        verify_input(plugin, input, inputs)?;
    }
    Ok(())
}

fn verify_input(plugin: &Plugin, input: &Input, inputs: &Vars) -> SmResult<()> {
    let value = inputs.get(&input.name);
    if input.verify(value) {
        return Ok(());
    }
    Err(Error::Argument(format!(
        "Illegal input {} = {} for plugin {}",
        input.name,
        value.unwrap_or_default(),
        plugin.name
    ))
    .into())
}
