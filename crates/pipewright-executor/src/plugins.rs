//! In-memory plugin registry.

use async_trait::async_trait;
use pipewright_core::plugin::{Plugin, PluginLookup};
use pipewright_core::{Error, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use tokio::sync::RwLock;
use tracing::debug;

/// Either a single plugin document or a list of them.
#[derive(Deserialize)]
#[serde(untagged)]
enum PluginDocument {
    Many(Vec<Plugin>),
    One(Box<Plugin>),
}

#[derive(Default)]
pub struct InMemoryPluginRegistry {
    plugins: RwLock<HashMap<String, Plugin>>,
}

impl InMemoryPluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a plugin by name.
    pub async fn register(&self, plugin: Plugin) {
        debug!(plugin = %plugin.name, "plugin registered");
        self.plugins.write().await.insert(plugin.name.clone(), plugin);
    }

    /// Register plugins from YAML holding one plugin or a list of plugins.
    /// Returns how many were registered.
    pub async fn load_yaml(&self, yaml: &str) -> Result<usize> {
        let document: PluginDocument = serde_yml::from_str(yaml)
            .map_err(|e| Error::InvalidInput(format!("invalid plugin yaml: {e}")))?;
        let plugins = match document {
            PluginDocument::Many(plugins) => plugins,
            PluginDocument::One(plugin) => vec![*plugin],
        };

        let count = plugins.len();
        for plugin in plugins {
            if plugin.name.trim().is_empty() {
                return Err(Error::InvalidInput("plugin name is empty".to_string()));
            }
            self.register(plugin).await;
        }
        Ok(count)
    }

    pub async fn load_file(&self, path: &Path) -> Result<usize> {
        let yaml = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| Error::NotFound(format!("{}: {e}", path.display())))?;
        self.load_yaml(&yaml).await
    }

    pub async fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.plugins.read().await.keys().cloned().collect();
        names.sort();
        names
    }
}

#[async_trait]
impl PluginLookup for InMemoryPluginRegistry {
    async fn get(&self, name: &str) -> Result<Plugin> {
        self.plugins
            .read()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("plugin {name}")))
    }
}
