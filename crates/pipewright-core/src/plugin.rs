//! Plugin definitions and typed inputs.

use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::LazyLock;

use crate::agent::DockerOption;
use crate::Result;

static INT_REGEX: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^[+-]?\d+$").unwrap());

static EMAIL_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}$").unwrap());

static HTTP_URL_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^https?://[^\s/$.?#][^\s]*$").unwrap());

// https, ssh and scp-like `git@host:owner/repo.git`
static GIT_URL_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^((https?|ssh|git)://[^\s]+|[A-Za-z0-9_.-]+@[A-Za-z0-9.-]+:[^\s]+)$").unwrap()
});

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VarType {
    #[default]
    String,
    Int,
    Bool,
    HttpUrl,
    GitUrl,
    Email,
}

impl VarType {
    pub fn is_valid(self, value: &str) -> bool {
        match self {
            VarType::String => true,
            VarType::Int => INT_REGEX.is_match(value),
            VarType::Bool => matches!(value.to_ascii_lowercase().as_str(), "true" | "false"),
            VarType::HttpUrl => HTTP_URL_REGEX.is_match(value),
            VarType::GitUrl => GIT_URL_REGEX.is_match(value),
            VarType::Email => EMAIL_REGEX.is_match(value),
        }
    }
}

/// A declared plugin input.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Input {
    pub name: String,
    #[serde(rename = "type", default)]
    pub var_type: VarType,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub value: Option<String>,
}

impl Input {
    /// Empty values pass unless the input is required.
    pub fn verify(&self, value: Option<&str>) -> bool {
        match value.filter(|v| !v.is_empty()) {
            None => !self.required,
            Some(v) => self.var_type.is_valid(v),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plugin {
    pub name: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub inputs: Vec<Input>,
    #[serde(default)]
    pub exports: Vec<String>,
    #[serde(default)]
    pub allow_failure: bool,
    #[serde(default)]
    pub docker: Option<DockerOption>,
    #[serde(default)]
    pub script: Option<String>,
    /// Plugin whose script this plugin builds on.
    #[serde(default)]
    pub parent: Option<String>,
}

impl Plugin {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: String::new(),
            inputs: Vec::new(),
            exports: Vec::new(),
            allow_failure: false,
            docker: None,
            script: None,
            parent: None,
        }
    }

    pub fn has_script(&self) -> bool {
        self.script.as_deref().is_some_and(|s| !s.trim().is_empty())
    }
}

#[async_trait]
pub trait PluginLookup: Send + Sync {
    /// Fails with [`crate::Error::NotFound`] for unknown plugins.
    async fn get(&self, name: &str) -> Result<Plugin>;
}
