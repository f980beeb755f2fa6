//! Ordered string variable map shared by jobs, steps and commands.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Well-known variable names written into a job context.
pub mod keys {
    pub const JOB_STATUS: &str = "PIPEWRIGHT_JOB_STATUS";
    pub const JOB_ERROR: &str = "PIPEWRIGHT_JOB_ERROR";
    pub const JOB_START_AT: &str = "PIPEWRIGHT_JOB_START_AT";
    pub const JOB_FINISH_AT: &str = "PIPEWRIGHT_JOB_FINISH_AT";
    pub const JOB_STEPS: &str = "PIPEWRIGHT_JOB_STEPS";
    pub const JOB_BUILD_NUMBER: &str = "PIPEWRIGHT_JOB_BUILD_NUMBER";
    pub const FLOW_NAME: &str = "PIPEWRIGHT_FLOW_NAME";
    pub const GIT_URL: &str = "PIPEWRIGHT_GIT_URL";
    pub const GIT_BRANCH: &str = "PIPEWRIGHT_GIT_BRANCH";
    pub const GIT_CREDENTIAL: &str = "PIPEWRIGHT_GIT_CREDENTIAL";
    pub const DOCKER_ENABLED: &str = "PIPEWRIGHT_DOCKER_ENABLED";
}

/// String-keyed variables with deterministic iteration order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Vars(BTreeMap<String, String>);

impl Vars {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn put(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn remove(&mut self, key: &str) -> Option<String> {
        self.0.remove(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    /// Value for `key`, treating empty strings as absent.
    pub fn non_empty(&self, key: &str) -> Option<&str> {
        self.get(key).filter(|v| !v.is_empty())
    }

    /// Copy every entry of `other` into this map. Existing keys are only
    /// replaced when `overwrite` is set.
    pub fn merge(&mut self, other: &Vars, overwrite: bool) {
        for (key, value) in other.iter() {
            if overwrite || !self.0.contains_key(key) {
                self.0.insert(key.to_string(), value.to_string());
            }
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Vars {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(
            iter.into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }
}

impl From<BTreeMap<String, String>> for Vars {
    fn from(map: BTreeMap<String, String>) -> Self {
        Self(map)
    }
}
