//! Cache of parsed trees keyed by flow name and YAML content.

use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tracing::debug;

use crate::{ConfigResult, NodeTree};

struct Entry {
    tree: Arc<NodeTree>,
    expires_at: Instant,
}

pub struct TreeCache {
    ttl: Duration,
    entries: Mutex<HashMap<String, Entry>>,
}

impl TreeCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Content hash used as the cache key.
    pub fn key(flow_name: &str, yaml: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(flow_name.as_bytes());
        hasher.update([0u8]);
        hasher.update(yaml.as_bytes());
        hex::encode(hasher.finalize())
    }

    /// Cached tree for this YAML, parsing it on a miss.
    pub fn get_or_parse(&self, flow_name: &str, yaml: &str) -> ConfigResult<Arc<NodeTree>> {
        let key = Self::key(flow_name, yaml);
        let now = Instant::now();

        {
            let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some(entry) = entries.get(&key).filter(|e| e.expires_at > now) {
                return Ok(entry.tree.clone());
            }
        }

        debug!(flow = %flow_name, key = %key, "parsing pipeline tree");
        let tree = Arc::new(NodeTree::from_yaml(flow_name, yaml)?);

        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.retain(|_, e| e.expires_at > now);
        entries.insert(
            key,
            Entry {
                tree: tree.clone(),
                expires_at: now + self.ttl,
            },
        );
        Ok(tree)
    }

    pub fn invalidate(&self, flow_name: &str, yaml: &str) {
        let key = Self::key(flow_name, yaml);
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&key);
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
