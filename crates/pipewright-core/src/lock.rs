//! Per-job mutual exclusion.

use async_trait::async_trait;
use std::time::Duration;

use crate::Result;

/// Proof of a held lock, handed back to [`DistributedLock::release`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockHandle {
    pub path: String,
    pub token: u64,
}

#[async_trait]
pub trait DistributedLock: Send + Sync {
    /// Wait up to `timeout` for the lock at `path`. `None` means another
    /// holder kept it for the whole wait.
    async fn lock(&self, path: &str, timeout: Duration) -> Result<Option<LockHandle>>;

    async fn release(&self, handle: LockHandle) -> Result<()>;

    /// Whether anyone currently holds the lock at `path`.
    async fn exists(&self, path: &str) -> Result<bool>;
}
