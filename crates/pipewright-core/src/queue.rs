//! Durable hand-off of created jobs to dispatch workers.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::Result;

#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Enqueue `payload`. Higher priorities are claimed first; entries past
    /// `expire_at` are never handed out.
    async fn send(
        &self,
        queue: &str,
        payload: Vec<u8>,
        priority: u8,
        expire_at: DateTime<Utc>,
    ) -> Result<()>;

    /// Take the next payload from `queue`, if any.
    async fn claim(&self, queue: &str) -> Result<Option<Vec<u8>>>;
}
