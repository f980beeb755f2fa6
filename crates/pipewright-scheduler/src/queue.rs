//! Job queue implementations.
//!
//! Entries are claimed highest priority first, FIFO within a priority, and
//! entries past their expiry are never handed out.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use pipewright_core::queue::JobQueue;
use pipewright_core::{Error, Result};
use sqlx::PgPool;
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::sync::atomic::{self, AtomicU64};
use std::sync::{Mutex, PoisonError};
use tracing::{debug, trace};

#[derive(Debug)]
struct Entry {
    priority: u8,
    seq: u64,
    expire_at: DateTime<Utc>,
    payload: Vec<u8>,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    // max-heap: higher priority first, then lower sequence number
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

pub struct InMemoryJobQueue {
    queues: Mutex<HashMap<String, BinaryHeap<Entry>>>,
    seq: AtomicU64,
}

impl InMemoryJobQueue {
    pub fn new() -> Self {
        Self {
            queues: Mutex::new(HashMap::new()),
            seq: AtomicU64::new(0),
        }
    }

    /// Entries waiting in `queue`, expired ones included.
    pub fn len(&self, queue: &str) -> usize {
        let queues = self.queues.lock().unwrap_or_else(PoisonError::into_inner);
        queues.get(queue).map_or(0, BinaryHeap::len)
    }
}

impl Default for InMemoryJobQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl JobQueue for InMemoryJobQueue {
    async fn send(
        &self,
        queue: &str,
        payload: Vec<u8>,
        priority: u8,
        expire_at: DateTime<Utc>,
    ) -> Result<()> {
        let seq = self.seq.fetch_add(1, atomic::Ordering::Relaxed);
        let mut queues = self.queues.lock().unwrap_or_else(PoisonError::into_inner);
        queues.entry(queue.to_string()).or_default().push(Entry {
            priority,
            seq,
            expire_at,
            payload,
        });
        trace!(queue = %queue, priority, "message queued");
        Ok(())
    }

    async fn claim(&self, queue: &str) -> Result<Option<Vec<u8>>> {
        let now = Utc::now();
        let mut queues = self.queues.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(heap) = queues.get_mut(queue) else {
            return Ok(None);
        };

        while let Some(entry) = heap.pop() {
            if entry.expire_at > now {
                return Ok(Some(entry.payload));
            }
            debug!(queue = %queue, "dropping expired message");
        }
        Ok(None)
    }
}

/// Job queue backed by PostgreSQL.
///
/// Uses `FOR UPDATE SKIP LOCKED` so any number of workers can claim from
/// the same table without contention.
pub struct PgJobQueue {
    pool: PgPool,
}

fn db_error(e: sqlx::Error) -> Error {
    Error::Internal(format!("queue database error: {e}"))
}

impl PgJobQueue {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Create the queue table if it does not exist.
    pub async fn ensure_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS job_queue (
                seq BIGSERIAL PRIMARY KEY,
                queue TEXT NOT NULL,
                payload BYTEA NOT NULL,
                priority INTEGER NOT NULL,
                status TEXT NOT NULL DEFAULT 'pending',
                expire_at TIMESTAMPTZ NOT NULL,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                claimed_at TIMESTAMPTZ
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(db_error)?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS job_queue_claim_idx ON job_queue (queue, status, priority DESC, seq)",
        )
        .execute(&self.pool)
        .await
        .map_err(db_error)?;
        Ok(())
    }

    /// Delete claimed and expired entries. Returns the number removed.
    pub async fn purge(&self) -> Result<u64> {
        let result =
            sqlx::query("DELETE FROM job_queue WHERE status = 'claimed' OR expire_at <= NOW()")
                .execute(&self.pool)
                .await
                .map_err(db_error)?;
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl JobQueue for PgJobQueue {
    async fn send(
        &self,
        queue: &str,
        payload: Vec<u8>,
        priority: u8,
        expire_at: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO job_queue (queue, payload, priority, status, expire_at, created_at)
            VALUES ($1, $2, $3, 'pending', $4, NOW())
            "#,
        )
        .bind(queue)
        .bind(payload)
        .bind(i32::from(priority))
        .bind(expire_at)
        .execute(&self.pool)
        .await
        .map_err(db_error)?;
        Ok(())
    }

    async fn claim(&self, queue: &str) -> Result<Option<Vec<u8>>> {
        let payload: Option<Vec<u8>> = sqlx::query_scalar(
            r#"
            UPDATE job_queue
            SET status = 'claimed', claimed_at = NOW()
            WHERE seq = (
                SELECT seq FROM job_queue
                WHERE queue = $1 AND status = 'pending' AND expire_at > NOW()
                ORDER BY priority DESC, seq ASC
                FOR UPDATE SKIP LOCKED
                LIMIT 1
            )
            RETURNING payload
            "#,
        )
        .bind(queue)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error)?;
        Ok(payload)
    }
}
