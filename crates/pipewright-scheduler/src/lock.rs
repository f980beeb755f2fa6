//! Per-job lock implementations.
//!
//! [`InMemoryLock`] serves single-process deployments and tests.
//! [`PgAdvisoryLock`] holds a PostgreSQL session advisory lock per path, so
//! any number of scheduler processes sharing a database exclude each other.

use async_trait::async_trait;
use pipewright_core::lock::{DistributedLock, LockHandle};
use pipewright_core::{Error, Result};
use sqlx::PgPool;
use sqlx::pool::PoolConnection;
use sqlx::postgres::Postgres;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::{Instant, sleep, timeout_at};
use tracing::{debug, warn};

const PG_RETRY_INTERVAL: Duration = Duration::from_millis(100);

pub struct InMemoryLock {
    held: Mutex<HashMap<String, u64>>,
    released: Notify,
    next_token: AtomicU64,
}

impl InMemoryLock {
    pub fn new() -> Self {
        Self {
            held: Mutex::new(HashMap::new()),
            released: Notify::new(),
            next_token: AtomicU64::new(1),
        }
    }

    fn try_lock(&self, path: &str) -> Option<LockHandle> {
        let mut held = self.held.lock().unwrap_or_else(PoisonError::into_inner);
        if held.contains_key(path) {
            return None;
        }
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        held.insert(path.to_string(), token);
        Some(LockHandle {
            path: path.to_string(),
            token,
        })
    }
}

impl Default for InMemoryLock {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DistributedLock for InMemoryLock {
    async fn lock(&self, path: &str, timeout: Duration) -> Result<Option<LockHandle>> {
        let deadline = Instant::now() + timeout;
        loop {
            // registered before the check so a release in between is not missed
            let released = self.released.notified();
            if let Some(handle) = self.try_lock(path) {
                debug!(path = %path, token = handle.token, "lock acquired");
                return Ok(Some(handle));
            }
            if timeout_at(deadline, released).await.is_err() {
                debug!(path = %path, "lock wait timed out");
                return Ok(None);
            }
        }
    }

    async fn release(&self, handle: LockHandle) -> Result<()> {
        {
            let mut held = self.held.lock().unwrap_or_else(PoisonError::into_inner);
            match held.get(&handle.path) {
                Some(&token) if token == handle.token => {
                    held.remove(&handle.path);
                }
                _ => {
                    warn!(path = %handle.path, token = handle.token, "releasing a lock that is not held");
                    return Ok(());
                }
            }
        }
        debug!(path = %handle.path, token = handle.token, "lock released");
        self.released.notify_waiters();
        Ok(())
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        let held = self.held.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(held.contains_key(path))
    }
}

/// Session advisory locks keyed by `hashtext(path)`. The connection that
/// took a lock is kept out of the pool until the lock is released.
pub struct PgAdvisoryLock {
    pool: PgPool,
    held: tokio::sync::Mutex<HashMap<u64, PoolConnection<Postgres>>>,
    next_token: AtomicU64,
}

impl PgAdvisoryLock {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            held: tokio::sync::Mutex::new(HashMap::new()),
            next_token: AtomicU64::new(1),
        }
    }
}

fn db_error(e: sqlx::Error) -> Error {
    Error::Internal(format!("lock database error: {e}"))
}

#[async_trait]
impl DistributedLock for PgAdvisoryLock {
    async fn lock(&self, path: &str, timeout: Duration) -> Result<Option<LockHandle>> {
        let deadline = Instant::now() + timeout;
        let mut conn = self.pool.acquire().await.map_err(db_error)?;

        loop {
            let locked: bool = sqlx::query_scalar("SELECT pg_try_advisory_lock(hashtext($1))")
                .bind(path)
                .fetch_one(&mut *conn)
                .await
                .map_err(db_error)?;

            if locked {
                let token = self.next_token.fetch_add(1, Ordering::Relaxed);
                self.held.lock().await.insert(token, conn);
                debug!(path = %path, token, "advisory lock acquired");
                return Ok(Some(LockHandle {
                    path: path.to_string(),
                    token,
                }));
            }
            if Instant::now() + PG_RETRY_INTERVAL > deadline {
                return Ok(None);
            }
            sleep(PG_RETRY_INTERVAL).await;
        }
    }

    async fn release(&self, handle: LockHandle) -> Result<()> {
        let Some(mut conn) = self.held.lock().await.remove(&handle.token) else {
            warn!(path = %handle.path, token = handle.token, "releasing a lock that is not held");
            return Ok(());
        };

        sqlx::query("SELECT pg_advisory_unlock(hashtext($1))")
            .bind(&handle.path)
            .execute(&mut *conn)
            .await
            .map_err(db_error)?;
        debug!(path = %handle.path, token = handle.token, "advisory lock released");
        Ok(())
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        let mut conn = self.pool.acquire().await.map_err(db_error)?;
        let free: bool = sqlx::query_scalar("SELECT pg_try_advisory_lock(hashtext($1))")
            .bind(path)
            .fetch_one(&mut *conn)
            .await
            .map_err(db_error)?;

        if free {
            sqlx::query("SELECT pg_advisory_unlock(hashtext($1))")
                .bind(path)
                .execute(&mut *conn)
                .await
                .map_err(db_error)?;
        }
        Ok(!free)
    }
}
