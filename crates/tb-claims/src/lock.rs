//! Distributed per-message lock.
//!
//! `SET NX PX` with a unique owner token for acquisition, Lua
//! compare-and-delete for release. The lease auto-expires if the holder
//! dies, and waiting for the lock is bounded at twice the lease.

use std::time::{Duration, Instant};

use redis::aio::ConnectionManager;
use tracing::{debug, error};
use uuid::Uuid;

use crate::{ClaimError, Result};

const ACQUIRE_RETRY_INTERVAL: Duration = Duration::from_millis(100);

const RELEASE_SCRIPT: &str = r#"
    if redis.call("GET", KEYS[1]) == ARGV[1] then
        redis.call("DEL", KEYS[1])
        return 1
    else
        return 0
    end
"#;

#[derive(Clone)]
pub struct MessageLock {
    conn: ConnectionManager,
    lease: Duration,
}

impl MessageLock {
    pub fn new(conn: ConnectionManager, lease: Duration) -> Self {
        Self { conn, lease }
    }

    /// Acquire the exclusive lock for `message_id`, waiting up to twice the
    /// lease before giving up.
    pub async fn acquire(&self, message_id: &str) -> Result<LockGuard> {
        let key = format!("msglock:{message_id}");
        let token = Uuid::new_v4().to_string();
        let deadline = Instant::now() + self.lease * 2;

        loop {
            let mut conn = self.conn.clone();
            let result: Option<String> = redis::cmd("SET")
                .arg(&key)
                .arg(&token)
                .arg("NX")
                .arg("PX")
                .arg(self.lease.as_millis() as u64)
                .query_async(&mut conn)
                .await?;

            if result.is_some() {
                debug!(key = %key, "Acquired message lock");
                return Ok(LockGuard {
                    conn: self.conn.clone(),
                    key,
                    token,
                });
            }

            if Instant::now() >= deadline {
                return Err(ClaimError::LockTimeout(message_id.to_string()));
            }
            tokio::time::sleep(ACQUIRE_RETRY_INTERVAL).await;
        }
    }
}

/// Held lock. Call [`LockGuard::release`] on every exit path; if the holder
/// dies without releasing, the lease expires on its own.
pub struct LockGuard {
    conn: ConnectionManager,
    key: String,
    token: String,
}

impl LockGuard {
    /// Release the lock if we still own it. Failures are logged rather than
    /// surfaced: the lease bounds how long a stuck lock can live.
    pub async fn release(mut self) {
        match redis::Script::new(RELEASE_SCRIPT)
            .key(&self.key)
            .arg(&self.token)
            .invoke_async::<i32>(&mut self.conn)
            .await
        {
            Ok(1) => debug!(key = %self.key, "Released message lock"),
            Ok(_) => debug!(key = %self.key, "Message lock already expired"),
            Err(e) => error!(key = %self.key, error = %e, "Failed to release message lock"),
        }
    }
}
