//! Open-conversation registry.
//!
//! Each open conversation is one member of an ordered set, keyed by the user
//! address and scored by the Unix time the claim was last extended. The claim
//! token itself is never stored: its presence gates the write, and the
//! address alone is enough to synthesize the session-close message later.

use redis::aio::ConnectionManager;
use tracing::debug;

use crate::Result;

const CLAIMS_KEY: &str = "claims";

#[derive(Clone)]
pub struct ClaimRegistry {
    conn: ConnectionManager,
    key: String,
}

impl ClaimRegistry {
    pub fn new(conn: ConnectionManager) -> Self {
        Self::with_key(conn, CLAIMS_KEY)
    }

    /// Use a non-default set name. Intended for tests sharing one store.
    pub fn with_key(conn: ConnectionManager, key: impl Into<String>) -> Self {
        Self {
            conn,
            key: key.into(),
        }
    }

    /// Upsert the claim for `address`, stamping it with the current time.
    /// A `None` claim is a no-op: the message did not carry a claim token.
    pub async fn store(&self, claim: Option<&str>, address: &str) -> Result<()> {
        if claim.is_none() {
            return Ok(());
        }
        let now = chrono::Utc::now().timestamp();
        let mut conn = self.conn.clone();
        redis::cmd("ZADD")
            .arg(&self.key)
            .arg(now)
            .arg(address)
            .query_async::<()>(&mut conn)
            .await?;
        debug!(address = %address, "Stored conversation claim");
        Ok(())
    }

    /// Drop the claim for `address`. A `None` claim is a no-op.
    pub async fn delete(&self, claim: Option<&str>, address: &str) -> Result<()> {
        if claim.is_none() {
            return Ok(());
        }
        let mut conn = self.conn.clone();
        redis::cmd("ZREM")
            .arg(&self.key)
            .arg(address)
            .query_async::<()>(&mut conn)
            .await?;
        debug!(address = %address, "Released conversation claim");
        Ok(())
    }

    /// Return and remove every address whose score is `<= cutoff`.
    ///
    /// Fetch and removal run in one MULTI/EXEC transaction: several bridge
    /// processes sweep the same set, and each expired address must be
    /// returned to exactly one of them.
    pub async fn scan_expired(&self, cutoff: i64) -> Result<Vec<String>> {
        let mut conn = self.conn.clone();
        let (addresses, _removed): (Vec<String>, i64) = redis::pipe()
            .atomic()
            .cmd("ZRANGEBYSCORE")
            .arg(&self.key)
            .arg("-inf")
            .arg(cutoff)
            .cmd("ZREMRANGEBYSCORE")
            .arg(&self.key)
            .arg("-inf")
            .arg(cutoff)
            .query_async(&mut conn)
            .await?;
        Ok(addresses)
    }
}
