//! Per-message-id dedup markers with a TTL equal to the deduplication window.

use std::time::Duration;

use redis::aio::ConnectionManager;

use crate::Result;

#[derive(Clone)]
pub struct SeenMarkers {
    conn: ConnectionManager,
    window: Duration,
}

impl SeenMarkers {
    pub fn new(conn: ConnectionManager, window: Duration) -> Self {
        Self { conn, window }
    }

    pub async fn is_seen(&self, message_id: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        let exists: i32 = redis::cmd("EXISTS")
            .arg(format!("msgseen:{message_id}"))
            .query_async(&mut conn)
            .await?;
        Ok(exists == 1)
    }

    pub async fn mark_seen(&self, message_id: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        redis::cmd("SET")
            .arg(format!("msgseen:{message_id}"))
            .arg("1")
            .arg("EX")
            .arg(self.window.as_secs().max(1))
            .query_async::<()>(&mut conn)
            .await?;
        Ok(())
    }
}
