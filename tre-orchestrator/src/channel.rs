//! Message channel contract and a durable SQLite-backed queue
//!
//! Delivery is at-least-once. `receive` leases the oldest available message
//! for a fixed duration; a message that is not acknowledged before the lease
//! runs out becomes visible again and is redelivered. Messages that keep
//! coming back are dead-lettered once they exceed the delivery limit.

use crate::error::{OrchestratorError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

/// Outbound deployment operation requests
pub const RESOURCE_REQUEST_QUEUE: &str = "resource-requests";
/// Inbound deployment status reports
pub const DEPLOYMENT_STATUS_QUEUE: &str = "deployment-status";
/// Inbound airlock stage reports
pub const AIRLOCK_STATUS_QUEUE: &str = "airlock-status";

/// A leased message. Pass it back to `acknowledge` or `dead_letter`.
#[derive(Debug, Clone)]
pub struct ReceivedMessage {
    pub id: String,
    pub queue: String,
    pub body: String,
    /// Number of times this message has been handed out, this delivery included
    pub delivery_count: u32,
    pub enqueued_at: DateTime<Utc>,
    pub lock_token: String,
}

#[async_trait]
pub trait MessageChannel: Send + Sync {
    /// Enqueue a message. Fails with `ChannelUnavailable`.
    async fn send(&self, queue: &str, body: &str) -> Result<()>;

    /// Wait for and lease the next message of `queue`.
    async fn receive(&self, queue: &str) -> Result<ReceivedMessage>;

    /// Remove a processed message from the queue.
    async fn acknowledge(&self, message: &ReceivedMessage) -> Result<()>;

    /// Move a message that can never be processed out of the queue.
    async fn dead_letter(&self, message: &ReceivedMessage, reason: &str) -> Result<()>;
}

#[derive(Debug, Clone, Copy)]
pub struct ChannelOptions {
    /// How long a received message stays invisible to other receivers
    pub lease: Duration,
    /// Idle polling interval when no local `send` wakes the receiver
    pub poll_interval: Duration,
    /// Deliveries after which a message is dead-lettered instead of handed out
    pub max_delivery_count: u32,
}

impl Default for ChannelOptions {
    fn default() -> Self {
        Self {
            lease: Duration::from_secs(60),
            poll_interval: Duration::from_secs(1),
            max_delivery_count: 10,
        }
    }
}

fn unavailable(err: sqlx::Error) -> OrchestratorError {
    OrchestratorError::ChannelUnavailable(err.to_string())
}

#[derive(sqlx::FromRow)]
struct MessageRow {
    seq: i64,
    id: String,
    queue: String,
    body: String,
    enqueued_at: i64,
    delivery_count: i64,
}

#[derive(Clone)]
pub struct SqliteMessageChannel {
    pool: SqlitePool,
    options: ChannelOptions,
    wakeup: Arc<Notify>,
}

impl SqliteMessageChannel {
    pub fn new(pool: SqlitePool, options: ChannelOptions) -> Self {
        Self {
            pool,
            options,
            wakeup: Arc::new(Notify::new()),
        }
    }

    pub fn options(&self) -> &ChannelOptions {
        &self.options
    }

    /// Messages still in `queue`, leased or not
    pub async fn pending_count(&self, queue: &str) -> Result<u64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM messages WHERE queue = ?")
            .bind(queue)
            .fetch_one(&self.pool)
            .await
            .map_err(unavailable)?;
        Ok(count as u64)
    }

    /// Messages dead-lettered from `queue`
    pub async fn dead_letter_count(&self, queue: &str) -> Result<u64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM dead_letters WHERE queue = ?")
            .bind(queue)
            .fetch_one(&self.pool)
            .await
            .map_err(unavailable)?;
        Ok(count as u64)
    }

    /// Try to lease the oldest visible message of `queue` without waiting
    pub async fn try_receive(&self, queue: &str) -> Result<Option<ReceivedMessage>> {
        loop {
            let now = Utc::now().timestamp_millis();
            let row = sqlx::query_as::<_, MessageRow>(
                "SELECT seq, id, queue, body, enqueued_at, delivery_count FROM messages
                 WHERE queue = ? AND (locked_until IS NULL OR locked_until <= ?)
                 ORDER BY seq LIMIT 1",
            )
            .bind(queue)
            .bind(now)
            .fetch_optional(&self.pool)
            .await
            .map_err(unavailable)?;

            let Some(row) = row else {
                return Ok(None);
            };

            if row.delivery_count >= i64::from(self.options.max_delivery_count) {
                warn!(
                    message_id = %row.id,
                    queue,
                    delivery_count = row.delivery_count,
                    "Message exceeded max delivery count, dead-lettering"
                );
                self.move_to_dead_letters(
                    &row.id,
                    None,
                    "max delivery count exceeded",
                )
                .await?;
                continue;
            }

            let token = Uuid::new_v4().to_string();
            let lease_ms = i64::try_from(self.options.lease.as_millis()).unwrap_or(i64::MAX);
            let claimed = sqlx::query(
                "UPDATE messages
                 SET locked_until = ?, lock_token = ?, delivery_count = delivery_count + 1
                 WHERE seq = ? AND delivery_count = ?
                   AND (locked_until IS NULL OR locked_until <= ?)",
            )
            .bind(now.saturating_add(lease_ms))
            .bind(&token)
            .bind(row.seq)
            .bind(row.delivery_count)
            .bind(now)
            .execute(&self.pool)
            .await
            .map_err(unavailable)?;

            if claimed.rows_affected() == 0 {
                // Another receiver won the lease, look again
                continue;
            }

            return Ok(Some(ReceivedMessage {
                id: row.id,
                queue: row.queue,
                body: row.body,
                delivery_count: u32::try_from(row.delivery_count + 1).unwrap_or(u32::MAX),
                enqueued_at: DateTime::from_timestamp_millis(row.enqueued_at)
                    .unwrap_or_else(Utc::now),
                lock_token: token,
            }));
        }
    }

    async fn move_to_dead_letters(
        &self,
        message_id: &str,
        lock_token: Option<&str>,
        reason: &str,
    ) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(unavailable)?;

        let moved = sqlx::query(
            "INSERT INTO dead_letters
                 (id, queue, body, reason, delivery_count, enqueued_at, dead_lettered_at)
             SELECT id, queue, body, ?, delivery_count, enqueued_at, ?
             FROM messages WHERE id = ? AND (? IS NULL OR lock_token = ?)",
        )
        .bind(reason)
        .bind(Utc::now().timestamp_millis())
        .bind(message_id)
        .bind(lock_token)
        .bind(lock_token)
        .execute(&mut *tx)
        .await
        .map_err(unavailable)?;

        if moved.rows_affected() == 0 {
            tx.rollback().await.map_err(unavailable)?;
            return Err(OrchestratorError::ChannelUnavailable(format!(
                "lease on message {} was lost before it could be dead-lettered",
                message_id
            )));
        }

        sqlx::query("DELETE FROM messages WHERE id = ?")
            .bind(message_id)
            .execute(&mut *tx)
            .await
            .map_err(unavailable)?;
        tx.commit().await.map_err(unavailable)?;

        Ok(())
    }
}

#[async_trait]
impl MessageChannel for SqliteMessageChannel {
    #[instrument(skip(self, body))]
    async fn send(&self, queue: &str, body: &str) -> Result<()> {
        let id = Uuid::new_v4().to_string();

        sqlx::query("INSERT INTO messages (id, queue, body, enqueued_at) VALUES (?, ?, ?, ?)")
            .bind(&id)
            .bind(queue)
            .bind(body)
            .bind(Utc::now().timestamp_millis())
            .execute(&self.pool)
            .await
            .map_err(unavailable)?;

        debug!(message_id = %id, "Message enqueued");
        self.wakeup.notify_waiters();

        Ok(())
    }

    async fn receive(&self, queue: &str) -> Result<ReceivedMessage> {
        loop {
            // Register for wakeups before looking, so a send racing with the
            // lookup is not missed
            let notified = self.wakeup.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(message) = self.try_receive(queue).await? {
                return Ok(message);
            }

            tokio::select! {
                _ = notified => {}
                _ = tokio::time::sleep(self.options.poll_interval) => {}
            }
        }
    }

    async fn acknowledge(&self, message: &ReceivedMessage) -> Result<()> {
        let done = sqlx::query("DELETE FROM messages WHERE id = ? AND lock_token = ?")
            .bind(&message.id)
            .bind(&message.lock_token)
            .execute(&self.pool)
            .await
            .map_err(unavailable)?;

        if done.rows_affected() == 0 {
            return Err(OrchestratorError::ChannelUnavailable(format!(
                "lease on message {} expired before acknowledgement",
                message.id
            )));
        }

        Ok(())
    }

    async fn dead_letter(&self, message: &ReceivedMessage, reason: &str) -> Result<()> {
        self.move_to_dead_letters(&message.id, Some(&message.lock_token), reason)
            .await
    }
}
