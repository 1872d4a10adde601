//! SQLite-backed message store.
//!
//! One table keyed by (message id, queue name); delivery status is derived
//! from the acknowledged/abandoned timestamp columns. Headers travel in
//! their wire form, the sender identity as base64.

use crate::error::BusError;
use crate::message::{
    HeaderMap, Message, MessageId, QueueName, QueuedMessage, SenderIdentity, Timestamp,
};
use crate::store::MessageStore;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::str::FromStr;

#[cfg(test)]
#[path = "sqlite_tests.rs"]
mod tests;

const SCHEMA: &str = "\
CREATE TABLE IF NOT EXISTS bus_messages (
    message_id      TEXT NOT NULL,
    queue_name      TEXT NOT NULL,
    attempt_count   INTEGER NOT NULL DEFAULT 0,
    enqueued_at     TEXT NOT NULL,
    acknowledged_at TEXT NULL,
    abandoned_at    TEXT NULL,
    headers         TEXT NOT NULL,
    content         TEXT NOT NULL,
    sender          TEXT NOT NULL,
    PRIMARY KEY (message_id, queue_name)
);
CREATE INDEX IF NOT EXISTS idx_bus_messages_queue_status
    ON bus_messages (queue_name, acknowledged_at, abandoned_at);
";

/// Row shape for `bus_messages`
#[derive(Debug, sqlx::FromRow)]
struct MessageRow {
    message_id: String,
    attempt_count: i64,
    enqueued_at: DateTime<Utc>,
    acknowledged_at: Option<DateTime<Utc>>,
    abandoned_at: Option<DateTime<Utc>>,
    headers: String,
    content: String,
    sender: String,
}

impl MessageRow {
    fn into_queued_message(self) -> Result<QueuedMessage, BusError> {
        let headers = HeaderMap::parse(&self.headers)?;
        let id = MessageId::from_str(&self.message_id)?;
        let sender = SenderIdentity::from_base64(&self.sender)?;
        Ok(QueuedMessage {
            id,
            message: Message {
                headers,
                content: self.content,
            },
            sender,
            attempt_count: self.attempt_count as u32,
            enqueued_at: Timestamp::from_datetime(self.enqueued_at),
            acknowledged_at: self.acknowledged_at.map(Timestamp::from_datetime),
            abandoned_at: self.abandoned_at.map(Timestamp::from_datetime),
        })
    }
}

/// [`MessageStore`] over a SQLite database
pub struct SqliteMessageStore {
    pool: SqlitePool,
}

impl SqliteMessageStore {
    /// Connect eagerly and create the schema
    pub async fn connect(url: &str) -> Result<Self, BusError> {
        let options = SqliteConnectOptions::from_str(url)?.create_if_missing(true);
        let pool = SqlitePoolOptions::new().connect_with(options).await?;
        let store = Self { pool };
        store.ensure_schema().await?;
        Ok(store)
    }

    /// Connect lazily: the pool opens on first use, the schema is created by
    /// the first `declare_queue`. Suits synchronous provider factories.
    pub fn connect_lazy(url: &str) -> Result<Self, BusError> {
        let options = SqliteConnectOptions::from_str(url)?.create_if_missing(true);
        let pool = SqlitePoolOptions::new().connect_lazy_with(options);
        Ok(Self { pool })
    }

    async fn ensure_schema(&self) -> Result<(), BusError> {
        for statement in SCHEMA.split(';').filter(|s| !s.trim().is_empty()) {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl MessageStore for SqliteMessageStore {
    async fn declare_queue(&self, _queue: &QueueName) -> Result<(), BusError> {
        // Queues share one table; declaring ensures the schema exists.
        self.ensure_schema().await
    }

    async fn remove_queue(&self, queue: &QueueName) -> Result<(), BusError> {
        sqlx::query("DELETE FROM bus_messages WHERE queue_name = ?1")
            .bind(queue.as_str())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn insert(&self, queue: &QueueName, message: &QueuedMessage) -> Result<(), BusError> {
        sqlx::query(
            "INSERT INTO bus_messages \
             (message_id, queue_name, attempt_count, enqueued_at, acknowledged_at, \
              abandoned_at, headers, content, sender) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        )
        .bind(message.id.as_str())
        .bind(queue.as_str())
        .bind(message.attempt_count as i64)
        .bind(message.enqueued_at.as_datetime())
        .bind(message.acknowledged_at.map(|t| t.as_datetime()))
        .bind(message.abandoned_at.map(|t| t.as_datetime()))
        .bind(message.message.headers.to_wire_string())
        .bind(message.message.content.as_str())
        .bind(message.sender.to_base64())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn select_pending(
        &self,
        queue: &QueueName,
        limit: u32,
    ) -> Result<Vec<QueuedMessage>, BusError> {
        let rows = sqlx::query_as::<_, MessageRow>(
            "SELECT message_id, attempt_count, enqueued_at, acknowledged_at, \
                    abandoned_at, headers, content, sender \
             FROM bus_messages \
             WHERE queue_name = ?1 AND acknowledged_at IS NULL AND abandoned_at IS NULL \
             ORDER BY enqueued_at ASC \
             LIMIT ?2",
        )
        .bind(queue.as_str())
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(MessageRow::into_queued_message)
            .collect()
    }

    async fn update_attempt_count(
        &self,
        queue: &QueueName,
        id: &MessageId,
        attempt_count: u32,
    ) -> Result<(), BusError> {
        let result = sqlx::query(
            "UPDATE bus_messages SET attempt_count = ?1 \
             WHERE message_id = ?2 AND queue_name = ?3",
        )
        .bind(attempt_count as i64)
        .bind(id.as_str())
        .bind(queue.as_str())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(BusError::MessageNotFound {
                message_id: id.to_string(),
                queue_name: queue.to_string(),
            });
        }
        Ok(())
    }

    async fn mark_acknowledged(
        &self,
        queue: &QueueName,
        id: &MessageId,
        at: Timestamp,
        attempt_count: u32,
    ) -> Result<(), BusError> {
        let result = sqlx::query(
            "UPDATE bus_messages SET acknowledged_at = ?1, attempt_count = ?2 \
             WHERE message_id = ?3 AND queue_name = ?4 AND abandoned_at IS NULL",
        )
        .bind(at.as_datetime())
        .bind(attempt_count as i64)
        .bind(id.as_str())
        .bind(queue.as_str())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(BusError::MessageNotFound {
                message_id: id.to_string(),
                queue_name: queue.to_string(),
            });
        }
        Ok(())
    }

    async fn mark_abandoned(
        &self,
        queue: &QueueName,
        id: &MessageId,
        at: Timestamp,
        attempt_count: u32,
    ) -> Result<(), BusError> {
        let result = sqlx::query(
            "UPDATE bus_messages SET abandoned_at = ?1, attempt_count = ?2 \
             WHERE message_id = ?3 AND queue_name = ?4 AND acknowledged_at IS NULL",
        )
        .bind(at.as_datetime())
        .bind(attempt_count as i64)
        .bind(id.as_str())
        .bind(queue.as_str())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(BusError::MessageNotFound {
                message_id: id.to_string(),
                queue_name: queue.to_string(),
            });
        }
        Ok(())
    }

    async fn delete(&self, queue: &QueueName, id: &MessageId) -> Result<(), BusError> {
        sqlx::query("DELETE FROM bus_messages WHERE message_id = ?1 AND queue_name = ?2")
            .bind(id.as_str())
            .bind(queue.as_str())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn select_abandoned(&self, queue: &QueueName) -> Result<Vec<QueuedMessage>, BusError> {
        // No date window: dead letters stay visible regardless of age.
        let rows = sqlx::query_as::<_, MessageRow>(
            "SELECT message_id, attempt_count, enqueued_at, acknowledged_at, \
                    abandoned_at, headers, content, sender \
             FROM bus_messages \
             WHERE queue_name = ?1 AND abandoned_at IS NOT NULL \
             ORDER BY abandoned_at ASC",
        )
        .bind(queue.as_str())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(MessageRow::into_queued_message)
            .collect()
    }
}
