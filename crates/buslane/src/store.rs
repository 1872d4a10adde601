//! Relational store contract for the database-backed queue variant.
//!
//! Rows are keyed by (message id, queue name) and carry the attempt count,
//! the acknowledged/abandoned timestamps, the wire-serialized headers, the
//! content body, and the base64 sender identity.

use crate::error::BusError;
use crate::message::{MessageId, QueueName, QueuedMessage, Timestamp};
use async_trait::async_trait;

/// Persistence operations the store-backed consumer drives
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Ensure the backing resources for a queue exist
    async fn declare_queue(&self, queue: &QueueName) -> Result<(), BusError>;

    /// Remove a queue and every message on it
    async fn remove_queue(&self, queue: &QueueName) -> Result<(), BusError>;

    /// Persist a newly enqueued message
    async fn insert(&self, queue: &QueueName, message: &QueuedMessage) -> Result<(), BusError>;

    /// Fetch up to `limit` pending messages, oldest first
    async fn select_pending(
        &self,
        queue: &QueueName,
        limit: u32,
    ) -> Result<Vec<QueuedMessage>, BusError>;

    /// Persist an updated attempt count between delivery attempts
    async fn update_attempt_count(
        &self,
        queue: &QueueName,
        id: &MessageId,
        attempt_count: u32,
    ) -> Result<(), BusError>;

    /// Record successful delivery
    async fn mark_acknowledged(
        &self,
        queue: &QueueName,
        id: &MessageId,
        at: Timestamp,
        attempt_count: u32,
    ) -> Result<(), BusError>;

    /// Record terminal failure (dead-letter)
    async fn mark_abandoned(
        &self,
        queue: &QueueName,
        id: &MessageId,
        at: Timestamp,
        attempt_count: u32,
    ) -> Result<(), BusError>;

    /// Delete a message row outright
    async fn delete(&self, queue: &QueueName, id: &MessageId) -> Result<(), BusError>;

    /// Fetch every abandoned message for a queue, oldest first.
    ///
    /// Deliberately unbounded: dead letters stay visible regardless of age.
    async fn select_abandoned(&self, queue: &QueueName) -> Result<Vec<QueuedMessage>, BusError>;
}
