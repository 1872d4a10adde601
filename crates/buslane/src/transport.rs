//! Broker transport contract consumed by the queue engine.
//!
//! Implementations live behind these traits (see `providers/`); the engine
//! itself only depends on the capability surface: declare, bind, publish,
//! consume with ack/nack, and shutdown detection.

use crate::connection::Endpoint;
use crate::error::BusError;
use crate::message::{QueueName, QueuedMessage, TopicName};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::watch;

// ============================================================================
// Transport
// ============================================================================

/// Factory for raw connections to broker endpoints
#[async_trait]
pub trait Transport: Send + Sync {
    /// URI scheme this transport serves (used by the provider registry)
    fn scheme(&self) -> &str;

    /// Open a new raw connection to the endpoint
    async fn connect(&self, endpoint: &Endpoint) -> Result<Arc<dyn Connection>, BusError>;
}

// ============================================================================
// Connection
// ============================================================================

/// A live connection to a broker.
///
/// Connections are stateful: once `is_open` reports false the handle must
/// not be reused. The managed-connection layer watches [`Connection::closed`]
/// and replaces the handle on the next use.
#[async_trait]
pub trait Connection: Send + Sync {
    /// Open a channel multiplexed over this connection
    async fn open_channel(&self) -> Result<Box<dyn Channel>, BusError>;

    /// Whether the connection is currently usable
    fn is_open(&self) -> bool;

    /// Shutdown signal: flips to `true` exactly once when the underlying
    /// connection reports closed or lost.
    fn closed(&self) -> watch::Receiver<bool>;

    /// Close the connection and release its resources
    async fn close(&self);
}

// ============================================================================
// Channel
// ============================================================================

/// Identifier for an in-flight delivery on a channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeliveryTag(pub u64);

impl std::fmt::Display for DeliveryTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A delivery handed out by [`Channel::consume`]
#[derive(Debug)]
pub struct BrokerDelivery {
    pub tag: DeliveryTag,
    pub message: QueuedMessage,
}

/// Operations multiplexed over a connection
#[async_trait]
pub trait Channel: Send + Sync {
    /// Declare a queue, creating it if absent
    async fn declare_queue(&self, queue: &QueueName, durable: bool) -> Result<(), BusError>;

    /// Delete a queue and everything on it
    async fn delete_queue(&self, queue: &QueueName) -> Result<(), BusError>;

    /// Declare a topic exchange, creating it if absent
    async fn declare_topic(&self, topic: &TopicName) -> Result<(), BusError>;

    /// Bind a queue so messages published to the topic fan out into it
    async fn bind_queue(&self, queue: &QueueName, topic: &TopicName) -> Result<(), BusError>;

    /// Remove a queue's binding to a topic
    async fn unbind_queue(&self, queue: &QueueName, topic: &TopicName) -> Result<(), BusError>;

    /// Publish a message directly onto a queue
    async fn publish(&self, queue: &QueueName, message: QueuedMessage) -> Result<(), BusError>;

    /// Publish a message to a topic, fanning out to every bound queue
    async fn publish_to_topic(
        &self,
        topic: &TopicName,
        message: QueuedMessage,
    ) -> Result<(), BusError>;

    /// Start consuming from a queue with at most `prefetch` unacknowledged
    /// deliveries outstanding
    async fn consume(
        &self,
        queue: &QueueName,
        prefetch: u32,
    ) -> Result<Box<dyn DeliveryStream>, BusError>;

    /// Acknowledge a delivery; the broker forgets the message
    async fn ack(&self, tag: DeliveryTag) -> Result<(), BusError>;

    /// Negatively acknowledge and requeue for redelivery
    async fn nack_requeue(&self, tag: DeliveryTag) -> Result<(), BusError>;

    /// Persist an updated attempt count on an in-flight delivery.
    ///
    /// Brokers that cannot update in-flight metadata may leave this as the
    /// default no-op; the count still travels with the delivery in-process.
    async fn record_attempt(&self, _tag: DeliveryTag, _attempt_count: u32) -> Result<(), BusError> {
        Ok(())
    }

    /// Terminally fail a delivery, routing it to dead-letter storage
    async fn dead_letter(&self, tag: DeliveryTag, reason: &str) -> Result<(), BusError>;

    /// Read the dead-lettered messages of a queue, oldest first, unbounded
    async fn read_dead_letters(&self, queue: &QueueName) -> Result<Vec<QueuedMessage>, BusError>;

    /// Close the channel, canceling its consumers
    async fn close(&self);
}

/// Pull interface over a queue's deliveries
#[async_trait]
pub trait DeliveryStream: Send {
    /// Wait for the next delivery. `None` means the stream is closed and no
    /// further deliveries will arrive.
    async fn next(&mut self) -> Result<Option<BrokerDelivery>, BusError>;
}
