//! # Buslane
//!
//! Durable message-bus runtime that delivers application messages reliably
//! between distributed instances over interchangeable transports: a broker
//! protocol and a relational-database-backed queue are both supported.
//!
//! This library provides:
//! - Per-endpoint connection lifecycle management with transparent
//!   reconnection after transport failure
//! - Durable per-queue consumers with bounded concurrency, at-least-once
//!   delivery, retry with backoff, and dead-lettering
//! - A queueing service tracking the set of live named queues
//! - Pub/sub subscription binding with bounded, retried establishment
//! - Structured, fire-and-forget diagnostics for every significant
//!   transition
//!
//! ## Module Organization
//!
//! - [`error`] - Error taxonomy for all bus operations
//! - [`message`] - Messages, headers, identifiers, and queued metadata
//! - [`options`] - Immutable queue and subscription option types
//! - [`diagnostics`] - Diagnostic events and sinks
//! - [`transport`] - Broker transport boundary contract
//! - [`store`] - Relational store boundary contract
//! - [`connection`] - Managed connections and the connection registry
//! - [`consumer`] - The durable consumer and its delivery state machine
//! - [`service`] - The queueing service (queue registry)
//! - [`subscription`] - Subscription binding
//! - [`providers`] - Built-in transport and store providers

// Module declarations
pub mod connection;
pub mod consumer;
pub mod diagnostics;
pub mod error;
pub mod message;
pub mod options;
pub mod providers;
pub mod service;
pub mod store;
pub mod subscription;
pub mod transport;

// Re-export commonly used types at crate root for convenience
pub use connection::{ConnectionRegistry, ConnectionState, Endpoint, ManagedConnection};
pub use consumer::{DeliveryContext, DurableConsumer, FnHandler, MessageHandler};
pub use diagnostics::{
    CollectingSink, DiagnosticEvent, DiagnosticEventKind, DiagnosticSink, Diagnostics, NullSink,
    TracingSink,
};
pub use error::{BusError, ConfigurationError, ValidationError};
pub use message::{
    HeaderMap, Message, MessageId, MessageStatus, QueueName, QueuedMessage, SenderIdentity,
    Timestamp, TopicName, HEADER_CORRELATION_ID, HEADER_DESTINATION, HEADER_MESSAGE_ID,
};
pub use options::{PullRetryPolicy, QueueOptions, SubscribeOptions};
pub use providers::{
    MemoryMessageStore, MemoryTransport, ProviderRegistry, SqliteMessageStore, StoreFactory,
};
pub use service::QueueingService;
pub use store::MessageStore;
pub use subscription::{Subscription, SubscriptionBinder};
pub use transport::{BrokerDelivery, Channel, Connection, DeliveryStream, DeliveryTag, Transport};
