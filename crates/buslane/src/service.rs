//! The queueing service: tracks the set of live named queues, creates and
//! destroys them, and routes enqueue calls to the owning durable consumer.

use crate::connection::{ConnectionRegistry, Endpoint, ManagedConnection};
use crate::consumer::{BrokerSource, DurableConsumer, MessageHandler, StoreSource};
use crate::diagnostics::{DiagnosticEvent, DiagnosticEventKind, DiagnosticSink};
use crate::error::{BusError, ConfigurationError};
use crate::message::{
    Message, MessageId, QueueName, QueuedMessage, SenderIdentity, TopicName, HEADER_DESTINATION,
};
use crate::options::QueueOptions;
use crate::store::MessageStore;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Notify, RwLock};

#[cfg(test)]
#[path = "service_tests.rs"]
mod tests;

// ============================================================================
// Backends
// ============================================================================

/// Transport variant the service was constructed over
enum Backend {
    Broker {
        connections: Arc<ConnectionRegistry>,
        endpoint: Endpoint,
    },
    Store {
        store: Arc<dyn MessageStore>,
    },
}

/// How enqueues reach a particular queue
enum EnqueuePath {
    Broker {
        connection: Arc<ManagedConnection>,
    },
    Store {
        store: Arc<dyn MessageStore>,
        notify: Arc<Notify>,
    },
}

/// A live queue: its consumer plus the path enqueues take
struct QueueEntry {
    consumer: Arc<DurableConsumer>,
    enqueue: EnqueuePath,
}

// ============================================================================
// Queueing Service
// ============================================================================

/// Exclusive owner of every queue and its consumer workers.
///
/// Queues hold non-owning references to connections obtained from the
/// connection registry; the service never creates or destroys raw
/// connections itself.
pub struct QueueingService {
    backend: Backend,
    queues: RwLock<HashMap<QueueName, QueueEntry>>,
    diagnostics: Arc<dyn DiagnosticSink>,
}

impl QueueingService {
    /// Create a service whose queues live on a broker endpoint
    pub fn broker_backed(
        connections: Arc<ConnectionRegistry>,
        endpoint: Endpoint,
        diagnostics: Arc<dyn DiagnosticSink>,
    ) -> Self {
        Self {
            backend: Backend::Broker {
                connections,
                endpoint,
            },
            queues: RwLock::new(HashMap::new()),
            diagnostics,
        }
    }

    /// Create a service whose queues live in a relational store
    pub fn store_backed(store: Arc<dyn MessageStore>, diagnostics: Arc<dyn DiagnosticSink>) -> Self {
        Self {
            backend: Backend::Store { store },
            queues: RwLock::new(HashMap::new()),
            diagnostics,
        }
    }

    /// Create a queue and start its durable consumer.
    ///
    /// Fails with [`BusError::QueueAlreadyExists`] if the name is taken and
    /// propagates declare failures from the consumer's initialization.
    pub async fn create_queue(
        &self,
        name: QueueName,
        handler: Arc<dyn MessageHandler>,
        options: QueueOptions,
    ) -> Result<(), BusError> {
        self.create_queue_inner(None, name, handler, options).await
    }

    /// Create a queue on an explicit broker endpoint.
    ///
    /// Used by the subscription binder, whose private queues live on the
    /// publisher's endpoint rather than the service default.
    pub(crate) async fn create_queue_on(
        &self,
        endpoint: &Endpoint,
        name: QueueName,
        handler: Arc<dyn MessageHandler>,
        options: QueueOptions,
    ) -> Result<(), BusError> {
        self.create_queue_inner(Some(endpoint), name, handler, options)
            .await
    }

    async fn create_queue_inner(
        &self,
        endpoint_override: Option<&Endpoint>,
        name: QueueName,
        handler: Arc<dyn MessageHandler>,
        options: QueueOptions,
    ) -> Result<(), BusError> {
        options.validate()?;

        let mut queues = self.queues.write().await;
        if queues.contains_key(&name) {
            return Err(BusError::QueueAlreadyExists {
                queue_name: name.to_string(),
            });
        }

        let (source, enqueue) = match &self.backend {
            Backend::Broker {
                connections,
                endpoint,
            } => {
                let endpoint = endpoint_override.unwrap_or(endpoint);
                let connection = connections.get_connection(endpoint)?;
                let source: Arc<dyn crate::consumer::DeliverySource> = Arc::new(BrokerSource::new(
                    connection.clone(),
                    name.clone(),
                    &options,
                    self.diagnostics.clone(),
                ));
                (source, EnqueuePath::Broker { connection })
            }
            Backend::Store { store } => {
                if endpoint_override.is_some() {
                    return Err(BusError::Configuration(ConfigurationError::Invalid {
                        message: "subscription queues require a broker backend".to_string(),
                    }));
                }
                let notify = Arc::new(Notify::new());
                let source: Arc<dyn crate::consumer::DeliverySource> = Arc::new(StoreSource::new(
                    store.clone(),
                    name.clone(),
                    notify.clone(),
                ));
                (
                    source,
                    EnqueuePath::Store {
                        store: store.clone(),
                        notify,
                    },
                )
            }
        };

        let consumer = Arc::new(DurableConsumer::new(
            name.clone(),
            options,
            handler,
            source,
            self.diagnostics.clone(),
        ));
        consumer.clone().start().await?;

        queues.insert(name, QueueEntry { consumer, enqueue });
        Ok(())
    }

    /// Persist a message on a queue and signal its consumer.
    ///
    /// Assigns attempt count zero, stamps the destination header, and
    /// returns the message id. Fails with [`BusError::QueueNotFound`] for
    /// unknown queues.
    pub async fn enqueue_message(
        &self,
        name: &QueueName,
        mut message: Message,
        sender: SenderIdentity,
    ) -> Result<MessageId, BusError> {
        let queues = self.queues.read().await;
        let entry = queues.get(name).ok_or_else(|| BusError::QueueNotFound {
            queue_name: name.to_string(),
        })?;

        message.headers.set(HEADER_DESTINATION, name.as_str());
        let queued = QueuedMessage::new(message, sender);
        let id = queued.id.clone();

        match &entry.enqueue {
            EnqueuePath::Broker { connection } => {
                let conn = connection.current().await?;
                let channel = conn.open_channel().await?;
                let result = channel.publish(name, queued).await;
                channel.close().await;
                result?;
            }
            EnqueuePath::Store { store, notify } => {
                store.insert(name, &queued).await?;
                notify.notify_waiters();
            }
        }

        self.diagnostics.emit(
            DiagnosticEvent::new(DiagnosticEventKind::MessageEnqueued)
                .with_message_id(id.clone())
                .with_queue(name.clone()),
        );
        Ok(id)
    }

    /// Stop a queue's consumer and remove the underlying resource.
    ///
    /// Afterwards the name behaves as if it never existed; a later create
    /// may reuse it.
    pub async fn delete_queue(&self, name: &QueueName) -> Result<(), BusError> {
        let entry = {
            let mut queues = self.queues.write().await;
            queues.remove(name).ok_or_else(|| BusError::QueueNotFound {
                queue_name: name.to_string(),
            })?
        };

        entry.consumer.shutdown().await;

        match &entry.enqueue {
            EnqueuePath::Broker { connection } => {
                let conn = connection.current().await?;
                let channel = conn.open_channel().await?;
                let result = channel.delete_queue(name).await;
                channel.close().await;
                result?;
            }
            EnqueuePath::Store { store, .. } => {
                store.remove_queue(name).await?;
            }
        }
        Ok(())
    }

    /// Read a queue's dead-lettered messages, oldest first, unbounded
    pub async fn dead_letters(&self, name: &QueueName) -> Result<Vec<QueuedMessage>, BusError> {
        let queues = self.queues.read().await;
        let entry = queues.get(name).ok_or_else(|| BusError::QueueNotFound {
            queue_name: name.to_string(),
        })?;

        match &entry.enqueue {
            EnqueuePath::Broker { connection } => {
                let conn = connection.current().await?;
                let channel = conn.open_channel().await?;
                let result = channel.read_dead_letters(name).await;
                channel.close().await;
                result
            }
            EnqueuePath::Store { store, .. } => store.select_abandoned(name).await,
        }
    }

    /// Publish a message to a topic on the service's broker endpoint,
    /// fanning out to every bound subscription queue.
    pub async fn publish_to_topic(
        &self,
        topic: &TopicName,
        mut message: Message,
        sender: SenderIdentity,
    ) -> Result<MessageId, BusError> {
        let Backend::Broker {
            connections,
            endpoint,
        } = &self.backend
        else {
            return Err(BusError::Configuration(ConfigurationError::Invalid {
                message: "topic publishing requires a broker backend".to_string(),
            }));
        };

        message.headers.set(HEADER_DESTINATION, topic.as_str());
        let queued = QueuedMessage::new(message, sender);
        let id = queued.id.clone();

        let connection = connections.get_connection(endpoint)?;
        let conn = connection.current().await?;
        let channel = conn.open_channel().await?;
        let result = channel.publish_to_topic(topic, queued).await;
        channel.close().await;
        result?;

        self.diagnostics.emit(
            DiagnosticEvent::new(DiagnosticEventKind::MessageEnqueued)
                .with_message_id(id.clone())
                .with_topic(topic.clone()),
        );
        Ok(id)
    }

    /// Whether a queue is currently registered
    pub async fn contains_queue(&self, name: &QueueName) -> bool {
        self.queues.read().await.contains_key(name)
    }

    /// Number of live queues
    pub async fn queue_count(&self) -> usize {
        self.queues.read().await.len()
    }

    /// Stop every consumer without deleting queue resources.
    ///
    /// Invoked by the owner on every exit path; nothing relies on drop-time
    /// cleanup.
    pub async fn shutdown(&self) {
        let drained: Vec<QueueEntry> = {
            let mut queues = self.queues.write().await;
            queues.drain().map(|(_, entry)| entry).collect()
        };
        for entry in drained {
            entry.consumer.shutdown().await;
        }
    }
}
