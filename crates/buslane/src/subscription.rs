//! Subscription binding: fan-out routing from a publisher's topic into a
//! private, per-subscriber queue run by a durable consumer.
//!
//! Binding failures are retried up to a fixed ceiling with a fixed,
//! cancelable delay; exhausting the ceiling propagates the last error.
//! Repeat subscribes for the same binding are no-ops that renew the lease.

use crate::connection::{ConnectionRegistry, Endpoint, ManagedConnection};
use crate::consumer::MessageHandler;
use crate::diagnostics::{DiagnosticEvent, DiagnosticEventKind, DiagnosticSink};
use crate::error::BusError;
use crate::message::{QueueName, Timestamp, TopicName};
use crate::options::SubscribeOptions;
use crate::service::QueueingService;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::warn;

#[cfg(test)]
#[path = "subscription_tests.rs"]
mod tests;

// ============================================================================
// Subscription
// ============================================================================

/// An established binding from a topic to a private subscription queue
#[derive(Debug, Clone)]
pub struct Subscription {
    pub topic: TopicName,
    pub publisher: Endpoint,
    pub queue_name: QueueName,
    pub bound_at: Timestamp,
    pub expires_at: Timestamp,
}

impl Subscription {
    /// Whether the lease has lapsed without renewal
    pub fn is_expired(&self) -> bool {
        Timestamp::now() >= self.expires_at
    }

    fn renew(&mut self, lease: std::time::Duration) {
        let lease = chrono::Duration::from_std(lease).unwrap_or_else(|_| chrono::Duration::zero());
        self.expires_at = Timestamp::from_datetime(Timestamp::now().as_datetime() + lease);
    }
}

// ============================================================================
// Subscription Binder
// ============================================================================

/// Establishes and maintains topic-to-queue routing for one subscriber.
///
/// Bindings are cached by (publisher endpoint, subscription queue name):
/// a binding is created at most once and later subscribe calls only renew
/// its lease.
pub struct SubscriptionBinder {
    connections: Arc<ConnectionRegistry>,
    service: Arc<QueueingService>,
    subscriber_name: String,
    bindings: Mutex<HashMap<(Endpoint, QueueName), Subscription>>,
    cancel: CancellationToken,
    diagnostics: Arc<dyn DiagnosticSink>,
}

impl SubscriptionBinder {
    /// Create a binder for a subscriber.
    ///
    /// `subscriber_name` distinguishes this subscriber's private queues from
    /// other subscribers of the same topics.
    pub fn new(
        connections: Arc<ConnectionRegistry>,
        service: Arc<QueueingService>,
        subscriber_name: impl Into<String>,
        diagnostics: Arc<dyn DiagnosticSink>,
    ) -> Self {
        Self {
            connections,
            service,
            subscriber_name: subscriber_name.into(),
            bindings: Mutex::new(HashMap::new()),
            cancel: CancellationToken::new(),
            diagnostics,
        }
    }

    /// The queue name a subscription to `topic` uses
    pub fn subscription_queue_name(&self, topic: &TopicName) -> Result<QueueName, BusError> {
        Ok(QueueName::new(format!(
            "{}.{}",
            topic, self.subscriber_name
        ))?)
    }

    /// Establish fan-out routing from a topic on the publisher's endpoint
    /// into a private queue consumed by `handler`.
    ///
    /// Retries transient binding failures up to the configured ceiling with
    /// a fixed delay between attempts; exhaustion returns
    /// [`BusError::BindingFailed`] carrying the last error. Calling again
    /// for an established binding is a no-op that renews the lease.
    pub async fn subscribe(
        &self,
        topic: &TopicName,
        publisher: &Endpoint,
        handler: Arc<dyn MessageHandler>,
        options: SubscribeOptions,
    ) -> Result<Subscription, BusError> {
        options.validate()?;
        let queue_name = self.subscription_queue_name(topic)?;
        let key = (publisher.clone(), queue_name.clone());

        let mut bindings = self.bindings.lock().await;
        if let Some(existing) = bindings.get_mut(&key) {
            existing.renew(options.lease_duration);
            return Ok(existing.clone());
        }

        let connection = self.connections.get_connection(publisher)?;
        self.bind_with_retry(&connection, topic, &queue_name, &options)
            .await?;

        // Provision the private queue and start its consumer; an already
        // running queue (from an evicted cache entry) is fine.
        match self
            .service
            .create_queue_on(publisher, queue_name.clone(), handler, options.queue.clone())
            .await
        {
            Ok(()) => {}
            Err(BusError::QueueAlreadyExists { .. }) => {}
            Err(err) => return Err(err),
        }

        let now = Timestamp::now();
        let lease = chrono::Duration::from_std(options.lease_duration)
            .unwrap_or_else(|_| chrono::Duration::zero());
        let subscription = Subscription {
            topic: topic.clone(),
            publisher: publisher.clone(),
            queue_name: queue_name.clone(),
            bound_at: now,
            expires_at: Timestamp::from_datetime(now.as_datetime() + lease),
        };
        bindings.insert(key, subscription.clone());

        self.diagnostics.emit(
            DiagnosticEvent::new(DiagnosticEventKind::SubscriptionBound)
                .with_topic(topic.clone())
                .with_queue(queue_name)
                .with_detail(publisher.to_string()),
        );
        Ok(subscription)
    }

    /// Tear down a binding: unbind the routing, stop the consumer, and
    /// delete the private queue.
    pub async fn unsubscribe(
        &self,
        topic: &TopicName,
        publisher: &Endpoint,
    ) -> Result<(), BusError> {
        let queue_name = self.subscription_queue_name(topic)?;
        let key = (publisher.clone(), queue_name.clone());

        let mut bindings = self.bindings.lock().await;
        bindings
            .remove(&key)
            .ok_or_else(|| BusError::TopicNotFound {
                topic: topic.to_string(),
            })?;

        let connection = self.connections.get_connection(publisher)?;
        let conn = connection.current().await?;
        let channel = conn.open_channel().await?;
        let result = channel.unbind_queue(&queue_name, topic).await;
        channel.close().await;
        result?;

        self.service.delete_queue(&queue_name).await
    }

    /// Look up the cached subscription for a topic, if any
    pub async fn subscription(
        &self,
        topic: &TopicName,
        publisher: &Endpoint,
    ) -> Option<Subscription> {
        let queue_name = self.subscription_queue_name(topic).ok()?;
        let bindings = self.bindings.lock().await;
        bindings.get(&(publisher.clone(), queue_name)).cloned()
    }

    /// Number of cached bindings
    pub async fn binding_count(&self) -> usize {
        self.bindings.lock().await.len()
    }

    /// Cancel any in-progress binding retry waits
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    async fn bind_with_retry(
        &self,
        connection: &Arc<ManagedConnection>,
        topic: &TopicName,
        queue_name: &QueueName,
        options: &SubscribeOptions,
    ) -> Result<(), BusError> {
        let mut attempts = 0u32;
        loop {
            attempts += 1;
            match Self::try_bind(connection, topic, queue_name, options).await {
                Ok(()) => return Ok(()),
                Err(err) => {
                    self.diagnostics.emit(
                        DiagnosticEvent::new(DiagnosticEventKind::SubscriptionBindError)
                            .with_topic(topic.clone())
                            .with_queue(queue_name.clone())
                            .with_detail(format!("attempt {attempts}"))
                            .with_error(&err),
                    );

                    if attempts >= options.max_bind_attempts {
                        return Err(BusError::BindingFailed {
                            topic: topic.to_string(),
                            attempts,
                            message: err.to_string(),
                        });
                    }

                    warn!(
                        topic = %topic,
                        queue = %queue_name,
                        attempt = attempts,
                        delay_ms = options.bind_retry_delay.as_millis() as u64,
                        "Retrying subscription binding"
                    );
                    tokio::select! {
                        _ = self.cancel.cancelled() => return Err(BusError::Canceled),
                        _ = tokio::time::sleep(options.bind_retry_delay) => {}
                    }
                }
            }
        }
    }

    async fn try_bind(
        connection: &Arc<ManagedConnection>,
        topic: &TopicName,
        queue_name: &QueueName,
        options: &SubscribeOptions,
    ) -> Result<(), BusError> {
        let conn = connection.current().await?;
        let channel = conn.open_channel().await?;
        let result = async {
            channel.declare_topic(topic).await?;
            channel.declare_queue(queue_name, options.queue.durable).await?;
            channel.bind_queue(queue_name, topic).await
        }
        .await;
        channel.close().await;
        result
    }
}
