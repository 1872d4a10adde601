//! Structured diagnostic events for every significant engine transition.
//!
//! Sinks are fire-and-forget: emitting is infallible by contract, so no sink
//! behavior can ever change a delivery outcome. Components receive their sink
//! explicitly at construction; there is no process-global sink.

use crate::message::{MessageId, QueueName, Timestamp, TopicName};
use std::fmt;
use std::sync::Arc;
use std::sync::Mutex;
use tracing::{debug, info, warn};

// ============================================================================
// Diagnostic Events
// ============================================================================

/// Kind of engine transition being reported
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiagnosticEventKind {
    ConnectionOpened,
    ConnectionClosed,
    ConnectionLost,
    ConnectionError,
    ChannelCreated,
    ChannelClosed,
    ConsumerAdded,
    ConsumerCanceled,
    MessageEnqueued,
    MessageDelivered,
    MessageAcknowledged,
    MessageAbandoned,
    HandlerFaulted,
    SubscriptionBound,
    SubscriptionBindError,
}

impl fmt::Display for DiagnosticEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::ConnectionOpened => "connection-opened",
            Self::ConnectionClosed => "connection-closed",
            Self::ConnectionLost => "connection-lost",
            Self::ConnectionError => "connection-error",
            Self::ChannelCreated => "channel-created",
            Self::ChannelClosed => "channel-closed",
            Self::ConsumerAdded => "consumer-added",
            Self::ConsumerCanceled => "consumer-canceled",
            Self::MessageEnqueued => "message-enqueued",
            Self::MessageDelivered => "message-delivered",
            Self::MessageAcknowledged => "message-acknowledged",
            Self::MessageAbandoned => "message-abandoned",
            Self::HandlerFaulted => "handler-faulted",
            Self::SubscriptionBound => "subscription-bound",
            Self::SubscriptionBindError => "subscription-bind-error",
        };
        f.write_str(name)
    }
}

/// A single structured diagnostic record
#[derive(Debug, Clone)]
pub struct DiagnosticEvent {
    pub kind: DiagnosticEventKind,
    pub detail: Option<String>,
    pub error: Option<String>,
    pub message_id: Option<MessageId>,
    pub queue: Option<QueueName>,
    pub topic: Option<TopicName>,
    pub occurred_at: Timestamp,
}

impl DiagnosticEvent {
    /// Create an event of the given kind with no correlated identifiers
    pub fn new(kind: DiagnosticEventKind) -> Self {
        Self {
            kind,
            detail: None,
            error: None,
            message_id: None,
            queue: None,
            topic: None,
            occurred_at: Timestamp::now(),
        }
    }

    /// Attach a human-readable detail string
    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    /// Attach the error that triggered the event
    pub fn with_error(mut self, error: impl fmt::Display) -> Self {
        self.error = Some(error.to_string());
        self
    }

    /// Correlate with a message
    pub fn with_message_id(mut self, id: MessageId) -> Self {
        self.message_id = Some(id);
        self
    }

    /// Correlate with a queue
    pub fn with_queue(mut self, queue: QueueName) -> Self {
        self.queue = Some(queue);
        self
    }

    /// Correlate with a topic
    pub fn with_topic(mut self, topic: TopicName) -> Self {
        self.topic = Some(topic);
        self
    }
}

// ============================================================================
// Diagnostic Sink
// ============================================================================

/// Receiver for diagnostic events.
///
/// `emit` is infallible and must not block for long; the engine calls it
/// inline on its worker paths.
pub trait DiagnosticSink: Send + Sync {
    fn emit(&self, event: DiagnosticEvent);
}

/// Convenience constructors for commonly used sinks
pub struct Diagnostics;

impl Diagnostics {
    /// The default production sink, forwarding to `tracing`.
    ///
    /// Build this once at process start and pass it to every component;
    /// nothing in the engine reaches for it ambiently.
    pub fn default_sink() -> Arc<dyn DiagnosticSink> {
        Arc::new(TracingSink)
    }

    /// A sink that discards everything
    pub fn null_sink() -> Arc<dyn DiagnosticSink> {
        Arc::new(NullSink)
    }
}

/// Sink forwarding events to the `tracing` subscriber
pub struct TracingSink;

impl DiagnosticSink for TracingSink {
    fn emit(&self, event: DiagnosticEvent) {
        let kind = event.kind.to_string();
        let detail = event.detail.as_deref().unwrap_or("");
        let message_id = event
            .message_id
            .as_ref()
            .map(|id| id.to_string())
            .unwrap_or_default();
        let queue = event
            .queue
            .as_ref()
            .map(|q| q.to_string())
            .unwrap_or_default();
        let topic = event
            .topic
            .as_ref()
            .map(|t| t.to_string())
            .unwrap_or_default();

        match &event.error {
            Some(error) => {
                warn!(
                    kind = %kind,
                    detail = %detail,
                    error = %error,
                    message_id = %message_id,
                    queue = %queue,
                    topic = %topic,
                    "bus diagnostic"
                );
            }
            None => match event.kind {
                DiagnosticEventKind::MessageDelivered => {
                    debug!(
                        kind = %kind,
                        detail = %detail,
                        message_id = %message_id,
                        queue = %queue,
                        "bus diagnostic"
                    );
                }
                _ => {
                    info!(
                        kind = %kind,
                        detail = %detail,
                        message_id = %message_id,
                        queue = %queue,
                        topic = %topic,
                        "bus diagnostic"
                    );
                }
            },
        }
    }
}

/// Sink that discards every event
pub struct NullSink;

impl DiagnosticSink for NullSink {
    fn emit(&self, _event: DiagnosticEvent) {}
}

/// Test sink that records every event for later assertions
#[derive(Default)]
pub struct CollectingSink {
    events: Mutex<Vec<DiagnosticEvent>>,
}

impl CollectingSink {
    /// Create an empty collecting sink
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot the events recorded so far
    pub fn events(&self) -> Vec<DiagnosticEvent> {
        self.events.lock().expect("sink lock").clone()
    }

    /// Count events of a given kind
    pub fn count(&self, kind: DiagnosticEventKind) -> usize {
        self.events
            .lock()
            .expect("sink lock")
            .iter()
            .filter(|e| e.kind == kind)
            .count()
    }
}

impl DiagnosticSink for CollectingSink {
    fn emit(&self, event: DiagnosticEvent) {
        self.events.lock().expect("sink lock").push(event);
    }
}

#[cfg(test)]
#[path = "diagnostics_tests.rs"]
mod tests;
