//! The durable consumer: per-queue workers that pull deliveries and drive
//! each one through the retry/acknowledge state machine.
//!
//! Per delivery the states are
//! `Delivered → Processing → {Acknowledged | RetryScheduled → Processing | Abandoned}`.
//! Handler faults are non-acknowledgments, never crashes; exhausting the
//! attempt budget abandons the message as a normal terminal outcome.

use crate::connection::ManagedConnection;
use crate::diagnostics::{DiagnosticEvent, DiagnosticEventKind, DiagnosticSink};
use crate::error::BusError;
use crate::message::{Message, MessageId, QueueName, QueuedMessage, Timestamp};
use crate::options::{PullRetryPolicy, QueueOptions};
use crate::store::MessageStore;
use crate::transport::{Channel, DeliveryStream, DeliveryTag};
use async_trait::async_trait;
use futures::FutureExt;
use std::collections::HashSet;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

#[cfg(test)]
#[path = "consumer_tests.rs"]
mod tests;

// ============================================================================
// Delivery Context
// ============================================================================

/// Per-attempt context handed to the handler.
///
/// Starts unacknowledged; the handler calls [`DeliveryContext::acknowledge`]
/// to commit the delivery. Cheap to clone.
#[derive(Clone)]
pub struct DeliveryContext {
    inner: Arc<ContextInner>,
}

struct ContextInner {
    acknowledged: AtomicBool,
    attempt: u32,
    message_id: MessageId,
    queue: QueueName,
}

impl DeliveryContext {
    fn new(message_id: MessageId, queue: QueueName, attempt: u32) -> Self {
        Self {
            inner: Arc::new(ContextInner {
                acknowledged: AtomicBool::new(false),
                attempt,
                message_id,
                queue,
            }),
        }
    }

    /// Commit this delivery as successfully processed
    pub fn acknowledge(&self) {
        self.inner.acknowledged.store(true, Ordering::SeqCst);
    }

    /// Whether acknowledge has been called
    pub fn is_acknowledged(&self) -> bool {
        self.inner.acknowledged.load(Ordering::SeqCst)
    }

    /// The 1-based attempt number of this delivery
    pub fn attempt(&self) -> u32 {
        self.inner.attempt
    }

    /// Id of the message being delivered
    pub fn message_id(&self) -> &MessageId {
        &self.inner.message_id
    }

    /// Queue the message was delivered from
    pub fn queue(&self) -> &QueueName {
        &self.inner.queue
    }
}

// ============================================================================
// Message Handler
// ============================================================================

/// Application callback invoked once per delivery attempt.
///
/// Returning `Err` (or panicking) counts as a non-acknowledgment for the
/// attempt; the consumer schedules a retry or abandons the message.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(
        &self,
        message: &Message,
        context: DeliveryContext,
        cancel: CancellationToken,
    ) -> anyhow::Result<()>;
}

/// Adapter turning an async closure into a [`MessageHandler`]
pub struct FnHandler<F> {
    inner: F,
}

impl<F> FnHandler<F> {
    /// Wrap a closure of `(Message, DeliveryContext) -> Future<anyhow::Result<()>>`
    pub fn new(inner: F) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl<F, Fut> MessageHandler for FnHandler<F>
where
    F: Fn(Message, DeliveryContext) -> Fut + Send + Sync,
    Fut: std::future::Future<Output = anyhow::Result<()>> + Send,
{
    async fn handle(
        &self,
        message: &Message,
        context: DeliveryContext,
        _cancel: CancellationToken,
    ) -> anyhow::Result<()> {
        (self.inner)(message.clone(), context).await
    }
}

// ============================================================================
// Delivery Sources
// ============================================================================

/// A delivery pulled from a source, settled exactly once
pub(crate) struct ActiveDelivery {
    pub(crate) message: QueuedMessage,
    kind: DeliveryKind,
}

#[derive(Clone, Copy)]
enum DeliveryKind {
    Broker(DeliveryTag),
    Store,
}

/// Internal seam between the consumer's state machine and the two transport
/// variants. Both must guarantee a delivery is neither lost nor acknowledged
/// between attempts.
#[async_trait]
pub(crate) trait DeliverySource: Send + Sync {
    /// Declare the underlying queue resource. Unrecoverable configuration
    /// errors propagate to the caller starting the consumer.
    async fn init(&self) -> Result<(), BusError>;

    /// Wait for the next delivery. `Ok(None)` means the consumer was
    /// canceled; transient failures return `Err` after internal cleanup so
    /// the worker can back off and try again.
    async fn next_delivery(
        &self,
        cancel: &CancellationToken,
    ) -> Result<Option<ActiveDelivery>, BusError>;

    /// Persist an updated attempt count between attempts
    async fn record_attempt(
        &self,
        delivery: &ActiveDelivery,
        attempt_count: u32,
    ) -> Result<(), BusError>;

    /// Settle a delivery as successfully processed
    async fn acknowledge(
        &self,
        delivery: &ActiveDelivery,
        attempt_count: u32,
    ) -> Result<(), BusError>;

    /// Settle a delivery as terminally failed (dead-letter)
    async fn abandon(
        &self,
        delivery: &ActiveDelivery,
        attempt_count: u32,
        reason: &str,
    ) -> Result<(), BusError>;

    /// Release transport resources
    async fn close(&self);
}

// ----------------------------------------------------------------------------
// Broker-backed source
// ----------------------------------------------------------------------------

/// Delivery source over a broker channel obtained from a managed connection.
///
/// The broker holds each delivery unacknowledged while the in-process retry
/// sequence runs; terminal success acks, terminal failure dead-letters.
pub(crate) struct BrokerSource {
    connection: Arc<ManagedConnection>,
    queue: QueueName,
    durable: bool,
    prefetch: u32,
    channel: tokio::sync::Mutex<Option<Box<dyn Channel>>>,
    stream: tokio::sync::Mutex<Option<Box<dyn DeliveryStream>>>,
    diagnostics: Arc<dyn DiagnosticSink>,
}

impl BrokerSource {
    pub(crate) fn new(
        connection: Arc<ManagedConnection>,
        queue: QueueName,
        options: &QueueOptions,
        diagnostics: Arc<dyn DiagnosticSink>,
    ) -> Self {
        Self {
            connection,
            queue,
            durable: options.durable,
            prefetch: options.concurrency_limit,
            channel: tokio::sync::Mutex::new(None),
            stream: tokio::sync::Mutex::new(None),
            diagnostics,
        }
    }

    /// Fill the channel slot if empty, declaring the queue on the way, and
    /// borrow the live channel.
    async fn ensure_channel_locked<'a>(
        connection: &Arc<ManagedConnection>,
        queue: &QueueName,
        durable: bool,
        slot: &'a mut Option<Box<dyn Channel>>,
        diagnostics: &Arc<dyn DiagnosticSink>,
    ) -> Result<&'a dyn Channel, BusError> {
        if slot.is_none() {
            let conn = connection.current().await?;
            let channel = conn.open_channel().await?;
            channel.declare_queue(queue, durable).await?;
            diagnostics.emit(
                DiagnosticEvent::new(DiagnosticEventKind::ChannelCreated)
                    .with_queue(queue.clone()),
            );
            *slot = Some(channel);
        }
        Ok(slot.as_deref().expect("channel just ensured"))
    }
}

#[async_trait]
impl DeliverySource for BrokerSource {
    async fn init(&self) -> Result<(), BusError> {
        let mut slot = self.channel.lock().await;
        Self::ensure_channel_locked(
            &self.connection,
            &self.queue,
            self.durable,
            &mut slot,
            &self.diagnostics,
        )
        .await?;
        Ok(())
    }

    async fn next_delivery(
        &self,
        cancel: &CancellationToken,
    ) -> Result<Option<ActiveDelivery>, BusError> {
        let mut stream_slot = self.stream.lock().await;
        if stream_slot.is_none() {
            let mut channel_slot = self.channel.lock().await;
            let channel = Self::ensure_channel_locked(
                &self.connection,
                &self.queue,
                self.durable,
                &mut channel_slot,
                &self.diagnostics,
            )
            .await?;
            let stream = match channel.consume(&self.queue, self.prefetch).await {
                Ok(stream) => stream,
                Err(err) => {
                    *channel_slot = None;
                    return Err(err);
                }
            };
            *stream_slot = Some(stream);
        }

        let result = {
            let stream = stream_slot.as_mut().expect("stream just ensured");
            tokio::select! {
                _ = cancel.cancelled() => return Ok(None),
                result = stream.next() => result,
            }
        };

        match result {
            Ok(Some(delivery)) => Ok(Some(ActiveDelivery {
                message: delivery.message,
                kind: DeliveryKind::Broker(delivery.tag),
            })),
            Ok(None) => {
                *stream_slot = None;
                Err(BusError::transport("delivery stream ended"))
            }
            Err(err) => {
                *stream_slot = None;
                *self.channel.lock().await = None;
                Err(err)
            }
        }
    }

    async fn record_attempt(
        &self,
        delivery: &ActiveDelivery,
        attempt_count: u32,
    ) -> Result<(), BusError> {
        let DeliveryKind::Broker(tag) = delivery.kind else {
            return Ok(());
        };
        let mut slot = self.channel.lock().await;
        let channel = Self::ensure_channel_locked(
            &self.connection,
            &self.queue,
            self.durable,
            &mut slot,
            &self.diagnostics,
        )
        .await?;
        let result = channel.record_attempt(tag, attempt_count).await;
        if result.is_err() {
            *slot = None;
        }
        result
    }

    async fn acknowledge(
        &self,
        delivery: &ActiveDelivery,
        _attempt_count: u32,
    ) -> Result<(), BusError> {
        let DeliveryKind::Broker(tag) = delivery.kind else {
            return Ok(());
        };
        let mut slot = self.channel.lock().await;
        let channel = Self::ensure_channel_locked(
            &self.connection,
            &self.queue,
            self.durable,
            &mut slot,
            &self.diagnostics,
        )
        .await?;
        let result = channel.ack(tag).await;
        if result.is_err() {
            *slot = None;
        }
        result
    }

    async fn abandon(
        &self,
        delivery: &ActiveDelivery,
        attempt_count: u32,
        reason: &str,
    ) -> Result<(), BusError> {
        let DeliveryKind::Broker(tag) = delivery.kind else {
            return Ok(());
        };
        let mut slot = self.channel.lock().await;
        let channel = Self::ensure_channel_locked(
            &self.connection,
            &self.queue,
            self.durable,
            &mut slot,
            &self.diagnostics,
        )
        .await?;
        channel.record_attempt(tag, attempt_count).await?;
        let result = channel.dead_letter(tag, reason).await;
        if result.is_err() {
            *slot = None;
        }
        result
    }

    async fn close(&self) {
        self.stream.lock().await.take();
        if let Some(channel) = self.channel.lock().await.take() {
            channel.close().await;
            self.diagnostics.emit(
                DiagnosticEvent::new(DiagnosticEventKind::ChannelClosed)
                    .with_queue(self.queue.clone()),
            );
        }
    }
}

// ----------------------------------------------------------------------------
// Store-backed source
// ----------------------------------------------------------------------------

/// Delivery source over a relational message store.
///
/// Enqueues signal `notify`; a poll interval catches rows inserted by other
/// processes. An in-flight set keeps delivery of a given message exclusive
/// to one worker.
pub(crate) struct StoreSource {
    store: Arc<dyn MessageStore>,
    queue: QueueName,
    notify: Arc<Notify>,
    in_flight: std::sync::Mutex<HashSet<MessageId>>,
    poll_interval: Duration,
}

impl StoreSource {
    pub(crate) fn new(store: Arc<dyn MessageStore>, queue: QueueName, notify: Arc<Notify>) -> Self {
        Self {
            store,
            queue,
            notify,
            in_flight: std::sync::Mutex::new(HashSet::new()),
            poll_interval: Duration::from_millis(250),
        }
    }

    fn release(&self, id: &MessageId) {
        self.in_flight.lock().expect("in-flight lock").remove(id);
    }
}

#[async_trait]
impl DeliverySource for StoreSource {
    async fn init(&self) -> Result<(), BusError> {
        self.store.declare_queue(&self.queue).await
    }

    async fn next_delivery(
        &self,
        cancel: &CancellationToken,
    ) -> Result<Option<ActiveDelivery>, BusError> {
        loop {
            // Register for notification before selecting so an enqueue
            // between the select and the await cannot be missed.
            let mut notified = std::pin::pin!(self.notify.notified());
            notified.as_mut().enable();

            let limit = {
                let in_flight = self.in_flight.lock().expect("in-flight lock");
                in_flight.len() as u32 + 1
            };
            let pending = self.store.select_pending(&self.queue, limit).await?;

            let taken = {
                let mut in_flight = self.in_flight.lock().expect("in-flight lock");
                pending.into_iter().find(|m| !in_flight.contains(&m.id)).map(
                    |message| {
                        in_flight.insert(message.id.clone());
                        message
                    },
                )
            };
            if let Some(message) = taken {
                return Ok(Some(ActiveDelivery {
                    message,
                    kind: DeliveryKind::Store,
                }));
            }

            tokio::select! {
                _ = cancel.cancelled() => return Ok(None),
                _ = &mut notified => {}
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
        }
    }

    async fn record_attempt(
        &self,
        delivery: &ActiveDelivery,
        attempt_count: u32,
    ) -> Result<(), BusError> {
        self.store
            .update_attempt_count(&self.queue, &delivery.message.id, attempt_count)
            .await
    }

    async fn acknowledge(
        &self,
        delivery: &ActiveDelivery,
        attempt_count: u32,
    ) -> Result<(), BusError> {
        let result = self
            .store
            .mark_acknowledged(
                &self.queue,
                &delivery.message.id,
                Timestamp::now(),
                attempt_count,
            )
            .await;
        self.release(&delivery.message.id);
        result
    }

    async fn abandon(
        &self,
        delivery: &ActiveDelivery,
        attempt_count: u32,
        _reason: &str,
    ) -> Result<(), BusError> {
        let result = self
            .store
            .mark_abandoned(
                &self.queue,
                &delivery.message.id,
                Timestamp::now(),
                attempt_count,
            )
            .await;
        self.release(&delivery.message.id);
        result
    }

    async fn close(&self) {}
}

// ============================================================================
// Durable Consumer
// ============================================================================

/// Runs `concurrency_limit` delivery state machines against one queue.
///
/// Each worker pulls a delivery, drives it to a terminal state, and only
/// then takes the next one, so in-flight deliveries never exceed the limit.
pub struct DurableConsumer {
    queue: QueueName,
    options: QueueOptions,
    handler: Arc<dyn MessageHandler>,
    source: Arc<dyn DeliverySource>,
    pull_retry: PullRetryPolicy,
    diagnostics: Arc<dyn DiagnosticSink>,
    cancel: CancellationToken,
    workers: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl DurableConsumer {
    pub(crate) fn new(
        queue: QueueName,
        options: QueueOptions,
        handler: Arc<dyn MessageHandler>,
        source: Arc<dyn DeliverySource>,
        diagnostics: Arc<dyn DiagnosticSink>,
    ) -> Self {
        Self {
            queue,
            options,
            handler,
            source,
            pull_retry: PullRetryPolicy::default(),
            diagnostics,
            cancel: CancellationToken::new(),
            workers: std::sync::Mutex::new(Vec::new()),
        }
    }

    /// Queue this consumer serves
    pub fn queue(&self) -> &QueueName {
        &self.queue
    }

    /// Declare the underlying resource and spawn the worker pool.
    ///
    /// Declare failures propagate; everything after is absorbed into the
    /// retry machinery.
    pub(crate) async fn start(self: Arc<Self>) -> Result<(), BusError> {
        self.source.init().await?;

        let mut workers = self.workers.lock().expect("worker lock");
        for worker_id in 0..self.options.concurrency_limit {
            let consumer = self.clone();
            workers.push(tokio::spawn(async move {
                consumer.run_worker(worker_id).await;
            }));
        }
        self.diagnostics.emit(
            DiagnosticEvent::new(DiagnosticEventKind::ConsumerAdded)
                .with_queue(self.queue.clone())
                .with_detail(format!("{} workers", self.options.concurrency_limit)),
        );
        Ok(())
    }

    /// Signal cancellation, wait for in-flight attempts to finish, and
    /// release transport resources.
    pub(crate) async fn shutdown(&self) {
        self.cancel.cancel();
        let handles: Vec<JoinHandle<()>> = {
            let mut workers = self.workers.lock().expect("worker lock");
            workers.drain(..).collect()
        };
        for handle in handles {
            let _ = handle.await;
        }
        self.source.close().await;
        self.diagnostics.emit(
            DiagnosticEvent::new(DiagnosticEventKind::ConsumerCanceled)
                .with_queue(self.queue.clone()),
        );
    }

    async fn run_worker(&self, worker_id: u32) {
        loop {
            if self.cancel.is_cancelled() {
                break;
            }
            match self.source.next_delivery(&self.cancel).await {
                Ok(Some(delivery)) => self.process_delivery(delivery).await,
                Ok(None) => break, // canceled
                Err(err) => {
                    self.diagnostics.emit(
                        DiagnosticEvent::new(DiagnosticEventKind::ConnectionError)
                            .with_queue(self.queue.clone())
                            .with_detail(format!("worker {worker_id} pull failed"))
                            .with_error(&err),
                    );
                    let delay = self.pull_retry.next_delay();
                    tokio::select! {
                        _ = self.cancel.cancelled() => break,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }

    /// Drive one delivery to a terminal state.
    async fn process_delivery(&self, delivery: ActiveDelivery) {
        let mut attempt = delivery.message.attempt_count;

        loop {
            attempt += 1;
            self.diagnostics.emit(
                DiagnosticEvent::new(DiagnosticEventKind::MessageDelivered)
                    .with_message_id(delivery.message.id.clone())
                    .with_queue(self.queue.clone())
                    .with_detail(format!("attempt {attempt}")),
            );

            let context =
                DeliveryContext::new(delivery.message.id.clone(), self.queue.clone(), attempt);
            let outcome = AssertUnwindSafe(self.handler.handle(
                &delivery.message.message,
                context.clone(),
                self.cancel.clone(),
            ))
            .catch_unwind()
            .await;

            let acknowledged = match outcome {
                Ok(Ok(())) => context.is_acknowledged() || self.options.auto_acknowledge,
                Ok(Err(fault)) => {
                    // A fault is a non-acknowledgment for this attempt.
                    self.diagnostics.emit(
                        DiagnosticEvent::new(DiagnosticEventKind::HandlerFaulted)
                            .with_message_id(delivery.message.id.clone())
                            .with_queue(self.queue.clone())
                            .with_detail(format!("attempt {attempt}"))
                            .with_error(format!("{fault:#}")),
                    );
                    false
                }
                Err(_panic) => {
                    self.diagnostics.emit(
                        DiagnosticEvent::new(DiagnosticEventKind::HandlerFaulted)
                            .with_message_id(delivery.message.id.clone())
                            .with_queue(self.queue.clone())
                            .with_detail(format!("attempt {attempt}"))
                            .with_error("handler panicked"),
                    );
                    false
                }
            };

            if acknowledged {
                match self.source.acknowledge(&delivery, attempt).await {
                    Ok(()) => {
                        self.diagnostics.emit(
                            DiagnosticEvent::new(DiagnosticEventKind::MessageAcknowledged)
                                .with_message_id(delivery.message.id.clone())
                                .with_queue(self.queue.clone())
                                .with_detail(format!("after {attempt} attempts")),
                        );
                    }
                    Err(err) => {
                        // The transport will redeliver; at-least-once holds.
                        self.diagnostics.emit(
                            DiagnosticEvent::new(DiagnosticEventKind::ConnectionError)
                                .with_message_id(delivery.message.id.clone())
                                .with_queue(self.queue.clone())
                                .with_detail("acknowledge failed")
                                .with_error(&err),
                        );
                    }
                }
                return;
            }

            if self.cancel.is_cancelled() {
                // Interrupted, not failed: leave the delivery unsettled.
                return;
            }

            if attempt >= self.options.max_attempts {
                match self
                    .source
                    .abandon(&delivery, attempt, "delivery attempts exhausted")
                    .await
                {
                    Ok(()) => {
                        self.diagnostics.emit(
                            DiagnosticEvent::new(DiagnosticEventKind::MessageAbandoned)
                                .with_message_id(delivery.message.id.clone())
                                .with_queue(self.queue.clone())
                                .with_detail(format!("after {attempt} attempts")),
                        );
                    }
                    Err(err) => {
                        self.diagnostics.emit(
                            DiagnosticEvent::new(DiagnosticEventKind::ConnectionError)
                                .with_message_id(delivery.message.id.clone())
                                .with_queue(self.queue.clone())
                                .with_detail("abandon failed")
                                .with_error(&err),
                        );
                    }
                }
                return;
            }

            if let Err(err) = self.source.record_attempt(&delivery, attempt).await {
                self.diagnostics.emit(
                    DiagnosticEvent::new(DiagnosticEventKind::ConnectionError)
                        .with_message_id(delivery.message.id.clone())
                        .with_queue(self.queue.clone())
                        .with_detail("recording attempt count failed")
                        .with_error(&err),
                );
            }

            tokio::select! {
                _ = self.cancel.cancelled() => return,
                _ = tokio::time::sleep(self.options.retry_delay) => {}
            }
        }
    }
}
