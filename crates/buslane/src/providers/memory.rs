//! In-memory broker transport and message store.
//!
//! The broker keeps per-endpoint state (queues, topic bindings, unacked
//! deliveries, dead letters) behind a single mutex and supports connection
//! shutdown simulation, making it the reference provider for unit tests and
//! development.

use crate::connection::Endpoint;
use crate::error::BusError;
use crate::message::{MessageId, QueueName, QueuedMessage, Timestamp, TopicName};
use crate::store::MessageStore;
use crate::transport::{
    BrokerDelivery, Channel, Connection, DeliveryStream, DeliveryTag, Transport,
};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{watch, Notify};

#[cfg(test)]
#[path = "memory_tests.rs"]
mod tests;

/// Header stamped onto dead-lettered messages with the abandonment reason
pub const HEADER_DEAD_LETTER_REASON: &str = "Dead-Letter-Reason";

// ============================================================================
// Broker State
// ============================================================================

/// A single queue's broker-side state
struct BrokerQueue {
    durable: bool,
    pending: VecDeque<QueuedMessage>,
    /// Tags of deliveries handed out but not yet settled
    outstanding: HashSet<u64>,
    dead: Vec<QueuedMessage>,
    notify: Arc<Notify>,
}

impl BrokerQueue {
    fn new(durable: bool) -> Self {
        Self {
            durable,
            pending: VecDeque::new(),
            outstanding: HashSet::new(),
            dead: Vec::new(),
            notify: Arc::new(Notify::new()),
        }
    }
}

/// An unsettled delivery tracked by the broker
struct UnackedEntry {
    queue: QueueName,
    conn_id: u64,
    message: QueuedMessage,
}

/// Mutable broker state, all behind one mutex
struct BrokerState {
    queues: HashMap<QueueName, BrokerQueue>,
    topics: HashMap<TopicName, HashSet<QueueName>>,
    unacked: HashMap<u64, UnackedEntry>,
}

/// In-memory broker shared by every connection to one endpoint
pub struct MemoryBroker {
    state: Mutex<BrokerState>,
    next_tag: AtomicU64,
    next_conn_id: AtomicU64,
}

impl MemoryBroker {
    fn new() -> Self {
        Self {
            state: Mutex::new(BrokerState {
                queues: HashMap::new(),
                topics: HashMap::new(),
                unacked: HashMap::new(),
            }),
            next_tag: AtomicU64::new(1),
            next_conn_id: AtomicU64::new(1),
        }
    }

    /// Number of messages waiting on a queue
    pub fn pending_count(&self, queue: &QueueName) -> usize {
        let state = self.state.lock().expect("broker lock");
        state.queues.get(queue).map_or(0, |q| q.pending.len())
    }

    /// Number of unsettled deliveries on a queue
    pub fn unacked_count(&self, queue: &QueueName) -> usize {
        let state = self.state.lock().expect("broker lock");
        state.queues.get(queue).map_or(0, |q| q.outstanding.len())
    }

    /// Number of dead-lettered messages on a queue
    pub fn dead_letter_count(&self, queue: &QueueName) -> usize {
        let state = self.state.lock().expect("broker lock");
        state.queues.get(queue).map_or(0, |q| q.dead.len())
    }

    /// Queues currently bound to a topic
    pub fn bound_queues(&self, topic: &TopicName) -> Vec<QueueName> {
        let state = self.state.lock().expect("broker lock");
        state
            .topics
            .get(topic)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Whether a queue has been declared
    pub fn has_queue(&self, queue: &QueueName) -> bool {
        self.state
            .lock()
            .expect("broker lock")
            .queues
            .contains_key(queue)
    }

    /// Durability flag a queue was declared with
    pub fn is_durable(&self, queue: &QueueName) -> Option<bool> {
        let state = self.state.lock().expect("broker lock");
        state.queues.get(queue).map(|q| q.durable)
    }

    fn declare_queue(&self, queue: &QueueName, durable: bool) {
        let mut state = self.state.lock().expect("broker lock");
        state
            .queues
            .entry(queue.clone())
            .or_insert_with(|| BrokerQueue::new(durable));
    }

    fn delete_queue(&self, queue: &QueueName) -> Result<(), BusError> {
        let notify = {
            let mut state = self.state.lock().expect("broker lock");
            let removed = state
                .queues
                .remove(queue)
                .ok_or_else(|| BusError::QueueNotFound {
                    queue_name: queue.to_string(),
                })?;
            for bound in state.topics.values_mut() {
                bound.remove(queue);
            }
            let stale: Vec<u64> = state
                .unacked
                .iter()
                .filter(|(_, entry)| &entry.queue == queue)
                .map(|(tag, _)| *tag)
                .collect();
            for tag in stale {
                state.unacked.remove(&tag);
            }
            removed.notify
        };
        notify.notify_waiters();
        Ok(())
    }

    fn declare_topic(&self, topic: &TopicName) {
        let mut state = self.state.lock().expect("broker lock");
        state.topics.entry(topic.clone()).or_default();
    }

    fn bind_queue(&self, queue: &QueueName, topic: &TopicName) -> Result<(), BusError> {
        let mut state = self.state.lock().expect("broker lock");
        if !state.queues.contains_key(queue) {
            return Err(BusError::QueueNotFound {
                queue_name: queue.to_string(),
            });
        }
        let bound = state
            .topics
            .get_mut(topic)
            .ok_or_else(|| BusError::TopicNotFound {
                topic: topic.to_string(),
            })?;
        bound.insert(queue.clone());
        Ok(())
    }

    fn unbind_queue(&self, queue: &QueueName, topic: &TopicName) -> Result<(), BusError> {
        let mut state = self.state.lock().expect("broker lock");
        let bound = state
            .topics
            .get_mut(topic)
            .ok_or_else(|| BusError::TopicNotFound {
                topic: topic.to_string(),
            })?;
        bound.remove(queue);
        Ok(())
    }

    pub(crate) fn publish(&self, queue: &QueueName, message: QueuedMessage) -> Result<(), BusError> {
        let notify = {
            let mut state = self.state.lock().expect("broker lock");
            let q = state
                .queues
                .get_mut(queue)
                .ok_or_else(|| BusError::QueueNotFound {
                    queue_name: queue.to_string(),
                })?;
            q.pending.push_back(message);
            q.notify.clone()
        };
        notify.notify_waiters();
        Ok(())
    }

    fn publish_to_topic(
        &self,
        topic: &TopicName,
        message: QueuedMessage,
    ) -> Result<(), BusError> {
        let notifies = {
            let mut state = self.state.lock().expect("broker lock");
            let bound: Vec<QueueName> = state
                .topics
                .get(topic)
                .ok_or_else(|| BusError::TopicNotFound {
                    topic: topic.to_string(),
                })?
                .iter()
                .cloned()
                .collect();

            let mut notifies = Vec::with_capacity(bound.len());
            for queue in bound {
                if let Some(q) = state.queues.get_mut(&queue) {
                    q.pending.push_back(message.clone());
                    notifies.push(q.notify.clone());
                }
            }
            notifies
        };
        for notify in notifies {
            notify.notify_waiters();
        }
        Ok(())
    }

    fn queue_notify(&self, queue: &QueueName) -> Result<Arc<Notify>, BusError> {
        let state = self.state.lock().expect("broker lock");
        state
            .queues
            .get(queue)
            .map(|q| q.notify.clone())
            .ok_or_else(|| BusError::QueueNotFound {
                queue_name: queue.to_string(),
            })
    }

    /// Hand out the next pending delivery if the queue has capacity under
    /// `prefetch` unsettled deliveries.
    fn try_take(
        &self,
        queue: &QueueName,
        conn_id: u64,
        prefetch: u32,
    ) -> Result<Option<BrokerDelivery>, BusError> {
        let mut state = self.state.lock().expect("broker lock");
        let q = state
            .queues
            .get_mut(queue)
            .ok_or_else(|| BusError::QueueNotFound {
                queue_name: queue.to_string(),
            })?;

        if q.outstanding.len() >= prefetch as usize {
            return Ok(None);
        }
        let Some(message) = q.pending.pop_front() else {
            return Ok(None);
        };

        let tag = self.next_tag.fetch_add(1, Ordering::SeqCst);
        q.outstanding.insert(tag);
        state.unacked.insert(
            tag,
            UnackedEntry {
                queue: queue.clone(),
                conn_id,
                message: message.clone(),
            },
        );
        Ok(Some(BrokerDelivery {
            tag: DeliveryTag(tag),
            message,
        }))
    }

    fn settle(&self, tag: DeliveryTag) -> Result<UnackedEntry, BusError> {
        let mut state = self.state.lock().expect("broker lock");
        let entry = state
            .unacked
            .remove(&tag.0)
            .ok_or_else(|| BusError::ChannelFailed {
                message: format!("unknown delivery tag {tag}"),
            })?;
        if let Some(q) = state.queues.get_mut(&entry.queue) {
            q.outstanding.remove(&tag.0);
        }
        Ok(entry)
    }

    fn ack(&self, tag: DeliveryTag) -> Result<(), BusError> {
        let entry = self.settle(tag)?;
        if let Ok(notify) = self.queue_notify(&entry.queue) {
            notify.notify_waiters();
        }
        Ok(())
    }

    fn nack_requeue(&self, tag: DeliveryTag) -> Result<(), BusError> {
        let entry = self.settle(tag)?;
        let notify = {
            let mut state = self.state.lock().expect("broker lock");
            let q = state
                .queues
                .get_mut(&entry.queue)
                .ok_or_else(|| BusError::QueueNotFound {
                    queue_name: entry.queue.to_string(),
                })?;
            q.pending.push_front(entry.message);
            q.notify.clone()
        };
        notify.notify_waiters();
        Ok(())
    }

    fn record_attempt(&self, tag: DeliveryTag, attempt_count: u32) -> Result<(), BusError> {
        let mut state = self.state.lock().expect("broker lock");
        let entry = state
            .unacked
            .get_mut(&tag.0)
            .ok_or_else(|| BusError::ChannelFailed {
                message: format!("unknown delivery tag {tag}"),
            })?;
        entry.message.attempt_count = attempt_count;
        Ok(())
    }

    fn dead_letter(&self, tag: DeliveryTag, reason: &str) -> Result<(), BusError> {
        let entry = self.settle(tag)?;
        let notify = {
            let mut state = self.state.lock().expect("broker lock");
            let q = state
                .queues
                .get_mut(&entry.queue)
                .ok_or_else(|| BusError::QueueNotFound {
                    queue_name: entry.queue.to_string(),
                })?;
            let mut message = entry.message;
            message
                .message
                .headers
                .set(HEADER_DEAD_LETTER_REASON, reason);
            message.mark_abandoned(Timestamp::now());
            q.dead.push(message);
            q.notify.clone()
        };
        notify.notify_waiters();
        Ok(())
    }

    pub(crate) fn read_dead_letters(&self, queue: &QueueName) -> Result<Vec<QueuedMessage>, BusError> {
        let state = self.state.lock().expect("broker lock");
        let q = state
            .queues
            .get(queue)
            .ok_or_else(|| BusError::QueueNotFound {
                queue_name: queue.to_string(),
            })?;
        Ok(q.dead.clone())
    }

    /// Requeue every unsettled delivery held by a closing connection
    fn release_connection(&self, conn_id: u64) {
        let notifies = {
            let mut state = self.state.lock().expect("broker lock");
            let stale: Vec<u64> = state
                .unacked
                .iter()
                .filter(|(_, entry)| entry.conn_id == conn_id)
                .map(|(tag, _)| *tag)
                .collect();

            let mut notifies = Vec::new();
            for tag in stale {
                if let Some(entry) = state.unacked.remove(&tag) {
                    if let Some(q) = state.queues.get_mut(&entry.queue) {
                        q.outstanding.remove(&tag);
                        q.pending.push_front(entry.message);
                        notifies.push(q.notify.clone());
                    }
                }
            }
            notifies
        };
        for notify in notifies {
            notify.notify_waiters();
        }
    }
}

// ============================================================================
// Memory Transport
// ============================================================================

/// Transport serving `mem://` endpoints, one broker per endpoint
pub struct MemoryTransport {
    brokers: Mutex<HashMap<Endpoint, Arc<MemoryBroker>>>,
}

impl MemoryTransport {
    /// Create a transport with no brokers yet
    pub fn new() -> Self {
        Self {
            brokers: Mutex::new(HashMap::new()),
        }
    }

    /// Get or create the broker behind an endpoint (test inspection hook)
    pub fn broker(&self, endpoint: &Endpoint) -> Arc<MemoryBroker> {
        let mut brokers = self.brokers.lock().expect("transport lock");
        brokers
            .entry(endpoint.clone())
            .or_insert_with(|| Arc::new(MemoryBroker::new()))
            .clone()
    }
}

impl Default for MemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    fn scheme(&self) -> &str {
        "mem"
    }

    async fn connect(&self, endpoint: &Endpoint) -> Result<Arc<dyn Connection>, BusError> {
        let broker = self.broker(endpoint);
        let conn_id = broker.next_conn_id.fetch_add(1, Ordering::SeqCst);
        let (closed_tx, _) = watch::channel(false);
        Ok(Arc::new(MemoryConnection {
            conn_id,
            broker,
            open: Arc::new(AtomicBool::new(true)),
            closed_tx,
        }))
    }
}

// ============================================================================
// Memory Connection
// ============================================================================

/// A connection to an in-memory broker
pub struct MemoryConnection {
    conn_id: u64,
    broker: Arc<MemoryBroker>,
    open: Arc<AtomicBool>,
    closed_tx: watch::Sender<bool>,
}

impl MemoryConnection {
    /// Simulate the broker dropping this connection: marks it closed, fires
    /// the shutdown signal, and requeues its unsettled deliveries.
    pub fn simulate_shutdown(&self) {
        self.shutdown();
    }

    fn shutdown(&self) {
        if self.open.swap(false, Ordering::SeqCst) {
            let _ = self.closed_tx.send(true);
            self.broker.release_connection(self.conn_id);
        }
    }
}

#[async_trait]
impl Connection for MemoryConnection {
    async fn open_channel(&self) -> Result<Box<dyn Channel>, BusError> {
        if !self.is_open() {
            return Err(BusError::ChannelFailed {
                message: "connection is closed".to_string(),
            });
        }
        Ok(Box::new(MemoryChannel {
            conn_id: self.conn_id,
            broker: self.broker.clone(),
            open: self.open.clone(),
            closed_rx: self.closed_tx.subscribe(),
        }))
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    fn closed(&self) -> watch::Receiver<bool> {
        self.closed_tx.subscribe()
    }

    async fn close(&self) {
        self.shutdown();
    }
}

// ============================================================================
// Memory Channel
// ============================================================================

struct MemoryChannel {
    conn_id: u64,
    broker: Arc<MemoryBroker>,
    open: Arc<AtomicBool>,
    closed_rx: watch::Receiver<bool>,
}

impl MemoryChannel {
    fn ensure_open(&self) -> Result<(), BusError> {
        if self.open.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(BusError::ChannelFailed {
                message: "connection is closed".to_string(),
            })
        }
    }
}

#[async_trait]
impl Channel for MemoryChannel {
    async fn declare_queue(&self, queue: &QueueName, durable: bool) -> Result<(), BusError> {
        self.ensure_open()?;
        self.broker.declare_queue(queue, durable);
        Ok(())
    }

    async fn delete_queue(&self, queue: &QueueName) -> Result<(), BusError> {
        self.ensure_open()?;
        self.broker.delete_queue(queue)
    }

    async fn declare_topic(&self, topic: &TopicName) -> Result<(), BusError> {
        self.ensure_open()?;
        self.broker.declare_topic(topic);
        Ok(())
    }

    async fn bind_queue(&self, queue: &QueueName, topic: &TopicName) -> Result<(), BusError> {
        self.ensure_open()?;
        self.broker.bind_queue(queue, topic)
    }

    async fn unbind_queue(&self, queue: &QueueName, topic: &TopicName) -> Result<(), BusError> {
        self.ensure_open()?;
        self.broker.unbind_queue(queue, topic)
    }

    async fn publish(&self, queue: &QueueName, message: QueuedMessage) -> Result<(), BusError> {
        self.ensure_open()?;
        self.broker.publish(queue, message)
    }

    async fn publish_to_topic(
        &self,
        topic: &TopicName,
        message: QueuedMessage,
    ) -> Result<(), BusError> {
        self.ensure_open()?;
        self.broker.publish_to_topic(topic, message)
    }

    async fn consume(
        &self,
        queue: &QueueName,
        prefetch: u32,
    ) -> Result<Box<dyn DeliveryStream>, BusError> {
        self.ensure_open()?;
        if !self.broker.has_queue(queue) {
            return Err(BusError::QueueNotFound {
                queue_name: queue.to_string(),
            });
        }
        Ok(Box::new(MemoryDeliveryStream {
            conn_id: self.conn_id,
            broker: self.broker.clone(),
            queue: queue.clone(),
            prefetch: prefetch.max(1),
            closed_rx: self.closed_rx.clone(),
        }))
    }

    async fn ack(&self, tag: DeliveryTag) -> Result<(), BusError> {
        self.ensure_open()?;
        self.broker.ack(tag)
    }

    async fn nack_requeue(&self, tag: DeliveryTag) -> Result<(), BusError> {
        self.ensure_open()?;
        self.broker.nack_requeue(tag)
    }

    async fn record_attempt(&self, tag: DeliveryTag, attempt_count: u32) -> Result<(), BusError> {
        self.ensure_open()?;
        self.broker.record_attempt(tag, attempt_count)
    }

    async fn dead_letter(&self, tag: DeliveryTag, reason: &str) -> Result<(), BusError> {
        self.ensure_open()?;
        self.broker.dead_letter(tag, reason)
    }

    async fn read_dead_letters(&self, queue: &QueueName) -> Result<Vec<QueuedMessage>, BusError> {
        self.ensure_open()?;
        self.broker.read_dead_letters(queue)
    }

    async fn close(&self) {}
}

// ============================================================================
// Memory Delivery Stream
// ============================================================================

struct MemoryDeliveryStream {
    conn_id: u64,
    broker: Arc<MemoryBroker>,
    queue: QueueName,
    prefetch: u32,
    closed_rx: watch::Receiver<bool>,
}

#[async_trait]
impl DeliveryStream for MemoryDeliveryStream {
    async fn next(&mut self) -> Result<Option<BrokerDelivery>, BusError> {
        loop {
            if *self.closed_rx.borrow() {
                return Err(BusError::transport("connection is closed"));
            }

            // Register for notification before checking so a publish between
            // the check and the await cannot be missed.
            let notify = self.broker.queue_notify(&self.queue)?;
            let mut notified = std::pin::pin!(notify.notified());
            notified.as_mut().enable();

            if let Some(delivery) = self.broker.try_take(&self.queue, self.conn_id, self.prefetch)? {
                return Ok(Some(delivery));
            }

            tokio::select! {
                _ = &mut notified => {}
                changed = self.closed_rx.changed() => {
                    if changed.is_err() {
                        return Ok(None);
                    }
                }
            }
        }
    }
}

// ============================================================================
// Memory Message Store
// ============================================================================

/// In-memory [`MessageStore`] for the store-backed consumer's unit tests
pub struct MemoryMessageStore {
    queues: Mutex<HashMap<QueueName, Vec<QueuedMessage>>>,
}

impl MemoryMessageStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self {
            queues: Mutex::new(HashMap::new()),
        }
    }

    fn with_message<R>(
        &self,
        queue: &QueueName,
        id: &MessageId,
        apply: impl FnOnce(&mut QueuedMessage) -> R,
    ) -> Result<R, BusError> {
        let mut queues = self.queues.lock().expect("store lock");
        let messages = queues
            .get_mut(queue)
            .ok_or_else(|| BusError::QueueNotFound {
                queue_name: queue.to_string(),
            })?;
        let message = messages
            .iter_mut()
            .find(|m| &m.id == id)
            .ok_or_else(|| BusError::MessageNotFound {
                message_id: id.to_string(),
                queue_name: queue.to_string(),
            })?;
        Ok(apply(message))
    }
}

impl Default for MemoryMessageStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MessageStore for MemoryMessageStore {
    async fn declare_queue(&self, queue: &QueueName) -> Result<(), BusError> {
        let mut queues = self.queues.lock().expect("store lock");
        queues.entry(queue.clone()).or_default();
        Ok(())
    }

    async fn remove_queue(&self, queue: &QueueName) -> Result<(), BusError> {
        let mut queues = self.queues.lock().expect("store lock");
        queues.remove(queue);
        Ok(())
    }

    async fn insert(&self, queue: &QueueName, message: &QueuedMessage) -> Result<(), BusError> {
        let mut queues = self.queues.lock().expect("store lock");
        let messages = queues
            .get_mut(queue)
            .ok_or_else(|| BusError::QueueNotFound {
                queue_name: queue.to_string(),
            })?;
        messages.push(message.clone());
        Ok(())
    }

    async fn select_pending(
        &self,
        queue: &QueueName,
        limit: u32,
    ) -> Result<Vec<QueuedMessage>, BusError> {
        let queues = self.queues.lock().expect("store lock");
        let messages = queues.get(queue).ok_or_else(|| BusError::QueueNotFound {
            queue_name: queue.to_string(),
        })?;
        Ok(messages
            .iter()
            .filter(|m| m.status() == crate::message::MessageStatus::Pending)
            .take(limit as usize)
            .cloned()
            .collect())
    }

    async fn update_attempt_count(
        &self,
        queue: &QueueName,
        id: &MessageId,
        attempt_count: u32,
    ) -> Result<(), BusError> {
        self.with_message(queue, id, |m| m.attempt_count = attempt_count)
    }

    async fn mark_acknowledged(
        &self,
        queue: &QueueName,
        id: &MessageId,
        at: Timestamp,
        attempt_count: u32,
    ) -> Result<(), BusError> {
        self.with_message(queue, id, |m| {
            m.attempt_count = attempt_count;
            m.mark_acknowledged(at);
        })
    }

    async fn mark_abandoned(
        &self,
        queue: &QueueName,
        id: &MessageId,
        at: Timestamp,
        attempt_count: u32,
    ) -> Result<(), BusError> {
        self.with_message(queue, id, |m| {
            m.attempt_count = attempt_count;
            m.mark_abandoned(at);
        })
    }

    async fn delete(&self, queue: &QueueName, id: &MessageId) -> Result<(), BusError> {
        let mut queues = self.queues.lock().expect("store lock");
        let messages = queues
            .get_mut(queue)
            .ok_or_else(|| BusError::QueueNotFound {
                queue_name: queue.to_string(),
            })?;
        messages.retain(|m| &m.id != id);
        Ok(())
    }

    async fn select_abandoned(&self, queue: &QueueName) -> Result<Vec<QueuedMessage>, BusError> {
        let queues = self.queues.lock().expect("store lock");
        let messages = queues.get(queue).ok_or_else(|| BusError::QueueNotFound {
            queue_name: queue.to_string(),
        })?;
        Ok(messages
            .iter()
            .filter(|m| m.status() == crate::message::MessageStatus::Abandoned)
            .cloned()
            .collect())
    }
}
