//! Shared helpers for the integration tests.
#![allow(dead_code)]

use buslane::{
    CollectingSink, ConnectionRegistry, DeliveryContext, DiagnosticEventKind, Endpoint, Message,
    MessageHandler, ProviderRegistry, QueueName, QueueingService, TopicName,
};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Once};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

static INIT_TRACING: Once = Once::new();

/// Initialize tracing once for the whole test binary
pub fn init_tracing() {
    INIT_TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "warn".into()),
            )
            .with_test_writer()
            .try_init();
    });
}

/// A broker-backed service with the default providers, plus its plumbing
pub struct BrokerFixture {
    pub service: Arc<QueueingService>,
    pub connections: Arc<ConnectionRegistry>,
    pub sink: Arc<CollectingSink>,
    pub endpoint: Endpoint,
}

impl BrokerFixture {
    pub fn new(endpoint_uri: &str) -> Self {
        init_tracing();
        let sink = Arc::new(CollectingSink::new());
        let providers = Arc::new(ProviderRegistry::with_defaults());
        let connections = Arc::new(ConnectionRegistry::new(providers, sink.clone()));
        let endpoint = Endpoint::parse(endpoint_uri).unwrap();
        let service = Arc::new(QueueingService::broker_backed(
            connections.clone(),
            endpoint.clone(),
            sink.clone(),
        ));
        Self {
            service,
            connections,
            sink,
            endpoint,
        }
    }

    pub async fn wait_for(&self, kind: DiagnosticEventKind, count: usize) {
        wait_for(&self.sink, kind, count).await;
    }
}

/// Poll the sink until `count` events of `kind` were observed
pub async fn wait_for(sink: &CollectingSink, kind: DiagnosticEventKind, count: usize) {
    for _ in 0..1000 {
        if sink.count(kind) >= count {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("timed out waiting for {count} {kind} events");
}

pub fn queue(name: &str) -> QueueName {
    QueueName::new(name).unwrap()
}

pub fn topic(name: &str) -> TopicName {
    TopicName::new(name).unwrap()
}

/// Handler that acknowledges on its nth invocation (never, when 0)
pub struct AckOnNth {
    ack_on: u32,
    invocations: AtomicU32,
}

impl AckOnNth {
    pub fn new(ack_on: u32) -> Self {
        Self {
            ack_on,
            invocations: AtomicU32::new(0),
        }
    }

    pub fn never() -> Self {
        Self::new(0)
    }

    pub fn invocations(&self) -> u32 {
        self.invocations.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl MessageHandler for AckOnNth {
    async fn handle(
        &self,
        _message: &Message,
        context: DeliveryContext,
        _cancel: CancellationToken,
    ) -> anyhow::Result<()> {
        let invocation = self.invocations.fetch_add(1, Ordering::SeqCst) + 1;
        if self.ack_on != 0 && invocation >= self.ack_on {
            context.acknowledge();
        }
        Ok(())
    }
}
