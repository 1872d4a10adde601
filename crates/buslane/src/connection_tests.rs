//! Tests for managed connections and the connection registry.

use super::*;
use crate::diagnostics::{CollectingSink, DiagnosticEventKind};
use crate::error::BusError;
use crate::providers::memory::MemoryTransport;
use crate::transport::{Channel, Connection, Transport};
use async_trait::async_trait;
use std::sync::atomic::AtomicUsize;
use std::time::Duration;
use tokio::sync::watch;

// ============================================================================
// Test Doubles
// ============================================================================

struct FakeConnection {
    open: AtomicBool,
    closed_tx: watch::Sender<bool>,
}

impl FakeConnection {
    fn new() -> Self {
        let (closed_tx, _) = watch::channel(false);
        Self {
            open: AtomicBool::new(true),
            closed_tx,
        }
    }
}

#[async_trait]
impl Connection for FakeConnection {
    async fn open_channel(&self) -> Result<Box<dyn Channel>, BusError> {
        Err(BusError::ChannelFailed {
            message: "fake connection has no channels".to_string(),
        })
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    fn closed(&self) -> watch::Receiver<bool> {
        self.closed_tx.subscribe()
    }

    async fn close(&self) {
        self.open.store(false, Ordering::SeqCst);
        let _ = self.closed_tx.send(true);
    }
}

/// Transport that counts connects and can fail the first N of them
struct CountingTransport {
    connects: AtomicUsize,
    fail_first: u32,
    connect_delay: Duration,
}

impl CountingTransport {
    fn new(connect_delay: Duration) -> Self {
        Self {
            connects: AtomicUsize::new(0),
            fail_first: 0,
            connect_delay,
        }
    }

    fn failing_first(fail_first: u32) -> Self {
        Self {
            connects: AtomicUsize::new(0),
            fail_first,
            connect_delay: Duration::ZERO,
        }
    }

    fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for CountingTransport {
    fn scheme(&self) -> &str {
        "fake"
    }

    async fn connect(&self, _endpoint: &Endpoint) -> Result<Arc<dyn Connection>, BusError> {
        let count = self.connects.fetch_add(1, Ordering::SeqCst) as u32;
        tokio::time::sleep(self.connect_delay).await;
        if count < self.fail_first {
            return Err(BusError::transport("connect refused"));
        }
        Ok(Arc::new(FakeConnection::new()))
    }
}

fn endpoint(uri: &str) -> Endpoint {
    Endpoint::parse(uri).unwrap()
}

fn collecting_managed(transport: Arc<dyn Transport>) -> (Arc<ManagedConnection>, Arc<CollectingSink>) {
    let sink = Arc::new(CollectingSink::new());
    let managed = Arc::new(ManagedConnection::new(
        endpoint("fake://bus"),
        transport,
        sink.clone(),
    ));
    (managed, sink)
}

// ============================================================================
// Endpoint
// ============================================================================

#[test]
fn test_endpoint_parsing_and_scheme() {
    let endpoint = Endpoint::parse("mem://host:5672/bus").unwrap();

    assert_eq!(endpoint.scheme(), "mem");
    assert!(endpoint.as_str().contains("host:5672"));
    assert!(Endpoint::parse("not a uri").is_err());
}

#[test]
fn test_endpoints_compare_by_uri() {
    assert_eq!(endpoint("mem://a/bus"), endpoint("mem://a/bus"));
    assert_ne!(endpoint("mem://a/bus"), endpoint("mem://b/bus"));
}

// ============================================================================
// Managed Connection
// ============================================================================

#[tokio::test]
async fn test_connection_created_lazily_and_cached() {
    let transport = Arc::new(CountingTransport::new(Duration::ZERO));
    let (managed, _sink) = collecting_managed(transport.clone());

    assert_eq!(managed.state(), ConnectionState::NoConnection);
    assert_eq!(transport.connect_count(), 0);

    let first = managed.current().await.unwrap();
    let second = managed.current().await.unwrap();

    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(transport.connect_count(), 1);
    assert_eq!(managed.state(), ConnectionState::Open);
}

#[tokio::test]
async fn test_concurrent_use_creates_exactly_one_connection() {
    // A slow connect forces every caller into the creation window.
    let transport = Arc::new(CountingTransport::new(Duration::from_millis(50)));
    let (managed, _sink) = collecting_managed(transport.clone());

    let mut handles = Vec::new();
    for _ in 0..8 {
        let managed = managed.clone();
        handles.push(tokio::spawn(async move { managed.current().await }));
    }
    let connections: Vec<_> = futures::future::join_all(handles)
        .await
        .into_iter()
        .map(|joined| joined.unwrap().unwrap())
        .collect();

    assert_eq!(transport.connect_count(), 1);
    for conn in &connections[1..] {
        assert!(Arc::ptr_eq(&connections[0], conn));
    }
}

#[tokio::test]
async fn test_shutdown_signal_replaces_connection_on_next_use() {
    let transport = Arc::new(MemoryTransport::new());
    let sink = Arc::new(CollectingSink::new());
    let managed = Arc::new(ManagedConnection::new(
        endpoint("mem://bus"),
        transport,
        sink.clone(),
    ));

    let first = managed.current().await.unwrap();
    first.close().await;

    // The next use must yield a brand-new underlying connection rather
    // than reuse the stale one.
    let second = managed.current().await.unwrap();

    assert!(!Arc::ptr_eq(&first, &second));
    assert!(second.is_open());
    assert!(!first.is_open());
}

#[tokio::test]
async fn test_lost_connection_clears_cache_and_invokes_callbacks() {
    let transport = Arc::new(CountingTransport::new(Duration::ZERO));
    let (managed, sink) = collecting_managed(transport);

    let invoked = Arc::new(AtomicBool::new(false));
    let flag = invoked.clone();
    managed.on_connection_lost(Box::new(move || {
        flag.store(true, Ordering::SeqCst);
    }));

    let conn = managed.current().await.unwrap();
    conn.close().await;

    // The shutdown watcher runs asynchronously.
    for _ in 0..100 {
        if managed.state() == ConnectionState::ConnectionLost {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    assert_eq!(managed.state(), ConnectionState::ConnectionLost);
    assert!(invoked.load(Ordering::SeqCst));
    assert_eq!(sink.count(DiagnosticEventKind::ConnectionLost), 1);
}

#[tokio::test]
async fn test_close_clears_cached_reference_immediately() {
    let transport = Arc::new(CountingTransport::new(Duration::ZERO));
    let (managed, _sink) = collecting_managed(transport.clone());

    let _ = managed.current().await.unwrap();
    managed.close().await;

    assert_eq!(managed.state(), ConnectionState::NoConnection);

    // The next access triggers a fresh connect.
    let _ = managed.current().await.unwrap();
    assert_eq!(transport.connect_count(), 2);
}

#[tokio::test]
async fn test_connect_failure_propagates_and_next_call_retries() {
    let transport = Arc::new(CountingTransport::failing_first(1));
    let (managed, sink) = collecting_managed(transport.clone());

    let first = managed.current().await;
    assert!(matches!(first, Err(BusError::ConnectionFailed { .. })));
    assert_eq!(managed.state(), ConnectionState::NoConnection);

    let second = managed.current().await;
    assert!(second.is_ok());
    assert_eq!(transport.connect_count(), 2);
    assert_eq!(sink.count(DiagnosticEventKind::ConnectionError), 1);
    assert_eq!(sink.count(DiagnosticEventKind::ConnectionOpened), 1);
}

// ============================================================================
// Connection Registry
// ============================================================================

fn registry_with_fake_transport() -> (ConnectionRegistry, Arc<CountingTransport>) {
    let transport = Arc::new(CountingTransport::new(Duration::ZERO));
    let mut providers = crate::providers::registry::ProviderRegistry::new();
    providers.register_transport(transport.clone());
    let registry = ConnectionRegistry::new(Arc::new(providers), Arc::new(CollectingSink::new()));
    (registry, transport)
}

#[tokio::test]
async fn test_registry_returns_one_managed_connection_per_endpoint() {
    let (registry, _transport) = registry_with_fake_transport();

    let a1 = registry.get_connection(&endpoint("fake://a")).unwrap();
    let a2 = registry.get_connection(&endpoint("fake://a")).unwrap();
    let b = registry.get_connection(&endpoint("fake://b")).unwrap();

    assert!(Arc::ptr_eq(&a1, &a2));
    assert!(!Arc::ptr_eq(&a1, &b));
    assert_eq!(registry.tracked_endpoints(), 2);
}

#[tokio::test]
async fn test_registry_rejects_unknown_scheme() {
    let (registry, _transport) = registry_with_fake_transport();

    let result = registry.get_connection(&endpoint("amqp://elsewhere"));

    assert!(matches!(result, Err(BusError::UnknownProvider { .. })));
    assert_eq!(registry.tracked_endpoints(), 0);
}

#[tokio::test]
async fn test_registry_shutdown_closes_and_rejects_new_lookups() {
    let (registry, _transport) = registry_with_fake_transport();

    let managed = registry.get_connection(&endpoint("fake://a")).unwrap();
    let conn = managed.current().await.unwrap();

    registry.shutdown().await;

    assert!(!conn.is_open());
    assert_eq!(registry.tracked_endpoints(), 0);
    assert!(matches!(
        registry.get_connection(&endpoint("fake://a")),
        Err(BusError::RegistryClosed)
    ));
}
