//! Connection lifecycle management: one managed connection per endpoint,
//! created lazily and replaced transparently after transport failure.

use crate::diagnostics::{DiagnosticEvent, DiagnosticEventKind, DiagnosticSink};
use crate::error::{BusError, ValidationError};
use crate::providers::registry::ProviderRegistry;
use crate::transport::{Connection, Transport};
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use url::Url;

#[cfg(test)]
#[path = "connection_tests.rs"]
mod tests;

// ============================================================================
// Endpoint
// ============================================================================

/// URI identifying a remote bus instance, broker, or database location.
///
/// Many queues may share one endpoint; the connection registry guarantees at
/// most one live connection per endpoint at a time.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    url: Url,
}

impl Endpoint {
    /// Parse an endpoint from its URI form
    pub fn parse(input: &str) -> Result<Self, ValidationError> {
        let url = Url::parse(input).map_err(|e| ValidationError::InvalidFormat {
            field: "endpoint".to_string(),
            message: e.to_string(),
        })?;
        Ok(Self { url })
    }

    /// The URI scheme, used to resolve the serving transport
    pub fn scheme(&self) -> &str {
        self.url.scheme()
    }

    /// The full URI string
    pub fn as_str(&self) -> &str {
        self.url.as_str()
    }

    /// The underlying URL
    pub fn as_url(&self) -> &Url {
        &self.url
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.url)
    }
}

impl FromStr for Endpoint {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

// ============================================================================
// Managed Connection
// ============================================================================

/// Observable lifecycle state of a managed connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No underlying connection exists yet
    NoConnection,
    /// A connection is being established
    Connecting,
    /// A live connection is cached and usable
    Open,
    /// The last connection reported shutdown; the next use reconnects
    ConnectionLost,
}

/// Wraps a raw transport connection and transparently recreates it on use
/// after failure.
///
/// Reads of the cached connection are lock-free for observers; recreation is
/// serialized through an async mutex with a double-checked read, so at most
/// one underlying connection is ever being created per instance.
pub struct ManagedConnection {
    inner: Arc<ConnectionInner>,
}

struct ConnectionInner {
    endpoint: Endpoint,
    transport: Arc<dyn Transport>,
    current: RwLock<Option<Arc<dyn Connection>>>,
    state: RwLock<ConnectionState>,
    create_lock: tokio::sync::Mutex<()>,
    lost_callbacks: Mutex<Vec<Box<dyn Fn() + Send + Sync>>>,
    generation: AtomicU64,
    diagnostics: Arc<dyn DiagnosticSink>,
}

impl ManagedConnection {
    /// Create a managed connection for an endpoint. No connection is opened
    /// until first use.
    pub fn new(
        endpoint: Endpoint,
        transport: Arc<dyn Transport>,
        diagnostics: Arc<dyn DiagnosticSink>,
    ) -> Self {
        Self {
            inner: Arc::new(ConnectionInner {
                endpoint,
                transport,
                current: RwLock::new(None),
                state: RwLock::new(ConnectionState::NoConnection),
                create_lock: tokio::sync::Mutex::new(()),
                lost_callbacks: Mutex::new(Vec::new()),
                generation: AtomicU64::new(0),
                diagnostics,
            }),
        }
    }

    /// The endpoint this connection serves
    pub fn endpoint(&self) -> &Endpoint {
        &self.inner.endpoint
    }

    /// Current lifecycle state
    pub fn state(&self) -> ConnectionState {
        *self.inner.state.read().expect("state lock")
    }

    /// Register a callback invoked synchronously whenever the underlying
    /// connection reports shutdown and the cached reference is cleared.
    pub fn on_connection_lost(&self, callback: Box<dyn Fn() + Send + Sync>) {
        self.inner
            .lost_callbacks
            .lock()
            .expect("callback lock")
            .push(callback);
    }

    /// Get the live underlying connection, creating one if necessary.
    ///
    /// The fast path is a shared read of the cached reference; the creation
    /// lock is only taken when no live connection exists, and the cache is
    /// re-checked under the lock before connecting.
    pub async fn current(&self) -> Result<Arc<dyn Connection>, BusError> {
        let inner = &self.inner;
        if let Some(conn) = inner.read_live() {
            return Ok(conn);
        }

        let _guard = inner.create_lock.lock().await;
        if let Some(conn) = inner.read_live() {
            return Ok(conn);
        }

        inner.set_state(ConnectionState::Connecting);
        match inner.transport.connect(&inner.endpoint).await {
            Ok(conn) => {
                let generation = inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
                *inner.current.write().expect("connection lock") = Some(conn.clone());
                inner.set_state(ConnectionState::Open);
                inner.diagnostics.emit(
                    DiagnosticEvent::new(DiagnosticEventKind::ConnectionOpened)
                        .with_detail(inner.endpoint.to_string()),
                );
                Self::watch_for_shutdown(inner, conn.clone(), generation);
                Ok(conn)
            }
            Err(err) => {
                inner.set_state(ConnectionState::NoConnection);
                inner.diagnostics.emit(
                    DiagnosticEvent::new(DiagnosticEventKind::ConnectionError)
                        .with_detail(inner.endpoint.to_string())
                        .with_error(&err),
                );
                Err(BusError::ConnectionFailed {
                    endpoint: inner.endpoint.to_string(),
                    message: err.to_string(),
                })
            }
        }
    }

    /// Close the underlying connection and clear the cached reference so the
    /// next access reconnects instead of reusing a half-closed handle.
    pub async fn close(&self) {
        let inner = &self.inner;
        let previous = inner.current.write().expect("connection lock").take();
        inner.generation.fetch_add(1, Ordering::SeqCst);
        inner.set_state(ConnectionState::NoConnection);

        if let Some(conn) = previous {
            conn.close().await;
            inner.diagnostics.emit(
                DiagnosticEvent::new(DiagnosticEventKind::ConnectionClosed)
                    .with_detail(inner.endpoint.to_string()),
            );
        }
    }

    /// Spawn a watcher that clears the cached reference when the underlying
    /// connection reports shutdown. The generation guard keeps a late signal
    /// from a replaced connection from clobbering its successor.
    fn watch_for_shutdown(inner: &Arc<ConnectionInner>, conn: Arc<dyn Connection>, generation: u64) {
        let weak: Weak<ConnectionInner> = Arc::downgrade(inner);
        let mut closed = conn.closed();
        tokio::spawn(async move {
            loop {
                if *closed.borrow() {
                    break;
                }
                if closed.changed().await.is_err() {
                    break;
                }
            }
            if let Some(inner) = weak.upgrade() {
                inner.handle_connection_lost(generation);
            }
        });
    }
}

impl ConnectionInner {
    fn read_live(&self) -> Option<Arc<dyn Connection>> {
        self.current
            .read()
            .expect("connection lock")
            .as_ref()
            .filter(|conn| conn.is_open())
            .cloned()
    }

    fn set_state(&self, state: ConnectionState) {
        *self.state.write().expect("state lock") = state;
    }

    fn handle_connection_lost(&self, generation: u64) {
        {
            let mut current = self.current.write().expect("connection lock");
            if self.generation.load(Ordering::SeqCst) != generation {
                return; // a newer connection already replaced this one
            }
            *current = None;
        }
        self.set_state(ConnectionState::ConnectionLost);
        self.diagnostics.emit(
            DiagnosticEvent::new(DiagnosticEventKind::ConnectionLost)
                .with_detail(self.endpoint.to_string()),
        );

        let callbacks = self.lost_callbacks.lock().expect("callback lock");
        for callback in callbacks.iter() {
            callback();
        }
    }
}

// ============================================================================
// Connection Registry
// ============================================================================

/// Owns at most one managed connection per endpoint URI.
///
/// Concurrent lookups for the same endpoint receive the same managed
/// connection, and the managed connection single-flights the actual
/// transport connect, so no duplicate underlying connections are created.
pub struct ConnectionRegistry {
    providers: Arc<ProviderRegistry>,
    connections: Mutex<HashMap<Endpoint, Arc<ManagedConnection>>>,
    closed: AtomicBool,
    diagnostics: Arc<dyn DiagnosticSink>,
}

impl ConnectionRegistry {
    /// Create a registry resolving transports through the given providers
    pub fn new(providers: Arc<ProviderRegistry>, diagnostics: Arc<dyn DiagnosticSink>) -> Self {
        Self {
            providers,
            connections: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
            diagnostics,
        }
    }

    /// Get the managed connection for an endpoint, creating it if absent.
    ///
    /// Fails with [`BusError::RegistryClosed`] after shutdown and with
    /// [`BusError::UnknownProvider`] when no transport serves the scheme.
    /// A transport resolution failure does not poison the entry; the next
    /// call retries.
    pub fn get_connection(&self, endpoint: &Endpoint) -> Result<Arc<ManagedConnection>, BusError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(BusError::RegistryClosed);
        }

        let mut connections = self.connections.lock().expect("registry lock");
        if let Some(existing) = connections.get(endpoint) {
            return Ok(existing.clone());
        }

        let transport = self.providers.transport_for(endpoint)?;
        let managed = Arc::new(ManagedConnection::new(
            endpoint.clone(),
            transport,
            self.diagnostics.clone(),
        ));
        connections.insert(endpoint.clone(), managed.clone());
        Ok(managed)
    }

    /// Number of endpoints currently tracked
    pub fn tracked_endpoints(&self) -> usize {
        self.connections.lock().expect("registry lock").len()
    }

    /// Close and discard every tracked connection. Subsequent
    /// [`ConnectionRegistry::get_connection`] calls fail with
    /// [`BusError::RegistryClosed`].
    pub async fn shutdown(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let drained: Vec<Arc<ManagedConnection>> = {
            let mut connections = self.connections.lock().expect("registry lock");
            connections.drain().map(|(_, conn)| conn).collect()
        };
        for connection in drained {
            connection.close().await;
        }
    }
}
