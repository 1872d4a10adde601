//! Explicit provider registry mapping URI schemes to transport and store
//! factories.
//!
//! Built once at startup and used read-only afterwards. Registering is a
//! plain function call; resolution is a map lookup keyed by the endpoint
//! scheme.

use crate::connection::Endpoint;
use crate::error::BusError;
use crate::providers::memory::MemoryTransport;
use crate::providers::sqlite::SqliteMessageStore;
use crate::store::MessageStore;
use crate::transport::Transport;
use std::collections::HashMap;
use std::sync::Arc;

#[cfg(test)]
#[path = "registry_tests.rs"]
mod tests;

/// Factory producing a message store for an endpoint
pub type StoreFactory =
    Arc<dyn Fn(&Endpoint) -> Result<Arc<dyn MessageStore>, BusError> + Send + Sync>;

/// Registry mapping URI schemes to their providers.
///
/// Transports double as their own connection factories, so they are
/// registered as instances keyed by the scheme they serve. Stores are
/// registered as factory functions because construction needs the endpoint.
pub struct ProviderRegistry {
    transports: HashMap<String, Arc<dyn Transport>>,
    stores: HashMap<String, StoreFactory>,
}

impl ProviderRegistry {
    /// Create a new, empty registry
    pub fn new() -> Self {
        Self {
            transports: HashMap::new(),
            stores: HashMap::new(),
        }
    }

    /// Create a registry with the built-in providers registered: the
    /// in-memory broker transport (`mem`) and the SQLite store (`sqlite`).
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register_transport(Arc::new(MemoryTransport::new()));
        registry.register_store(
            "sqlite",
            Arc::new(|endpoint: &Endpoint| {
                let store = SqliteMessageStore::connect_lazy(endpoint.as_str())?;
                Ok(Arc::new(store) as Arc<dyn MessageStore>)
            }),
        );
        registry
    }

    /// Register a transport under the scheme it serves.
    ///
    /// If a transport for the same scheme is already registered it is
    /// replaced. Returns `&mut Self` to allow method chaining.
    pub fn register_transport(&mut self, transport: Arc<dyn Transport>) -> &mut Self {
        self.transports
            .insert(transport.scheme().to_string(), transport);
        self
    }

    /// Register a store factory under a scheme
    pub fn register_store(&mut self, scheme: impl Into<String>, factory: StoreFactory) -> &mut Self {
        self.stores.insert(scheme.into(), factory);
        self
    }

    /// Resolve the transport serving an endpoint's scheme
    pub fn transport_for(&self, endpoint: &Endpoint) -> Result<Arc<dyn Transport>, BusError> {
        self.transports
            .get(endpoint.scheme())
            .cloned()
            .ok_or_else(|| BusError::UnknownProvider {
                name: endpoint.scheme().to_string(),
            })
    }

    /// Build a store for an endpoint through its scheme's factory
    pub fn store_for(&self, endpoint: &Endpoint) -> Result<Arc<dyn MessageStore>, BusError> {
        let factory = self
            .stores
            .get(endpoint.scheme())
            .ok_or_else(|| BusError::UnknownProvider {
                name: endpoint.scheme().to_string(),
            })?;
        factory(endpoint)
    }

    /// Check whether a transport is registered for a scheme
    pub fn contains_transport(&self, scheme: &str) -> bool {
        self.transports.contains_key(scheme)
    }

    /// Check whether a store factory is registered for a scheme
    pub fn contains_store(&self, scheme: &str) -> bool {
        self.stores.contains_key(scheme)
    }
}

impl Default for ProviderRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}
