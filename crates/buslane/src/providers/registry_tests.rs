//! Tests for the provider registry.

use super::*;

fn endpoint(uri: &str) -> Endpoint {
    Endpoint::parse(uri).unwrap()
}

#[test]
fn test_defaults_register_memory_transport_and_sqlite_store() {
    let registry = ProviderRegistry::with_defaults();

    assert!(registry.contains_transport("mem"));
    assert!(registry.contains_store("sqlite"));
    assert!(!registry.contains_transport("amqp"));
}

#[test]
fn test_transport_resolution_by_endpoint_scheme() {
    let registry = ProviderRegistry::with_defaults();

    let transport = registry.transport_for(&endpoint("mem://local/bus")).unwrap();
    assert_eq!(transport.scheme(), "mem");
}

#[test]
fn test_unknown_scheme_is_rejected() {
    let registry = ProviderRegistry::with_defaults();

    let result = registry.transport_for(&endpoint("amqp://elsewhere"));
    assert!(matches!(result, Err(BusError::UnknownProvider { .. })));

    let result = registry.store_for(&endpoint("postgres://elsewhere"));
    assert!(matches!(result, Err(BusError::UnknownProvider { .. })));
}

#[test]
fn test_registering_a_transport_replaces_the_previous_one() {
    let mut registry = ProviderRegistry::new();
    let first = Arc::new(MemoryTransport::new());
    let second = Arc::new(MemoryTransport::new());

    registry.register_transport(first.clone());
    registry.register_transport(second.clone());

    let resolved = registry.transport_for(&endpoint("mem://local/bus")).unwrap();
    assert!(Arc::ptr_eq(
        &resolved,
        &(second as Arc<dyn Transport>)
    ));
}

#[tokio::test]
async fn test_store_factory_builds_a_store() {
    let registry = ProviderRegistry::with_defaults();

    let store = registry.store_for(&endpoint("sqlite::memory:"));
    assert!(store.is_ok());
}

#[test]
fn test_empty_registry_resolves_nothing() {
    let registry = ProviderRegistry::new();

    assert!(!registry.contains_transport("mem"));
    assert!(!registry.contains_store("sqlite"));
    assert!(registry.transport_for(&endpoint("mem://local/bus")).is_err());
}
