//! Tests for the bus error taxonomy.

use super::*;

// ============================================================================
// Transient Classification
// ============================================================================

#[test]
fn test_configuration_errors_are_not_transient() {
    let already_exists = BusError::QueueAlreadyExists {
        queue_name: "orders".to_string(),
    };
    let not_found = BusError::QueueNotFound {
        queue_name: "orders".to_string(),
    };

    assert!(!already_exists.is_transient());
    assert!(!not_found.is_transient());
    assert!(!BusError::RegistryClosed.is_transient());
    assert!(!BusError::Canceled.is_transient());
}

#[test]
fn test_transport_errors_are_transient() {
    let connection = BusError::ConnectionFailed {
        endpoint: "mem://bus".to_string(),
        message: "refused".to_string(),
    };
    let channel = BusError::ChannelFailed {
        message: "closed".to_string(),
    };

    assert!(connection.is_transient());
    assert!(channel.is_transient());
    assert!(BusError::transport("io").is_transient());
    assert!(BusError::store("locked").is_transient());
}

#[test]
fn test_binding_failed_is_not_retried_further() {
    // The retry budget was already spent inside the binder.
    let err = BusError::BindingFailed {
        topic: "orders".to_string(),
        attempts: 10,
        message: "bind refused".to_string(),
    };

    assert!(!err.is_transient());
    assert!(err.retry_after().is_none());
}

#[test]
fn test_retry_after_only_for_transient_errors() {
    let connection = BusError::ConnectionFailed {
        endpoint: "mem://bus".to_string(),
        message: "refused".to_string(),
    };

    assert_eq!(connection.retry_after(), Some(Duration::from_secs(5)));
    assert_eq!(
        BusError::QueueNotFound {
            queue_name: "q".to_string()
        }
        .retry_after(),
        None
    );
}

// ============================================================================
// Display and Conversion
// ============================================================================

#[test]
fn test_error_display_includes_identifiers() {
    let err = BusError::QueueAlreadyExists {
        queue_name: "orders".to_string(),
    };
    assert!(err.to_string().contains("orders"));

    let err = BusError::BindingFailed {
        topic: "invoices".to_string(),
        attempts: 3,
        message: "refused".to_string(),
    };
    let text = err.to_string();
    assert!(text.contains("invoices"));
    assert!(text.contains('3'));
}

#[test]
fn test_validation_error_converts_into_bus_error() {
    let validation = ValidationError::Required {
        field: "queue_name".to_string(),
    };

    let err: BusError = validation.into();
    assert!(matches!(err, BusError::Validation(_)));
    assert!(!err.is_transient());
}
