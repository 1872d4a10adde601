//! Tests for the immutable option value types.

use super::*;

// ============================================================================
// Queue Options
// ============================================================================

#[test]
fn test_queue_options_defaults() {
    let options = QueueOptions::default();

    assert_eq!(options.concurrency_limit, 1);
    assert!(!options.auto_acknowledge);
    assert_eq!(options.max_attempts, 10);
    assert_eq!(options.retry_delay, Duration::from_secs(5));
    assert!(options.durable);
}

#[test]
fn test_queue_options_builders() {
    let options = QueueOptions::new()
        .with_concurrency_limit(4)
        .with_auto_acknowledge(true)
        .with_max_attempts(3)
        .with_retry_delay(Duration::ZERO)
        .with_durable(false);

    assert_eq!(options.concurrency_limit, 4);
    assert!(options.auto_acknowledge);
    assert_eq!(options.max_attempts, 3);
    assert_eq!(options.retry_delay, Duration::ZERO);
    assert!(!options.durable);
    assert!(options.validate().is_ok());
}

#[test]
fn test_queue_options_validation_rejects_zero_concurrency() {
    let options = QueueOptions::new().with_concurrency_limit(0);
    assert!(options.validate().is_err());
}

#[test]
fn test_queue_options_validation_rejects_zero_attempts() {
    let options = QueueOptions::new().with_max_attempts(0);
    assert!(options.validate().is_err());
}

// ============================================================================
// Subscribe Options
// ============================================================================

#[test]
fn test_subscribe_options_defaults() {
    let options = SubscribeOptions::default();

    assert_eq!(options.max_bind_attempts, 10);
    assert_eq!(options.bind_retry_delay, Duration::from_secs(5));
    assert_eq!(options.lease_duration, Duration::from_secs(600));
    assert_eq!(options.queue, QueueOptions::default());
}

#[test]
fn test_subscribe_options_validation_rejects_zero_attempts() {
    let options = SubscribeOptions::new().with_max_bind_attempts(0);
    assert!(options.validate().is_err());
}

#[test]
fn test_subscribe_options_validation_checks_queue_options() {
    let options =
        SubscribeOptions::new().with_queue_options(QueueOptions::new().with_max_attempts(0));
    assert!(options.validate().is_err());
}

// ============================================================================
// Pull Retry Policy
// ============================================================================

#[test]
fn test_pull_retry_policy_default_is_five_seconds_fixed() {
    let policy = PullRetryPolicy::default();

    assert_eq!(policy.delay, Duration::from_secs(5));
    assert!(!policy.use_jitter);
    assert_eq!(policy.next_delay(), Duration::from_secs(5));
}

#[test]
fn test_pull_retry_policy_jitter_stays_in_range() {
    let policy = PullRetryPolicy::fixed(Duration::from_secs(4)).with_jitter(0.25);

    for _ in 0..32 {
        let delay = policy.next_delay();
        assert!(delay >= Duration::from_secs(3));
        assert!(delay <= Duration::from_secs(5));
    }
}
