//! Immutable option value types with all defaults resolved at construction.

use crate::error::ValidationError;
use serde::{Deserialize, Serialize};
use std::time::Duration;

// ============================================================================
// Queue Options
// ============================================================================

/// Configuration for a single queue and its durable consumer.
///
/// Constructed once with every effective default resolved, then passed down
/// by value; nothing mutates options after creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueOptions {
    /// Number of deliveries processed concurrently
    pub concurrency_limit: u32,

    /// Acknowledge automatically when the handler returns cleanly without
    /// having called acknowledge itself
    pub auto_acknowledge: bool,

    /// Maximum delivery attempts before a message is abandoned
    pub max_attempts: u32,

    /// Delay between delivery attempts
    pub retry_delay: Duration,

    /// Whether the underlying queue resource survives restarts
    pub durable: bool,
}

impl Default for QueueOptions {
    fn default() -> Self {
        Self {
            concurrency_limit: 1,
            auto_acknowledge: false,
            max_attempts: 10,
            retry_delay: Duration::from_secs(5),
            durable: true,
        }
    }
}

impl QueueOptions {
    /// Create options with defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the concurrency limit (must be at least 1)
    pub fn with_concurrency_limit(mut self, limit: u32) -> Self {
        self.concurrency_limit = limit;
        self
    }

    /// Enable automatic acknowledgment on clean handler return
    pub fn with_auto_acknowledge(mut self, auto: bool) -> Self {
        self.auto_acknowledge = auto;
        self
    }

    /// Set the maximum delivery attempts (must be at least 1)
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    /// Set the delay between delivery attempts
    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    /// Set whether the queue resource is durable
    pub fn with_durable(mut self, durable: bool) -> Self {
        self.durable = durable;
        self
    }

    /// Validate the invariants the consumer relies on
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.concurrency_limit < 1 {
            return Err(ValidationError::OutOfRange {
                field: "concurrency_limit".to_string(),
                message: "must be at least 1".to_string(),
            });
        }
        if self.max_attempts < 1 {
            return Err(ValidationError::OutOfRange {
                field: "max_attempts".to_string(),
                message: "must be at least 1".to_string(),
            });
        }
        Ok(())
    }
}

// ============================================================================
// Subscribe Options
// ============================================================================

/// Configuration for establishing a subscription binding
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscribeOptions {
    /// Maximum attempts to establish the binding before giving up
    pub max_bind_attempts: u32,

    /// Fixed delay between binding attempts
    pub bind_retry_delay: Duration,

    /// How long a subscription lease lasts before requiring renewal
    pub lease_duration: Duration,

    /// Options for the private subscription queue
    pub queue: QueueOptions,
}

impl Default for SubscribeOptions {
    fn default() -> Self {
        Self {
            max_bind_attempts: 10,
            bind_retry_delay: Duration::from_secs(5),
            lease_duration: Duration::from_secs(600),
            queue: QueueOptions::default(),
        }
    }
}

impl SubscribeOptions {
    /// Create options with defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the binding attempt ceiling (must be at least 1)
    pub fn with_max_bind_attempts(mut self, attempts: u32) -> Self {
        self.max_bind_attempts = attempts;
        self
    }

    /// Set the fixed delay between binding attempts
    pub fn with_bind_retry_delay(mut self, delay: Duration) -> Self {
        self.bind_retry_delay = delay;
        self
    }

    /// Set the subscription lease duration
    pub fn with_lease_duration(mut self, duration: Duration) -> Self {
        self.lease_duration = duration;
        self
    }

    /// Set the options for the private subscription queue
    pub fn with_queue_options(mut self, queue: QueueOptions) -> Self {
        self.queue = queue;
        self
    }

    /// Validate the invariants the binder relies on
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.max_bind_attempts < 1 {
            return Err(ValidationError::OutOfRange {
                field: "max_bind_attempts".to_string(),
                message: "must be at least 1".to_string(),
            });
        }
        self.queue.validate()
    }
}

// ============================================================================
// Pull Retry Policy
// ============================================================================

/// Backoff policy for the consumer's pull side.
///
/// Transient transport errors while obtaining a channel or the next delivery
/// are retried indefinitely (until cancellation) with a fixed delay, with
/// optional jitter to avoid synchronized reconnect storms.
#[derive(Debug, Clone)]
pub struct PullRetryPolicy {
    /// Fixed delay between pull retries
    pub delay: Duration,

    /// Whether to add jitter to the delay
    pub use_jitter: bool,

    /// Jitter range as a fraction of the delay
    pub jitter_percent: f64,
}

impl Default for PullRetryPolicy {
    fn default() -> Self {
        Self {
            delay: Duration::from_secs(5),
            use_jitter: false,
            jitter_percent: 0.25,
        }
    }
}

impl PullRetryPolicy {
    /// Create a policy with a fixed delay and no jitter
    pub fn fixed(delay: Duration) -> Self {
        Self {
            delay,
            use_jitter: false,
            jitter_percent: 0.25,
        }
    }

    /// Enable jitter on the delay
    pub fn with_jitter(mut self, percent: f64) -> Self {
        self.use_jitter = true;
        self.jitter_percent = percent.clamp(0.0, 1.0);
        self
    }

    /// Compute the next delay, applying jitter when enabled
    pub fn next_delay(&self) -> Duration {
        if !self.use_jitter {
            return self.delay;
        }

        use rand::Rng;
        let base = self.delay.as_secs_f64();
        let range = base * self.jitter_percent;
        let jitter = rand::thread_rng().gen_range(-range..=range);
        Duration::from_secs_f64((base + jitter).max(0.0))
    }
}

#[cfg(test)]
#[path = "options_tests.rs"]
mod tests;
