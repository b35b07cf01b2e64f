//! Message broker seam
//!
//! Every component talks to its peers through a broker with per-key ordered,
//! at-least-once delivery. The trait below is the seam; two implementations
//! exist:
//!
//! - [`memory::InProcessBroker`]: tokio channels, for the all-in-one binary
//!   and tests
//! - [`RedisBroker`](self::redis::RedisBroker): Redis Streams with consumer
//!   groups, for multi-process deployments
//!
//! ## Delivery contract
//!
//! ```text
//! publish(topic, key, bytes) ──► broker ──► Subscription::next() → Delivery
//!                                              │ ack()  = done, drop it
//!                                              └ nack() = redeliver later
//! ```
//!
//! Consumers must be idempotent: a nacked (or never-acked) delivery comes
//! back. Ordering holds per topic for messages sharing an ordering key.

pub mod memory;
pub mod payload;
pub mod redis;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;

use crate::config::BrokerConfig;

/// Topic names (wire contract, shared with the catalog-owner collaborator)
pub mod topics {
    pub const EXECUTE_HEALTH_CHECK: &str = "execute-health-check";
    pub const SERVICE_UP: &str = "service-up";
    pub const SERVICE_DOWN: &str = "service-down";
    pub const SERVICE_CREATED: &str = "service-created";
    pub const SERVICE_MODIFIED: &str = "service-modified";
    pub const SERVICE_REMOVED: &str = "service-removed";
    pub const INCIDENT_START: &str = "incident-start";
    pub const INCIDENT_RESOLVED: &str = "incident-resolved";
    pub const INCIDENT_ACKNOWLEDGE_TIMEOUT: &str = "incident-acknowledge-timeout";
    pub const INCIDENT_UNRESOLVED: &str = "incident-unresolved";
    pub const NOTIFY_ONCALLER: &str = "notify-oncaller";
    pub const ONCALLER_ACKNOWLEDGED: &str = "oncaller-acknowledged";
}

/// Result type alias for broker operations
pub type BrokerResult<T> = Result<T, BrokerError>;

/// Errors that can occur during broker operations
#[derive(Debug)]
pub enum BrokerError {
    /// Could not reach the broker
    ConnectionFailed(String),

    /// Publish was not accepted
    PublishFailed(String),

    /// Subscription could not be established
    SubscribeFailed(String),
}

impl fmt::Display for BrokerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BrokerError::ConnectionFailed(msg) => {
                write!(f, "failed to connect to broker: {}", msg)
            }
            BrokerError::PublishFailed(msg) => write!(f, "publish failed: {}", msg),
            BrokerError::SubscribeFailed(msg) => write!(f, "subscribe failed: {}", msg),
        }
    }
}

impl std::error::Error for BrokerError {}

impl From<::redis::RedisError> for BrokerError {
    fn from(err: ::redis::RedisError) -> Self {
        if err.is_connection_refusal() || err.is_connection_dropped() {
            BrokerError::ConnectionFailed(err.to_string())
        } else {
            BrokerError::PublishFailed(err.to_string())
        }
    }
}

/// Acknowledgment backend for a single delivery
#[async_trait]
pub trait Acker: Send {
    async fn ack(self: Box<Self>);
    async fn nack(self: Box<Self>);
}

/// One message handed to a consumer
///
/// The delivery owns its acknowledgment: exactly one of [`Delivery::ack`] or
/// [`Delivery::nack`] should be called. Dropping a delivery without acking
/// leaves it pending and the broker will hand it out again.
pub struct Delivery {
    /// Ordering key the producer published under
    pub ordering_key: String,

    /// Raw payload bytes (JSON on every platform topic)
    pub payload: Vec<u8>,

    /// 1-based delivery attempt
    pub attempt: u32,

    acker: Box<dyn Acker>,
}

impl Delivery {
    pub fn new(ordering_key: String, payload: Vec<u8>, attempt: u32, acker: Box<dyn Acker>) -> Self {
        Self {
            ordering_key,
            payload,
            attempt,
            acker,
        }
    }

    /// Mark the delivery as handled
    pub async fn ack(self) {
        self.acker.ack().await;
    }

    /// Hand the delivery back for redelivery
    pub async fn nack(self) {
        self.acker.nack().await;
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("ordering_key", &self.ordering_key)
            .field("payload_len", &self.payload.len())
            .field("attempt", &self.attempt)
            .finish()
    }
}

/// A consumer-group subscription to one topic
#[async_trait]
pub trait Subscription: Send {
    /// Receive the next delivery. `None` means the subscription ended
    /// (broker shut down or the group was taken over).
    async fn next(&mut self) -> Option<Delivery>;
}

/// Trait for message broker backends
///
/// Implementations must be `Send + Sync`; clients are process-wide singletons
/// established at startup.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Publish `payload` onto `topic` under `ordering_key`
    async fn publish(&self, topic: &str, ordering_key: &str, payload: &[u8]) -> BrokerResult<()>;

    /// Join `group` on `topic`; messages are load-shared within a group and
    /// fanned out across groups
    async fn subscribe(&self, topic: &str, group: &str) -> BrokerResult<Box<dyn Subscription>>;
}

/// Build a broker client from configuration
pub async fn connect(config: &BrokerConfig) -> anyhow::Result<Arc<dyn Broker>> {
    match config {
        BrokerConfig::Memory => Ok(Arc::new(memory::InProcessBroker::new())),
        BrokerConfig::Redis { url } => {
            let broker = self::redis::RedisBroker::connect(url).await?;
            Ok(Arc::new(broker))
        }
    }
}
