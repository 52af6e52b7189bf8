//! Durable queue contract between the producer, the broker and the channel listeners.
//!
//! The broker owns durability, per-queue FIFO order and redelivery of anything that was
//! delivered but never acknowledged. Clients only declare queues, publish, take deliveries and
//! acknowledge them. A consumer never holds more than its prefetch limit of unacknowledged
//! deliveries.

pub mod memory;
pub mod mqtt;

use bytes::Bytes;
use thiserror::Error;

pub type DeliveryTag = u64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub tag: DeliveryTag,
    pub body: Bytes,
    /// The broker handed this message out before and it was never acknowledged.
    pub redelivered: bool,
}

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("connection to broker on host={host} failed: {reason}")]
    Connect { host: String, reason: String },
    #[error("broker connection lost: {0}")]
    Disconnected(String),
    #[error("invalid queue name {0:?}")]
    InvalidQueue(String),
    #[error("queue {0:?} was not declared on this connection")]
    UndeclaredQueue(String),
    #[error("prefetch limit reached: {0} unacknowledged deliveries")]
    PrefetchExhausted(u16),
    #[error("unknown or already acknowledged delivery tag {0}")]
    UnknownDeliveryTag(DeliveryTag),
    #[error("subscription to {0:?} was rejected by the broker")]
    SubscriptionRejected(String),
    /// The client's request channel is closed, so its event loop is gone.
    #[error("broker client error: {0}")]
    Client(#[from] rumqttc::v5::ClientError),
}

impl BrokerError {
    /// Connection-level failures end the process; everything else is scoped to one call.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            BrokerError::Connect { .. }
                | BrokerError::Disconnected(_)
                | BrokerError::SubscriptionRejected(_)
                | BrokerError::Client(_)
        )
    }
}

#[allow(async_fn_in_trait)]
pub trait QueuePublisher {
    /// Idempotent.
    async fn declare_queue(&mut self, queue: &str) -> Result<(), BrokerError>;

    /// Fire-and-forget: a failed publish is reported, never retried.
    async fn publish(&mut self, queue: &str, body: Bytes) -> Result<(), BrokerError>;

    async fn close(self) -> Result<(), BrokerError>;
}

#[allow(async_fn_in_trait)]
pub trait QueueConsumer {
    /// Waits for the next message. Fails with `PrefetchExhausted` while the caller already
    /// holds `prefetch` unacknowledged deliveries.
    async fn next_delivery(&mut self) -> Result<Delivery, BrokerError>;

    /// Acknowledges a delivery exactly once; a second ack of the same tag is an error.
    async fn ack(&mut self, tag: DeliveryTag) -> Result<(), BrokerError>;

    fn in_flight(&self) -> usize;

    /// Releases the connection. Anything still unacknowledged goes back to the broker.
    async fn close(self) -> Result<(), BrokerError>;
}

pub(crate) fn validate_queue_name(queue: &str) -> Result<(), BrokerError> {
    let trimmed = queue.trim();
    if trimmed.is_empty()
        || trimmed != queue
        || queue.contains(&['+', '#', '/'][..])
        || queue.contains(char::is_whitespace)
    {
        return Err(BrokerError::InvalidQueue(queue.to_string()));
    }
    Ok(())
}
