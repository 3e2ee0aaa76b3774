//! Broker contract.

use async_trait::async_trait;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum BrokerError {
    #[cfg(feature = "http")]
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("broker returned {status}: {body}")]
    Server { status: u16, body: String },
    #[cfg(feature = "http")]
    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("unknown delivery tag {0}")]
    UnknownDelivery(String),
    #[error("invalid gateway URL {0:?}")]
    InvalidUrl(String),
}

/// One message handed to a consumer. Must be settled exactly once with
/// [`Broker::ack`], [`Broker::nack`] or [`Broker::dead_letter`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub tag: String,
    /// Times this message was delivered before this delivery.
    pub redelivery_count: u32,
    pub payload: Vec<u8>,
}

/// A queue to consume from and an exchange to publish to.
///
/// Unsettled deliveries are redelivered by the broker.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Next message, or `None` when the queue is empty.
    async fn receive(&self) -> Result<Option<Delivery>, BrokerError>;

    async fn ack(&self, tag: &str) -> Result<(), BrokerError>;

    async fn nack(&self, tag: &str, requeue: bool) -> Result<(), BrokerError>;

    /// Move a delivery to the dead-letter queue with a reason.
    async fn dead_letter(&self, tag: &str, reason: &str) -> Result<(), BrokerError>;

    async fn publish(&self, routing_key: &str, payload: &[u8]) -> Result<(), BrokerError>;
}
