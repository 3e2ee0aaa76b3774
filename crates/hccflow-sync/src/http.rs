//! HTTP client for a queue gateway fronting the message broker.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Url;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};

use crate::broker::{Broker, BrokerError, Delivery};

/// Queue-gateway client.
///
/// Consumes from one queue and publishes to one exchange:
///
/// - `POST {base}/api/queues/{queue}/get` → 204 or a delivery
/// - `POST {base}/api/queues/{queue}/ack/{tag}`
/// - `POST {base}/api/queues/{queue}/nack/{tag}?requeue=…`
/// - `POST {base}/api/queues/{queue}/dead-letter/{tag}`
/// - `POST {base}/api/exchanges/{exchange}/publish`
///
/// Queue, exchange and tag are percent-encoded as single path segments.
pub struct HttpBroker {
    client: reqwest::Client,
    base_url: Url,
    queue: String,
    exchange: String,
}

#[derive(Deserialize)]
struct GatewayDelivery {
    delivery_tag: Value,
    #[serde(default)]
    redelivery_count: u32,
    payload: Value,
}

#[derive(Serialize)]
struct PublishRequest<'a> {
    routing_key: &'a str,
    payload: Value,
}

#[derive(Serialize)]
struct DeadLetterRequest<'a> {
    reason: &'a str,
}

impl HttpBroker {
    /// `base_url` should be like `http://localhost:15680`. Every request,
    /// including `receive`, is bounded by `timeout`.
    pub fn new(
        base_url: &str,
        queue: impl Into<String>,
        exchange: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, BrokerError> {
        let base = Url::parse(base_url.trim_end_matches('/'))
            .map_err(|e| BrokerError::InvalidUrl(format!("{base_url}: {e}")))?;
        if base.cannot_be_a_base() {
            return Err(BrokerError::InvalidUrl(base_url.to_string()));
        }
        let client = reqwest::Client::builder().timeout(timeout).build()?;

        Ok(Self {
            client,
            base_url: base,
            queue: queue.into(),
            exchange: exchange.into(),
        })
    }

    fn url(&self, segments: &[&str]) -> Result<Url, BrokerError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| BrokerError::InvalidUrl(self.base_url.to_string()))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn queue_url(&self, action: &str, tag: Option<&str>) -> Result<Url, BrokerError> {
        match tag {
            Some(tag) => self.url(&["api", "queues", &self.queue, action, tag]),
            None => self.url(&["api", "queues", &self.queue, action]),
        }
    }

    async fn post_ok(&self, req: reqwest::RequestBuilder) -> Result<reqwest::Response, BrokerError> {
        let resp = req.send().await?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(BrokerError::Server {
                status: status.as_u16(),
                body,
            });
        }
        Ok(resp)
    }
}

#[async_trait]
impl Broker for HttpBroker {
    async fn receive(&self) -> Result<Option<Delivery>, BrokerError> {
        let url = self.queue_url("get", None)?;
        let resp = self.post_ok(self.client.post(url)).await?;
        if resp.status() == reqwest::StatusCode::NO_CONTENT {
            return Ok(None);
        }

        let bytes = resp.bytes().await?;
        let delivery = parse_delivery(&bytes)?;
        debug!(tag = %delivery.tag, redeliveries = delivery.redelivery_count, "received delivery");
        Ok(Some(delivery))
    }

    async fn ack(&self, tag: &str) -> Result<(), BrokerError> {
        let url = self.queue_url("ack", Some(tag))?;
        self.post_ok(self.client.post(url)).await?;
        Ok(())
    }

    async fn nack(&self, tag: &str, requeue: bool) -> Result<(), BrokerError> {
        let mut url = self.queue_url("nack", Some(tag))?;
        url.query_pairs_mut()
            .append_pair("requeue", if requeue { "true" } else { "false" });
        self.post_ok(self.client.post(url)).await?;
        Ok(())
    }

    async fn dead_letter(&self, tag: &str, reason: &str) -> Result<(), BrokerError> {
        let url = self.queue_url("dead-letter", Some(tag))?;
        self.post_ok(self.client.post(url).json(&DeadLetterRequest { reason }))
            .await?;
        Ok(())
    }

    async fn publish(&self, routing_key: &str, payload: &[u8]) -> Result<(), BrokerError> {
        let url = self.url(&["api", "exchanges", &self.exchange, "publish"])?;
        let body = PublishRequest {
            routing_key,
            payload: payload_value(payload),
        };

        info!(url = %url, routing_key, "publishing event");
        self.post_ok(self.client.post(url).json(&body)).await?;
        Ok(())
    }
}

/// A gateway delivery. JSON payloads arrive as objects, anything else as a
/// string; tags may be numeric or string.
fn parse_delivery(bytes: &[u8]) -> Result<Delivery, BrokerError> {
    let raw: GatewayDelivery = serde_json::from_slice(bytes)?;
    let tag = match raw.delivery_tag {
        Value::String(s) => s,
        other => other.to_string(),
    };
    let payload = match raw.payload {
        Value::String(s) => s.into_bytes(),
        other => serde_json::to_vec(&other)?,
    };
    Ok(Delivery {
        tag,
        redelivery_count: raw.redelivery_count,
        payload,
    })
}

fn payload_value(payload: &[u8]) -> Value {
    serde_json::from_slice(payload)
        .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(payload).into_owned()))
}
