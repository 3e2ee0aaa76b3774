//! In-process broker with explicit redelivery, for batch wiring and tests.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use tracing::debug;

use crate::broker::{Broker, BrokerError, Delivery};

#[derive(Debug, Default)]
struct State {
    queue: VecDeque<(Vec<u8>, u32)>,
    in_flight: HashMap<String, (Vec<u8>, u32)>,
    next_tag: u64,
    acked: usize,
    discarded: Vec<Vec<u8>>,
    dead_letters: Vec<(Vec<u8>, String)>,
    published: Vec<(String, Vec<u8>)>,
    failing_publishes: usize,
}

#[derive(Debug, Default)]
pub struct MemoryBroker {
    state: Mutex<State>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        // State is plain data; a panic mid-update cannot leave it unusable.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Enqueue a message for first delivery.
    pub fn push(&self, payload: impl Into<Vec<u8>>) {
        self.state().queue.push_back((payload.into(), 0));
    }

    /// Fail the next `n` publishes with a 503.
    pub fn fail_publishes(&self, n: usize) {
        self.state().failing_publishes = n;
    }

    /// Requeue every unsettled delivery, as a broker does when a consumer's
    /// connection drops.
    pub fn redeliver_unsettled(&self) -> usize {
        let mut s = self.state();
        let pending: Vec<_> = s.in_flight.drain().map(|(_, v)| v).collect();
        let n = pending.len();
        for (payload, count) in pending {
            s.queue.push_back((payload, count + 1));
        }
        n
    }

    pub fn pending(&self) -> usize {
        self.state().queue.len()
    }

    pub fn in_flight(&self) -> usize {
        self.state().in_flight.len()
    }

    pub fn acked(&self) -> usize {
        self.state().acked
    }

    pub fn discarded(&self) -> usize {
        self.state().discarded.len()
    }

    /// Dead-lettered payloads with their reasons.
    pub fn dead_letters(&self) -> Vec<(Vec<u8>, String)> {
        self.state().dead_letters.clone()
    }

    /// Published `(routing_key, payload)` pairs.
    pub fn published(&self) -> Vec<(String, Vec<u8>)> {
        self.state().published.clone()
    }

    fn settle(&self, tag: &str) -> Result<(Vec<u8>, u32), BrokerError> {
        self.state()
            .in_flight
            .remove(tag)
            .ok_or_else(|| BrokerError::UnknownDelivery(tag.to_string()))
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn receive(&self) -> Result<Option<Delivery>, BrokerError> {
        let mut s = self.state();
        let Some((payload, redelivery_count)) = s.queue.pop_front() else {
            return Ok(None);
        };
        s.next_tag += 1;
        let tag = s.next_tag.to_string();
        s.in_flight
            .insert(tag.clone(), (payload.clone(), redelivery_count));
        Ok(Some(Delivery {
            tag,
            redelivery_count,
            payload,
        }))
    }

    async fn ack(&self, tag: &str) -> Result<(), BrokerError> {
        self.settle(tag)?;
        self.state().acked += 1;
        Ok(())
    }

    async fn nack(&self, tag: &str, requeue: bool) -> Result<(), BrokerError> {
        let (payload, count) = self.settle(tag)?;
        let mut s = self.state();
        if requeue {
            s.queue.push_back((payload, count + 1));
        } else {
            s.discarded.push(payload);
        }
        Ok(())
    }

    async fn dead_letter(&self, tag: &str, reason: &str) -> Result<(), BrokerError> {
        let (payload, _) = self.settle(tag)?;
        self.state().dead_letters.push((payload, reason.to_string()));
        Ok(())
    }

    async fn publish(&self, routing_key: &str, payload: &[u8]) -> Result<(), BrokerError> {
        let mut s = self.state();
        if s.failing_publishes > 0 {
            s.failing_publishes -= 1;
            return Err(BrokerError::Server {
                status: 503,
                body: "exchange unavailable".into(),
            });
        }
        debug!(routing_key, bytes = payload.len(), "published");
        s.published.push((routing_key.to_string(), payload.to_vec()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn receive_ack() {
        let b = MemoryBroker::new();
        assert!(b.receive().await.unwrap().is_none());

        b.push("hello");
        let d = b.receive().await.unwrap().unwrap();
        assert_eq!(d.payload, b"hello");
        assert_eq!(d.redelivery_count, 0);
        assert_eq!(b.in_flight(), 1);

        b.ack(&d.tag).await.unwrap();
        assert_eq!(b.acked(), 1);
        assert_eq!(b.in_flight(), 0);
        assert!(matches!(
            b.ack(&d.tag).await,
            Err(BrokerError::UnknownDelivery(_))
        ));
    }

    #[tokio::test]
    async fn nack_requeue_counts_redeliveries() {
        let b = MemoryBroker::new();
        b.push("m");
        let d = b.receive().await.unwrap().unwrap();
        b.nack(&d.tag, true).await.unwrap();

        let d = b.receive().await.unwrap().unwrap();
        assert_eq!(d.redelivery_count, 1);
        b.nack(&d.tag, false).await.unwrap();
        assert_eq!(b.pending(), 0);
        assert_eq!(b.discarded(), 1);
    }

    #[tokio::test]
    async fn dead_letter_keeps_reason() {
        let b = MemoryBroker::new();
        b.push("poison");
        let d = b.receive().await.unwrap().unwrap();
        b.dead_letter(&d.tag, "malformed").await.unwrap();
        assert_eq!(b.dead_letters(), vec![(b"poison".to_vec(), "malformed".to_string())]);
    }

    #[tokio::test]
    async fn unsettled_deliveries_come_back() {
        let b = MemoryBroker::new();
        b.push("a");
        b.receive().await.unwrap().unwrap();
        assert_eq!(b.redeliver_unsettled(), 1);

        let d = b.receive().await.unwrap().unwrap();
        assert_eq!(d.redelivery_count, 1);
    }

    #[tokio::test]
    async fn publish_failure_injection() {
        let b = MemoryBroker::new();
        b.fail_publishes(1);
        assert!(b.publish("k", b"x").await.is_err());
        b.publish("k", b"y").await.unwrap();
        assert_eq!(b.published(), vec![("k".to_string(), b"y".to_vec())]);
    }
}
